//! Record identifiers.
//!
//! # ULID ベースの ID
//! 同じ route に対して hot-swap するたびに新しい世代の record ができる。
//! route だけでは世代を区別できないので、record ごとに ULID を振る。
//!
//! - **時刻でソート可能**: 後から登録された record ほど大きい
//! - **調整不要**: ロックなしで生成できる

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identity of one generation of a function record.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(Ulid);

impl RecordId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for RecordId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_has_prefix() {
        let id = RecordId::from_ulid(Ulid::new());
        assert!(id.to_string().starts_with("fn-"));
    }

    #[test]
    fn later_ids_sort_after_earlier_ones() {
        let id1 = RecordId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = RecordId::from_ulid(Ulid::new());
        assert!(id1 < id2);
    }

    #[test]
    fn ids_can_be_serialized() {
        let id = RecordId::from_ulid(Ulid::new());
        let serialized = serde_json::to_string(&id).unwrap();
        let deserialized: RecordId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(id, deserialized);
    }
}
