//! HostConfig - ホスト設定（TOML）
//!
//! どのフィールドも省略可能。省略されたものはデフォルト値になる。
//!
//! ```toml
//! root = "./functions"
//! listen = "127.0.0.1:8080"
//! log_capacity = 500
//! http_timeout_ms = 30000
//!
//! [interpreters]
//! sh = "sh"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FnHostError, Result};

pub const NOT_FOUND_MESSAGE: &str = "Error! Function not found!";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Deployment root; every subfolder is one function.
    pub root: PathBuf,
    pub descriptor_file: String,
    /// Entry file used when a descriptor has no `function.entry`.
    pub default_entry: String,
    pub listen: String,
    /// Per-function log size. 0 = unbounded.
    pub log_capacity: usize,
    pub worker_shutdown_grace_ms: u64,
    pub http_timeout_ms: Option<u64>,
    pub not_found_message: String,
    /// Entry file extension → interpreter program.
    pub interpreters: BTreeMap<String, String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./functions"),
            descriptor_file: "fnhost.json".to_string(),
            default_entry: "index".to_string(),
            listen: "0.0.0.0:8080".to_string(),
            log_capacity: 10_000,
            worker_shutdown_grace_ms: 2_000,
            http_timeout_ms: None,
            not_found_message: NOT_FOUND_MESSAGE.to_string(),
            interpreters: BTreeMap::new(),
        }
    }
}

impl HostConfig {
    /// `path` is only used in error messages.
    pub fn from_toml_str(path: &Path, text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| FnHostError::HostConfig {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate(path)?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FnHostError::io(path, e))?;
        Self::from_toml_str(path, &text)
    }

    pub fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |message: &str| FnHostError::HostConfig {
            path: path.to_path_buf(),
            message: message.to_string(),
        };
        if self.descriptor_file.trim().is_empty() {
            return Err(invalid("descriptor_file must not be empty"));
        }
        if self.default_entry.trim().is_empty() {
            return Err(invalid("default_entry must not be empty"));
        }
        if self.http_timeout_ms == Some(0) {
            return Err(invalid("http_timeout_ms must be positive; omit it for no timeout"));
        }
        Ok(())
    }

    pub fn worker_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.worker_shutdown_grace_ms)
    }

    pub fn http_timeout(&self) -> Option<Duration> {
        self.http_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(text: &str) -> Result<HostConfig> {
        HostConfig::from_toml_str(Path::new("fnhost.toml"), text)
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.not_found_message, "Error! Function not found!");
        assert_eq!(config.http_timeout(), None);
        assert_eq!(config.worker_shutdown_grace(), Duration::from_secs(2));
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let config = parse(
            r#"
            root = "/srv/functions"
            log_capacity = 0
            http_timeout_ms = 1500

            [interpreters]
            sh = "sh"
            "#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/functions"));
        assert_eq!(config.log_capacity, 0);
        assert_eq!(config.http_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.interpreters.get("sh").map(String::as_str), Some("sh"));
        assert_eq!(config.descriptor_file, "fnhost.json");
    }

    #[rstest]
    #[case("descriptor_file = \"\"")]
    #[case("default_entry = \" \"")]
    #[case("http_timeout_ms = 0")]
    #[case("log_capacity = \"many\"")]
    #[case("unknown_field = 1")]
    fn invalid_values_are_rejected(#[case] text: &str) {
        assert!(matches!(parse(text), Err(FnHostError::HostConfig { .. })));
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fnhost.toml");
        std::fs::write(&path, "listen = \"127.0.0.1:9000\"").unwrap();
        let config = HostConfig::load(&path).await.unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");

        let missing = HostConfig::load(&dir.path().join("nope.toml")).await;
        assert!(matches!(missing, Err(FnHostError::Io { .. })));
    }
}
