//! Registry - route → 現在の FunctionRecord
//!
//! # 不変条件
//! - 1 つの route には高々 1 つの record
//! - 置き換え・削除された record は、map から外れる前に teardown される
//!
//! map の lock は teardown の間は保持しない。同じ route への登録の直列化は
//! Loader 側の route lock が受け持つ。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::FunctionRecord;

#[derive(Debug, Default)]
pub struct Registry {
    records: RwLock<HashMap<String, Arc<FunctionRecord>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, route: &str) -> Option<Arc<FunctionRecord>> {
        self.read().get(route).cloned()
    }

    /// Record named `name`. When several routes share the name, the
    /// lowest route wins.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<FunctionRecord>> {
        self.read()
            .values()
            .filter(|r| r.name == name)
            .min_by(|a, b| a.route.cmp(&b.route))
            .cloned()
    }

    /// All records, sorted by route.
    pub fn list(&self) -> Vec<Arc<FunctionRecord>> {
        let mut records: Vec<_> = self.read().values().cloned().collect();
        records.sort_by(|a, b| a.route.cmp(&b.route));
        records
    }

    /// Records subscribed to `topic`, sorted by route.
    pub fn subscribers_of(&self, topic: &str) -> Vec<Arc<FunctionRecord>> {
        let mut records: Vec<_> = self
            .read()
            .values()
            .filter(|r| r.subscribes(topic))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.route.cmp(&b.route));
        records
    }

    /// Tear down whatever holds `record`'s route, then insert `record`.
    /// Returns the replaced record.
    pub async fn upsert(&self, record: Arc<FunctionRecord>) -> Option<Arc<FunctionRecord>> {
        if let Some(old) = self.get(&record.route)
            && old.id != record.id
        {
            old.teardown().await;
        }
        self.write().insert(record.route.clone(), record)
    }

    /// Tear down and forget the record at `route`.
    pub async fn remove(&self, route: &str) -> Option<Arc<FunctionRecord>> {
        let record = self.get(route)?;
        record.teardown().await;
        let mut records = self.write();
        // a newer generation may have taken the route during teardown
        if records.get(route).is_some_and(|current| current.id == record.id) {
            records.remove(route);
        }
        Some(record)
    }

    /// Drain every record and tear each one down.
    pub async fn clear(&self) -> Vec<Arc<FunctionRecord>> {
        let records: Vec<_> = self.write().drain().map(|(_, r)| r).collect();
        for record in &records {
            record.teardown().await;
        }
        records
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<FunctionRecord>>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<FunctionRecord>>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}
