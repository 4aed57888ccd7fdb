//! FunctionHost - 公開 API
//!
//! Registry / LogStore / TriggerBus / Loader / Dispatcher をまとめて所有する
//! コンテキストオブジェクト。clone は安い（中身は `Arc`）。
//! グローバル状態はないので、テストではホストを何個でも作れる。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinSet;

use super::{Dispatcher, Loader, LogStore, Registry, TriggerBus};
use crate::config::HostConfig;
use crate::domain::{DispatchResponse, Event, FunctionSummary};
use crate::error::{FnHostError, Result};

#[derive(Clone)]
pub struct FunctionHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    config: HostConfig,
    registry: Arc<Registry>,
    logs: Arc<LogStore>,
    bus: Arc<TriggerBus>,
    loader: Loader,
    dispatcher: Dispatcher,
}

impl FunctionHost {
    pub(crate) fn from_parts(
        config: HostConfig,
        registry: Arc<Registry>,
        logs: Arc<LogStore>,
        bus: Arc<TriggerBus>,
        loader: Loader,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            inner: Arc::new(HostInner {
                config,
                registry,
                logs,
                bus,
                loader,
                dispatcher,
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Load `root/folder_id` and install it. A blank id does nothing.
    pub async fn register_function(&self, root: &Path, folder_id: &str) -> Result<()> {
        self.inner.loader.register(root, folder_id).await.map(|_| ())
    }

    /// Register every subfolder of the configured root, concurrently.
    /// One folder's failure does not affect the others.
    pub async fn load_all(&self) -> Result<Vec<(String, Result<()>)>> {
        let root = self.inner.config.root.clone();
        let folders = subfolders(&root).await?;
        tracing::info!(root = %root.display(), count = folders.len(), "loading functions");

        let mut set = JoinSet::new();
        for folder in folders {
            let host = self.clone();
            let root = root.clone();
            set.spawn(async move {
                let result = host.register_function(&root, &folder).await;
                (folder, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (folder, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(error = %e, "registration task failed");
                    continue;
                }
            };
            if let Err(err) = &result {
                tracing::warn!(folder = %folder, error = %err, "function not registered");
            }
            results.push((folder, result));
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    /// Remove the function called `name`: teardown, then delete its folder.
    /// Returns `false` when no such function is registered.
    pub async fn remove_function(&self, name: &str) -> Result<bool> {
        let Some(record) = self.inner.registry.find_by_name(name) else {
            return Ok(false);
        };
        let Some(record) = self.inner.loader.unregister(&record.route).await else {
            // removed concurrently
            return Ok(false);
        };
        self.inner.logs.detach(&record.route, record.log());

        match tokio::fs::remove_dir_all(&record.folder).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(folder = %record.folder.display(), "function folder already gone");
            }
            Err(e) => return Err(FnHostError::io(&record.folder, e)),
        }
        Ok(true)
    }

    /// `formatter` applied to every live function, sorted by route.
    pub fn list_functions<T>(&self, formatter: impl Fn(FunctionSummary) -> T) -> Vec<T> {
        self.inner
            .registry
            .list()
            .iter()
            .map(|record| formatter(record.summary()))
            .collect()
    }

    /// Formatted log lines of the function called `name`, oldest first.
    pub fn get_logs_for_function(&self, name: &str) -> Option<Vec<String>> {
        let record = self.inner.registry.find_by_name(name)?;
        self.inner.logs.get(&record.route).map(|log| log.lines())
    }

    pub async fn dispatch(&self, event: Event) -> DispatchResponse {
        self.inner.dispatcher.dispatch(event).await
    }

    /// Publish `payload` on `topic`. Returns how many listeners were called.
    pub fn emit(&self, topic: &str, payload: Value) -> usize {
        self.inner.bus.emit(topic, &payload)
    }

    /// Tear every function down. Logs and folders stay.
    pub async fn shutdown(&self) {
        let records = self.inner.registry.clear().await;
        tracing::info!(count = records.len(), "host stopped");
    }
}

async fn subfolders(root: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|e| FnHostError::io(root, e))?;
    let mut folders = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FnHostError::io(root, e))?
    {
        let path: PathBuf = entry.path();
        let is_dir = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if is_dir && let Some(name) = entry.file_name().to_str() {
            folders.push(name.to_string());
        }
    }
    folders.sort();
    Ok(folders)
}
