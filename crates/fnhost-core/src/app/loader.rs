//! Loader - フォルダから record を作り、kind ごとに起動して Registry に入れる
//!
//! # 実装（register）
//! 1. 空白だけの folder id は何もしない
//! 2. descriptor と関数コードを読む（ここで失敗しても既存の record には触れない）
//! 3. route lock を取る（同じ route への登録は直列化、後勝ち）
//! 4. 既存の record を teardown して外す
//! 5. 新しい record を kind ごとに起動
//!    - http / custom: 何もしない
//!    - worker: WorkerHost で実行単位を起動、teardown = terminate
//!    - trigger: bus に listener を登録してから初期化を 1 回呼ぶ、
//!      teardown = listener 解除 → 初期化が返した teardown
//! 6. ログを route に紐付け、Registry に入れる

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::Value;

use super::dispatcher::invoke_guarded;
use super::{Emitter, Listener, ListenerId, LogStore, Registry, TriggerBus, WorkerHost};
use crate::domain::{Descriptor, Event, FunctionKind, FunctionRecord};
use crate::error::{FnHostError, Result};
use crate::ports::{CodeLoader, FnTeardown, FunctionCode, IdGenerator, Teardown};

pub struct Loader {
    registry: Arc<Registry>,
    logs: Arc<LogStore>,
    bus: Arc<TriggerBus>,
    workers: WorkerHost,
    code_loader: Arc<dyn CodeLoader>,
    ids: Arc<dyn IdGenerator>,
    descriptor_file: String,
    route_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Loader {
    pub fn new(
        registry: Arc<Registry>,
        logs: Arc<LogStore>,
        bus: Arc<TriggerBus>,
        workers: WorkerHost,
        code_loader: Arc<dyn CodeLoader>,
        ids: Arc<dyn IdGenerator>,
        descriptor_file: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            logs,
            bus,
            workers,
            code_loader,
            ids,
            descriptor_file: descriptor_file.into(),
            route_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Load `root/folder_id` and install it, replacing the record at its route.
    ///
    /// Returns `None` for a blank folder id.
    pub async fn register(&self, root: &Path, folder_id: &str) -> Result<Option<Arc<FunctionRecord>>> {
        if folder_id.trim().is_empty() {
            return Ok(None);
        }
        let folder = root.join(folder_id);
        let descriptor = Descriptor::read(&folder, &self.descriptor_file).await?;
        let code = self
            .code_loader
            .load(&folder, &descriptor)
            .await?
            .ok_or_else(|| FnHostError::configuration(&folder, "no loadable entry point"))?;

        let route = descriptor.route.clone();
        let lock = self.route_lock(&route);
        let installed = {
            let _guard = lock.lock().await;
            self.install(descriptor, folder, code).await
        };
        self.release_route_lock(&route, lock);
        installed.map(Some)
    }

    /// Tear down and forget the record at `route`. Its log stays readable
    /// until the route is detached from the [`LogStore`].
    pub async fn unregister(&self, route: &str) -> Option<Arc<FunctionRecord>> {
        let lock = self.route_lock(route);
        let removed = {
            let _guard = lock.lock().await;
            self.registry.remove(route).await
        };
        self.release_route_lock(route, lock);
        let record = removed?;
        tracing::info!(name = %record.name, route = %route, id = %record.id, "function removed");
        Some(record)
    }

    /// Steps 4 to 6 of `register`; the caller holds the route lock.
    async fn install(
        &self,
        descriptor: Descriptor,
        folder: PathBuf,
        code: Arc<dyn FunctionCode>,
    ) -> Result<Arc<FunctionRecord>> {
        let route = descriptor.route.clone();
        let replaced = self.registry.remove(&route).await;
        if let Some(old) = &replaced {
            tracing::info!(name = %old.name, route = %route, id = %old.id, "replacing function");
        }

        let record = Arc::new(FunctionRecord::new(
            self.ids.generate_record_id(),
            descriptor,
            folder,
            code,
            self.logs.create(),
        ));
        if let Err(err) = self.activate(&record).await {
            tracing::warn!(name = %record.name, route = %route, error = %err, "activation failed");
            record.teardown().await;
            // the route is empty now; its previous log must not outlive it
            if let Some(old) = &replaced {
                self.logs.detach(&route, old.log());
            }
            return Err(err);
        }

        self.logs.attach(&route, record.log().clone());
        self.registry.upsert(record.clone()).await;
        tracing::info!(
            name = %record.name,
            route = %route,
            kind = %record.kind,
            id = %record.id,
            "function registered"
        );
        Ok(record)
    }

    async fn activate(&self, record: &Arc<FunctionRecord>) -> Result<()> {
        match record.kind {
            FunctionKind::Http | FunctionKind::Custom => Ok(()),
            FunctionKind::Worker => {
                let handle = Arc::new(self.workers.spawn(record.code.as_ref(), record.context())?);
                record.attach_worker(handle.clone());
                record.set_teardown(FnTeardown::boxed(move || async move {
                    handle.terminate().await;
                    Ok(())
                }));
                Ok(())
            }
            FunctionKind::Trigger => self.activate_trigger(record).await,
        }
    }

    async fn activate_trigger(&self, record: &Arc<FunctionRecord>) -> Result<()> {
        let topic = record.topic().unwrap_or(&record.name).to_string();
        let listener_id = self
            .bus
            .subscribe(&topic, fan_out(Arc::downgrade(&self.registry), topic.clone()));

        let emitter = Emitter::new(topic.clone(), self.bus.clone());
        let inner = match record.code.start_trigger(emitter, record.context()).await {
            Ok(inner) => inner,
            Err(err) => {
                self.bus.unsubscribe(&topic, listener_id);
                return Err(err);
            }
        };

        record.set_teardown(Box::new(TriggerTeardown {
            bus: self.bus.clone(),
            topic,
            listener_id,
            inner,
        }));
        Ok(())
    }

    fn route_lock(&self, route: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.route_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(route.to_string())
            .or_default()
            .clone()
    }

    /// Drop the map entry once nobody else holds or waits for the lock.
    fn release_route_lock(&self, route: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.route_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // one reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(route);
        }
    }

    #[cfg(test)]
    fn route_lock_count(&self) -> usize {
        self.route_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Listener that delivers each emission of `topic` to every subscribed record.
/// Deliveries run on their own tasks; the emitting call does not wait.
fn fan_out(registry: Weak<Registry>, topic: String) -> Listener {
    let runtime = tokio::runtime::Handle::current();
    Arc::new(move |payload: &Value| {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        for subscriber in registry.subscribers_of(&topic) {
            let payload = payload.clone();
            let topic = topic.clone();
            runtime.spawn(async move {
                let ctx = subscriber.context();
                let log = ctx.log.clone();
                let event = Event::trigger(payload);
                if let Err(err) = invoke_guarded(subscriber.code.clone(), event, ctx, None).await {
                    tracing::warn!(
                        name = %subscriber.name,
                        topic = %topic,
                        error = %err,
                        "trigger delivery failed"
                    );
                    log.error(&err);
                }
            });
        }
    })
}

struct TriggerTeardown {
    bus: Arc<TriggerBus>,
    topic: String,
    listener_id: ListenerId,
    inner: Option<Box<dyn Teardown>>,
}

#[async_trait]
impl Teardown for TriggerTeardown {
    async fn run(self: Box<Self>) -> std::result::Result<(), String> {
        let this = *self;
        this.bus.unsubscribe(&this.topic, this.listener_id);
        match this.inner {
            Some(inner) => inner.run().await,
            None => Ok(()),
        }
    }
}
