//! FunctionRecord - 登録済み関数 1 世代分
//!
//! # 設計
//! - 1 つの route を持つのは常に 1 record だけ（Registry が保証）
//! - record は自分専用の `FunctionLog` を持つ。teardown でログは close され、
//!   古い世代からの遅れたメッセージが新しい世代のログに混ざることはない
//! - teardown は冪等。trigger の cleanup 失敗はログに残すだけで外には投げない

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::Serialize;
use serde_json::Value;

use super::{Descriptor, FunctionKind, RecordId, Reply};
use crate::app::{FunctionLog, Logger, WorkerHandle};
use crate::error::FnHostError;
use crate::ports::{Context, FunctionCode, Teardown};

/// Listing view of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSummary {
    pub name: String,
    pub route: String,
    #[serde(rename = "type")]
    pub kind: FunctionKind,
    pub config: Value,
}

pub struct FunctionRecord {
    pub id: RecordId,
    pub name: String,
    pub route: String,
    pub kind: FunctionKind,
    /// Trigger name whose emissions are delivered to this record.
    pub subscribes_to: Option<String>,
    pub config: Value,
    pub folder: PathBuf,
    pub code: Arc<dyn FunctionCode>,
    log: Arc<FunctionLog>,
    teardown: Mutex<Option<Box<dyn Teardown>>>,
    worker: OnceLock<Arc<WorkerHandle>>,
}

impl fmt::Debug for FunctionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("route", &self.route)
            .field("kind", &self.kind)
            .field("subscribes_to", &self.subscribes_to)
            .field("folder", &self.folder)
            .finish()
    }
}

impl FunctionRecord {
    pub fn new(
        id: RecordId,
        descriptor: Descriptor,
        folder: PathBuf,
        code: Arc<dyn FunctionCode>,
        log: Arc<FunctionLog>,
    ) -> Self {
        Self {
            id,
            name: descriptor.name,
            route: descriptor.route,
            kind: descriptor.kind,
            subscribes_to: descriptor.subscribes_to,
            config: descriptor.raw,
            folder,
            code,
            log,
            teardown: Mutex::new(None),
            worker: OnceLock::new(),
        }
    }

    pub fn log(&self) -> &Arc<FunctionLog> {
        &self.log
    }

    pub fn logger(&self) -> Logger {
        Logger::new(self.log.clone())
    }

    /// Fresh invocation context with an empty reply.
    pub fn context(&self) -> Context {
        Context {
            name: self.name.clone(),
            route: self.route.clone(),
            kind: self.kind,
            config: self.config.clone(),
            log: self.logger(),
            reply: Reply::new(),
        }
    }

    /// Topic this record emits on, for triggers.
    pub fn topic(&self) -> Option<&str> {
        match self.kind {
            FunctionKind::Trigger => Some(&self.name),
            _ => None,
        }
    }

    /// Whether this record receives emissions of `topic`.
    pub fn subscribes(&self, topic: &str) -> bool {
        self.subscribes_to.as_deref() == Some(topic)
    }

    pub fn set_teardown(&self, teardown: Box<dyn Teardown>) {
        *self.teardown.lock().unwrap_or_else(PoisonError::into_inner) = Some(teardown);
    }

    /// Returns `false` when a worker was already attached.
    pub fn attach_worker(&self, handle: Arc<WorkerHandle>) -> bool {
        self.worker.set(handle).is_ok()
    }

    pub fn worker(&self) -> Option<&Arc<WorkerHandle>> {
        self.worker.get()
    }

    pub fn is_torn_down(&self) -> bool {
        self.log.is_closed()
    }

    /// Release everything this record activated, then close its log.
    /// Idempotent.
    pub async fn teardown(&self) {
        let teardown = self
            .teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(teardown) = teardown
            && let Err(message) = teardown.run().await
        {
            let err = FnHostError::TriggerTeardownFault {
                name: self.name.clone(),
                message,
            };
            tracing::warn!(route = %self.route, error = %err, "teardown failed");
            self.logger().error(&err);
        }
        self.log.close();
    }

    pub fn summary(&self) -> FunctionSummary {
        FunctionSummary {
            name: self.name.clone(),
            route: self.route.clone(),
            kind: self.kind,
            config: self.config.clone(),
        }
    }
}
