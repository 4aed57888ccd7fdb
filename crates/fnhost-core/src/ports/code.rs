//! FunctionCode port - 読み込まれた関数コード
//!
//! 1 つの関数フォルダから読み込まれたコードは、kind に応じて次のどれかとして呼ばれる。
//! - `handle`: HTTP リクエスト / trigger からの配送
//! - `start_trigger`: trigger の初期化（emit 能力を受け取り、teardown を返せる）
//! - `launch_worker`: worker を隔離された実行単位で起動
//!
//! 対応していない入口はデフォルト実装が `Unsupported` を返す。

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use crate::app::{Emitter, Logger, WorkerPort};
use crate::domain::{Event, FunctionKind, Reply};
use crate::error::{FnHostError, Result};

/// Per-invocation context handed to function code.
#[derive(Debug, Clone)]
pub struct Context {
    pub name: String,
    pub route: String,
    pub kind: FunctionKind,
    /// Opaque descriptor metadata.
    pub config: Value,
    pub log: Logger,
    /// Response sink; only meaningful for HTTP dispatch.
    pub reply: Reply,
}

/// Loaded function code.
#[async_trait]
pub trait FunctionCode: Send + Sync {
    /// Handle an HTTP request or a trigger delivery.
    ///
    /// `Ok(None)` means no body is sent.
    async fn handle(&self, _event: Event, ctx: Context) -> Result<Option<Value>> {
        Err(unsupported(&ctx, "http handler"))
    }

    /// Initialize a trigger. Runs once per activation.
    async fn start_trigger(
        &self,
        _emitter: Emitter,
        ctx: Context,
    ) -> Result<Option<Box<dyn Teardown>>> {
        Err(unsupported(&ctx, "trigger initializer"))
    }

    /// Start an isolated execution unit for a worker.
    ///
    /// Everything the unit reports goes through `port`; the unit must send
    /// `WorkerMessage::Exit` when it stops.
    fn launch_worker(&self, _port: WorkerPort, ctx: Context) -> Result<Box<dyn ExecutionUnit>> {
        Err(unsupported(&ctx, "worker entry point"))
    }
}

pub(crate) fn unsupported(ctx: &Context, entry: &'static str) -> FnHostError {
    FnHostError::Unsupported {
        name: ctx.name.clone(),
        kind: ctx.kind,
        entry,
    }
}

/// Cleanup procedure returned by a trigger initializer.
#[async_trait]
pub trait Teardown: Send {
    async fn run(self: Box<Self>) -> std::result::Result<(), String>;
}

/// Adapts an async closure into a [`Teardown`].
pub struct FnTeardown<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnTeardown<F, Fut>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }

    pub fn boxed(f: F) -> Box<dyn Teardown> {
        Box::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> Teardown for FnTeardown<F, Fut>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    async fn run(self: Box<Self>) -> std::result::Result<(), String> {
        let this = *self;
        (this.f)().await
    }
}

/// Handle to an isolated execution unit hosting one worker.
#[async_trait]
pub trait ExecutionUnit: Send {
    /// Ask the unit to stop. Calling it again is a no-op.
    async fn terminate(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Nothing;

    #[async_trait]
    impl FunctionCode for Nothing {}

    fn ctx(kind: FunctionKind) -> Context {
        Context {
            name: "nothing".into(),
            route: "/nothing".into(),
            kind,
            config: Value::Null,
            log: Logger::detached(),
            reply: Reply::new(),
        }
    }

    #[tokio::test]
    async fn default_entries_are_unsupported() {
        let err = Nothing
            .handle(Event::default(), ctx(FunctionKind::Http))
            .await
            .unwrap_err();
        assert!(matches!(err, FnHostError::Unsupported { entry: "http handler", .. }));

        let err = Nothing
            .launch_worker(WorkerPort::detached(), ctx(FunctionKind::Worker))
            .err()
            .unwrap();
        assert!(matches!(err, FnHostError::Unsupported { kind: FunctionKind::Worker, .. }));
    }

    #[tokio::test]
    async fn fn_teardown_runs_closure() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let teardown = FnTeardown::boxed(move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        teardown.run().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
