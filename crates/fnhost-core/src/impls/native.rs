//! Native functions: code compiled into the host binary.
//!
//! Workers run on a dedicated OS thread with their own current-thread
//! runtime, so a blocking or panicking worker cannot stall the host's
//! executor. Only [`WorkerPort`] messages leave the thread.
//!
//! Stopping is cooperative. `terminate()` wakes the body at its next
//! `.await`, and the host closes the port so `port.log()` returns `false`.
//! A body that does neither keeps its thread until it returns; the exit
//! code of a stopped unit is always 1.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::app::{Emitter, WorkerPort};
use crate::domain::{Descriptor, Event};
use crate::error::{FnHostError, Result};
use crate::ports::code::unsupported;
use crate::ports::{CodeLoader, Context, ExecutionUnit, FunctionCode, Teardown};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

type HandlerFn =
    Arc<dyn Fn(Event, Context) -> BoxFuture<std::result::Result<Option<Value>, String>> + Send + Sync>;
type TriggerFn = Arc<
    dyn Fn(Emitter, Context) -> BoxFuture<std::result::Result<Option<Box<dyn Teardown>>, String>>
        + Send
        + Sync,
>;
type WorkerFn = Arc<dyn Fn(WorkerPort) -> LocalBoxFuture<std::result::Result<(), String>> + Send + Sync>;

/// Function built from closures.
///
/// ```ignore
/// let hello = NativeFunction::handler(|_event, _ctx| async move { Ok(Some(json!("hello world"))) });
/// ```
#[derive(Clone, Default)]
pub struct NativeFunction {
    handler: Option<HandlerFn>,
    trigger: Option<TriggerFn>,
    worker: Option<WorkerFn>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("handler", &self.handler.is_some())
            .field("trigger", &self.trigger.is_some())
            .field("worker", &self.worker.is_some())
            .finish()
    }
}

impl NativeFunction {
    pub fn handler<F, Fut>(f: F) -> Self
    where
        F: Fn(Event, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<Value>, String>> + Send + 'static,
    {
        Self::default().with_handler(f)
    }

    pub fn trigger<F, Fut>(f: F) -> Self
    where
        F: Fn(Emitter, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<Box<dyn Teardown>>, String>> + Send + 'static,
    {
        Self::default().with_trigger(f)
    }

    /// The future runs on the worker's own thread and need not be `Send`.
    pub fn worker<F, Fut>(f: F) -> Self
    where
        F: Fn(WorkerPort) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + 'static,
    {
        Self::default().with_worker(f)
    }

    pub fn with_handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Event, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<Value>, String>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |event, ctx| Box::pin(f(event, ctx))));
        self
    }

    pub fn with_trigger<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Emitter, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<Box<dyn Teardown>>, String>> + Send + 'static,
    {
        self.trigger = Some(Arc::new(move |emitter, ctx| Box::pin(f(emitter, ctx))));
        self
    }

    pub fn with_worker<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WorkerPort) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + 'static,
    {
        self.worker = Some(Arc::new(move |port| Box::pin(f(port))));
        self
    }
}

#[async_trait]
impl FunctionCode for NativeFunction {
    async fn handle(&self, event: Event, ctx: Context) -> Result<Option<Value>> {
        let Some(handler) = self.handler.clone() else {
            return Err(unsupported(&ctx, "http handler"));
        };
        let name = ctx.name.clone();
        handler(event, ctx)
            .await
            .map_err(|message| FnHostError::fault(&name, message))
    }

    async fn start_trigger(
        &self,
        emitter: Emitter,
        ctx: Context,
    ) -> Result<Option<Box<dyn Teardown>>> {
        let Some(trigger) = self.trigger.clone() else {
            return Err(unsupported(&ctx, "trigger initializer"));
        };
        let name = ctx.name.clone();
        trigger(emitter, ctx)
            .await
            .map_err(|message| FnHostError::fault(&name, message))
    }

    fn launch_worker(&self, port: WorkerPort, ctx: Context) -> Result<Box<dyn ExecutionUnit>> {
        let Some(body) = self.worker.clone() else {
            return Err(unsupported(&ctx, "worker entry point"));
        };
        Ok(Box::new(ThreadUnit::spawn(&ctx.name, port, body)?))
    }
}

/// Worker execution unit on a dedicated thread.
pub struct ThreadUnit {
    shutdown: Option<oneshot::Sender<()>>,
    stopped: Arc<AtomicBool>,
}

impl ThreadUnit {
    fn spawn(name: &str, port: WorkerPort, body: WorkerFn) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        std::thread::Builder::new()
            .name(format!("fnhost-worker-{name}"))
            .spawn(move || run_unit(port, body, shutdown_rx, flag))
            .map_err(|e| FnHostError::WorkerFault {
                name: name.to_string(),
                message: format!("cannot spawn worker thread: {e}"),
            })?;
        Ok(Self {
            shutdown: Some(shutdown_tx),
            stopped,
        })
    }
}

#[async_trait]
impl ExecutionUnit for ThreadUnit {
    async fn terminate(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn run_unit(
    port: WorkerPort,
    body: WorkerFn,
    shutdown: oneshot::Receiver<()>,
    stopped: Arc<AtomicBool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            port.error(format!("cannot start worker runtime: {e}"));
            port.exit(1);
            return;
        }
    };

    let body_port = port.clone();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(async move {
            tokio::select! {
                result = body(body_port) => Some(result),
                // also fires when the handle is dropped
                _ = shutdown => None,
            }
        })
    }));
    // tasks the worker spawned die with its runtime
    drop(runtime);

    let code = match outcome {
        Ok(Some(Ok(()))) if !stopped.load(Ordering::SeqCst) => 0,
        Ok(Some(Ok(()))) => 1,
        Ok(Some(Err(message))) => {
            port.error(message);
            1
        }
        Ok(None) => 1,
        Err(panic) => {
            port.error(panic_message(panic.as_ref()));
            1
        }
    };
    port.exit(code);
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

/// Native functions looked up by descriptor `function.entry`, or by name.
#[derive(Clone, Default)]
pub struct NativeCatalog {
    functions: HashMap<String, Arc<dyn FunctionCode>>,
}

impl NativeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, code: impl FunctionCode + 'static) -> Self {
        self.insert(key, code);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, code: impl FunctionCode + 'static) {
        self.functions.insert(key.into(), Arc::new(code));
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn FunctionCode>> {
        self.functions.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[async_trait]
impl CodeLoader for NativeCatalog {
    async fn load(
        &self,
        _folder: &Path,
        descriptor: &Descriptor,
    ) -> Result<Option<Arc<dyn FunctionCode>>> {
        let key = descriptor.entry.as_deref().unwrap_or(&descriptor.name);
        Ok(self.get(key))
    }
}
