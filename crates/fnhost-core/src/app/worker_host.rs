//! WorkerHost - worker 関数を隔離された実行単位で動かす
//!
//! # 設計
//! - 実行単位（子プロセス / 専用スレッド）とはメッセージでしか通信しない
//! - 実行単位からのメッセージは relay タスクが record のログに書き込む
//!   - `Message`: そのまま
//!   - `Error`: `Error: ...`
//!   - `Exit`: `Worker stopped with exit code N`
//! - 再起動はしない。予期しない終了はログに残すだけ
//!
//! `terminate()` は実行単位を止めてから port を閉じ、relay が最後の
//! メッセージを書き終えるまで（grace 期間を上限に）待つ。
//! port が閉じると `Exit` 以外の送信は `false` を返すので、`port.log()` を
//! ループ条件にしている worker は await しなくても止まる。
//! grace を過ぎたら relay を abort し、受信側ごと捨てる。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::Logger;
use crate::error::{FnHostError, Result};
use crate::ports::{Context, ExecutionUnit, FunctionCode};

/// Message relayed from an execution unit to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    Message(String),
    Error(String),
    Exit(i32),
}

/// Sending half handed to an execution unit.
#[derive(Clone)]
pub struct WorkerPort {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for WorkerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPort")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WorkerPort {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let port = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (port, rx)
    }

    /// Port whose messages go nowhere.
    pub fn detached() -> Self {
        Self::channel().0
    }

    /// Returns `false` once the host stopped listening.
    ///
    /// After the port is closed only `Exit` still goes through.
    pub fn send(&self, message: WorkerMessage) -> bool {
        if self.closed.load(Ordering::SeqCst) && !matches!(message, WorkerMessage::Exit(_)) {
            return false;
        }
        self.tx.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    pub fn log(&self, message: impl fmt::Display) -> bool {
        self.send(WorkerMessage::Message(message.to_string()))
    }

    pub fn error(&self, message: impl fmt::Display) -> bool {
        self.send(WorkerMessage::Error(message.to_string()))
    }

    pub fn exit(&self, code: i32) -> bool {
        self.send(WorkerMessage::Exit(code))
    }
}

/// Handle to a running worker, kept on its record.
pub struct WorkerHandle {
    name: String,
    unit: Mutex<Option<Box<dyn ExecutionUnit>>>,
    relay: Mutex<Option<JoinHandle<()>>>,
    terminating: Arc<AtomicBool>,
    // shared with every clone of the unit's port
    port_closed: Arc<AtomicBool>,
    grace: Duration,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("terminating", &self.terminating.load(Ordering::SeqCst))
            .finish()
    }
}

impl WorkerHandle {
    /// Stop the execution unit. Idempotent.
    ///
    /// Native thread units stop cooperatively: a body that neither awaits
    /// nor checks `port.log()` keeps its thread until it returns.
    pub async fn terminate(&self) {
        self.terminating.store(true, Ordering::SeqCst);

        let unit = self.unit.lock().await.take();
        if let Some(mut unit) = unit {
            unit.terminate().await;
        }
        self.port_closed.store(true, Ordering::SeqCst);

        let relay = self.relay.lock().await.take();
        if let Some(relay) = relay {
            let abort = relay.abort_handle();
            if tokio::time::timeout(self.grace, relay).await.is_err() {
                abort.abort();
                tracing::warn!(
                    name = %self.name,
                    grace_ms = self.grace.as_millis() as u64,
                    "worker did not stop within grace period, relay aborted"
                );
            }
        }
    }

    /// `true` until the relay has seen every message of the unit.
    pub async fn is_running(&self) -> bool {
        match self.relay.lock().await.as_ref() {
            Some(relay) => !relay.is_finished(),
            None => false,
        }
    }
}

/// Spawns execution units and relays what they report.
#[derive(Debug, Clone)]
pub struct WorkerHost {
    grace: Duration,
}

impl WorkerHost {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Start `code` as a worker and relay its messages into `log`.
    pub fn spawn(&self, code: &dyn FunctionCode, ctx: Context) -> Result<WorkerHandle> {
        let name = ctx.name.clone();
        let log = ctx.log.clone();
        let (port, rx) = WorkerPort::channel();
        let port_closed = port.closed.clone();

        let unit = code.launch_worker(port, ctx).map_err(|e| match e {
            e @ FnHostError::Unsupported { .. } => e,
            other => FnHostError::WorkerFault {
                name: name.clone(),
                message: other.to_string(),
            },
        })?;

        let terminating = Arc::new(AtomicBool::new(false));
        let relay = tokio::spawn(relay(name.clone(), rx, log, terminating.clone()));
        tracing::info!(name = %name, "worker started");

        Ok(WorkerHandle {
            name,
            unit: Mutex::new(Some(unit)),
            relay: Mutex::new(Some(relay)),
            terminating,
            port_closed,
            grace: self.grace,
        })
    }
}

async fn relay(
    name: String,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    log: Logger,
    terminating: Arc<AtomicBool>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            WorkerMessage::Message(text) => {
                log.log(text);
            }
            WorkerMessage::Error(text) => {
                tracing::warn!(name = %name, error = %text, "worker reported an error");
                log.error(text);
            }
            WorkerMessage::Exit(code) => {
                if !terminating.load(Ordering::SeqCst) {
                    tracing::warn!(name = %name, code, "worker exited unexpectedly");
                } else {
                    tracing::info!(name = %name, code, "worker stopped");
                }
                log.log(format!("Worker stopped with exit code {code}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::FunctionLog;
    use crate::domain::{FunctionKind, Reply};
    use crate::impls::NativeFunction;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    fn ctx(name: &str) -> (Context, Arc<FunctionLog>) {
        let logger = Logger::detached();
        let log = logger.function_log().clone();
        let ctx = Context {
            name: name.into(),
            route: format!("/{name}"),
            kind: FunctionKind::Worker,
            config: Value::Null,
            log: logger,
            reply: Reply::new(),
        };
        (ctx, log)
    }

    fn explode() -> std::result::Result<(), String> {
        panic!("worker blew up")
    }

    fn messages(log: &FunctionLog) -> Vec<String> {
        log.entries().into_iter().map(|e| e.message).collect()
    }

    #[tokio::test]
    async fn relays_messages_and_exit_code() {
        let code = NativeFunction::worker(|port: WorkerPort| async move {
            port.log("Worker started.");
            port.log("Worker: 0");
            Ok(())
        });
        let (ctx, log) = ctx("short");
        let handle = WorkerHost::new(Duration::from_secs(2)).spawn(&code, ctx).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.is_running().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            messages(&log),
            vec!["Worker started.", "Worker: 0", "Worker stopped with exit code 0"]
        );
    }

    #[tokio::test]
    async fn terminate_stops_log_growth() {
        let code = NativeFunction::worker(|port: WorkerPort| async move {
            let mut counter = 0;
            while port.log(format!("Worker: {counter}")) {
                counter += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok(())
        });
        let (ctx, log) = ctx("looping");
        let handle = WorkerHost::new(Duration::from_secs(2)).spawn(&code, ctx).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.terminate().await;
        handle.terminate().await;

        let lines = messages(&log);
        assert!(lines.iter().any(|l| l == "Worker: 0"));
        assert_eq!(
            lines.last().map(String::as_str),
            Some("Worker stopped with exit code 1")
        );

        let len = log.len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log.len(), len);
        assert!(!handle.is_running().await);
    }

    #[tokio::test]
    async fn terminate_stops_a_worker_that_never_awaits() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let code = NativeFunction::worker(move |port: WorkerPort| {
            let counter = counter.clone();
            async move {
                while port.log("tick") {
                    counter.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(())
            }
        });
        let (ctx, log) = ctx("busy");
        let handle = WorkerHost::new(Duration::from_millis(200)).spawn(&code, ctx).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.terminate().await;
        let at_terminate = ticks.load(Ordering::SeqCst);
        assert!(at_terminate > 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), at_terminate);
        assert_eq!(
            messages(&log).last().map(String::as_str),
            Some("Worker stopped with exit code 1")
        );
        assert!(!handle.is_running().await);
    }

    #[tokio::test]
    async fn terminate_gives_up_after_grace_period() {
        let release = Arc::new(AtomicBool::new(false));
        let gate = release.clone();
        let code = NativeFunction::worker(move |_port: WorkerPort| {
            let gate = gate.clone();
            async move {
                while !gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(())
            }
        });
        let (ctx, _log) = ctx("stuck");
        let handle = WorkerHost::new(Duration::from_millis(100)).spawn(&code, ctx).unwrap();

        let started = std::time::Instant::now();
        handle.terminate().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!handle.is_running().await);

        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn closed_port_only_lets_exit_through() {
        let (port, mut rx) = WorkerPort::channel();
        assert!(port.log("before"));
        port.closed.store(true, Ordering::SeqCst);
        assert!(port.is_closed());
        assert!(!port.log("after"));
        assert!(!port.error("after"));
        assert!(port.exit(1));

        assert_eq!(rx.try_recv().unwrap(), WorkerMessage::Message("before".into()));
        assert_eq!(rx.try_recv().unwrap(), WorkerMessage::Exit(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failure_and_panic_are_logged_not_escalated() {
        let failing = NativeFunction::worker(|_port: WorkerPort| async move {
            Err("database unreachable".to_string())
        });
        let (ctx1, log1) = ctx("failing");
        let h1 = WorkerHost::new(Duration::from_secs(2)).spawn(&failing, ctx1).unwrap();

        let panicking = NativeFunction::worker(|_port: WorkerPort| async move { explode() });
        let (ctx2, log2) = ctx("panicking");
        let h2 = WorkerHost::new(Duration::from_secs(2)).spawn(&panicking, ctx2).unwrap();

        for h in [&h1, &h2] {
            tokio::time::timeout(Duration::from_secs(2), async {
                while h.is_running().await {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();
        }

        assert_eq!(
            messages(&log1),
            vec!["Error: database unreachable", "Worker stopped with exit code 1"]
        );
        let lines = messages(&log2);
        assert!(lines[0].contains("worker blew up"));
        assert_eq!(lines[1], "Worker stopped with exit code 1");
    }

    #[tokio::test]
    async fn code_without_worker_entry_is_unsupported() {
        let code = NativeFunction::handler(|_event, _ctx| async move { Ok(None) });
        let (ctx, _) = ctx("http-only");
        let err = WorkerHost::new(Duration::from_secs(1)).spawn(&code, ctx).unwrap_err();
        assert!(matches!(err, FnHostError::Unsupported { .. }));
    }
}
