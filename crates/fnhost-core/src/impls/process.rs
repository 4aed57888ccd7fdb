//! Process functions: the entry file of a function folder runs as a child process.
//!
//! # プロトコル
//! - stdin: HTTP / event 呼び出しでは event の JSON を 1 行で渡す
//! - stdout: 1 行 1 フレーム
//!   - `{"type":"log","message":"..."}`
//!   - `{"type":"emit","payload":...}` (trigger のみ)
//!   - `{"type":"response","status":200,"headers":{},"body":...}` (HTTP のみ)
//!   - フレームとして読めない行はそのままログになる
//! - stderr: 1 行ずつ `Error: ...` としてログになる
//! - 環境変数: `FNHOST_KIND` (`http` / `event` / `trigger` / `worker`),
//!   `FNHOST_NAME`, `FNHOST_ROUTE`, `FNHOST_CONFIG`
//!
//! 非ゼロ終了はハンドラ失敗として扱う。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::app::{Emitter, Logger, WorkerPort};
use crate::domain::{Descriptor, Event};
use crate::error::{FnHostError, Result};
use crate::ports::{CodeLoader, Context, ExecutionUnit, FunctionCode, Teardown};

/// How long to wait for output readers after the child is gone.
/// Grandchildren may keep the pipes open.
const READER_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Frame {
    Log {
        message: String,
    },
    Emit {
        #[serde(default)]
        payload: Value,
    },
    Response {
        status: Option<u16>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        body: Option<Value>,
    },
}

fn parse_frame(line: &str) -> Option<Frame> {
    if !line.trim_start().starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Loads `<folder>/<entry>` as a process function when that file exists.
#[derive(Debug, Clone)]
pub struct ProcessLoader {
    default_entry: String,
    interpreters: HashMap<String, String>,
}

impl ProcessLoader {
    pub fn new(default_entry: impl Into<String>) -> Self {
        Self {
            default_entry: default_entry.into(),
            interpreters: HashMap::new(),
        }
    }

    /// Run entries with this file extension through `program`,
    /// e.g. `("sh", "sh")` or `("js", "node")`.
    pub fn with_interpreter(mut self, extension: impl Into<String>, program: impl Into<String>) -> Self {
        self.interpreters.insert(extension.into(), program.into());
        self
    }

    fn interpreter_for(&self, entry: &Path) -> Option<String> {
        let extension = entry.extension()?.to_str()?;
        self.interpreters.get(extension).cloned()
    }
}

#[async_trait]
impl CodeLoader for ProcessLoader {
    async fn load(
        &self,
        folder: &Path,
        descriptor: &Descriptor,
    ) -> Result<Option<Arc<dyn FunctionCode>>> {
        let entry = descriptor.entry.as_deref().unwrap_or(&self.default_entry);
        let program = folder.join(entry);
        match tokio::fs::metadata(&program).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FnHostError::io(&program, e)),
        }
        let interpreter = self.interpreter_for(&program);
        let function = ProcessFunction {
            program,
            interpreter,
            dir: folder.to_path_buf(),
        };
        Ok(Some(Arc::new(function)))
    }
}

/// One function folder's entry file, started fresh for every invocation.
#[derive(Debug, Clone)]
pub struct ProcessFunction {
    program: PathBuf,
    interpreter: Option<String>,
    dir: PathBuf,
}

impl ProcessFunction {
    pub fn new(program: impl Into<PathBuf>, dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            interpreter: None,
            dir: dir.into(),
        }
    }

    pub fn with_interpreter(mut self, program: impl Into<String>) -> Self {
        self.interpreter = Some(program.into());
        self
    }

    fn spawn(&self, ctx: &Context, mode: &str) -> Result<Child> {
        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        };
        command
            .current_dir(&self.dir)
            .env("FNHOST_KIND", mode)
            .env("FNHOST_NAME", &ctx.name)
            .env("FNHOST_ROUTE", &ctx.route)
            .env("FNHOST_CONFIG", ctx.config.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        command.spawn().map_err(|e| {
            FnHostError::fault(
                &ctx.name,
                format!("cannot start {}: {e}", self.program.display()),
            )
        })
    }
}

#[async_trait]
impl FunctionCode for ProcessFunction {
    async fn handle(&self, event: Event, ctx: Context) -> Result<Option<Value>> {
        let mode = if event.method.is_some() { "http" } else { "event" };
        let mut child = self.spawn(&ctx, mode)?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut input = serde_json::to_vec(&event)
                .map_err(|e| FnHostError::fault(&ctx.name, format!("cannot encode event: {e}")))?;
            input.push(b'\n');
            // the child may exit without reading its input
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!(name = %ctx.name, error = %e, "function did not read its input");
            }
        }

        let stderr = child.stderr.take().map(|err| spawn_error_reader(err, ctx.log.clone()));

        let mut returned = None;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_frame(&line) {
                    Some(Frame::Log { message }) => {
                        ctx.log.log(message);
                    }
                    Some(Frame::Response {
                        status,
                        headers,
                        body,
                    }) => {
                        if let Some(status) = status {
                            ctx.reply.status(status);
                        }
                        for (name, value) in headers {
                            ctx.reply.header(name, value);
                        }
                        returned = body;
                    }
                    Some(Frame::Emit { .. }) => {
                        tracing::debug!(name = %ctx.name, "emit frame outside of a trigger ignored");
                    }
                    None => {
                        ctx.log.log(line);
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| FnHostError::fault(&ctx.name, format!("cannot wait for process: {e}")))?;
        if let Some(stderr) = stderr {
            finish_reader(stderr).await;
        }

        if !status.success() {
            return Err(FnHostError::fault(
                &ctx.name,
                format!("process exited with code {}", exit_code(status)),
            ));
        }
        Ok(returned)
    }

    async fn start_trigger(
        &self,
        emitter: Emitter,
        ctx: Context,
    ) -> Result<Option<Box<dyn Teardown>>> {
        let mut child = self.spawn(&ctx, "trigger")?;
        drop(child.stdin.take());

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let log = ctx.log.clone();
            let name = ctx.name.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match parse_frame(&line) {
                        Some(Frame::Emit { payload }) => {
                            emitter.emit(payload);
                        }
                        Some(Frame::Log { message }) => {
                            log.log(message);
                        }
                        Some(Frame::Response { .. }) => {
                            tracing::debug!(name = %name, "response frame from trigger ignored");
                        }
                        None => {
                            log.log(line);
                        }
                    }
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_error_reader(stderr, ctx.log.clone()));
        }

        Ok(Some(Box::new(ProcessTeardown {
            name: ctx.name,
            child,
            readers,
        })))
    }

    fn launch_worker(&self, port: WorkerPort, ctx: Context) -> Result<Box<dyn ExecutionUnit>> {
        let mut child = self.spawn(&ctx, "worker")?;
        drop(child.stdin.take());

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let port = port.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let message = match parse_frame(&line) {
                        Some(Frame::Log { message }) => message,
                        Some(_) => continue,
                        None => line,
                    };
                    port.log(message);
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let port = port.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    port.error(line);
                }
            }));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(child, readers, port, kill_rx));
        Ok(Box::new(ProcessUnit {
            kill: Some(kill_tx),
        }))
    }
}

/// Worker execution unit backed by a child process.
pub struct ProcessUnit {
    kill: Option<oneshot::Sender<()>>,
}

#[async_trait]
impl ExecutionUnit for ProcessUnit {
    async fn terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    port: WorkerPort,
    kill: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "worker process already gone");
            }
            child.wait().await
        }
    };
    for reader in readers {
        finish_reader(reader).await;
    }
    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            port.error(format!("cannot wait for worker process: {e}"));
            1
        }
    };
    port.exit(code);
}

struct ProcessTeardown {
    name: String,
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

#[async_trait]
impl Teardown for ProcessTeardown {
    async fn run(self: Box<Self>) -> std::result::Result<(), String> {
        let ProcessTeardown {
            name,
            mut child,
            readers,
        } = *self;
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(name = %name, code = exit_code(status), "trigger process had already exited");
            }
            Ok(None) => {
                child
                    .kill()
                    .await
                    .map_err(|e| format!("cannot stop trigger process: {e}"))?;
            }
            Err(e) => return Err(format!("cannot inspect trigger process: {e}")),
        }
        for reader in readers {
            finish_reader(reader).await;
        }
        Ok(())
    }
}

fn spawn_error_reader<R>(stream: R, log: Logger) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log.error(line);
        }
    })
}

async fn finish_reader(reader: JoinHandle<()>) {
    let abort = reader.abort_handle();
    if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
        abort.abort();
    }
}

/// Exit code, or 128 + signal number for a process killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::app::{FunctionLog, TriggerBus, WorkerMessage};
    use crate::domain::{FunctionKind, Reply};
    use serde_json::json;
    use std::sync::Mutex;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path
    }

    fn function(dir: &Path, body: &str) -> ProcessFunction {
        let program = script(dir, "index.sh", body);
        ProcessFunction::new(program, dir).with_interpreter("sh")
    }

    fn ctx(name: &str, kind: FunctionKind) -> (Context, Arc<FunctionLog>) {
        let log = Logger::detached();
        let function_log = log.function_log().clone();
        let ctx = Context {
            name: name.into(),
            route: format!("/{name}"),
            kind,
            config: json!({ "name": name }),
            log,
            reply: Reply::new(),
        };
        (ctx, function_log)
    }

    fn messages(log: &FunctionLog) -> Vec<String> {
        log.entries().into_iter().map(|e| e.message).collect()
    }

    #[test]
    fn frames_and_plain_lines() {
        assert!(matches!(
            parse_frame(r#"{"type":"log","message":"hi"}"#),
            Some(Frame::Log { ref message }) if message == "hi"
        ));
        assert!(matches!(
            parse_frame(r#"{"type":"emit","payload":{"count":false}}"#),
            Some(Frame::Emit { ref payload }) if *payload == json!({ "count": false })
        ));
        assert!(parse_frame("plain text").is_none());
        assert!(parse_frame(r#"{"no":"type"}"#).is_none());
    }

    #[tokio::test]
    async fn loader_recognizes_existing_entry_only() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ProcessLoader::new("index.sh").with_interpreter("sh", "sh");
        let d = Descriptor::parse(Path::new("d"), r#"{"name":"f"}"#).unwrap();
        assert!(loader.load(dir.path(), &d).await.unwrap().is_none());

        script(dir.path(), "index.sh", "echo hi");
        assert!(loader.load(dir.path(), &d).await.unwrap().is_some());

        let custom = Descriptor::parse(Path::new("d"), r#"{"name":"f","function":{"entry":"main.sh"}}"#).unwrap();
        assert!(loader.load(dir.path(), &custom).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn http_handler_reads_event_and_writes_response() {
        let dir = tempfile::tempdir().unwrap();
        let f = function(
            dir.path(),
            r#"read event
echo '{"type":"log","message":"got request"}'
echo "kind=$FNHOST_KIND name=$FNHOST_NAME"
echo '{"type":"response","status":201,"headers":{"x-fn":"1"},"body":"hello world"}'"#,
        );
        let (ctx, log) = ctx("hello", FunctionKind::Http);
        let reply = ctx.reply.clone();

        let out = f.handle(Event::http("GET", "/hello"), ctx).await.unwrap();
        assert_eq!(out, Some(json!("hello world")));
        let state = reply.snapshot();
        assert_eq!(state.status, Some(201));
        assert_eq!(state.headers.get("x-fn").map(String::as_str), Some("1"));
        assert_eq!(messages(&log), vec!["got request", "kind=http name=hello"]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_fault_and_stderr_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let f = function(dir.path(), "echo 'bad input' >&2\nexit 3");
        let (ctx, log) = ctx("broken", FunctionKind::Http);

        let err = f.handle(Event::http("GET", "/broken"), ctx).await.unwrap_err();
        assert!(matches!(err, FnHostError::HandlerFault { ref message, .. } if message.contains("code 3")));
        assert_eq!(messages(&log), vec!["Error: bad input"]);
    }

    #[tokio::test]
    async fn trigger_process_emits_until_torn_down() {
        let dir = tempfile::tempdir().unwrap();
        let f = function(
            dir.path(),
            r#"echo '{"type":"emit","payload":{"count":false}}'
while true; do sleep 0.05; done"#,
        );
        let bus = Arc::new(TriggerBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe("ticker", Arc::new(move |v: &Value| sink.lock().unwrap().push(v.clone())));
        let (ctx, _) = ctx("ticker", FunctionKind::Trigger);

        let teardown = f
            .start_trigger(Emitter::new("ticker", bus), ctx)
            .await
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!({ "count": false })]);

        teardown.run().await.unwrap();
    }

    #[tokio::test]
    async fn worker_process_reports_signal_exit_after_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let f = function(
            dir.path(),
            r#"echo "Worker started."
while true; do sleep 0.05; done"#,
        );
        let (port, mut rx) = WorkerPort::channel();
        let (ctx, _) = ctx("looping", FunctionKind::Worker);
        let mut unit = f.launch_worker(port, ctx).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(WorkerMessage::Message("Worker started.".into())));

        unit.terminate().await;
        let mut exit = None;
        while let Ok(Some(message)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            if let WorkerMessage::Exit(code) = message {
                exit = Some(code);
                break;
            }
        }
        assert_eq!(exit, Some(128 + 9));
    }
}
