//! LogStore - 関数ごとの追記専用ログ
//!
//! 各エントリは「取得時刻 + メッセージ」。同じログの中では時刻が単調非減少になる。
//! record が teardown されるとログは close され、それ以降の追記は無視される。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::ports::{Clock, SystemClock};

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.message
        )
    }
}

#[derive(Debug, Default)]
struct LogState {
    entries: VecDeque<LogEntry>,
    last_at: Option<DateTime<Utc>>,
    closed: bool,
}

/// Log of one record generation.
pub struct FunctionLog {
    state: Mutex<LogState>,
    clock: Arc<dyn Clock>,
    /// 0 = unbounded.
    capacity: usize,
}

impl fmt::Debug for FunctionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionLog")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl FunctionLog {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            clock,
            capacity,
        }
    }

    /// Append a message. Returns `false` when the log is closed.
    pub fn append(&self, message: impl Into<String>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let now = self.clock.now();
        let at = match state.last_at {
            Some(last) if now < last => last,
            _ => now,
        };
        state.last_at = Some(at);
        if self.capacity > 0 && state.entries.len() >= self.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(LogEntry {
            at,
            message: message.into(),
        });
        true
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Formatted lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lock().entries.iter().map(ToString::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap handle that writes into one record's log.
#[derive(Clone)]
pub struct Logger {
    log: Arc<FunctionLog>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Logger").field(&self.log).finish()
    }
}

impl Logger {
    pub fn new(log: Arc<FunctionLog>) -> Self {
        Self { log }
    }

    /// Logger backed by a log nobody else reads.
    pub fn detached() -> Self {
        Self::new(Arc::new(FunctionLog::new(Arc::new(SystemClock), 0)))
    }

    pub fn log(&self, message: impl fmt::Display) -> bool {
        self.log.append(message.to_string())
    }

    pub fn error(&self, message: impl fmt::Display) -> bool {
        self.log.append(format!("Error: {message}"))
    }

    pub fn function_log(&self) -> &Arc<FunctionLog> {
        &self.log
    }
}

/// route → log of the record currently holding that route.
pub struct LogStore {
    logs: RwLock<HashMap<String, Arc<FunctionLog>>>,
    clock: Arc<dyn Clock>,
    capacity: usize,
}

impl LogStore {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            clock,
            capacity,
        }
    }

    /// Create a fresh log for a new record generation. Not yet visible
    /// under `route` until [`LogStore::attach`] is called.
    pub fn create(&self) -> Arc<FunctionLog> {
        Arc::new(FunctionLog::new(self.clock.clone(), self.capacity))
    }

    pub fn attach(&self, route: &str, log: Arc<FunctionLog>) {
        self.logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(route.to_string(), log);
    }

    pub fn get(&self, route: &str) -> Option<Arc<FunctionLog>> {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(route)
            .cloned()
    }

    /// Detach `log` from `route`, unless the route already moved on to a newer log.
    pub fn detach(&self, route: &str, log: &Arc<FunctionLog>) -> bool {
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        match logs.get(route) {
            Some(current) if Arc::ptr_eq(current, log) => {
                logs.remove(route);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.logs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
