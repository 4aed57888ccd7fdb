use std::path::PathBuf;

use thiserror::Error;

use crate::domain::FunctionKind;

pub type Result<T, E = FnHostError> = std::result::Result<T, E>;

/// Errors produced by the host.
///
/// Every variant is local to the operation that produced it: a failed
/// registration never unregisters another record, and faults raised by
/// function code are converted at the boundary that invoked it.
#[derive(Debug, Error)]
pub enum FnHostError {
    /// Missing or malformed descriptor, or no loadable entry point.
    #[error("invalid function at {path}: {message}")]
    Configuration { path: PathBuf, message: String },

    /// Descriptor declares a `type` outside of the known kinds.
    #[error("unrecognized function type '{kind}' for function '{name}'")]
    UnrecognizedKind { name: String, kind: String },

    /// Function code failed while handling an event.
    #[error("function '{name}' failed: {message}")]
    HandlerFault { name: String, message: String },

    /// HTTP handler did not finish within the configured limit.
    #[error("function '{name}' timed out after {limit_ms}ms")]
    Timeout { name: String, limit_ms: u64 },

    /// Worker execution unit could not be started.
    #[error("worker '{name}' failed: {message}")]
    WorkerFault { name: String, message: String },

    /// Teardown returned by a trigger initializer failed.
    #[error("teardown of trigger '{name}' failed: {message}")]
    TriggerTeardownFault { name: String, message: String },

    /// Loaded code does not export the entry point its kind needs.
    #[error("function '{name}' has no {entry} for kind {kind}")]
    Unsupported {
        name: String,
        kind: FunctionKind,
        entry: &'static str,
    },

    #[error("invalid host config {path}: {message}")]
    HostConfig { path: PathBuf, message: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FnHostError {
    pub(crate) fn configuration(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        FnHostError::Configuration {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn fault(name: &str, message: impl Into<String>) -> Self {
        FnHostError::HandlerFault {
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FnHostError::Io {
            path: path.into(),
            source,
        }
    }
}
