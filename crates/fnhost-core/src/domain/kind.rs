//! Execution style of a function.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Discriminator of the execution strategy.
///
/// - `Http`: invoked lazily per request by the dispatcher.
/// - `Worker`: runs continuously in an isolated execution unit.
/// - `Trigger`: initialized once with an emitter; its emissions fan out to subscribers.
/// - `Custom`: registered but inert. Reachable only through event subscriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    #[default]
    Http,
    Worker,
    Trigger,
    Custom,
}

impl FunctionKind {
    /// Parse the descriptor's `function.type`. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "http" => Some(FunctionKind::Http),
            "worker" => Some(FunctionKind::Worker),
            "trigger" => Some(FunctionKind::Trigger),
            "custom" => Some(FunctionKind::Custom),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FunctionKind::Http => "http",
            FunctionKind::Worker => "worker",
            FunctionKind::Trigger => "trigger",
            FunctionKind::Custom => "custom",
        }
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
