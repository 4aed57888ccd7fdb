//! Inbound events and outbound responses.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a function receives: an HTTP request or a trigger delivery.
///
/// Trigger deliveries only carry `data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Event {
    pub fn http(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn trigger(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query: BTreeMap<String, String>) -> Self {
        self.query = query;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Response sink handed to HTTP handlers.
///
/// Handlers may set a status and headers, and may `send` a body instead
/// of returning one. A returned body wins over a sent one.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    state: Arc<Mutex<ReplyState>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyState {
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, code: u16) -> &Self {
        self.with_state(|s| s.status = Some(code));
        self
    }

    pub fn header(&self, name: impl Into<String>, value: impl Into<String>) -> &Self {
        let (name, value) = (name.into(), value.into());
        self.with_state(|s| {
            s.headers.insert(name, value);
        });
        self
    }

    pub fn send(&self, body: impl Into<Value>) {
        let body = body.into();
        self.with_state(|s| s.body = Some(body));
    }

    pub fn snapshot(&self) -> ReplyState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_state(&self, f: impl FnOnce(&mut ReplyState)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }
}

/// Response body. Strings are sent as text, everything else as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    Json(Value),
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Body::Text(text),
            other => Body::Json(other),
        }
    }
}

/// Transport-independent result of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Body>,
}

impl DispatchResponse {
    pub fn text(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Some(Body::Text(text.into())),
        }
    }

    pub(crate) fn from_reply(returned: Option<Value>, reply: ReplyState) -> Self {
        Self {
            status: reply.status.unwrap_or(200),
            headers: reply.headers,
            body: returned.or(reply.body).map(Body::from),
        }
    }
}
