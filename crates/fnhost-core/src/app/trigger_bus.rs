//! TriggerBus - 名前をキーにした publish/subscribe
//!
//! `emit` はその topic に登録されている listener を、登録順に同期的に呼ぶ。
//! listener は lock の外で呼ぶので、listener の中から emit / subscribe してもよい。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct BusState {
    next_id: u64,
    topics: HashMap<String, Vec<(ListenerId, Listener)>>,
}

/// Process-wide (per host) topic → listeners map.
#[derive(Default)]
pub struct TriggerBus {
    state: Mutex<BusState>,
}

impl TriggerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str, listener: Listener) -> ListenerId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = ListenerId(state.next_id);
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove one listener. Other listeners, on this or any topic, are untouched.
    pub fn unsubscribe(&self, topic: &str, id: ListenerId) -> bool {
        let mut state = self.lock();
        let Some(listeners) = state.topics.get_mut(topic) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            state.topics.remove(topic);
        }
        removed
    }

    /// Invoke every listener of `topic` in registration order.
    /// Returns how many listeners were called.
    pub fn emit(&self, topic: &str, payload: &Value) -> usize {
        let listeners: Vec<Listener> = match self.lock().topics.get(topic) {
            Some(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            None => return 0,
        };
        for listener in &listeners {
            listener(payload);
        }
        listeners.len()
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Emit capability bound to one trigger's topic.
#[derive(Clone)]
pub struct Emitter {
    topic: String,
    bus: Arc<TriggerBus>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").field("topic", &self.topic).finish()
    }
}

impl Emitter {
    pub fn new(topic: impl Into<String>, bus: Arc<TriggerBus>) -> Self {
        Self {
            topic: topic.into(),
            bus,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn emit(&self, payload: Value) -> usize {
        tracing::debug!(topic = %self.topic, "trigger emit");
        self.bus.emit(&self.topic, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(seen: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener {
        let seen = seen.clone();
        Arc::new(move |payload: &Value| {
            seen.lock().unwrap().push(format!("{tag}:{payload}"));
        })
    }

    #[test]
    fn emit_calls_listeners_in_registration_order() {
        let bus = TriggerBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("t", recorder(&seen, "first"));
        bus.subscribe("t", recorder(&seen, "second"));

        let called = bus.emit("t", &json!(1));
        assert_eq!(called, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first:1", "second:1"]);
    }

    #[test]
    fn emit_without_listeners_is_noop() {
        let bus = TriggerBus::new();
        assert_eq!(bus.emit("nobody", &json!(null)), 0);
    }

    #[test]
    fn unsubscribe_does_not_touch_other_topics() {
        let bus = TriggerBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = bus.subscribe("a", recorder(&seen, "a"));
        bus.subscribe("b", recorder(&seen, "b"));

        assert!(bus.unsubscribe("a", a));
        assert!(!bus.unsubscribe("a", a));
        assert_eq!(bus.listener_count("a"), 0);
        assert_eq!(bus.listener_count("b"), 1);

        bus.emit("a", &json!("x"));
        bus.emit("b", &json!("y"));
        assert_eq!(*seen.lock().unwrap(), vec![r#"b:"y""#]);
    }

    #[test]
    fn listener_may_reenter_the_bus() {
        let bus = Arc::new(TriggerBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("leaf", recorder(&seen, "leaf"));
        let inner = bus.clone();
        bus.subscribe(
            "root",
            Arc::new(move |payload: &Value| {
                inner.emit("leaf", payload);
            }),
        );

        bus.emit("root", &json!(7));
        assert_eq!(*seen.lock().unwrap(), vec!["leaf:7"]);
    }

    #[test]
    fn emitter_is_bound_to_its_topic() {
        let bus = Arc::new(TriggerBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("ticker", recorder(&seen, "ticker"));
        bus.subscribe("other", recorder(&seen, "other"));

        let emitter = Emitter::new("ticker", bus.clone());
        assert_eq!(emitter.topic(), "ticker");
        assert_eq!(emitter.emit(json!({ "count": false })), 1);
        assert_eq!(*seen.lock().unwrap(), vec![r#"ticker:{"count":false}"#]);
    }
}
