//! Synchronous event bus with deterministic delivery.
//!
//! Handlers fire in priority-descending order, then insertion order. Used by
//! the plugin manager for lifecycle events.

use std::collections::BTreeMap;

use serde_json::Value;

/// Lifecycle events emitted by the core services.
pub const STANDARD_EVENTS: [&str; 6] = [
    "pre_discovery",
    "post_discovery",
    "pre_plugin_init",
    "post_plugin_init",
    "ready",
    "shutdown",
];

/// One emitted event.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: BTreeMap<String, Value>,
}

type Handler = Box<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    priority: i32,
    order: u64,
    handler: Handler,
}

/// Priority-ordered synchronous bus.
#[derive(Default)]
pub struct EventBus {
    handlers: BTreeMap<String, Vec<Subscription>>,
    sequence: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler at priority 0.
    pub fn subscribe(&mut self, event_name: &str, handler: Handler) {
        self.on(event_name, 0, handler);
    }

    /// Register a handler with an explicit priority (higher fires first).
    pub fn on(&mut self, event_name: &str, priority: i32, handler: Handler) {
        let order = self.sequence;
        self.sequence += 1;
        self.handlers
            .entry(event_name.to_string())
            .or_default()
            .push(Subscription {
                priority,
                order,
                handler,
            });
    }

    /// Deliver synchronously: priority descending, then insertion order.
    pub fn emit(&self, event_name: &str, payload: BTreeMap<String, Value>) {
        let Some(subscriptions) = self.handlers.get(event_name) else {
            return;
        };
        let event = Event {
            name: event_name.to_string(),
            payload,
        };
        let mut ordered: Vec<&Subscription> = subscriptions.iter().collect();
        ordered.sort_by_key(|s| (std::cmp::Reverse(s.priority), s.order));
        for subscription in ordered {
            (subscription.handler)(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn delivery_order_is_priority_then_insertion() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        for (tag, priority) in [("low", 0), ("first-high", 10), ("second-high", 10)] {
            let seen = Arc::clone(&seen);
            bus.on(
                "ready",
                priority,
                Box::new(move |_| seen.lock().unwrap().push(tag)),
            );
        }
        bus.emit("ready", BTreeMap::new());
        assert_eq!(*seen.lock().unwrap(), vec!["first-high", "second-high", "low"]);
    }

    #[test]
    fn unknown_event_is_noop() {
        let bus = EventBus::new();
        bus.emit("nothing-registered", BTreeMap::new());
    }

    #[test]
    fn payload_reaches_handler() {
        let seen = Arc::new(Mutex::new(None));
        let mut bus = EventBus::new();
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(
                "pre_plugin_init",
                Box::new(move |event| {
                    *seen.lock().unwrap() =
                        event.payload.get("plugin").and_then(|v| v.as_str()).map(String::from);
                }),
            );
        }
        let mut payload = BTreeMap::new();
        payload.insert("plugin".to_string(), Value::from("sample"));
        bus.emit("pre_plugin_init", payload);
        assert_eq!(seen.lock().unwrap().as_deref(), Some("sample"));
    }
}
