//! In-memory pub/sub bus for control-plane events.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod topics {
    pub const INGEST_REQUESTS: &str = "ingest.requests";
    pub const REPLICATION_REQUESTS: &str = "replication.requests";
    pub const UPLOADS_EXPIRED: &str = "uploads.expired";
    pub const TRASH_EXPIRED: &str = "trash.expired";
    pub const ACTIVITY_EVENTS: &str = "activity.events";
    pub const QUOTA_ALERT: &str = "quota.alert";
    pub const HEALING_EVENTS: &str = "healing.events";
    pub const LIFECYCLE_TRANSITIONS: &str = "lifecycle.transitions";
    pub const UI_ACTIVITY: &str = "ui.activity";

    pub fn all() -> Vec<&'static str> {
        vec![
            INGEST_REQUESTS,
            REPLICATION_REQUESTS,
            UPLOADS_EXPIRED,
            TRASH_EXPIRED,
            ACTIVITY_EVENTS,
            QUOTA_ALERT,
            HEALING_EVENTS,
            LIFECYCLE_TRANSITIONS,
            UI_ACTIVITY,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub topic: String,
    pub payload: Value,
    pub retries: u32,
}

impl MessageEnvelope {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            retries: 0,
        }
    }
}

type Subscriber = Box<dyn Fn(&MessageEnvelope) + Send + Sync>;

/// Subscribers run synchronously in registration order; publishing never
/// fails and never surfaces subscriber panics to the caller's state.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, envelope: MessageEnvelope) {
        let subscribers = self.subscribers.read();
        if let Some(handlers) = subscribers.get(&envelope.topic) {
            for handler in handlers {
                handler(&envelope);
            }
        }
    }

    pub fn subscribe(
        &self,
        topic: &str,
        handler: Box<dyn Fn(&MessageEnvelope) + Send + Sync>,
    ) {
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn publish_reaches_topic_subscribers_only() {
        let bus = InMemoryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            topics::INGEST_REQUESTS,
            Box::new(move |env| sink.lock().unwrap().push(env.topic.clone())),
        );

        bus.publish(MessageEnvelope::new(
            topics::INGEST_REQUESTS,
            serde_json::json!({"session_id": "s1"}),
        ));
        bus.publish(MessageEnvelope::new(
            topics::HEALING_EVENTS,
            serde_json::json!({}),
        ));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), [topics::INGEST_REQUESTS.to_string()]);
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let bus = InMemoryBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let sink = Arc::clone(&order);
            bus.subscribe(
                topics::ACTIVITY_EVENTS,
                Box::new(move |_| sink.lock().unwrap().push(tag)),
            );
        }
        bus.publish(MessageEnvelope::new(topics::ACTIVITY_EVENTS, Value::Null));
        assert_eq!(order.lock().unwrap().as_slice(), ["first", "second", "third"]);
    }
}
