//! Best-effort event notifications.
//!
//! A bounded `tokio::sync::broadcast` channel. Messages are non-authoritative
//! copies of persisted events: a subscriber that falls behind loses the
//! oldest ones (it observes `RecvError::Lagged`), and publishing with no
//! subscribers is a no-op.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::SecurityEvent;

/// Topic published for every registered event, in addition to its
/// source-scoped topic.
pub const EVENT_REGISTERED: &str = "security.event.registered";

#[derive(Debug, Clone, Serialize)]
pub struct BusMessage {
    pub topic: String,
    pub event: SecurityEvent,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusMessage>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    /// Publish `event` under `topic`. Returns how many subscribers saw it.
    pub fn publish(&self, topic: impl Into<String>, event: &SecurityEvent) -> usize {
        let message = BusMessage {
            topic: topic.into(),
            event: event.clone(),
        };
        self.tx.send(message).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// True if `topic` falls under `pattern`, where a trailing `.*` matches any
/// suffix (`security.thermal.*` matches `security.thermal.cold_boot_attack_detected`).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => pattern == topic,
    }
}
