//! Event bus fanning out read-only progress snapshots.
//!
//! Built on a bounded broadcast channel: publishing never blocks, and a
//! subscriber that falls behind loses the oldest events it has not read.
//! That drop-oldest policy is this implementation's substitute for the
//! reference's try-publish.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

/// New log records were stored.
pub const EVENT_LOGS: &str = "logs";

/// A target advertised for the first time.
pub const EVENT_TARGET_ADDED: &str = "targetAdded";

/// A target advertised (always published, first sight included).
pub const EVENT_TARGET_UPDATED: &str = "targetUpdated";

/// One event on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Event topic.
    pub topic: String,

    /// JSON snapshot of the subject.
    pub payload: serde_json::Value,
}

/// Bounded broadcast event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` unread events per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all events from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish a snapshot. Serialisation failures are logged and dropped;
    /// an empty subscriber set is not an error.
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %topic, error = %e, "unable to serialise event payload");
                return;
            }
        };
        let _ = self.tx.send(Event {
            topic: topic.to_owned(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(EVENT_TARGET_ADDED, &serde_json::json!({"id": "t1"}));

        let event = rx.recv().await.expect("event");
        assert_eq!(event.topic, EVENT_TARGET_ADDED);
        assert_eq!(event.payload["id"], "t1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.publish(EVENT_LOGS, &serde_json::json!([]));
    }

    #[tokio::test]
    async fn slow_subscribers_lose_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..4 {
            bus.publish(EVENT_LOGS, &serde_json::json!({ "n": i }));
        }

        // The first reads fail with Lagged, then the newest survive.
        let mut seen = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => seen.push(event.payload["n"].as_i64().expect("n")),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(seen, vec![2, 3]);
    }
}
