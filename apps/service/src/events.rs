//! In-process event bus. Mutations publish after commit; subscribers (the
//! webhook dispatcher, telemetry listeners) consume on their own tasks and
//! can never fail the originating request. Lagged subscribers lose the
//! oldest pending events and the loss is counted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::metrics::Metrics;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// `entity.action`, e.g. `content_item.create` or `payment.paid`.
    pub kind: String,
    pub tenant_id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub request_id: String,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        kind: impl Into<String>,
        tenant_id: i64,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            tenant_id,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            request_id: request_id.into(),
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    metrics: Arc<Metrics>,
}

impl EventBus {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender, metrics }
    }

    /// Non-blocking fan-out. A publish with no subscribers is fine.
    pub fn publish(&self, event: Event) {
        tracing::debug!(kind = %event.kind, entity_id = %event.entity_id, "event published");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Receive loop helper that absorbs lag: dropped events increment the
    /// loss metric and reception continues with the oldest retained event.
    pub async fn recv(
        &self,
        receiver: &mut broadcast::Receiver<Event>,
    ) -> Option<Event> {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.metrics.events_dropped.fetch_add(
                        missed,
                        std::sync::atomic::Ordering::Relaxed,
                    );
                    tracing::warn!(missed, "event bus subscriber lagged; dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// `entity.action` pattern match for webhook subscriptions: exact match,
/// `entity.*`, or `*`.
pub fn pattern_matches(pattern: &str, kind: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" || pattern == kind {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return kind.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('.'));
    }
    false
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn patterns_match_exact_wildcard_and_star() {
        assert!(pattern_matches("content_item.create", "content_item.create"));
        assert!(pattern_matches("content_item.*", "content_item.create"));
        assert!(pattern_matches("*", "payment.paid"));
        assert!(!pattern_matches("content_item.*", "content_type.create"));
        assert!(!pattern_matches("content_item.create", "content_item.update"));
        assert!(!pattern_matches("content_item.*", "content_itemx.create"));
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = EventBus::new(Arc::new(Metrics::default()));
        let mut receiver = bus.subscribe();
        bus.publish(Event::new(
            "content_item.create",
            1,
            "content_item",
            "10",
            json!({"id": 10}),
            "req-1",
        ));
        let event = bus.recv(&mut receiver).await.expect("event");
        assert_eq!(event.kind, "content_item.create");
        assert_eq!(event.tenant_id, 1);
    }

    #[tokio::test]
    async fn lagged_subscriber_counts_losses_and_continues() {
        let metrics = Arc::new(Metrics::default());
        let bus = EventBus::new(metrics.clone());
        let mut receiver = bus.subscribe();
        for index in 0..(BUS_CAPACITY + 10) {
            bus.publish(Event::new(
                "content_item.create",
                1,
                "content_item",
                index.to_string(),
                json!({}),
                "req",
            ));
        }
        let event = bus.recv(&mut receiver).await.expect("event");
        assert!(!event.entity_id.is_empty());
        assert!(metrics.events_dropped.load(std::sync::atomic::Ordering::Relaxed) > 0);
    }
}
