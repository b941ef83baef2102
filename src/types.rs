use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a webhook.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of webhook ids with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookId(pub String);

/// Unique identifier for an event within its webhook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

/// Composite key identifying one event of one webhook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub webhook_id: WebhookId,
    pub event_id: EventId,
}

impl EventKey {
    pub fn new(webhook_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            webhook_id: WebhookId(webhook_id.into()),
            event_id: EventId(event_id.into()),
        }
    }
}

/// How events addressed to a webhook are grouped into HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Batching {
    /// One POST per event.
    Single,
    /// Events sharing a batch key are grouped into one POST.
    Batched,
}

/// Delivery guarantee enforced for a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Semantics {
    /// A failed dispatch marks its events failed; no retries.
    AtMostOnce,
    /// Failed dispatches are retried with backoff until success or timeout.
    AtLeastOnce,
}

/// Per-webhook delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMode {
    pub batching: Batching,
    pub semantics: Semantics,
}

impl DeliveryMode {
    pub fn new(batching: Batching, semantics: Semantics) -> Self {
        Self { batching, semantics }
    }
}

/// Availability of a webhook as recorded by the webhook repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookStatus {
    Enabled,
    /// Delivery switched off by an operator; terminal until restart.
    Disabled,
    /// The webhook exhausted its retry timeout; no delivery attempts
    /// until an operator re-enables it.
    Unavailable { since: DateTime<Utc> },
}

/// Destination for webhook delivery.
///
/// A `Webhook` describes *where* events go and *how* they are delivered.
/// It is a pure configuration object with no internal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub url: String,
    pub mode: DeliveryMode,
    pub status: WebhookStatus,
}

impl Webhook {
    /// Create an enabled webhook with the given delivery mode.
    pub fn new(id: impl Into<String>, url: impl Into<String>, mode: DeliveryMode) -> Self {
        Self {
            id: WebhookId(id.into()),
            url: url.into(),
            mode,
            status: WebhookStatus::Enabled,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.status, WebhookStatus::Enabled)
    }
}

/// Delivery lifecycle status of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    New,
    Delivering,
    Delivered,
    Failed,
}

/// Logical event to be delivered.
///
/// The engine treats the payload as opaque bytes. Serialization and
/// schema management are the caller's responsibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub key: EventKey,
    pub payload: Vec<u8>,
    /// Content type of the payload; part of the batch key.
    pub content_type: Option<String>,
    pub status: EventStatus,
}

impl WebhookEvent {
    pub fn new(key: EventKey, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            payload: payload.into(),
            content_type: None,
            status: EventStatus::New,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Grouping key for batched delivery.
///
/// Two events batch together iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub webhook_id: WebhookId,
    pub content_type: Option<String>,
}

impl BatchKey {
    pub fn of(event: &WebhookEvent) -> Self {
        Self {
            webhook_id: event.key.webhook_id.clone(),
            content_type: event.content_type.clone(),
        }
    }
}

/// A non-empty batch of events bound for one webhook.
///
/// Immutable once constructed; events retain construction order.
#[derive(Debug, Clone)]
pub struct WebhookDispatch {
    webhook_id: WebhookId,
    url: String,
    semantics: Semantics,
    events: Vec<WebhookEvent>,
}

impl WebhookDispatch {
    /// Build a dispatch for `webhook`; `None` if `events` is empty.
    pub fn new(webhook: &Webhook, events: Vec<WebhookEvent>) -> Option<Self> {
        if events.is_empty() {
            return None;
        }
        Some(Self {
            webhook_id: webhook.id.clone(),
            url: webhook.url.clone(),
            semantics: webhook.mode.semantics,
            events,
        })
    }

    pub fn webhook_id(&self) -> &WebhookId {
        &self.webhook_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn semantics(&self) -> Semantics {
        self.semantics
    }

    pub fn events(&self) -> &[WebhookEvent] {
        &self.events
    }

    pub fn keys(&self) -> Vec<EventKey> {
        self.events.iter().map(|e| e.key.clone()).collect()
    }

    pub fn into_events(self) -> Vec<WebhookEvent> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_rejects_empty_batch() {
        let webhook = Webhook::new(
            "w1",
            "http://example.com/hook",
            DeliveryMode::new(Batching::Single, Semantics::AtMostOnce),
        );
        assert!(WebhookDispatch::new(&webhook, Vec::new()).is_none());
    }

    #[test]
    fn dispatch_preserves_event_order() {
        let webhook = Webhook::new(
            "w1",
            "http://example.com/hook",
            DeliveryMode::new(Batching::Batched, Semantics::AtLeastOnce),
        );
        let events: Vec<_> = (0..5)
            .map(|i| WebhookEvent::new(EventKey::new("w1", format!("e{i}")), b"{}".to_vec()))
            .collect();
        let dispatch = WebhookDispatch::new(&webhook, events).expect("non-empty");
        let ids: Vec<_> = dispatch
            .events()
            .iter()
            .map(|e| e.key.event_id.0.clone())
            .collect();
        assert_eq!(ids, vec!["e0", "e1", "e2", "e3", "e4"]);
    }

    #[test]
    fn batch_key_groups_by_webhook_and_content_type() {
        let a = WebhookEvent::new(EventKey::new("w1", "e1"), b"{}".to_vec())
            .with_content_type("application/json");
        let b = WebhookEvent::new(EventKey::new("w1", "e2"), b"{}".to_vec())
            .with_content_type("application/json");
        let c = WebhookEvent::new(EventKey::new("w1", "e3"), b"{}".to_vec());
        let d = WebhookEvent::new(EventKey::new("w2", "e1"), b"{}".to_vec())
            .with_content_type("application/json");

        assert_eq!(BatchKey::of(&a), BatchKey::of(&b));
        assert_ne!(BatchKey::of(&a), BatchKey::of(&c));
        assert_ne!(BatchKey::of(&a), BatchKey::of(&d));
    }
}
