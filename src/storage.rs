use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::DeliveryError;
use crate::types::{EventKey, EventStatus, Webhook, WebhookEvent, WebhookId, WebhookStatus};

/// Webhook metadata and status.
#[async_trait]
pub trait WebhookRepo: Send + Sync {
    async fn require_webhook(&self, id: &WebhookId) -> Result<Webhook, DeliveryError>;
    async fn set_webhook_status(
        &self,
        id: &WebhookId,
        status: WebhookStatus,
    ) -> Result<(), DeliveryError>;
}

/// Durable event store and its two streams.
#[async_trait]
pub trait WebhookEventRepo: Send + Sync {
    /// Stream of newly published events. The returned receiver is live
    /// before any data flows, so the subscription is observable.
    async fn subscribe_to_new_events(&self) -> mpsc::Receiver<WebhookEvent>;

    /// Stream of events currently in status `Delivering`, used at
    /// startup to rebuild retry queues.
    async fn recover_events(&self) -> mpsc::Receiver<WebhookEvent>;

    async fn set_event_status(
        &self,
        key: &EventKey,
        status: EventStatus,
    ) -> Result<(), DeliveryError>;

    async fn set_event_status_many(
        &self,
        keys: &[EventKey],
        status: EventStatus,
    ) -> Result<(), DeliveryError>;

    async fn set_all_as_failed_by_webhook_id(&self, id: &WebhookId) -> Result<(), DeliveryError>;
}

/// Checkpoint storage. The blob is opaque to the repository; the engine
/// writes a serialized retry checkpoint as UTF-8 JSON.
#[async_trait]
pub trait WebhookStateRepo: Send + Sync {
    async fn get_state(&self) -> Result<Option<Vec<u8>>, DeliveryError>;
    async fn set_state(&self, blob: Vec<u8>) -> Result<(), DeliveryError>;
}

/// In-memory webhook repository for tests and embedded usage.
#[derive(Default)]
pub struct InMemoryWebhookRepo {
    webhooks: Mutex<HashMap<WebhookId, Webhook>>,
}

impl InMemoryWebhookRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, webhook: Webhook) {
        self.webhooks.lock().await.insert(webhook.id.clone(), webhook);
    }

    pub async fn status_of(&self, id: &WebhookId) -> Option<WebhookStatus> {
        self.webhooks.lock().await.get(id).map(|w| w.status.clone())
    }
}

#[async_trait]
impl WebhookRepo for InMemoryWebhookRepo {
    async fn require_webhook(&self, id: &WebhookId) -> Result<Webhook, DeliveryError> {
        self.webhooks
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DeliveryError::MissingWebhook(id.clone()))
    }

    async fn set_webhook_status(
        &self,
        id: &WebhookId,
        status: WebhookStatus,
    ) -> Result<(), DeliveryError> {
        let mut guard = self.webhooks.lock().await;
        let webhook = guard
            .get_mut(id)
            .ok_or_else(|| DeliveryError::MissingWebhook(id.clone()))?;
        webhook.status = status;
        Ok(())
    }
}

/// In-memory event repository.
///
/// `publish` feeds the live new-event subscription when one exists; the
/// status log keeps the full transition history for assertions.
#[derive(Default)]
pub struct InMemoryEventRepo {
    events: Mutex<HashMap<EventKey, WebhookEvent>>,
    new_events_tx: Mutex<Option<mpsc::Sender<WebhookEvent>>>,
    status_log: Mutex<Vec<(EventKey, EventStatus)>>,
}

impl InMemoryEventRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an event and hand it to the new-event subscriber, if any.
    pub async fn publish(&self, event: WebhookEvent) {
        self.events.lock().await.insert(event.key.clone(), event.clone());
        let tx = self.new_events_tx.lock().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Seed an event without feeding the subscription; used to stage
    /// `Delivering` events ahead of recovery.
    pub async fn seed(&self, mut event: WebhookEvent, status: EventStatus) {
        event.status = status;
        self.events.lock().await.insert(event.key.clone(), event);
    }

    pub async fn status_of(&self, key: &EventKey) -> Option<EventStatus> {
        self.events.lock().await.get(key).map(|e| e.status)
    }

    pub async fn status_history(&self, key: &EventKey) -> Vec<EventStatus> {
        self.status_log
            .lock()
            .await
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl WebhookEventRepo for InMemoryEventRepo {
    async fn subscribe_to_new_events(&self) -> mpsc::Receiver<WebhookEvent> {
        let (tx, rx) = mpsc::channel(256);
        *self.new_events_tx.lock().await = Some(tx);
        rx
    }

    async fn recover_events(&self) -> mpsc::Receiver<WebhookEvent> {
        let delivering: Vec<_> = self
            .events
            .lock()
            .await
            .values()
            .filter(|e| e.status == EventStatus::Delivering)
            .cloned()
            .collect();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for event in delivering {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn set_event_status(
        &self,
        key: &EventKey,
        status: EventStatus,
    ) -> Result<(), DeliveryError> {
        let mut guard = self.events.lock().await;
        let event = guard
            .get_mut(key)
            .ok_or_else(|| DeliveryError::MissingEvent(key.clone()))?;
        event.status = status;
        self.status_log.lock().await.push((key.clone(), status));
        Ok(())
    }

    async fn set_event_status_many(
        &self,
        keys: &[EventKey],
        status: EventStatus,
    ) -> Result<(), DeliveryError> {
        let mut guard = self.events.lock().await;
        let mut log = self.status_log.lock().await;
        let mut missing = Vec::new();
        for key in keys {
            match guard.get_mut(key) {
                Some(event) => {
                    event.status = status;
                    log.push((key.clone(), status));
                }
                None => missing.push(key.clone()),
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DeliveryError::MissingEvents(missing))
        }
    }

    async fn set_all_as_failed_by_webhook_id(&self, id: &WebhookId) -> Result<(), DeliveryError> {
        let mut guard = self.events.lock().await;
        let mut log = self.status_log.lock().await;
        for event in guard.values_mut() {
            if &event.key.webhook_id == id && event.status != EventStatus::Delivered {
                event.status = EventStatus::Failed;
                log.push((event.key.clone(), EventStatus::Failed));
            }
        }
        Ok(())
    }
}

/// In-memory checkpoint cell; writes can be made to fail for tests.
#[derive(Default)]
pub struct InMemoryStateRepo {
    blob: Mutex<Option<Vec<u8>>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl InMemoryStateRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn preload(&self, blob: Vec<u8>) {
        *self.blob.lock().await = Some(blob);
    }

    pub async fn blob(&self) -> Option<Vec<u8>> {
        self.blob.lock().await.clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl WebhookStateRepo for InMemoryStateRepo {
    async fn get_state(&self) -> Result<Option<Vec<u8>>, DeliveryError> {
        Ok(self.blob.lock().await.clone())
    }

    async fn set_state(&self, blob: Vec<u8>) -> Result<(), DeliveryError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DeliveryError::Io("state write disabled".into()));
        }
        *self.blob.lock().await = Some(blob);
        Ok(())
    }
}
