use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::ErrorBus;
use crate::config::RetryConfig;
use crate::error::DeliveryError;
use crate::http::{DeliveryRequest, WebhookHttpClient};
use crate::retry::RetryState;
use crate::state::{InternalState, WebhookState};
use crate::storage::{WebhookEventRepo, WebhookRepo};
use crate::types::{
    EventStatus, Semantics, Webhook, WebhookDispatch, WebhookEvent, WebhookId, WebhookStatus,
};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Entry on the new-retries channel: a webhook just entered retrying and
/// needs a dispatcher.
///
/// The dispatcher is spawned by retry monitoring rather than by the
/// delivery path itself, which breaks the cycle between the state map
/// and the tasks consuming it.
pub(crate) struct NewRetry {
    pub id: WebhookId,
    pub state: Arc<RetryState>,
}

/// Posts dispatches and interprets responses.
///
/// Shared by the new-event path, the batcher, recovery, and (through its
/// repositories) the retry dispatchers.
pub(crate) struct Deliverer {
    pub webhooks: Arc<dyn WebhookRepo>,
    pub events: Arc<dyn WebhookEventRepo>,
    pub http: Arc<dyn WebhookHttpClient>,
    pub internal: Arc<InternalState>,
    pub retry_config: RetryConfig,
    pub new_retries: mpsc::Sender<NewRetry>,
    pub bus: ErrorBus,
    pub shutdown: CancellationToken,
}

impl Deliverer {
    /// Deliver a group of events addressed to one webhook, fetching the
    /// webhook first. Unavailable webhooks receive nothing.
    ///
    /// Errors are published on the bus; this never fails its caller.
    pub async fn deliver_events(&self, events: Vec<WebhookEvent>) {
        if let Err(error) = self.try_deliver_events(events).await {
            self.bus.publish(error);
        }
    }

    async fn try_deliver_events(&self, events: Vec<WebhookEvent>) -> Result<(), DeliveryError> {
        let Some(first) = events.first() else { return Ok(()) };
        let webhook = self.webhooks.require_webhook(&first.key.webhook_id).await?;
        if !webhook.is_available() {
            return Ok(());
        }
        let Some(dispatch) = WebhookDispatch::new(&webhook, events) else {
            return Ok(());
        };
        self.try_deliver(&webhook, dispatch).await
    }

    /// Post one dispatch and apply the `(semantics, response)` table.
    async fn try_deliver(
        &self,
        webhook: &Webhook,
        dispatch: WebhookDispatch,
    ) -> Result<(), DeliveryError> {
        let keys = dispatch.keys();
        self.events
            .set_event_status_many(&keys, EventStatus::Delivering)
            .await?;

        let response = self.http.post(DeliveryRequest::from_dispatch(&dispatch)).await;

        match (dispatch.semantics(), response) {
            (_, Some(200)) => {
                self.events
                    .set_event_status_many(&keys, EventStatus::Delivered)
                    .await?;
                metric_inc("webhook.delivery.delivered");
                tracing::debug!(
                    webhook = %webhook.id.0,
                    events = keys.len(),
                    "dispatch delivered"
                );
            }
            (Semantics::AtMostOnce, status) => {
                self.events
                    .set_event_status_many(&keys, EventStatus::Failed)
                    .await?;
                metric_inc("webhook.delivery.failed");
                tracing::debug!(
                    webhook = %webhook.id.0,
                    ?status,
                    "at-most-once dispatch failed"
                );
            }
            (Semantics::AtLeastOnce, status) => {
                metric_inc("webhook.delivery.retry_scheduled");
                tracing::debug!(
                    webhook = %webhook.id.0,
                    ?status,
                    "dispatch failed; webhook enters retrying"
                );
                self.promote_to_retrying(webhook, dispatch.into_events()).await?;
            }
        }
        Ok(())
    }

    /// Move a webhook into retrying after a failed at-least-once
    /// dispatch, or feed an existing retrying state.
    ///
    /// The failure grows the backoff, and the events reach the retry
    /// queue through a requeue sleep, so the first retry attempt waits
    /// out the current backoff like every later one.
    pub async fn promote_to_retrying(
        &self,
        webhook: &Webhook,
        events: Vec<WebhookEvent>,
    ) -> Result<(), DeliveryError> {
        let Some(state) = self.retry_state_for(webhook, &events).await? else {
            return Ok(());
        };
        state.increase_backoff(Utc::now());
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            state.requeue(events, &shutdown).await;
        });
        Ok(())
    }

    /// Route recovered `Delivering` events straight into the retry
    /// queue; recovery replays them without a backoff sleep.
    pub async fn enqueue_recovered(
        &self,
        webhook: &Webhook,
        events: Vec<WebhookEvent>,
    ) -> Result<(), DeliveryError> {
        let Some(state) = self.retry_state_for(webhook, &events).await? else {
            return Ok(());
        };
        state.enqueue_all(events).await;
        Ok(())
    }

    /// Look up or create the webhook's retry state, (re)arming its
    /// timeout timer.
    ///
    /// The whole lookup-then-update runs under the state-map lock. A
    /// fresh state is announced on the new-retries channel so retry
    /// monitoring spawns its dispatcher. Returns `None` for webhooks
    /// parked as disabled or unavailable; their events are failed.
    async fn retry_state_for(
        &self,
        webhook: &Webhook,
        events: &[WebhookEvent],
    ) -> Result<Option<Arc<RetryState>>, DeliveryError> {
        let mut map = self.internal.lock().await;
        match map.get(&webhook.id) {
            Some(WebhookState::Retrying(existing)) => {
                let state = existing.clone();
                state.set_active_with_timeout(self.on_retry_timeout(webhook.id.clone()));
                Ok(Some(state))
            }
            Some(WebhookState::Disabled) | Some(WebhookState::Unavailable) => {
                let keys: Vec<_> = events.iter().map(|e| e.key.clone()).collect();
                self.events
                    .set_event_status_many(&keys, EventStatus::Failed)
                    .await?;
                Ok(None)
            }
            None => {
                let state = Arc::new(RetryState::new(&self.retry_config, Utc::now()));
                state.set_active_with_timeout(self.on_retry_timeout(webhook.id.clone()));
                map.insert(webhook.id.clone(), WebhookState::Retrying(state.clone()));
                let _ = self
                    .new_retries
                    .send(NewRetry {
                        id: webhook.id.clone(),
                        state: state.clone(),
                    })
                    .await;
                Ok(Some(state))
            }
        }
    }

    /// Timer body run when a webhook exhausts its retry timeout.
    pub fn on_retry_timeout(&self, id: WebhookId) -> impl Future<Output = ()> + Send + 'static {
        let webhooks = self.webhooks.clone();
        let events = self.events.clone();
        let internal = self.internal.clone();
        let bus = self.bus.clone();
        async move {
            mark_webhook_unavailable(&webhooks, &events, &internal, &bus, &id).await;
        }
    }
}

/// Fail every pending event of the webhook and park it as unavailable,
/// in the repositories and in the state map.
pub(crate) async fn mark_webhook_unavailable(
    webhooks: &Arc<dyn WebhookRepo>,
    events: &Arc<dyn WebhookEventRepo>,
    internal: &Arc<InternalState>,
    bus: &ErrorBus,
    id: &WebhookId,
) {
    metric_inc("webhook.retry.timeout");
    tracing::warn!(webhook = %id.0, "retry timeout expired; marking webhook unavailable");

    if let Err(error) = events.set_all_as_failed_by_webhook_id(id).await {
        bus.publish(error);
    }
    if let Err(error) = webhooks
        .set_webhook_status(id, WebhookStatus::Unavailable { since: Utc::now() })
        .await
    {
        bus.publish(error);
    }

    let mut map = internal.lock().await;
    if let Some(WebhookState::Retrying(state)) = map.get(id) {
        // The timer that ran this body already fired; clear its switch
        // so activity reflects reality.
        state.set_inactive();
    }
    map.insert(id.clone(), WebhookState::Unavailable);
}
