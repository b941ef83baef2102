use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::deliver::{Deliverer, NewRetry};
use crate::error::DeliveryError;
use crate::persist::PersistentServerState;
use crate::retry::RetryState;
use crate::state::WebhookState;
use crate::storage::WebhookStateRepo;
use crate::types::{WebhookEvent, WebhookId};

/// Rebuilds retry state at startup.
///
/// First the persisted checkpoint is restored: every entry becomes an
/// active retrying state with a dispatcher. Then events stuck in
/// `Delivering` are streamed out of the event repository and fed back
/// into their retry queues.
pub(crate) struct Recovery {
    pub deliverer: Arc<Deliverer>,
    pub state_repo: Arc<dyn WebhookStateRepo>,
    pub shutdown: CancellationToken,
}

impl Recovery {
    /// `ready` fires once the delivering-event stream is subscribed;
    /// `start` gates on it.
    pub async fn run(self, ready: oneshot::Sender<()>) {
        self.restore_checkpoint().await;

        let mut delivering = self.deliverer.events.recover_events().await;
        let _ = ready.send(());

        let mut replayed = 0usize;
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = delivering.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.replay(event).await;
            replayed += 1;
        }
        if replayed > 0 {
            tracing::info!(events = replayed, "replayed delivering events into retry queues");
        }
    }

    /// A missing blob is a clean start. An unreadable repo or an
    /// unparseable blob is reported on the bus and treated the same.
    async fn restore_checkpoint(&self) {
        let blob = match self.state_repo.get_state().await {
            Ok(Some(blob)) => blob,
            Ok(None) => return,
            Err(error) => {
                self.deliverer.bus.publish(error);
                return;
            }
        };
        let parsed: PersistentServerState = match serde_json::from_slice(&blob) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.deliverer
                    .bus
                    .publish(DeliveryError::InvalidState(error.to_string()));
                return;
            }
        };

        let entries = parsed.retrying_states.len();
        for (raw_id, entry) in parsed.retrying_states {
            let id = WebhookId(raw_id);
            let state = Arc::new(RetryState::recovered(
                &self.deliverer.retry_config,
                entry.since_time,
                entry.last_retry_time,
                entry.time_left,
                entry.backoff,
                entry.attempt,
            ));
            state.set_active_with_timeout(self.deliverer.on_retry_timeout(id.clone()));

            self.deliverer
                .internal
                .update(id.clone(), WebhookState::Retrying(state.clone()))
                .await;
            let _ = self
                .deliverer
                .new_retries
                .send(NewRetry { id, state })
                .await;
        }
        if entries > 0 {
            tracing::info!(entries, "restored retry checkpoint");
        }
    }

    async fn replay(&self, event: WebhookEvent) {
        let webhook = match self
            .deliverer
            .webhooks
            .require_webhook(&event.key.webhook_id)
            .await
        {
            Ok(webhook) => webhook,
            Err(error) => {
                self.deliverer.bus.publish(error);
                return;
            }
        };
        if !webhook.is_available() {
            return;
        }
        // A full retry queue applies backpressure; give up on shutdown
        // rather than wedging the drain.
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            routed = self.deliverer.enqueue_recovered(&webhook, vec![event]) => {
                if let Err(error) = routed {
                    self.deliverer.bus.publish(error);
                }
            }
        }
    }
}
