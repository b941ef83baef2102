use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::batch::Batcher;
use crate::bus::ErrorBus;
use crate::config::ServerConfig;
use crate::deliver::{Deliverer, NewRetry};
use crate::error::DeliveryError;
use crate::http::WebhookHttpClient;
use crate::recovery::Recovery;
use crate::retry_dispatch::RetryDispatcher;
use crate::state::InternalState;
use crate::storage::{WebhookEventRepo, WebhookRepo, WebhookStateRepo};
use crate::types::WebhookEvent;

/// The running delivery engine.
///
/// `start` spawns three long-lived tasks: the new-event subscription,
/// event recovery, and retry monitoring. It returns once the two
/// subscriptions are observable, so no event published afterwards can
/// be missed.
///
/// `shutdown` broadcasts the stop signal, waits for every task to drain
/// (in-flight POSTs are awaited, never aborted), suspends all retrying
/// state, and writes the final checkpoint. Only a checkpoint IO failure
/// surfaces to the caller; every other error is published on the bus.
pub struct DeliveryServer {
    internal: Arc<InternalState>,
    state_repo: Arc<dyn WebhookStateRepo>,
    bus: ErrorBus,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DeliveryServer {
    pub async fn start(
        webhooks: Arc<dyn WebhookRepo>,
        events: Arc<dyn WebhookEventRepo>,
        http: Arc<dyn WebhookHttpClient>,
        state_repo: Arc<dyn WebhookStateRepo>,
        config: ServerConfig,
    ) -> Self {
        let bus = ErrorBus::new(config.error_sliding_capacity);
        let internal = Arc::new(InternalState::new());
        let shutdown = CancellationToken::new();
        let (new_retries_tx, new_retries_rx) = mpsc::channel(config.retry.capacity.max(1));

        let deliverer = Arc::new(Deliverer {
            webhooks,
            events,
            http,
            internal: internal.clone(),
            retry_config: config.retry.clone(),
            new_retries: new_retries_tx,
            bus: bus.clone(),
            shutdown: shutdown.clone(),
        });

        let mut tasks = Vec::new();

        // New-event subscription.
        let (subscribed_tx, subscribed_rx) = oneshot::channel();
        {
            let deliverer = deliverer.clone();
            let shutdown = shutdown.clone();
            let config = config.clone();
            tasks.push(tokio::spawn(async move {
                let new_events = deliverer.events.subscribe_to_new_events().await;
                let _ = subscribed_tx.send(());
                match config.batching_capacity {
                    Some(capacity) => {
                        Batcher::new(
                            deliverer,
                            capacity,
                            config.max_single_dispatch_concurrency,
                            shutdown,
                        )
                        .run(new_events)
                        .await
                    }
                    None => {
                        deliver_directly(
                            deliverer,
                            config.max_single_dispatch_concurrency,
                            shutdown,
                            new_events,
                        )
                        .await
                    }
                }
            }));
        }

        // Event recovery.
        let (recovered_tx, recovered_rx) = oneshot::channel();
        {
            let recovery = Recovery {
                deliverer: deliverer.clone(),
                state_repo: state_repo.clone(),
                shutdown: shutdown.clone(),
            };
            tasks.push(tokio::spawn(recovery.run(recovered_tx)));
        }

        // Retry monitoring: one dispatcher per webhook entering retrying.
        {
            let deliverer = deliverer.clone();
            let shutdown = shutdown.clone();
            let config = config.clone();
            tasks.push(tokio::spawn(monitor_retries(
                deliverer,
                config,
                shutdown,
                new_retries_rx,
            )));
        }

        // Startup barrier: both streams must be subscribed.
        let _ = subscribed_rx.await;
        let _ = recovered_rx.await;
        tracing::info!("webhook delivery server started");

        Self {
            internal,
            state_repo,
            bus,
            shutdown,
            tasks,
        }
    }

    /// Stop the engine and checkpoint the surviving retry state.
    pub async fn shutdown(mut self) -> Result<(), DeliveryError> {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        let now = Utc::now();
        self.internal.suspend_all(now).await;
        let snapshot = self.internal.snapshot_persistent().await;

        // Nothing may fire between the snapshot and the write.
        {
            let map = self.internal.lock().await;
            for state in map.values() {
                if let Some(retry) = state.retrying() {
                    retry.set_inactive();
                }
            }
        }

        let entries = snapshot.retrying_states.len();
        let blob =
            serde_json::to_vec(&snapshot).map_err(|error| DeliveryError::Io(error.to_string()))?;
        self.state_repo.set_state(blob).await?;
        tracing::info!(entries, "checkpoint written; server stopped");
        Ok(())
    }

    /// Subscribe to the sliding error bus.
    pub fn errors(&self) -> broadcast::Receiver<DeliveryError> {
        self.bus.subscribe()
    }

    /// The in-memory webhook state map, mainly for inspection.
    pub fn state(&self) -> Arc<InternalState> {
        self.internal.clone()
    }
}

/// New-event path without batching: every event is its own dispatch,
/// bounded by the single-dispatch concurrency limit.
async fn deliver_directly(
    deliverer: Arc<Deliverer>,
    max_single_dispatch_concurrency: usize,
    shutdown: CancellationToken,
    mut new_events: mpsc::Receiver<WebhookEvent>,
) {
    let permits = Arc::new(Semaphore::new(max_single_dispatch_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = new_events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let permit = permits.clone().acquire_owned().await.expect("semaphore closed");
        let deliverer = deliverer.clone();
        tasks.spawn(async move {
            deliverer.deliver_events(vec![event]).await;
            drop(permit);
        });
    }

    while tasks.join_next().await.is_some() {}
}

/// Observes the new-retries channel and owns every per-webhook retry
/// dispatcher, so the drain at shutdown covers them all.
async fn monitor_retries(
    deliverer: Arc<Deliverer>,
    config: ServerConfig,
    shutdown: CancellationToken,
    mut new_retries: mpsc::Receiver<NewRetry>,
) {
    // One pool for all single-mode retries; per-webhook dispatchers
    // must not multiply the configured bound.
    let single_permits = Arc::new(Semaphore::new(config.max_single_dispatch_concurrency.max(1)));
    let mut dispatchers = JoinSet::new();
    loop {
        let NewRetry { id, state } = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = new_retries.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        tracing::debug!(webhook = %id.0, "spawning retry dispatcher");
        dispatchers.spawn(
            RetryDispatcher {
                id,
                state,
                deliverer: deliverer.clone(),
                batching_capacity: config.batching_capacity,
                single_permits: single_permits.clone(),
                shutdown: shutdown.clone(),
            }
            .run(),
        );
    }
    while dispatchers.join_next().await.is_some() {}
}
