use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::deliver::Deliverer;
use crate::http::DeliveryRequest;
use crate::retry::RetryState;
use crate::state::WebhookState;
use crate::types::{BatchKey, Batching, EventStatus, Webhook, WebhookDispatch, WebhookEvent, WebhookId};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Consumes one webhook's retry queue, singly or in batches, until the
/// shutdown signal fires.
///
/// One dispatcher exists per webhook that ever entered retrying; it is
/// spawned by retry monitoring off the new-retries channel and keeps
/// serving the queue across inactive periods.
pub(crate) struct RetryDispatcher {
    pub id: WebhookId,
    pub state: Arc<RetryState>,
    pub deliverer: Arc<Deliverer>,
    pub batching_capacity: Option<usize>,
    /// Single-dispatch bound shared across every retry dispatcher, so
    /// concurrently-retrying webhooks draw from one pool.
    pub single_permits: Arc<Semaphore>,
    pub shutdown: CancellationToken,
}

impl RetryDispatcher {
    pub async fn run(self) {
        let webhook = match self.deliverer.webhooks.require_webhook(&self.id).await {
            Ok(webhook) => webhook,
            Err(error) => {
                self.deliverer.bus.publish(error);
                return;
            }
        };
        let Some(queue) = self.state.take_retry_receiver() else {
            // A dispatcher already consumes this queue.
            return;
        };

        let ctx = RetryContext {
            webhook,
            state: self.state.clone(),
            deliverer: self.deliverer.clone(),
            shutdown: self.shutdown.clone(),
        };

        match ctx.webhook.mode.batching {
            Batching::Single => self.retry_singly(ctx, queue).await,
            Batching::Batched => self.retry_batched(ctx, queue).await,
        }
    }

    /// Post each queued event on its own, drawing from the shared
    /// single-dispatch bound.
    async fn retry_singly(&self, ctx: RetryContext, mut queue: mpsc::Receiver<WebhookEvent>) {
        let mut tasks = JoinSet::new();

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = queue.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let permit = self
                .single_permits
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let ctx = ctx.clone();
            tasks.spawn(async move {
                ctx.retry_events(vec![event], None).await;
                drop(permit);
            });
        }

        while tasks.join_next().await.is_some() {}
    }

    /// Group queued events by batch key; one worker takes and drains
    /// each key's bounded queue.
    async fn retry_batched(&self, ctx: RetryContext, mut queue: mpsc::Receiver<WebhookEvent>) {
        let capacity = self
            .batching_capacity
            .unwrap_or(self.deliverer.retry_config.capacity)
            .max(1);
        let mut queues: HashMap<BatchKey, mpsc::Sender<WebhookEvent>> = HashMap::new();
        let mut workers = JoinSet::new();

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = queue.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let key = BatchKey::of(&event);
            let tx = match queues.get(&key) {
                Some(tx) => tx.clone(),
                None => {
                    let (tx, work_rx) = mpsc::channel(capacity);
                    let (ready_tx, ready_rx) = oneshot::channel();
                    workers.spawn(do_retry_batching(work_rx, tx.clone(), ctx.clone(), ready_tx));
                    let _ = ready_rx.await;
                    queues.insert(key, tx.clone());
                    tx
                }
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                sent = tx.send(event) => {
                    if sent.is_err() {
                        tracing::debug!("retry batch worker gone; event dropped");
                    }
                }
            }
        }

        drop(queues);
        while workers.join_next().await.is_some() {}
    }
}

/// Per-batch-key retry worker.
async fn do_retry_batching(
    mut work: mpsc::Receiver<WebhookEvent>,
    work_tx: mpsc::Sender<WebhookEvent>,
    ctx: RetryContext,
    ready: oneshot::Sender<()>,
) {
    let _ = ready.send(());
    loop {
        let first = tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            event = work.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        let mut batch = vec![first];
        while let Ok(event) = work.try_recv() {
            batch.push(event);
        }
        ctx.retry_events(batch, Some(&work_tx)).await;
    }
}

/// Everything one retry attempt needs, cheap to clone into tasks.
#[derive(Clone)]
struct RetryContext {
    webhook: Webhook,
    state: Arc<RetryState>,
    deliverer: Arc<Deliverer>,
    shutdown: CancellationToken,
}

impl RetryContext {
    /// Post a batch from the retry queue and settle the outcome.
    ///
    /// Events move into the in-flight set before the POST and leave it
    /// either on confirmation or after their requeue sleep, so no event
    /// is ever posted twice concurrently.
    async fn retry_events(
        &self,
        events: Vec<WebhookEvent>,
        batch_queue: Option<&mpsc::Sender<WebhookEvent>>,
    ) {
        // A webhook that timed out or was disabled posts nothing more;
        // its pending events were already failed.
        match self.deliverer.internal.get(&self.webhook.id).await {
            Some(WebhookState::Retrying(_)) => {}
            _ => return,
        }

        let Some(dispatch) = WebhookDispatch::new(&self.webhook, events) else {
            return;
        };
        let keys = dispatch.keys();
        self.state.add_in_flight(&keys);

        let response = self
            .deliverer
            .http
            .post(DeliveryRequest::from_dispatch(&dispatch))
            .await;

        if response == Some(200) {
            metric_inc("webhook.retry.delivered");
            self.state.remove_in_flight(&keys);
            if let Err(error) = self
                .deliverer
                .events
                .set_event_status_many(&keys, EventStatus::Delivered)
                .await
            {
                self.deliverer.bus.publish(error);
            }
            // Reset first, then fire every sleeping requeue: the wakers
            // observe the fresh backoff.
            self.state.reset_backoff(Utc::now()).await;

            let batch_empty =
                batch_queue.map_or(true, |tx| tx.capacity() == tx.max_capacity());
            if self.state.retry_queue_is_empty()
                && self.state.in_flight_is_empty()
                && batch_empty
            {
                self.state.set_inactive();
                tracing::info!(webhook = %self.webhook.id.0, "retry drained; webhook healthy");
            }
        } else {
            metric_inc("webhook.retry.failed");
            self.state.increase_backoff(Utc::now());
            tracing::debug!(
                webhook = %self.webhook.id.0,
                ?response,
                backoff_ms = self.state.next_backoff().as_millis() as u64,
                "retry attempt failed"
            );

            let events = dispatch.into_events();
            if batch_queue.is_some() {
                // Requeue on its own task: sleeping inline would leave
                // this worker unable to take from the bounded batch
                // queue it must eventually offer back into.
                let state = self.state.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    let keys: Vec<_> = events.iter().map(|e| e.key.clone()).collect();
                    state.requeue(events, &shutdown).await;
                    state.remove_in_flight(&keys);
                });
            } else {
                self.state.requeue(events, &self.shutdown).await;
                self.state.remove_in_flight(&keys);
            }
        }
    }
}
