use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::deliver::Deliverer;
use crate::types::{BatchKey, Batching, WebhookEvent};

/// Groups new events by (webhook id, content type) into bounded queues
/// and drains them as dispatches.
///
/// Active only when a batching capacity is configured. Webhooks in
/// single mode bypass the queues and go out individually under the
/// shared parallelism bound.
pub(crate) struct Batcher {
    deliverer: Arc<Deliverer>,
    capacity: usize,
    single_permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Batcher {
    pub fn new(
        deliverer: Arc<Deliverer>,
        capacity: usize,
        max_single_dispatch_concurrency: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            deliverer,
            capacity: capacity.max(1),
            single_permits: Arc::new(Semaphore::new(max_single_dispatch_concurrency.max(1))),
            shutdown,
        }
    }

    /// Consume the new-event stream until shutdown, then drain every
    /// worker so in-flight dispatches complete.
    pub async fn run(self, mut new_events: mpsc::Receiver<WebhookEvent>) {
        let mut queues: HashMap<BatchKey, mpsc::Sender<WebhookEvent>> = HashMap::new();
        let mut workers = JoinSet::new();
        let mut singles = JoinSet::new();

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = new_events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.route(event, &mut queues, &mut workers, &mut singles).await;
        }

        // Closing the queues lets idle workers exit; busy ones finish
        // their current dispatch first.
        drop(queues);
        while workers.join_next().await.is_some() {}
        while singles.join_next().await.is_some() {}
    }

    async fn route(
        &self,
        event: WebhookEvent,
        queues: &mut HashMap<BatchKey, mpsc::Sender<WebhookEvent>>,
        workers: &mut JoinSet<()>,
        singles: &mut JoinSet<()>,
    ) {
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

        match webhook.mode.batching {
            Batching::Single => {
                let permit = self
                    .single_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore closed");
                let deliverer = self.deliverer.clone();
                singles.spawn(async move {
                    deliverer.deliver_events(vec![event]).await;
                    drop(permit);
                });
            }
            Batching::Batched => {
                let key = BatchKey::of(&event);
                let tx = match queues.get(&key) {
                    Some(tx) => tx.clone(),
                    None => {
                        let (tx, work_rx) = mpsc::channel(self.capacity);
                        let (ready_tx, ready_rx) = oneshot::channel();
                        workers.spawn(do_batching(
                            work_rx,
                            self.deliverer.clone(),
                            ready_tx,
                            self.shutdown.clone(),
                        ));
                        // Wait for the worker to be subscribed before
                        // offering it anything; a take on an empty queue
                        // must never miss its first wake-up.
                        let _ = ready_rx.await;
                        queues.insert(key, tx.clone());
                        tx
                    }
                };
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            tracing::debug!("batch worker gone; event dropped");
                        }
                    }
                }
            }
        }
    }
}

/// Per-batch-key worker: block for one event, drain whatever else is
/// queued, dispatch the lot.
async fn do_batching(
    mut work: mpsc::Receiver<WebhookEvent>,
    deliverer: Arc<Deliverer>,
    ready: oneshot::Sender<()>,
    shutdown: CancellationToken,
) {
    let _ = ready.send(());
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = work.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        let mut batch = vec![first];
        while let Ok(event) = work.try_recv() {
            batch.push(event);
        }
        // deliver_events re-checks availability right before posting.
        deliverer.deliver_events(batch).await;
    }
}
