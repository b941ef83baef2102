use tokio::sync::broadcast;

use crate::error::DeliveryError;

/// Sliding-capacity publish/subscribe channel of error records.
///
/// Publishing never blocks and never fails the caller. When a subscriber
/// falls more than `capacity` records behind, the oldest records are
/// dropped in favor of the newest. Subscribers only observe records
/// published after they subscribed.
#[derive(Clone)]
pub struct ErrorBus {
    tx: broadcast::Sender<DeliveryError>,
}

impl ErrorBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an error record. A send with no live subscribers is fine;
    /// the record is simply dropped.
    pub fn publish(&self, error: DeliveryError) {
        tracing::warn!(error = %error, "delivery error");
        let _ = self.tx.send(error);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryError> {
        self.tx.subscribe()
    }
}
