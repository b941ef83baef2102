use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

use crate::persist::{PersistedRetry, PersistentServerState};
use crate::retry::RetryState;
use crate::types::WebhookId;

/// In-memory state of one webhook.
#[derive(Clone)]
pub enum WebhookState {
    /// Delivery switched off; terminal until restart.
    Disabled,
    /// Retry timeout expired; no delivery until re-enabled.
    Unavailable,
    /// Actively retrying failed dispatches.
    Retrying(Arc<RetryState>),
}

impl WebhookState {
    pub fn retrying(&self) -> Option<&Arc<RetryState>> {
        match self {
            WebhookState::Retrying(state) => Some(state),
            _ => None,
        }
    }
}

/// Mapping from webhook id to its current in-memory state.
///
/// All mutations go through the one coarse lock, which serializes
/// updates per webhook id. Compound check-then-update sequences hold the
/// guard across the whole sequence.
#[derive(Default)]
pub struct InternalState {
    map: Mutex<HashMap<WebhookId, WebhookState>>,
}

impl InternalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, HashMap<WebhookId, WebhookState>> {
        self.map.lock().await
    }

    pub async fn get(&self, id: &WebhookId) -> Option<WebhookState> {
        self.map.lock().await.get(id).cloned()
    }

    pub async fn update(&self, id: WebhookId, state: WebhookState) {
        self.map.lock().await.insert(id, state);
    }

    /// Fold elapsed time into every retrying entry ahead of the final
    /// checkpoint.
    pub async fn suspend_all(&self, now: DateTime<Utc>) {
        let guard = self.map.lock().await;
        for state in guard.values() {
            if let Some(retry) = state.retrying() {
                retry.suspend(now);
            }
        }
    }

    /// Project every *active* retrying entry into the persistent form.
    ///
    /// Inactive entries have no pending work; they are dropped from the
    /// checkpoint and recreated on a future failure.
    pub async fn snapshot_persistent(&self) -> PersistentServerState {
        let guard = self.map.lock().await;
        let mut retrying_states = HashMap::new();
        for (id, state) in guard.iter() {
            let Some(retry) = state.retrying() else { continue };
            if !retry.is_active() {
                continue;
            }
            let snapshot = retry.snapshot();
            retrying_states.insert(
                id.0.clone(),
                PersistedRetry {
                    since_time: snapshot.active_since,
                    last_retry_time: snapshot.last_retry,
                    time_left: snapshot.timeout,
                    backoff: snapshot.next_backoff,
                    attempt: snapshot.failure_count,
                },
            );
        }
        PersistentServerState { retrying_states }
    }
}
