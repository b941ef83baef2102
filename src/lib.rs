//! A reliable webhook delivery server.
//!
//! This crate subscribes to a stream of outbound events, groups them
//! into HTTP requests addressed to webhook endpoints, enforces
//! per-webhook delivery semantics, and retries failing deliveries with
//! exponential backoff until a per-webhook timeout expires. Enough
//! state is checkpointed to resume retrying across restarts.
//!
//! ## Guarantees
//! - At-most-once or at-least-once delivery, per webhook
//! - Bounded queues with explicit backpressure
//! - Per-webhook retry isolation: one backoff clock and one dispatcher each
//! - Backoff preemption: a success wakes every sleeping retry immediately
//! - Graceful drain: in-flight POSTs complete before the final checkpoint
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Event ordering across retries of a given webhook
//! - Fair scheduling across webhooks beyond what the transport provides
//! - Survival of events that were in flight at a hard crash (only
//!   events marked delivering, or covered by the checkpoint, recover)
//!
//! The event store, webhook metadata store, checkpoint store, and HTTP
//! transport are collaborator traits; in-memory implementations are
//! provided for tests and embedded usage.

mod batch;
mod bus;
mod config;
mod deliver;
mod error;
mod http;
mod persist;
mod recovery;
mod retry;
mod retry_dispatch;
mod server;
mod state;
mod storage;
mod types;

pub use bus::ErrorBus;
pub use config::{RetryConfig, ServerConfig};
pub use error::DeliveryError;
pub use http::{DeliveryRequest, WebhookHttpClient};
pub use persist::{PersistedRetry, PersistentServerState};
pub use retry::{RetrySnapshot, RetryState};
pub use server::DeliveryServer;
pub use state::{InternalState, WebhookState};
pub use storage::{
    InMemoryEventRepo, InMemoryStateRepo, InMemoryWebhookRepo, WebhookEventRepo, WebhookRepo,
    WebhookStateRepo,
};
pub use types::{
    BatchKey, Batching, DeliveryMode, EventId, EventKey, EventStatus, Semantics, Webhook,
    WebhookDispatch, WebhookEvent, WebhookId, WebhookStatus,
};

#[cfg(feature = "http")]
pub use http::HttpClient;
