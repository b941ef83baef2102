use thiserror::Error;

use crate::types::{EventKey, WebhookId};

/// Errors surfaced by the delivery engine.
///
/// Everything except [`DeliveryError::Io`] is published on the error bus
/// and swallowed; delivery, retry, and recovery tasks keep running. Only
/// `shutdown` returns an error to the caller, and only of the `Io` kind.
///
/// Non-200 responses and transport failures are *not* errors: they drive
/// the retry state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Webhook id absent from the webhook repository.
    #[error("webhook not found: {0:?}")]
    MissingWebhook(WebhookId),

    /// Event key absent on a status update.
    #[error("event not found: {0:?}")]
    MissingEvent(EventKey),

    /// Several event keys absent on a bulk status update.
    #[error("{} events not found", .0.len())]
    MissingEvents(Vec<EventKey>),

    /// Persisted server state blob could not be parsed.
    #[error("invalid persisted state: {0}")]
    InvalidState(String),

    /// State repository read or write failure.
    #[error("state repository IO failure: {0}")]
    Io(String),
}
