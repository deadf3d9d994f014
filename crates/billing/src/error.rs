//! Billing error taxonomy
//!
//! Every error a handler sees is classified here before the caller decides
//! retry-vs-drop-vs-escalate. Transient variants are retried by the queue and
//! the billing scheduler; the rest surface synchronously or escalate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Inbound webhook body failed to parse or lacked required fields.
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    /// The signature header was absent or not of the form `sha512=<hex>`.
    #[error("malformed webhook signature header")]
    SignatureFormat,

    /// The signature header was well-formed but did not match the body.
    #[error("webhook signature verification failed")]
    SignatureInvalid,

    /// Misconfiguration requiring operator action (e.g. missing secret).
    #[error("configuration error: {0}")]
    Configuration(&'static str),

    /// Request-level validation failure, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The gateway rejected the charge outright (card declined, bad card).
    #[error("gateway declined: {0}")]
    GatewayDeclined(String),

    /// The gateway could not be reached or returned a transient failure.
    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// Storage-layer failure; transient from the pipeline's point of view.
    #[error("store error: {0}")]
    Store(String),

    /// A conditional write found the record changed underneath it.
    #[error("concurrent modification of {0}")]
    ConcurrentModification(&'static str),

    /// `trigger_billing` called before `initialize`.
    #[error("job scheduler has not been initialized")]
    SchedulerNotInitialized,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the webhook queue should re-deliver after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::GatewayUnavailable(_)
                | BillingError::Store(_)
                | BillingError::ConcurrentModification(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Store(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
