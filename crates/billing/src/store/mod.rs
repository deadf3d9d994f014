//! Repository traits over the record stores
//!
//! The pipeline talks to storage exclusively through these traits. Postgres
//! implementations back the deployed services; in-memory implementations back
//! the test suite. Anything that must be race-free (event dedup, processing
//! claims, billing-cycle advancement) is expressed as a conditional operation
//! here rather than as a read-then-write in the caller.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    DeadLetter, PaymentRetryState, Subscription, SubscriptionStatus, Transaction,
    TransactionStatus, WebhookEvent, WebhookEventStatus, WebhookEventType,
};

pub use memory::{
    InMemoryDeadLetterStore, InMemoryPaymentRetryStore, InMemorySubscriptionStore,
    InMemoryTransactionStore, InMemoryWebhookEventStore,
};
pub use postgres::{
    PgDeadLetterStore, PgPaymentRetryStore, PgSubscriptionStore, PgTransactionStore,
    PgWebhookEventStore,
};

/// Fields supplied when an inbound webhook is first persisted.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub event_id: String,
    pub event_type: WebhookEventType,
    pub provider_event_type: String,
    pub payload: serde_json::Value,
    pub source: String,
    pub related_transaction_id: Option<String>,
    pub related_subscription_id: Option<String>,
    pub max_retries: u32,
}

/// Listing filter for the webhook event audit trail.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub status: Option<WebhookEventStatus>,
    pub event_type: Option<WebhookEventType>,
}

/// Per-status event counts backing the queue health endpoint.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueCounts {
    /// pending + retrying
    pub waiting: u64,
    /// processing
    pub active: u64,
    /// processed
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Idempotent insert keyed on the external event id. Returns `false`
    /// without touching the row when the id is already present; this is the
    /// race-free dedup anchor, not a prior read.
    async fn insert_if_absent(&self, event: NewWebhookEvent) -> BillingResult<bool>;

    async fn find_by_event_id(&self, event_id: &str) -> BillingResult<Option<WebhookEvent>>;

    /// Atomically claim up to `limit` due events for processing: `pending`
    /// rows, plus `retrying` rows whose `next_retry_at <= now`. Claimed rows
    /// transition to `processing`; a row can only be claimed by one caller.
    async fn claim_due(&self, now: OffsetDateTime, limit: u32)
        -> BillingResult<Vec<WebhookEvent>>;

    async fn mark_processed(&self, id: Uuid, processed_at: OffsetDateTime) -> BillingResult<()>;

    async fn mark_retrying(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: OffsetDateTime,
        error: &str,
    ) -> BillingResult<()>;

    async fn mark_failed(&self, id: Uuid, retry_count: u32, error: &str) -> BillingResult<()>;

    /// Paginated listing plus total matching count. Events are append-only;
    /// there is deliberately no delete.
    async fn list(
        &self,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> BillingResult<(Vec<WebhookEvent>, u64)>;

    async fn count_by_status(&self) -> BillingResult<QueueCounts>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn push(&self, letter: DeadLetter) -> BillingResult<()>;

    async fn list(&self, limit: u32) -> BillingResult<Vec<DeadLetter>>;

    async fn count(&self) -> BillingResult<u64>;

    /// Retention pruning; returns the number of entries removed.
    async fn prune_older_than(&self, cutoff: OffsetDateTime) -> BillingResult<u64>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn find(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn find_by_gateway_id(&self, gateway_id: &str)
        -> BillingResult<Option<Subscription>>;

    /// Full-row save for the CRUD update flow.
    async fn update(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn list_by_customer(&self, customer_email: &str) -> BillingResult<Vec<Subscription>>;

    /// Active subscriptions with `next_billing_date <= now`.
    async fn list_due_for_billing(&self, now: OffsetDateTime)
        -> BillingResult<Vec<Subscription>>;

    /// Conditional cycle advancement keyed on the previous
    /// `next_billing_date`. Returns `false` when the row changed underneath
    /// the caller (another tick already advanced it); nothing is written in
    /// that case.
    async fn advance_billing_cycle(
        &self,
        id: Uuid,
        expected_next_billing: OffsetDateTime,
        new_next_billing: OffsetDateTime,
        billed_at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Narrow status update by gateway-assigned id, used by the webhook
    /// processor. Returns `false` when no such subscription exists.
    async fn set_status_by_gateway_id(
        &self,
        gateway_id: &str,
        status: SubscriptionStatus,
    ) -> BillingResult<bool>;

    /// Cancellation by gateway id: status, reason, and `cancelled_at` stamp.
    async fn cancel_by_gateway_id(
        &self,
        gateway_id: &str,
        reason: &str,
        cancelled_at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Terminal suspension after the payment-retry budget is exhausted.
    /// Records reason, time, and last error in the subscription metadata.
    async fn suspend(
        &self,
        id: Uuid,
        reason: &str,
        last_error: &str,
        suspended_at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Cycle-cap expiry transition.
    async fn mark_expired(&self, id: Uuid) -> BillingResult<bool>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, transaction: &Transaction) -> BillingResult<()>;

    async fn find(&self, id: Uuid) -> BillingResult<Option<Transaction>>;

    async fn find_by_gateway_id(&self, gateway_id: &str)
        -> BillingResult<Option<Transaction>>;

    /// Narrow status update by gateway-assigned id; `false` when the
    /// transaction is unknown. Refuses to touch terminal rows.
    async fn set_status_by_gateway_id(
        &self,
        gateway_id: &str,
        status: TransactionStatus,
        failure_reason: Option<&str>,
    ) -> BillingResult<bool>;

    /// Chargeback annotation, permitted even on terminal transactions.
    async fn annotate_chargeback(
        &self,
        gateway_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool>;
}

/// Durable payment-retry bookkeeping, owned exclusively by the billing
/// scheduler. Keyed by subscription id.
#[async_trait]
pub trait PaymentRetryStore: Send + Sync {
    async fn upsert(&self, state: &PaymentRetryState) -> BillingResult<()>;

    async fn get(&self, subscription_id: Uuid) -> BillingResult<Option<PaymentRetryState>>;

    async fn remove(&self, subscription_id: Uuid) -> BillingResult<bool>;

    /// Entries with `next_retry_date <= now`.
    async fn list_due(&self, now: OffsetDateTime) -> BillingResult<Vec<PaymentRetryState>>;

    async fn list_all(&self) -> BillingResult<Vec<PaymentRetryState>>;
}
