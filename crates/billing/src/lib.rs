// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Payrail Billing
//!
//! Webhook ingestion and processing plus recurring billing for the payrail
//! services.
//!
//! ## Features
//!
//! - **Webhook Pipeline**: Signature verification, classification, idempotent
//!   persistence, queued processing with retries, dead-letter escalation
//! - **Subscriptions**: Create, update, cancel; validation and gateway
//!   registration
//! - **Recurring Billing**: Scheduler-driven charges with exponential-backoff
//!   payment retries and suspension on exhaustion
//! - **Stores**: Postgres for deployment, in-memory for tests and local runs

pub mod error;
pub mod gateway;
pub mod ingestion;
pub mod jobs;
pub mod models;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod signature;
pub mod store;
pub mod subscriptions;

#[cfg(test)]
mod pipeline_tests;

pub use error::{BillingError, BillingResult};
pub use gateway::{
    ChargeRequest, ChargeResponse, CreateSubscriptionRequest, CreateSubscriptionResponse,
    PaymentGateway, SimulatedGateway,
};
pub use ingestion::{IngestOutcome, WebhookIngestion};
pub use jobs::JobScheduler;
pub use models::{
    BillingInterval, CardDetails, DeadLetter, PaymentRetryState, Subscription,
    SubscriptionStatus, Transaction, TransactionStatus, TransactionType, WebhookEvent,
    WebhookEventStatus, WebhookEventType,
};
pub use processor::WebhookProcessor;
pub use queue::{QueuePassSummary, WebhookQueue};
pub use scheduler::{retry_delay, BillingScheduler, RetryStatistics, TickSummary};
pub use signature::SignatureVerifier;
pub use store::{
    DeadLetterStore, EventFilter, NewWebhookEvent, PaymentRetryStore, QueueCounts,
    SubscriptionStore, TransactionStore, WebhookEventStore,
};
pub use subscriptions::{
    BillingOutcome, CreateSubscriptionParams, SubscriptionService, UpdateSubscriptionParams,
};

use std::sync::Arc;
use std::time::Duration;

use payrail_shared::Config;
use sqlx::PgPool;

/// Backing stores for one assembled [`BillingService`].
pub struct Stores {
    pub events: Arc<dyn WebhookEventStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub retries: Arc<dyn PaymentRetryStore>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            events: Arc::new(store::PgWebhookEventStore::new(pool.clone())),
            dead_letters: Arc::new(store::PgDeadLetterStore::new(pool.clone())),
            subscriptions: Arc::new(store::PgSubscriptionStore::new(pool.clone())),
            transactions: Arc::new(store::PgTransactionStore::new(pool.clone())),
            retries: Arc::new(store::PgPaymentRetryStore::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            events: Arc::new(store::InMemoryWebhookEventStore::new()),
            dead_letters: Arc::new(store::InMemoryDeadLetterStore::new()),
            subscriptions: Arc::new(store::InMemorySubscriptionStore::new()),
            transactions: Arc::new(store::InMemoryTransactionStore::new()),
            retries: Arc::new(store::InMemoryPaymentRetryStore::new()),
        }
    }
}

/// Composition root wiring every billing component to one set of stores and
/// one gateway. Both binaries (API and worker) build one of these.
pub struct BillingService {
    pub verifier: SignatureVerifier,
    pub ingestion: WebhookIngestion,
    pub queue: Arc<WebhookQueue>,
    pub subscriptions: Arc<SubscriptionService>,
    pub scheduler: Arc<BillingScheduler>,
    pub jobs: Arc<JobScheduler>,
    pub events: Arc<dyn WebhookEventStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
}

impl BillingService {
    pub fn new(stores: Stores, gateway: Arc<dyn PaymentGateway>, config: &Config) -> Self {
        let verifier = SignatureVerifier::new(config.webhook_secret.clone());
        let ingestion = WebhookIngestion::new(stores.events.clone(), config.webhook_max_retries);
        let processor = Arc::new(WebhookProcessor::new(
            stores.transactions.clone(),
            stores.subscriptions.clone(),
        ));
        let queue = Arc::new(WebhookQueue::new(
            stores.events.clone(),
            stores.dead_letters.clone(),
            processor,
            config.queue_batch_size,
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            stores.subscriptions.clone(),
            stores.transactions.clone(),
            gateway,
        ));
        let scheduler = Arc::new(BillingScheduler::new(
            stores.subscriptions.clone(),
            stores.retries.clone(),
            subscriptions.clone(),
            config.billing_retry,
        ));
        let jobs = Arc::new(JobScheduler::new(
            scheduler.clone(),
            stores.subscriptions.clone(),
            Duration::from_secs(config.billing_tick_seconds),
            config.billing_scheduler_enabled,
        ));

        Self {
            verifier,
            ingestion,
            queue,
            subscriptions,
            scheduler,
            jobs,
            events: stores.events,
            dead_letters: stores.dead_letters,
        }
    }
}
