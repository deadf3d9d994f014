//! End-to-end webhook pipeline tests
//!
//! Exercise the assembled service: verified ingestion through the queue into
//! record updates, duplicate deliveries, and dead-letter escalation.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use time::OffsetDateTime;
use uuid::Uuid;

use payrail_shared::{Config, RetryDefaults};

use crate::error::{BillingError, BillingResult};
use crate::gateway::SimulatedGateway;
use crate::ingestion::IngestOutcome;
use crate::models::{
    Transaction, TransactionStatus, TransactionType, WebhookEventStatus, WebhookEventType,
};
use crate::store::{
    InMemoryDeadLetterStore, InMemoryPaymentRetryStore, InMemorySubscriptionStore,
    InMemoryTransactionStore, InMemoryWebhookEventStore, TransactionStore,
};
use crate::{BillingService, Stores};

fn test_config(secret: Option<&str>) -> Config {
    Config {
        database_url: "postgres://unused".into(),
        webhook_secret: secret.map(str::to_string),
        gateway_api_login_id: None,
        gateway_transaction_key: None,
        webhook_max_retries: 3,
        billing_retry: RetryDefaults::default(),
        billing_scheduler_enabled: false,
        billing_tick_seconds: 60,
        queue_poll_seconds: 5,
        queue_batch_size: 20,
        port: 0,
    }
}

fn memory_stores() -> (Stores, Arc<InMemoryTransactionStore>) {
    let transactions = Arc::new(InMemoryTransactionStore::new());
    let stores = Stores {
        events: Arc::new(InMemoryWebhookEventStore::new()),
        dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
        subscriptions: Arc::new(InMemorySubscriptionStore::new()),
        transactions: transactions.clone(),
        retries: Arc::new(InMemoryPaymentRetryStore::new()),
    };
    (stores, transactions)
}

fn service(secret: Option<&str>) -> (BillingService, Arc<InMemoryTransactionStore>) {
    let (stores, transactions) = memory_stores();
    let service = BillingService::new(stores, Arc::new(SimulatedGateway), &test_config(secret));
    (service, transactions)
}

fn sign(secret: &str, body: &[u8]) -> String {
    #[allow(clippy::unwrap_used)]
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha512={}", hex::encode(mac.finalize().into_bytes()))
}

async fn seed_pending_transaction(
    transactions: &InMemoryTransactionStore,
    gateway_id: &str,
) {
    let now = OffsetDateTime::now_utc();
    transactions
        .insert(&Transaction {
            id: Uuid::new_v4(),
            gateway_transaction_id: Some(gateway_id.to_string()),
            transaction_type: TransactionType::Payment,
            status: TransactionStatus::Pending,
            amount_cents: 2999,
            currency: "USD".into(),
            customer_email: "jo@example.com".into(),
            card_last_four: Some("1111".into()),
            card_type: Some("visa".into()),
            description: None,
            failure_reason: None,
            reference_transaction_id: None,
            subscription_id: None,
            chargeback_at: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn verified_webhook_flows_through_to_the_transaction() {
    let secret = "pipeline-secret";
    let (service, transactions) = service(Some(secret));
    seed_pending_transaction(&transactions, "T500").await;

    let body = br#"{"eventType":"payment.completed","id":"evt_flow","payload":{"transId":"T500"}}"#;
    let header = sign(secret, body);

    service.verifier.verify(body, Some(&header)).unwrap();
    let outcome = service.ingestion.ingest("authnet", body).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Accepted { .. }));

    let summary = service.queue.run_once(OffsetDateTime::now_utc()).await.unwrap();
    assert_eq!(summary.processed, 1);

    let event = service.events.find_by_event_id("evt_flow").await.unwrap().unwrap();
    assert_eq!(event.status, WebhookEventStatus::Processed);

    let txn = transactions.find_by_gateway_id("T500").await.unwrap().unwrap();
    assert_eq!(txn.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn tampered_body_never_reaches_ingestion() {
    let secret = "pipeline-secret";
    let (service, _) = service(Some(secret));

    let body = br#"{"eventType":"payment.completed","id":"evt_t","payload":{}}"#;
    let header = sign(secret, body);
    let mut tampered = body.to_vec();
    tampered[10] ^= 1;

    let err = service.verifier.verify(&tampered, Some(&header)).unwrap_err();
    assert!(matches!(err, BillingError::SignatureInvalid));
}

#[tokio::test]
async fn duplicate_delivery_processes_once() {
    let (service, transactions) = service(None);
    seed_pending_transaction(&transactions, "T501").await;

    let body = br#"{"eventType":"payment.completed","id":"evt_dup","payload":{"transId":"T501"}}"#;
    let first = service.ingestion.ingest("authnet", body).await.unwrap();
    let second = service.ingestion.ingest("authnet", body).await.unwrap();
    assert!(matches!(first, IngestOutcome::Accepted { .. }));
    assert!(matches!(second, IngestOutcome::Duplicate { .. }));

    let summary = service.queue.run_once(OffsetDateTime::now_utc()).await.unwrap();
    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.processed, 1);

    // Nothing left to claim.
    let summary = service.queue.run_once(OffsetDateTime::now_utc()).await.unwrap();
    assert_eq!(summary.claimed, 0);
}

/// Transaction store whose webhook-facing update always errors, to drive the
/// queue's failure path.
struct BrokenTransactionStore;

#[async_trait]
impl TransactionStore for BrokenTransactionStore {
    async fn insert(&self, _transaction: &Transaction) -> BillingResult<()> {
        Err(BillingError::Internal("induced failure".into()))
    }

    async fn find(&self, _id: Uuid) -> BillingResult<Option<Transaction>> {
        Ok(None)
    }

    async fn find_by_gateway_id(&self, _gateway_id: &str) -> BillingResult<Option<Transaction>> {
        Ok(None)
    }

    async fn set_status_by_gateway_id(
        &self,
        _gateway_id: &str,
        _status: TransactionStatus,
        _failure_reason: Option<&str>,
    ) -> BillingResult<bool> {
        Err(BillingError::Internal("induced failure".into()))
    }

    async fn annotate_chargeback(
        &self,
        _gateway_id: &str,
        _at: OffsetDateTime,
    ) -> BillingResult<bool> {
        Err(BillingError::Internal("induced failure".into()))
    }
}

#[tokio::test]
async fn exhausted_event_lands_in_the_dead_letter_queue() {
    let stores = Stores {
        events: Arc::new(InMemoryWebhookEventStore::new()),
        dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
        subscriptions: Arc::new(InMemorySubscriptionStore::new()),
        transactions: Arc::new(BrokenTransactionStore),
        retries: Arc::new(InMemoryPaymentRetryStore::new()),
    };
    let service = BillingService::new(stores, Arc::new(SimulatedGateway), &test_config(None));

    let body = br#"{"eventType":"payment.completed","id":"evt_doom","payload":{"transId":"T1"}}"#;
    service.ingestion.ingest("authnet", body).await.unwrap();

    let mut now = OffsetDateTime::now_utc();
    // First two failures reschedule with a growing delay.
    for expected_retry in 1u32..=2 {
        let summary = service.queue.run_once(now).await.unwrap();
        assert_eq!(summary.retried, 1, "attempt {expected_retry}");

        let event = service.events.find_by_event_id("evt_doom").await.unwrap().unwrap();
        assert_eq!(event.status, WebhookEventStatus::Retrying);
        assert_eq!(event.retry_count, expected_retry);
        assert_eq!(
            event.next_retry_at,
            Some(now + time::Duration::seconds(60 * expected_retry as i64))
        );
        now = event.next_retry_at.unwrap();
    }

    // Third failure exhausts the budget.
    let summary = service.queue.run_once(now).await.unwrap();
    assert_eq!(summary.dead_lettered, 1);

    let event = service.events.find_by_event_id("evt_doom").await.unwrap().unwrap();
    assert_eq!(event.status, WebhookEventStatus::Failed);
    assert_eq!(event.retry_count, 3);

    let letters = service.dead_letters.list(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].event_id, "evt_doom");
    assert_eq!(letters[0].event_type, WebhookEventType::PaymentCompleted);
    assert_eq!(letters[0].total_attempts, 3);
    assert!(letters[0].error.contains("induced failure"));
}

#[tokio::test]
async fn subscription_cancellation_webhook_cancels_the_record() {
    let (service, _) = service(None);
    let created = service
        .subscriptions
        .create(crate::subscriptions::CreateSubscriptionParams {
            customer_email: "jo@example.com".into(),
            customer_name: "Jo Doe".into(),
            plan_name: "pro-monthly".into(),
            amount_cents: 2999,
            currency: "USD".into(),
            billing_interval: crate::models::BillingInterval::Monthly,
            start_date: None,
            total_billing_cycles: None,
            card: crate::models::CardDetails {
                card_number: "4111111111111111".into(),
                expiry_month: 12,
                expiry_year: 2030,
                cvv: "123".into(),
            },
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();
    let gateway_id = created.gateway_subscription_id.clone().unwrap();

    let body = serde_json::json!({
        "eventType": "subscription.cancelled",
        "id": "evt_cancel",
        "payload": {"subscriptionId": gateway_id, "reason": "customer request"},
    });
    service
        .ingestion
        .ingest("authnet", body.to_string().as_bytes())
        .await
        .unwrap();
    service.queue.run_once(OffsetDateTime::now_utc()).await.unwrap();

    let after = service.subscriptions.get(created.id).await.unwrap();
    assert_eq!(after.status, crate::models::SubscriptionStatus::Cancelled);
    assert_eq!(after.cancellation_reason.as_deref(), Some("customer request"));
}
