//! In-memory store implementations
//!
//! Back the test suite and local development. All claim/dedup semantics match
//! the Postgres implementations: mutations happen under a single lock per
//! store, so concurrent claims and duplicate inserts behave the same way the
//! database constraints make them behave in production.

use std::collections::HashMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    DeadLetter, PaymentRetryState, Subscription, SubscriptionStatus, Transaction,
    TransactionStatus, WebhookEvent, WebhookEventStatus,
};
use crate::store::{
    DeadLetterStore, EventFilter, NewWebhookEvent, PaymentRetryStore, QueueCounts,
    SubscriptionStore, TransactionStore, WebhookEventStore,
};

#[derive(Default)]
pub struct InMemoryWebhookEventStore {
    // Keyed by external event id; the map key is the unique constraint.
    events: Mutex<HashMap<String, WebhookEvent>>,
}

impl InMemoryWebhookEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookEventStore for InMemoryWebhookEventStore {
    async fn insert_if_absent(&self, event: NewWebhookEvent) -> BillingResult<bool> {
        let mut events = self.events.lock().await;
        if events.contains_key(&event.event_id) {
            return Ok(false);
        }
        let now = OffsetDateTime::now_utc();
        events.insert(
            event.event_id.clone(),
            WebhookEvent {
                id: Uuid::new_v4(),
                event_id: event.event_id,
                event_type: event.event_type,
                provider_event_type: event.provider_event_type,
                status: WebhookEventStatus::Pending,
                payload: event.payload,
                source: event.source,
                related_transaction_id: event.related_transaction_id,
                related_subscription_id: event.related_subscription_id,
                retry_count: 0,
                max_retries: event.max_retries,
                next_retry_at: None,
                error_message: None,
                processed_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn find_by_event_id(&self, event_id: &str) -> BillingResult<Option<WebhookEvent>> {
        Ok(self.events.lock().await.get(event_id).cloned())
    }

    async fn claim_due(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let mut events = self.events.lock().await;
        let mut due: Vec<&mut WebhookEvent> = events
            .values_mut()
            .filter(|e| match e.status {
                WebhookEventStatus::Pending => true,
                WebhookEventStatus::Retrying => {
                    e.next_retry_at.map(|t| t <= now).unwrap_or(true)
                }
                _ => false,
            })
            .collect();
        due.sort_by_key(|e| e.created_at);

        let mut claimed = Vec::new();
        for event in due.into_iter().take(limit as usize) {
            event.status = WebhookEventStatus::Processing;
            event.updated_at = now;
            claimed.push(event.clone());
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, id: Uuid, processed_at: OffsetDateTime) -> BillingResult<()> {
        let mut events = self.events.lock().await;
        let event = events
            .values_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| BillingError::NotFound {
                kind: "webhook event",
                id: id.to_string(),
            })?;
        event.status = WebhookEventStatus::Processed;
        event.processed_at = Some(processed_at);
        event.updated_at = processed_at;
        Ok(())
    }

    async fn mark_retrying(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: OffsetDateTime,
        error: &str,
    ) -> BillingResult<()> {
        let mut events = self.events.lock().await;
        let event = events
            .values_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| BillingError::NotFound {
                kind: "webhook event",
                id: id.to_string(),
            })?;
        event.status = WebhookEventStatus::Retrying;
        event.retry_count = retry_count;
        event.next_retry_at = Some(next_retry_at);
        event.error_message = Some(error.to_string());
        event.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, retry_count: u32, error: &str) -> BillingResult<()> {
        let mut events = self.events.lock().await;
        let event = events
            .values_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| BillingError::NotFound {
                kind: "webhook event",
                id: id.to_string(),
            })?;
        event.status = WebhookEventStatus::Failed;
        event.retry_count = retry_count;
        event.error_message = Some(error.to_string());
        event.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn list(
        &self,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> BillingResult<(Vec<WebhookEvent>, u64)> {
        let events = self.events.lock().await;
        let mut matching: Vec<WebhookEvent> = events
            .values()
            .filter(|e| filter.status.map(|s| e.status == s).unwrap_or(true))
            .filter(|e| filter.event_type.map(|t| e.event_type == t).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn count_by_status(&self) -> BillingResult<QueueCounts> {
        let events = self.events.lock().await;
        let mut counts = QueueCounts::default();
        for event in events.values() {
            match event.status {
                WebhookEventStatus::Pending | WebhookEventStatus::Retrying => counts.waiting += 1,
                WebhookEventStatus::Processing => counts.active += 1,
                WebhookEventStatus::Processed => counts.completed += 1,
                WebhookEventStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    letters: Mutex<VecDeque<DeadLetter>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn push(&self, letter: DeadLetter) -> BillingResult<()> {
        self.letters.lock().await.push_back(letter);
        Ok(())
    }

    async fn list(&self, limit: u32) -> BillingResult<Vec<DeadLetter>> {
        Ok(self
            .letters
            .lock()
            .await
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count(&self) -> BillingResult<u64> {
        Ok(self.letters.lock().await.len() as u64)
    }

    async fn prune_older_than(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let mut letters = self.letters.lock().await;
        let before = letters.len();
        letters.retain(|l| l.failed_at >= cutoff);
        Ok((before - letters.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: Mutex<HashMap<Uuid, Subscription>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn insert(&self, subscription: &Subscription) -> BillingResult<()> {
        self.subscriptions
            .lock()
            .await
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.subscriptions.lock().await.get(&id).cloned())
    }

    async fn find_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .lock()
            .await
            .values()
            .find(|s| s.gateway_subscription_id.as_deref() == Some(gateway_id))
            .cloned())
    }

    async fn update(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.contains_key(&subscription.id) {
            return Err(BillingError::NotFound {
                kind: "subscription",
                id: subscription.id.to_string(),
            });
        }
        let mut updated = subscription.clone();
        updated.updated_at = OffsetDateTime::now_utc();
        subscriptions.insert(subscription.id, updated);
        Ok(())
    }

    async fn list_by_customer(&self, customer_email: &str) -> BillingResult<Vec<Subscription>> {
        let mut matching: Vec<Subscription> = self
            .subscriptions
            .lock()
            .await
            .values()
            .filter(|s| s.customer_email.eq_ignore_ascii_case(customer_email))
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.created_at);
        Ok(matching)
    }

    async fn list_due_for_billing(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let mut due: Vec<Subscription> = self
            .subscriptions
            .lock()
            .await
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.next_billing_date <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_billing_date);
        Ok(due)
    }

    async fn advance_billing_cycle(
        &self,
        id: Uuid,
        expected_next_billing: OffsetDateTime,
        new_next_billing: OffsetDateTime,
        billed_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(subscription) = subscriptions.get_mut(&id) else {
            return Ok(false);
        };
        if subscription.next_billing_date != expected_next_billing {
            return Ok(false);
        }
        subscription.billing_cycles_completed += 1;
        subscription.last_billing_date = Some(billed_at);
        subscription.next_billing_date = new_next_billing;
        subscription.updated_at = billed_at;
        Ok(true)
    }

    async fn set_status_by_gateway_id(
        &self,
        gateway_id: &str,
        status: SubscriptionStatus,
    ) -> BillingResult<bool> {
        let mut subscriptions = self.subscriptions.lock().await;
        match subscriptions
            .values_mut()
            .find(|s| s.gateway_subscription_id.as_deref() == Some(gateway_id))
        {
            Some(subscription) => {
                subscription.status = status;
                subscription.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cancel_by_gateway_id(
        &self,
        gateway_id: &str,
        reason: &str,
        cancelled_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut subscriptions = self.subscriptions.lock().await;
        match subscriptions
            .values_mut()
            .find(|s| s.gateway_subscription_id.as_deref() == Some(gateway_id))
        {
            Some(subscription) => {
                subscription.status = SubscriptionStatus::Cancelled;
                subscription.cancellation_reason = Some(reason.to_string());
                subscription.cancelled_at = Some(cancelled_at);
                subscription.updated_at = cancelled_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn suspend(
        &self,
        id: Uuid,
        reason: &str,
        last_error: &str,
        suspended_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(subscription) = subscriptions.get_mut(&id) else {
            return Ok(false);
        };
        subscription.status = SubscriptionStatus::Suspended;
        if let Some(map) = subscription.metadata.as_object_mut() {
            map.insert("suspension_reason".into(), reason.into());
            map.insert(
                "suspended_at".into(),
                suspended_at.unix_timestamp().into(),
            );
            map.insert("last_payment_error".into(), last_error.into());
        } else {
            subscription.metadata = serde_json::json!({
                "suspension_reason": reason,
                "suspended_at": suspended_at.unix_timestamp(),
                "last_payment_error": last_error,
            });
        }
        subscription.updated_at = suspended_at;
        Ok(true)
    }

    async fn mark_expired(&self, id: Uuid) -> BillingResult<bool> {
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(subscription) = subscriptions.get_mut(&id) else {
            return Ok(false);
        };
        subscription.status = SubscriptionStatus::Expired;
        subscription.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }
}

#[derive(Default)]
pub struct InMemoryTransactionStore {
    transactions: Mutex<HashMap<Uuid, Transaction>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All transactions recorded against a subscription, oldest first.
    pub async fn list_for_subscription(&self, subscription_id: Uuid) -> Vec<Transaction> {
        let mut matching: Vec<Transaction> = self
            .transactions
            .lock()
            .await
            .values()
            .filter(|t| t.subscription_id == Some(subscription_id))
            .cloned()
            .collect();
        matching.sort_by_key(|t| t.created_at);
        matching
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, transaction: &Transaction) -> BillingResult<()> {
        self.transactions
            .lock()
            .await
            .insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> BillingResult<Option<Transaction>> {
        Ok(self.transactions.lock().await.get(&id).cloned())
    }

    async fn find_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> BillingResult<Option<Transaction>> {
        Ok(self
            .transactions
            .lock()
            .await
            .values()
            .find(|t| t.gateway_transaction_id.as_deref() == Some(gateway_id))
            .cloned())
    }

    async fn set_status_by_gateway_id(
        &self,
        gateway_id: &str,
        status: TransactionStatus,
        failure_reason: Option<&str>,
    ) -> BillingResult<bool> {
        let mut transactions = self.transactions.lock().await;
        match transactions
            .values_mut()
            .find(|t| t.gateway_transaction_id.as_deref() == Some(gateway_id))
        {
            Some(transaction) => {
                if transaction.status.is_terminal() && transaction.status != status {
                    tracing::warn!(
                        gateway_transaction_id = %gateway_id,
                        current = %transaction.status,
                        requested = %status,
                        "Refusing status change on terminal transaction"
                    );
                    return Ok(true);
                }
                transaction.status = status;
                if let Some(reason) = failure_reason {
                    transaction.failure_reason = Some(reason.to_string());
                }
                transaction.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn annotate_chargeback(
        &self,
        gateway_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut transactions = self.transactions.lock().await;
        match transactions
            .values_mut()
            .find(|t| t.gateway_transaction_id.as_deref() == Some(gateway_id))
        {
            Some(transaction) => {
                transaction.chargeback_at = Some(at);
                transaction.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryPaymentRetryStore {
    entries: Mutex<HashMap<Uuid, PaymentRetryState>>,
}

impl InMemoryPaymentRetryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentRetryStore for InMemoryPaymentRetryStore {
    async fn upsert(&self, state: &PaymentRetryState) -> BillingResult<()> {
        self.entries
            .lock()
            .await
            .insert(state.subscription_id, state.clone());
        Ok(())
    }

    async fn get(&self, subscription_id: Uuid) -> BillingResult<Option<PaymentRetryState>> {
        Ok(self.entries.lock().await.get(&subscription_id).cloned())
    }

    async fn remove(&self, subscription_id: Uuid) -> BillingResult<bool> {
        Ok(self.entries.lock().await.remove(&subscription_id).is_some())
    }

    async fn list_due(&self, now: OffsetDateTime) -> BillingResult<Vec<PaymentRetryState>> {
        let mut due: Vec<PaymentRetryState> = self
            .entries
            .lock()
            .await
            .values()
            .filter(|e| e.next_retry_date <= now)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_retry_date);
        Ok(due)
    }

    async fn list_all(&self) -> BillingResult<Vec<PaymentRetryState>> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::WebhookEventType;
    use std::sync::Arc;

    fn new_event(event_id: &str) -> NewWebhookEvent {
        NewWebhookEvent {
            event_id: event_id.to_string(),
            event_type: WebhookEventType::PaymentCompleted,
            provider_event_type: "payment.completed".to_string(),
            payload: serde_json::json!({"id": event_id}),
            source: "test".to_string(),
            related_transaction_id: None,
            related_subscription_id: None,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn duplicate_event_id_inserts_once() {
        let store = InMemoryWebhookEventStore::new();
        assert!(store.insert_if_absent(new_event("evt_1")).await.unwrap());
        assert!(!store.insert_if_absent(new_event("evt_1")).await.unwrap());

        let (_, total) = store.list(&EventFilter::default(), 10, 0).await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn concurrent_duplicate_delivery_claims_one_insert() {
        let store = Arc::new(InMemoryWebhookEventStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.insert_if_absent(new_event("evt_race")).await.unwrap()
            }));
        }
        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1, "exactly one delivery may win the insert");
    }

    #[tokio::test]
    async fn claim_due_is_exclusive() {
        let store = Arc::new(InMemoryWebhookEventStore::new());
        store.insert_if_absent(new_event("evt_1")).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let first = store.claim_due(now, 10).await.unwrap();
        let second = store.claim_due(now, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty(), "a processing event cannot be re-claimed");
    }

    #[tokio::test]
    async fn retrying_event_not_due_until_next_retry_at() {
        let store = InMemoryWebhookEventStore::new();
        store.insert_if_absent(new_event("evt_1")).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let claimed = store.claim_due(now, 10).await.unwrap();
        let id = claimed[0].id;
        store
            .mark_retrying(id, 1, now + time::Duration::seconds(60), "boom")
            .await
            .unwrap();

        assert!(store.claim_due(now, 10).await.unwrap().is_empty());
        let later = now + time::Duration::seconds(61);
        assert_eq!(store.claim_due(later, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn advance_billing_cycle_rejects_stale_expectation() {
        use crate::models::{BillingInterval, Subscription, SubscriptionStatus};

        let store = InMemorySubscriptionStore::new();
        let now = OffsetDateTime::now_utc();
        let sub = Subscription {
            id: Uuid::new_v4(),
            gateway_subscription_id: None,
            customer_email: "c@example.test".into(),
            customer_name: "C".into(),
            status: SubscriptionStatus::Active,
            plan_name: "basic".into(),
            amount_cents: 1000,
            currency: "USD".into(),
            billing_interval: BillingInterval::Monthly,
            start_date: now,
            end_date: None,
            next_billing_date: now,
            last_billing_date: None,
            billing_cycles_completed: 0,
            total_billing_cycles: None,
            card_last_four: None,
            card_type: None,
            metadata: serde_json::json!({}),
            cancellation_reason: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };
        store.insert(&sub).await.unwrap();

        let new_next = BillingInterval::Monthly.advance(now);
        assert!(store
            .advance_billing_cycle(sub.id, now, new_next, now)
            .await
            .unwrap());
        // Second advance with the stale expected date must refuse.
        assert!(!store
            .advance_billing_cycle(sub.id, now, new_next, now)
            .await
            .unwrap());

        let stored = store.find(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.billing_cycles_completed, 1);
        assert_eq!(stored.next_billing_date, new_next);
    }
}
