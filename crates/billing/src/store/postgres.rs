//! Postgres store implementations
//!
//! The database constraints carry the correctness load: the unique index on
//! `webhook_events.event_id` makes ingestion dedup race-free, `FOR UPDATE
//! SKIP LOCKED` makes processing claims exclusive across workers, and the
//! `WHERE next_billing_date = $expected` guard makes cycle advancement an
//! optimistic write instead of a lost-update hazard.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingInterval, DeadLetter, PaymentRetryState, Subscription, SubscriptionStatus,
    Transaction, TransactionStatus, TransactionType, WebhookEvent, WebhookEventStatus,
    WebhookEventType,
};
use crate::store::{
    DeadLetterStore, EventFilter, NewWebhookEvent, PaymentRetryStore, QueueCounts,
    SubscriptionStore, TransactionStore, WebhookEventStore,
};

/// Apply the schema migrations bundled with this crate.
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| BillingError::Store(e.to_string()))
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    event_id: String,
    event_type: String,
    provider_event_type: String,
    status: String,
    payload: serde_json::Value,
    source: String,
    related_transaction_id: Option<String>,
    related_subscription_id: Option<String>,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<OffsetDateTime>,
    error_message: Option<String>,
    processed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<EventRow> for WebhookEvent {
    type Error = BillingError;

    fn try_from(row: EventRow) -> BillingResult<Self> {
        Ok(WebhookEvent {
            id: row.id,
            event_id: row.event_id,
            event_type: WebhookEventType::parse(&row.event_type)?,
            provider_event_type: row.provider_event_type,
            status: WebhookEventStatus::parse(&row.status)?,
            payload: row.payload,
            source: row.source,
            related_transaction_id: row.related_transaction_id,
            related_subscription_id: row.related_subscription_id,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            next_retry_at: row.next_retry_at,
            error_message: row.error_message,
            processed_at: row.processed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const EVENT_COLUMNS: &str = "id, event_id, event_type, provider_event_type, status, payload, \
     source, related_transaction_id, related_subscription_id, retry_count, max_retries, \
     next_retry_at, error_message, processed_at, created_at, updated_at";

pub struct PgWebhookEventStore {
    pool: PgPool,
}

impl PgWebhookEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventStore for PgWebhookEventStore {
    async fn insert_if_absent(&self, event: NewWebhookEvent) -> BillingResult<bool> {
        // ON CONFLICT DO NOTHING + RETURNING: the insert either claims the
        // event id or reports the duplicate, atomically.
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (id, event_id, event_type, provider_event_type, status, payload, source,
                 related_transaction_id, related_subscription_id, retry_count, max_retries)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, 0, $9)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.event_id)
        .bind(event.event_type.as_str())
        .bind(&event.provider_event_type)
        .bind(&event.payload)
        .bind(&event.source)
        .bind(&event.related_transaction_id)
        .bind(&event.related_subscription_id)
        .bind(event.max_retries as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted.is_some())
    }

    async fn find_by_event_id(&self, event_id: &str) -> BillingResult<Option<WebhookEvent>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE event_id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookEvent::try_from).transpose()
    }

    async fn claim_due(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            UPDATE webhook_events
            SET status = 'processing', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM webhook_events
                WHERE status = 'pending'
                   OR (status = 'retrying'
                       AND (next_retry_at IS NULL OR next_retry_at <= $1))
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookEvent::try_from).collect()
    }

    async fn mark_processed(&self, id: Uuid, processed_at: OffsetDateTime) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processed', processed_at = $2, error_message = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_retrying(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: OffsetDateTime,
        error: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'retrying', retry_count = $2, next_retry_at = $3,
                error_message = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_count as i32)
        .bind(next_retry_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, retry_count: u32, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'failed', retry_count = $2, error_message = $3,
                next_retry_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_count as i32)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(
        &self,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> BillingResult<(Vec<WebhookEvent>, u64)> {
        let status = filter.status.map(|s| s.as_str());
        let event_type = filter.event_type.map(|t| t.as_str());

        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM webhook_events
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR event_type = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(status)
        .bind(event_type)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM webhook_events
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR event_type = $2)
            "#,
        )
        .bind(status)
        .bind(event_type)
        .fetch_one(&self.pool)
        .await?;

        let events = rows
            .into_iter()
            .map(WebhookEvent::try_from)
            .collect::<BillingResult<Vec<_>>>()?;
        Ok((events, total.max(0) as u64))
    }

    async fn count_by_status(&self) -> BillingResult<QueueCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM webhook_events GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.as_str() {
                "pending" | "retrying" => counts.waiting += count,
                "processing" => counts.active += count,
                "processed" => counts.completed += count,
                "failed" => counts.failed += count,
                _ => {}
            }
        }
        Ok(counts)
    }
}

pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn push(&self, letter: DeadLetter) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_dead_letters
                (event_id, event_type, payload, error, total_attempts, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&letter.event_id)
        .bind(letter.event_type.as_str())
        .bind(&letter.payload)
        .bind(&letter.error)
        .bind(letter.total_attempts as i32)
        .bind(letter.failed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, limit: u32) -> BillingResult<Vec<DeadLetter>> {
        let rows: Vec<(String, String, serde_json::Value, String, i32, OffsetDateTime)> =
            sqlx::query_as(
                r#"
                SELECT event_id, event_type, payload, error, total_attempts, failed_at
                FROM webhook_dead_letters
                ORDER BY failed_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(event_id, event_type, payload, error, attempts, failed_at)| {
                Ok(DeadLetter {
                    event_id,
                    event_type: WebhookEventType::parse(&event_type)?,
                    payload,
                    error,
                    total_attempts: attempts.max(0) as u32,
                    failed_at,
                })
            })
            .collect()
    }

    async fn count(&self) -> BillingResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM webhook_dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn prune_older_than(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM webhook_dead_letters WHERE failed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    gateway_subscription_id: Option<String>,
    customer_email: String,
    customer_name: String,
    status: String,
    plan_name: String,
    amount_cents: i64,
    currency: String,
    billing_interval: String,
    start_date: OffsetDateTime,
    end_date: Option<OffsetDateTime>,
    next_billing_date: OffsetDateTime,
    last_billing_date: Option<OffsetDateTime>,
    billing_cycles_completed: i32,
    total_billing_cycles: Option<i32>,
    card_last_four: Option<String>,
    card_type: Option<String>,
    metadata: serde_json::Value,
    cancellation_reason: Option<String>,
    cancelled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            id: row.id,
            gateway_subscription_id: row.gateway_subscription_id,
            customer_email: row.customer_email,
            customer_name: row.customer_name,
            status: SubscriptionStatus::parse(&row.status)?,
            plan_name: row.plan_name,
            amount_cents: row.amount_cents,
            currency: row.currency,
            billing_interval: BillingInterval::parse(&row.billing_interval)?,
            start_date: row.start_date,
            end_date: row.end_date,
            next_billing_date: row.next_billing_date,
            last_billing_date: row.last_billing_date,
            billing_cycles_completed: row.billing_cycles_completed.max(0) as u32,
            total_billing_cycles: row.total_billing_cycles.map(|c| c.max(0) as u32),
            card_last_four: row.card_last_four,
            card_type: row.card_type,
            metadata: row.metadata,
            cancellation_reason: row.cancellation_reason,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, gateway_subscription_id, customer_email, customer_name, \
     status, plan_name, amount_cents, currency, billing_interval, start_date, end_date, \
     next_billing_date, last_billing_date, billing_cycles_completed, total_billing_cycles, \
     card_last_four, card_type, metadata, cancellation_reason, cancelled_at, created_at, \
     updated_at";

pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn insert(&self, s: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, gateway_subscription_id, customer_email, customer_name, status,
                 plan_name, amount_cents, currency, billing_interval, start_date, end_date,
                 next_billing_date, last_billing_date, billing_cycles_completed,
                 total_billing_cycles, card_last_four, card_type, metadata,
                 cancellation_reason, cancelled_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22)
            "#,
        )
        .bind(s.id)
        .bind(&s.gateway_subscription_id)
        .bind(&s.customer_email)
        .bind(&s.customer_name)
        .bind(s.status.as_str())
        .bind(&s.plan_name)
        .bind(s.amount_cents)
        .bind(&s.currency)
        .bind(s.billing_interval.as_str())
        .bind(s.start_date)
        .bind(s.end_date)
        .bind(s.next_billing_date)
        .bind(s.last_billing_date)
        .bind(s.billing_cycles_completed as i32)
        .bind(s.total_billing_cycles.map(|c| c as i32))
        .bind(&s.card_last_four)
        .bind(&s.card_type)
        .bind(&s.metadata)
        .bind(&s.cancellation_reason)
        .bind(s.cancelled_at)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn find_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE gateway_subscription_id = $1"
        ))
        .bind(gateway_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn update(&self, s: &Subscription) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET gateway_subscription_id = $2, customer_email = $3, customer_name = $4,
                status = $5, plan_name = $6, amount_cents = $7, currency = $8,
                billing_interval = $9, end_date = $10, next_billing_date = $11,
                last_billing_date = $12, billing_cycles_completed = $13,
                total_billing_cycles = $14, card_last_four = $15, card_type = $16,
                metadata = $17, cancellation_reason = $18, cancelled_at = $19,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(s.id)
        .bind(&s.gateway_subscription_id)
        .bind(&s.customer_email)
        .bind(&s.customer_name)
        .bind(s.status.as_str())
        .bind(&s.plan_name)
        .bind(s.amount_cents)
        .bind(&s.currency)
        .bind(s.billing_interval.as_str())
        .bind(s.end_date)
        .bind(s.next_billing_date)
        .bind(s.last_billing_date)
        .bind(s.billing_cycles_completed as i32)
        .bind(s.total_billing_cycles.map(|c| c as i32))
        .bind(&s.card_last_four)
        .bind(&s.card_type)
        .bind(&s.metadata)
        .bind(&s.cancellation_reason)
        .bind(s.cancelled_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound {
                kind: "subscription",
                id: s.id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_by_customer(&self, customer_email: &str) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE LOWER(customer_email) = LOWER($1)
            ORDER BY created_at
            "#
        ))
        .bind(customer_email)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn list_due_for_billing(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE status = 'active' AND next_billing_date <= $1
            ORDER BY next_billing_date
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn advance_billing_cycle(
        &self,
        id: Uuid,
        expected_next_billing: OffsetDateTime,
        new_next_billing: OffsetDateTime,
        billed_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        // Optimistic write keyed on the previous next_billing_date; a
        // concurrent tick that already advanced the cycle makes this a no-op.
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET billing_cycles_completed = billing_cycles_completed + 1,
                last_billing_date = $4,
                next_billing_date = $3,
                updated_at = NOW()
            WHERE id = $1 AND next_billing_date = $2
            "#,
        )
        .bind(id)
        .bind(expected_next_billing)
        .bind(new_next_billing)
        .bind(billed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_status_by_gateway_id(
        &self,
        gateway_id: &str,
        status: SubscriptionStatus,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = $2, updated_at = NOW() \
             WHERE gateway_subscription_id = $1",
        )
        .bind(gateway_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel_by_gateway_id(
        &self,
        gateway_id: &str,
        reason: &str,
        cancelled_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled', cancellation_reason = $2, cancelled_at = $3,
                updated_at = NOW()
            WHERE gateway_subscription_id = $1
            "#,
        )
        .bind(gateway_id)
        .bind(reason)
        .bind(cancelled_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn suspend(
        &self,
        id: Uuid,
        reason: &str,
        last_error: &str,
        suspended_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'suspended',
                metadata = metadata || jsonb_build_object(
                    'suspension_reason', $2::TEXT,
                    'suspended_at', EXTRACT(EPOCH FROM $4::TIMESTAMPTZ)::BIGINT,
                    'last_payment_error', $3::TEXT),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(last_error)
        .bind(suspended_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_expired(&self, id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = 'expired', updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    gateway_transaction_id: Option<String>,
    transaction_type: String,
    status: String,
    amount_cents: i64,
    currency: String,
    customer_email: String,
    card_last_four: Option<String>,
    card_type: Option<String>,
    description: Option<String>,
    failure_reason: Option<String>,
    reference_transaction_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    chargeback_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> BillingResult<Self> {
        Ok(Transaction {
            id: row.id,
            gateway_transaction_id: row.gateway_transaction_id,
            transaction_type: TransactionType::parse(&row.transaction_type)?,
            status: TransactionStatus::parse(&row.status)?,
            amount_cents: row.amount_cents,
            currency: row.currency,
            customer_email: row.customer_email,
            card_last_four: row.card_last_four,
            card_type: row.card_type,
            description: row.description,
            failure_reason: row.failure_reason,
            reference_transaction_id: row.reference_transaction_id,
            subscription_id: row.subscription_id,
            chargeback_at: row.chargeback_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const TRANSACTION_COLUMNS: &str = "id, gateway_transaction_id, transaction_type, status, \
     amount_cents, currency, customer_email, card_last_four, card_type, description, \
     failure_reason, reference_transaction_id, subscription_id, chargeback_at, created_at, \
     updated_at";

pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn insert(&self, t: &Transaction) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions
                (id, gateway_transaction_id, transaction_type, status, amount_cents,
                 currency, customer_email, card_last_four, card_type, description,
                 failure_reason, reference_transaction_id, subscription_id, chargeback_at,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(t.id)
        .bind(&t.gateway_transaction_id)
        .bind(t.transaction_type.as_str())
        .bind(t.status.as_str())
        .bind(t.amount_cents)
        .bind(&t.currency)
        .bind(&t.customer_email)
        .bind(&t.card_last_four)
        .bind(&t.card_type)
        .bind(&t.description)
        .bind(&t.failure_reason)
        .bind(t.reference_transaction_id)
        .bind(t.subscription_id)
        .bind(t.chargeback_at)
        .bind(t.created_at)
        .bind(t.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Transaction::try_from).transpose()
    }

    async fn find_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE gateway_transaction_id = $1"
        ))
        .bind(gateway_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Transaction::try_from).transpose()
    }

    async fn set_status_by_gateway_id(
        &self,
        gateway_id: &str,
        status: TransactionStatus,
        failure_reason: Option<&str>,
    ) -> BillingResult<bool> {
        // Terminal rows stay immutable; the guard keeps late webhooks from
        // rewriting settled history.
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $2,
                failure_reason = COALESCE($3, failure_reason),
                updated_at = NOW()
            WHERE gateway_transaction_id = $1
              AND (status IN ('pending', 'processing') OR status = $2)
            "#,
        )
        .bind(gateway_id)
        .bind(status.as_str())
        .bind(failure_reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Distinguish "unknown transaction" from "terminal, refused".
        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM transactions WHERE gateway_transaction_id = $1")
                .bind(gateway_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(exists.is_some())
    }

    async fn annotate_chargeback(
        &self,
        gateway_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE transactions SET chargeback_at = $2, updated_at = NOW() \
             WHERE gateway_transaction_id = $1",
        )
        .bind(gateway_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

pub struct PgPaymentRetryStore {
    pool: PgPool,
}

impl PgPaymentRetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type RetryRow = (Uuid, i32, OffsetDateTime, String, OffsetDateTime);

fn retry_from_row(
    (subscription_id, attempt_count, next_retry_date, last_error, created_at): RetryRow,
) -> PaymentRetryState {
    PaymentRetryState {
        subscription_id,
        attempt_count: attempt_count.max(0) as u32,
        next_retry_date,
        last_error,
        created_at,
    }
}

#[async_trait]
impl PaymentRetryStore for PgPaymentRetryStore {
    async fn upsert(&self, state: &PaymentRetryState) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_retries
                (subscription_id, attempt_count, next_retry_date, last_error, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (subscription_id) DO UPDATE SET
                attempt_count = EXCLUDED.attempt_count,
                next_retry_date = EXCLUDED.next_retry_date,
                last_error = EXCLUDED.last_error
            "#,
        )
        .bind(state.subscription_id)
        .bind(state.attempt_count as i32)
        .bind(state.next_retry_date)
        .bind(&state.last_error)
        .bind(state.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, subscription_id: Uuid) -> BillingResult<Option<PaymentRetryState>> {
        let row: Option<RetryRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, attempt_count, next_retry_date, last_error, created_at
            FROM payment_retries WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(retry_from_row))
    }

    async fn remove(&self, subscription_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query("DELETE FROM payment_retries WHERE subscription_id = $1")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_due(&self, now: OffsetDateTime) -> BillingResult<Vec<PaymentRetryState>> {
        let rows: Vec<RetryRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, attempt_count, next_retry_date, last_error, created_at
            FROM payment_retries
            WHERE next_retry_date <= $1
            ORDER BY next_retry_date
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(retry_from_row).collect())
    }

    async fn list_all(&self) -> BillingResult<Vec<PaymentRetryState>> {
        let rows: Vec<RetryRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, attempt_count, next_retry_date, last_error, created_at
            FROM payment_retries
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(retry_from_row).collect())
    }
}
