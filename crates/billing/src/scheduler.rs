//! Recurring billing scheduler
//!
//! Each tick makes two passes: active subscriptions whose `next_billing_date`
//! has arrived, then payment-retry entries that have come due. A subscription
//! with an open retry entry is owned by the retry pass; the regular pass
//! skips it so a failed charge is never attempted on both paths in one tick.
//!
//! Failed charges get exponential backoff (base delay doubling per attempt,
//! capped), tracked durably in the payment-retry store. A subscription that
//! exhausts its retry budget is suspended and its entry cleared.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use payrail_shared::RetryDefaults;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{PaymentRetryState, Subscription, SubscriptionStatus};
use crate::store::{PaymentRetryStore, SubscriptionStore};
use crate::subscriptions::{BillingOutcome, SubscriptionService};

/// Delay before retry `attempt` (1-based): `base * multiplier^(attempt-1)`,
/// capped at the policy maximum.
pub fn retry_delay(attempt: u32, policy: &RetryDefaults) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let scaled = policy.base_delay_ms as f64 * policy.backoff_multiplier.powi(exponent as i32);
    let capped = scaled.min(policy.max_delay_ms as f64);
    Duration::from_millis(capped as u64)
}

/// What one scheduler tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub due_subscriptions: usize,
    pub charged: usize,
    pub retries_due: usize,
    pub retries_scheduled: usize,
    pub suspended: usize,
}

/// Snapshot of the outstanding payment-retry backlog.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatistics {
    pub total_pending: u64,
    /// Count of entries per attempt number.
    pub by_attempt: BTreeMap<u32, u64>,
    /// Oldest `next_retry_date` in the backlog.
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_due: Option<OffsetDateTime>,
    /// Newest `next_retry_date` in the backlog.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_due: Option<OffsetDateTime>,
}

pub struct BillingScheduler {
    subscriptions: Arc<dyn SubscriptionStore>,
    retries: Arc<dyn PaymentRetryStore>,
    service: Arc<SubscriptionService>,
    policy: RetryDefaults,
}

impl BillingScheduler {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        retries: Arc<dyn PaymentRetryStore>,
        service: Arc<SubscriptionService>,
        policy: RetryDefaults,
    ) -> Self {
        Self {
            subscriptions,
            retries,
            service,
            policy,
        }
    }

    /// One scheduler tick at `now`. A failing subscription never fails the
    /// tick; it is logged and the pass moves on.
    pub async fn tick(&self, now: OffsetDateTime) -> BillingResult<TickSummary> {
        let mut summary = TickSummary::default();

        let due = self.subscriptions.list_due_for_billing(now).await?;
        summary.due_subscriptions = due.len();
        for subscription in &due {
            if self.retries.get(subscription.id).await?.is_some() {
                // Owned by the retry pass.
                continue;
            }
            self.attempt(subscription, now, &mut summary).await?;
        }

        let due_retries = self.retries.list_due(now).await?;
        summary.retries_due = due_retries.len();
        for entry in &due_retries {
            let Some(subscription) = self.subscriptions.find(entry.subscription_id).await? else {
                tracing::warn!(
                    subscription_id = %entry.subscription_id,
                    "Retry entry for unknown subscription, dropping"
                );
                self.retries.remove(entry.subscription_id).await?;
                continue;
            };
            if subscription.status != SubscriptionStatus::Active {
                tracing::info!(
                    subscription_id = %subscription.id,
                    status = %subscription.status,
                    "Subscription no longer active, dropping retry entry"
                );
                self.retries.remove(subscription.id).await?;
                continue;
            }
            self.attempt(&subscription, now, &mut summary).await?;
        }

        if summary != TickSummary::default() {
            tracing::info!(
                due = summary.due_subscriptions,
                charged = summary.charged,
                retries_due = summary.retries_due,
                retries_scheduled = summary.retries_scheduled,
                suspended = summary.suspended,
                "Billing tick complete"
            );
        }
        Ok(summary)
    }

    /// Bill a single subscription outside the timed loop, with the same
    /// success/failure handling as a tick.
    pub async fn bill_one(
        &self,
        subscription: &Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<TickSummary> {
        let mut summary = TickSummary {
            due_subscriptions: 1,
            ..TickSummary::default()
        };
        self.attempt(subscription, now, &mut summary).await?;
        Ok(summary)
    }

    async fn attempt(
        &self,
        subscription: &Subscription,
        now: OffsetDateTime,
        summary: &mut TickSummary,
    ) -> BillingResult<()> {
        match self.service.process_billing(subscription, now).await {
            Ok(BillingOutcome::Charged) => {
                summary.charged += 1;
                if self.retries.remove(subscription.id).await? {
                    tracing::info!(
                        subscription_id = %subscription.id,
                        "Payment recovered, retry entry cleared"
                    );
                }
            }
            Ok(BillingOutcome::Skipped) => {}
            Ok(BillingOutcome::Declined) => {
                self.schedule_retry(subscription.id, "charge declined", now, summary)
                    .await?;
            }
            Err(err) => {
                tracing::error!(
                    subscription_id = %subscription.id,
                    error = %err,
                    "Billing attempt errored"
                );
                self.schedule_retry(subscription.id, &err.to_string(), now, summary)
                    .await?;
            }
        }
        Ok(())
    }

    /// Record a failed attempt. Attempt numbers are 1-based; crossing the
    /// budget suspends the subscription instead of scheduling another retry.
    async fn schedule_retry(
        &self,
        subscription_id: Uuid,
        error: &str,
        now: OffsetDateTime,
        summary: &mut TickSummary,
    ) -> BillingResult<()> {
        let existing = self.retries.get(subscription_id).await?;
        let attempt_count = existing.as_ref().map(|e| e.attempt_count).unwrap_or(0) + 1;

        if attempt_count > self.policy.max_attempts {
            self.subscriptions
                .suspend(
                    subscription_id,
                    "payment retries exhausted",
                    error,
                    now,
                )
                .await?;
            self.retries.remove(subscription_id).await?;
            summary.suspended += 1;
            tracing::error!(
                subscription_id = %subscription_id,
                attempts = attempt_count - 1,
                "Payment retry budget exhausted, subscription suspended"
            );
            return Ok(());
        }

        let delay = retry_delay(attempt_count, &self.policy);
        let next_retry_date = now + delay;
        self.retries
            .upsert(&PaymentRetryState {
                subscription_id,
                attempt_count,
                next_retry_date,
                last_error: error.to_string(),
                created_at: existing.map(|e| e.created_at).unwrap_or(now),
            })
            .await?;
        summary.retries_scheduled += 1;
        tracing::warn!(
            subscription_id = %subscription_id,
            attempt = attempt_count,
            delay_ms = delay.as_millis() as u64,
            "Payment failed, retry scheduled"
        );
        Ok(())
    }

    pub async fn retry_statistics(&self) -> BillingResult<RetryStatistics> {
        let entries = self.retries.list_all().await?;
        let mut stats = RetryStatistics {
            total_pending: entries.len() as u64,
            ..RetryStatistics::default()
        };
        for entry in &entries {
            *stats.by_attempt.entry(entry.attempt_count).or_insert(0) += 1;
            stats.next_due = match stats.next_due {
                Some(current) if current <= entry.next_retry_date => Some(current),
                _ => Some(entry.next_retry_date),
            };
            stats.last_due = match stats.last_due {
                Some(current) if current >= entry.next_retry_date => Some(current),
                _ => Some(entry.next_retry_date),
            };
        }
        Ok(stats)
    }
}
