//! Subscription lifecycle service
//!
//! CRUD over subscriptions plus the single-subscription billing step the
//! scheduler drives. Validation lives here so the HTTP layer stays a thin
//! translation; card details flow through to the gateway and only the last
//! four digits and detected brand are ever persisted.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeRequest, CreateSubscriptionRequest, PaymentGateway};
use crate::models::{
    BillingInterval, CardDetails, Subscription, SubscriptionStatus, Transaction,
    TransactionStatus, TransactionType,
};
use crate::store::{SubscriptionStore, TransactionStore};

/// Validated input for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionParams {
    pub customer_email: String,
    pub customer_name: String,
    pub plan_name: String,
    pub amount_cents: i64,
    pub currency: String,
    pub billing_interval: BillingInterval,
    pub start_date: Option<OffsetDateTime>,
    pub total_billing_cycles: Option<u32>,
    pub card: CardDetails,
    pub metadata: serde_json::Value,
}

/// Partial update; absent fields keep their current values.
#[derive(Debug, Clone, Default)]
pub struct UpdateSubscriptionParams {
    pub plan_name: Option<String>,
    pub amount_cents: Option<i64>,
    pub status: Option<SubscriptionStatus>,
    pub total_billing_cycles: Option<u32>,
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of one billing attempt against one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingOutcome {
    /// Charge went through; the cycle was advanced.
    Charged,
    /// Charge declined; the caller schedules a payment retry.
    Declined,
    /// No charge was attempted (inactive, or cycle cap reached).
    Skipped,
}

pub struct SubscriptionService {
    subscriptions: Arc<dyn SubscriptionStore>,
    transactions: Arc<dyn TransactionStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl SubscriptionService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        transactions: Arc<dyn TransactionStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            subscriptions,
            transactions,
            gateway,
        }
    }

    /// Create a subscription: validate, register with the gateway, persist.
    /// The first charge falls due at the start date; the scheduler picks it
    /// up on its next tick.
    pub async fn create(&self, params: CreateSubscriptionParams) -> BillingResult<Subscription> {
        validate_email(&params.customer_email)?;
        validate_amount(params.amount_cents)?;
        if params.customer_name.trim().is_empty() {
            return Err(BillingError::Validation("customer name is required".into()));
        }
        if params.plan_name.trim().is_empty() {
            return Err(BillingError::Validation("plan name is required".into()));
        }
        if params.total_billing_cycles == Some(0) {
            return Err(BillingError::Validation(
                "total billing cycles must be at least 1".into(),
            ));
        }

        let gateway_response = self
            .gateway
            .create_subscription(CreateSubscriptionRequest {
                amount_cents: params.amount_cents,
                currency: params.currency.clone(),
                customer_email: params.customer_email.clone(),
                customer_name: params.customer_name.clone(),
                plan_name: params.plan_name.clone(),
                card: params.card.clone(),
            })
            .await?;

        let now = OffsetDateTime::now_utc();
        let start_date = params.start_date.unwrap_or(now);
        let subscription = Subscription {
            id: Uuid::new_v4(),
            gateway_subscription_id: Some(gateway_response.gateway_subscription_id),
            customer_email: params.customer_email,
            customer_name: params.customer_name,
            status: SubscriptionStatus::Active,
            plan_name: params.plan_name,
            amount_cents: params.amount_cents,
            currency: params.currency,
            billing_interval: params.billing_interval,
            start_date,
            end_date: None,
            next_billing_date: start_date,
            last_billing_date: None,
            billing_cycles_completed: 0,
            total_billing_cycles: params.total_billing_cycles,
            card_last_four: Some(params.card.last_four()),
            card_type: Some(params.card.brand().to_string()),
            metadata: params.metadata,
            cancellation_reason: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };
        self.subscriptions.insert(&subscription).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            plan = %subscription.plan_name,
            interval = ?subscription.billing_interval,
            "Subscription created"
        );
        Ok(subscription)
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Subscription> {
        self.subscriptions
            .find(id)
            .await?
            .ok_or(BillingError::NotFound {
                kind: "subscription",
                id: id.to_string(),
            })
    }

    pub async fn list_by_customer(&self, email: &str) -> BillingResult<Vec<Subscription>> {
        self.subscriptions.list_by_customer(email).await
    }

    pub async fn update(
        &self,
        id: Uuid,
        params: UpdateSubscriptionParams,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.get(id).await?;

        if let Some(amount) = params.amount_cents {
            validate_amount(amount)?;
            subscription.amount_cents = amount;
        }
        if let Some(plan_name) = params.plan_name {
            if plan_name.trim().is_empty() {
                return Err(BillingError::Validation("plan name is required".into()));
            }
            subscription.plan_name = plan_name;
        }
        if let Some(status) = params.status {
            subscription.status = status;
        }
        if let Some(total) = params.total_billing_cycles {
            if total == 0 {
                return Err(BillingError::Validation(
                    "total billing cycles must be at least 1".into(),
                ));
            }
            subscription.total_billing_cycles = Some(total);
        }
        if let Some(metadata) = params.metadata {
            subscription.metadata = metadata;
        }
        subscription.updated_at = OffsetDateTime::now_utc();

        self.subscriptions.update(&subscription).await?;
        Ok(subscription)
    }

    pub async fn cancel(&self, id: Uuid, reason: Option<String>) -> BillingResult<Subscription> {
        let mut subscription = self.get(id).await?;
        if subscription.status == SubscriptionStatus::Cancelled {
            return Ok(subscription);
        }

        let now = OffsetDateTime::now_utc();
        subscription.status = SubscriptionStatus::Cancelled;
        subscription.cancellation_reason =
            Some(reason.unwrap_or_else(|| "cancelled by customer".to_string()));
        subscription.cancelled_at = Some(now);
        subscription.updated_at = now;
        self.subscriptions.update(&subscription).await?;

        tracing::info!(subscription_id = %id, "Subscription cancelled");
        Ok(subscription)
    }

    /// Bill one subscription for its current cycle.
    ///
    /// No charge is attempted for non-active subscriptions or for
    /// subscriptions that have reached their cycle cap (the latter are moved
    /// to `expired` here). A decline records a failed transaction and returns
    /// `Declined`; transient gateway failures propagate as errors so callers
    /// can schedule a retry.
    pub async fn process_billing(
        &self,
        subscription: &Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<BillingOutcome> {
        if subscription.status != SubscriptionStatus::Active {
            tracing::debug!(
                subscription_id = %subscription.id,
                status = %subscription.status,
                "Skipping billing for non-active subscription"
            );
            return Ok(BillingOutcome::Skipped);
        }

        if let Some(total) = subscription.total_billing_cycles {
            if subscription.billing_cycles_completed >= total {
                self.subscriptions.mark_expired(subscription.id).await?;
                tracing::info!(
                    subscription_id = %subscription.id,
                    cycles = subscription.billing_cycles_completed,
                    "Subscription reached its cycle cap, marked expired"
                );
                return Ok(BillingOutcome::Skipped);
            }
        }

        let cycle = subscription.billing_cycles_completed + 1;
        let charge = self
            .gateway
            .charge(ChargeRequest {
                amount_cents: subscription.amount_cents,
                currency: subscription.currency.clone(),
                customer_email: subscription.customer_email.clone(),
                card: None,
                gateway_subscription_id: subscription.gateway_subscription_id.clone(),
                order_id: format!("sub-{}-cycle-{}", subscription.id, cycle),
                description: Some(format!(
                    "{} billing cycle {}",
                    subscription.plan_name, cycle
                )),
            })
            .await;

        match charge {
            Ok(response) => {
                self.record_transaction(
                    subscription,
                    TransactionStatus::Completed,
                    Some(response.gateway_transaction_id),
                    None,
                    cycle,
                )
                .await?;

                let new_next = subscription.billing_interval.advance(now);
                let advanced = self
                    .subscriptions
                    .advance_billing_cycle(
                        subscription.id,
                        subscription.next_billing_date,
                        new_next,
                        now,
                    )
                    .await?;
                if !advanced {
                    // The charge stands; only the bookkeeping raced.
                    tracing::error!(
                        subscription_id = %subscription.id,
                        "Billing cycle already advanced by a concurrent tick"
                    );
                }

                tracing::info!(
                    subscription_id = %subscription.id,
                    cycle,
                    amount_cents = subscription.amount_cents,
                    "Recurring charge succeeded"
                );
                Ok(BillingOutcome::Charged)
            }
            Err(BillingError::GatewayDeclined(reason)) => {
                self.record_transaction(
                    subscription,
                    TransactionStatus::Failed,
                    None,
                    Some(reason.clone()),
                    cycle,
                )
                .await?;
                tracing::warn!(
                    subscription_id = %subscription.id,
                    cycle,
                    reason = %reason,
                    "Recurring charge declined"
                );
                Ok(BillingOutcome::Declined)
            }
            Err(err) => Err(err),
        }
    }

    async fn record_transaction(
        &self,
        subscription: &Subscription,
        status: TransactionStatus,
        gateway_transaction_id: Option<String>,
        failure_reason: Option<String>,
        cycle: u32,
    ) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        self.transactions
            .insert(&Transaction {
                id: Uuid::new_v4(),
                gateway_transaction_id,
                transaction_type: TransactionType::Payment,
                status,
                amount_cents: subscription.amount_cents,
                currency: subscription.currency.clone(),
                customer_email: subscription.customer_email.clone(),
                card_last_four: subscription.card_last_four.clone(),
                card_type: subscription.card_type.clone(),
                description: Some(format!(
                    "{} billing cycle {}",
                    subscription.plan_name, cycle
                )),
                failure_reason,
                reference_transaction_id: None,
                subscription_id: Some(subscription.id),
                chargeback_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
    }
}

fn validate_email(email: &str) -> BillingResult<()> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err(BillingError::Validation("invalid email address".into()));
    };
    if local.is_empty()
        || domain.is_empty()
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || email.contains(char::is_whitespace)
    {
        return Err(BillingError::Validation("invalid email address".into()));
    }
    Ok(())
}

fn validate_amount(amount_cents: i64) -> BillingResult<()> {
    if amount_cents <= 0 {
        return Err(BillingError::Validation("amount must be positive".into()));
    }
    Ok(())
}
