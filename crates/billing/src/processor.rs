//! Webhook event processing
//!
//! Dispatches a claimed event to its type-specific handler. Handlers are
//! idempotent by construction: they look up the affected record by its
//! gateway-assigned id and apply a narrow state update, so replaying a
//! processed event converges on the same terminal state. A handler whose
//! target record does not exist logs and succeeds; the gateway frequently
//! delivers events for records created out-of-band.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::models::{
    SubscriptionStatus, TransactionStatus, WebhookEvent, WebhookEventType,
};
use crate::store::{SubscriptionStore, TransactionStore};

pub struct WebhookProcessor {
    transactions: Arc<dyn TransactionStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
}

impl WebhookProcessor {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        Self {
            transactions,
            subscriptions,
        }
    }

    /// Process one claimed event. An `Err` here feeds the queue's retry
    /// bookkeeping; `Ok` marks the event processed.
    pub async fn process(&self, event: &WebhookEvent) -> BillingResult<()> {
        tracing::info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        match event.event_type {
            WebhookEventType::PaymentCompleted => {
                self.update_transaction(event, TransactionStatus::Completed, None)
                    .await
            }
            WebhookEventType::PaymentFailed => {
                let reason = failure_reason(event);
                self.update_transaction(event, TransactionStatus::Failed, Some(&reason))
                    .await
            }
            WebhookEventType::SubscriptionCreated => {
                self.update_subscription(event, SubscriptionStatus::Active).await
            }
            WebhookEventType::SubscriptionUpdated => self.apply_subscription_update(event).await,
            WebhookEventType::SubscriptionCancelled => self.cancel_subscription(event).await,
            WebhookEventType::RefundCompleted => {
                self.update_transaction(event, TransactionStatus::Refunded, None)
                    .await
            }
            WebhookEventType::ChargebackCreated => self.annotate_chargeback(event).await,
            WebhookEventType::Unclassified => {
                tracing::warn!(
                    event_id = %event.event_id,
                    provider_event_type = %event.provider_event_type,
                    "No handler for unclassified event type, skipping"
                );
                Ok(())
            }
        }
    }

    async fn update_transaction(
        &self,
        event: &WebhookEvent,
        status: TransactionStatus,
        failure_reason: Option<&str>,
    ) -> BillingResult<()> {
        let Some(gateway_id) = event.related_transaction_id.as_deref() else {
            tracing::warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Event carries no transaction id, skipping"
            );
            return Ok(());
        };

        let updated = self
            .transactions
            .set_status_by_gateway_id(gateway_id, status, failure_reason)
            .await?;
        if updated {
            tracing::info!(
                event_id = %event.event_id,
                gateway_transaction_id = %gateway_id,
                status = %status,
                "Transaction status updated from webhook"
            );
        } else {
            tracing::warn!(
                event_id = %event.event_id,
                gateway_transaction_id = %gateway_id,
                "No transaction on file for webhook, skipping"
            );
        }
        Ok(())
    }

    async fn update_subscription(
        &self,
        event: &WebhookEvent,
        status: SubscriptionStatus,
    ) -> BillingResult<()> {
        let Some(gateway_id) = event.related_subscription_id.as_deref() else {
            tracing::warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Event carries no subscription id, skipping"
            );
            return Ok(());
        };

        let updated = self
            .subscriptions
            .set_status_by_gateway_id(gateway_id, status)
            .await?;
        if updated {
            tracing::info!(
                event_id = %event.event_id,
                gateway_subscription_id = %gateway_id,
                status = %status,
                "Subscription status updated from webhook"
            );
        } else {
            tracing::warn!(
                event_id = %event.event_id,
                gateway_subscription_id = %gateway_id,
                "No subscription on file for webhook, skipping"
            );
        }
        Ok(())
    }

    /// `subscription.updated` only moves the status, and only when the vendor
    /// payload names one we recognize.
    async fn apply_subscription_update(&self, event: &WebhookEvent) -> BillingResult<()> {
        let Some(raw_status) = event
            .payload
            .get("payload")
            .and_then(|p| p.get("status"))
            .and_then(|s| s.as_str())
        else {
            tracing::info!(
                event_id = %event.event_id,
                "Subscription update carries no status change, nothing to apply"
            );
            return Ok(());
        };

        match SubscriptionStatus::parse(&raw_status.to_lowercase()) {
            Ok(status) => self.update_subscription(event, status).await,
            Err(_) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    vendor_status = %raw_status,
                    "Unrecognized subscription status in update, skipping"
                );
                Ok(())
            }
        }
    }

    async fn cancel_subscription(&self, event: &WebhookEvent) -> BillingResult<()> {
        let Some(gateway_id) = event.related_subscription_id.as_deref() else {
            tracing::warn!(
                event_id = %event.event_id,
                "Cancellation event carries no subscription id, skipping"
            );
            return Ok(());
        };

        let reason = event
            .payload
            .get("payload")
            .and_then(|p| p.get("reason"))
            .and_then(|r| r.as_str())
            .unwrap_or("cancelled by gateway webhook");

        let updated = self
            .subscriptions
            .cancel_by_gateway_id(gateway_id, reason, OffsetDateTime::now_utc())
            .await?;
        if updated {
            tracing::info!(
                event_id = %event.event_id,
                gateway_subscription_id = %gateway_id,
                "Subscription cancelled from webhook"
            );
        } else {
            tracing::warn!(
                event_id = %event.event_id,
                gateway_subscription_id = %gateway_id,
                "No subscription on file for cancellation, skipping"
            );
        }
        Ok(())
    }

    async fn annotate_chargeback(&self, event: &WebhookEvent) -> BillingResult<()> {
        let Some(gateway_id) = event.related_transaction_id.as_deref() else {
            tracing::warn!(
                event_id = %event.event_id,
                "Chargeback event carries no transaction id, skipping"
            );
            return Ok(());
        };

        let updated = self
            .transactions
            .annotate_chargeback(gateway_id, OffsetDateTime::now_utc())
            .await?;
        if updated {
            tracing::warn!(
                event_id = %event.event_id,
                gateway_transaction_id = %gateway_id,
                "Chargeback recorded against transaction"
            );
        } else {
            tracing::warn!(
                event_id = %event.event_id,
                gateway_transaction_id = %gateway_id,
                "No transaction on file for chargeback, skipping"
            );
        }
        Ok(())
    }
}

fn failure_reason(event: &WebhookEvent) -> String {
    event
        .payload
        .get("payload")
        .and_then(|p| {
            p.get("reason")
                .or_else(|| p.get("responseText"))
                .and_then(|r| r.as_str())
        })
        .unwrap_or("payment failed at gateway")
        .to_string()
}
