//! Core billing entities
//!
//! Webhook events, subscriptions, transactions, and the scheduler's payment
//! retry state. Enums carry `as_str`/`parse` pairs because the Postgres
//! stores persist them as text columns.

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Classified type of an inbound webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    PaymentCompleted,
    PaymentFailed,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCancelled,
    RefundCompleted,
    ChargebackCreated,
    /// Vendor event type with no mapping. Processed as an explicit no-op
    /// rather than silently misclassified as a payment.
    Unclassified,
}

impl WebhookEventType {
    /// Fixed lookup table from vendor event-type strings.
    pub fn from_provider(raw: &str) -> Self {
        match raw {
            "payment.completed"
            | "net.authorize.payment.authcapture.created"
            | "net.authorize.payment.priorAuthCapture.created" => Self::PaymentCompleted,
            "payment.failed" | "net.authorize.payment.fraud.declined" => Self::PaymentFailed,
            "subscription.created" | "net.authorize.customer.subscription.created" => {
                Self::SubscriptionCreated
            }
            "subscription.updated" | "net.authorize.customer.subscription.updated" => {
                Self::SubscriptionUpdated
            }
            "subscription.cancelled" | "net.authorize.customer.subscription.cancelled" => {
                Self::SubscriptionCancelled
            }
            "refund.completed" | "net.authorize.payment.refund.created" => Self::RefundCompleted,
            "chargeback.created" | "net.authorize.customer.chargeback.created" => {
                Self::ChargebackCreated
            }
            _ => Self::Unclassified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentCompleted => "payment_completed",
            Self::PaymentFailed => "payment_failed",
            Self::SubscriptionCreated => "subscription_created",
            Self::SubscriptionUpdated => "subscription_updated",
            Self::SubscriptionCancelled => "subscription_cancelled",
            Self::RefundCompleted => "refund_completed",
            Self::ChargebackCreated => "chargeback_created",
            Self::Unclassified => "unclassified",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "payment_completed" => Ok(Self::PaymentCompleted),
            "payment_failed" => Ok(Self::PaymentFailed),
            "subscription_created" => Ok(Self::SubscriptionCreated),
            "subscription_updated" => Ok(Self::SubscriptionUpdated),
            "subscription_cancelled" => Ok(Self::SubscriptionCancelled),
            "refund_completed" => Ok(Self::RefundCompleted),
            "chargeback_created" => Ok(Self::ChargebackCreated),
            "unclassified" => Ok(Self::Unclassified),
            other => Err(BillingError::Validation(format!(
                "unknown event type: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Processing status of a stored webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Pending,
    Processing,
    Processed,
    Retrying,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "retrying" => Ok(Self::Retrying),
            "failed" => Ok(Self::Failed),
            other => Err(BillingError::Validation(format!(
                "unknown event status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for WebhookEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted inbound webhook event. Never deleted; the table is the audit
/// trail for every delivery the gateway ever made.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: Uuid,
    /// Externally supplied event id; the deduplication key.
    pub event_id: String,
    pub event_type: WebhookEventType,
    /// Vendor's own event-type string, kept for diagnostics.
    pub provider_event_type: String,
    pub status: WebhookEventStatus,
    pub payload: serde_json::Value,
    pub source: String,
    pub related_transaction_id: Option<String>,
    pub related_subscription_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// An event that exhausted its retry budget, parked for manual inspection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub event_id: String,
    pub event_type: WebhookEventType,
    pub payload: serde_json::Value,
    pub error: String,
    pub total_attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
}

/// Recurring charge cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Quarterly,
    Yearly,
}

impl BillingInterval {
    fn months(&self) -> i32 {
        match self {
            Self::Monthly => 1,
            Self::Quarterly => 3,
            Self::Yearly => 12,
        }
    }

    /// Next billing date: one interval after `from`, clamping the day for
    /// short months (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, from: OffsetDateTime) -> OffsetDateTime {
        add_months(from, self.months())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "yearly" => Ok(Self::Yearly),
            other => Err(BillingError::Validation(format!(
                "unknown billing interval: {other}"
            ))),
        }
    }
}

fn add_months(from: OffsetDateTime, months: i32) -> OffsetDateTime {
    let total = from.year() * 12 + (from.month() as i32 - 1) + months;
    let year = total.div_euclid(12);
    let month_index = total.rem_euclid(12) as u8 + 1;
    // month_index is always 1..=12 here
    let month = Month::try_from(month_index).unwrap_or(Month::January);
    let day = from.day().min(days_in_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(date) => from.replace_date(date),
        // Unreachable with a clamped day; keep a sane fallback anyway.
        Err(_) => from + Duration::days(30 * months as i64),
    }
}

fn days_in_month(year: i32, month: Month) -> u8 {
    month.length(year)
}

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Cancelled,
    Suspended,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Cancelled => "cancelled",
            Self::Suspended => "suspended",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "cancelled" => Ok(Self::Cancelled),
            "suspended" => Ok(Self::Suspended),
            "expired" => Ok(Self::Expired),
            other => Err(BillingError::Validation(format!(
                "unknown subscription status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A recurring-billing subscription.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    /// Gateway-assigned subscription id, once the gateway has one.
    pub gateway_subscription_id: Option<String>,
    pub customer_email: String,
    pub customer_name: String,
    pub status: SubscriptionStatus,
    pub plan_name: String,
    /// Fixed-point currency amount in minor units (cents).
    pub amount_cents: i64,
    pub currency: String,
    pub billing_interval: BillingInterval,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub next_billing_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_billing_date: Option<OffsetDateTime>,
    pub billing_cycles_completed: u32,
    /// Optional cap; reaching it transitions the subscription to `expired`.
    pub total_billing_cycles: Option<u32>,
    pub card_last_four: Option<String>,
    pub card_type: Option<String>,
    pub metadata: serde_json::Value,
    pub cancellation_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Kind of money movement a transaction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Payment,
    Refund,
    Void,
    Capture,
    Authorization,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::Refund => "refund",
            Self::Void => "void",
            Self::Capture => "capture",
            Self::Authorization => "authorization",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "payment" => Ok(Self::Payment),
            "refund" => Ok(Self::Refund),
            "void" => Ok(Self::Void),
            "capture" => Ok(Self::Capture),
            "authorization" => Ok(Self::Authorization),
            other => Err(BillingError::Validation(format!(
                "unknown transaction type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            other => Err(BillingError::Validation(format!(
                "unknown transaction status: {other}"
            ))),
        }
    }

    /// Terminal transactions are immutable except for chargeback annotation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Refunded
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single payment-gateway money movement.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub gateway_transaction_id: Option<String>,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount_cents: i64,
    pub currency: String,
    pub customer_email: String,
    pub card_last_four: Option<String>,
    pub card_type: Option<String>,
    pub description: Option<String>,
    pub failure_reason: Option<String>,
    /// Links a refund/void back to the transaction it reverses.
    pub reference_transaction_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    /// Chargeback annotation; the only mutation allowed on a terminal row.
    #[serde(with = "time::serde::rfc3339::option")]
    pub chargeback_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Scheduler-owned retry bookkeeping for a subscription with failed charges.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRetryState {
    pub subscription_id: Uuid,
    pub attempt_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub next_retry_date: OffsetDateTime,
    pub last_error: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Full card details as submitted at subscription-creation time. Passed
/// through to the gateway; only `last_four` and the detected brand are ever
/// persisted.
#[derive(Clone, Deserialize)]
pub struct CardDetails {
    pub card_number: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
    pub cvv: String,
}

impl CardDetails {
    pub fn last_four(&self) -> String {
        let digits: String = self.card_number.chars().filter(|c| c.is_ascii_digit()).collect();
        let start = digits.len().saturating_sub(4);
        digits[start..].to_string()
    }

    pub fn brand(&self) -> &'static str {
        let digits: String = self.card_number.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.starts_with('4') {
            "visa"
        } else if digits.starts_with("34") || digits.starts_with("37") {
            "amex"
        } else if digits.starts_with('5') {
            "mastercard"
        } else if digits.starts_with('6') {
            "discover"
        } else {
            "unknown"
        }
    }
}

// Card numbers must never leak through Debug-formatted logs or errors.
impl std::fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardDetails")
            .field("card_number", &format!("****{}", self.last_four()))
            .field("expiry_month", &self.expiry_month)
            .field("expiry_year", &self.expiry_year)
            .field("cvv", &"***")
            .finish()
    }
}
