//! Payment gateway boundary
//!
//! The gateway is a black-box capability: charge a card, create a recurring
//! subscription. Only the request/response shapes are specified here; the
//! transport behind a production implementation lives outside this crate.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::CardDetails;

/// A one-off charge request.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub customer_email: String,
    pub card: Option<CardDetails>,
    /// Gateway customer-profile charge when no raw card is supplied.
    pub gateway_subscription_id: Option<String>,
    pub order_id: String,
    pub description: Option<String>,
}

/// Gateway response to an approved charge.
#[derive(Debug, Clone)]
pub struct ChargeResponse {
    pub gateway_transaction_id: String,
    pub auth_code: Option<String>,
}

/// A recurring-subscription creation request.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub customer_email: String,
    pub customer_name: String,
    pub plan_name: String,
    pub card: CardDetails,
}

#[derive(Debug, Clone)]
pub struct CreateSubscriptionResponse {
    pub gateway_subscription_id: String,
}

/// External payment-processing provider.
///
/// Failures split into `GatewayDeclined` (permanent, feeds the billing
/// failure path) and `GatewayUnavailable` (transient, retried by callers).
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: ChargeRequest) -> BillingResult<ChargeResponse>;

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<CreateSubscriptionResponse>;
}

/// Deterministic gateway for local runs and development environments.
///
/// Approves everything except zero/negative amounts and the classic
/// always-decline test card.
#[derive(Debug)]
pub struct SimulatedGateway;

impl SimulatedGateway {
    /// Build from the configured gateway credentials.
    ///
    /// No network calls are made, so the credentials are not exercised, but a
    /// half-configured pair is a deployment mistake and is rejected at
    /// startup rather than at first charge.
    pub fn from_credentials(
        api_login_id: Option<String>,
        transaction_key: Option<String>,
    ) -> BillingResult<Self> {
        match (&api_login_id, &transaction_key) {
            (Some(_), Some(_)) => {
                tracing::info!("Gateway credentials configured, charges are simulated");
            }
            (None, None) => {
                tracing::warn!("No gateway credentials configured, charges are simulated");
            }
            _ => {
                return Err(BillingError::Configuration(
                    "GATEWAY_API_LOGIN_ID and GATEWAY_TRANSACTION_KEY must be set together",
                ));
            }
        }
        Ok(Self)
    }
}

const DECLINE_TEST_CARD_LAST_FOUR: &str = "0002";

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(&self, request: ChargeRequest) -> BillingResult<ChargeResponse> {
        if request.amount_cents <= 0 {
            return Err(BillingError::GatewayDeclined(
                "amount must be positive".to_string(),
            ));
        }
        if let Some(card) = &request.card {
            if card.last_four() == DECLINE_TEST_CARD_LAST_FOUR {
                return Err(BillingError::GatewayDeclined(
                    "card declined".to_string(),
                ));
            }
        }

        let id = format!("sim_{}", Uuid::new_v4().simple());
        tracing::debug!(
            gateway_transaction_id = %id,
            order_id = %request.order_id,
            amount_cents = request.amount_cents,
            "Simulated gateway approved charge"
        );
        Ok(ChargeResponse {
            gateway_transaction_id: id,
            auth_code: Some("SIM000".to_string()),
        })
    }

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<CreateSubscriptionResponse> {
        if request.card.last_four() == DECLINE_TEST_CARD_LAST_FOUR {
            return Err(BillingError::GatewayDeclined(
                "card declined".to_string(),
            ));
        }
        Ok(CreateSubscriptionResponse {
            gateway_subscription_id: format!("sub_{}", Uuid::new_v4().simple()),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn card(number: &str) -> CardDetails {
        CardDetails {
            card_number: number.to_string(),
            expiry_month: 12,
            expiry_year: 2030,
            cvv: "123".to_string(),
        }
    }

    #[tokio::test]
    async fn simulated_gateway_approves_normal_cards() {
        let response = SimulatedGateway
            .charge(ChargeRequest {
                amount_cents: 2999,
                currency: "USD".into(),
                customer_email: "a@b.test".into(),
                card: Some(card("4111111111111111")),
                gateway_subscription_id: None,
                order_id: "order-1".into(),
                description: None,
            })
            .await
            .unwrap();
        assert!(response.gateway_transaction_id.starts_with("sim_"));
    }

    #[tokio::test]
    async fn simulated_gateway_declines_test_decline_card() {
        let err = SimulatedGateway
            .charge(ChargeRequest {
                amount_cents: 2999,
                currency: "USD".into(),
                customer_email: "a@b.test".into(),
                card: Some(card("4000000000000002")),
                gateway_subscription_id: None,
                order_id: "order-2".into(),
                description: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::GatewayDeclined(_)));
    }

    #[test]
    fn credentials_accepted_as_a_pair_or_not_at_all() {
        assert!(SimulatedGateway::from_credentials(None, None).is_ok());
        assert!(SimulatedGateway::from_credentials(
            Some("login".into()),
            Some("key".into())
        )
        .is_ok());
    }

    #[test]
    fn half_configured_credentials_are_rejected() {
        let err = SimulatedGateway::from_credentials(Some("login".into()), None).unwrap_err();
        assert!(matches!(err, BillingError::Configuration(_)));
        let err = SimulatedGateway::from_credentials(None, Some("key".into())).unwrap_err();
        assert!(matches!(err, BillingError::Configuration(_)));
    }
}
