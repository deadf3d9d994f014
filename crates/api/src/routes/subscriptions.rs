//! Subscription endpoints
//!
//! CRUD over subscriptions plus the operational extras: a manual billing
//! trigger and the retry-backlog statistics. Amounts arrive as decimal
//! currency units and are converted to cents at the boundary; card details
//! are passed straight through to the service and never echoed back.

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use payrail_billing::{
    BillingError, BillingInterval, CardDetails, CreateSubscriptionParams, Subscription,
    SubscriptionStatus, UpdateSubscriptionParams,
};

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/subscriptions", post(create_subscription).get(list_subscriptions))
        .route("/subscriptions/retry-statistics", get(retry_statistics))
        .route("/subscriptions/{id}", get(get_subscription))
        .route("/subscriptions/{id}", put(update_subscription))
        .route("/subscriptions/{id}", delete(cancel_subscription))
        .route("/subscriptions/{id}/bill", post(trigger_billing))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscriptionRequest {
    customer_email: String,
    customer_name: String,
    plan_name: String,
    /// Decimal currency units, e.g. 29.99.
    amount: f64,
    #[serde(default = "default_currency")]
    currency: String,
    billing_interval: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    start_date: Option<time::OffsetDateTime>,
    total_billing_cycles: Option<u32>,
    card: CardRequest,
    #[serde(default)]
    metadata: serde_json::Value,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CardRequest {
    card_number: String,
    expiry_month: u8,
    expiry_year: u16,
    cvv: String,
}

impl From<CardRequest> for CardDetails {
    fn from(card: CardRequest) -> Self {
        CardDetails {
            card_number: card.card_number,
            expiry_month: card.expiry_month,
            expiry_year: card.expiry_year,
            cvv: card.cvv,
        }
    }
}

/// Decimal amount to integer cents, rounded to the nearest cent.
fn to_cents(amount: f64) -> Result<i64, BillingError> {
    if !amount.is_finite() || amount <= 0.0 || amount > 1_000_000_000.0 {
        return Err(BillingError::Validation("amount must be positive".into()));
    }
    Ok((amount * 100.0).round() as i64)
}

async fn create_subscription(
    State(state): State<AppState>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> ApiResult<Json<Subscription>> {
    let billing_interval = BillingInterval::parse(&request.billing_interval)?;
    let amount_cents = to_cents(request.amount)?;
    let metadata = if request.metadata.is_null() {
        serde_json::json!({})
    } else {
        request.metadata
    };

    let subscription = state
        .billing
        .subscriptions
        .create(CreateSubscriptionParams {
            customer_email: request.customer_email,
            customer_name: request.customer_name,
            plan_name: request.plan_name,
            amount_cents,
            currency: request.currency,
            billing_interval,
            start_date: request.start_date,
            total_billing_cycles: request.total_billing_cycles,
            card: request.card.into(),
            metadata,
        })
        .await?;
    Ok(Json(subscription))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    customer_email: String,
}

async fn list_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Subscription>>> {
    let subscriptions = state
        .billing
        .subscriptions
        .list_by_customer(&query.customer_email)
        .await?;
    Ok(Json(subscriptions))
}

async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.billing.subscriptions.get(id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSubscriptionRequest {
    plan_name: Option<String>,
    amount: Option<f64>,
    status: Option<String>,
    total_billing_cycles: Option<u32>,
    metadata: Option<serde_json::Value>,
}

async fn update_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateSubscriptionRequest>,
) -> ApiResult<Json<Subscription>> {
    let params = UpdateSubscriptionParams {
        plan_name: request.plan_name,
        amount_cents: request.amount.map(to_cents).transpose()?,
        status: request
            .status
            .as_deref()
            .map(SubscriptionStatus::parse)
            .transpose()?,
        total_billing_cycles: request.total_billing_cycles,
        metadata: request.metadata,
    };
    Ok(Json(state.billing.subscriptions.update(id, params).await?))
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    reason: Option<String>,
}

async fn cancel_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Json<Subscription>> {
    let reason = body.and_then(|Json(b)| b.reason);
    Ok(Json(state.billing.subscriptions.cancel(id, reason).await?))
}

async fn trigger_billing(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let summary = state.billing.jobs.trigger_billing(id).await?;
    Ok(Json(serde_json::json!({
        "subscriptionId": id,
        "charged": summary.charged > 0,
        "retryScheduled": summary.retries_scheduled > 0,
        "suspended": summary.suspended > 0,
    })))
}

async fn retry_statistics(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let stats = state.billing.jobs.retry_statistics().await?;
    Ok(Json(serde_json::json!({ "retryStatistics": stats })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::create_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use payrail_billing::{BillingService, SimulatedGateway, Stores};
    use payrail_shared::{Config, RetryDefaults};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<BillingService>) {
        let config = Config {
            database_url: "postgres://unused".into(),
            webhook_secret: None,
            gateway_api_login_id: None,
            gateway_transaction_key: None,
            webhook_max_retries: 3,
            billing_retry: RetryDefaults::default(),
            billing_scheduler_enabled: true,
            billing_tick_seconds: 3600,
            queue_poll_seconds: 5,
            queue_batch_size: 20,
            port: 0,
        };
        let billing = Arc::new(BillingService::new(
            Stores::in_memory(),
            Arc::new(SimulatedGateway),
            &config,
        ));
        (create_router(AppState::new(billing.clone())), billing)
    }

    fn create_body() -> serde_json::Value {
        serde_json::json!({
            "customerEmail": "jo@example.com",
            "customerName": "Jo Doe",
            "planName": "pro-monthly",
            "amount": 29.99,
            "billingInterval": "monthly",
            "card": {
                "cardNumber": "4111111111111111",
                "expiryMonth": 12,
                "expiryYear": 2030,
                "cvv": "123"
            }
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(app: &Router) -> serde_json::Value {
        let response = app
            .clone()
            .oneshot(
                Request::post("/subscriptions")
                    .header("content-type", "application/json")
                    .body(Body::from(create_body().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }

    #[tokio::test]
    async fn create_converts_amount_to_cents_and_redacts_the_card() {
        let (app, _) = app();
        let json = create(&app).await;

        assert_eq!(json["amountCents"], 2999);
        assert_eq!(json["status"], "active");
        assert_eq!(json["cardLastFour"], "1111");
        assert_eq!(json["cardType"], "visa");
        assert!(json.get("card").is_none());
        assert!(json.to_string().find("4111111111111111").is_none());
    }

    #[tokio::test]
    async fn create_with_bad_email_is_bad_request() {
        let (app, _) = app();
        let mut body = create_body();
        body["customerEmail"] = "not-an-email".into();

        let response = app
            .oneshot(
                Request::post("/subscriptions")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_with_bad_interval_is_bad_request() {
        let (app, _) = app();
        let mut body = create_body();
        body["billingInterval"] = "fortnightly".into();

        let response = app
            .oneshot(
                Request::post("/subscriptions")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_with_declined_card_is_payment_required() {
        let (app, _) = app();
        let mut body = create_body();
        body["card"]["cardNumber"] = "4000000000000002".into();

        let response = app
            .oneshot(
                Request::post("/subscriptions")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn get_update_cancel_round_trip() {
        let (app, _) = app();
        let created = create(&app).await;
        let id = created["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/subscriptions/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::put(format!("/subscriptions/{id}"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"amount": 49.99}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["amountCents"], 4999);

        let response = app
            .clone()
            .oneshot(
                Request::delete(format!("/subscriptions/{id}"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"reason": "downgrade"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "cancelled");
        assert_eq!(json["cancellationReason"], "downgrade");
    }

    #[tokio::test]
    async fn unknown_subscription_is_not_found() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::get(format!("/subscriptions/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listing_filters_by_customer_email() {
        let (app, _) = app();
        create(&app).await;

        let response = app
            .clone()
            .oneshot(
                Request::get("/subscriptions?customerEmail=jo@example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);

        let response = app
            .oneshot(
                Request::get("/subscriptions?customerEmail=other@example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_billing_requires_a_running_scheduler() {
        let (app, billing) = app();
        let created = create(&app).await;
        let id = created["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::post(format!("/subscriptions/{id}/bill"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        billing.jobs.initialize().await;
        let response = app
            .oneshot(
                Request::post(format!("/subscriptions/{id}/bill"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["charged"], true);
        billing.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn retry_statistics_endpoint_reports_the_backlog() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::get("/subscriptions/retry-statistics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let stats = &json["retryStatistics"];
        assert_eq!(stats["totalPending"], 0);
        // Both ends of the backlog are part of the contract.
        assert_eq!(stats["nextDue"], serde_json::Value::Null);
        assert_eq!(stats["lastDue"], serde_json::Value::Null);
    }
}
