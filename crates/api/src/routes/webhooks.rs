//! Webhook endpoints
//!
//! Inbound gateway deliveries plus the read-only views over the event audit
//! trail and queue health. The receive handler verifies the HMAC signature
//! against the raw body before anything is parsed, and acknowledges
//! duplicates with 200 so the gateway stops redelivering.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use time::OffsetDateTime;

use payrail_billing::{BillingError, EventFilter, IngestOutcome, WebhookEventStatus, WebhookEventType};

use crate::error::ApiResult;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-provider-signature";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks/{provider}", post(receive_webhook))
        .route("/webhooks/events", get(list_events))
        .route("/webhooks/events/{event_id}", get(get_event))
        .route("/webhooks/health", get(queue_health))
}

async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    state.billing.verifier.verify(&body, signature)?;

    let outcome = state.billing.ingestion.ingest(&provider, &body).await?;
    let duplicate = matches!(outcome, IngestOutcome::Duplicate { .. });
    let message = if duplicate {
        "Webhook already processed"
    } else {
        "Webhook received"
    };
    Ok(Json(serde_json::json!({
        "message": message,
        "eventId": outcome.event_id(),
        "duplicate": duplicate,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListEventsQuery {
    status: Option<String>,
    event_type: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let filter = EventFilter {
        status: query
            .status
            .as_deref()
            .map(WebhookEventStatus::parse)
            .transpose()?,
        event_type: query
            .event_type
            .as_deref()
            .map(WebhookEventType::parse)
            .transpose()?,
    };
    let limit = query.limit.unwrap_or(50).min(200);
    let offset = query.offset.unwrap_or(0);

    let (events, total) = state.billing.events.list(&filter, limit, offset).await?;
    Ok(Json(serde_json::json!({
        "events": events,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

/// Status view over a stored event. The raw payload stays internal; this is
/// the delivery-status surface, not the audit trail.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct EventStatusView {
    event_id: String,
    event_type: WebhookEventType,
    status: WebhookEventStatus,
    retry_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    processed_at: Option<OffsetDateTime>,
    error_message: Option<String>,
}

async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<EventStatusView>> {
    let event = state
        .billing
        .events
        .find_by_event_id(&event_id)
        .await?
        .ok_or(BillingError::NotFound {
            kind: "webhook event",
            id: event_id,
        })?;
    Ok(Json(EventStatusView {
        event_id: event.event_id,
        event_type: event.event_type,
        status: event.status,
        retry_count: event.retry_count,
        created_at: event.created_at,
        processed_at: event.processed_at,
        error_message: event.error_message,
    }))
}

async fn queue_health(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let (counts, dead_letters) = state.billing.queue.health().await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
        "queue": counts,
        "deadLetters": dead_letters,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::create_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use hmac::{Hmac, Mac};
    use payrail_billing::{BillingService, SimulatedGateway, Stores};
    use payrail_shared::{Config, RetryDefaults};
    use sha2::Sha512;
    use std::sync::Arc;
    use tower::ServiceExt;

    const SECRET: &str = "test-webhook-secret";

    fn app(secret: Option<&str>) -> (Router, Arc<BillingService>) {
        let config = Config {
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
        };
        let billing = Arc::new(BillingService::new(
            Stores::in_memory(),
            Arc::new(SimulatedGateway),
            &config,
        ));
        (create_router(AppState::new(billing.clone())), billing)
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha512>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        format!("sha512={}", hex::encode(mac.finalize().into_bytes()))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn signed_webhook_is_accepted() {
        let (app, _) = app(Some(SECRET));
        let body = br#"{"eventType":"payment.completed","id":"evt_1","payload":{"transId":"T1"}}"#;

        let response = app
            .oneshot(
                Request::post("/webhooks/authnet")
                    .header("X-Provider-Signature", sign(body))
                    .header("content-type", "application/json")
                    .body(Body::from(body.as_slice()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["message"], "Webhook received");
        assert_eq!(json["eventId"], "evt_1");
        assert_eq!(json["duplicate"], false);
    }

    #[tokio::test]
    async fn missing_signature_header_is_bad_request() {
        let (app, _) = app(Some(SECRET));
        let body = br#"{"eventType":"payment.completed","id":"evt_2","payload":{}}"#;

        let response = app
            .oneshot(
                Request::post("/webhooks/authnet")
                    .body(Body::from(body.as_slice()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_signature_header_is_bad_request() {
        let (app, _) = app(Some(SECRET));
        let body = br#"{"eventType":"payment.completed","id":"evt_2b","payload":{}}"#;

        let response = app
            .oneshot(
                Request::post("/webhooks/authnet")
                    .header("X-Provider-Signature", "md5=abcdef")
                    .body(Body::from(body.as_slice()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bad_signature_is_unauthorized() {
        let (app, _) = app(Some(SECRET));
        let body = br#"{"eventType":"payment.completed","id":"evt_3","payload":{}}"#;

        let response = app
            .oneshot(
                Request::post("/webhooks/authnet")
                    .header("X-Provider-Signature", format!("sha512={}", "ab".repeat(64)))
                    .body(Body::from(body.as_slice()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn duplicate_delivery_returns_200_with_duplicate_flag() {
        let (app, _) = app(Some(SECRET));
        let body = br#"{"eventType":"payment.completed","id":"evt_dup","payload":{}}"#;

        for expected_duplicate in [false, true] {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/webhooks/authnet")
                        .header("X-Provider-Signature", sign(body))
                        .body(Body::from(body.as_slice()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let json = body_json(response).await;
            assert_eq!(json["duplicate"], expected_duplicate);
            let expected_message = if expected_duplicate {
                "Webhook already processed"
            } else {
                "Webhook received"
            };
            assert_eq!(json["message"], expected_message);
        }
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let (app, _) = app(Some(SECRET));
        let body: &[u8] = b"{not json";

        let response = app
            .oneshot(
                Request::post("/webhooks/authnet")
                    .header("X-Provider-Signature", sign(body))
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn event_lookup_and_listing() {
        let (app, billing) = app(None);
        billing
            .ingestion
            .ingest(
                "authnet",
                br#"{"eventType":"payment.failed","id":"evt_list","payload":{}}"#,
            )
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::get("/webhooks/events/evt_list")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["eventId"], "evt_list");
        assert_eq!(json["eventType"], "payment_failed");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["retryCount"], 0);
        // The status view never exposes the raw payload.
        assert!(json.get("payload").is_none());

        let response = app
            .clone()
            .oneshot(
                Request::get("/webhooks/events?status=pending&eventType=payment_failed")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total"], 1);

        // Filter that matches nothing.
        let response = app
            .oneshot(
                Request::get("/webhooks/events?status=failed")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["total"], 0);
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let (app, _) = app(None);
        let response = app
            .oneshot(
                Request::get("/webhooks/events/evt_missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_status_filter_is_bad_request() {
        let (app, _) = app(None);
        let response = app
            .oneshot(
                Request::get("/webhooks/events?status=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_queue_counts() {
        let (app, billing) = app(None);
        billing
            .ingestion
            .ingest(
                "authnet",
                br#"{"eventType":"payment.completed","id":"evt_h","payload":{}}"#,
            )
            .await
            .unwrap();

        let response = app
            .oneshot(Request::get("/webhooks/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["queue"]["waiting"], 1);
        assert_eq!(json["deadLetters"], 0);
    }
}
