//! HTTP error mapping
//!
//! Every handler returns `ApiResult`; the `IntoResponse` impl turns the
//! billing error taxonomy into status codes and a JSON error body. Internal
//! detail (store errors, gateway transport failures) is logged, not leaked.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use payrail_billing::BillingError;

pub struct ApiError(pub BillingError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            BillingError::InvalidPayload(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            BillingError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            BillingError::SignatureFormat => (
                StatusCode::BAD_REQUEST,
                "missing or malformed webhook signature header".to_string(),
            ),
            BillingError::SignatureInvalid => (
                StatusCode::UNAUTHORIZED,
                "webhook signature verification failed".to_string(),
            ),
            BillingError::NotFound { kind, id } => {
                (StatusCode::NOT_FOUND, format!("{kind} not found: {id}"))
            }
            BillingError::GatewayDeclined(msg) => {
                (StatusCode::PAYMENT_REQUIRED, format!("gateway declined: {msg}"))
            }
            BillingError::SchedulerNotInitialized => (
                StatusCode::SERVICE_UNAVAILABLE,
                "billing scheduler is not running".to_string(),
            ),
            BillingError::Configuration(_)
            | BillingError::GatewayUnavailable(_)
            | BillingError::Store(_)
            | BillingError::ConcurrentModification(_)
            | BillingError::Internal(_) => {
                tracing::error!(error = %self.0, "Request failed with internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
