//! HTTP route tree

pub mod subscriptions;
pub mod webhooks;

use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(webhooks::router())
        .merge(subscriptions::router())
        .with_state(state)
}
