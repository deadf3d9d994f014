#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Payrail API Server
//!
//! HTTP surface for webhook ingestion and subscription management. Webhook
//! processing and the billing scheduler run in the worker binary; this
//! process only accepts, persists, and reports.

mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use payrail_billing::{BillingService, SimulatedGateway, Stores};
use payrail_shared::Config;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::routes::create_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,payrail_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Payrail API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connection established");

    tracing::info!("Running database migrations...");
    payrail_billing::store::postgres::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    if config.webhook_secret.is_none() {
        tracing::warn!("WEBHOOK_SECRET not set, inbound webhooks will be rejected");
    }

    let gateway = Arc::new(SimulatedGateway::from_credentials(
        config.gateway_api_login_id.clone(),
        config.gateway_transaction_key.clone(),
    )?);
    let billing = Arc::new(BillingService::new(Stores::postgres(pool), gateway, &config));
    let state = AppState::new(billing);

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
