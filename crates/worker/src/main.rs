//! Payrail Background Worker
//!
//! Runs everything that is not request/response:
//! - Webhook queue processing (polled every few seconds)
//! - Recurring billing scheduler (regular charges and payment retries)
//! - Dead-letter retention pruning (daily at 3:00 UTC, 7-day retention)
//! - Queue health heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use payrail_billing::{BillingService, SimulatedGateway, Stores};
use payrail_shared::Config;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

const DEAD_LETTER_RETENTION_DAYS: i64 = 7;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Payrail Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    info!("Connecting to database...");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;
    info!("Database pool created");

    info!("Running database migrations...");
    payrail_billing::store::postgres::run_migrations(&pool).await?;
    info!("Database migrations complete");

    let gateway = Arc::new(SimulatedGateway::from_credentials(
        config.gateway_api_login_id.clone(),
        config.gateway_transaction_key.clone(),
    )?);
    let billing = Arc::new(BillingService::new(Stores::postgres(pool), gateway, &config));

    // Billing scheduler: regular charges plus payment retries.
    billing.jobs.initialize().await;

    // Webhook queue polling loop.
    let queue = billing.queue.clone();
    let poll_interval = Duration::from_secs(config.queue_poll_seconds);
    tokio::spawn(queue.run(poll_interval));
    info!(
        poll_seconds = config.queue_poll_seconds,
        "Webhook queue polling started"
    );

    let scheduler = JobScheduler::new().await?;

    // Daily dead-letter pruning. The event audit rows are never touched;
    // only parked dead letters age out.
    let billing_for_prune = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _lock| {
            let billing = billing_for_prune.clone();
            Box::pin(async move {
                let cutoff = time::OffsetDateTime::now_utc()
                    - time::Duration::days(DEAD_LETTER_RETENTION_DAYS);
                match billing.dead_letters.prune_older_than(cutoff).await {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "Pruned old dead-letter entries")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Dead-letter pruning failed"),
                }
            })
        })?)
        .await?;

    // Heartbeat with queue depth and retry backlog.
    let billing_for_heartbeat = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _lock| {
            let billing = billing_for_heartbeat.clone();
            Box::pin(async move {
                match billing.queue.health().await {
                    Ok((counts, dead_letters)) => info!(
                        waiting = counts.waiting,
                        active = counts.active,
                        completed = counts.completed,
                        failed = counts.failed,
                        dead_letters,
                        "Webhook queue heartbeat"
                    ),
                    Err(e) => error!(error = %e, "Queue health check failed"),
                }
                match billing.scheduler.retry_statistics().await {
                    Ok(stats) => info!(
                        pending_retries = stats.total_pending,
                        "Payment retry backlog"
                    ),
                    Err(e) => error!(error = %e, "Retry statistics failed"),
                }
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Cron jobs scheduled");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    billing.jobs.shutdown().await;
    Ok(())
}
