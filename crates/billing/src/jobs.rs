//! Billing job supervisor
//!
//! Owns the background billing tick and the manual controls layered over it:
//! initialize/shutdown, an on-demand billing trigger for a single
//! subscription, and retry statistics. Manual triggers go through the same
//! scheduler path as timed ticks, so success clears retry state and failure
//! escalates it identically.
//!
//! Shutdown only cancels future ticks; a tick already in flight runs to
//! completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::scheduler::{BillingScheduler, RetryStatistics, TickSummary};
use crate::store::SubscriptionStore;

pub struct JobScheduler {
    scheduler: Arc<BillingScheduler>,
    subscriptions: Arc<dyn SubscriptionStore>,
    tick_interval: Duration,
    enabled: bool,
    initialized: AtomicBool,
    runner: tokio::sync::Mutex<Option<RunnerHandle>>,
}

struct RunnerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl JobScheduler {
    pub fn new(
        scheduler: Arc<BillingScheduler>,
        subscriptions: Arc<dyn SubscriptionStore>,
        tick_interval: Duration,
        enabled: bool,
    ) -> Self {
        Self {
            scheduler,
            subscriptions,
            tick_interval,
            enabled,
            initialized: AtomicBool::new(false),
            runner: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the billing loop. Idempotent; a second call is a no-op. When the
    /// scheduler is disabled by configuration, manual triggers still work but
    /// no background loop is spawned.
    pub async fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.enabled {
            tracing::info!("Billing scheduler disabled by configuration");
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let scheduler = self.scheduler.clone();
        let tick_interval = self.tick_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = interval.tick() => {
                        if let Err(err) = scheduler.tick(OffsetDateTime::now_utc()).await {
                            tracing::error!(error = %err, "Billing tick failed");
                        }
                    }
                }
            }
            tracing::info!("Billing scheduler loop stopped");
        });

        *self.runner.lock().await = Some(RunnerHandle { stop, task });
        tracing::info!(
            tick_seconds = self.tick_interval.as_secs(),
            "Billing scheduler started"
        );
    }

    /// Stop scheduling future ticks and wait for the loop to exit. A tick
    /// already executing finishes first.
    pub async fn shutdown(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        if let Some(runner) = self.runner.lock().await.take() {
            let _ = runner.stop.send(true);
            let _ = runner.task.await;
        }
    }

    /// Manually bill one subscription right now. Refused before
    /// `initialize`; unknown ids are `NotFound`. Returns the tick summary
    /// for just this subscription.
    pub async fn trigger_billing(&self, subscription_id: Uuid) -> BillingResult<TickSummary> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BillingError::SchedulerNotInitialized);
        }
        let subscription = self
            .subscriptions
            .find(subscription_id)
            .await?
            .ok_or(BillingError::NotFound {
                kind: "subscription",
                id: subscription_id.to_string(),
            })?;

        tracing::info!(subscription_id = %subscription_id, "Manual billing trigger");
        self.scheduler
            .bill_one(&subscription, OffsetDateTime::now_utc())
            .await
    }

    pub async fn retry_statistics(&self) -> BillingResult<RetryStatistics> {
        self.scheduler.retry_statistics().await
    }
}
