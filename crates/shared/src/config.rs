//! Environment-based configuration
//!
//! Every knob is overridable via environment variables; defaults match the
//! documented billing-retry and queue behavior.

use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Exponential-backoff defaults for failed payment retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDefaults {
    /// Maximum retry attempts before a subscription is suspended.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single retry delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Factor by which the delay grows per failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 60_000,
            max_delay_ms: 86_400_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Process configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Shared secret for inbound webhook signature verification.
    pub webhook_secret: Option<String>,
    /// Gateway credentials, validated as a pair at gateway construction.
    pub gateway_api_login_id: Option<String>,
    pub gateway_transaction_key: Option<String>,
    /// Per-event retry budget for webhook processing.
    pub webhook_max_retries: u32,
    pub billing_retry: RetryDefaults,
    pub billing_scheduler_enabled: bool,
    pub billing_tick_seconds: u64,
    pub queue_poll_seconds: u64,
    pub queue_batch_size: u32,
    pub port: u16,
}

fn parse_var<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// `DATABASE_URL` is the only hard requirement; everything else falls
    /// back to documented defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            webhook_secret: env::var("WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
            gateway_api_login_id: env::var("GATEWAY_API_LOGIN_ID").ok(),
            gateway_transaction_key: env::var("GATEWAY_TRANSACTION_KEY").ok(),
            webhook_max_retries: parse_var("WEBHOOK_MAX_RETRIES", 3)?,
            billing_retry: RetryDefaults {
                max_attempts: parse_var("BILLING_RETRY_MAX_ATTEMPTS", 5)?,
                base_delay_ms: parse_var("BILLING_RETRY_BASE_DELAY_MS", 60_000)?,
                max_delay_ms: parse_var("BILLING_RETRY_MAX_DELAY_MS", 86_400_000)?,
                backoff_multiplier: parse_var("BILLING_RETRY_BACKOFF_MULTIPLIER", 2.0)?,
            },
            billing_scheduler_enabled: parse_var("BILLING_SCHEDULER_ENABLED", true)?,
            billing_tick_seconds: parse_var("BILLING_TICK_SECONDS", 60)?,
            queue_poll_seconds: parse_var("QUEUE_POLL_SECONDS", 5)?,
            queue_batch_size: parse_var("QUEUE_BATCH_SIZE", 20)?,
            port: parse_var("PORT", 8080)?,
        })
    }
}
