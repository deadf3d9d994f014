//! Shared configuration for the payrail services.

pub mod config;

pub use config::{Config, ConfigError, RetryDefaults};
