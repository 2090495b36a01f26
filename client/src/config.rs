//! Configuration management for a database instance.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Debounce applied to live-query refreshes after a database change.
pub const DEFAULT_LIVE_QUERY_DELAY: Duration = Duration::from_millis(200);
/// Raw change records requested from the engine per read.
pub const DEFAULT_CHANGE_BATCH_SIZE: usize = 100;
/// Upper bound on document ids carried by one change notification.
pub const DEFAULT_MAX_NOTIFICATION_IDS: usize = 1000;

/// Database configuration, loadable from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Database name, used for logging and thread names
    pub name: String,
    /// Async worker threads in the database's runtime
    pub worker_threads: usize,
    /// Live query debounce delay
    pub live_query_delay: Duration,
    /// Change records read from the engine per batch
    pub change_batch_size: usize,
    /// Maximum document ids per posted notification
    pub max_notification_ids: usize,
    /// How many times close waits for active processes
    pub close_retries: u32,
    /// How long each close wait lasts
    pub close_retry_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "harbor".to_string(),
            worker_threads: 2,
            live_query_delay: DEFAULT_LIVE_QUERY_DELAY,
            change_batch_size: DEFAULT_CHANGE_BATCH_SIZE,
            max_notification_ids: DEFAULT_MAX_NOTIFICATION_IDS,
            close_retries: 5,
            close_retry_timeout: Duration::from_secs(2),
        }
    }
}

impl DatabaseConfig {
    /// Default configuration with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables, after loading a
    /// `.env` file if one is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup. Unset keys keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            name: lookup("HARBOR_DATABASE_NAME").unwrap_or(defaults.name),
            worker_threads: parse(&lookup, "HARBOR_WORKER_THREADS", defaults.worker_threads)?,
            live_query_delay: Duration::from_millis(parse(
                &lookup,
                "HARBOR_LIVE_QUERY_DELAY_MS",
                defaults.live_query_delay.as_millis() as u64,
            )?),
            change_batch_size: parse(
                &lookup,
                "HARBOR_CHANGE_BATCH_SIZE",
                defaults.change_batch_size,
            )?,
            max_notification_ids: parse(
                &lookup,
                "HARBOR_MAX_NOTIFICATION_IDS",
                defaults.max_notification_ids,
            )?,
            close_retries: parse(&lookup, "HARBOR_CLOSE_RETRIES", defaults.close_retries)?,
            close_retry_timeout: Duration::from_millis(parse(
                &lookup,
                "HARBOR_CLOSE_RETRY_TIMEOUT_MS",
                defaults.close_retry_timeout.as_millis() as u64,
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the database cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::NoWorkerThreads);
        }
        if self.change_batch_size == 0 || self.change_batch_size > self.max_notification_ids {
            return Err(ConfigError::InvalidBatchSize {
                batch: self.change_batch_size,
                max: self.max_notification_ids,
            });
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("worker_threads must be at least 1")]
    NoWorkerThreads,

    #[error("change_batch_size {batch} must be between 1 and max_notification_ids ({max})")]
    InvalidBatchSize { batch: usize, max: usize },
}
