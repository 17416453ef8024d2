//! Configuration management for the sync client.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Backoff policy for reopening a dropped change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub factor: f64,
    /// Attempts before giving up; `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            max_retries: Some(5),
        }
    }
}

impl RetryConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.factor.powi(exponent);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Whether `attempts` failed attempts exhaust the policy.
    pub fn exhausted(&self, attempts: usize) -> bool {
        self.max_retries.is_some_and(|max| attempts > max)
    }
}

/// Tuning for one reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Records per page
    pub page_size: u32,
    /// Quiet period before pending change events are applied
    pub debounce: Duration,
    /// Apply pending events right away once this many have arrived
    pub max_batch: usize,
    /// Change feed reconnect policy
    pub reconnect: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            debounce: Duration::from_millis(1000),
            max_batch: 500,
            reconnect: RetryConfig::default(),
        }
    }
}

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: Option<String>,
    /// Postgres pool size
    pub db_max_connections: u32,
    /// Reconciler tuning
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = SyncConfig::default();

        let page_size: u32 = parse_var("SYNC_PAGE_SIZE", defaults.page_size)?;
        if page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }

        let debounce_ms: u64 = parse_var("SYNC_DEBOUNCE_MS", defaults.debounce.as_millis() as u64)?;
        let max_batch: usize = parse_var("SYNC_MAX_BATCH", defaults.max_batch)?;
        let attempts: usize = parse_var(
            "SYNC_RECONNECT_ATTEMPTS",
            defaults.reconnect.max_retries.unwrap_or(5),
        )?;
        let base_ms: u64 = parse_var(
            "SYNC_RECONNECT_BASE_MS",
            defaults.reconnect.initial_delay.as_millis() as u64,
        )?;
        let db_max_connections: u32 = parse_var("SYNC_DB_MAX_CONNECTIONS", 5)?;

        let database_url = env::var("DATABASE_URL").ok();

        Ok(Self {
            database_url,
            db_max_connections,
            sync: SyncConfig {
                page_size,
                debounce: Duration::from_millis(debounce_ms),
                max_batch: max_batch.max(1),
                reconnect: RetryConfig {
                    initial_delay: Duration::from_millis(base_ms),
                    max_retries: Some(attempts),
                    ..defaults.reconnect
                },
            },
        })
    }

    /// The database URL, or an error if it is not set.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("SYNC_PAGE_SIZE must be positive")]
    ZeroPageSize,
}
