//! Configuration module
//!
//! Runtime knobs for the outbox publisher and the snapshot subsystem,
//! with defaults and environment-variable overrides.

use std::env;
use std::time::Duration;

/// Outbox publisher configuration
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Tick period of the publish loop
    pub publish_interval: Duration,

    /// Maximum entries fetched per tick
    pub batch_size: i64,

    /// Failed-attempt threshold for DLQ migration
    pub max_retries: i32,

    /// Base interval for exponential retry backoff
    pub retry_interval: Duration,

    /// Tick period of published-row deletion
    pub cleanup_interval: Duration,

    /// Age threshold for published-row deletion
    pub retention_period: Duration,

    /// Worker tasks of the parallel publisher
    pub worker_count: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(5),
            batch_size: 100,
            max_retries: 5,
            retry_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(3600),
            retention_period: Duration::from_secs(7 * 24 * 3600),
            worker_count: 4,
        }
    }
}

impl OutboxConfig {
    /// Load configuration from environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            publish_interval: secs_var("OUTBOX_PUBLISH_INTERVAL_SECS", defaults.publish_interval)?,
            batch_size: parse_var("OUTBOX_BATCH_SIZE", defaults.batch_size)?,
            max_retries: parse_var("OUTBOX_MAX_RETRIES", defaults.max_retries)?,
            retry_interval: secs_var("OUTBOX_RETRY_INTERVAL_SECS", defaults.retry_interval)?,
            cleanup_interval: secs_var("OUTBOX_CLEANUP_INTERVAL_SECS", defaults.cleanup_interval)?,
            retention_period: secs_var("OUTBOX_RETENTION_SECS", defaults.retention_period)?,
            worker_count: parse_var("OUTBOX_WORKER_COUNT", defaults.worker_count)?,
        })
    }
}

/// Snapshot subsystem configuration
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Master switch; when off the manager neither creates nor loads
    pub enabled: bool,

    /// Minimum event delta between snapshots of one aggregate
    pub frequency: i64,

    /// Age threshold for snapshot cleanup
    pub retention: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency: 100,
            retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl SnapshotConfig {
    /// Load configuration from environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            enabled: parse_var("SNAPSHOT_ENABLED", defaults.enabled)?,
            frequency: parse_var("SNAPSHOT_FREQUENCY", defaults.frequency)?,
            retention: secs_var("SNAPSHOT_RETENTION_SECS", defaults.retention)?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_var(
        name,
        default.as_secs(),
    )?))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
