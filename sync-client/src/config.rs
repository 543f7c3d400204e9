//! Configuration loading for the Pictor data layer.
//!
//! Configuration is loaded from a TOML file (default: `pictor.toml`). Every
//! field has a default, so a partial file, or none at all, is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use sync_core::{PullPolicy, PurgePolicy, RetryPolicy, SanityPolicy};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local store configuration.
    pub storage: StorageConfig,
    /// Sync cycle configuration.
    pub sync: SyncConfig,
    /// Retry schedule of failed pushes.
    pub retry: RetryConfig,
    /// Tombstone garbage collection.
    pub purge: PurgeConfig,
    /// Full reconciliation pass.
    pub sanity: SanityConfig,
    /// Background scheduler.
    pub scheduler: SchedulerConfig,
}

/// Local store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

/// Sync cycle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Identifier of this device, stored in its session record.
    #[serde(default = "default_device_id")]
    pub device_id: String,
    /// Page size requested from change feeds (default: 100).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Timeout of every cloud call in seconds (default: 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum time between pulls of timer-driven cycles in seconds
    /// (default: 900 = 15 minutes).
    #[serde(default = "default_pull_interval_secs")]
    pub pull_interval_secs: u64,
}

/// Retry schedule of failed pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay after the first failure in seconds (default: 30).
    #[serde(default = "default_retry_base_secs")]
    pub base_secs: u64,
    /// Upper bound of the delay in seconds (default: 3600).
    #[serde(default = "default_retry_cap_secs")]
    pub cap_secs: u64,
    /// Attempts before a retryable failure becomes terminal (default: 8).
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    /// Randomize delays (default: true).
    #[serde(default = "default_true")]
    pub jitter: bool,
}

/// Tombstone garbage collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Minimum tombstone age before removal in seconds (default: 7 days).
    #[serde(default = "default_purge_grace_secs")]
    pub grace_secs: u64,
}

/// Full reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanityConfig {
    /// Time between successful passes in seconds (default: 7 days).
    #[serde(default = "default_sanity_interval_secs")]
    pub interval_secs: u64,
    /// Time to wait after a failed pass in seconds (default: 3600).
    #[serde(default = "default_sanity_retry_secs")]
    pub retry_interval_secs: u64,
}

/// Background scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run timer-driven cycles (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Time between timer-driven cycles in seconds (default: 300).
    #[serde(default = "default_scheduler_interval_secs")]
    pub interval_secs: u64,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("pictor.db")
}

fn default_device_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_pull_interval_secs() -> u64 {
    15 * 60
}

fn default_retry_base_secs() -> u64 {
    30
}

fn default_retry_cap_secs() -> u64 {
    3600
}

fn default_retry_max_attempts() -> u32 {
    8
}

fn default_purge_grace_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_sanity_interval_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_sanity_retry_secs() -> u64 {
    3600
}

fn default_scheduler_interval_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            page_size: default_page_size(),
            request_timeout_secs: default_request_timeout_secs(),
            pull_interval_secs: default_pull_interval_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_secs: default_retry_base_secs(),
            cap_secs: default_retry_cap_secs(),
            max_attempts: default_retry_max_attempts(),
            jitter: default_true(),
        }
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_purge_grace_secs(),
        }
    }
}

impl Default for SanityConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sanity_interval_secs(),
            retry_interval_secs: default_sanity_retry_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_scheduler_interval_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }

    /// Timeout of every cloud call.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_secs)
    }

    /// Retry schedule of failed pushes.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(self.retry.base_secs),
            cap: Duration::from_secs(self.retry.cap_secs),
            max_attempts: self.retry.max_attempts,
            jitter: self.retry.jitter,
        }
    }

    /// Pull gating of timer-driven cycles.
    pub fn pull_policy(&self) -> PullPolicy {
        PullPolicy {
            interval: Duration::from_secs(self.sync.pull_interval_secs),
        }
    }

    /// Tombstone garbage collection.
    pub fn purge_policy(&self) -> PurgePolicy {
        PurgePolicy {
            grace: Duration::from_secs(self.purge.grace_secs),
        }
    }

    /// Full reconciliation gating.
    pub fn sanity_policy(&self) -> SanityPolicy {
        SanityPolicy {
            interval: Duration::from_secs(self.sanity.interval_secs),
            retry_interval: Duration::from_secs(self.sanity.retry_interval_secs),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// Failed to serialize the configuration.
    #[error("failed to serialize config: {0}")]
    SerializeError(#[source] toml::ser::Error),
}
