//! Configuration management for Fleetrate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{FleetrateError, Result};
use crate::lock::LockOptions;

/// Prefix for environment overrides, e.g. `FLEETRATE__LOCK__LEASE_MS=5000`.
const ENV_PREFIX: &str = "FLEETRATE";

/// Main configuration for Fleetrate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetrateConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Distributed lock configuration
    #[serde(default)]
    pub lock: LockConfig,

    /// Token bucket configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which store implementation backs the limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; only useful for a single process or tests
    Memory,
    /// A Redis server
    Redis,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Connection URL of the Redis server
    #[serde(default = "default_store_url")]
    pub url: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Timeout for a single command round-trip
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_store_url(),
            connect_timeout_ms: default_connect_timeout(),
            io_timeout_ms: default_io_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_io_timeout() -> u64 {
    1000
}

/// Distributed lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease on the lock record; a crashed holder blocks others at most this long
    #[serde(default = "default_lease")]
    pub lease_ms: u64,

    /// Fixed pause between attempts on a held lock
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Give up with `LockUnavailable` after this long. Unset retries forever.
    #[serde(default)]
    pub acquire_deadline_ms: Option<u64>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: default_lease(),
            retry_backoff_ms: default_retry_backoff(),
            acquire_deadline_ms: None,
        }
    }
}

impl LockConfig {
    /// Convert into the options the lock runs with.
    pub fn to_options(&self) -> LockOptions {
        LockOptions {
            lease: Duration::from_millis(self.lease_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            acquire_deadline: self.acquire_deadline_ms.map(Duration::from_millis),
        }
    }
}

fn default_lease() -> u64 {
    3000
}

fn default_retry_backoff() -> u64 {
    200
}

/// Token bucket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Burst capacity expressed in seconds of the configured rate
    #[serde(default = "default_max_burst_seconds")]
    pub max_burst_seconds: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_burst_seconds: default_max_burst_seconds(),
        }
    }
}

fn default_max_burst_seconds() -> f64 {
    1.0
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FleetrateConfig {
    /// Load configuration from an optional file, then apply `FLEETRATE__*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: FleetrateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FleetrateConfig =
            serde_yaml::from_str(yaml).map_err(|e| FleetrateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.lock.lease_ms == 0 {
            return Err(FleetrateError::Config("lock.lease_ms must be positive".into()));
        }
        if self.lock.retry_backoff_ms == 0 {
            return Err(FleetrateError::Config(
                "lock.retry_backoff_ms must be positive".into(),
            ));
        }
        let burst = self.limiter.max_burst_seconds;
        if burst.is_nan() || burst <= 0.0 {
            return Err(FleetrateError::Config(format!(
                "limiter.max_burst_seconds must be positive, got {}",
                burst
            )));
        }
        Ok(())
    }
}
