//! Configuration management for Spillway.
//!
//! Configuration is static for the life of the process. It is loaded from an
//! optional YAML file and layered with `SPILLWAY__`-prefixed environment
//! variables, e.g. `SPILLWAY__STORE__URL=redis://cache:6379/`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SpillwayError};
use crate::ratelimit::WindowSpec;

/// Environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "SPILLWAY";

/// Main configuration for the Spillway service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpillwayConfig {
    /// Window limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Counting store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Overflow queue connection
    #[serde(default)]
    pub queue: QueueConfig,

    /// Deferred worker behaviour
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// The two fixed window limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Short window guarding against instantaneous spikes
    #[serde(default = "default_burst")]
    pub burst: WindowSpec,

    /// Long window guarding average throughput
    #[serde(default = "default_sustained")]
    pub sustained: WindowSpec,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            sustained: default_sustained(),
        }
    }
}

fn default_burst() -> WindowSpec {
    WindowSpec::new(1, 1)
}

fn default_sustained() -> WindowSpec {
    WindowSpec::new(20, 60)
}

/// Counting store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; use `rediss://` for TLS
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix applied to every window key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single store round trip
    #[serde(default = "default_op_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Overflow queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Redis URL; defaults to the same backend as the store
    #[serde(default)]
    pub url: Option<String>,

    /// Queue name, used as the Redis key namespace
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Upper bound on a single queue round trip
    #[serde(default = "default_op_timeout_ms")]
    pub timeout_ms: u64,

    /// How often an idle consumer polls the backend
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: None,
            name: default_queue_name(),
            timeout_ms: default_op_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Deferred worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum tasks executing at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Total attempts before a transiently failing task is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Ceiling for the exponential backoff
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Upper bound on one execution of the unit of work
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,

    /// How long a single reserve call waits for work
    #[serde(default = "default_reserve_wait_ms")]
    pub reserve_wait_ms: u64,

    /// Grace on top of the execution timeout before a reservation counts as stalled
    #[serde(default = "default_stall_margin_ms")]
    pub stall_margin_ms: u64,

    /// How often the worker requeues stalled reservations
    #[serde(default = "default_stall_check_interval_ms")]
    pub stall_check_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            execution_timeout_ms: default_execution_timeout_ms(),
            reserve_wait_ms: default_reserve_wait_ms(),
            stall_margin_ms: default_stall_margin_ms(),
            stall_check_interval_ms: default_stall_check_interval_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn reserve_wait(&self) -> Duration {
        Duration::from_millis(self.reserve_wait_ms)
    }

    /// Age after which a reserved task is presumed abandoned by its consumer.
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms.saturating_add(self.stall_margin_ms))
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_millis(self.stall_check_interval_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    "spillway:".to_string()
}

fn default_op_timeout_ms() -> u64 {
    500
}

fn default_queue_name() -> String {
    "task-queue".to_string()
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_execution_timeout_ms() -> u64 {
    30_000
}

fn default_reserve_wait_ms() -> u64 {
    1000
}

fn default_stall_margin_ms() -> u64 {
    30_000
}

fn default_stall_check_interval_ms() -> u64 {
    15_000
}

impl SpillwayConfig {
    /// Load configuration from an optional file, layered with environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        let config: SpillwayConfig = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
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
        let config: SpillwayConfig = serde_yaml::from_str(yaml)
            .map_err(|e| SpillwayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The Redis URL the overflow queue connects to.
    pub fn queue_url(&self) -> &str {
        self.queue.url.as_deref().unwrap_or(&self.store.url)
    }

    /// Reject values that would make a limiter or the worker meaningless.
    pub fn validate(&self) -> Result<()> {
        for (name, window) in [("burst", &self.limits.burst), ("sustained", &self.limits.sustained)] {
            if window.capacity == 0 {
                return Err(SpillwayError::Config(format!("{} capacity must be positive", name)));
            }
            if window.duration_secs == 0 {
                return Err(SpillwayError::Config(format!("{} duration must be positive", name)));
            }
        }
        if self.store.timeout_ms == 0 || self.queue.timeout_ms == 0 {
            return Err(SpillwayError::Config("store and queue timeouts must be positive".into()));
        }
        if self.worker.concurrency == 0 {
            return Err(SpillwayError::Config("worker concurrency must be positive".into()));
        }
        if self.worker.max_attempts == 0 {
            return Err(SpillwayError::Config("worker max_attempts must be positive".into()));
        }
        if self.worker.execution_timeout_ms == 0 {
            return Err(SpillwayError::Config("worker execution timeout must be positive".into()));
        }
        if self.worker.stall_check_interval_ms == 0 {
            return Err(SpillwayError::Config("worker stall check interval must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_fixed_limits() {
        let config = SpillwayConfig::default();
        assert_eq!(config.limits.burst, WindowSpec::new(1, 1));
        assert_eq!(config.limits.sustained, WindowSpec::new(20, 60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
store:
  url: rediss://cache.internal:6380/
  timeout_ms: 250
worker:
  concurrency: 8
"#;
        let config = SpillwayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.url, "rediss://cache.internal:6380/");
        assert_eq!(config.store.timeout(), Duration::from_millis(250));
        assert_eq!(config.store.key_prefix, "spillway:");
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.max_attempts, 5);
        assert_eq!(config.queue_url(), "rediss://cache.internal:6380/");
    }

    #[test]
    fn test_separate_queue_url() {
        let yaml = r#"
queue:
  url: redis://queue:6379/
  name: overflow
"#;
        let config = SpillwayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.queue_url(), "redis://queue:6379/");
        assert_eq!(config.queue.name, "overflow");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let yaml = r#"
limits:
  burst:
    capacity: 0
    duration_secs: 1
"#;
        let err = SpillwayConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, SpillwayError::Config(_)));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = SpillwayConfig::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stall_timeout_extends_execution_timeout() {
        let yaml = r#"
worker:
  execution_timeout_ms: 5000
  stall_margin_ms: 2000
"#;
        let config = SpillwayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.worker.stall_timeout(), Duration::from_secs(7));
        assert_eq!(config.worker.stall_check_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = SpillwayConfig::load(None).unwrap();
        assert_eq!(config.queue.name, "task-queue");
    }
}
