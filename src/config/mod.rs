//! Configuration management.
//!
//! flowrun configuration can come from:
//! - Config file (~/.config/flowrun/config.toml)
//! - Environment variables (FLOWRUN_*), which take precedence

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::QueueRetryPolicy;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// flowrun configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Node-level retry backoff
    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Expression environment
    #[serde(default)]
    pub env: EnvConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

/// Job-level redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_queue_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_queue_base_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_queue_base_delay_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time an open circuit waits before a probe
    #[serde(default = "default_open_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_open_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Variables exposed as `$env` besides the FLOWRUN_* ones
    #[serde(default)]
    pub allowlist: Vec<String>,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Parse a config file body; missing sections keep their defaults.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("flowrun"))
            .unwrap_or_else(|| PathBuf::from(".flowrun"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("flowrun"))
            .unwrap_or_else(|| PathBuf::from(".flowrun"))
    }

    /// Database path, defaulting to the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("flowrun.db"))
    }

    pub fn queue_policy(&self) -> QueueRetryPolicy {
        QueueRetryPolicy::new(
            self.queue.max_attempts,
            Duration::from_millis(self.queue.base_delay_ms),
        )
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold.max(1),
            success_threshold: self.circuit_breaker.success_threshold.max(1),
            timeout: Duration::from_millis(self.circuit_breaker.timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.trim().parse().ok())
        }

        if let Some(n) = parsed(var("FLOWRUN_WORKER_CONCURRENCY")) {
            self.worker.concurrency = n;
        }
        if let Some(n) = parsed(var("FLOWRUN_QUEUE_MAX_ATTEMPTS")) {
            self.queue.max_attempts = n;
        }
        if let Some(ms) = parsed(var("FLOWRUN_QUEUE_BASE_DELAY_MS")) {
            self.queue.base_delay_ms = ms;
        }
        if let Some(n) = parsed(var("FLOWRUN_CIRCUIT_FAILURE_THRESHOLD")) {
            self.circuit_breaker.failure_threshold = n;
        }
        if let Some(n) = parsed(var("FLOWRUN_CIRCUIT_SUCCESS_THRESHOLD")) {
            self.circuit_breaker.success_threshold = n;
        }
        if let Some(ms) = parsed(var("FLOWRUN_CIRCUIT_TIMEOUT_MS")) {
            self.circuit_breaker.timeout_ms = ms;
        }
        if let Some(ms) = parsed(var("FLOWRUN_RETRY_BASE_DELAY_MS")) {
            self.retry.base_delay_ms = ms;
        }
        if let Some(ms) = parsed(var("FLOWRUN_RETRY_MAX_DELAY_MS")) {
            self.retry.max_delay_ms = ms;
        }
        if let Some(path) = var("FLOWRUN_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Some(list) = var("FLOWRUN_ENV_ALLOWLIST") {
            self.env.allowlist = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(worker) = partial.worker {
            self.worker = worker;
        }
        if let Some(queue) = partial.queue {
            self.queue = queue;
        }
        if let Some(circuit_breaker) = partial.circuit_breaker {
            self.circuit_breaker = circuit_breaker;
        }
        if let Some(retry) = partial.retry {
            self.retry = retry;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(env) = partial.env {
            self.env = env;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    worker: Option<WorkerConfig>,
    queue: Option<QueueConfig>,
    circuit_breaker: Option<CircuitBreakerSettings>,
    retry: Option<RetrySettings>,
    storage: Option<StorageConfig>,
    env: Option<EnvConfig>,
}
