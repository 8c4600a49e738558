//! Worker configuration and the timeout hierarchy.
//!
//! Configuration can be built in code, or loaded from a YAML file layered
//! with `COMMAND_BUS`-prefixed environment variables. Validation runs
//! before a worker starts; a broken timeout hierarchy never reaches the
//! queue.

use serde::Deserialize;

use crate::utils::retry::RetryPolicy;

/// Environment variable for the configuration file path.
pub const CONFIG_ENV_VAR: &str = "COMMAND_BUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COMMAND_BUS";
/// Environment variable for the database URL.
pub const DATABASE_URL_ENV_VAR: &str = "DATABASE_URL";
/// Environment variable overriding the sync façade thread-pool size.
pub const SYNC_THREADS_ENV_VAR: &str = "COMMAND_BUS_SYNC_THREADS";

/// Default per-statement timeout enforced in worker sessions.
pub const DEFAULT_STATEMENT_TIMEOUT_MS: i64 = 25_000;
/// Default PGMQ visibility timeout for claimed messages.
pub const DEFAULT_VISIBILITY_TIMEOUT_S: i32 = 30;
/// Default maximum wait to acquire a pooled connection.
pub const DEFAULT_POOL_TIMEOUT_S: f64 = 30.0;
/// Default watchdog scan period.
pub const DEFAULT_WATCHDOG_INTERVAL_S: f64 = 10.0;
/// Grace over the visibility timeout before a dispatch task counts as stuck.
pub const STUCK_TASK_BUFFER_S: f64 = 5.0;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// The timeout hierarchy for a worker.
///
/// The statement timeout must stay strictly below the visibility timeout:
/// any SQL issued by a handler or by the pipeline has to abort before the
/// message can be redelivered to another worker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub statement_timeout_ms: i64,
    pub visibility_timeout_s: i32,
    pub pool_timeout_s: f64,
    pub watchdog_interval_s: f64,
    pub stuck_task_buffer_s: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            statement_timeout_ms: DEFAULT_STATEMENT_TIMEOUT_MS,
            visibility_timeout_s: DEFAULT_VISIBILITY_TIMEOUT_S,
            pool_timeout_s: DEFAULT_POOL_TIMEOUT_S,
            watchdog_interval_s: DEFAULT_WATCHDOG_INTERVAL_S,
            stuck_task_buffer_s: STUCK_TASK_BUFFER_S,
        }
    }
}

impl TimeoutConfig {
    /// Statement timeout in seconds.
    pub fn statement_timeout_s(&self) -> f64 {
        self.statement_timeout_ms as f64 / 1000.0
    }

    /// Runtime beyond which an in-flight dispatch task is flagged as stuck.
    pub fn stuck_threshold_s(&self) -> f64 {
        self.visibility_timeout_s as f64 + self.stuck_task_buffer_s
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.statement_timeout_ms <= 0 {
            return Err(ConfigError::Invalid(
                "statement_timeout_ms must be positive".to_string(),
            ));
        }
        if self.visibility_timeout_s <= 0 {
            return Err(ConfigError::Invalid(
                "visibility_timeout_s must be positive".to_string(),
            ));
        }
        if self.pool_timeout_s <= 0.0 {
            return Err(ConfigError::Invalid(
                "pool_timeout_s must be positive".to_string(),
            ));
        }
        if self.watchdog_interval_s <= 0.0 {
            return Err(ConfigError::Invalid(
                "watchdog_interval_s must be positive".to_string(),
            ));
        }
        if self.statement_timeout_s() >= self.visibility_timeout_s as f64 {
            return Err(ConfigError::Invalid(format!(
                "statement_timeout_ms ({} ms) must be less than visibility_timeout_s ({} s)",
                self.statement_timeout_ms, self.visibility_timeout_s
            )));
        }
        Ok(())
    }
}

/// Per-worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Domain whose command queue this worker serves.
    pub domain: String,
    /// Messages fetched per read cycle.
    pub batch_size: i32,
    /// Concurrent dispatch slots.
    pub concurrency: usize,
    /// Poll interval when no notification arrives.
    pub poll_interval_s: f64,
    /// LISTEN on the queue's notify channel for low-latency wakeups.
    pub use_notify: bool,
    /// Claim and finalize through the server-side procedures instead of
    /// the multi-statement transactions.
    pub use_stored_procedures: bool,
    /// How long `stop` waits for in-flight dispatch tasks.
    pub shutdown_grace_s: f64,
    pub retry_policy: RetryPolicy,
    pub timeouts: TimeoutConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            batch_size: 10,
            concurrency: 10,
            poll_interval_s: 1.0,
            use_notify: true,
            use_stored_procedures: false,
            shutdown_grace_s: 30.0,
            retry_policy: RetryPolicy::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Configuration for a domain, with defaults everywhere else.
    pub fn for_domain(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            ..Default::default()
        }
    }

    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `commandbus.yaml` in the current directory (if present)
    /// 2. the file given by `path` (if provided)
    /// 3. the file named by `COMMAND_BUS_CONFIG` (if set)
    /// 4. `COMMAND_BUS`-prefixed environment variables (`__` separator)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new("commandbus", FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let loaded = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let worker: WorkerConfig = loaded.try_deserialize()?;
        worker.validate()?;
        Ok(worker)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.is_empty() {
            return Err(ConfigError::Invalid("domain must not be empty".to_string()));
        }
        if self.batch_size <= 0 {
            return Err(ConfigError::Invalid(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be positive".to_string(),
            ));
        }
        if self.poll_interval_s <= 0.0 {
            return Err(ConfigError::Invalid(
                "poll_interval_s must be positive".to_string(),
            ));
        }
        if self.retry_policy.max_attempts <= 0 {
            return Err(ConfigError::Invalid(
                "retry_policy.max_attempts must be positive".to_string(),
            ));
        }
        self.timeouts.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_defaults() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.statement_timeout_ms, 25_000);
        assert_eq!(timeouts.visibility_timeout_s, 30);
        assert_eq!(timeouts.pool_timeout_s, 30.0);
        assert_eq!(timeouts.watchdog_interval_s, 10.0);
        assert_eq!(timeouts.stuck_task_buffer_s, 5.0);
    }

    #[test]
    fn test_timeout_accessors() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.statement_timeout_s(), 25.0);
        assert_eq!(timeouts.stuck_threshold_s(), 35.0);
    }

    #[test]
    fn test_validate_default_passes() {
        TimeoutConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_statement_below_visibility() {
        let timeouts = TimeoutConfig {
            statement_timeout_ms: 10_000,
            visibility_timeout_s: 20,
            ..Default::default()
        };
        timeouts.validate().unwrap();
    }

    #[test]
    fn test_validate_statement_equal_visibility_fails() {
        let timeouts = TimeoutConfig {
            statement_timeout_ms: 30_000,
            visibility_timeout_s: 30,
            ..Default::default()
        };
        let err = timeouts.validate().unwrap_err();
        assert!(err.to_string().contains("must be less than"));
    }

    #[test]
    fn test_validate_statement_above_visibility_fails() {
        let timeouts = TimeoutConfig {
            statement_timeout_ms: 40_000,
            visibility_timeout_s: 30,
            ..Default::default()
        };
        assert!(timeouts.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_positive_values() {
        for timeouts in [
            TimeoutConfig {
                statement_timeout_ms: 0,
                ..Default::default()
            },
            TimeoutConfig {
                visibility_timeout_s: -1,
                ..Default::default()
            },
            TimeoutConfig {
                pool_timeout_s: 0.0,
                ..Default::default()
            },
            TimeoutConfig {
                watchdog_interval_s: -1.0,
                ..Default::default()
            },
        ] {
            assert!(timeouts.validate().is_err());
        }
    }

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::for_domain("payments");
        assert_eq!(config.domain, "payments");
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.concurrency, 10);
        assert!(config.use_notify);
        assert!(!config.use_stored_procedures);
        config.validate().unwrap();
    }

    #[test]
    fn test_worker_config_rejects_empty_domain() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_config_rejects_zero_concurrency() {
        let config = WorkerConfig {
            concurrency: 0,
            ..WorkerConfig::for_domain("payments")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_config_propagates_timeout_violation() {
        let config = WorkerConfig {
            timeouts: TimeoutConfig {
                statement_timeout_ms: 60_000,
                visibility_timeout_s: 30,
                ..Default::default()
            },
            ..WorkerConfig::for_domain("payments")
        };
        assert!(config.validate().is_err());
    }
}
