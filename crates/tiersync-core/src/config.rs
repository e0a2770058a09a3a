//! Configuration management for TierSync
//!
//! This module provides a centralized configuration system that supports:
//! - YAML/TOML/JSON configuration files
//! - Environment variable overrides
//! - Reasonable defaults
//! - Configuration validation

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure for TierSync
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TiersyncConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub evaluator: EvaluatorConfig,

    #[serde(default)]
    pub bandwidth: BandwidthConfig,

    #[serde(default)]
    pub state: StateConfig,
}

impl TiersyncConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest priority)
    /// 2. Config file specified by TIERSYNC_CONFIG env var
    /// 3. ./config/tiersync.{yaml,toml,json}
    /// 4. /etc/tiersync/tiersync.{yaml,toml,json}
    /// 5. Hardcoded defaults (lowest priority)
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        builder = Self::set_defaults(builder)?;

        if let Ok(config_path) = std::env::var("TIERSYNC_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        builder = builder
            .add_source(File::with_name("./config/tiersync").required(false))
            .add_source(File::with_name("/etc/tiersync/tiersync").required(false));

        // Example: TIERSYNC__EXECUTOR__RETRY__MAX_ATTEMPTS=5
        builder = builder.add_source(
            Environment::with_prefix("TIERSYNC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TiersyncConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Set default values for all configuration options
    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            // Scheduler
            .set_default("scheduler.max_concurrent_tasks", 4)?
            .set_default("scheduler.tick_interval_secs", 30)?
            .set_default("scheduler.history_max_entries", 1000)?
            .set_default("scheduler.history_ttl_secs", 604_800)?
            // Executor
            .set_default("executor.max_concurrent_items", 8)?
            .set_default("executor.chunk_size_bytes", 8 * 1024 * 1024)?
            .set_default("executor.item_timeout_secs", 300)?
            .set_default("executor.retry.max_attempts", 3)?
            .set_default("executor.retry.initial_backoff_ms", 500)?
            .set_default("executor.retry.max_backoff_ms", 30_000)?
            .set_default("executor.retry.backoff_multiplier", 2.0)?
            // Evaluator
            .set_default("evaluator.sweep_interval_secs", 3600)?
            .set_default("evaluator.cas_max_attempts", 5)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(ConfigError::Message(
                "scheduler.max_concurrent_tasks must be > 0".to_string(),
            ));
        }

        if self.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::Message(
                "scheduler.tick_interval_secs must be > 0".to_string(),
            ));
        }

        if self.executor.max_concurrent_items == 0 {
            return Err(ConfigError::Message(
                "executor.max_concurrent_items must be > 0".to_string(),
            ));
        }

        if self.executor.chunk_size_bytes == 0 {
            return Err(ConfigError::Message(
                "executor.chunk_size_bytes must be > 0".to_string(),
            ));
        }

        if self.executor.item_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "executor.item_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.executor.retry.max_attempts == 0 {
            return Err(ConfigError::Message(
                "executor.retry.max_attempts must be > 0".to_string(),
            ));
        }

        if self.executor.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Message(
                "executor.retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }

        if self.evaluator.cas_max_attempts == 0 {
            return Err(ConfigError::Message(
                "evaluator.cas_max_attempts must be > 0".to_string(),
            ));
        }

        if self
            .bandwidth
            .target_defaults
            .values()
            .any(|limit| *limit == 0)
        {
            return Err(ConfigError::Message(
                "bandwidth.target_defaults values must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a specific file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: TiersyncConfig = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }
}

/// Sync scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum tasks running at once; excess due tasks stay queued
    pub max_concurrent_tasks: usize,

    /// Seconds between background ticks
    pub tick_interval_secs: u64,

    /// Maximum retained job outcomes with failures
    pub history_max_entries: usize,

    /// Seconds a retained outcome is kept
    pub history_ttl_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            tick_interval_secs: 30,
            history_max_entries: 1000,
            history_ttl_secs: 604_800, // 7 days
        }
    }
}

impl SchedulerConfig {
    /// Get tick interval as Duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Transfer executor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Items transferred in parallel within one job
    pub max_concurrent_items: usize,

    /// Bytes per chunk; bandwidth tokens are acquired per chunk
    pub chunk_size_bytes: u64,

    /// Per-attempt timeout for one item transfer
    pub item_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_items: 8,
            chunk_size_bytes: 8 * 1024 * 1024,
            item_timeout_secs: 300,
            retry: RetryConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Get item timeout as Duration
    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }
}

/// Retry configuration for item transfers
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per item, including the first
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Get initial backoff duration
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Get maximum backoff duration
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Calculate backoff delay for a given retry attempt
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        // Clamp the exponent; the cap is reached long before this.
        let exponent = attempt.min(30) as i32;
        let delay_ms = (self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent))
            .min(self.max_backoff_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Tiering evaluator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Seconds between background sweeps
    pub sweep_interval_secs: u64,

    /// Read-modify-write attempts before a ledger conflict is surfaced
    pub cas_max_attempts: u32,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 3600,
            cas_max_attempts: 5,
        }
    }
}

impl EvaluatorConfig {
    /// Get sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Bandwidth configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Default ceiling in bytes/sec per target id, applied to both directions
    /// in addition to task ceilings
    #[serde(default)]
    pub target_defaults: HashMap<String, u64>,
}

/// Durable state configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StateConfig {
    /// Directory holding the ledger, manifests and job history between
    /// restarts; state is kept in memory only when unset
    pub dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let config = TiersyncConfig::default();

        assert_eq!(config.scheduler.max_concurrent_tasks, 4);
        assert_eq!(config.scheduler.tick_interval_secs, 30);
        assert_eq!(config.executor.max_concurrent_items, 8);
        assert_eq!(config.executor.retry.max_attempts, 3);
        assert_eq!(config.evaluator.sweep_interval_secs, 3600);
        assert!(config.bandwidth.target_defaults.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_config_backoff() {
        let retry = RetryConfig::default();

        assert_eq!(retry.backoff_for_attempt(0).as_millis(), 500);
        assert_eq!(retry.backoff_for_attempt(1).as_millis(), 1000);
        assert_eq!(retry.backoff_for_attempt(2).as_millis(), 2000);

        let long_backoff = retry.backoff_for_attempt(20);
        assert_eq!(long_backoff.as_millis(), 30_000);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = TiersyncConfig::default();

        config.scheduler.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());
        config.scheduler.max_concurrent_tasks = 2;
        assert!(config.validate().is_ok());

        config.executor.retry.max_attempts = 0;
        assert!(config.validate().is_err());
        config.executor.retry.max_attempts = 3;

        config
            .bandwidth
            .target_defaults
            .insert("target".to_string(), 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("tiersync-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tiersync.json");
        std::fs::write(
            &path,
            r#"{"scheduler": {"max_concurrent_tasks": 2},
                "executor": {"retry": {"max_attempts": 5}},
                "state": {"dir": "/var/lib/tiersync"}}"#,
        )
        .unwrap();

        let config = TiersyncConfig::from_file(&path).unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 2);
        assert_eq!(config.scheduler.tick_interval_secs, 30);
        assert_eq!(config.scheduler.history_max_entries, 1000);
        assert_eq!(config.executor.max_concurrent_items, 8);
        assert_eq!(config.executor.retry.max_attempts, 5);
        assert_eq!(config.executor.retry.initial_backoff_ms, 500);
        assert_eq!(config.evaluator.cas_max_attempts, 5);
        assert_eq!(
            config.state.dir.as_deref(),
            Some(Path::new("/var/lib/tiersync"))
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
