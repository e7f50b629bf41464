//! Configuration management for the abuse guard.

use config::Source;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::Path;
use std::time::Duration;

use crate::error::{GuardError, Result};
use crate::ratelimit::{LimitPolicy, DEFAULT_RECLAIM_BATCH, DEFAULT_RECLAIM_INTERVAL};

/// Prefix for environment variable overrides, e.g.
/// `ABUSE_GUARD__POLICY__PER_IP__BURST_LIMIT=20`.
pub const ENV_PREFIX: &str = "ABUSE_GUARD";

/// Main configuration for the abuse guard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Limit thresholds and block escalation
    #[serde(default)]
    pub policy: LimitPolicy,

    /// Background reclaimer configuration
    #[serde(default)]
    pub reclaimer: ReclaimerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Reclaimer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimerConfig {
    /// Seconds between reclaim sweeps
    #[serde(default = "default_reclaim_interval")]
    pub interval_secs: u64,

    /// Scope keys processed per lock acquisition
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reclaim_interval(),
            batch_size: default_batch_size(),
        }
    }
}

impl ReclaimerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_reclaim_interval() -> u64 {
    DEFAULT_RECLAIM_INTERVAL.as_secs()
}

fn default_batch_size() -> usize {
    DEFAULT_RECLAIM_BATCH
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON-formatted log lines
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

impl GuardConfig {
    /// Load configuration from an optional YAML file layered under
    /// environment variable overrides, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(
            path,
            config::Environment::with_prefix(ENV_PREFIX).separator("__"),
        )
    }

    /// Load an optional YAML file and apply the overrides collected by `env`.
    ///
    /// The file is parsed as-is so endpoint paths keep their case. Only the
    /// environment layer goes through `config`, whose keys are lowercase.
    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut document = match path {
            Some(path) => serde_yaml::from_str(&std::fs::read_to_string(path)?)?,
            None => Value::Null,
        };
        if document.is_null() {
            document = Value::Mapping(Mapping::new());
        }

        let mut overrides: Vec<(String, config::Value)> = env.collect()?.into_iter().collect();
        overrides.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, value) in overrides {
            let raw = value.into_string()?;
            let scalar = serde_yaml::from_str(&raw).unwrap_or_else(|_| Value::String(raw));
            let segments: Vec<&str> = key.split('.').collect();
            insert_path(&mut document, &segments, scalar);
        }

        let config: GuardConfig = serde_yaml::from_value(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GuardConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;

        if self.reclaimer.interval_secs == 0 {
            return Err(GuardError::Config(
                "reclaimer.interval_secs must be greater than zero".into(),
            ));
        }
        if self.reclaimer.batch_size == 0 {
            return Err(GuardError::Config(
                "reclaimer.batch_size must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Set `value` at a dotted key path, creating intermediate mappings.
fn insert_path(node: &mut Value, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };

    if !node.is_mapping() {
        *node = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(map) = node {
        let child = map
            .entry(Value::String(first.to_string()))
            .or_insert(Value::Null);
        insert_path(child, rest, value);
    }
}
