//! Accumulator configuration.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - Environment variable overrides
//! - Builder-style programmatic construction
//! - Eager validation (invalid settings never reach a running accumulator)

use crate::core::{Result, TallyError};
use crate::metrics::DeltaPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default per-shard submission queue capacity
pub const DEFAULT_QUEUE_SIZE: usize = 1000;
/// Default number of traces drained from a queue per batch
pub const DEFAULT_BATCH_SIZE: usize = 10;
/// Default initial capacity of each shard's aggregate map
pub const DEFAULT_MAP_CAPACITY: usize = 512;
/// Default flush period
pub const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(15);
/// Default bound on how long a flush waits for all shards
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Complete configuration for an accumulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulatorConfig {
    /// Number of independent single-writer shards
    pub shard_count: usize,
    /// Capacity of each shard's submission queue
    pub queue_size: usize,
    /// Maximum traces applied per worker batch
    pub batch_size: usize,
    /// Period between automatic flushes, zero means manual flushing only
    #[serde(with = "humantime_serde")]
    pub flush_period: Duration,
    /// Upper bound on a flush cycle's wait for the shard workers
    #[serde(with = "humantime_serde")]
    pub flush_timeout: Duration,
    /// Initial capacity hint for each shard's aggregate map
    pub map_capacity: usize,
    /// What to do with a trace when its shard queue is full
    pub rejection_policy: RejectionPolicy,
    /// How delta metrics treat a value lower than the baseline
    pub delta_policy: DeltaPolicy,
}

/// Rejection policy applied when a shard queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RejectionPolicy {
    /// Drop the trace and count it
    Discard,
    /// Wait up to `timeout` for space, then drop and count
    Block {
        /// Longest a producer waits for queue space
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
}

impl RejectionPolicy {
    /// Policy name for stats and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionPolicy::Discard => "discard",
            RejectionPolicy::Block { .. } => "block",
        }
    }
}

impl Default for RejectionPolicy {
    fn default() -> Self {
        RejectionPolicy::Discard
    }
}

/// Half of the available CPU parallelism, never less than one.
pub fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        AccumulatorConfig {
            shard_count: default_shard_count(),
            queue_size: DEFAULT_QUEUE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_period: DEFAULT_FLUSH_PERIOD,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            map_capacity: DEFAULT_MAP_CAPACITY,
            rejection_policy: RejectionPolicy::Discard,
            delta_policy: DeltaPolicy::default(),
        }
    }
}

impl AccumulatorConfig {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = AccumulatorConfig::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(TallyError::config("shard_count must be greater than 0"));
        }

        if self.queue_size == 0 {
            return Err(TallyError::config("queue_size must be greater than 0"));
        }

        if self.batch_size == 0 {
            return Err(TallyError::config("batch_size must be greater than 0"));
        }

        if self.flush_timeout.is_zero() {
            return Err(TallyError::config("flush_timeout must be greater than 0"));
        }

        if let RejectionPolicy::Block { timeout } = self.rejection_policy {
            if timeout.is_zero() {
                return Err(TallyError::config(
                    "block rejection policy requires a non-zero timeout",
                ));
            }
        }

        Ok(())
    }

    /// True when flushes are driven by the periodic ticker
    pub fn is_periodic(&self) -> bool {
        !self.flush_period.is_zero()
    }
}

/// Configuration builder for programmatic construction
pub struct ConfigBuilder {
    config: AccumulatorConfig,
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: AccumulatorConfig::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| TallyError::config(format!("Failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Load configuration from a YAML file
    pub fn from_file(self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TallyError::config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        self.from_yaml(&content)
    }

    /// Apply `TALLY_*` environment variable overrides
    pub fn from_env(self) -> Result<Self> {
        self.from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| TallyError::config(format!("Invalid value for {}: {:?}", key, raw)))
        }

        if let Some(raw) = lookup("TALLY_SHARDS") {
            self.config.shard_count = parse("TALLY_SHARDS", &raw)?;
        }
        if let Some(raw) = lookup("TALLY_QUEUE_SIZE") {
            self.config.queue_size = parse("TALLY_QUEUE_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("TALLY_BATCH_SIZE") {
            self.config.batch_size = parse("TALLY_BATCH_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("TALLY_FLUSH_PERIOD_MS") {
            let millis: u64 = parse("TALLY_FLUSH_PERIOD_MS", &raw)?;
            self.config.flush_period = Duration::from_millis(millis);
        }
        if let Some(raw) = lookup("TALLY_POLICY") {
            // Unknown names fall back to the default discard policy
            self.config.rejection_policy = match raw.trim().to_lowercase().as_str() {
                "block" => RejectionPolicy::Block {
                    timeout: Duration::from_millis(10),
                },
                "discard" => RejectionPolicy::Discard,
                other => {
                    tracing::warn!(policy = other, "Unknown rejection policy, using discard");
                    RejectionPolicy::Discard
                },
            };
        }

        Ok(self)
    }

    /// Set shard count
    pub fn shard_count(mut self, shards: usize) -> Self {
        self.config.shard_count = shards;
        self
    }

    /// Set per-shard queue size
    pub fn queue_size(mut self, size: usize) -> Self {
        self.config.queue_size = size;
        self
    }

    /// Set worker batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set flush period (zero for manual flushing)
    pub fn flush_period(mut self, period: Duration) -> Self {
        self.config.flush_period = period;
        self
    }

    /// Set flush period in milliseconds
    pub fn flush_period_millis(self, millis: u64) -> Self {
        self.flush_period(Duration::from_millis(millis))
    }

    /// Set the bounded wait for a flush cycle
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.config.flush_timeout = timeout;
        self
    }

    /// Set aggregate map capacity hint
    pub fn map_capacity(mut self, capacity: usize) -> Self {
        self.config.map_capacity = capacity;
        self
    }

    /// Set queue rejection policy
    pub fn rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.config.rejection_policy = policy;
        self
    }

    /// Set delta policy
    pub fn delta_policy(mut self, policy: DeltaPolicy) -> Self {
        self.config.delta_policy = policy;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<AccumulatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = AccumulatorConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.shard_count >= 1);
        assert_eq!(config.queue_size, 1000);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.flush_period, Duration::from_secs(15));
        assert_eq!(config.rejection_policy, RejectionPolicy::Discard);
    }

    #[test]
    fn test_non_positive_sizes_rejected() {
        assert!(ConfigBuilder::new().shard_count(0).build().is_err());
        assert!(ConfigBuilder::new().queue_size(0).build().is_err());
        assert!(ConfigBuilder::new().batch_size(0).build().is_err());
        assert!(ConfigBuilder::new()
            .flush_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_block_policy_requires_timeout() {
        let result = ConfigBuilder::new()
            .rejection_policy(RejectionPolicy::Block {
                timeout: Duration::ZERO,
            })
            .build();
        assert!(matches!(result, Err(TallyError::Config(_))));
    }

    #[test]
    fn test_zero_period_is_manual() {
        let config = ConfigBuilder::new().flush_period_millis(0).build().unwrap();
        assert!(!config.is_periodic());
        let config = ConfigBuilder::new().flush_period_millis(1000).build().unwrap();
        assert!(config.is_periodic());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
shard_count: 4
queue_size: 2048
batch_size: 32
flush_period: 5s
flush_timeout: 2s
rejection_policy:
  kind: block
  timeout: 25ms
delta_policy: absolute
"#;

        let config = ConfigBuilder::new().from_yaml(yaml).unwrap().build().unwrap();

        assert_eq!(config.shard_count, 4);
        assert_eq!(config.queue_size, 2048);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.flush_period, Duration::from_secs(5));
        assert_eq!(config.flush_timeout, Duration::from_secs(2));
        assert_eq!(
            config.rejection_policy,
            RejectionPolicy::Block {
                timeout: Duration::from_millis(25)
            }
        );
        assert_eq!(config.delta_policy, DeltaPolicy::Absolute);
        assert_eq!(config.map_capacity, DEFAULT_MAP_CAPACITY);
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let result = ConfigBuilder::new().from_yaml("shard_count: [oops");
        assert!(matches!(result, Err(TallyError::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TALLY_SHARDS", "3"),
            ("TALLY_QUEUE_SIZE", "64"),
            ("TALLY_FLUSH_PERIOD_MS", "0"),
            ("TALLY_POLICY", "block"),
        ]
        .into_iter()
        .collect();

        let config = ConfigBuilder::new()
            .from_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(config.shard_count, 3);
        assert_eq!(config.queue_size, 64);
        assert!(!config.is_periodic());
        assert_eq!(config.rejection_policy.as_str(), "block");
    }

    #[test]
    fn test_env_parse_failure() {
        let result = ConfigBuilder::new().from_vars(|key| {
            (key == "TALLY_BATCH_SIZE").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(TallyError::Config(_))));
    }
}
