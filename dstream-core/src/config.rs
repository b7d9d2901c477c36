//! Configuration of a streaming job.
//!
//! A [StreamingConfig] can be built in code using its builder or deserialized,
//! for example from YAML:
//!
//! ```rust
//! use dstream::config::StreamingConfig;
//!
//! let config = StreamingConfig::from_yaml_str(
//!     "
//! batch_interval: 1s
//! block_interval: 100ms
//! backpressure_enabled: true
//! ",
//! )
//! .unwrap();
//! assert_eq!(config.batch_interval, std::time::Duration::from_secs(1));
//! assert_eq!(config.replication_factor, 2);
//! ```
use std::path::PathBuf;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::is_multiple_of;

/// Default interval at which receivers seal blocks
pub const DEFAULT_BLOCK_INTERVAL: Duration = Duration::from_millis(200);
/// Block intervals below this value cost more in scheduling than they gain
pub const MIN_RECOMMENDED_BLOCK_INTERVAL: Duration = Duration::from_millis(50);
/// Multiple of the batch interval used when no checkpoint interval is configured
pub const DEFAULT_CHECKPOINT_MULTIPLIER: u32 = 5;

fn default_block_interval() -> Duration {
    DEFAULT_BLOCK_INTERVAL
}
fn default_checkpoint_retention() -> usize {
    10
}
fn default_replication_factor() -> usize {
    2
}
fn default_wal_rolling_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_receiver_restart_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_max_task_attempts() -> usize {
    4
}

/// Configuration options recognized by a [StreamingContext](crate::context::StreamingContext)
#[derive(Debug, Clone, Builder, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StreamingConfig {
    /// Interval at which batches are generated. Required.
    #[serde(with = "humantime_serde")]
    pub batch_interval: Duration,

    /// Interval at which receivers seal the records they buffered into a block
    #[builder(default = DEFAULT_BLOCK_INTERVAL)]
    #[serde(default = "default_block_interval", with = "humantime_serde")]
    pub block_interval: Duration,

    /// Directory for checkpoints and write-ahead logs. Checkpointing is disabled
    /// if this is not set.
    #[builder(into)]
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Interval at which checkpoints are taken. Defaults to
    /// [DEFAULT_CHECKPOINT_MULTIPLIER] times the batch interval.
    #[serde(default, with = "humantime_serde")]
    pub checkpoint_interval: Option<Duration>,

    /// Number of complete checkpoints kept on disk
    #[builder(default = default_checkpoint_retention())]
    #[serde(default = "default_checkpoint_retention")]
    pub checkpoint_retention: usize,

    /// Number of locations every received block is stored at
    #[builder(default = default_replication_factor())]
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Log all received data durably before making it visible to the scheduler
    #[builder(default)]
    #[serde(default)]
    pub write_ahead_log_enabled: bool,

    /// Time span covered by a single write-ahead log segment file
    #[builder(default = default_wal_rolling_interval())]
    #[serde(default = "default_wal_rolling_interval", with = "humantime_serde")]
    pub wal_rolling_interval: Duration,

    /// Dynamically adapt receiver ingestion rates to the processing rate
    #[builder(default)]
    #[serde(default)]
    pub backpressure_enabled: bool,

    /// Rate limit (records/sec) applied before the first rate estimate exists
    #[serde(default)]
    pub backpressure_initial_rate: Option<u64>,

    /// Upper bound for every receiver's ingestion rate in records/sec.
    /// Unlimited if not set.
    #[serde(default)]
    pub max_receiver_rate: Option<u64>,

    /// Minimum time materialized datasets are retained. Defaults to what the
    /// windows in the graph require.
    #[serde(default, with = "humantime_serde")]
    pub remember_duration: Option<Duration>,

    /// Delay before a failed receiver is restarted
    #[builder(default = default_receiver_restart_delay())]
    #[serde(default = "default_receiver_restart_delay", with = "humantime_serde")]
    pub receiver_restart_delay: Duration,

    /// How often a failed partition computation is attempted before the batch fails
    #[builder(default = default_max_task_attempts())]
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: usize,

    /// Number of threads used to compute partitions. Defaults to the available
    /// parallelism of the machine.
    #[serde(default)]
    pub executor_parallelism: Option<usize>,

    /// Gains of the backpressure rate estimator
    #[builder(default)]
    #[serde(default)]
    pub rate_estimator: PidConfig,
}

/// Parameters of the PID based rate estimator used for backpressure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PidConfig {
    /// Weight of the current error
    pub proportional: f64,
    /// Weight of the accumulated scheduling delay
    pub integral: f64,
    /// Weight of the error's rate of change
    pub derivative: f64,
    /// Rate (records/sec) never undercut by the estimator
    pub min_rate: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            proportional: 1.0,
            integral: 0.2,
            derivative: 0.0,
            min_rate: 100.0,
        }
    }
}

impl StreamingConfig {
    /// Parse a configuration from a YAML document and validate it
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: StreamingConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for contradicting or invalid values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("batch_interval"));
        }
        if self.block_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("block_interval"));
        }
        if self.block_interval > self.batch_interval {
            return Err(ConfigError::BlockIntervalTooLarge {
                block: self.block_interval,
                batch: self.batch_interval,
            });
        }
        if self.block_interval < MIN_RECOMMENDED_BLOCK_INTERVAL {
            warn!(
                block_interval = ?self.block_interval,
                "Block interval is below the recommended minimum of {MIN_RECOMMENDED_BLOCK_INTERVAL:?}"
            );
        }
        if let Some(interval) = self.checkpoint_interval {
            if !is_multiple_of(interval, self.batch_interval) {
                return Err(ConfigError::NotAMultiple {
                    name: "checkpoint_interval",
                    value: interval,
                    batch: self.batch_interval,
                });
            }
        }
        if self.replication_factor == 0 {
            return Err(ConfigError::ZeroReplication);
        }
        if self.max_task_attempts == 0 {
            return Err(ConfigError::ZeroTaskAttempts);
        }
        if self.write_ahead_log_enabled && self.checkpoint_dir.is_none() {
            return Err(ConfigError::WalWithoutCheckpointDir);
        }
        if self.wal_rolling_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("wal_rolling_interval"));
        }
        Ok(())
    }

    /// Interval at which checkpoints are taken if checkpointing is enabled
    pub fn effective_checkpoint_interval(&self) -> Duration {
        self.checkpoint_interval
            .unwrap_or(self.batch_interval * DEFAULT_CHECKPOINT_MULTIPLIER)
    }

    /// True if a checkpoint directory is configured
    pub fn checkpointing_enabled(&self) -> bool {
        self.checkpoint_dir.is_some()
    }

    /// Number of executor threads
    pub fn effective_parallelism(&self) -> usize {
        self.executor_parallelism
            .or_else(|| std::thread::available_parallelism().ok().map(|x| x.get()))
            .unwrap_or(1)
            .max(1)
    }
}

/// Invalid configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("block_interval {block:?} must not exceed batch_interval {batch:?}")]
    BlockIntervalTooLarge { block: Duration, batch: Duration },
    #[error("{name} {value:?} must be a positive multiple of batch_interval {batch:?}")]
    NotAMultiple {
        name: &'static str,
        value: Duration,
        batch: Duration,
    },
    #[error("replication_factor must be at least 1")]
    ZeroReplication,
    #[error("max_task_attempts must be at least 1")]
    ZeroTaskAttempts,
    #[error("write_ahead_log_enabled requires a checkpoint_dir")]
    WalWithoutCheckpointDir,
    #[error("Error parsing configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let config = StreamingConfig::builder()
            .batch_interval(Duration::from_secs(1))
            .build();
        assert_eq!(config.block_interval, DEFAULT_BLOCK_INTERVAL);
        assert_eq!(config.replication_factor, 2);
        assert!(!config.write_ahead_log_enabled);
        assert!(!config.backpressure_enabled);
        assert_eq!(config.max_receiver_rate, None);
        assert_eq!(config.effective_checkpoint_interval(), Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn yaml_with_durations() {
        let config = StreamingConfig::from_yaml_str(
            "
batch_interval: 2s
checkpoint_dir: /tmp/ckpt
checkpoint_interval: 10s
write_ahead_log_enabled: true
max_receiver_rate: 5000
rate_estimator:
  integral: 0.5
",
        )
        .unwrap();
        assert_eq!(config.checkpoint_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.max_receiver_rate, Some(5000));
        assert_eq!(config.rate_estimator.integral, 0.5);
        assert_eq!(config.rate_estimator.proportional, 1.0);
    }

    #[test]
    fn rejects_invalid() {
        let wal = StreamingConfig::builder()
            .batch_interval(Duration::from_secs(1))
            .write_ahead_log_enabled(true)
            .build();
        assert!(matches!(
            wal.validate(),
            Err(ConfigError::WalWithoutCheckpointDir)
        ));

        let checkpoint = StreamingConfig::builder()
            .batch_interval(Duration::from_secs(2))
            .checkpoint_interval(Duration::from_secs(3))
            .build();
        assert!(matches!(
            checkpoint.validate(),
            Err(ConfigError::NotAMultiple { .. })
        ));

        let block = StreamingConfig::builder()
            .batch_interval(Duration::from_millis(100))
            .build();
        assert!(matches!(
            block.validate(),
            Err(ConfigError::BlockIntervalTooLarge { .. })
        ));

        assert!(StreamingConfig::from_yaml_str("batch_interval: 1s\nunknown: 3").is_err());
    }
}
