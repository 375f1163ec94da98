//! Configuration management for the rollup daemon
//!
//! TOML configuration file with `ROLLUP_*` environment variable overrides
//! and defaults for every field.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result, ValidationError};
use crate::rollup::RollupType;
use crate::types::{ShardId, DEFAULT_SHARD_COUNT};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Scheduling
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Rollup execution
    #[serde(default)]
    pub rollup: RollupConfig,

    /// Shard state persistence
    #[serde(default)]
    pub state: StateConfig,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Scheduling configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    /// Number of shards locators are spread over
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// Shards managed by this process; empty means all of them
    #[serde(default)]
    pub managed_shards: Vec<ShardId>,

    /// Time without writes before a slot may be rolled up
    #[serde(default = "default_quiescence_delay_ms")]
    pub quiescence_delay_ms: u64,

    /// Interval between scheduling passes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Age after which an Active slot is reported as stuck
    #[serde(default = "default_stuck_threshold_ms")]
    pub stuck_threshold_ms: u64,
}

/// Rollup execution configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RollupConfig {
    /// Units rolled up concurrently
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Timeout of one unit, reads and writes included
    #[serde(default = "default_unit_timeout_ms")]
    pub unit_timeout_ms: u64,

    /// Rollup kinds computed for every slot
    #[serde(default = "default_rollup_types")]
    pub rollup_types: Vec<RollupType>,

    /// Requeue failed units at the front instead of waiting for the next pass
    #[serde(default)]
    pub immediate_retry: bool,
}

/// Where shard state is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    /// Process-local, lost on restart
    Memory,
    /// JSON files under `data_dir`
    LocalDisk,
}

/// Shard state persistence configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    /// Backend
    #[serde(default = "default_state_backend")]
    pub backend: StateBackend,

    /// Directory for the local disk backend
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Interval between pushes of dirty stamps
    #[serde(default = "default_push_interval_ms")]
    pub push_interval_ms: u64,

    /// Interval between pulls of persisted stamps
    #[serde(default = "default_pull_interval_ms")]
    pub pull_interval_ms: u64,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_shard_count() -> u32 { DEFAULT_SHARD_COUNT }
fn default_quiescence_delay_ms() -> u64 { 300_000 }
fn default_poll_interval_ms() -> u64 { 10_000 }
fn default_stuck_threshold_ms() -> u64 { 4 * 3_600_000 }
fn default_max_concurrency() -> usize { num_cpus::get() }
fn default_unit_timeout_ms() -> u64 { 60_000 }
fn default_rollup_types() -> Vec<RollupType> { RollupType::ALL.to_vec() }
fn default_state_backend() -> StateBackend { StateBackend::Memory }
fn default_data_dir() -> PathBuf { PathBuf::from("/var/lib/rollupd/state") }
fn default_push_interval_ms() -> u64 { 2_000 }
fn default_pull_interval_ms() -> u64 { 20_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            managed_shards: Vec::new(),
            quiescence_delay_ms: default_quiescence_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            stuck_threshold_ms: default_stuck_threshold_ms(),
        }
    }
}

impl ScheduleConfig {
    /// Shards this process manages, resolved against `shard_count`
    pub fn resolved_shards(&self) -> Vec<ShardId> {
        if self.managed_shards.is_empty() {
            (0..self.shard_count).collect()
        } else {
            let mut shards = self.managed_shards.clone();
            shards.sort_unstable();
            shards.dedup();
            shards
        }
    }

    /// Quiescence delay
    pub fn quiescence_delay(&self) -> Duration {
        Duration::from_millis(self.quiescence_delay_ms)
    }

    /// Scheduling pass interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Stuck slot threshold
    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_millis(self.stuck_threshold_ms)
    }
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            unit_timeout_ms: default_unit_timeout_ms(),
            rollup_types: default_rollup_types(),
            immediate_retry: false,
        }
    }
}

impl RollupConfig {
    /// Per-unit timeout
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_millis(self.unit_timeout_ms)
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_state_backend(),
            data_dir: default_data_dir(),
            push_interval_ms: default_push_interval_ms(),
            pull_interval_ms: default_pull_interval_ms(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Maximum supported shard count
    pub const MAX_SHARDS: u32 = 4096;

    /// Maximum concurrent units
    pub const MAX_CONCURRENCY: usize = 1024;

    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("Failed to read config file {}: {}", path, e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file {}: {}", path, e)))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Schedule
        if let Some(v) = env_parse("ROLLUP_SHARD_COUNT") {
            self.schedule.shard_count = v;
        }
        if let Ok(shards) = std::env::var("ROLLUP_MANAGED_SHARDS") {
            let parsed: std::result::Result<Vec<ShardId>, _> = shards
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect();
            if let Ok(parsed) = parsed {
                self.schedule.managed_shards = parsed;
            }
        }
        if let Some(v) = env_parse("ROLLUP_QUIESCENCE_DELAY_MS") {
            self.schedule.quiescence_delay_ms = v;
        }
        if let Some(v) = env_parse("ROLLUP_POLL_INTERVAL_MS") {
            self.schedule.poll_interval_ms = v;
        }

        // Rollup
        if let Some(v) = env_parse("ROLLUP_MAX_CONCURRENCY") {
            self.rollup.max_concurrency = v;
        }
        if let Some(v) = env_parse("ROLLUP_UNIT_TIMEOUT_MS") {
            self.rollup.unit_timeout_ms = v;
        }

        // State
        if let Ok(data_dir) = std::env::var("ROLLUP_STATE_DIR") {
            self.state.data_dir = PathBuf::from(data_dir);
            self.state.backend = StateBackend::LocalDisk;
        }

        // Monitoring
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let schedule = &self.schedule;
        if schedule.shard_count == 0 || schedule.shard_count > Self::MAX_SHARDS {
            return Err(out_of_range("schedule.shard_count", schedule.shard_count, 1, Self::MAX_SHARDS));
        }
        if let Some(shard) = schedule.managed_shards.iter().find(|s| **s >= schedule.shard_count) {
            return Err(out_of_range(
                "schedule.managed_shards",
                *shard,
                0,
                schedule.shard_count - 1,
            ));
        }
        if schedule.poll_interval_ms == 0 {
            return Err(ValidationError::Failed("schedule.poll_interval_ms must be > 0".to_string()));
        }

        let rollup = &self.rollup;
        if rollup.max_concurrency == 0 || rollup.max_concurrency > Self::MAX_CONCURRENCY {
            return Err(out_of_range(
                "rollup.max_concurrency",
                rollup.max_concurrency,
                1,
                Self::MAX_CONCURRENCY,
            ));
        }
        if rollup.unit_timeout_ms == 0 {
            return Err(ValidationError::Failed("rollup.unit_timeout_ms must be > 0".to_string()));
        }
        if rollup.rollup_types.is_empty() {
            return Err(ValidationError::MissingField("rollup.rollup_types".to_string()));
        }

        if self.state.backend == StateBackend::LocalDisk && self.state.data_dir.as_os_str().is_empty() {
            return Err(ValidationError::MissingField("state.data_dir".to_string()));
        }
        if self.state.push_interval_ms == 0 || self.state.pull_interval_ms == 0 {
            return Err(ValidationError::Failed("state push/pull intervals must be > 0".to_string()));
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)
            .map_err(|e| Error::Configuration(format!("Failed to write config file {}: {}", path, e)))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn out_of_range(field: &str, value: impl ToString, min: impl ToString, max: impl ToString) -> ValidationError {
    ValidationError::OutOfRange {
        field: field.to_string(),
        value: value.to_string(),
        min: min.to_string(),
        max: max.to_string(),
    }
}

mod num_cpus {
    pub fn get() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}
