//! Configuration management for forgepool
//!
//! Handles configuration loading, defaulting, and validation. Every section
//! can be omitted from the TOML file; defaults match the values the share
//! pipeline is tuned for.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Stratum listener configuration
    #[serde(default)]
    pub stratum: StratumConfig,

    /// Variable-difficulty controller configuration
    #[serde(default)]
    pub vardiff: VardiffConfig,

    /// Share batch-processing configuration
    #[serde(default)]
    pub batch: BatchConfig,

    /// Block template handling
    #[serde(default)]
    pub template: TemplateConfig,

    /// Proof-of-work algorithm parameters
    #[serde(default)]
    pub algorithm: AlgorithmConfig,
}

/// Stratum listener and per-connection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumConfig {
    /// TCP port the stratum listener binds
    #[serde(default = "default_stratum_port")]
    pub stratum_port: u16,

    /// Bind address (defaults to all interfaces)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Maximum inbound frame size in bytes; larger frames close the session
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Listener accept backlog
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: u32,

    /// Seconds a session may stay idle before it is closed
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Per-frame write deadline in seconds
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Outbound job mailbox depth per session
    #[serde(default = "default_mailbox_depth")]
    pub mailbox_depth: usize,

    /// Extranonce2 size miners must use, in bytes
    #[serde(default = "default_extranonce2_size")]
    pub extranonce2_size: u8,

    /// Connection attempts allowed per IP per window
    #[serde(default = "default_max_conns_per_window")]
    pub max_connections_per_ip_window: usize,

    /// Per-IP connection rate window in seconds
    #[serde(default = "default_conn_window_secs")]
    pub connection_window_secs: u64,
}

fn default_stratum_port() -> u16 {
    3333
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

fn default_accept_backlog() -> u32 {
    1024
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_mailbox_depth() -> usize {
    4
}

fn default_extranonce2_size() -> u8 {
    4
}

fn default_max_conns_per_window() -> usize {
    30
}

fn default_conn_window_secs() -> u64 {
    60
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            stratum_port: default_stratum_port(),
            bind_addr: default_bind_addr(),
            max_frame_bytes: default_max_frame_bytes(),
            accept_backlog: default_accept_backlog(),
            idle_timeout_secs: default_idle_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            mailbox_depth: default_mailbox_depth(),
            extranonce2_size: default_extranonce2_size(),
            max_connections_per_ip_window: default_max_conns_per_window(),
            connection_window_secs: default_conn_window_secs(),
        }
    }
}

impl StratumConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Variable-difficulty controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VardiffConfig {
    /// Desired seconds between shares per miner
    #[serde(default = "default_target_share_time_secs")]
    pub target_share_time_secs: f64,

    /// Minimum seconds between retargets
    #[serde(default = "default_retarget_interval_secs")]
    pub retarget_interval_secs: u64,

    /// Deadband around the target cadence, in percent
    #[serde(default = "default_variance_percent")]
    pub variance_percent: f64,

    /// Difficulty floor
    #[serde(default = "default_min_difficulty")]
    pub min_difficulty: f64,

    /// Difficulty ceiling
    #[serde(default = "default_max_difficulty")]
    pub max_difficulty: f64,

    /// Difficulty assigned to a fresh session
    #[serde(default = "default_initial_difficulty")]
    pub initial_difficulty: f64,

    /// Number of share intervals the retarget window holds
    #[serde(default = "default_share_window")]
    pub share_window: usize,
}

fn default_target_share_time_secs() -> f64 {
    10.0
}

fn default_retarget_interval_secs() -> u64 {
    30
}

fn default_variance_percent() -> f64 {
    15.0
}

fn default_min_difficulty() -> f64 {
    0.001
}

fn default_max_difficulty() -> f64 {
    1_000_000_000.0
}

fn default_initial_difficulty() -> f64 {
    1.0
}

fn default_share_window() -> usize {
    5
}

impl Default for VardiffConfig {
    fn default() -> Self {
        Self {
            target_share_time_secs: default_target_share_time_secs(),
            retarget_interval_secs: default_retarget_interval_secs(),
            variance_percent: default_variance_percent(),
            min_difficulty: default_min_difficulty(),
            max_difficulty: default_max_difficulty(),
            initial_difficulty: default_initial_difficulty(),
            share_window: default_share_window(),
        }
    }
}

impl VardiffConfig {
    pub fn retarget_interval(&self) -> Duration {
        Duration::from_secs(self.retarget_interval_secs)
    }
}

/// Share batch-processing tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Worker tasks draining the share queue
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Bounded ingress queue depth
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Maximum shares a worker pulls per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Milliseconds a worker waits to fill a batch
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Pool-wide shares-per-second ceiling; 0 disables the limiter
    #[serde(default)]
    pub max_shares_per_second: u64,

    /// Seconds allowed for draining the queue on shutdown
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_worker_count() -> usize {
    8
}

fn default_queue_size() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    10
}

fn default_drain_timeout_secs() -> u64 {
    2
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_size: default_queue_size(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            max_shares_per_second: 0,
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl BatchConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Block template handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Seconds a superseded template still accepts shares
    #[serde(default = "default_stale_grace_secs")]
    pub stale_grace_secs: u64,

    /// Superseded templates retained for stale recognition
    #[serde(default = "default_retired_capacity")]
    pub retired_capacity: usize,
}

fn default_stale_grace_secs() -> u64 {
    15
}

fn default_retired_capacity() -> usize {
    4
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            stale_grace_secs: default_stale_grace_secs(),
            retired_capacity: default_retired_capacity(),
        }
    }
}

impl TemplateConfig {
    pub fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.stale_grace_secs)
    }
}

/// Proof-of-work algorithm parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    /// Algorithm name; only the scrypt variant is supported
    #[serde(default = "default_algorithm_name")]
    pub name: String,

    #[serde(default = "default_scrypt_n")]
    pub scrypt_n: u32,

    #[serde(default = "default_scrypt_r")]
    pub scrypt_r: u32,

    #[serde(default = "default_scrypt_p")]
    pub scrypt_p: u32,
}

fn default_algorithm_name() -> String {
    "scrpy-variant".to_string()
}

fn default_scrypt_n() -> u32 {
    1024
}

fn default_scrypt_r() -> u32 {
    1
}

fn default_scrypt_p() -> u32 {
    1
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            name: default_algorithm_name(),
            scrypt_n: default_scrypt_n(),
            scrypt_r: default_scrypt_r(),
            scrypt_p: default_scrypt_p(),
        }
    }
}

impl PoolConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: PoolConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the type system cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vardiff.min_difficulty <= 0.0 {
            return Err(ConfigError::Invalid(
                "vardiff.min_difficulty must be positive".into(),
            ));
        }
        if self.vardiff.min_difficulty > self.vardiff.max_difficulty {
            return Err(ConfigError::Invalid(
                "vardiff.min_difficulty exceeds vardiff.max_difficulty".into(),
            ));
        }
        if self.vardiff.initial_difficulty < self.vardiff.min_difficulty
            || self.vardiff.initial_difficulty > self.vardiff.max_difficulty
        {
            return Err(ConfigError::Invalid(
                "vardiff.initial_difficulty outside [min, max]".into(),
            ));
        }
        if self.vardiff.share_window == 0 {
            return Err(ConfigError::Invalid("vardiff.share_window must be >= 1".into()));
        }
        if self.batch.worker_count == 0 {
            return Err(ConfigError::Invalid("batch.worker_count must be >= 1".into()));
        }
        if self.batch.queue_size == 0 {
            return Err(ConfigError::Invalid("batch.queue_size must be >= 1".into()));
        }
        if self.batch.batch_size == 0 {
            return Err(ConfigError::Invalid("batch.batch_size must be >= 1".into()));
        }
        if self.stratum.max_frame_bytes < 64 {
            return Err(ConfigError::Invalid(
                "stratum.max_frame_bytes too small to hold any frame".into(),
            ));
        }
        if self.stratum.mailbox_depth == 0 {
            return Err(ConfigError::Invalid("stratum.mailbox_depth must be >= 1".into()));
        }
        if self.stratum.extranonce2_size == 0 || self.stratum.extranonce2_size > 16 {
            return Err(ConfigError::Invalid(
                "stratum.extranonce2_size must be in 1..=16".into(),
            ));
        }
        if !self.algorithm.scrypt_n.is_power_of_two() {
            return Err(ConfigError::Invalid("algorithm.scrypt_n must be a power of two".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stratum.stratum_port, 3333);
        assert_eq!(config.vardiff.share_window, 5);
        assert_eq!(config.batch.queue_size, 10_000);
        assert_eq!(config.template.stale_grace_secs, 15);
        assert_eq!(config.algorithm.scrypt_n, 1024);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: PoolConfig = toml::from_str(
            r#"
            [stratum]
            stratum_port = 4444

            [vardiff]
            initial_difficulty = 8.0
            "#,
        )
        .unwrap();
        assert_eq!(config.stratum.stratum_port, 4444);
        assert_eq!(config.stratum.max_frame_bytes, 64 * 1024);
        assert_eq!(config.vardiff.initial_difficulty, 8.0);
        assert_eq!(config.vardiff.target_share_time_secs, 10.0);
    }

    #[test]
    fn validation_rejects_inverted_difficulty_bounds() {
        let mut config = PoolConfig::default();
        config.vardiff.min_difficulty = 100.0;
        config.vardiff.max_difficulty = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_non_power_of_two_scrypt_n() {
        let mut config = PoolConfig::default();
        config.algorithm.scrypt_n = 1000;
        assert!(config.validate().is_err());
    }
}
