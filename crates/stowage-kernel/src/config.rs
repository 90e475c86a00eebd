//! Kernel configuration.
//!
//! Loaded from TOML. Every section and field has a default, so an empty file
//! (or no file) is a valid configuration.
//!
//! ```toml
//! [tasks]
//! transfer_workers = 4
//!
//! [reconnect]
//! backoff_floor_secs = 30
//!
//! [transfer.move_verify]
//! policy = "retry"
//! attempts = 3
//! delay_secs = 60
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub tasks: TaskConfig,
    pub reconnect: ReconnectConfig,
    pub sync: SyncConfig,
    pub transfer: TransferConfig,
    pub database: DatabaseConfig,
}

impl KernelConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.tasks;
        if t.transfer_workers == 0 || t.upload_workers == 0 || t.sync_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker counts must be at least 1".into(),
            ));
        }
        if self.reconnect.tick.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "reconnect tick must be positive".into(),
            ));
        }
        let s = &self.sync;
        if s.poll_initial.is_zero() || s.poll_max < s.poll_initial {
            return Err(ConfigError::ValidationFailed(
                "sync poll ceiling must be at least the initial interval".into(),
            ));
        }
        Ok(())
    }
}

/// `[tasks]`: worker pools and retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub transfer_workers: usize,
    pub upload_workers: usize,
    pub sync_workers: usize,
    /// Automatic retries after the first failed attempt.
    pub max_retry: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            transfer_workers: 5,
            upload_workers: 5,
            sync_workers: 2,
            max_retry: 3,
        }
    }
}

/// `[reconnect]`: reconnect scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(rename = "tick_ms", with = "millis")]
    pub tick: Duration,
    /// Lower bound for the base interval of every mount.
    #[serde(rename = "backoff_floor_secs", with = "secs")]
    pub backoff_floor: Duration,
    pub queue_capacity: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            backoff_floor: Duration::from_secs(30),
            queue_capacity: 100,
        }
    }
}

/// `[sync]`: sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_depth: usize,
    #[serde(rename = "poll_initial_ms", with = "millis")]
    pub poll_initial: Duration,
    #[serde(rename = "poll_step_ms", with = "millis")]
    pub poll_step: Duration,
    #[serde(rename = "poll_max_ms", with = "millis")]
    pub poll_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            poll_initial: Duration::from_millis(300),
            poll_step: Duration::from_millis(200),
            poll_max: Duration::from_secs(2),
        }
    }
}

/// What to do when a move cannot verify its destination copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum MoveVerifyPolicy {
    /// Log the failure and keep the sources.
    #[default]
    Report,
    /// Re-run verification for the failed sources in the background.
    Retry { attempts: u32, delay_secs: u64 },
}

/// `[transfer]`: transfer finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Upper bound on waiting for pending writes before verifying a move.
    #[serde(rename = "lazy_wait_timeout_secs", with = "secs")]
    pub lazy_wait_timeout: Duration,
    pub move_verify: MoveVerifyPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            lazy_wait_timeout: Duration::from_secs(3600),
            move_verify: MoveVerifyPolicy::Report,
        }
    }
}

/// `[database]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stowage.db"),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
