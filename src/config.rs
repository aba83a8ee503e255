//! Configuration management for Warden.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WardenError};
use crate::schedule::MAX_PERIOD;

/// Prefix for environment overrides, e.g. `WARDEN__LIMITS__USER__CAPACITY=3`.
pub const ENV_PREFIX: &str = "WARDEN";

/// Main configuration for the Warden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Command throttling
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Modal prompt correlation
    #[serde(default)]
    pub modals: ModalConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Capacities for the two command bins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per (guild, user) bin
    #[serde(default = "default_user_bin")]
    pub user: BinConfig,

    /// Per (guild, channel) bin
    #[serde(default = "default_channel_bin")]
    pub channel: BinConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            user: default_user_bin(),
            channel: default_channel_bin(),
        }
    }
}

/// A single token bin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinConfig {
    /// Maximum burst per key
    pub capacity: u32,

    /// Seconds for one consumed unit to come back
    #[serde(default = "default_decay_interval")]
    pub decay_interval_secs: u64,
}

impl BinConfig {
    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs)
    }
}

fn default_user_bin() -> BinConfig {
    BinConfig {
        capacity: 5,
        decay_interval_secs: default_decay_interval(),
    }
}

fn default_channel_bin() -> BinConfig {
    BinConfig {
        capacity: 10,
        decay_interval_secs: default_decay_interval(),
    }
}

fn default_decay_interval() -> u64 {
    10
}

/// Modal secret lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModalConfig {
    /// Seconds an issued modal token stays claimable
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Seconds between expiry sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl ModalConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ModalConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_max_age() -> u64 {
    15 * 60
}

fn default_sweep_interval() -> u64 {
    60
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG` when set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,

    /// Append logs to this file instead of stdout
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WardenConfig {
    /// Load configuration from an optional YAML file plus `WARDEN__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(
            path,
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let config: WardenConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a component misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        for (name, bin) in [("user", &self.limits.user), ("channel", &self.limits.channel)] {
            if bin.decay_interval_secs == 0 {
                return Err(WardenError::Config(format!(
                    "limits.{}.decay_interval_secs must be greater than zero",
                    name
                )));
            }
            if bin.decay_interval() > MAX_PERIOD {
                return Err(WardenError::Config(format!(
                    "limits.{}.decay_interval_secs must be at most {}",
                    name,
                    MAX_PERIOD.as_secs()
                )));
            }
        }

        if self.modals.max_age_secs == 0 {
            return Err(WardenError::Config(
                "modals.max_age_secs must be greater than zero".to_string(),
            ));
        }

        if self.modals.sweep_interval_secs == 0 {
            return Err(WardenError::Config(
                "modals.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.modals.sweep_interval() > MAX_PERIOD {
            return Err(WardenError::Config(format!(
                "modals.sweep_interval_secs must be at most {}",
                MAX_PERIOD.as_secs()
            )));
        }

        Ok(())
    }
}
