//! casegrid.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CasegridConfig {
    pub driver: DriverConfig,
    pub timeouts: TimeoutsConfig,
    pub allocator: AllocatorConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub name: String,
    /// Evaluate cases inline instead of on allocated servers.
    pub sequential: bool,
    /// Reload the model between successful runs.
    pub reload_model: bool,
    /// Retry limit for cases that do not carry their own.
    pub max_retries: u32,
    /// Variables set to `true` before each case's inputs are applied.
    pub events: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: "driver".to_string(),
            sequential: false,
            reload_model: true,
            max_retries: 1,
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Wait on the reply channel when nothing is left to assign.
    pub idle: String,
    /// Wait for all startup acknowledgments.
    pub startup: String,
    /// Wait for each shutdown acknowledgment.
    pub shutdown: String,
    /// Consecutive reload failures before a worker is retired.
    pub max_reload_attempts: u32,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            idle: "30s".to_string(),
            startup: "60s".to_string(),
            shutdown: "1s".to_string(),
            max_reload_attempts: 3,
        }
    }
}

impl TimeoutsConfig {
    pub fn idle(&self) -> Result<Duration, ConfigError> {
        duration_field("timeouts.idle", &self.idle)
    }

    pub fn startup(&self) -> Result<Duration, ConfigError> {
        duration_field("timeouts.startup", &self.startup)
    }

    pub fn shutdown(&self) -> Result<Duration, ConfigError> {
        duration_field("timeouts.shutdown", &self.shutdown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Servers the local allocator may hand out at once.
    pub capacity: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self { capacity: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Directory bundles are staged in.
    pub staging_dir: PathBuf,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from(".casegrid/bundles"),
        }
    }
}

impl CasegridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CasegridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a casegrid.toml with every default spelled out.
    pub fn scaffold(name: &str) -> Self {
        CasegridConfig {
            driver: DriverConfig {
                name: name.to_string(),
                ..DriverConfig::default()
            },
            ..CasegridConfig::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts.idle()?;
        self.timeouts.startup()?;
        self.timeouts.shutdown()?;
        Ok(())
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
