//! Client configuration: TOML file plus environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use dbweb_events::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_OUTBOUND_CAPACITY};
use dbweb_tasks::{DEFAULT_INIT_RETRY_DELAY, TaskConfig};

/// Overrides `tasks.init_retry_delay_ms`.
pub const ENV_TASK_RETRY_MS: &str = "DBWEB_TASK_RETRY_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid value {value:?} for {name}")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Fallback tracing filter when neither `DBWEB_LOG` nor `RUST_LOG` is set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_init_retry_delay_ms")]
    pub init_retry_delay_ms: u64,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_outbound_capacity() -> usize {
    DEFAULT_OUTBOUND_CAPACITY
}

fn default_init_retry_delay_ms() -> u64 {
    DEFAULT_INIT_RETRY_DELAY.as_millis() as u64
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            events: EventsConfig::default(),
            tasks: TasksConfig::default(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            init_retry_delay_ms: default_init_retry_delay_ms(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load `path` (or defaults) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_TASK_RETRY_MS) {
            self.tasks.init_retry_delay_ms =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    name: ENV_TASK_RETRY_MS,
                    value,
                })?;
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn task_config(&self) -> TaskConfig {
        TaskConfig {
            init_retry_delay: Duration::from_millis(self.tasks.init_retry_delay_ms),
        }
    }
}
