//! Configuration management for the hub daemon.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::hub::DEFAULT_MAX_IDLE_TOPICS;
use crate::models::OverflowPolicy;

/// Main configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP server binds to
    pub host: String,

    /// HTTP port for the publish and stream endpoints
    pub http_port: u16,

    /// Log level
    pub log_level: String,

    /// Queue capacity for subscribers that do not ask for one
    pub default_capacity: usize,

    /// Upper bound on a requested queue capacity
    pub max_capacity: usize,

    /// What a full subscriber queue does with a new event
    pub overflow_policy: OverflowPolicy,

    /// Seconds between keep-alive comments on idle streams
    pub keep_alive_secs: u64,

    /// Frames buffered between a session and its HTTP response body
    pub sink_buffer: usize,

    /// Topics without subscribers kept before idle ones are swept
    pub max_idle_topics: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_port: 8000,
            log_level: "info".to_string(),
            default_capacity: 256,
            max_capacity: 65_536,
            overflow_policy: OverflowPolicy::DropOldest,
            keep_alive_secs: 15,
            sink_buffer: 16,
            max_idle_topics: DEFAULT_MAX_IDLE_TOPICS,
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join("event-hub")
            .join("config.json")
    }

    /// Load configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default file if present, else defaults.
    pub fn resolve(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_capacity == 0 || self.max_capacity == 0 {
            bail!("queue capacities must be at least 1");
        }
        if self.default_capacity > self.max_capacity {
            bail!(
                "default_capacity ({}) exceeds max_capacity ({})",
                self.default_capacity,
                self.max_capacity
            );
        }
        if self.sink_buffer == 0 {
            bail!("sink_buffer must be at least 1");
        }
        if self.keep_alive_secs == 0 {
            bail!("keep_alive_secs must be at least 1");
        }
        if self.max_idle_topics == 0 {
            bail!("max_idle_topics must be at least 1");
        }
        Ok(())
    }

    /// Queue capacity for a stream request: the default when absent,
    /// clamped to `1..=max_capacity` otherwise.
    pub fn capacity_for(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_capacity)
            .clamp(1, self.max_capacity)
    }

    /// Base URL clients use to reach this server.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }
}
