//! Configuration management for Syndicast

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::Channel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Daemon and dispatch timing, all values in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub poll_interval: u64,
    pub publish_timeout: u64,
    pub max_attempts: u32,
    pub retry_delay: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            poll_interval: 60,
            publish_timeout: 30,
            max_attempts: 3,
            retry_delay: 300,
        }
    }
}

impl SchedulingConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout)
    }
}

/// Cooldown windows in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub generation_window: u64,
    pub schedule_window: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            generation_window: 60,
            schedule_window: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    pub linkedin: Option<WebhookConfig>,
    pub facebook: Option<WebhookConfig>,
    pub instagram: Option<WebhookConfig>,
}

impl ChannelsConfig {
    pub fn get(&self, channel: Channel) -> Option<&WebhookConfig> {
        match channel {
            Channel::Linkedin => self.linkedin.as_ref(),
            Channel::Facebook => self.facebook.as_ref(),
            Channel::Instagram => self.instagram.as_ref(),
        }
    }
}

/// Relay endpoint that performs the actual platform call for a channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        let mut config = Self::load_from_path(&config_path)?;
        if let Ok(db_path) = std::env::var("SYNDICAST_DB_PATH") {
            config.database.path = db_path;
        }
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/syndicast/syndicast.db".to_string(),
            },
            scheduling: SchedulingConfig::default(),
            rate_limits: RateLimitConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SYNDICAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("syndicast").join("config.toml"))
}
