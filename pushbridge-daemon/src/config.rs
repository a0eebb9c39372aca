//! Daemon Configuration
//!
//! Configuration management for the pushbridge daemon.

use anyhow::{bail, Context, Result};
use pushbridge_protocol::api::{DEFAULT_API_BASE_URL, DEFAULT_STREAM_BASE_URL};
use pushbridge_protocol::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `account.access_token`
pub const ACCESS_TOKEN_ENV: &str = "PUSHBRIDGE_ACCESS_TOKEN";

/// Largest accepted reconnect delay, one day
pub const MAX_RECONNECT_DELAY_SECS: u64 = 86_400;

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Account configuration
    pub account: AccountConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Stream reconnection configuration
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Account configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Pushbullet access token
    #[serde(default)]
    pub access_token: String,

    /// Device whose threads are loaded at startup; enables the event stream
    #[serde(default)]
    pub default_device: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,

    /// Timeout of every HTTP request in seconds (0 = none)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Seconds without any event stream frame before reconnecting (0 = never)
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
}

/// Stream reconnection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// First delay after the stream drops, in seconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Upper bound of the doubling delay, in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_stream_base_url() -> String {
    DEFAULT_STREAM_BASE_URL.to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_stream_idle_timeout() -> u64 {
    90
}

fn default_initial_delay() -> u64 {
    1
}

fn default_max_delay() -> u64 {
    60
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            stream_base_url: default_stream_base_url(),
            request_timeout_secs: default_request_timeout(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl NetworkConfig {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get stream idle timeout as Duration
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

impl Config {
    /// Default location, `~/.config/pushbridge/daemon.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("pushbridge")
            .join("daemon.toml")
    }

    /// Load configuration from `path` (or the default location), creating
    /// a default file if none exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            tracing::info!("Wrote default configuration to {}", config_path.display());
            Ok(config)
        }
    }

    /// Load configuration from an existing file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Apply the access token from the environment, if set
    pub fn apply_env(&mut self) {
        self.apply_token_override(std::env::var(ACCESS_TOKEN_ENV).ok());
    }

    fn apply_token_override(&mut self, token: Option<String>) {
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            self.account.access_token = token.trim().to_string();
        }
    }

    /// Check that the daemon can actually talk to the service
    pub fn validate(&self) -> Result<()> {
        if self.account.access_token.trim().is_empty() {
            bail!(
                "No access token configured: set account.access_token or {}",
                ACCESS_TOKEN_ENV
            );
        }
        if self.reconnect.initial_delay_secs == 0 {
            bail!("reconnect.initial_delay_secs must be at least 1");
        }
        for (name, value) in [
            ("initial_delay_secs", self.reconnect.initial_delay_secs),
            ("max_delay_secs", self.reconnect.max_delay_secs),
        ] {
            if value > MAX_RECONNECT_DELAY_SECS {
                bail!(
                    "reconnect.{} must be at most {} seconds",
                    name,
                    MAX_RECONNECT_DELAY_SECS
                );
            }
        }
        Ok(())
    }

    /// Access token safe for printing
    pub fn redacted_token(&self) -> String {
        let token = &self.account.access_token;
        if token.is_empty() {
            "(unset)".to_string()
        } else {
            let visible: String = token.chars().take(4).collect();
            format!("{}***", visible)
        }
    }

    /// Settings handed to the bridge
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            default_device: self
                .account
                .default_device
                .clone()
                .filter(|d| !d.trim().is_empty()),
            request_timeout: self.network.request_timeout(),
            reconnect_initial_delay: Duration::from_secs(self.reconnect.initial_delay_secs),
            reconnect_max_delay: Duration::from_secs(self.reconnect.max_delay_secs),
        }
    }
}
