//! Configuration module
//!
//! Handles loading and saving chatwire configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{self, DEFAULT_INBOUND_CAPACITY};
use crate::protocol::{DEFAULT_PORT, MAX_FRAME_SIZE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind to
    #[serde(default = "default_bind_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Inbound queue capacity
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    /// Largest accepted frame, header included (capped at the protocol limit)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Per-peer write deadline in ms
    pub write_timeout_ms: Option<u64>,
    /// Idle read deadline in ms
    pub idle_timeout_ms: Option<u64>,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_inbound_capacity() -> usize {
    DEFAULT_INBOUND_CAPACITY
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_port(),
            inbound_capacity: default_inbound_capacity(),
            max_frame_size: default_max_frame_size(),
            write_timeout_ms: None,
            idle_timeout_ms: None,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host to connect to
    #[serde(default = "default_client_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Display name (defaults to the hostname)
    pub name: Option<String>,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_client_host() -> String {
    "localhost".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_client_host(),
            port: default_port(),
            name: None,
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl ClientConfig {
    /// Display name, falling back to this machine's hostname
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "Anonymous".to_string())
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. "info" or "chatwire=debug"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("chatwire/config.toml")),
            Some(PathBuf::from("./chatwire.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Runtime server settings derived from the file
    pub fn network_config(&self) -> network::ServerConfig {
        network::ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            inbound_capacity: self.server.inbound_capacity.max(1),
            max_frame_size: self.server.max_frame_size.min(MAX_FRAME_SIZE),
            write_timeout: self.server.write_timeout_ms.map(Duration::from_millis),
            idle_timeout: self.server.idle_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        server: ServerConfig {
            write_timeout_ms: Some(2000),
            ..Default::default()
        },
        client: ClientConfig {
            name: Some("alice".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
