//! Configuration system for Beacon
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/beacon/config.toml
//! - Linux: ~/.config/beacon/config.toml
//! - Windows: %APPDATA%/beacon/config.toml

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,
    /// Heartbeat and eviction settings
    pub liveness: LivenessConfig,
    /// HTTP surface settings
    pub http: HttpConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port shared by HTTP and WebSocket traffic
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Liveness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Seconds without inbound traffic before a peer is evicted
    pub idle_timeout_secs: u64,
    /// Seconds between idle sweeps
    pub sweep_interval_secs: u64,
    /// Outbound messages buffered per peer before new ones are dropped
    pub outbound_queue: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: crate::DEFAULT_IDLE_TIMEOUT_SECS,
            sweep_interval_secs: crate::DEFAULT_SWEEP_INTERVAL_SECS,
            outbound_queue: crate::DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl LivenessConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        // tokio intervals panic on a zero period
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Directory served at `/`
    pub web_root: PathBuf,
    /// Directory served at `/downloads/`
    pub download_root: PathBuf,
    /// Credential file (uses the system data dir if None)
    pub credentials_path: Option<PathBuf>,
    /// Largest accepted request body
    pub max_body_bytes: usize,
    /// Seconds a client gets to send a complete request head
    pub head_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            web_root: PathBuf::from("public"),
            download_root: PathBuf::from("downloads"),
            credentials_path: None,
            max_body_bytes: 64 * 1024,
            head_timeout_secs: crate::DEFAULT_HEAD_TIMEOUT_SECS,
        }
    }
}

impl HttpConfig {
    pub fn head_timeout(&self) -> Duration {
        Duration::from_secs(self.head_timeout_secs.max(1))
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "beacon", "beacon")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Option<PathBuf> {
        ProjectDirs::from("com", "beacon", "beacon").map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Effective credential file (config override or system default)
    pub fn credentials_path(&self) -> PathBuf {
        self.http
            .credentials_path
            .clone()
            .or_else(|| Self::default_data_dir().map(|d| d.join("users.json")))
            .unwrap_or_else(|| PathBuf::from("users.json"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
