//! Configuration management for the Whisper server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/whisper/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{MIN_KEY_BITS, UID_LIMIT};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Listen address used when nothing else is configured.
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:6667";

/// Largest accepted RSA modulus for the server identity.
const MAX_KEY_BITS: usize = 16384;

/// Largest accepted socket timeout, in seconds.
const MAX_IO_TIMEOUT_SECS: u64 = 3600;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_address must be host:port, got {0}")]
    InvalidListenAddress(String),

    #[error("key_bits must be between 2048 and 16384, got {0}")]
    InvalidKeyBits(usize),

    #[error("io_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidIoTimeout(u64),

    #[error("uid_limit must be between 2 and 100000000000, got {0}")]
    InvalidUidLimit(u64),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Whisper server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener, storage and session settings.
    pub server: ServerConfig,

    /// Logging settings.
    pub log: LogConfig,
}

/// Listener, storage and session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to accept client connections on.
    pub listen_address: String,

    /// Directory holding the server key pair and the `uids` directory.
    pub data_dir: PathBuf,

    /// RSA modulus size used when a server identity has to be generated.
    pub key_bits: usize,

    /// Bound on each socket read or write, in seconds.
    pub io_timeout_secs: u64,

    /// Exclusive upper bound of assigned uids. Uids are drawn from
    /// `1..uid_limit`.
    pub uid_limit: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            data_dir: default_data_dir(),
            key_bits: protocol::DEFAULT_KEY_BITS,
            io_timeout_secs: protocol::DEFAULT_IO_TIMEOUT.as_secs(),
            uid_limit: UID_LIMIT,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("whisper")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("whisper")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WHISPER_LISTEN_ADDRESS: Override the listen address
    /// - WHISPER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("WHISPER_LISTEN_ADDRESS") {
            if !address.is_empty() {
                tracing::info!("Overriding listen_address from environment: {}", address);
                self.server.listen_address = address;
            }
        }

        if let Ok(level) = std::env::var("WHISPER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.log.level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_host_port(&self.server.listen_address) {
            return Err(ConfigError::InvalidListenAddress(
                self.server.listen_address.clone(),
            ));
        }

        if self.server.key_bits < MIN_KEY_BITS || self.server.key_bits > MAX_KEY_BITS {
            return Err(ConfigError::InvalidKeyBits(self.server.key_bits));
        }

        if self.server.io_timeout_secs == 0 || self.server.io_timeout_secs > MAX_IO_TIMEOUT_SECS {
            return Err(ConfigError::InvalidIoTimeout(self.server.io_timeout_secs));
        }

        if self.server.uid_limit < 2 || self.server.uid_limit > UID_LIMIT {
            return Err(ConfigError::InvalidUidLimit(self.server.uid_limit));
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Socket timeout as a [`Duration`].
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.server.io_timeout_secs)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// `host:port` with a non-empty host and a numeric port.
fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
