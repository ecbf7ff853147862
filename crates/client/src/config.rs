//! Client configuration, stored as `whisper.toml` in the client directory.
//!
//! The file is created with defaults on first use and rewritten only when
//! registration assigns a uid.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use protocol::Uid;
use serde::{Deserialize, Serialize};

use crate::ClientError;

/// Name of the config file inside the client directory.
pub const CONFIG_FILE: &str = "whisper.toml";

/// Server address used when nothing else is configured.
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:6667";

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address to connect to.
    ///
    /// Can be overridden with the `WHISPER_SERVER_ADDRESS` environment variable.
    pub address: String,

    /// Uid assigned by the server; zero until registration.
    pub uid: Uid,

    /// Bound on each socket read or write, in seconds.
    pub io_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_SERVER_ADDRESS.to_string(),
            uid: Uid::SERVER,
            io_timeout_secs: protocol::DEFAULT_IO_TIMEOUT.as_secs(),
        }
    }
}

/// Returns the default client directory.
pub fn default_client_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("whisper")
        .join("client")
}

impl ClientConfig {
    /// Path of the config file inside `dir`.
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }

    /// Whether the client has been assigned a uid.
    pub fn is_registered(&self) -> bool {
        !self.uid.is_server()
    }

    /// Socket timeout as a [`Duration`].
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }

    /// Reads the config from `dir`, writing the defaults there first if the
    /// file does not exist yet.
    pub fn load_or_create(dir: &Path) -> Result<Self, ClientError> {
        let path = Self::path(dir);

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, writing defaults", path);
            let config = Self::default();
            config.save(dir)?;
            return Ok(config);
        }

        if path.is_dir() {
            return Err(ClientError::Config(format!(
                "config path is a directory, not a file: {}",
                path.display()
            )));
        }

        let contents = fs::read_to_string(&path).map_err(|e| {
            ClientError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
            .map_err(|e| ClientError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Writes the config into `dir`, readable by the owner only.
    pub fn save(&self, dir: &Path) -> Result<(), ClientError> {
        fs::create_dir_all(dir).map_err(|e| {
            ClientError::Config(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let path = Self::path(dir);
        fs::write(&path, self.to_toml()?).map_err(|e| {
            ClientError::Config(format!("failed to write {}: {}", path.display(), e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(|e| {
                ClientError::Config(format!("failed to restrict {}: {}", path.display(), e))
            })?;
        }

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ClientError> {
        toml::from_str(toml_str)
            .map_err(|e| ClientError::Config(format!("invalid TOML configuration: {}", e.message())))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ClientError> {
        toml::to_string_pretty(self)
            .map_err(|e| ClientError::Config(format!("failed to serialize configuration: {}", e)))
    }

    /// Apply environment variable overrides.
    ///
    /// - WHISPER_SERVER_ADDRESS: Override the server address
    pub fn apply_env_overrides(&mut self) {
        if let Some(address) = std::env::var("WHISPER_SERVER_ADDRESS")
            .ok()
            .filter(|s| !s.is_empty())
        {
            tracing::info!("Overriding server address from environment: {}", address);
            self.address = address;
        }
    }
}
