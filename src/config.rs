//! Configuration loading.
//!
//! Settings come from an optional JSON file, then `LOCALSOCK_*` environment
//! variables override individual fields. Every field has a default, so an
//! empty `{}` file (or no file at all) is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::socket::connection::DEFAULT_READ_BUFFER_SIZE;
use crate::socket::framing::DEFAULT_MAX_FRAME_SIZE;
use crate::socket::path::{default_socket_path, validate_socket_path};

/// Default cap on concurrently served connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Default time `stop()` waits for connections to flush.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;

/// Transport configuration shared by servers and clients.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Path of the Unix socket.
    pub socket_path: PathBuf,
    /// Largest payload accepted or sent, in bytes.
    pub max_frame_size: usize,
    /// Maximum concurrently served connections (server only).
    pub max_connections: usize,
    /// Grace period for flushing connections on `stop()`, in milliseconds.
    pub shutdown_grace_ms: u64,
    /// Size of each connection's read buffer, in bytes.
    pub read_buffer_size: usize,
    /// Permission bits applied to the socket file (server only).
    pub socket_mode: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            socket_mode: 0o600,
        }
    }
}

impl Config {
    /// Default configuration for the given socket path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from `path` (if given and present), with
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::load_from_file(path)?,
            Some(path) => {
                log::debug!("Config file {} not found, using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(socket_path) = std::env::var("LOCALSOCK_SOCKET_PATH") {
            self.socket_path = PathBuf::from(socket_path);
        }

        if let Ok(max_frame_size) = std::env::var("LOCALSOCK_MAX_FRAME_SIZE") {
            if let Ok(size) = max_frame_size.parse::<usize>() {
                self.max_frame_size = size;
            }
        }

        if let Ok(max_connections) = std::env::var("LOCALSOCK_MAX_CONNECTIONS") {
            if let Ok(max) = max_connections.parse::<usize>() {
                self.max_connections = max;
            }
        }

        if let Ok(grace) = std::env::var("LOCALSOCK_SHUTDOWN_GRACE_MS") {
            if let Ok(ms) = grace.parse::<u64>() {
                self.shutdown_grace_ms = ms;
            }
        }
    }

    /// Check the configuration for values the transport cannot use.
    pub fn validate(&self) -> Result<()> {
        validate_socket_path(&self.socket_path)?;
        if self.max_frame_size > u32::MAX as usize {
            anyhow::bail!(
                "max_frame_size {} exceeds the u32 length header",
                self.max_frame_size
            );
        }
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        if self.read_buffer_size == 0 {
            anyhow::bail!("read_buffer_size must be at least 1");
        }
        Ok(())
    }

    /// Grace period for `stop()`.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Persists the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}
