//! Configuration loading.
//!
//! Values come from, in increasing priority: built-in defaults, an optional
//! JSON file, and `SOCKET_RPC_*` environment variables. The protocol core
//! consumes a validated [`Config`] but never owns where it came from.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_RECONNECT_INTERVAL,
    DEFAULT_REQUEST_TIMEOUT, MAX_CHUNK_SIZE,
};

/// Runtime configuration shared by client and server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Path of the Unix socket to listen on / connect to.
    pub socket_path: PathBuf,
    /// Maximum payload bytes per chunk.
    pub chunk_size: usize,
    /// Maximum encoded message size. The server advertises this in the
    /// handshake; the client enforces the lesser of its own and the server's.
    pub max_message_size: usize,
    /// Default time to wait for a response, in milliseconds.
    pub request_timeout_ms: u64,
    /// Delay between client reconnect attempts, in milliseconds.
    pub reconnect_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: std::env::temp_dir().join("socket-rpc.sock"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL.as_millis() as u64,
        }
    }
}

impl Config {
    /// Load configuration: file (if given and present), then environment
    /// overrides, then validation.
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

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Apply `SOCKET_RPC_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unparseable numbers are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("SOCKET_RPC_SOCKET_PATH") {
            self.socket_path = PathBuf::from(path);
        }
        override_number(&lookup, "SOCKET_RPC_CHUNK_SIZE", &mut self.chunk_size);
        override_number(&lookup, "SOCKET_RPC_MAX_MESSAGE_SIZE", &mut self.max_message_size);
        override_number(&lookup, "SOCKET_RPC_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        override_number(
            &lookup,
            "SOCKET_RPC_RECONNECT_INTERVAL_MS",
            &mut self.reconnect_interval_ms,
        );
    }

    /// Reject values the protocol cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            bail!(
                "chunk_size {} exceeds the frame limit ({MAX_CHUNK_SIZE})",
                self.chunk_size
            );
        }
        if self.max_message_size == 0 {
            bail!("max_message_size must be greater than zero");
        }
        if u32::try_from(self.max_message_size).is_err() {
            bail!(
                "max_message_size {} does not fit the 32-bit byteLength field",
                self.max_message_size
            );
        }
        Ok(())
    }

    /// Default request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Client reconnect interval.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Builder-style socket path override.
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }
}

fn override_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(name) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => log::warn!("Ignoring {name}={raw}: not a number"),
        }
    }
}
