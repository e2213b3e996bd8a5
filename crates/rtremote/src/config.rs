//! Transport configuration
//!
//! Loaded from TOML; every field is optional and falls back to the default
//! listed on the field.

use crate::error::{RemoteError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the environment, selector and streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Timeout used by `AsyncHandle::wait(0)` (default 1000 ms)
    pub request_timeout_ms: u64,
    /// Longest single pump slice inside `wait` (default 10 ms)
    pub pump_interval_ms: u64,
    /// Upper bound of one selector readiness wait (default 500 ms)
    pub selector_poll_timeout_ms: u64,
    /// Keep-alive period per stream, 0 disables (default 15000 ms)
    pub keep_alive_interval_ms: u64,
    /// Bound on `Stream::connect` (default 2000 ms)
    pub connect_timeout_ms: u64,
    /// Read chunk size (default 4096 bytes)
    pub socket_buffer_size: usize,
    /// Largest accepted frame payload (default 1 MiB)
    pub max_message_size: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 1000,
            pump_interval_ms: 10,
            selector_poll_timeout_ms: 500,
            keep_alive_interval_ms: 15_000,
            connect_timeout_ms: 2000,
            socket_buffer_size: 4096,
            max_message_size: 1024 * 1024,
        }
    }
}

impl RemoteConfig {
    /// Load and validate a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RemoteError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RemoteConfig =
            toml::from_str(content).map_err(|e| RemoteError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.socket_buffer_size == 0 {
            return Err(RemoteError::Config("socket_buffer_size must be > 0".into()));
        }
        if self.max_message_size == 0 {
            return Err(RemoteError::Config("max_message_size must be > 0".into()));
        }
        if self.pump_interval_ms == 0 {
            return Err(RemoteError::Config("pump_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub(crate) fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }

    pub(crate) fn selector_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.selector_poll_timeout_ms)
    }

    pub(crate) fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0).then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
