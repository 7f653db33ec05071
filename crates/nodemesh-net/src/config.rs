//! Node configuration

use nodemesh_core::wire::DEFAULT_MAX_PAYLOAD;
use nodemesh_core::Capabilities;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Timing and limits for a node and its links
///
/// Durations are stored in milliseconds so the struct maps cleanly to JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// How long a send waits for its response (0 = fire-and-forget)
    pub request_timeout_ms: u64,
    /// Keepalive cadence on an otherwise idle link (0 = never)
    pub keepalive_interval_ms: u64,
    /// Silence after which a link is declared dead
    pub idle_timeout_ms: u64,
    /// Per read / per write bound on an established link
    pub io_timeout_ms: u64,
    /// Bound on the whole handshake exchange
    pub handshake_timeout_ms: u64,
    /// Largest request/response payload accepted or sent
    pub max_payload_bytes: usize,
    /// Listen backlog
    pub listen_backlog: u32,
    /// Capability bits advertised to peers
    pub capabilities: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            keepalive_interval_ms: 20_000,
            idle_timeout_ms: 30_000,
            io_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD,
            listen_backlog: 10,
            capabilities: 0,
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid("io_timeout_ms must be positive".into()));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_ms must be positive".into(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_ms must be positive".into(),
            ));
        }
        if self.keepalive_interval_ms > 0 && self.keepalive_interval_ms >= self.idle_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "keepalive interval {}ms must be shorter than idle timeout {}ms",
                self.keepalive_interval_ms, self.idle_timeout_ms
            )));
        }
        if self.max_payload_bytes == 0 || self.max_payload_bytes > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_payload_bytes {} out of range",
                self.max_payload_bytes
            )));
        }
        if self.listen_backlog == 0 {
            return Err(ConfigError::Invalid("listen_backlog must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Keepalive cadence, `None` when disabled
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities(self.capabilities)
    }
}
