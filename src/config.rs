//! Configuration loading and validation.
//!
//! Structured TOML configuration for echod: the listen endpoint, the
//! manager's session-population limits, and the per-session echo knobs
//! forwarded opaquely to the session factory.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen endpoint configuration.
    pub listen: ListenConfig,
    /// Session-population limits.
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Per-session configuration, forwarded to the session factory.
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limit combinations the manager cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manager.max_stopping_sessions == 0 {
            return Err(ConfigError::Invalid(
                "manager.max_stopping_sessions must be at least 1 or shutdown can never drain"
                    .to_string(),
            ));
        }
        if self.session.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "session.buffer_size must be at least 1".to_string(),
            ));
        }
        if self.session.buffer_chunks == 0 {
            return Err(ConfigError::Invalid(
                "session.buffer_chunks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Listen endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Address to bind to (e.g., "0.0.0.0:7777").
    pub address: SocketAddr,
    /// OS-level accept backlog (default: 128).
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

/// Session-population limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Cap on concurrently active sessions (default: 1024).
    #[serde(default = "default_max_session_count")]
    pub max_session_count: usize,
    /// Cap on the recycled-session pool (default: 64). Zero disables
    /// recycling entirely; every accept allocates a fresh session.
    #[serde(default = "default_recycled_session_count")]
    pub recycled_session_count: usize,
    /// Cap on concurrently outstanding session stops during shutdown
    /// drain (default: 32). One serializes the drain.
    #[serde(default = "default_max_stopping_sessions")]
    pub max_stopping_sessions: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_session_count: default_max_session_count(),
            recycled_session_count: default_recycled_session_count(),
            max_stopping_sessions: default_max_stopping_sessions(),
        }
    }
}

/// Per-session configuration. Opaque to the manager; the session factory
/// interprets it.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Echo chunk size in bytes (default: 4096).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Chunks in each session's buffer pool (default: 4). Bounds how far
    /// reads may run ahead of a slow peer.
    #[serde(default = "default_buffer_chunks")]
    pub buffer_chunks: usize,
    /// Set TCP_NODELAY on accepted sockets (default: true).
    #[serde(default = "default_no_delay")]
    pub no_delay: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            buffer_chunks: default_buffer_chunks(),
            no_delay: default_no_delay(),
        }
    }
}

fn default_backlog() -> u32 {
    128
}

fn default_max_session_count() -> usize {
    1024
}

fn default_recycled_session_count() -> usize {
    64
}

fn default_max_stopping_sessions() -> usize {
    32
}

fn default_buffer_size() -> usize {
    4096
}

fn default_buffer_chunks() -> usize {
    4
}

fn default_no_delay() -> bool {
    true
}
