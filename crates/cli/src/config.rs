//! Configuration loading from fileguard.toml.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agent::ChannelConfig;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Enforcement agent channel settings.
    #[serde(default)]
    pub agent: AgentConfig,
}

/// `[agent]` table. Unset fields fall back to the channel defaults.
#[derive(Debug, Default, Deserialize)]
pub struct AgentConfig {
    /// Path of the agent's Unix socket.
    pub socket: Option<PathBuf>,

    /// How long to wait for the socket to accept.
    pub connect_timeout_ms: Option<u64>,

    /// How long to wait for the agent to answer a request.
    pub request_timeout_ms: Option<u64>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Channel settings, with `socket` overriding the configured path.
    pub fn channel(&self, socket: Option<PathBuf>) -> ChannelConfig {
        let defaults = ChannelConfig::default();
        let agent = &self.agent;
        ChannelConfig {
            socket: socket
                .or_else(|| agent.socket.clone())
                .unwrap_or(defaults.socket),
            connect_timeout: agent
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            request_timeout: agent
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),
}
