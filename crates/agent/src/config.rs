//! Channel configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default location of the enforcement agent's socket.
pub const DEFAULT_SOCKET: &str = "/var/run/fileguard/agent.sock";

/// Default time allowed to establish the transport.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for requests sent to the agent.
/// Matches how long the agent holds an intercepted operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum size of a single message (1MB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Configuration for the channel to the enforcement agent.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub socket: PathBuf,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_SOCKET),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_TIMEOUT,
        }
    }
}
