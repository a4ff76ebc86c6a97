//! Agent channel error types.

use crate::protocol::JsonRpcError;
use thiserror::Error;

/// Channel errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to connect to enforcement agent: {0}")]
    Connect(#[from] std::io::Error),

    #[error("timed out connecting to enforcement agent")]
    ConnectTimeout,

    #[error("handshake with enforcement agent failed: {0}")]
    Handshake(String),

    #[error("channel to enforcement agent is closed")]
    ChannelClosed,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("enforcement agent rejected handler registration")]
    Rejected,

    #[error("malformed access request: {0}")]
    MalformedRequest(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, Error>;
