//! CLI error types.

use thiserror::Error;

use crate::config::ConfigError;

/// CLI errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration could not be read or parsed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A `--rule` argument was not `PATH=POLICY`.
    #[error(transparent)]
    Policy(#[from] policy::Error),

    /// The guard reported an error and is no longer monitoring.
    #[error("{0}")]
    Monitoring(String),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
