//! Errors reported to the guard's observer.

use thiserror::Error;

/// Failures reported to the observer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("could not start monitoring: {0}")]
    ConnectFailed(String),

    #[error("could not start monitoring: already started")]
    AlreadyStarted,

    #[error("failed to start monitoring: {0}")]
    RegistrationFailed(#[source] agent::Error),

    #[error("failed to stop monitoring: {0}")]
    UnregistrationFailed(#[source] agent::Error),

    #[error("enforcement agent channel invalidated: {0}")]
    ChannelInvalidated(String),
}

pub type Result<T> = std::result::Result<T, Error>;
