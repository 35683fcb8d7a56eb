//! Error taxonomy shared by the registry, pool, executor and gateway.

use thiserror::Error;

use crate::container::ContainerError;

/// Result type for termhub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by termhub operations.
///
/// A command that exits non-zero is not an error; see [`crate::exec::JobOutcome`].
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input.
    #[error("{0}")]
    Validation(String),

    /// Missing or wrong credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Session ceiling reached, or provisioning failed. Try again later.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Every container slot is full and the pool is at its maximum size.
    #[error(
        "container pool exhausted ({containers} containers x {users_per_container} users); try again later"
    )]
    PoolExhausted {
        containers: usize,
        users_per_container: usize,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    /// The isolation handle is not running and could not be restarted.
    #[error("execution environment unavailable: {0}")]
    HandleUnavailable(String),

    /// A command is already running in this session.
    #[error("a command is already running in session {0}")]
    Busy(String),

    /// A built-in file operation targeted a path outside the session root.
    #[error("Access denied. Path outside of user directory: {0}")]
    AccessDenied(String),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    pub fn handle_unavailable(msg: impl Into<String>) -> Self {
        Self::HandleUnavailable(msg.into())
    }

    /// Whether a client may retry the same request later.
    pub fn retryable(&self) -> bool {
        match self {
            Error::Validation(_) | Error::Auth(_) | Error::AccessDenied(_) => false,
            Error::SessionNotFound(_) => false,
            Error::Busy(_) => false,
            Error::CapacityExceeded(_) | Error::PoolExhausted { .. } => true,
            Error::SessionExpired(_) | Error::HandleUnavailable(_) => true,
            Error::Container(_) | Error::Io(_) => true,
        }
    }
}
