use thiserror::Error;

pub type ContainerResult<T> = Result<T, ContainerError>;

/// Failure while shelling out to `docker` or `podman`.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime exited non-zero; `message` carries its trimmed stderr.
    #[error("`{command}` exited with an error: {message}")]
    CommandFailed { command: String, message: String },

    /// A name, path or argument was rejected before reaching the CLI.
    #[error("rejected container argument: {0}")]
    InvalidInput(String),

    /// The runtime binary could not be spawned at all.
    #[error("could not launch container runtime: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ContainerError {
    pub(crate) fn failed(command: &str, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.to_string(),
            message: message.into(),
        }
    }
}
