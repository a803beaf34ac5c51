use thiserror::Error;

/// Errors reported to callers of the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid group identifier.
    #[error("Invalid group id: {0}")]
    InvalidId(&'static str),

    /// No live group has this identifier.
    #[error("Found no group with the id: {0}")]
    NotFound(String),

    /// A group with this identifier already exists.
    #[error("Group id already exists: {0}")]
    AlreadyExists(String),

    /// The registry task is no longer running.
    #[error("Registry is not running")]
    RegistryStopped,
}
