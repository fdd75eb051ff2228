//! Error types for the Crucible engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors: rejected before they affect the live graph
    // or queue, surfaced to the caller who requested the change.
    #[error("Cyclic dependency involving: {cycle}")]
    CyclicDependency { cycle: String },

    #[error("Malformed combination filter `{expression}`: {message}")]
    MalformedFilter { expression: String, message: String },

    #[error("Duplicate axis name: {0}")]
    DuplicateAxis(String),

    // Registry errors
    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Boundary checks
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // Lifecycle
    #[error("Engine is shutting down")]
    Shutdown,

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
