//! Error types for volition-soul

use thiserror::Error;

/// Soul store and rollout error type
#[derive(Debug, Error)]
pub enum Error {
    /// A uniqueness invariant was violated by a concurrent writer.
    /// Callers resolve this by re-reading the winner, never by retrying
    /// the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Requested record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage-layer failure
    #[error("store error: {0}")]
    Store(String),

    /// Rollout request or transition is not valid
    #[error("invalid rollout: {0}")]
    InvalidRollout(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
