//! Error types for volition-core

use thiserror::Error;

/// Runtime error type
#[derive(Debug, Error)]
pub enum Error {
    /// Backend or routing failure
    #[error("llm error: {0}")]
    Llm(#[from] volition_llm::Error),

    /// Soul store or rollout failure
    #[error("soul error: {0}")]
    Soul(#[from] volition_soul::Error),

    /// Conversation storage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Missing or inconsistent configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The turn was cancelled from outside
    #[error("turn cancelled")]
    Cancelled,

    /// The turn hit its wall-clock timeout
    #[error("turn timed out after {0}s")]
    Timeout(u64),

    /// A sub-agent delegation failed
    #[error("delegation failed: {0}")]
    Delegation(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
