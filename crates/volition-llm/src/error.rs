//! Error types for volition-llm

use thiserror::Error;

/// LLM error type
#[derive(Debug, Error)]
pub enum Error {
    /// Backend not configured (missing credentials or unknown backend)
    #[error("backend not configured: {0}")]
    NotConfigured(String),

    /// API error (already summarized, never a raw provider body)
    #[error("api error: {0}")]
    Api(String),

    /// Rate limit exceeded
    #[error("rate limit exceeded")]
    RateLimit,

    /// Response could not be decoded into the canonical shape
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Network error
    #[error("network error: {0}")]
    Network(String),

    /// Timeout
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// No route could be resolved for a task
    #[error("no route for task: {0}")]
    NoRoute(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
