//! Error types for adapter operations.

use thiserror::Error;

/// Adapter result type.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors surfaced by adapter implementations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AdapterError {
    /// The backend reported an irrecoverable inference failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// The underlying transport failed mid-stream.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The prompt could not be understood by the adapter.
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),

    /// The adapter-side timeout elapsed.
    #[error("adapter timeout after {0} ms")]
    Timeout(u64),

    /// The request was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,

    /// Serialization error on the chunk envelope.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
