//! Error types for the registry.

use thiserror::Error;

/// Registry result type.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur in registry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Model not found in the catalog.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Provider not found in the catalog.
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    /// A model with this name already exists.
    #[error("model already exists: {0}")]
    ModelAlreadyExists(String),

    /// A provider with this name already exists.
    #[error("provider already exists: {0}")]
    ProviderAlreadyExists(String),

    /// The requested lifecycle transition is not allowed.
    #[error("invalid transition for model {model}: {from} -> {to}")]
    InvalidTransition {
        model: String,
        from: String,
        to: String,
    },

    /// A model references a provider that does not exist.
    #[error("model {model} references unknown provider {provider}")]
    UnknownProvider { model: String, provider: String },

    /// A transaction was aborted by its closure.
    #[error("transaction rolled back: {0}")]
    TransactionAborted(String),
}
