//! Error types for pricing operations.

use thiserror::Error;

/// Pricing result type.
pub type Result<T> = std::result::Result<T, PricingError>;

/// Errors that can occur in pricing operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PricingError {
    /// No fetcher is registered for the provider.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// The provider has no pricing for the model.
    #[error("no pricing for model {model} on provider {provider}")]
    UnknownModel { provider: String, model: String },

    /// A fetcher failed to retrieve pricing.
    #[error("pricing fetch failed for {provider}: {reason}")]
    FetchFailed { provider: String, reason: String },
}
