//! Error types for the DP ledger.

use thiserror::Error;

/// Ledger result type.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur in ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Appending the entry would exceed the tenant's epsilon budget.
    #[error(
        "epsilon budget exceeded for tenant {tenant}: used {used:.3}, requested {requested:.3}, limit {limit:.3}"
    )]
    BudgetExceeded {
        tenant: String,
        used: f64,
        requested: f64,
        limit: f64,
    },

    /// A ledger line could not be parsed.
    #[error("corrupt ledger line {line}: {reason}")]
    CorruptEntry { line: usize, reason: String },

    /// Unsupported export format.
    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
