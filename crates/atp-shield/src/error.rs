//! Error types shared across the shield subsystems.

use atp_observability::events::RejectionReason;
use thiserror::Error;

/// Shield result type.
pub type Result<T> = std::result::Result<T, ShieldError>;

/// Errors that can occur in shield operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShieldError {
    /// A payload was rejected by input hardening.
    #[error("input rejected ({reason}): {detail}")]
    InputRejected {
        reason: RejectionReason,
        detail: String,
    },

    /// A WAF rule pattern failed to compile.
    #[error("invalid rule pattern in {rule}: {reason}")]
    InvalidRulePattern { rule: String, reason: String },

    /// A custom rule or block-list file could not be loaded.
    #[error("failed to load {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
