//! Error types for evidence pack operations.

use thiserror::Error;

/// Evidence result type.
pub type Result<T> = std::result::Result<T, EvidenceError>;

/// Errors that can occur while hashing, signing, or notarizing packs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvidenceError {
    /// The archive could not be opened or iterated.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// Key generation or parsing failed.
    #[error("key error: {0}")]
    Key(String),

    /// Signing failed.
    #[error("signing error: {0}")]
    Signing(String),

    /// The signature blob is malformed (bad base64 or length).
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// A notarization record referenced an unknown pack.
    #[error("unknown pack: {0}")]
    UnknownPack(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<zip::result::ZipError> for EvidenceError {
    fn from(err: zip::result::ZipError) -> Self {
        EvidenceError::InvalidArchive(err.to_string())
    }
}

impl From<rsa::Error> for EvidenceError {
    fn from(err: rsa::Error) -> Self {
        EvidenceError::Signing(err.to_string())
    }
}
