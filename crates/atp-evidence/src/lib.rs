//! Evidence pack signing and notarization.
//!
//! An evidence pack is a zip archive of compliance artifacts identified by a
//! deterministic content hash: entries are folded into a SHA-256 in
//! lexicographic filename order (filename bytes, then content bytes), so the
//! digest depends only on the file set and contents, never on archive
//! ordering or metadata.
//!
//! Packs are signed with RSASSA-PSS (MGF1-SHA256, salt length equal to the
//! digest length) and notarized: a [`NotarizationRecord`] binds the pack id,
//! the notary identity, the pack hash, the signature, and a certificate
//! chain into a single JSON artifact. Any later byte change to the pack
//! flips `hash_valid`; swapping the signing key flips `signature_valid`.

mod error;
mod manager;
mod notary;
mod pack_hash;
mod signer;

pub use error::{EvidenceError, Result};
pub use manager::SignatureManager;
pub use notary::{EvidenceNotary, NotarizationRecord, NotarizationVerification};
pub use pack_hash::PackHash;
pub use signer::{EvidenceSigner, SignatureInfo, SIGNATURE_ALGORITHM};
