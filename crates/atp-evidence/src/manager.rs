//! Aggregation of signatures and notarization records per pack id.

use crate::error::{EvidenceError, Result};
use crate::notary::{EvidenceNotary, NotarizationRecord, NotarizationVerification};
use crate::signer::SignatureInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Owns a notary and tracks signatures and records by pack id.
///
/// Records produced by [`SignatureManager::sign_and_notarize_pack`] are also
/// persisted as `<pack_id>_notarization.json` under the output directory.
pub struct SignatureManager {
    notary: EvidenceNotary,
    output_dir: PathBuf,
    signatures: Mutex<HashMap<String, SignatureInfo>>,
    notarizations: Mutex<HashMap<String, NotarizationRecord>>,
}

impl std::fmt::Debug for SignatureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureManager")
            .field("notary_id", &self.notary.notary_id())
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

impl SignatureManager {
    /// Create a manager with a fresh notary writing records to `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or directory creation fails.
    pub fn new(notary_id: impl Into<String>, output_dir: impl AsRef<Path>) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir)?;
        Ok(Self {
            notary: EvidenceNotary::new(notary_id)?,
            output_dir,
            signatures: Mutex::new(HashMap::new()),
            notarizations: Mutex::new(HashMap::new()),
        })
    }

    /// The wrapped notary.
    #[must_use]
    pub fn notary(&self) -> &EvidenceNotary {
        &self.notary
    }

    /// Notarize a pack, persist the record, and cache both artifacts.
    ///
    /// # Errors
    ///
    /// Returns an error if notarization or persistence fails.
    pub fn sign_and_notarize_pack(
        &self,
        pack_path: impl AsRef<Path>,
        pack_id: &str,
    ) -> Result<NotarizationRecord> {
        let record = self.notary.notarize_pack(&pack_path, pack_id, None, None)?;

        let record_path = self.record_path(pack_id);
        self.notary.save_record(&record, &record_path)?;

        self.signatures
            .lock()
            .insert(pack_id.to_string(), record.signature_info.clone());
        self.notarizations
            .lock()
            .insert(pack_id.to_string(), record.clone());

        info!(pack_id, record = %record_path.display(), "signed and notarized pack");
        Ok(record)
    }

    /// Re-verify a pack against its cached notarization record.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceError::UnknownPack`] when the pack id has no
    /// record, or an archive error if the pack cannot be read.
    pub fn verify_pack(
        &self,
        pack_path: impl AsRef<Path>,
        pack_id: &str,
    ) -> Result<NotarizationVerification> {
        let record = self
            .notarizations
            .lock()
            .get(pack_id)
            .cloned()
            .ok_or_else(|| EvidenceError::UnknownPack(pack_id.to_string()))?;
        self.notary.verify_notarization(pack_path, &record)
    }

    /// Cached signature for a pack id.
    #[must_use]
    pub fn get_signature(&self, pack_id: &str) -> Option<SignatureInfo> {
        self.signatures.lock().get(pack_id).cloned()
    }

    /// Cached notarization record for a pack id.
    #[must_use]
    pub fn get_notarization(&self, pack_id: &str) -> Option<NotarizationRecord> {
        self.notarizations.lock().get(pack_id).cloned()
    }

    /// Path where a pack id's record is persisted.
    #[must_use]
    pub fn record_path(&self, pack_id: &str) -> PathBuf {
        self.output_dir.join(format!("{pack_id}_notarization.json"))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack_hash::tests::build_archive;
    use tempfile::TempDir;

    #[test]
    fn test_sign_and_notarize_persists_record() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let pack = build_archive(&dir, "pack.zip", &[("f1", b"one")]);
        let manager = SignatureManager::new("atp-notary", out.path()).unwrap();

        let record = manager.sign_and_notarize_pack(&pack, "pack-7").unwrap();
        assert!(manager.record_path("pack-7").exists());
        assert_eq!(manager.get_notarization("pack-7").unwrap().pack_id, "pack-7");
        assert_eq!(
            manager.get_signature("pack-7").unwrap().signature,
            record.signature_info.signature
        );
    }

    #[test]
    fn test_verify_pack_roundtrip_and_tamper() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let pack = build_archive(&dir, "pack.zip", &[("f1", b"one"), ("f2", b"two")]);
        let manager = SignatureManager::new("atp-notary", out.path()).unwrap();
        manager.sign_and_notarize_pack(&pack, "pack-7").unwrap();

        assert!(manager.verify_pack(&pack, "pack-7").unwrap().valid);

        let tampered = build_archive(&dir, "evil.zip", &[("f1", b"one"), ("f2", b"evil")]);
        let verification = manager.verify_pack(&tampered, "pack-7").unwrap();
        assert!(!verification.valid);
        assert!(!verification.hash_valid);
    }

    #[test]
    fn test_unknown_pack_id() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let pack = build_archive(&dir, "pack.zip", &[("f1", b"one")]);
        let manager = SignatureManager::new("atp-notary", out.path()).unwrap();

        assert!(matches!(
            manager.verify_pack(&pack, "nope"),
            Err(EvidenceError::UnknownPack(_))
        ));
    }
}
