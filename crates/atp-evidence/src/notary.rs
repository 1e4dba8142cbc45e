//! Notarization records and verification.

use crate::error::Result;
use crate::pack_hash::PackHash;
use crate::signer::{EvidenceSigner, SignatureInfo};
use atp_observability::metric_names::{
    METRIC_EVIDENCE_NOTARIZATIONS_TOTAL, METRIC_EVIDENCE_TAMPER_DETECTED_TOTAL,
};
use atp_observability::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{error, info};

/// A notarization record binding a pack to a notary identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotarizationRecord {
    /// Caller-chosen pack identifier.
    pub pack_id: String,
    /// Identity of the notary that produced this record.
    pub notary_id: String,
    /// When the pack was notarized.
    pub timestamp: DateTime<Utc>,
    /// Pack hash at notarization time.
    pub evidence_hash: PackHash,
    /// Detached signature over the pack.
    pub signature_info: SignatureInfo,
    /// Certificate chain (PEM public key by default).
    pub certificate_chain: Vec<String>,
    /// Human-readable notary statement.
    pub notary_statement: String,
    /// Extra context.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Per-check outcome of verifying a notarization record against a pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotarizationVerification {
    /// True iff every individual check passed.
    pub valid: bool,
    pub signature_valid: bool,
    pub hash_valid: bool,
    pub notary_valid: bool,
    /// One entry per failed check.
    pub errors: Vec<String>,
}

/// A signer with an identity, certificate chain, and statement text.
#[derive(Debug)]
pub struct EvidenceNotary {
    notary_id: String,
    signer: EvidenceSigner,
}

impl EvidenceNotary {
    /// Create a notary with a freshly generated signing key.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn new(notary_id: impl Into<String>) -> Result<Self> {
        let notary_id = notary_id.into();
        let signer = EvidenceSigner::generate(format!("{notary_id}-signer"))?;
        Ok(Self { notary_id, signer })
    }

    /// Create a notary around an existing signer.
    #[must_use]
    pub fn with_signer(notary_id: impl Into<String>, signer: EvidenceSigner) -> Self {
        Self {
            notary_id: notary_id.into(),
            signer,
        }
    }

    /// The notary identity.
    #[must_use]
    pub fn notary_id(&self) -> &str {
        &self.notary_id
    }

    /// The underlying signer.
    #[must_use]
    pub fn signer(&self) -> &EvidenceSigner {
        &self.signer
    }

    /// Notarize a pack: hash it, sign it, and assemble the record.
    ///
    /// When no certificate chain is supplied, the notary's PEM public key
    /// forms a single-element chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be hashed or signing fails.
    pub fn notarize_pack(
        &self,
        pack_path: impl AsRef<Path>,
        pack_id: &str,
        certificate_chain: Option<Vec<String>>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<NotarizationRecord> {
        let evidence_hash = PackHash::of_archive(&pack_path)?;

        let mut signer_info = HashMap::new();
        signer_info.insert(
            "notary_id".to_string(),
            serde_json::Value::String(self.notary_id.clone()),
        );
        signer_info.insert(
            "role".to_string(),
            serde_json::Value::String("evidence_pack_notary".to_string()),
        );
        let signature_info = self
            .signer
            .sign_evidence_pack(&pack_path, Some(signer_info))?;

        let certificate_chain = match certificate_chain {
            Some(chain) => chain,
            None => vec![self.signer.public_key_pem()?],
        };

        let timestamp = Utc::now();
        let notary_statement = format!(
            "This evidence pack ({pack_id}) has been notarized by {} on {}. The pack contains \
             compliance evidence and has been cryptographically signed to ensure integrity.",
            self.notary_id,
            timestamp.to_rfc3339()
        );

        metrics::counter(
            METRIC_EVIDENCE_NOTARIZATIONS_TOTAL,
            "Total evidence pack notarizations produced",
        )
        .inc();
        info!(pack_id, notary_id = self.notary_id, "notarized evidence pack");

        Ok(NotarizationRecord {
            pack_id: pack_id.to_string(),
            notary_id: self.notary_id.clone(),
            timestamp,
            evidence_hash,
            signature_info,
            certificate_chain,
            notary_statement,
            metadata: metadata.unwrap_or_default(),
        })
    }

    /// Persist a record as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_record(&self, record: &NotarizationRecord, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path.as_ref(), serde_json::to_string_pretty(record)?)?;
        info!(path = %path.as_ref().display(), "saved notarization record");
        Ok(())
    }

    /// Load a record from JSON on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_record(&self, path: impl AsRef<Path>) -> Result<NotarizationRecord> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Verify a record against the pack at `pack_path`.
    ///
    /// Checks notary identity, pack hash, and signature independently; the
    /// record is valid only if all three hold. Hash mismatches bump the
    /// tamper counter.
    ///
    /// # Errors
    ///
    /// Returns an error only if the archive cannot be read at all.
    pub fn verify_notarization(
        &self,
        pack_path: impl AsRef<Path>,
        record: &NotarizationRecord,
    ) -> Result<NotarizationVerification> {
        let mut result = NotarizationVerification {
            valid: false,
            signature_valid: false,
            hash_valid: false,
            notary_valid: false,
            errors: Vec::new(),
        };

        if record.notary_id == self.notary_id {
            result.notary_valid = true;
        } else {
            result.errors.push(format!(
                "notary id mismatch: expected {}, got {}",
                self.notary_id, record.notary_id
            ));
        }

        let current_hash = PackHash::of_archive(&pack_path)?;
        if current_hash == record.evidence_hash {
            result.hash_valid = true;
        } else {
            result
                .errors
                .push("evidence hash mismatch; pack may have been tampered with".to_string());
            metrics::counter(
                METRIC_EVIDENCE_TAMPER_DETECTED_TOTAL,
                "Total tamper detections",
            )
            .inc();
        }

        match self
            .signer
            .verify_signature(&pack_path, &record.signature_info)
        {
            Ok(true) => result.signature_valid = true,
            Ok(false) => result
                .errors
                .push("signature verification failed".to_string()),
            Err(e) => result.errors.push(format!("verification error: {e}")),
        }

        result.valid = result.notary_valid && result.hash_valid && result.signature_valid;
        if !result.valid {
            error!(
                pack_id = record.pack_id,
                errors = ?result.errors,
                "notarization verification failed"
            );
        }
        Ok(result)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack_hash::tests::build_archive;
    use tempfile::TempDir;

    #[test]
    fn test_notarize_and_verify() {
        let dir = TempDir::new().unwrap();
        let pack = build_archive(&dir, "pack.zip", &[("f1", b"one"), ("f2", b"two")]);
        let notary = EvidenceNotary::new("atp-notary").unwrap();

        let record = notary.notarize_pack(&pack, "pack-001", None, None).unwrap();
        assert_eq!(record.pack_id, "pack-001");
        assert_eq!(record.certificate_chain.len(), 1);
        assert!(record.certificate_chain[0].starts_with("-----BEGIN PUBLIC KEY-----"));

        let verification = notary.verify_notarization(&pack, &record).unwrap();
        assert!(verification.valid);
        assert!(verification.errors.is_empty());
    }

    #[test]
    fn test_tampered_pack_fails_hash_check() {
        let dir = TempDir::new().unwrap();
        let pack = build_archive(&dir, "pack.zip", &[("f1", b"one"), ("f2", b"two")]);
        let notary = EvidenceNotary::new("atp-notary").unwrap();
        let record = notary.notarize_pack(&pack, "pack-001", None, None).unwrap();

        // Modify f2's bytes.
        let tampered = build_archive(&dir, "pack2.zip", &[("f1", b"one"), ("f2", b"TWO")]);
        let verification = notary.verify_notarization(&tampered, &record).unwrap();

        assert!(!verification.valid);
        assert!(!verification.hash_valid);
        assert!(!verification.signature_valid);
        assert!(verification.notary_valid);
    }

    #[test]
    fn test_foreign_notary_fails_identity_check() {
        let dir = TempDir::new().unwrap();
        let pack = build_archive(&dir, "pack.zip", &[("f1", b"one")]);
        let notary = EvidenceNotary::new("atp-notary").unwrap();
        let record = notary.notarize_pack(&pack, "pack-001", None, None).unwrap();

        let other = EvidenceNotary::new("rogue-notary").unwrap();
        let verification = other.verify_notarization(&pack, &record).unwrap();
        assert!(!verification.valid);
        assert!(!verification.notary_valid);
        // Hash still matches; only identity and signature fail.
        assert!(verification.hash_valid);
        assert!(!verification.signature_valid);
    }

    #[test]
    fn test_record_roundtrip_via_file() {
        let dir = TempDir::new().unwrap();
        let pack = build_archive(&dir, "pack.zip", &[("f1", b"one")]);
        let notary = EvidenceNotary::new("atp-notary").unwrap();
        let record = notary.notarize_pack(&pack, "pack-001", None, None).unwrap();

        let path = dir.path().join("record.json");
        notary.save_record(&record, &path).unwrap();
        let loaded = notary.load_record(&path).unwrap();

        assert_eq!(loaded.pack_id, record.pack_id);
        assert_eq!(loaded.evidence_hash, record.evidence_hash);
        assert_eq!(loaded.signature_info.signature, record.signature_info.signature);
        assert!(notary.verify_notarization(&pack, &loaded).unwrap().valid);
    }
}
