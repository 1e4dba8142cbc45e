//! RSASSA-PSS signing and verification of evidence packs.

use crate::error::{EvidenceError, Result};
use crate::pack_hash::PackHash;
use atp_observability::metric_names::{
    METRIC_EVIDENCE_SIGNATURES_TOTAL, METRIC_EVIDENCE_TAMPER_DETECTED_TOTAL,
    METRIC_EVIDENCE_VERIFICATIONS_TOTAL,
};
use atp_observability::metrics;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Algorithm identifier carried on every signature.
pub const SIGNATURE_ALGORITHM: &str = "RSASSA-PSS-SHA256";

const RSA_KEY_BITS: usize = 2048;

/// A detached signature over an evidence pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureInfo {
    /// Always [`SIGNATURE_ALGORITHM`].
    pub algorithm: String,
    /// Identifier of the signing key.
    pub key_id: String,
    /// Base64 (standard alphabet, padded) signature bytes.
    pub signature: String,
    /// When the signature was produced.
    pub timestamp: DateTime<Utc>,
    /// Who signed (role, organization, etc.).
    pub signer_info: HashMap<String, serde_json::Value>,
    /// Extra context; always carries `pack_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl SignatureInfo {
    /// The pack hash recorded at signing time, if present.
    #[must_use]
    pub fn pack_hash(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("pack_hash"))
            .and_then(|v| v.as_str())
    }
}

/// Holds an RSA key pair and signs evidence packs.
pub struct EvidenceSigner {
    key_id: String,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl std::fmt::Debug for EvidenceSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceSigner")
            .field("key_id", &self.key_id)
            .finish()
    }
}

impl EvidenceSigner {
    /// Generate a fresh RSA-2048 key pair (e = 65537).
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn generate(key_id: impl Into<String>) -> Result<Self> {
        let key_id = key_id.into();
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| EvidenceError::Key(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        info!(key_id, "generated RSA keypair for evidence signing");
        Ok(Self {
            key_id,
            private_key,
            public_key,
        })
    }

    /// Load a signer from a PKCS#8 PEM private key.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM cannot be parsed.
    pub fn from_private_key_pem(pem: &str, key_id: impl Into<String>) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| EvidenceError::Key(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            key_id: key_id.into(),
            private_key,
            public_key,
        })
    }

    /// The signing key id.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Export the public key as SubjectPublicKeyInfo PEM.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| EvidenceError::Key(e.to_string()))
    }

    /// Sign an evidence pack.
    ///
    /// The pack hash is computed, hashed with SHA-256, and signed with PSS
    /// padding (MGF1-SHA256, salt length equal to the digest length). The
    /// pack hash travels in the signature metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be hashed or signing fails.
    pub fn sign_evidence_pack(
        &self,
        pack_path: impl AsRef<Path>,
        signer_info: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<SignatureInfo> {
        let pack_hash = PackHash::of_archive(&pack_path)?;

        let digest = Sha256::digest(pack_hash.as_hex().as_bytes());
        let mut rng = rand::thread_rng();
        let signature_bytes =
            self.private_key
                .sign_with_rng(&mut rng, Pss::new::<Sha256>(), &digest)?;

        let mut metadata = HashMap::new();
        metadata.insert(
            "pack_hash".to_string(),
            serde_json::Value::String(pack_hash.as_hex().to_string()),
        );

        metrics::counter(
            METRIC_EVIDENCE_SIGNATURES_TOTAL,
            "Total evidence pack signatures produced",
        )
        .inc();
        info!(
            pack = %pack_path.as_ref().display(),
            key_id = self.key_id,
            "signed evidence pack"
        );

        Ok(SignatureInfo {
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            key_id: self.key_id.clone(),
            signature: BASE64.encode(&signature_bytes),
            timestamp: Utc::now(),
            signer_info: signer_info.unwrap_or_else(|| {
                let mut info = HashMap::new();
                info.insert(
                    "signer".to_string(),
                    serde_json::Value::String("atp-router".to_string()),
                );
                info
            }),
            metadata: Some(metadata),
        })
    }

    /// Verify a signature against the pack at `pack_path`.
    ///
    /// Recomputes the pack hash and verifies the PSS signature over it.
    /// Returns `Ok(false)` (and bumps the tamper counter) when verification
    /// fails; `Err` is reserved for unreadable archives and malformed
    /// signature blobs.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be hashed or the signature is
    /// not valid base64.
    pub fn verify_signature(
        &self,
        pack_path: impl AsRef<Path>,
        signature: &SignatureInfo,
    ) -> Result<bool> {
        let pack_hash = PackHash::of_archive(&pack_path)?;
        let digest = Sha256::digest(pack_hash.as_hex().as_bytes());

        let signature_bytes = BASE64
            .decode(&signature.signature)
            .map_err(|e| EvidenceError::MalformedSignature(e.to_string()))?;

        match self
            .public_key
            .verify(Pss::new::<Sha256>(), &digest, &signature_bytes)
        {
            Ok(()) => {
                metrics::counter(
                    METRIC_EVIDENCE_VERIFICATIONS_TOTAL,
                    "Total successful signature verifications",
                )
                .inc();
                Ok(true)
            }
            Err(e) => {
                metrics::counter(
                    METRIC_EVIDENCE_TAMPER_DETECTED_TOTAL,
                    "Total tamper detections",
                )
                .inc();
                warn!(
                    pack = %pack_path.as_ref().display(),
                    key_id = signature.key_id,
                    error = %e,
                    "signature verification failed"
                );
                Ok(false)
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack_hash::tests::build_archive;
    use tempfile::TempDir;

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let dir = TempDir::new().unwrap();
        let pack = build_archive(&dir, "pack.zip", &[("f1", b"alpha"), ("f2", b"beta")]);
        let signer = EvidenceSigner::generate("test-key").unwrap();

        let sig = signer.sign_evidence_pack(&pack, None).unwrap();
        assert_eq!(sig.algorithm, SIGNATURE_ALGORITHM);
        assert_eq!(sig.key_id, "test-key");
        assert!(sig.pack_hash().is_some());
        assert!(signer.verify_signature(&pack, &sig).unwrap());
    }

    #[test]
    fn test_tampered_pack_fails_verification() {
        let dir = TempDir::new().unwrap();
        let pack = build_archive(&dir, "pack.zip", &[("f1", b"alpha"), ("f2", b"beta")]);
        let signer = EvidenceSigner::generate("test-key").unwrap();
        let sig = signer.sign_evidence_pack(&pack, None).unwrap();

        let tampered = build_archive(&dir, "pack2.zip", &[("f1", b"alpha"), ("f2", b"bEta")]);
        assert!(!signer.verify_signature(&tampered, &sig).unwrap());
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let dir = TempDir::new().unwrap();
        let pack = build_archive(&dir, "pack.zip", &[("f1", b"alpha")]);
        let signer = EvidenceSigner::generate("key-a").unwrap();
        let other = EvidenceSigner::generate("key-b").unwrap();

        let sig = signer.sign_evidence_pack(&pack, None).unwrap();
        assert!(!other.verify_signature(&pack, &sig).unwrap());
    }

    #[test]
    fn test_signature_is_standard_base64() {
        let dir = TempDir::new().unwrap();
        let pack = build_archive(&dir, "pack.zip", &[("f1", b"alpha")]);
        let signer = EvidenceSigner::generate("key").unwrap();
        let sig = signer.sign_evidence_pack(&pack, None).unwrap();

        let decoded = BASE64.decode(&sig.signature).unwrap();
        // RSA-2048 signature is exactly the modulus size.
        assert_eq!(decoded.len(), 256);
    }

    #[test]
    fn test_signature_info_roundtrip() {
        let dir = TempDir::new().unwrap();
        let pack = build_archive(&dir, "pack.zip", &[("f1", b"alpha")]);
        let signer = EvidenceSigner::generate("key").unwrap();
        let sig = signer.sign_evidence_pack(&pack, None).unwrap();

        let json = serde_json::to_string(&sig).unwrap();
        let parsed: SignatureInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.signature, sig.signature);
        assert_eq!(parsed.pack_hash(), sig.pack_hash());
        assert!(signer.verify_signature(&pack, &parsed).unwrap());
    }

    #[test]
    fn test_public_key_pem_export() {
        let signer = EvidenceSigner::generate("key").unwrap();
        let pem = signer.public_key_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }
}
