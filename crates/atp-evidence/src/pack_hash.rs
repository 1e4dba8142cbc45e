//! Deterministic content hashing for evidence packs.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// A deterministic SHA-256 over an evidence pack's contents.
///
/// Computed by iterating archive entries in lexicographic filename order and
/// feeding each entry's filename bytes followed by its content bytes into
/// the hash. Two archives holding the same files with the same contents
/// produce the same hash regardless of on-disk entry order or metadata. The
/// empty archive hashes to the canonical zero-length SHA-256 digest.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackHash(String);

impl PackHash {
    /// Compute the pack hash of a zip archive on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be opened or an entry cannot
    /// be read.
    pub fn of_archive(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut archive = zip::ZipArchive::new(file)?;

        let mut names: Vec<String> = archive.file_names().map(ToString::to_string).collect();
        names.sort();

        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];
        for name in names {
            hasher.update(name.as_bytes());
            let mut entry = archive.by_name(&name)?;
            loop {
                let n = entry.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }

        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Construct from a precomputed hex digest.
    #[must_use]
    pub fn from_hex(hex_digest: impl Into<String>) -> Self {
        Self(hex_digest.into())
    }

    /// The hex-encoded digest.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PackHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackHash({})", self.0)
    }
}
