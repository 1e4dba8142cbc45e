//! Ledger entries and canonical hashing.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Previous-hash of the first entry: 64 zero nibbles.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Number of decimal places floats are rounded to before hashing.
const HASH_FLOAT_PRECISION: f64 = 1e6;

/// A differentially-private ledger entry with integrity protection.
///
/// The `entry_hash` field is populated when an entry is appended; it is a
/// SHA-256 over the canonical representation produced by
/// [`LedgerEntry::compute_hash`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry id, `dp_<tenant>_<sequence>`.
    pub entry_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Kind of DP event (e.g. `"exposure"`).
    pub event_type: String,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// The privatized value.
    pub dp_value: f64,
    /// Epsilon consumed by this disclosure.
    pub epsilon_used: f64,
    /// Sensitivity of the underlying query.
    pub sensitivity: f64,
    /// Strictly increasing sequence number, starting at 1.
    pub sequence_number: u64,
    /// Hash of the preceding entry ([`GENESIS_HASH`] for the first).
    pub previous_hash: String,
    /// Optional metadata; keys are sorted for hashing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
    /// Hash of this entry, present once appended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_hash: Option<String>,
}

/// Round a float to six decimal places for consistent hashing.
fn round6(value: f64) -> f64 {
    (value * HASH_FLOAT_PRECISION).round() / HASH_FLOAT_PRECISION
}

impl LedgerEntry {
    /// Compute the canonical SHA-256 hash of this entry.
    ///
    /// The canonical form serializes a fixed field subset as compact JSON
    /// with sorted keys, floats rounded to six decimal places, and the
    /// timestamp as an ISO-8601 string with microsecond precision. The
    /// `entry_hash` field itself is excluded.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut canonical = Map::new();
        canonical.insert("entry_id".into(), Value::from(self.entry_id.clone()));
        canonical.insert("tenant_id".into(), Value::from(self.tenant_id.clone()));
        canonical.insert("event_type".into(), Value::from(self.event_type.clone()));
        canonical.insert(
            "timestamp".into(),
            Value::from(self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        canonical.insert("dp_value".into(), Value::from(round6(self.dp_value)));
        canonical.insert("epsilon_used".into(), Value::from(round6(self.epsilon_used)));
        canonical.insert("sensitivity".into(), Value::from(round6(self.sensitivity)));
        canonical.insert("sequence_number".into(), Value::from(self.sequence_number));
        canonical.insert(
            "previous_hash".into(),
            Value::from(self.previous_hash.clone()),
        );
        if let Some(metadata) = &self.metadata {
            // BTreeMap keeps the keys sorted.
            canonical.insert(
                "metadata".into(),
                Value::Object(metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            );
        }

        // serde_json::Map is backed by a BTreeMap, so serialization is
        // key-sorted and compact by default.
        let canonical_json = Value::Object(canonical).to_string();

        let mut hasher = Sha256::new();
        hasher.update(canonical_json.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether the stored `entry_hash` matches a fresh recomputation.
    #[must_use]
    pub fn hash_is_valid(&self) -> bool {
        self.entry_hash.as_deref() == Some(self.compute_hash().as_str())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry() -> LedgerEntry {
        LedgerEntry {
            entry_id: "dp_tenant-a_00000001".into(),
            tenant_id: "tenant-a".into(),
            event_type: "exposure".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
            dp_value: 0.123_456_789,
            epsilon_used: 0.1,
            sensitivity: 1.0,
            sequence_number: 1,
            previous_hash: GENESIS_HASH.into(),
            metadata: None,
            entry_hash: None,
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let e = entry();
        assert_eq!(e.compute_hash(), e.compute_hash());
        assert_eq!(e.compute_hash().len(), 64);
    }

    #[test]
    fn test_hash_rounds_floats() {
        let a = entry();
        let mut b = entry();
        // Differs only past the sixth decimal place.
        b.dp_value = 0.123_456_789_5;
        assert_eq!(a.compute_hash(), b.compute_hash());

        let mut c = entry();
        c.dp_value = 0.123_457_9;
        assert_ne!(a.compute_hash(), c.compute_hash());
    }

    #[test]
    fn test_hash_covers_previous_hash() {
        let a = entry();
        let mut b = entry();
        b.previous_hash = "ff".repeat(32);
        assert_ne!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn test_metadata_key_order_is_canonical() {
        let mut a = entry();
        let mut m = BTreeMap::new();
        m.insert("zebra".to_string(), Value::from(1));
        m.insert("alpha".to_string(), Value::from(2));
        a.metadata = Some(m);

        let mut b = entry();
        let mut m = BTreeMap::new();
        m.insert("alpha".to_string(), Value::from(2));
        m.insert("zebra".to_string(), Value::from(1));
        b.metadata = Some(m);

        assert_eq!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn test_serde_roundtrip_preserves_hash() {
        let mut e = entry();
        e.entry_hash = Some(e.compute_hash());

        let line = serde_json::to_string(&e).unwrap();
        let parsed: LedgerEntry = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed, e);
        assert!(parsed.hash_is_valid());
    }

    #[test]
    fn test_genesis_hash_shape() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }
}
