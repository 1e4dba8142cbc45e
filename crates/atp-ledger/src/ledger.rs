//! Append path, recovery, budget accounting, and integrity verification.

use crate::entry::{LedgerEntry, GENESIS_HASH};
use crate::error::{LedgerError, Result};
use atp_observability::metric_names::{
    METRIC_DP_LEDGER_BUDGET_EXCEEDED_TOTAL, METRIC_DP_LEDGER_ENTRIES_TOTAL,
};
use atp_observability::metrics;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Name of the live ledger file inside the ledger directory.
pub(crate) const LEDGER_FILE: &str = "ledger.jsonl";

/// Ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpLedgerConfig {
    /// Maximum cumulative epsilon a single tenant may consume.
    pub max_epsilon_per_tenant: f64,
}

impl Default for DpLedgerConfig {
    fn default() -> Self {
        Self {
            max_epsilon_per_tenant: 2.0,
        }
    }
}

/// Epsilon budget status for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub tenant_id: String,
    pub epsilon_used: f64,
    pub epsilon_remaining: f64,
    pub epsilon_limit: f64,
    pub utilization: f64,
}

/// Result of an integrity walk over the ledger file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// True iff every entry's chain link and own hash verified.
    pub valid: bool,
    /// Entries examined.
    pub entries_checked: usize,
    /// Entries with a broken chain link or hash mismatch.
    pub corrupt_entries: usize,
    /// Description of the first failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_error: Option<String>,
}

/// Summary statistics for the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_entries: u64,
    pub ledger_integrity: IntegrityReport,
    pub active_tenants: usize,
    pub total_epsilon_used: f64,
    pub last_hash: String,
}

struct LedgerState {
    current_sequence: u64,
    last_hash: String,
    tenant_epsilon: HashMap<String, f64>,
}

impl LedgerState {
    fn genesis() -> Self {
        Self {
            current_sequence: 0,
            last_hash: GENESIS_HASH.to_string(),
            tenant_epsilon: HashMap::new(),
        }
    }
}

/// Append-only, hash-chained DP event ledger.
///
/// Appends serialize around the (sequence, last-hash, epsilon-map) critical
/// section; readers (integrity verification, export) re-read the file and
/// tolerate a moving tail.
pub struct DpLedger {
    dir: PathBuf,
    config: DpLedgerConfig,
    state: Mutex<LedgerState>,
    entries_total: prometheus::Counter,
    budget_exceeded_total: prometheus::Counter,
}

impl std::fmt::Debug for DpLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpLedger")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish()
    }
}

impl DpLedger {
    /// Open (or create) a ledger rooted at `dir`, recovering prior state.
    ///
    /// If the existing log fails to parse, the ledger resets to genesis; the
    /// corrupt file is moved aside for forensic analysis rather than
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the log cannot
    /// be read.
    pub fn open(dir: impl AsRef<Path>, config: DpLedgerConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let ledger = Self {
            dir,
            config,
            state: Mutex::new(LedgerState::genesis()),
            entries_total: metrics::counter(
                METRIC_DP_LEDGER_ENTRIES_TOTAL,
                "Total entries appended to the DP ledger",
            ),
            budget_exceeded_total: metrics::counter(
                METRIC_DP_LEDGER_BUDGET_EXCEEDED_TOTAL,
                "Total entries rejected for exceeding an epsilon budget",
            ),
        };
        ledger.recover()?;
        Ok(ledger)
    }

    /// Path of the live ledger file.
    #[must_use]
    pub fn ledger_file(&self) -> PathBuf {
        self.dir.join(LEDGER_FILE)
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    fn recover(&self) -> Result<()> {
        let path = self.ledger_file();
        if !path.exists() {
            return Ok(());
        }

        match self.rebuild_state(&path) {
            Ok(state) => {
                info!(
                    entries = state.current_sequence,
                    last_hash = &state.last_hash[..16],
                    "recovered ledger state"
                );
                *self.state.lock() = state;
                Ok(())
            }
            Err(e) => {
                let quarantine = self.dir.join(format!(
                    "ledger.corrupt.{}.jsonl",
                    Utc::now().format("%Y%m%d_%H%M%S")
                ));
                error!(
                    error = %e,
                    quarantine = %quarantine.display(),
                    "LEDGER CORRUPTION: failed to recover state; resetting to genesis and \
                     preserving the prior log"
                );
                fs::rename(&path, &quarantine)?;
                *self.state.lock() = LedgerState::genesis();
                Ok(())
            }
        }
    }

    fn rebuild_state(&self, path: &Path) -> Result<LedgerState> {
        let file = File::open(path)?;
        let mut state = LedgerState::genesis();

        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry =
                serde_json::from_str(&line).map_err(|e| LedgerError::CorruptEntry {
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            state.current_sequence = entry.sequence_number;
            if let Some(hash) = &entry.entry_hash {
                state.last_hash = hash.clone();
            }
            *state
                .tenant_epsilon
                .entry(entry.tenant_id.clone())
                .or_insert(0.0) += entry.epsilon_used;
        }
        Ok(state)
    }

    /// Append a DP event, enforcing the tenant's epsilon budget.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::BudgetExceeded`] without persisting anything
    /// when the tenant's cumulative epsilon would pass the cap, or an IO
    /// error if the append fails.
    pub fn add_entry(
        &self,
        tenant_id: &str,
        event_type: &str,
        dp_value: f64,
        epsilon_used: f64,
        sensitivity: f64,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<LedgerEntry> {
        let mut state = self.state.lock();

        let used = state.tenant_epsilon.get(tenant_id).copied().unwrap_or(0.0);
        if used + epsilon_used > self.config.max_epsilon_per_tenant {
            warn!(
                tenant = tenant_id,
                used,
                requested = epsilon_used,
                limit = self.config.max_epsilon_per_tenant,
                "privacy budget exceeded"
            );
            self.budget_exceeded_total.inc();
            return Err(LedgerError::BudgetExceeded {
                tenant: tenant_id.to_string(),
                used,
                requested: epsilon_used,
                limit: self.config.max_epsilon_per_tenant,
            });
        }

        let sequence = state.current_sequence + 1;
        let mut entry = LedgerEntry {
            entry_id: format!("dp_{tenant_id}_{sequence:08}"),
            tenant_id: tenant_id.to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            dp_value,
            epsilon_used,
            sensitivity,
            sequence_number: sequence,
            previous_hash: state.last_hash.clone(),
            metadata,
            entry_hash: None,
        };
        let hash = entry.compute_hash();
        entry.entry_hash = Some(hash.clone());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.ledger_file())?;
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;

        state.current_sequence = sequence;
        state.last_hash = hash;
        *state
            .tenant_epsilon
            .entry(tenant_id.to_string())
            .or_insert(0.0) += epsilon_used;

        self.entries_total.inc();
        Ok(entry)
    }

    /// Walk the log verifying the hash chain and per-entry hashes.
    ///
    /// # Errors
    ///
    /// Returns an error only if the file cannot be read; parse failures are
    /// reported as corrupt entries in the report.
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        let path = self.ledger_file();
        if !path.exists() {
            return Ok(IntegrityReport {
                valid: true,
                entries_checked: 0,
                corrupt_entries: 0,
                first_error: None,
            });
        }

        let file = File::open(path)?;
        let mut expected_previous = GENESIS_HASH.to_string();
        let mut entries_checked = 0;
        let mut corrupt_entries = 0;
        let mut first_error = None;

        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries_checked += 1;

            let entry: LedgerEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(e) => {
                    corrupt_entries += 1;
                    first_error
                        .get_or_insert_with(|| format!("line {}: unparseable: {e}", idx + 1));
                    continue;
                }
            };

            if entry.previous_hash != expected_previous {
                corrupt_entries += 1;
                first_error.get_or_insert_with(|| {
                    format!("entry {}: hash chain broken", entry.entry_id)
                });
            }

            let computed = entry.compute_hash();
            if entry.entry_hash.as_deref() != Some(computed.as_str()) {
                corrupt_entries += 1;
                first_error
                    .get_or_insert_with(|| format!("entry {}: hash mismatch", entry.entry_id));
            }

            expected_previous = entry.entry_hash.unwrap_or(computed);
        }

        Ok(IntegrityReport {
            valid: corrupt_entries == 0,
            entries_checked,
            corrupt_entries,
            first_error,
        })
    }

    /// Epsilon budget status for a tenant.
    #[must_use]
    pub fn budget_status(&self, tenant_id: &str) -> BudgetStatus {
        let state = self.state.lock();
        let used = state.tenant_epsilon.get(tenant_id).copied().unwrap_or(0.0);
        let limit = self.config.max_epsilon_per_tenant;
        BudgetStatus {
            tenant_id: tenant_id.to_string(),
            epsilon_used: used,
            epsilon_remaining: (limit - used).max(0.0),
            epsilon_limit: limit,
            utilization: if limit > 0.0 { used / limit } else { 0.0 },
        }
    }

    /// Summary statistics, including a fresh integrity walk.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn stats(&self) -> Result<LedgerStats> {
        let integrity = self.verify_integrity()?;
        let state = self.state.lock();
        Ok(LedgerStats {
            total_entries: state.current_sequence,
            ledger_integrity: integrity,
            active_tenants: state.tenant_epsilon.len(),
            total_epsilon_used: state.tenant_epsilon.values().sum(),
            last_hash: state.last_hash.clone(),
        })
    }

    /// Current sequence number (0 when empty).
    #[must_use]
    pub fn current_sequence(&self) -> u64 {
        self.state.lock().current_sequence
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> DpLedger {
        DpLedger::open(dir.path(), DpLedgerConfig::default()).unwrap()
    }

    #[test]
    fn test_append_builds_hash_chain() {
        let dir = TempDir::new().unwrap();
        let ledger = open(&dir);

        let e1 = ledger
            .add_entry("tenant-a", "exposure", 0.5, 0.1, 1.0, None)
            .unwrap();
        let e2 = ledger
            .add_entry("tenant-a", "exposure", 0.7, 0.1, 1.0, None)
            .unwrap();

        assert_eq!(e1.previous_hash, GENESIS_HASH);
        assert_eq!(e2.previous_hash, e1.entry_hash.unwrap());
        assert_eq!(e2.sequence_number, 2);
    }

    #[test]
    fn test_budget_rejection_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let ledger = open(&dir);

        ledger
            .add_entry("tenant-t", "exposure", 1.0, 0.8, 1.0, None)
            .unwrap();
        ledger
            .add_entry("tenant-t", "exposure", 1.0, 0.8, 1.0, None)
            .unwrap();

        // Third entry would total 2.1 > 2.0.
        let err = ledger
            .add_entry("tenant-t", "exposure", 1.0, 0.5, 1.0, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::BudgetExceeded { .. }));

        assert_eq!(ledger.current_sequence(), 2);
        let report = ledger.verify_integrity().unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 2);
    }

    #[test]
    fn test_zero_epsilon_entry_consumes_no_budget() {
        let dir = TempDir::new().unwrap();
        let ledger = open(&dir);

        ledger
            .add_entry("tenant-z", "heartbeat", 0.0, 0.0, 0.0, None)
            .unwrap();
        let status = ledger.budget_status("tenant-z");
        assert_eq!(status.epsilon_used, 0.0);
        assert_eq!(status.epsilon_remaining, 2.0);
        assert_eq!(ledger.current_sequence(), 1);
    }

    #[test]
    fn test_budget_status_utilization() {
        let dir = TempDir::new().unwrap();
        let ledger = open(&dir);
        ledger
            .add_entry("tenant-u", "exposure", 0.1, 0.5, 1.0, None)
            .unwrap();

        let status = ledger.budget_status("tenant-u");
        assert_eq!(status.epsilon_used, 0.5);
        assert_eq!(status.epsilon_limit, 2.0);
        assert!((status.utilization - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_recovery_restores_sequence_and_budgets() {
        let dir = TempDir::new().unwrap();
        {
            let ledger = open(&dir);
            ledger
                .add_entry("tenant-a", "exposure", 0.5, 0.3, 1.0, None)
                .unwrap();
            ledger
                .add_entry("tenant-b", "exposure", 0.5, 0.4, 1.0, None)
                .unwrap();
        }

        let reopened = open(&dir);
        assert_eq!(reopened.current_sequence(), 2);
        assert_eq!(reopened.budget_status("tenant-a").epsilon_used, 0.3);
        assert_eq!(reopened.budget_status("tenant-b").epsilon_used, 0.4);

        // The chain continues from the recovered tail.
        let e3 = reopened
            .add_entry("tenant-a", "exposure", 0.5, 0.1, 1.0, None)
            .unwrap();
        assert_eq!(e3.sequence_number, 3);
        assert!(reopened.verify_integrity().unwrap().valid);
    }

    #[test]
    fn test_corrupt_log_resets_to_genesis_and_preserves_file() {
        let dir = TempDir::new().unwrap();
        {
            let ledger = open(&dir);
            ledger
                .add_entry("tenant-a", "exposure", 0.5, 0.3, 1.0, None)
                .unwrap();
        }
        std::fs::write(dir.path().join(LEDGER_FILE), "this is not json\n").unwrap();

        let reopened = open(&dir);
        assert_eq!(reopened.current_sequence(), 0);

        let quarantined: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("ledger.corrupt."))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn test_tampered_entry_fails_integrity() {
        let dir = TempDir::new().unwrap();
        let ledger = open(&dir);
        ledger
            .add_entry("tenant-a", "exposure", 0.5, 0.3, 1.0, None)
            .unwrap();
        ledger
            .add_entry("tenant-a", "exposure", 0.6, 0.3, 1.0, None)
            .unwrap();

        // Flip a value in the first line without recomputing its hash.
        let path = ledger.ledger_file();
        let contents = std::fs::read_to_string(&path).unwrap();
        let tampered = contents.replacen("0.5", "0.9", 1);
        std::fs::write(&path, tampered).unwrap();

        let report = ledger.verify_integrity().unwrap();
        assert!(!report.valid);
        assert!(report.corrupt_entries >= 1);
        assert!(report.first_error.is_some());
    }
}
