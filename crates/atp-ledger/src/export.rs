//! Ledger export in NDJSON and enveloped-JSON formats.

use crate::entry::LedgerEntry;
use crate::error::{LedgerError, Result};
use crate::ledger::{DpLedger, IntegrityReport, LEDGER_FILE};
use atp_observability::metric_names::METRIC_DP_LEDGER_EXPORTS_TOTAL;
use atp_observability::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use tracing::info;

/// Envelope wrapping a JSON-format export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEnvelope {
    pub export_timestamp: DateTime<Utc>,
    pub total_entries: usize,
    pub ledger_integrity: IntegrityReport,
    pub entries: Vec<LedgerEntry>,
}

impl DpLedger {
    /// Export the ledger in the given format (`"jsonl"` or `"json"`).
    ///
    /// The export file is written next to the live ledger, named
    /// `ledger_export_<timestamp>.<format>`, and its path returned.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnsupportedFormat`] for unknown formats, or an
    /// IO/serialization error if writing fails.
    pub fn export(&self, format: &str) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let export_path = self.dir().join(format!("ledger_export_{stamp}.{format}"));
        let live = self.dir().join(LEDGER_FILE);

        match format {
            "jsonl" => {
                if live.exists() {
                    fs::copy(&live, &export_path)?;
                } else {
                    File::create(&export_path)?;
                }
            }
            "json" => {
                let entries = self.read_entries()?;
                let envelope = ExportEnvelope {
                    export_timestamp: Utc::now(),
                    total_entries: entries.len(),
                    ledger_integrity: self.verify_integrity()?,
                    entries,
                };
                fs::write(&export_path, serde_json::to_string_pretty(&envelope)?)?;
            }
            other => return Err(LedgerError::UnsupportedFormat(other.to_string())),
        }

        metrics::counter(
            METRIC_DP_LEDGER_EXPORTS_TOTAL,
            "Total ledger exports performed",
        )
        .inc();
        info!(path = %export_path.display(), format, "exported ledger");
        Ok(export_path)
    }

    fn read_entries(&self) -> Result<Vec<LedgerEntry>> {
        let live = self.dir().join(LEDGER_FILE);
        if !live.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for line in BufReader::new(File::open(live)?).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::DpLedgerConfig;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_export_copies_live_file() {
        let dir = TempDir::new().unwrap();
        let ledger = DpLedger::open(dir.path(), DpLedgerConfig::default()).unwrap();
        ledger
            .add_entry("tenant-a", "exposure", 0.5, 0.1, 1.0, None)
            .unwrap();

        let path = ledger.export("jsonl").unwrap();
        let exported = std::fs::read_to_string(&path).unwrap();
        let live = std::fs::read_to_string(ledger.ledger_file()).unwrap();
        assert_eq!(exported, live);
    }

    #[test]
    fn test_json_export_envelope() {
        let dir = TempDir::new().unwrap();
        let ledger = DpLedger::open(dir.path(), DpLedgerConfig::default()).unwrap();
        ledger
            .add_entry("tenant-a", "exposure", 0.5, 0.1, 1.0, None)
            .unwrap();
        ledger
            .add_entry("tenant-b", "exposure", 0.6, 0.2, 1.0, None)
            .unwrap();

        let path = ledger.export("json").unwrap();
        let envelope: ExportEnvelope =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();

        assert_eq!(envelope.total_entries, 2);
        assert!(envelope.ledger_integrity.valid);
        assert_eq!(envelope.entries[0].tenant_id, "tenant-a");
        assert!(envelope.entries.iter().all(LedgerEntry::hash_is_valid));
    }

    #[test]
    fn test_empty_ledger_exports() {
        let dir = TempDir::new().unwrap();
        let ledger = DpLedger::open(dir.path(), DpLedgerConfig::default()).unwrap();

        let ndjson = ledger.export("jsonl").unwrap();
        assert_eq!(std::fs::read_to_string(ndjson).unwrap(), "");

        let json = ledger.export("json").unwrap();
        let envelope: ExportEnvelope =
            serde_json::from_str(&std::fs::read_to_string(json).unwrap()).unwrap();
        assert_eq!(envelope.total_entries, 0);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let dir = TempDir::new().unwrap();
        let ledger = DpLedger::open(dir.path(), DpLedgerConfig::default()).unwrap();
        assert!(matches!(
            ledger.export("csv"),
            Err(LedgerError::UnsupportedFormat(_))
        ));
    }
}
