//! Hash-chained differential-privacy ledger.
//!
//! Every differentially-private disclosure the router makes is recorded as a
//! [`LedgerEntry`] in an append-only NDJSON log. Entries form a hash chain:
//! each entry carries the hash of its predecessor, and its own hash is a
//! SHA-256 over a canonical representation (sorted keys, floats rounded to
//! six decimal places, ISO-8601 timestamps) so the chain verifies
//! identically across languages and serializer versions.
//!
//! The ledger also enforces per-tenant epsilon budgets: an entry that would
//! push a tenant past the configured maximum is rejected and never
//! persisted.
//!
//! # Example
//!
//! ```rust,ignore
//! use atp_ledger::{DpLedger, DpLedgerConfig};
//!
//! let ledger = DpLedger::open("./dp_ledger", DpLedgerConfig::default())?;
//! ledger.add_entry("tenant-a", "exposure", 0.42, 0.1, 1.0, None)?;
//! let report = ledger.verify_integrity()?;
//! assert!(report.valid);
//! ```

mod entry;
mod error;
mod export;
mod ledger;

pub use entry::{LedgerEntry, GENESIS_HASH};
pub use error::{LedgerError, Result};
pub use export::ExportEnvelope;
pub use ledger::{BudgetStatus, DpLedger, DpLedgerConfig, IntegrityReport, LedgerStats};
