//! Error taxonomy of the routing plane.
//!
//! Each variant maps one row of the boundary error table: rejections from
//! the hardening/WAF/replay chain, abuse refusals, budget failures, adapter
//! and transport failures, and orchestration misuse. The pipeline never
//! retries on behalf of the caller.

use atp_adapter::AdapterError;
use atp_ledger::LedgerError;
use atp_pricing::PricingError;
use atp_registry::RegistryError;
use atp_shield::{AbuseRejection, ShieldError, WafAction};
use thiserror::Error;

/// Router result type.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors surfaced by the routing plane.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RouterError {
    /// Input hardening refused the payload.
    #[error(transparent)]
    InputInvalid(#[from] ShieldError),

    /// The WAF blocked or quarantined the input.
    #[error("request blocked by WAF ({action}): {reason}")]
    WafBlocked { action: WafAction, reason: String },

    /// The WAF's per-client rate limit fired.
    #[error("rate limited; retry after {retry_after_s} s")]
    RateLimited { retry_after_s: u64 },

    /// The request's nonce was seen before.
    #[error("replay detected for nonce {nonce}")]
    Replay { nonce: String },

    /// The abuse-prevention engine refused the request.
    #[error(transparent)]
    Abuse(#[from] AbuseRejection),

    /// No selectable model satisfies the request.
    #[error("no model available: {reason}")]
    NoModelAvailable { reason: String },

    /// The cost pre-check exceeded the tenant's budget.
    #[error("estimated cost {estimated_usd:.6} exceeds tenant budget {budget_usd:.6}")]
    CostBudgetExceeded {
        estimated_usd: f64,
        budget_usd: f64,
    },

    /// Adapter-side failure.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Pricing failure.
    #[error(transparent)]
    Pricing(#[from] PricingError),

    /// Ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Unknown orchestration session.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Unknown sub-request within a session.
    #[error("request {request_id} not found in session {session_id}")]
    SubRequestNotFound {
        session_id: String,
        request_id: String,
    },

    /// The session has already reached a terminal state.
    #[error("session {0} is already completed")]
    SessionCompleted(String),

    /// `start_session` on a session that is not idle.
    #[error("session {0} is not in the idle state")]
    SessionNotIdle(String),

    /// No adapter is registered under this name.
    #[error("no adapter registered for {0}")]
    UnknownAdapter(String),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The overall request timeout elapsed.
    #[error("request timed out after {0} ms")]
    Timeout(u64),
}
