//! Security substrate of the admission path.
//!
//! Four layers, applied in order by the pipeline:
//!
//! 1. [`hardening`]: MIME sniffing and schema validation of raw payloads.
//! 2. [`waf`]: rule-driven scanning for prompt injection, code/SQL/XSS
//!    injection, path traversal, and secret leakage, with action
//!    arbitration and sanitization.
//! 3. [`nonce`]: the anti-replay store.
//! 4. [`abuse`]: loop detection, progressive rate limiting, anomaly
//!    scoring, circuit breakers, and entity bans.
//!
//! Each subsystem guards its own state and is safe to share behind an
//! `Arc` across request tasks.

pub mod abuse;
pub mod hardening;
pub mod nonce;
pub mod waf;

mod error;

pub use abuse::{
    AbuseEvent, AbusePrevention, AbuseRejection, BlockReason, CircuitBreaker, CircuitBreakerError,
    LoopDetector, ProgressiveRateLimiter, RateTier, RequestCheck, RequestSignature,
};
pub use error::{Result, ShieldError};
pub use hardening::{InputHardening, InputPayload};
pub use nonce::NonceStore;
pub use waf::{
    AttackType, ThreatDetection, ThreatLevel, Waf, WafAction, WafConfig, WafResult, WafRule,
};
