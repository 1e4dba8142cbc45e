//! ATP-Router: a multi-tenant AI-inference routing and governance plane.
//!
//! The router receives prompt/completion requests, admits or rejects them
//! under security and budget policy, selects a backend from the model
//! registry, dispatches through the uniform adapter contract, and enforces
//! the cross-cutting guarantees: anti-abuse, differential-privacy
//! accounting, tamper-evident audit, SLO gating, and cost attribution.
//!
//! The crates compose as follows:
//!
//! - [`atp_observability`]: metrics, event bus, cardinality guardrails
//! - [`atp_shield`]: replay guard, input hardening, WAF, abuse prevention
//! - [`atp_registry`]: model/provider catalog and repositories
//! - [`atp_pricing`]: pricing cache and cost math
//! - [`atp_adapter`]: the estimate/health/stream adapter contract
//! - [`atp_ledger`]: the hash-chained DP ledger
//! - [`atp_evidence`]: evidence-pack signing and notarization
//!
//! This crate owns the composition: the admission pipeline, the
//! sub-request orchestrator and dispatcher, the speculative sampler, the
//! continuous-improvement pipeline, the error-budget enforcer, and the
//! [`RouterCore`] aggregate that wires them together.
//!
//! # Example
//!
//! ```rust,ignore
//! use atp_router::{InboundRequest, RouterConfig, RouterCore};
//!
//! let core = RouterCore::builder(RouterConfig::default())
//!     .with_adapter("fast-model", my_adapter)
//!     .build()?;
//! let response = core
//!     .pipeline()
//!     .process(InboundRequest::text("tenant-a", "hello"))
//!     .await?;
//! ```

mod config;
mod core;
mod dispatcher;
mod error;
mod error_budget;
mod improvement;
mod orchestrator;
mod pipeline;
mod speculative;

pub use config::{default_slos, RouterConfig, SloConfig, SpeculativeConfig};
pub use crate::core::{RouterCore, RouterCoreBuilder};
pub use dispatcher::Dispatcher;
pub use error::{Result, RouterError};
pub use error_budget::{
    ErrorBudgetEnforcer, ErrorBudgetState, GateDecision, SloViolation,
};
pub use improvement::{
    ContinuousImprovementPipeline, PipelineExecution, PipelineStage, PipelineStatistics,
    PipelineStep, StepStatus,
};
pub use orchestrator::{
    OrchestrationSession, SessionState, SessionStatus, SubRequest, SubRequestOrchestrator,
    SubRequestStatus,
};
pub use pipeline::{AdmissionPipeline, InboundRequest, PipelineResponse, RequestPayload};
pub use speculative::{
    ConfidenceScorer, FirstTokenScorer, SpeculationBenchmark, SpeculationOutcome,
    SpeculativeSampler,
};
