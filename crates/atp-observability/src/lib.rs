//! Observability substrate for the ATP router.
//!
//! This crate provides the three process-wide concerns every other router
//! crate leans on:
//!
//! - [`metrics`]: safe Prometheus registration helpers. The router is a
//!   library embedded in multiple binaries; when two components register the
//!   same metric name the default registry errors and the upstream
//!   `register_*` macros panic. These helpers log and return the existing
//!   collector instead.
//! - [`events`]: the rejection/speculative event bus. Subscribers are
//!   invoked in registration order and are panic-isolated from each other
//!   and from the emitter.
//! - [`cardinality`]: the cardinality guardrail advisor, which watches
//!   per-metric label sets and raises alerts with remediation hints before
//!   a label explosion takes the metrics backend down.
//!
//! Metric names are centralized in [`metric_names`].

pub mod cardinality;
pub mod events;
pub mod metric_names;
pub mod metrics;

pub use cardinality::{
    AlertSeverity, CardinalityAdvisor, CardinalityAdvisorConfig, CardinalityRecommendation,
    CardinalityViolation,
};
pub use events::{
    BusEvent, EventBus, RejectionEvent, RejectionReason, SpeculativeEvent, SpeculativeEventKind,
};
