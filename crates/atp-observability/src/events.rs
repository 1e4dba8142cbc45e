//! Rejection and speculative-sampling event surfacing.
//!
//! Components on the admission path emit structured events rather than
//! logging free text: a [`RejectionEvent`] whenever a request is refused,
//! and a [`SpeculativeEvent`] for every stage of a speculative-sampling
//! attempt. The [`EventBus`] fans these out to subscribers in registration
//! order; a panicking subscriber is isolated and never affects the others
//! or the emitting component.

use crate::metric_names::METRIC_SPECULATIVE_EVENTS_TOTAL;
use crate::metrics;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Payload failed MIME or content validation.
    InputValidation,
    /// Nonce was seen before within its TTL.
    ReplayDetected,
    /// A governance policy refused the request.
    PolicyViolation,
    /// Budget or capacity exhausted.
    ResourceExhausted,
    /// Caller could not be authenticated.
    AuthenticationFailed,
    /// Caller exceeded a rate limit.
    RateLimitExceeded,
    /// Structured payload was missing required keys.
    SchemaMismatch,
    /// Payload could not be parsed at all.
    MalformedRequest,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectionReason::InputValidation => "input_validation",
            RejectionReason::ReplayDetected => "replay_detected",
            RejectionReason::PolicyViolation => "policy_violation",
            RejectionReason::ResourceExhausted => "resource_exhausted",
            RejectionReason::AuthenticationFailed => "authentication_failed",
            RejectionReason::RateLimitExceeded => "rate_limit_exceeded",
            RejectionReason::SchemaMismatch => "schema_mismatch",
            RejectionReason::MalformedRequest => "malformed_request",
        };
        f.write_str(s)
    }
}

/// Stages of a speculative-sampling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeculativeEventKind {
    SpeculationAttempted,
    SpeculationAccepted,
    SpeculationRejected,
    EarlyTermination,
    LatencySaved,
}

impl fmt::Display for SpeculativeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpeculativeEventKind::SpeculationAttempted => "speculation_attempted",
            SpeculativeEventKind::SpeculationAccepted => "speculation_accepted",
            SpeculativeEventKind::SpeculationRejected => "speculation_rejected",
            SpeculativeEventKind::EarlyTermination => "early_termination",
            SpeculativeEventKind::LatencySaved => "latency_saved",
        };
        f.write_str(s)
    }
}

/// Structured record of a rejected request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionEvent {
    /// Reason for rejection.
    pub reason: RejectionReason,
    /// Component that rejected the request (e.g. `"replay_guard"`).
    pub component: String,
    /// Correlation id of the rejected request, when known.
    pub request_id: Option<String>,
    /// Free-form context details.
    pub details: HashMap<String, serde_json::Value>,
    /// When the rejection happened.
    pub timestamp: DateTime<Utc>,
}

impl RejectionEvent {
    /// Create a new rejection event stamped with the current time.
    #[must_use]
    pub fn new(reason: RejectionReason, component: impl Into<String>) -> Self {
        Self {
            reason,
            component: component.into(),
            request_id: None,
            details: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the correlation id of the rejected request.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach a context detail.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Structured record of a speculative-sampling stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculativeEvent {
    /// What happened.
    pub kind: SpeculativeEventKind,
    /// The model involved (draft model for attempt/accept/reject).
    pub model_name: String,
    /// Latency saved in milliseconds, for accepted speculations.
    pub latency_saved_ms: Option<f64>,
    /// Confidence score of the speculation, in `[0, 1]`.
    pub confidence: Option<f64>,
    /// Correlation id of the request, when known.
    pub request_id: Option<String>,
    /// Free-form context details.
    pub details: HashMap<String, serde_json::Value>,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
}

impl SpeculativeEvent {
    /// Create a new speculative event stamped with the current time.
    #[must_use]
    pub fn new(kind: SpeculativeEventKind, model_name: impl Into<String>) -> Self {
        Self {
            kind,
            model_name: model_name.into(),
            latency_saved_ms: None,
            confidence: None,
            request_id: None,
            details: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the latency saved by an accepted speculation.
    #[must_use]
    pub fn with_latency_saved_ms(mut self, ms: f64) -> Self {
        self.latency_saved_ms = Some(ms);
        self
    }

    /// Attach the confidence score.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Attach the correlation id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach a context detail.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// An event carried by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum BusEvent {
    Rejection(RejectionEvent),
    Speculative(SpeculativeEvent),
}

type Subscriber = Box<dyn Fn(&BusEvent) + Send + Sync>;

/// Fan-out emitter for rejection and speculative events.
///
/// The bus does not persist, buffer, or reorder events; subscribers are
/// invoked synchronously in registration order within a single `emit`.
/// Concurrent emits may interleave across subscribers.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    speculative_events: prometheus::Counter,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

impl EventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            speculative_events: metrics::counter(
                METRIC_SPECULATIVE_EVENTS_TOTAL,
                "Total speculative sampling events emitted",
            ),
        }
    }

    /// Register a subscriber. Subscribers are invoked in registration order.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Box::new(handler));
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Emit a rejection event to all subscribers.
    pub fn emit_rejection(&self, event: RejectionEvent) {
        self.emit(&BusEvent::Rejection(event));
    }

    /// Emit a speculative event to all subscribers and bump the event counter.
    pub fn emit_speculative(&self, event: SpeculativeEvent) {
        self.emit(&BusEvent::Speculative(event));
        self.speculative_events.inc();
    }

    fn emit(&self, event: &BusEvent) {
        let subscribers = self.subscribers.read();
        for handler in subscribers.iter() {
            // A subscriber failure must not affect other subscribers or the caller.
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!("event subscriber panicked; continuing with remaining subscribers");
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_rejection_event_roundtrip() {
        let event = RejectionEvent::new(RejectionReason::ReplayDetected, "replay_guard")
            .with_request_id("req-1")
            .with_detail("nonce", serde_json::json!("N1"));

        let json = serde_json::to_string(&event).unwrap();
        let parsed: RejectionEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.reason, RejectionReason::ReplayDetected);
        assert_eq!(parsed.component, "replay_guard");
        assert_eq!(parsed.request_id.as_deref(), Some("req-1"));
        assert_eq!(parsed.details["nonce"], serde_json::json!("N1"));
    }

    #[test]
    fn test_rejection_reason_wire_format() {
        let json = serde_json::to_string(&RejectionReason::RateLimitExceeded).unwrap();
        assert_eq!(json, "\"rate_limit_exceeded\"");
        assert_eq!(RejectionReason::SchemaMismatch.to_string(), "schema_mismatch");
    }

    #[test]
    fn test_subscribers_invoked_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe(move |_| order.lock().push(i));
        }

        bus.emit_rejection(RejectionEvent::new(
            RejectionReason::InputValidation,
            "input_hardening",
        ));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| panic!("bad subscriber"));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.emit_speculative(SpeculativeEvent::new(
            SpeculativeEventKind::SpeculationAttempted,
            "draft-model-v1",
        ));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_speculative_event_builder() {
        let event = SpeculativeEvent::new(
            SpeculativeEventKind::SpeculationAccepted,
            "draft-model-v1",
        )
        .with_latency_saved_ms(30.0)
        .with_confidence(0.8)
        .with_request_id("req-9");

        assert_eq!(event.latency_saved_ms, Some(30.0));
        assert_eq!(event.confidence, Some(0.8));

        let value = serde_json::to_value(&BusEvent::Speculative(event)).unwrap();
        assert_eq!(value["event_type"], "speculative");
        assert_eq!(value["kind"], "speculation_accepted");
    }
}
