// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Composed abuse prevention.
//!
//! [`AbusePrevention`] chains the subsystems in a fixed order per request:
//! entity-ban test, progressive rate limit, loop detection, anomaly
//! scoring (with a temporary ban above the ban threshold), and finally the
//! circuit-breaker state for the (tenant, endpoint). Every refusal is
//! recorded as an [`AbuseEvent`] with a threat level and the action taken.

mod anomaly;
mod circuit_breaker;
mod loop_detector;
mod rate_limiter;

pub use anomaly::{AnomalyScorer, AnomalyVerdict};
pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerError};
pub use loop_detector::{LoopDetector, LoopKind, LoopRejection, RequestContext, RequestSignature};
pub use rate_limiter::{ProgressiveRateLimiter, RateDecision, RateTier};

use crate::waf::ThreatLevel;
use atp_observability::metric_names::METRIC_ABUSE_BLOCKS_TOTAL;
use atp_observability::metrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::Opts;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Temporary entity ban applied on very high anomaly scores.
const ENTITY_BAN_DURATION: Duration = Duration::from_secs(600);

/// Abuse events older than this are evicted.
const EVENT_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

/// Interval for the background history sweeper.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Why a request was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    RequestLoop,
    RateLimitExceeded,
    AnomalousBehavior,
    RecursiveDepthExceeded,
    SuspiciousPattern,
    CircuitBreakerOpen,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockReason::RequestLoop => "request_loop",
            BlockReason::RateLimitExceeded => "rate_limit_exceeded",
            BlockReason::AnomalousBehavior => "anomalous_behavior",
            BlockReason::RecursiveDepthExceeded => "recursive_depth_exceeded",
            BlockReason::SuspiciousPattern => "suspicious_pattern",
            BlockReason::CircuitBreakerOpen => "circuit_breaker_open",
        };
        f.write_str(s)
    }
}

/// Record of a detected abuse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub source_ip: Option<String>,
    pub block_reason: BlockReason,
    pub threat_level: ThreatLevel,
    pub details: HashMap<String, serde_json::Value>,
    pub action_taken: String,
}

/// A refusal from the composed check.
#[derive(Debug, Clone, Error)]
#[error("{block_reason}: {message}")]
pub struct AbuseRejection {
    pub block_reason: BlockReason,
    pub threat_level: ThreatLevel,
    pub message: String,
    /// Retry hint in seconds, for rate refusals.
    pub retry_after_s: Option<u64>,
}

/// Everything the composed check needs to know about a request.
#[derive(Debug, Clone)]
pub struct RequestCheck<'a> {
    pub request_id: &'a str,
    pub tenant_id: &'a str,
    pub endpoint: &'a str,
    pub method: &'a str,
    pub content: &'a str,
    pub user_id: Option<&'a str>,
    pub source_ip: Option<&'a str>,
    pub parent_request_id: Option<&'a str>,
    pub depth: u32,
}

/// Snapshot of the engine's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseSystemStatus {
    pub active_requests: usize,
    pub blocked_entities: usize,
    pub recent_abuse_events: usize,
    pub anomaly_scores: HashMap<String, f64>,
    pub breaker_states: HashMap<String, BreakerState>,
}

struct TrackedEvent {
    event: AbuseEvent,
    recorded_at: Instant,
}

/// The composed abuse-prevention engine.
pub struct AbusePrevention {
    loop_detector: LoopDetector,
    rate_limiter: ProgressiveRateLimiter,
    anomaly_scorer: AnomalyScorer,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    banned_entities: Mutex<HashMap<String, Instant>>,
    events: Mutex<Vec<TrackedEvent>>,
    blocks_total: prometheus::CounterVec,
}

impl fmt::Debug for AbusePrevention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbusePrevention").finish_non_exhaustive()
    }
}

impl Default for AbusePrevention {
    fn default() -> Self {
        Self::new()
    }
}

impl AbusePrevention {
    /// Create an engine with default subsystem parameters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            loop_detector: LoopDetector::default(),
            rate_limiter: ProgressiveRateLimiter::new(),
            anomaly_scorer: AnomalyScorer::new(),
            breakers: Mutex::new(HashMap::new()),
            banned_entities: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            blocks_total: metrics::counter_vec(
                Opts::new(METRIC_ABUSE_BLOCKS_TOTAL, "Total abuse blocks"),
                &["block_reason"],
            ),
        }
    }

    /// Create an engine with a custom loop detector (for tests tightening
    /// windows).
    #[must_use]
    pub fn with_loop_detector(mut self, detector: LoopDetector) -> Self {
        self.loop_detector = detector;
        self
    }

    /// The composed request check.
    ///
    /// On success the request is tracked as active; the caller must invoke
    /// [`AbusePrevention::end_request`] when it completes.
    ///
    /// # Errors
    ///
    /// Returns an [`AbuseRejection`] naming the first subsystem that
    /// refused.
    pub fn check_request(&self, check: &RequestCheck<'_>) -> Result<(), AbuseRejection> {
        let entity_key = entity_key(check.tenant_id, check.user_id);

        // Entity ban first.
        {
            let mut banned = self.banned_entities.lock();
            if let Some(banned_at) = banned.get(&entity_key) {
                if banned_at.elapsed() < ENTITY_BAN_DURATION {
                    return Err(self.record(
                        check,
                        BlockReason::SuspiciousPattern,
                        ThreatLevel::High,
                        "entity temporarily blocked".to_string(),
                        None,
                        HashMap::new(),
                    ));
                }
                banned.remove(&entity_key);
            }
        }

        // Rate limiting.
        let decision = self
            .rate_limiter
            .is_allowed(check.tenant_id, check.user_id, check.endpoint);
        if !decision.allowed {
            let mut details = HashMap::new();
            details.insert("reason".to_string(), serde_json::json!(decision.reason));
            details.insert(
                "retry_after_s".to_string(),
                serde_json::json!(decision.retry_after_s),
            );
            details.insert("endpoint".to_string(), serde_json::json!(check.endpoint));
            return Err(self.record(
                check,
                BlockReason::RateLimitExceeded,
                ThreatLevel::Medium,
                format!("rate limit exceeded: {}", decision.reason),
                Some(decision.retry_after_s),
                details,
            ));
        }

        // Loop detection.
        let context = RequestContext {
            request_id: check.request_id.to_string(),
            signature: RequestSignature::new(
                check.content,
                check.endpoint,
                check.method,
                check.tenant_id,
                check.user_id,
            ),
            started_at: Instant::now(),
            parent_request_id: check.parent_request_id.map(ToString::to_string),
            depth: check.depth,
            source_ip: check.source_ip.map(ToString::to_string),
        };
        if let Err(rejection) = self.loop_detector.start_request(context) {
            let reason = match rejection.kind {
                LoopKind::DepthExceeded => BlockReason::RecursiveDepthExceeded,
                LoopKind::ImmediateLoop | LoopKind::PatternLoop => BlockReason::RequestLoop,
            };
            let mut details = HashMap::new();
            details.insert(
                "reason".to_string(),
                serde_json::json!(rejection.kind.to_string()),
            );
            details.insert("depth".to_string(), serde_json::json!(rejection.depth));
            return Err(self.record(
                check,
                reason,
                ThreatLevel::High,
                rejection.message,
                None,
                details,
            ));
        }

        // Anomaly scoring. Only a ban-level score refuses the request; a
        // merely-anomalous one is recorded and allowed through.
        let verdict = self.anomaly_scorer.analyze(
            check.tenant_id,
            check.endpoint,
            check.method,
            check.depth,
        );
        if verdict.anomalous {
            let ban = verdict.score > anomaly::BAN_THRESHOLD;
            let threat = if ban {
                ThreatLevel::Critical
            } else {
                ThreatLevel::High
            };
            let mut details = HashMap::new();
            details.insert("anomaly_score".to_string(), serde_json::json!(verdict.score));
            details.insert("reason".to_string(), serde_json::json!(verdict.reason));

            if ban {
                self.banned_entities
                    .lock()
                    .insert(entity_key, Instant::now());
                self.loop_detector.end_request(check.request_id);
                return Err(self.record(
                    check,
                    BlockReason::AnomalousBehavior,
                    threat,
                    format!("anomalous behavior detected: {}", verdict.reason),
                    None,
                    details,
                ));
            }
            self.record_event(check, BlockReason::AnomalousBehavior, threat, details);
        }

        // Circuit breaker state.
        let breaker = self.breaker(check.tenant_id, check.endpoint);
        if breaker.state() == BreakerState::Open {
            self.loop_detector.end_request(check.request_id);
            return Err(self.record(
                check,
                BlockReason::CircuitBreakerOpen,
                ThreatLevel::Medium,
                "circuit breaker is open".to_string(),
                None,
                HashMap::new(),
            ));
        }

        Ok(())
    }

    /// Release active-request tracking and feed the breaker.
    pub fn end_request(&self, request_id: &str, success: bool) {
        if let Some(context) = self.loop_detector.end_request(request_id) {
            let breaker =
                self.breaker(&context.signature.tenant_id, &context.signature.endpoint);
            if success {
                breaker.on_success();
            } else {
                breaker.on_failure();
            }
        }
    }

    /// The breaker for a (tenant, endpoint) pair.
    #[must_use]
    pub fn breaker(&self, tenant_id: &str, endpoint: &str) -> Arc<CircuitBreaker> {
        Arc::clone(
            self.breakers
                .lock()
                .entry(format!("{tenant_id}:{endpoint}"))
                .or_default(),
        )
    }

    /// Recent abuse events, optionally filtered by tenant, within the last
    /// `hours`.
    #[must_use]
    pub fn abuse_events(&self, tenant_id: Option<&str>, hours: u64) -> Vec<AbuseEvent> {
        let horizon = Duration::from_secs(hours * 3600);
        self.events
            .lock()
            .iter()
            .filter(|t| t.recorded_at.elapsed() < horizon)
            .filter(|t| tenant_id.map_or(true, |id| t.event.tenant_id == id))
            .map(|t| t.event.clone())
            .collect()
    }

    /// Engine status snapshot.
    #[must_use]
    pub fn system_status(&self) -> AbuseSystemStatus {
        let breaker_states = self
            .breakers
            .lock()
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.state()))
            .collect();
        AbuseSystemStatus {
            active_requests: self.loop_detector.active_count(),
            blocked_entities: self.banned_entities.lock().len(),
            recent_abuse_events: self.abuse_events(None, 1).len(),
            anomaly_scores: self.anomaly_scorer.all_scores(),
            breaker_states,
        }
    }

    /// Clear all tracking for an entity: bans, rate violations, anomaly
    /// samples.
    pub fn reset_entity(&self, tenant_id: &str, user_id: Option<&str>) {
        self.banned_entities
            .lock()
            .remove(&entity_key(tenant_id, user_id));
        self.rate_limiter
            .reset_violations(tenant_id, user_id, "default");
        self.anomaly_scorer.reset(tenant_id);
    }

    /// One sweep of the periodic cleanup: old loop history and expired
    /// events.
    pub fn cleanup(&self) {
        self.loop_detector.cleanup_old_history();
        self.events
            .lock()
            .retain(|t| t.recorded_at.elapsed() < EVENT_RETENTION);
    }

    /// Background cleanup loop; runs until the owning task is dropped.
    pub async fn run_cleanup_loop(&self) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.cleanup();
        }
    }

    fn record(
        &self,
        check: &RequestCheck<'_>,
        reason: BlockReason,
        threat: ThreatLevel,
        message: String,
        retry_after_s: Option<u64>,
        details: HashMap<String, serde_json::Value>,
    ) -> AbuseRejection {
        self.record_event(check, reason, threat, details);
        AbuseRejection {
            block_reason: reason,
            threat_level: threat,
            message,
            retry_after_s,
        }
    }

    fn record_event(
        &self,
        check: &RequestCheck<'_>,
        reason: BlockReason,
        threat: ThreatLevel,
        details: HashMap<String, serde_json::Value>,
    ) {
        let action_taken = if threat >= ThreatLevel::High {
            "blocked"
        } else {
            "logged"
        };
        let event = AbuseEvent {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            tenant_id: check.tenant_id.to_string(),
            user_id: check.user_id.map(ToString::to_string),
            source_ip: check.source_ip.map(ToString::to_string),
            block_reason: reason,
            threat_level: threat,
            details,
            action_taken: action_taken.to_string(),
        };
        warn!(
            tenant = check.tenant_id,
            reason = %reason,
            threat = %threat,
            "abuse event recorded"
        );
        self.blocks_total
            .with_label_values(&[&reason.to_string()])
            .inc();
        self.events.lock().push(TrackedEvent {
            event,
            recorded_at: Instant::now(),
        });
    }
}

fn entity_key(tenant_id: &str, user_id: Option<&str>) -> String {
    format!("{tenant_id}:{}", user_id.unwrap_or("anonymous"))
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn check<'a>(request_id: &'a str, content: &'a str) -> RequestCheck<'a> {
        RequestCheck {
            request_id,
            tenant_id: "tenant-a",
            endpoint: "/infer",
            method: "POST",
            content,
            user_id: Some("u1"),
            source_ip: Some("10.0.0.1"),
            parent_request_id: None,
            depth: 0,
        }
    }

    #[test]
    fn test_clean_request_allowed_and_tracked() {
        let engine = AbusePrevention::new();
        assert!(engine.check_request(&check("r1", "hello")).is_ok());
        assert_eq!(engine.system_status().active_requests, 1);
        engine.end_request("r1", true);
        assert_eq!(engine.system_status().active_requests, 0);
    }

    #[test]
    fn test_immediate_loop_blocked_with_high_threat() {
        let engine = AbusePrevention::new();
        assert!(engine.check_request(&check("r1", "same-content")).is_ok());

        let rejection = engine.check_request(&check("r2", "same-content")).unwrap_err();
        assert_eq!(rejection.block_reason, BlockReason::RequestLoop);
        assert_eq!(rejection.threat_level, ThreatLevel::High);

        // After the first completes, the same signature is admitted again.
        engine.end_request("r1", true);
        assert!(engine.check_request(&check("r3", "same-content")).is_ok());

        let events = engine.abuse_events(Some("tenant-a"), 24);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action_taken, "blocked");
        assert_eq!(events[0].details["reason"], "immediate_loop");
        assert_eq!(events[0].details["depth"], 0);
    }

    #[test]
    fn test_depth_exceeded() {
        let engine = AbusePrevention::new();
        let mut deep = check("r1", "content");
        deep.depth = 11;
        let rejection = engine.check_request(&deep).unwrap_err();
        assert_eq!(rejection.block_reason, BlockReason::RecursiveDepthExceeded);
    }

    #[test]
    fn test_breaker_open_blocks_requests() {
        let engine = AbusePrevention::new();
        let breaker = engine.breaker("tenant-a", "/infer");
        for _ in 0..5 {
            breaker.on_failure();
        }

        let rejection = engine.check_request(&check("r1", "hello")).unwrap_err();
        assert_eq!(rejection.block_reason, BlockReason::CircuitBreakerOpen);
        // The refused request must not stay tracked as active.
        assert_eq!(engine.system_status().active_requests, 0);
    }

    #[test]
    fn test_end_request_feeds_breaker() {
        let engine = AbusePrevention::new();
        for i in 0..5 {
            let id = format!("r{i}");
            let content = format!("content-{i}");
            let c = check(&id, &content);
            engine.check_request(&c).unwrap();
            engine.end_request(&id, false);
        }
        assert_eq!(
            engine.breaker("tenant-a", "/infer").state(),
            BreakerState::Open
        );
    }

    #[test]
    fn test_anomaly_ban_then_reset() {
        let engine = AbusePrevention::new();
        // Drive the tenant to a ban-level anomaly score: high frequency,
        // endpoint scanning, deep recursion, mixed methods.
        let mut banned = false;
        for i in 0..500 {
            let id = format!("r{i}");
            let content = format!("content-{i}");
            let endpoint = format!("/e{}", i % 60);
            let method = ["GET", "POST", "PUT", "DELETE", "PATCH"][i % 5];
            let c = RequestCheck {
                request_id: &id,
                tenant_id: "tenant-a",
                endpoint: &endpoint,
                method,
                content: &content,
                user_id: Some("u1"),
                source_ip: None,
                parent_request_id: None,
                depth: 10,
            };
            match engine.check_request(&c) {
                Ok(()) => engine.end_request(&id, true),
                Err(rejection) => {
                    assert_eq!(rejection.block_reason, BlockReason::AnomalousBehavior);
                    assert_eq!(rejection.threat_level, ThreatLevel::Critical);
                    banned = true;
                    break;
                }
            }
        }
        assert!(banned, "tenant never reached ban threshold");
        assert_eq!(engine.system_status().blocked_entities, 1);

        // While banned, even clean requests are refused.
        let rejection = engine.check_request(&check("clean", "clean")).unwrap_err();
        assert_eq!(rejection.block_reason, BlockReason::SuspiciousPattern);

        engine.reset_entity("tenant-a", Some("u1"));
        assert!(engine.check_request(&check("after-reset", "clean")).is_ok());
    }

    #[test]
    fn test_event_filtering_by_tenant() {
        let engine = AbusePrevention::new();
        engine.check_request(&check("r1", "dup")).unwrap();
        let _ = engine.check_request(&check("r2", "dup"));

        assert_eq!(engine.abuse_events(Some("tenant-a"), 24).len(), 1);
        assert!(engine.abuse_events(Some("other"), 24).is_empty());
        assert_eq!(engine.abuse_events(None, 24).len(), 1);
    }
}
