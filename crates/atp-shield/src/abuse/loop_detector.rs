// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Request loop detection.

use atp_observability::metric_names::{
    METRIC_ACTIVE_REQUESTS, METRIC_LOOP_DETECTIONS_TOTAL, METRIC_REQUEST_DEPTH,
};
use atp_observability::metrics;
use parking_lot::Mutex;
use prometheus::{HistogramOpts, Opts};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Pattern loops fire when the same signature completes this many times
/// within the loop window.
const PATTERN_LOOP_THRESHOLD: usize = 5;

/// The loop-detection identity of a request.
///
/// Two requests are "the same" iff their content fingerprint, endpoint,
/// method, tenant, and user all match. Value-typed; no identity semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestSignature {
    /// Truncated SHA-256 of the normalized payload.
    pub content_hash: String,
    pub endpoint: String,
    pub method: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
}

impl RequestSignature {
    /// Build a signature, fingerprinting `content`.
    #[must_use]
    pub fn new(
        content: &str,
        endpoint: &str,
        method: &str,
        tenant_id: &str,
        user_id: Option<&str>,
    ) -> Self {
        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        Self {
            content_hash: digest[..16].to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: user_id.map(ToString::to_string),
        }
    }
}

/// Tracking context for one in-flight request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub signature: RequestSignature,
    pub started_at: Instant,
    pub parent_request_id: Option<String>,
    pub depth: u32,
    pub source_ip: Option<String>,
}

/// Why the loop detector refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    DepthExceeded,
    ImmediateLoop,
    PatternLoop,
}

impl std::fmt::Display for LoopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopKind::DepthExceeded => "depth_exceeded",
            LoopKind::ImmediateLoop => "immediate_loop",
            LoopKind::PatternLoop => "pattern_loop",
        };
        f.write_str(s)
    }
}

/// A loop-detection refusal.
#[derive(Debug, Clone)]
pub struct LoopRejection {
    pub kind: LoopKind,
    pub message: String,
    pub depth: u32,
}

struct DetectorState {
    active: HashMap<String, RequestContext>,
    history: HashMap<String, Vec<(RequestSignature, Instant)>>,
}

/// Detects recursive and repeated request patterns.
pub struct LoopDetector {
    max_depth: u32,
    loop_window: Duration,
    state: Mutex<DetectorState>,
    detections_total: prometheus::CounterVec,
    depth_hist: prometheus::HistogramVec,
    active_gauge: prometheus::GaugeVec,
}

impl std::fmt::Debug for LoopDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopDetector")
            .field("max_depth", &self.max_depth)
            .field("loop_window", &self.loop_window)
            .finish()
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(300))
    }
}

impl LoopDetector {
    /// Create a detector with the given depth limit and pattern window.
    #[must_use]
    pub fn new(max_depth: u32, loop_window: Duration) -> Self {
        Self {
            max_depth,
            loop_window,
            state: Mutex::new(DetectorState {
                active: HashMap::new(),
                history: HashMap::new(),
            }),
            detections_total: metrics::counter_vec(
                Opts::new(METRIC_LOOP_DETECTIONS_TOTAL, "Total loop detections"),
                &["detection_type"],
            ),
            depth_hist: metrics::histogram_vec(
                HistogramOpts::new(METRIC_REQUEST_DEPTH, "Observed request depth")
                    .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 20.0]),
                &["tenant_id"],
            ),
            active_gauge: metrics::gauge_vec(
                Opts::new(METRIC_ACTIVE_REQUESTS, "Active in-flight requests"),
                &["tenant_id"],
            ),
        }
    }

    /// Begin tracking a request, refusing loops.
    ///
    /// # Errors
    ///
    /// Returns a [`LoopRejection`] when the depth limit is exceeded, an
    /// equal-signature request is already active, or the signature has
    /// completed [`PATTERN_LOOP_THRESHOLD`] times within the window.
    pub fn start_request(&self, context: RequestContext) -> Result<(), LoopRejection> {
        if context.depth > self.max_depth {
            self.detections_total
                .with_label_values(&["depth_exceeded"])
                .inc();
            return Err(LoopRejection {
                kind: LoopKind::DepthExceeded,
                message: format!(
                    "request depth {} exceeds maximum {}",
                    context.depth, self.max_depth
                ),
                depth: context.depth,
            });
        }

        let mut state = self.state.lock();

        if state
            .active
            .values()
            .any(|active| active.signature == context.signature)
        {
            self.detections_total
                .with_label_values(&["immediate_loop"])
                .inc();
            return Err(LoopRejection {
                kind: LoopKind::ImmediateLoop,
                message: "immediate loop detected: duplicate active request".to_string(),
                depth: context.depth,
            });
        }

        let tenant = context.signature.tenant_id.clone();
        let repeats = state
            .history
            .get(&tenant)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(sig, at)| {
                        *sig == context.signature && at.elapsed() < self.loop_window
                    })
                    .count()
            })
            .unwrap_or(0);
        if repeats >= PATTERN_LOOP_THRESHOLD {
            self.detections_total
                .with_label_values(&["pattern_loop"])
                .inc();
            return Err(LoopRejection {
                kind: LoopKind::PatternLoop,
                message: format!("pattern loop detected: signature repeated {repeats} times"),
                depth: context.depth,
            });
        }

        self.depth_hist
            .with_label_values(&[&tenant])
            .observe(f64::from(context.depth));

        state
            .history
            .entry(tenant.clone())
            .or_default()
            .push((context.signature.clone(), Instant::now()));
        state
            .active
            .insert(context.request_id.clone(), context);

        let active_for_tenant = state
            .active
            .values()
            .filter(|c| c.signature.tenant_id == tenant)
            .count();
        self.active_gauge
            .with_label_values(&[&tenant])
            .set(active_for_tenant as f64);
        Ok(())
    }

    /// Stop tracking a request. Returns its context when it was active.
    pub fn end_request(&self, request_id: &str) -> Option<RequestContext> {
        let mut state = self.state.lock();
        let context = state.active.remove(request_id)?;
        let tenant = context.signature.tenant_id.clone();
        let active_for_tenant = state
            .active
            .values()
            .filter(|c| c.signature.tenant_id == tenant)
            .count();
        self.active_gauge
            .with_label_values(&[&tenant])
            .set(active_for_tenant as f64);
        Some(context)
    }

    /// Evict history entries older than twice the loop window.
    pub fn cleanup_old_history(&self) {
        let cutoff = self.loop_window * 2;
        let mut state = self.state.lock();
        state.history.retain(|_, entries| {
            entries.retain(|(_, at)| at.elapsed() < cutoff);
            !entries.is_empty()
        });
    }

    /// Number of active in-flight requests.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn context(id: &str, content: &str, depth: u32) -> RequestContext {
        RequestContext {
            request_id: id.to_string(),
            signature: RequestSignature::new(content, "/infer", "POST", "tenant-a", Some("u1")),
            started_at: Instant::now(),
            parent_request_id: None,
            depth,
            source_ip: None,
        }
    }

    #[test]
    fn test_depth_limit() {
        let detector = LoopDetector::default();
        let err = detector.start_request(context("r1", "p", 11)).unwrap_err();
        assert_eq!(err.kind, LoopKind::DepthExceeded);
        // At exactly max depth the request is admitted.
        assert!(detector.start_request(context("r2", "p", 10)).is_ok());
    }

    #[test]
    fn test_immediate_loop_exactly_one_admitted() {
        let detector = LoopDetector::default();
        assert!(detector.start_request(context("r1", "same", 0)).is_ok());

        let err = detector.start_request(context("r2", "same", 0)).unwrap_err();
        assert_eq!(err.kind, LoopKind::ImmediateLoop);

        // After the first completes, the signature is admitted again.
        assert!(detector.end_request("r1").is_some());
        assert!(detector.start_request(context("r3", "same", 0)).is_ok());
    }

    #[test]
    fn test_different_signatures_run_concurrently() {
        let detector = LoopDetector::default();
        assert!(detector.start_request(context("r1", "alpha", 0)).is_ok());
        assert!(detector.start_request(context("r2", "beta", 0)).is_ok());
        assert_eq!(detector.active_count(), 2);
    }

    #[test]
    fn test_pattern_loop_after_five_completions() {
        let detector = LoopDetector::default();
        for i in 0..5 {
            let id = format!("r{i}");
            detector.start_request(context(&id, "repeat", 0)).unwrap();
            detector.end_request(&id);
        }
        let err = detector.start_request(context("r5", "repeat", 0)).unwrap_err();
        assert_eq!(err.kind, LoopKind::PatternLoop);
    }

    #[test]
    fn test_end_unknown_request_is_noop() {
        let detector = LoopDetector::default();
        assert!(detector.end_request("ghost").is_none());
    }

    #[test]
    fn test_cleanup_drops_old_history() {
        let detector = LoopDetector::new(10, Duration::from_millis(1));
        detector.start_request(context("r1", "p", 0)).unwrap();
        detector.end_request("r1");
        std::thread::sleep(Duration::from_millis(5));
        detector.cleanup_old_history();
        // Window elapsed; the signature is fresh again.
        for i in 0..4 {
            let id = format!("x{i}");
            detector.start_request(context(&id, "p", 0)).unwrap();
            detector.end_request(&id);
        }
    }

    #[test]
    fn test_signature_equality_includes_user() {
        let a = RequestSignature::new("c", "/e", "POST", "t", Some("u1"));
        let b = RequestSignature::new("c", "/e", "POST", "t", Some("u2"));
        let c = RequestSignature::new("c", "/e", "POST", "t", Some("u1"));
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
