// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Progressive per-key rate limiting.
//!
//! Keys are `(tenant, user, endpoint)` triples. Each key starts in the
//! `Normal` tier; repeated violations escalate it through `Elevated` and
//! `Restricted` to `Blocked`, which also hard-blocks the key for five
//! minutes.

use atp_observability::metric_names::METRIC_RATE_LIMIT_HITS_TOTAL;
use atp_observability::metrics;
use parking_lot::Mutex;
use prometheus::Opts;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::warn;

/// Hard-block duration once a key reaches the `Blocked` tier.
const BLOCK_DURATION: Duration = Duration::from_secs(300);

/// Rolling window width.
const WINDOW: Duration = Duration::from_secs(60);

/// Rate tiers, most to least permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateTier {
    Normal,
    Elevated,
    Restricted,
    Blocked,
}

impl RateTier {
    /// Requests allowed per minute in this tier.
    #[must_use]
    pub fn limit(self) -> usize {
        match self {
            RateTier::Normal => 1000,
            RateTier::Elevated => 500,
            RateTier::Restricted => 100,
            RateTier::Blocked => 10,
        }
    }

    /// Violations needed to escalate out of this tier.
    fn escalation_threshold(self) -> u32 {
        match self {
            RateTier::Normal => 5,
            RateTier::Elevated => 3,
            RateTier::Restricted => 2,
            RateTier::Blocked => u32::MAX,
        }
    }

    fn next(self) -> RateTier {
        match self {
            RateTier::Normal => RateTier::Elevated,
            RateTier::Elevated => RateTier::Restricted,
            RateTier::Restricted | RateTier::Blocked => RateTier::Blocked,
        }
    }
}

impl fmt::Display for RateTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RateTier::Normal => "normal",
            RateTier::Elevated => "elevated",
            RateTier::Restricted => "restricted",
            RateTier::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub tier: RateTier,
    pub reason: String,
    /// Seconds until the caller should retry, when refused.
    pub retry_after_s: u64,
}

#[derive(Default)]
struct KeyState {
    times: VecDeque<Instant>,
    violations: u32,
    tier: Option<RateTier>,
    blocked_until: Option<Instant>,
}

/// Sliding-window limiter with tier escalation.
pub struct ProgressiveRateLimiter {
    keys: Mutex<HashMap<String, KeyState>>,
    hits_total: prometheus::CounterVec,
}

impl std::fmt::Debug for ProgressiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressiveRateLimiter")
            .field("keys", &self.keys.lock().len())
            .finish()
    }
}

impl Default for ProgressiveRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn key_of(tenant_id: &str, user_id: Option<&str>, endpoint: &str) -> String {
    format!("{tenant_id}:{}:{endpoint}", user_id.unwrap_or("anonymous"))
}

impl ProgressiveRateLimiter {
    /// Create an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            hits_total: metrics::counter_vec(
                Opts::new(METRIC_RATE_LIMIT_HITS_TOTAL, "Total rate limit hits"),
                &["tier"],
            ),
        }
    }

    /// Check whether one more request is allowed for the key.
    pub fn is_allowed(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        endpoint: &str,
    ) -> RateDecision {
        let key = key_of(tenant_id, user_id, endpoint);
        let now = Instant::now();
        let mut keys = self.keys.lock();
        let state = keys.entry(key.clone()).or_default();

        if let Some(until) = state.blocked_until {
            if now < until {
                return RateDecision {
                    allowed: false,
                    tier: RateTier::Blocked,
                    reason: "temporarily_blocked".to_string(),
                    retry_after_s: (until - now).as_secs(),
                };
            }
            state.blocked_until = None;
        }

        let tier = state.tier.unwrap_or(RateTier::Normal);
        while let Some(front) = state.times.front() {
            if now.duration_since(*front) > WINDOW {
                state.times.pop_front();
            } else {
                break;
            }
        }

        if state.times.len() >= tier.limit() {
            state.violations += 1;
            self.hits_total
                .with_label_values(&[&tier.to_string()])
                .inc();

            if state.violations >= tier.escalation_threshold() {
                let next = tier.next();
                state.tier = Some(next);
                state.violations = 0;
                warn!(key, from = %tier, to = %next, "rate tier escalated");
                if next == RateTier::Blocked {
                    state.blocked_until = Some(now + BLOCK_DURATION);
                    return RateDecision {
                        allowed: false,
                        tier: next,
                        reason: "escalated_to_blocked".to_string(),
                        retry_after_s: BLOCK_DURATION.as_secs(),
                    };
                }
            }

            return RateDecision {
                allowed: false,
                tier: state.tier.unwrap_or(tier),
                reason: format!("rate_limit_exceeded_{tier}"),
                retry_after_s: WINDOW.as_secs(),
            };
        }

        state.times.push_back(now);
        RateDecision {
            allowed: true,
            tier,
            reason: "allowed".to_string(),
            retry_after_s: 0,
        }
    }

    /// Current violation count for a key.
    #[must_use]
    pub fn violations(&self, tenant_id: &str, user_id: Option<&str>, endpoint: &str) -> u32 {
        self.keys
            .lock()
            .get(&key_of(tenant_id, user_id, endpoint))
            .map_or(0, |s| s.violations)
    }

    /// Current tier for a key.
    #[must_use]
    pub fn tier(&self, tenant_id: &str, user_id: Option<&str>, endpoint: &str) -> RateTier {
        self.keys
            .lock()
            .get(&key_of(tenant_id, user_id, endpoint))
            .and_then(|s| s.tier)
            .unwrap_or(RateTier::Normal)
    }

    /// Return a key to the `Normal` tier and clear its violations.
    pub fn reset_violations(&self, tenant_id: &str, user_id: Option<&str>, endpoint: &str) {
        let mut keys = self.keys.lock();
        if let Some(state) = keys.get_mut(&key_of(tenant_id, user_id, endpoint)) {
            state.violations = 0;
            state.tier = Some(RateTier::Normal);
            state.blocked_until = None;
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    /// Fill the current window for the key's tier, then trip `violations`
    /// violations.
    fn saturate_and_violate(limiter: &ProgressiveRateLimiter, violations: usize) {
        let tier = limiter.tier("t", Some("u"), "/e");
        // The window already holds `limit` entries after the first pass;
        // keep pushing to trip violations.
        let mut remaining = violations;
        let mut admitted = 0;
        while remaining > 0 {
            let decision = limiter.is_allowed("t", Some("u"), "/e");
            if decision.allowed {
                admitted += 1;
                assert!(admitted <= tier.limit(), "window never fills");
            } else {
                remaining -= 1;
            }
        }
    }

    #[test]
    fn test_within_limit_allowed() {
        let limiter = ProgressiveRateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.is_allowed("t", Some("u"), "/e").allowed);
        }
        assert_eq!(limiter.violations("t", Some("u"), "/e"), 0);
    }

    #[test]
    fn test_violation_count_increments() {
        let limiter = ProgressiveRateLimiter::new();
        saturate_and_violate(&limiter, 1);
        assert_eq!(limiter.violations("t", Some("u"), "/e"), 1);
        saturate_and_violate(&limiter, 1);
        assert_eq!(limiter.violations("t", Some("u"), "/e"), 2);
    }

    #[test]
    fn test_escalation_normal_to_elevated() {
        let limiter = ProgressiveRateLimiter::new();
        saturate_and_violate(&limiter, 5);
        assert_eq!(limiter.tier("t", Some("u"), "/e"), RateTier::Elevated);
        // Violations reset on escalation.
        assert_eq!(limiter.violations("t", Some("u"), "/e"), 0);
    }

    #[test]
    fn test_full_escalation_to_blocked() {
        let limiter = ProgressiveRateLimiter::new();
        // normal -> elevated after 5, -> restricted after 3, -> blocked after 2.
        saturate_and_violate(&limiter, 5);
        assert_eq!(limiter.tier("t", Some("u"), "/e"), RateTier::Elevated);
        saturate_and_violate(&limiter, 3);
        assert_eq!(limiter.tier("t", Some("u"), "/e"), RateTier::Restricted);
        saturate_and_violate(&limiter, 2);
        assert_eq!(limiter.tier("t", Some("u"), "/e"), RateTier::Blocked);

        let decision = limiter.is_allowed("t", Some("u"), "/e");
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "temporarily_blocked");
        assert!(decision.retry_after_s <= 300 && decision.retry_after_s >= 295);
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = ProgressiveRateLimiter::new();
        saturate_and_violate(&limiter, 5);
        assert_eq!(limiter.tier("t", Some("u"), "/e"), RateTier::Elevated);
        assert_eq!(limiter.tier("t", Some("u2"), "/e"), RateTier::Normal);
        assert_eq!(limiter.tier("t", Some("u"), "/other"), RateTier::Normal);
    }

    #[test]
    fn test_reset_returns_to_normal() {
        let limiter = ProgressiveRateLimiter::new();
        saturate_and_violate(&limiter, 5);
        assert_eq!(limiter.tier("t", Some("u"), "/e"), RateTier::Elevated);

        limiter.reset_violations("t", Some("u"), "/e");
        assert_eq!(limiter.tier("t", Some("u"), "/e"), RateTier::Normal);
        assert_eq!(limiter.violations("t", Some("u"), "/e"), 0);
    }

    #[test]
    fn test_tier_limits() {
        assert_eq!(RateTier::Normal.limit(), 1000);
        assert_eq!(RateTier::Elevated.limit(), 500);
        assert_eq!(RateTier::Restricted.limit(), 100);
        assert_eq!(RateTier::Blocked.limit(), 10);
    }
}
