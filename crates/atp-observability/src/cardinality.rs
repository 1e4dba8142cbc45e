// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cardinality guardrail advisor.
//!
//! Label explosion is the classic way a metrics backend dies: a tenant id or
//! request id leaks into a label and the time-series count goes vertical.
//! The advisor tracks the set of observed label values per metric, raises a
//! violation when a threshold is crossed (subject to a per-metric alert
//! cooldown), and analyzes a bounded sample of the offending labels to
//! suggest concrete remediations.

use crate::metric_names::METRIC_CARDINALITY_VIOLATIONS_TOTAL;
use crate::metrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::Opts;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::warn;

/// Severity of a cardinality alert.
///
/// `Warning` fires at the warning threshold, `Critical` at the critical
/// threshold, `High` at 1.5x critical, and `Extreme` at 2x critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
    High,
    Extreme,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
            AlertSeverity::High => "high",
            AlertSeverity::Extreme => "extreme",
        };
        f.write_str(s)
    }
}

/// A recorded cardinality threshold violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardinalityViolation {
    /// The offending metric.
    pub metric_name: String,
    /// Number of unique label values observed.
    pub unique_labels: usize,
    /// The threshold that was crossed.
    pub threshold: usize,
    /// Alert severity at detection time.
    pub severity: AlertSeverity,
    /// Bounded sample of observed label values.
    pub sample_labels: Vec<String>,
    /// When the violation was raised.
    pub detected_at: DateTime<Utc>,
}

/// A remediation recommendation derived from a violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardinalityRecommendation {
    /// The offending metric.
    pub metric_name: String,
    /// Severity of the underlying violation.
    pub severity: AlertSeverity,
    /// Human-readable summary of the problem.
    pub message: String,
    /// Concrete label-optimization suggestions.
    pub suggestions: Vec<String>,
}

/// Advisor thresholds and sampling limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardinalityAdvisorConfig {
    /// Unique-label count that triggers a warning.
    pub warning_threshold: usize,
    /// Unique-label count that triggers a critical alert.
    pub critical_threshold: usize,
    /// Maximum sample labels carried on a violation.
    pub max_sample_labels: usize,
    /// Minimum seconds between alerts for the same metric.
    pub alert_cooldown_seconds: u64,
}

impl Default for CardinalityAdvisorConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 100,
            critical_threshold: 1000,
            max_sample_labels: 10,
            alert_cooldown_seconds: 3600,
        }
    }
}

struct MetricState {
    labels: HashSet<String>,
    last_alert: Option<Instant>,
}

impl MetricState {
    fn new() -> Self {
        Self {
            labels: HashSet::new(),
            last_alert: None,
        }
    }
}

struct AdvisorState {
    metrics: HashMap<String, MetricState>,
    violations: HashMap<String, CardinalityViolation>,
}

/// Tracks per-metric label cardinality and raises threshold alerts.
///
/// Safe to call from concurrent recording paths; all state is behind a
/// single mutex and each recording does O(1) work plus a set insert.
pub struct CardinalityAdvisor {
    config: CardinalityAdvisorConfig,
    state: Mutex<AdvisorState>,
    violations_total: prometheus::CounterVec,
}

impl Default for CardinalityAdvisor {
    fn default() -> Self {
        Self::new(CardinalityAdvisorConfig::default())
    }
}

impl fmt::Debug for CardinalityAdvisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardinalityAdvisor")
            .field("config", &self.config)
            .finish()
    }
}

impl CardinalityAdvisor {
    /// Create an advisor with the given thresholds.
    #[must_use]
    pub fn new(config: CardinalityAdvisorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AdvisorState {
                metrics: HashMap::new(),
                violations: HashMap::new(),
            }),
            violations_total: metrics::counter_vec(
                Opts::new(
                    METRIC_CARDINALITY_VIOLATIONS_TOTAL,
                    "Total cardinality violations raised",
                ),
                &["severity"],
            ),
        }
    }

    /// Record an observed label value for a metric and check thresholds.
    pub fn record_label_value(&self, metric_name: &str, label_value: &str) {
        let mut state = self.state.lock();
        let metric = state
            .metrics
            .entry(metric_name.to_string())
            .or_insert_with(MetricState::new);
        metric.labels.insert(label_value.to_string());

        let unique = metric.labels.len();
        let Some((severity, threshold)) = self.classify(unique) else {
            return;
        };

        let cooldown = Duration::from_secs(self.config.alert_cooldown_seconds);
        if let Some(last) = metric.last_alert {
            if last.elapsed() < cooldown {
                return;
            }
        }
        metric.last_alert = Some(Instant::now());

        let mut sample_labels: Vec<String> = metric
            .labels
            .iter()
            .take(self.config.max_sample_labels)
            .cloned()
            .collect();
        sample_labels.sort();

        let violation = CardinalityViolation {
            metric_name: metric_name.to_string(),
            unique_labels: unique,
            threshold,
            severity,
            sample_labels,
            detected_at: Utc::now(),
        };

        warn!(
            metric = metric_name,
            unique_labels = unique,
            threshold,
            severity = %severity,
            "cardinality threshold exceeded"
        );
        self.violations_total
            .with_label_values(&[&severity.to_string()])
            .inc();
        state
            .violations
            .insert(metric_name.to_string(), violation);
    }

    fn classify(&self, unique: usize) -> Option<(AlertSeverity, usize)> {
        let critical = self.config.critical_threshold;
        if unique >= critical * 2 {
            Some((AlertSeverity::Extreme, critical * 2))
        } else if unique >= critical * 3 / 2 {
            Some((AlertSeverity::High, critical * 3 / 2))
        } else if unique >= critical {
            Some((AlertSeverity::Critical, critical))
        } else if unique >= self.config.warning_threshold {
            Some((AlertSeverity::Warning, self.config.warning_threshold))
        } else {
            None
        }
    }

    /// Current unique-label count for a metric.
    #[must_use]
    pub fn cardinality(&self, metric_name: &str) -> usize {
        self.state
            .lock()
            .metrics
            .get(metric_name)
            .map_or(0, |m| m.labels.len())
    }

    /// All currently open violations.
    #[must_use]
    pub fn get_violations(&self) -> Vec<CardinalityViolation> {
        let mut violations: Vec<_> = self.state.lock().violations.values().cloned().collect();
        violations.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
        violations
    }

    /// Recommendations for all currently open violations.
    #[must_use]
    pub fn get_recommendations(&self) -> Vec<CardinalityRecommendation> {
        self.get_violations()
            .into_iter()
            .map(|v| self.recommend(&v))
            .collect()
    }

    fn recommend(&self, violation: &CardinalityViolation) -> CardinalityRecommendation {
        let message = match violation.severity {
            AlertSeverity::Extreme => format!(
                "Metric {} has {} unique labels, more than double the critical threshold; \
                 scrapes for this metric are at risk of being dropped",
                violation.metric_name, violation.unique_labels
            ),
            AlertSeverity::High => format!(
                "Metric {} has {} unique labels, well past the critical threshold; \
                 query performance will degrade",
                violation.metric_name, violation.unique_labels
            ),
            AlertSeverity::Critical => format!(
                "Metric {} has {} unique labels, exceeding the critical threshold of {}",
                violation.metric_name, violation.unique_labels, violation.threshold
            ),
            AlertSeverity::Warning => format!(
                "Metric {} has {} unique labels, exceeding the warning threshold of {}",
                violation.metric_name, violation.unique_labels, violation.threshold
            ),
        };

        CardinalityRecommendation {
            metric_name: violation.metric_name.clone(),
            severity: violation.severity,
            message,
            suggestions: suggest_optimizations(&violation.sample_labels),
        }
    }

    /// Clear the open violation for a metric, keeping its label set.
    pub fn clear_violation(&self, metric_name: &str) {
        self.state.lock().violations.remove(metric_name);
    }

    /// Drop all tracked state for a metric.
    pub fn reset_metric(&self, metric_name: &str) {
        let mut state = self.state.lock();
        state.metrics.remove(metric_name);
        state.violations.remove(metric_name);
    }
}

/// Analyze sample labels for structural patterns worth collapsing.
fn suggest_optimizations(samples: &[String]) -> Vec<String> {
    let mut suggestions = Vec::new();
    if samples.is_empty() {
        return suggestions;
    }

    let numeric = samples
        .iter()
        .filter(|s| s.chars().any(|c| c.is_ascii_digit()))
        .count();
    if numeric * 2 > samples.len() {
        suggestions.push(
            "Labels contain numeric ids; aggregate them into a bounded bucket label \
             (e.g. replace the id with its entity type)"
                .to_string(),
        );
    }

    let min_len = samples.iter().map(String::len).min().unwrap_or(0);
    let max_len = samples.iter().map(String::len).max().unwrap_or(0);
    if max_len > min_len.saturating_mul(3) && max_len > 16 {
        suggestions.push(
            "Label lengths vary widely; standardize to a fixed-length canonical form".to_string(),
        );
    }

    if let Some(prefix) = common_prefix(samples) {
        if prefix.len() >= 4 {
            suggestions.push(format!(
                "Labels share the prefix \"{prefix}\"; consolidate to the prefix and move the \
                 variable suffix out of the label"
            ));
        }
    }

    if samples.iter().any(|s| s.len() > 64) {
        suggestions.push(
            "Some labels exceed 64 characters; hash or truncate them before recording".to_string(),
        );
    }

    if suggestions.is_empty() {
        suggestions.push(
            "Review whether this label dimension is needed; consider dropping it or \
             capping it with an overflow bucket"
                .to_string(),
        );
    }
    suggestions
}

fn common_prefix(samples: &[String]) -> Option<String> {
    let first = samples.first()?;
    let mut len = first.len();
    for s in &samples[1..] {
        len = len.min(
            first
                .bytes()
                .zip(s.bytes())
                .take_while(|(a, b)| a == b)
                .count(),
        );
        if len == 0 {
            return None;
        }
    }
    first.get(..len).map(ToString::to_string)
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn advisor(warning: usize, critical: usize) -> CardinalityAdvisor {
        CardinalityAdvisor::new(CardinalityAdvisorConfig {
            warning_threshold: warning,
            critical_threshold: critical,
            max_sample_labels: 5,
            alert_cooldown_seconds: 0,
        })
    }

    #[test]
    fn test_no_violation_below_warning() {
        let advisor = advisor(10, 100);
        for i in 0..9 {
            advisor.record_label_value("atp_test_metric", &format!("label-{i}"));
        }
        assert!(advisor.get_violations().is_empty());
        assert_eq!(advisor.cardinality("atp_test_metric"), 9);
    }

    #[test]
    fn test_warning_then_critical_severity() {
        let advisor = advisor(10, 20);
        for i in 0..10 {
            advisor.record_label_value("m", &format!("v{i}"));
        }
        let violations = advisor.get_violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, AlertSeverity::Warning);

        for i in 10..20 {
            advisor.record_label_value("m", &format!("v{i}"));
        }
        assert_eq!(advisor.get_violations()[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_high_and_extreme_severity() {
        let advisor = advisor(10, 20);
        for i in 0..30 {
            advisor.record_label_value("m", &format!("v{i}"));
        }
        assert_eq!(advisor.get_violations()[0].severity, AlertSeverity::High);

        for i in 30..40 {
            advisor.record_label_value("m", &format!("v{i}"));
        }
        assert_eq!(advisor.get_violations()[0].severity, AlertSeverity::Extreme);
    }

    #[test]
    fn test_cooldown_suppresses_repeat_alerts() {
        let advisor = CardinalityAdvisor::new(CardinalityAdvisorConfig {
            warning_threshold: 2,
            critical_threshold: 1000,
            max_sample_labels: 5,
            alert_cooldown_seconds: 3600,
        });
        advisor.record_label_value("m", "a");
        advisor.record_label_value("m", "b");
        let first = advisor.get_violations()[0].clone();

        advisor.record_label_value("m", "c");
        // Still the original violation; the cooldown swallowed the update.
        assert_eq!(advisor.get_violations()[0].unique_labels, first.unique_labels);
    }

    #[test]
    fn test_sample_labels_bounded() {
        let advisor = advisor(3, 1000);
        for i in 0..10 {
            advisor.record_label_value("m", &format!("v{i}"));
        }
        assert!(advisor.get_violations()[0].sample_labels.len() <= 5);
    }

    #[test]
    fn test_recommendations_numeric_ids() {
        let advisor = advisor(3, 1000);
        for i in 0..5 {
            advisor.record_label_value("m", &format!("user-{i}"));
        }
        let recs = advisor.get_recommendations();
        assert_eq!(recs.len(), 1);
        assert!(recs[0].suggestions.iter().any(|s| s.contains("numeric ids")));
        assert!(recs[0]
            .suggestions
            .iter()
            .any(|s| s.contains("prefix \"user-\"")));
    }

    #[test]
    fn test_clear_violation_keeps_labels() {
        let advisor = advisor(2, 1000);
        advisor.record_label_value("m", "a");
        advisor.record_label_value("m", "b");
        assert_eq!(advisor.get_violations().len(), 1);

        advisor.clear_violation("m");
        assert!(advisor.get_violations().is_empty());
        assert_eq!(advisor.cardinality("m"), 2);
    }

    #[test]
    fn test_reset_metric_then_single_recording() {
        let advisor = advisor(2, 1000);
        advisor.record_label_value("m", "a");
        advisor.record_label_value("m", "b");
        advisor.reset_metric("m");

        advisor.record_label_value("m", "a");
        assert_eq!(advisor.cardinality("m"), 1);
        assert!(advisor.get_violations().is_empty());
    }
}
