//! SLO definitions, rolling error-budget state, and gate decisions.

use crate::config::{default_slos, SloConfig};
use atp_observability::metric_names::METRIC_SLO_VIOLATIONS_TOTAL;
use atp_observability::metrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::Opts;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// Rolling measurement state for one SLO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBudgetState {
    pub slo_name: String,
    pub total_requests: u64,
    pub error_requests: u64,
    pub window_start: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ErrorBudgetState {
    fn new(slo_name: &str) -> Self {
        let now = Utc::now();
        Self {
            slo_name: slo_name.to_string(),
            total_requests: 0,
            error_requests: 0,
            window_start: now,
            last_updated: now,
        }
    }

    /// Error rate in percent over the window.
    #[must_use]
    pub fn error_rate_percentage(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.error_requests as f64 / self.total_requests as f64 * 100.0
    }

    /// Availability in percent over the window.
    #[must_use]
    pub fn availability_percentage(&self) -> f64 {
        100.0 - self.error_rate_percentage()
    }

    /// Remaining error budget in percent.
    ///
    /// `budget x (1 - max(0, (actual - allowed) / allowed))` where rates
    /// are error percentages.
    #[must_use]
    pub fn error_budget_remaining(&self, slo: &SloConfig) -> f64 {
        let allowed_error_rate = 100.0 - slo.target_percentage;
        if allowed_error_rate <= 0.0 {
            return 0.0;
        }
        let actual_error_rate = self.error_rate_percentage();
        let consumed_fraction =
            ((actual_error_rate - allowed_error_rate) / allowed_error_rate).max(0.0);
        slo.error_budget_percentage * (1.0 - consumed_fraction)
    }
}

/// A detected SLO violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloViolation {
    pub slo_name: String,
    pub current_availability: f64,
    pub target_percentage: f64,
    pub budget_remaining: f64,
    pub detected_at: DateTime<Utc>,
}

/// Outcome of a gate check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    /// True iff no SLO is in violation.
    pub passed: bool,
    pub violations: Vec<SloViolation>,
    pub summary: String,
    /// 0 on pass, 1 on violation, for operational tooling.
    pub exit_code: i32,
}

/// Tracks SLO state and decides budget gates.
///
/// The enforcer never blocks requests itself; pipelines consult it.
pub struct ErrorBudgetEnforcer {
    slos: HashMap<String, SloConfig>,
    states: Mutex<HashMap<String, ErrorBudgetState>>,
    violations_total: prometheus::CounterVec,
}

impl std::fmt::Debug for ErrorBudgetEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorBudgetEnforcer")
            .field("slos", &self.slos.len())
            .finish()
    }
}

impl Default for ErrorBudgetEnforcer {
    fn default() -> Self {
        Self::new(default_slos())
    }
}

#[derive(Serialize, Deserialize)]
struct SloConfigFile {
    slos: Vec<SloConfig>,
}

impl ErrorBudgetEnforcer {
    /// Create an enforcer over an SLO set.
    #[must_use]
    pub fn new(slos: Vec<SloConfig>) -> Self {
        let states = slos
            .iter()
            .map(|slo| (slo.name.clone(), ErrorBudgetState::new(&slo.name)))
            .collect();
        Self {
            slos: slos.into_iter().map(|s| (s.name.clone(), s)).collect(),
            states: Mutex::new(states),
            violations_total: metrics::counter_vec(
                Opts::new(METRIC_SLO_VIOLATIONS_TOTAL, "Total SLO violations observed"),
                &["slo"],
            ),
        }
    }

    /// Load the SLO set from a JSON config file, falling back to the stock
    /// set (and writing it) when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed,
    /// or the default set cannot be written.
    pub fn from_config_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let parsed: SloConfigFile = serde_json::from_str(&contents)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            Ok(Self::new(parsed.slos))
        } else {
            let enforcer = Self::default();
            enforcer.save_config(path)?;
            Ok(enforcer)
        }
    }

    /// Persist the current SLO set as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_config(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let mut slos: Vec<SloConfig> = self.slos.values().cloned().collect();
        slos.sort_by(|a, b| a.name.cmp(&b.name));
        let file = SloConfigFile { slos };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Feed a measurement batch into an SLO's rolling state.
    pub fn record_measurement(&self, slo_name: &str, total_requests: u64, error_requests: u64) {
        let mut states = self.states.lock();
        let state = states
            .entry(slo_name.to_string())
            .or_insert_with(|| ErrorBudgetState::new(slo_name));
        state.total_requests += total_requests;
        state.error_requests += error_requests;
        state.last_updated = Utc::now();
    }

    /// Current rolling state for an SLO.
    #[must_use]
    pub fn state(&self, slo_name: &str) -> Option<ErrorBudgetState> {
        self.states.lock().get(slo_name).cloned()
    }

    /// All SLOs currently below target.
    #[must_use]
    pub fn check_all_slos(&self) -> Vec<SloViolation> {
        let states = self.states.lock();
        let mut violations = Vec::new();
        for (name, slo) in &self.slos {
            let Some(state) = states.get(name) else {
                continue;
            };
            if state.total_requests == 0 {
                continue;
            }
            let availability = state.availability_percentage();
            if availability < slo.target_percentage {
                self.violations_total.with_label_values(&[name]).inc();
                violations.push(SloViolation {
                    slo_name: name.clone(),
                    current_availability: availability,
                    target_percentage: slo.target_percentage,
                    budget_remaining: state.error_budget_remaining(slo),
                    detected_at: Utc::now(),
                });
            }
        }
        violations.sort_by(|a, b| a.slo_name.cmp(&b.slo_name));
        violations
    }

    /// Gate decision: passes iff no SLO is in violation.
    #[must_use]
    pub fn enforce_budget_gates(&self) -> GateDecision {
        let violations = self.check_all_slos();
        let passed = violations.is_empty();
        let summary = if passed {
            "all SLOs within target".to_string()
        } else {
            let names: Vec<&str> = violations.iter().map(|v| v.slo_name.as_str()).collect();
            format!("{} SLO(s) in violation: {}", violations.len(), names.join(", "))
        };
        if !passed {
            warn!(summary, "error budget gate failed");
        }
        GateDecision {
            passed,
            exit_code: i32::from(!passed),
            violations,
            summary,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn availability_slo() -> Vec<SloConfig> {
        vec![SloConfig {
            name: "availability".to_string(),
            target_percentage: 99.9,
            window_days: 30,
            error_budget_percentage: 0.1,
        }]
    }

    #[test]
    fn test_healthy_slo_passes_gate() {
        let enforcer = ErrorBudgetEnforcer::new(availability_slo());
        enforcer.record_measurement("availability", 10_000, 5);

        let state = enforcer.state("availability").unwrap();
        assert!((state.availability_percentage() - 99.95).abs() < 1e-9);

        let decision = enforcer.enforce_budget_gates();
        assert!(decision.passed);
        assert_eq!(decision.exit_code, 0);
        assert!(decision.violations.is_empty());
    }

    #[test]
    fn test_violation_fails_gate_with_exit_code() {
        let enforcer = ErrorBudgetEnforcer::new(availability_slo());
        enforcer.record_measurement("availability", 1000, 5);

        let decision = enforcer.enforce_budget_gates();
        assert!(!decision.passed);
        assert_eq!(decision.exit_code, 1);
        assert_eq!(decision.violations.len(), 1);
        assert!((decision.violations[0].current_availability - 99.5).abs() < 1e-9);
    }

    #[test]
    fn test_budget_remaining_formula() {
        let slo = availability_slo().remove(0);
        let mut state = ErrorBudgetState::new("availability");

        // Exactly at the allowed rate: full budget remains.
        state.total_requests = 10_000;
        state.error_requests = 10;
        assert!((state.error_budget_remaining(&slo) - 0.1).abs() < 1e-9);

        // Double the allowed rate: budget fully consumed.
        state.error_requests = 20;
        assert!(state.error_budget_remaining(&slo).abs() < 1e-9);

        // Half the allowed rate: untouched.
        state.error_requests = 5;
        assert!((state.error_budget_remaining(&slo) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_no_measurements_no_violation() {
        let enforcer = ErrorBudgetEnforcer::new(availability_slo());
        assert!(enforcer.check_all_slos().is_empty());
        assert!(enforcer.enforce_budget_gates().passed);
    }

    #[test]
    fn test_measurements_accumulate() {
        let enforcer = ErrorBudgetEnforcer::new(availability_slo());
        enforcer.record_measurement("availability", 500, 0);
        enforcer.record_measurement("availability", 500, 1);

        let state = enforcer.state("availability").unwrap();
        assert_eq!(state.total_requests, 1000);
        assert_eq!(state.error_requests, 1);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("slos.json");

        // First load writes the defaults.
        let first = ErrorBudgetEnforcer::from_config_file(&path).unwrap();
        assert!(path.exists());
        assert_eq!(first.slos.len(), 3);

        // Second load reads them back.
        let second = ErrorBudgetEnforcer::from_config_file(&path).unwrap();
        assert_eq!(second.slos.len(), 3);
        assert!(second.slos.contains_key("availability"));
    }
}
