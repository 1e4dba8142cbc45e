//! Router configuration surface.

use atp_observability::cardinality::CardinalityAdvisorConfig;
use atp_shield::WafConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Speculative-sampler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculativeConfig {
    pub draft_model: String,
    pub target_model: String,
    /// Minimum confidence for accepting the draft response.
    pub acceptance_threshold: f64,
    /// Expected draft-model latency in milliseconds.
    pub draft_latency_ms: f64,
    /// Expected target-model latency in milliseconds.
    pub target_latency_ms: f64,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            draft_model: "draft-model-v1".to_string(),
            target_model: "target-model-v1".to_string(),
            acceptance_threshold: 0.7,
            draft_latency_ms: 10.0,
            target_latency_ms: 40.0,
        }
    }
}

/// One SLO definition consumed by the error-budget enforcer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloConfig {
    pub name: String,
    /// Availability target in percent, e.g. 99.9.
    pub target_percentage: f64,
    /// Rolling window in days.
    pub window_days: u32,
    /// Error budget in percent, e.g. 0.1.
    pub error_budget_percentage: f64,
}

/// Top-level configuration for the routing plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Replay-guard TTL in seconds.
    pub nonce_ttl_s: f64,
    /// Replay-guard capacity.
    pub nonce_cap: usize,

    /// Loop-detector depth limit.
    pub max_depth: u32,
    /// Loop-detector pattern window in seconds.
    pub loop_window_s: u64,

    /// Per-tenant DP epsilon cap.
    pub epsilon_max_per_tenant: f64,
    /// Epsilon charged per streamed response.
    pub epsilon_per_request: f64,
    /// Directory of the DP ledger; `None` disables DP accounting.
    pub ledger_dir: Option<PathBuf>,

    /// Default per-request USD budget for the cost pre-check.
    pub default_tenant_budget_usd: f64,
    /// Per-tenant overrides of the cost budget.
    #[serde(default)]
    pub tenant_budgets_usd: HashMap<String, f64>,

    /// Overall request timeout in seconds.
    pub request_timeout_s: u64,

    /// Speculative sampling; `None` disables it.
    pub speculative: Option<SpeculativeConfig>,

    /// WAF settings.
    pub waf: WafConfig,
    /// Cardinality advisor thresholds.
    pub cardinality: CardinalityAdvisorConfig,

    /// SLO set for the error-budget enforcer.
    pub slos: Vec<SloConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            nonce_ttl_s: 60.0,
            nonce_cap: 10_000,
            max_depth: 10,
            loop_window_s: 300,
            epsilon_max_per_tenant: 2.0,
            epsilon_per_request: 0.01,
            ledger_dir: None,
            default_tenant_budget_usd: 1.0,
            tenant_budgets_usd: HashMap::new(),
            request_timeout_s: 120,
            speculative: None,
            waf: WafConfig::default(),
            cardinality: CardinalityAdvisorConfig::default(),
            slos: default_slos(),
        }
    }
}

impl RouterConfig {
    /// The cost budget for a tenant, falling back to the default.
    #[must_use]
    pub fn tenant_budget_usd(&self, tenant_id: &str) -> f64 {
        self.tenant_budgets_usd
            .get(tenant_id)
            .copied()
            .unwrap_or(self.default_tenant_budget_usd)
    }
}

/// The stock SLO set.
#[must_use]
pub fn default_slos() -> Vec<SloConfig> {
    vec![
        SloConfig {
            name: "availability".to_string(),
            target_percentage: 99.9,
            window_days: 30,
            error_budget_percentage: 0.1,
        },
        SloConfig {
            name: "latency_p95".to_string(),
            target_percentage: 99.0,
            window_days: 30,
            error_budget_percentage: 1.0,
        },
        SloConfig {
            name: "adapter_success".to_string(),
            target_percentage: 99.5,
            window_days: 7,
            error_budget_percentage: 0.5,
        },
    ]
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.nonce_cap, 10_000);
        assert_eq!(config.max_depth, 10);
        assert_eq!(config.epsilon_max_per_tenant, 2.0);
        assert!(config.speculative.is_none());
        assert_eq!(config.slos.len(), 3);
    }

    #[test]
    fn test_tenant_budget_override() {
        let mut config = RouterConfig::default();
        config
            .tenant_budgets_usd
            .insert("premium".to_string(), 50.0);
        assert_eq!(config.tenant_budget_usd("premium"), 50.0);
        assert_eq!(config.tenant_budget_usd("other"), 1.0);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = RouterConfig {
            speculative: Some(SpeculativeConfig::default()),
            ..RouterConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RouterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.slos, config.slos);
        assert_eq!(
            parsed.speculative.unwrap().acceptance_threshold,
            0.7
        );
    }
}
