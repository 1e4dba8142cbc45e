//! Model catalog entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a model.
///
/// Only `Active` models receive production traffic. `Shadow` models may be
/// mirrored for comparison but never selected; `Retired` models are never
/// selectable at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Active,
    Shadow,
    Retired,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelStatus::Active => "active",
            ModelStatus::Shadow => "shadow",
            ModelStatus::Retired => "retired",
        };
        f.write_str(s)
    }
}

/// Capability flags used for request/model matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Supports server-streamed token output.
    pub streaming: bool,
    /// Supports function/tool calling.
    pub function_calling: bool,
    /// Accepts image inputs.
    pub vision: bool,
}

/// A model in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Unique name, the selection key.
    pub name: String,
    /// Human-friendly display name.
    pub display_name: String,
    /// Owning provider; exactly one per model.
    pub provider: String,
    /// Lifecycle status.
    pub status: ModelStatus,
    /// Disabled models are never selected regardless of status.
    pub enabled: bool,
    /// Model family, used for promotion policy.
    pub family: String,
    /// Context window in tokens.
    pub context_window: u32,
    /// Maximum output tokens.
    pub max_output_tokens: u32,
    /// Capability flags.
    pub capabilities: ModelCapabilities,
    /// USD per input token.
    pub cost_per_input_token: f64,
    /// USD per output token.
    pub cost_per_output_token: f64,
    /// Fixed USD per request.
    pub cost_per_request: f64,
    /// Median latency in milliseconds.
    pub latency_p50_ms: f64,
    /// 95th-percentile latency in milliseconds.
    pub latency_p95_ms: f64,
    /// Quality score in `[0, 1]`.
    pub quality_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelEntry {
    /// Create an active, enabled entry with zeroed metrics.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        family: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            display_name: name.clone(),
            name,
            provider: provider.into(),
            status: ModelStatus::Active,
            enabled: true,
            family: family.into(),
            context_window: 8192,
            max_output_tokens: 4096,
            capabilities: ModelCapabilities::default(),
            cost_per_input_token: 0.0,
            cost_per_output_token: 0.0,
            cost_per_request: 0.0,
            latency_p50_ms: 0.0,
            latency_p95_ms: 0.0,
            quality_score: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the lifecycle status.
    #[must_use]
    pub fn with_status(mut self, status: ModelStatus) -> Self {
        self.status = status;
        self
    }

    /// Set capability flags.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set per-token costs (input, output).
    #[must_use]
    pub fn with_token_costs(mut self, input: f64, output: f64) -> Self {
        self.cost_per_input_token = input;
        self.cost_per_output_token = output;
        self
    }

    /// Set latency percentiles (p50, p95) in milliseconds.
    #[must_use]
    pub fn with_latency(mut self, p50_ms: f64, p95_ms: f64) -> Self {
        self.latency_p50_ms = p50_ms;
        self.latency_p95_ms = p95_ms;
        self
    }

    /// Set the quality score.
    #[must_use]
    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = score;
        self
    }

    /// Set the context window and max output tokens.
    #[must_use]
    pub fn with_limits(mut self, context_window: u32, max_output_tokens: u32) -> Self {
        self.context_window = context_window;
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Disable the entry.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Expected USD cost of a request with the given token counts.
    #[must_use]
    pub fn expected_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        self.cost_per_request
            + input_tokens as f64 * self.cost_per_input_token
            + output_tokens as f64 * self.cost_per_output_token
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let model = ModelEntry::new("gpt-fast", "openai", "gpt");
        assert_eq!(model.status, ModelStatus::Active);
        assert!(model.enabled);
        assert_eq!(model.display_name, "gpt-fast");
    }

    #[test]
    fn test_expected_cost() {
        let model = ModelEntry::new("m", "p", "f").with_token_costs(0.001, 0.002);
        let cost = model.expected_cost(100, 50);
        assert!((cost - (0.1 + 0.1)).abs() < 1e-9);
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&ModelStatus::Shadow).unwrap(),
            "\"shadow\""
        );
        assert_eq!(ModelStatus::Retired.to_string(), "retired");
    }
}
