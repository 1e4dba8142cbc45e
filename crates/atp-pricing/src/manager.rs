//! Pricing manager: fetchers, cost math, validation, trends, and refresh.

use crate::cache::{ModelPricing, PricingCache, PricingChange};
use crate::error::{PricingError, Result};
use async_trait::async_trait;
use atp_observability::metric_names::METRIC_PRICING_REFRESH_TOTAL;
use atp_observability::metrics;
use prometheus::Opts;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Retrieves current pricing for a single provider.
#[async_trait]
pub trait PricingFetcher: Send + Sync {
    /// Provider this fetcher covers.
    fn provider(&self) -> &str;

    /// Fetch current pricing for every model the provider serves.
    async fn fetch(&self) -> Result<HashMap<String, ModelPricing>>;
}

/// Best-effort subscriber to pricing changes.
///
/// Sink failures are logged and ignored; a sink can never fail the write
/// path.
pub trait PricingAlertSink: Send + Sync {
    /// Called once per model whose pricing changed.
    fn on_changes(&self, provider: &str, model: &str, changes: &[PricingChange]);
}

/// Outcome of comparing an observed cost against the expected one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostValidation {
    pub expected_cost: f64,
    pub actual_cost: f64,
    /// Relative deviation, in percent of the expected cost.
    pub deviation_percent: f64,
    pub within_tolerance: bool,
}

/// Direction of recent price movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Rising,
    Falling,
    Stable,
}

/// Aggregate view of a model's price history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTrend {
    pub provider: String,
    pub model: String,
    pub direction: TrendDirection,
    /// Net relative change across the observed history, in percent.
    pub total_change_percent: f64,
    pub samples: usize,
}

/// A cheaper-alternative recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostOptimization {
    pub current_provider: String,
    pub current_model: String,
    pub suggested_provider: String,
    pub suggested_model: String,
    pub current_monthly_cost: f64,
    pub suggested_monthly_cost: f64,
    pub estimated_savings: f64,
}

/// Outcome of a full refresh pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshReport {
    pub refreshed_providers: Vec<String>,
    pub failed_providers: Vec<(String, String)>,
    pub models_updated: usize,
    pub changes_detected: usize,
}

/// Health snapshot of the pricing subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingHealth {
    pub cached_entries: usize,
    pub stale_entries: usize,
    pub registered_fetchers: usize,
    pub alert_sinks: usize,
}

/// Composes the cache with per-provider fetchers and alert sinks.
pub struct PricingManager {
    cache: Arc<PricingCache>,
    fetchers: HashMap<String, Arc<dyn PricingFetcher>>,
    sinks: Vec<Arc<dyn PricingAlertSink>>,
    /// Relative tolerance for cost validation (fraction, not percent).
    cost_tolerance: f64,
}

impl std::fmt::Debug for PricingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PricingManager")
            .field("fetchers", &self.fetchers.len())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Default for PricingManager {
    fn default() -> Self {
        Self::new(Arc::new(PricingCache::default()))
    }
}

impl PricingManager {
    /// Create a manager over an existing cache.
    #[must_use]
    pub fn new(cache: Arc<PricingCache>) -> Self {
        Self {
            cache,
            fetchers: HashMap::new(),
            sinks: Vec::new(),
            cost_tolerance: 0.10,
        }
    }

    /// Register a provider fetcher.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn PricingFetcher>) -> Self {
        self.fetchers
            .insert(fetcher.provider().to_string(), fetcher);
        self
    }

    /// Register a best-effort alert sink.
    #[must_use]
    pub fn with_alert_sink(mut self, sink: Arc<dyn PricingAlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Set the cost-validation tolerance (fraction of expected cost).
    #[must_use]
    pub fn with_cost_tolerance(mut self, tolerance: f64) -> Self {
        self.cost_tolerance = tolerance;
        self
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<PricingCache> {
        &self.cache
    }

    /// Current pricing for a model, refreshing from the provider's fetcher
    /// on a cache miss or when `force_refresh` is set.
    ///
    /// # Errors
    ///
    /// Returns an error when the provider is unknown, the fetch fails, or
    /// the provider does not price the model.
    pub async fn get_model_pricing(
        &self,
        provider: &str,
        model: &str,
        force_refresh: bool,
    ) -> Result<ModelPricing> {
        if !force_refresh {
            if let Some(pricing) = self.cache.get(provider, model) {
                return Ok(pricing);
            }
        }
        self.refresh_provider(provider).await?;
        self.cache
            .get(provider, model)
            .ok_or_else(|| PricingError::UnknownModel {
                provider: provider.to_string(),
                model: model.to_string(),
            })
    }

    /// All unexpired pricing, keyed by provider then model.
    #[must_use]
    pub fn get_all_pricing(&self) -> HashMap<String, HashMap<String, ModelPricing>> {
        self.cache.all()
    }

    /// Expected USD cost of a request.
    ///
    /// # Errors
    ///
    /// Propagates pricing-lookup errors.
    pub async fn calculate_request_cost(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<f64> {
        let pricing = self.get_model_pricing(provider, model, false).await?;
        Ok(pricing.calculate_cost(input_tokens, output_tokens))
    }

    /// Compare an observed cost against the expected one.
    ///
    /// # Errors
    ///
    /// Propagates pricing-lookup errors.
    pub async fn validate_actual_cost(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        actual_cost: f64,
    ) -> Result<CostValidation> {
        let expected = self
            .calculate_request_cost(provider, model, input_tokens, output_tokens)
            .await?;
        let deviation = if expected > 0.0 {
            ((actual_cost - expected) / expected).abs()
        } else if actual_cost > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        let validation = CostValidation {
            expected_cost: expected,
            actual_cost,
            deviation_percent: deviation * 100.0,
            within_tolerance: deviation <= self.cost_tolerance,
        };
        if !validation.within_tolerance {
            warn!(
                provider,
                model,
                expected,
                actual = actual_cost,
                "actual cost outside tolerance"
            );
        }
        Ok(validation)
    }

    /// Price-movement trend for a model from its change history.
    #[must_use]
    pub fn get_pricing_trends(&self, provider: &str, model: &str) -> PricingTrend {
        let history = self.cache.history(provider, model, 100);
        let total_change_percent: f64 = history
            .iter()
            .flat_map(|entry| entry.changes.iter())
            .map(|change| change.change_percent)
            .sum();
        let direction = if total_change_percent > 1.0 {
            TrendDirection::Rising
        } else if total_change_percent < -1.0 {
            TrendDirection::Falling
        } else {
            TrendDirection::Stable
        };
        PricingTrend {
            provider: provider.to_string(),
            model: model.to_string(),
            direction,
            total_change_percent,
            samples: history.len(),
        }
    }

    /// Find cheaper alternatives for the given usage profile.
    ///
    /// `current_usage` maps (provider, model) to monthly (input, output)
    /// token volumes. Every other cached model is considered as an
    /// alternative; recommendations are ranked by estimated savings.
    #[must_use]
    pub fn get_cost_optimization_recommendations(
        &self,
        current_usage: &HashMap<(String, String), (u64, u64)>,
    ) -> Vec<CostOptimization> {
        let all = self.cache.all();
        let mut recommendations = Vec::new();

        for ((provider, model), (input_tokens, output_tokens)) in current_usage {
            let Some(current_pricing) = all.get(provider).and_then(|m| m.get(model)) else {
                continue;
            };
            let current_cost = current_pricing.calculate_cost(*input_tokens, *output_tokens);

            let mut best: Option<CostOptimization> = None;
            for (alt_provider, models) in &all {
                for (alt_model, alt_pricing) in models {
                    if alt_provider == provider && alt_model == model {
                        continue;
                    }
                    let alt_cost = alt_pricing.calculate_cost(*input_tokens, *output_tokens);
                    if alt_cost >= current_cost {
                        continue;
                    }
                    let savings = current_cost - alt_cost;
                    if best.as_ref().map_or(true, |b| savings > b.estimated_savings) {
                        best = Some(CostOptimization {
                            current_provider: provider.clone(),
                            current_model: model.clone(),
                            suggested_provider: alt_provider.clone(),
                            suggested_model: alt_model.clone(),
                            current_monthly_cost: current_cost,
                            suggested_monthly_cost: alt_cost,
                            estimated_savings: savings,
                        });
                    }
                }
            }
            if let Some(recommendation) = best {
                recommendations.push(recommendation);
            }
        }

        recommendations.sort_by(|a, b| {
            b.estimated_savings
                .partial_cmp(&a.estimated_savings)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        recommendations
    }

    /// Refresh every registered provider.
    pub async fn refresh_all_pricing(&self) -> RefreshReport {
        let refresh_counter = metrics::counter_vec(
            Opts::new(
                METRIC_PRICING_REFRESH_TOTAL,
                "Total pricing refresh attempts",
            ),
            &["outcome"],
        );

        let mut report = RefreshReport {
            refreshed_providers: Vec::new(),
            failed_providers: Vec::new(),
            models_updated: 0,
            changes_detected: 0,
        };

        let providers: Vec<String> = self.fetchers.keys().cloned().collect();
        for provider in providers {
            match self.refresh_provider(&provider).await {
                Ok((models, changes)) => {
                    refresh_counter.with_label_values(&["ok"]).inc();
                    report.refreshed_providers.push(provider);
                    report.models_updated += models;
                    report.changes_detected += changes;
                }
                Err(e) => {
                    refresh_counter.with_label_values(&["error"]).inc();
                    report.failed_providers.push((provider, e.to_string()));
                }
            }
        }

        info!(
            refreshed = report.refreshed_providers.len(),
            failed = report.failed_providers.len(),
            models = report.models_updated,
            "pricing refresh complete"
        );
        report
    }

    /// Refresh loop for background use; runs until the task is dropped.
    pub async fn run_refresh_loop(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let _ = self.refresh_all_pricing().await;
        }
    }

    /// Health snapshot.
    #[must_use]
    pub fn health(&self) -> PricingHealth {
        PricingHealth {
            cached_entries: self.cache.len(),
            stale_entries: self.cache.stale_entries(Duration::from_secs(3600)).len(),
            registered_fetchers: self.fetchers.len(),
            alert_sinks: self.sinks.len(),
        }
    }

    async fn refresh_provider(&self, provider: &str) -> Result<(usize, usize)> {
        let fetcher = self
            .fetchers
            .get(provider)
            .ok_or_else(|| PricingError::UnknownProvider(provider.to_string()))?;

        let pricing_map = fetcher.fetch().await?;
        let mut models = 0;
        let mut total_changes = 0;
        for (model, pricing) in pricing_map {
            let changes = self.cache.set(provider, &model, pricing, None);
            models += 1;
            if !changes.is_empty() {
                total_changes += changes.len();
                for sink in &self.sinks {
                    sink.on_changes(provider, &model, &changes);
                }
            }
        }
        Ok((models, total_changes))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct StaticFetcher {
        provider: String,
        pricing: Mutex<HashMap<String, ModelPricing>>,
        fail: bool,
    }

    impl StaticFetcher {
        fn new(provider: &str, models: &[(&str, f64, f64)]) -> Self {
            Self {
                provider: provider.to_string(),
                pricing: Mutex::new(
                    models
                        .iter()
                        .map(|(m, i, o)| ((*m).to_string(), ModelPricing::per_1k(*i, *o)))
                        .collect(),
                ),
                fail: false,
            }
        }

        fn failing(provider: &str) -> Self {
            Self {
                provider: provider.to_string(),
                pricing: Mutex::new(HashMap::new()),
                fail: true,
            }
        }

        fn set_price(&self, model: &str, input: f64, output: f64) {
            self.pricing
                .lock()
                .insert(model.to_string(), ModelPricing::per_1k(input, output));
        }
    }

    #[async_trait]
    impl PricingFetcher for StaticFetcher {
        fn provider(&self) -> &str {
            &self.provider
        }

        async fn fetch(&self) -> Result<HashMap<String, ModelPricing>> {
            if self.fail {
                return Err(PricingError::FetchFailed {
                    provider: self.provider.clone(),
                    reason: "unavailable".to_string(),
                });
            }
            Ok(self.pricing.lock().clone())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(String, String, usize)>>,
    }

    impl PricingAlertSink for RecordingSink {
        fn on_changes(&self, provider: &str, model: &str, changes: &[PricingChange]) {
            self.seen
                .lock()
                .push((provider.to_string(), model.to_string(), changes.len()));
        }
    }

    #[tokio::test]
    async fn test_get_model_pricing_populates_cache() {
        let manager = PricingManager::default()
            .with_fetcher(Arc::new(StaticFetcher::new("vertex", &[("fast", 0.5, 1.5)])));

        let pricing = manager.get_model_pricing("vertex", "fast", false).await.unwrap();
        assert_eq!(pricing, ModelPricing::per_1k(0.5, 1.5));
        // Second call is served from cache.
        assert!(manager.cache().get("vertex", "fast").is_some());
    }

    #[tokio::test]
    async fn test_unknown_provider_and_model() {
        let manager = PricingManager::default()
            .with_fetcher(Arc::new(StaticFetcher::new("vertex", &[("fast", 0.5, 1.5)])));

        assert!(matches!(
            manager.get_model_pricing("ghost", "m", false).await,
            Err(PricingError::UnknownProvider(_))
        ));
        assert!(matches!(
            manager.get_model_pricing("vertex", "ghost", false).await,
            Err(PricingError::UnknownModel { .. })
        ));
    }

    #[tokio::test]
    async fn test_cost_validation_tolerance() {
        let manager = PricingManager::default()
            .with_fetcher(Arc::new(StaticFetcher::new("p", &[("m", 1.0, 1.0)])));

        // Expected: 2.0 for 1k in + 1k out.
        let ok = manager
            .validate_actual_cost("p", "m", 1000, 1000, 2.1)
            .await
            .unwrap();
        assert!(ok.within_tolerance);

        let bad = manager
            .validate_actual_cost("p", "m", 1000, 1000, 3.0)
            .await
            .unwrap();
        assert!(!bad.within_tolerance);
        assert!((bad.deviation_percent - 50.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_alert_sink_receives_changes() {
        let fetcher = Arc::new(StaticFetcher::new("p", &[("m", 1.0, 1.0)]));
        let sink = Arc::new(RecordingSink::default());
        let manager = PricingManager::default()
            .with_fetcher(Arc::clone(&fetcher) as Arc<dyn PricingFetcher>)
            .with_alert_sink(Arc::clone(&sink) as Arc<dyn PricingAlertSink>);

        manager.refresh_all_pricing().await;
        assert!(sink.seen.lock().is_empty());

        fetcher.set_price("m", 2.0, 1.0);
        let report = manager.refresh_all_pricing().await;
        assert_eq!(report.changes_detected, 1);
        assert_eq!(sink.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_report_partial_failure() {
        let manager = PricingManager::default()
            .with_fetcher(Arc::new(StaticFetcher::new("good", &[("m", 1.0, 1.0)])))
            .with_fetcher(Arc::new(StaticFetcher::failing("bad")));

        let report = manager.refresh_all_pricing().await;
        assert_eq!(report.refreshed_providers, vec!["good".to_string()]);
        assert_eq!(report.failed_providers.len(), 1);
        assert_eq!(report.failed_providers[0].0, "bad");
    }

    #[tokio::test]
    async fn test_cost_optimization_ranks_by_savings() {
        let manager = PricingManager::default();
        manager.cache().set("p1", "expensive", ModelPricing::per_1k(10.0, 10.0), None);
        manager.cache().set("p2", "cheap", ModelPricing::per_1k(1.0, 1.0), None);
        manager.cache().set("p3", "cheapest", ModelPricing::per_1k(0.1, 0.1), None);

        let mut usage = HashMap::new();
        usage.insert(
            ("p1".to_string(), "expensive".to_string()),
            (1_000_000u64, 1_000_000u64),
        );

        let recs = manager.get_cost_optimization_recommendations(&usage);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].suggested_model, "cheapest");
        assert!(recs[0].estimated_savings > 0.0);
    }

    #[tokio::test]
    async fn test_health_snapshot() {
        let manager = PricingManager::default()
            .with_fetcher(Arc::new(StaticFetcher::new("p", &[("m", 1.0, 1.0)])));
        manager.refresh_all_pricing().await;

        let health = manager.health();
        assert_eq!(health.cached_entries, 1);
        assert_eq!(health.registered_fetchers, 1);
    }
}
