//! The top-level aggregate owning every governance module.
//!
//! Historically these lived as process-global singletons; here they are
//! explicitly constructed, wired together by [`RouterCoreBuilder`], and
//! owned by one [`RouterCore`] value whose lifetime bounds them all. Tests
//! construct as many independent cores as they like.

use crate::config::RouterConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::error_budget::ErrorBudgetEnforcer;
use crate::improvement::ContinuousImprovementPipeline;
use crate::orchestrator::SubRequestOrchestrator;
use crate::pipeline::AdmissionPipeline;
use crate::speculative::SpeculativeSampler;
use atp_adapter::AdapterService;
use atp_ledger::{DpLedger, DpLedgerConfig};
use atp_observability::cardinality::CardinalityAdvisor;
use atp_observability::events::EventBus;
use atp_pricing::{PricingCache, PricingManager};
use atp_registry::{ModelRegistry, RepositoryManager};
use atp_shield::{AbusePrevention, Waf};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Builder for [`RouterCore`].
pub struct RouterCoreBuilder {
    config: RouterConfig,
    adapters: HashMap<String, Arc<dyn AdapterService>>,
    registry: Option<Arc<ModelRegistry>>,
    bus: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for RouterCoreBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterCoreBuilder")
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

impl RouterCoreBuilder {
    /// Start from a configuration.
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            adapters: HashMap::new(),
            registry: None,
            bus: None,
        }
    }

    /// Register the adapter serving a model.
    #[must_use]
    pub fn with_adapter(mut self, model_name: &str, adapter: Arc<dyn AdapterService>) -> Self {
        self.adapters.insert(model_name.to_string(), adapter);
        self
    }

    /// Supply a pre-populated registry (test entry point).
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Supply an external event bus (test entry point).
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Wire everything together.
    ///
    /// # Errors
    ///
    /// Returns an error if the WAF rule files or ledger directory cannot
    /// be opened.
    pub fn build(self) -> Result<RouterCore> {
        let bus = self.bus.unwrap_or_else(|| Arc::new(EventBus::new()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ModelRegistry::new()));
        let repository = Arc::new(RepositoryManager::new(Arc::clone(&registry)));
        let waf = Arc::new(Waf::new(self.config.waf.clone())?);
        let abuse = Arc::new(AbusePrevention::new());
        let advisor = Arc::new(CardinalityAdvisor::new(self.config.cardinality.clone()));
        let pricing_cache = Arc::new(PricingCache::default());
        let pricing = PricingManager::new(Arc::clone(&pricing_cache));

        let ledger = match &self.config.ledger_dir {
            Some(dir) => Some(Arc::new(DpLedger::open(
                dir,
                DpLedgerConfig {
                    max_epsilon_per_tenant: self.config.epsilon_max_per_tenant,
                },
            )?)),
            None => None,
        };

        let sampler = match &self.config.speculative {
            Some(spec) => {
                let draft = self.adapters.get(&spec.draft_model).cloned();
                let target = self.adapters.get(&spec.target_model).cloned();
                match (draft, target) {
                    (Some(draft), Some(target)) => Some(SpeculativeSampler::new(
                        spec.clone(),
                        draft,
                        target,
                        Arc::clone(&bus),
                    )),
                    _ => {
                        info!("speculative sampling configured but adapters missing; disabled");
                        None
                    }
                }
            }
            None => None,
        };

        let pipeline = AdmissionPipeline::new(
            self.config.clone(),
            Arc::clone(&bus),
            Arc::clone(&waf),
            Arc::clone(&abuse),
            Arc::clone(&registry),
            Arc::clone(&repository),
            Arc::clone(&pricing_cache),
            ledger.clone(),
            sampler,
        );
        for (model_name, adapter) in &self.adapters {
            pipeline.register_adapter(model_name, Arc::clone(adapter));
        }

        let orchestrator = Arc::new(SubRequestOrchestrator::new());
        let mut dispatcher = Dispatcher::new(Arc::clone(&orchestrator), 8);
        for (model_name, adapter) in &self.adapters {
            dispatcher = dispatcher.with_adapter(model_name, Arc::clone(adapter));
        }

        Ok(RouterCore {
            improvement: ContinuousImprovementPipeline::new(Arc::clone(&registry)),
            error_budget: ErrorBudgetEnforcer::new(self.config.slos.clone()),
            config: self.config,
            bus,
            registry,
            repository,
            waf,
            abuse,
            advisor,
            pricing,
            ledger,
            pipeline,
            orchestrator,
            dispatcher,
        })
    }
}

/// The routing plane: one value owning every module's lifetime.
pub struct RouterCore {
    config: RouterConfig,
    bus: Arc<EventBus>,
    registry: Arc<ModelRegistry>,
    repository: Arc<RepositoryManager>,
    waf: Arc<Waf>,
    abuse: Arc<AbusePrevention>,
    advisor: Arc<CardinalityAdvisor>,
    pricing: PricingManager,
    ledger: Option<Arc<DpLedger>>,
    pipeline: AdmissionPipeline,
    orchestrator: Arc<SubRequestOrchestrator>,
    dispatcher: Dispatcher,
    improvement: ContinuousImprovementPipeline,
    error_budget: ErrorBudgetEnforcer,
}

impl std::fmt::Debug for RouterCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterCore").finish_non_exhaustive()
    }
}

impl RouterCore {
    /// Builder entry point.
    #[must_use]
    pub fn builder(config: RouterConfig) -> RouterCoreBuilder {
        RouterCoreBuilder::new(config)
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The event bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The model/provider registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// The repository manager.
    #[must_use]
    pub fn repository(&self) -> &Arc<RepositoryManager> {
        &self.repository
    }

    /// The WAF engine.
    #[must_use]
    pub fn waf(&self) -> &Arc<Waf> {
        &self.waf
    }

    /// The abuse-prevention engine.
    #[must_use]
    pub fn abuse(&self) -> &Arc<AbusePrevention> {
        &self.abuse
    }

    /// The cardinality advisor.
    #[must_use]
    pub fn cardinality_advisor(&self) -> &Arc<CardinalityAdvisor> {
        &self.advisor
    }

    /// The pricing manager. Its cache feeds cost-based model selection.
    #[must_use]
    pub fn pricing(&self) -> &PricingManager {
        &self.pricing
    }

    /// The DP ledger, when accounting is enabled.
    #[must_use]
    pub fn ledger(&self) -> Option<&Arc<DpLedger>> {
        self.ledger.as_ref()
    }

    /// The admission pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &AdmissionPipeline {
        &self.pipeline
    }

    /// The sub-request orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<SubRequestOrchestrator> {
        &self.orchestrator
    }

    /// The sub-request dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The continuous-improvement pipeline.
    #[must_use]
    pub fn improvement(&self) -> &ContinuousImprovementPipeline {
        &self.improvement
    }

    /// The error-budget enforcer.
    #[must_use]
    pub fn error_budget(&self) -> &ErrorBudgetEnforcer {
        &self.error_budget
    }

    /// Spawn the background maintenance loops (abuse-history cleanup).
    /// The loops stop when the returned handles are aborted or dropped
    /// with the runtime.
    pub fn spawn_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let abuse = Arc::clone(&self.abuse);
        vec![tokio::spawn(async move {
            abuse.run_cleanup_loop().await;
        })]
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use atp_adapter::MockAdapter;
    use atp_registry::{ModelCapabilities, ModelEntry, ProviderEntry, ProviderHealth, ProviderType};

    fn seeded_registry() -> Arc<ModelRegistry> {
        let registry = Arc::new(ModelRegistry::new());
        registry
            .create_provider(
                ProviderEntry::new("local", ProviderType::Local)
                    .with_health(ProviderHealth::Healthy),
            )
            .unwrap();
        registry
            .create_model(
                ModelEntry::new("fast-model", "local", "fast")
                    .with_capabilities(ModelCapabilities {
                        streaming: true,
                        ..Default::default()
                    })
                    .with_token_costs(0.000_001, 0.000_002),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_build_and_process() {
        let core = RouterCore::builder(RouterConfig::default())
            .with_registry(seeded_registry())
            .with_adapter(
                "fast-model",
                Arc::new(MockAdapter::new("fast-model").with_default_response("routed answer")),
            )
            .build()
            .unwrap();

        let response = core
            .pipeline()
            .process(crate::pipeline::InboundRequest::text("tenant-a", "hello"))
            .await
            .unwrap();
        assert_eq!(response.model_name, "fast-model");
        assert_eq!(response.text, "routed answer");
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_modules_are_instance_scoped() {
        let core_a = RouterCore::builder(RouterConfig::default())
            .with_registry(seeded_registry())
            .build()
            .unwrap();
        let core_b = RouterCore::builder(RouterConfig::default()).build().unwrap();

        // Registries are independent.
        assert_eq!(core_a.registry().statistics().total_models, 1);
        assert_eq!(core_b.registry().statistics().total_models, 0);

        core_a.abuse().reset_entity("tenant-a", None);
        assert_eq!(core_b.abuse().system_status().active_requests, 0);
    }
}
