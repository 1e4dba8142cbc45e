//! The model/provider catalog and its lifecycle operations.

use crate::error::{RegistryError, Result};
use crate::model::{ModelEntry, ModelStatus};
use crate::provider::{ProviderEntry, ProviderHealth};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

/// Counts and aggregates over the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total_models: usize,
    pub active_models: usize,
    pub shadow_models: usize,
    pub retired_models: usize,
    pub total_providers: usize,
    pub healthy_providers: usize,
}

/// In-memory model/provider catalog.
///
/// All reads and writes go through an internal `RwLock`; promotion and
/// demotion are atomic transitions on a single model entry.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, ModelEntry>>,
    providers: RwLock<HashMap<String, ProviderEntry>>,
}

impl ModelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Providers
    // ------------------------------------------------------------------

    /// Register a provider.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider with the same name exists.
    pub fn create_provider(&self, provider: ProviderEntry) -> Result<()> {
        let mut providers = self.providers.write();
        if providers.contains_key(&provider.name) {
            return Err(RegistryError::ProviderAlreadyExists(provider.name));
        }
        info!(provider = provider.name, "registered provider");
        providers.insert(provider.name.clone(), provider);
        Ok(())
    }

    /// Fetch a provider by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider does not exist.
    pub fn get_provider(&self, name: &str) -> Result<ProviderEntry> {
        self.providers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound(name.to_string()))
    }

    /// Replace a provider entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider does not exist.
    pub fn update_provider(&self, provider: ProviderEntry) -> Result<()> {
        let mut providers = self.providers.write();
        if !providers.contains_key(&provider.name) {
            return Err(RegistryError::ProviderNotFound(provider.name));
        }
        providers.insert(provider.name.clone(), provider);
        Ok(())
    }

    /// Set a provider's health status.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider does not exist.
    pub fn set_provider_health(&self, name: &str, health: ProviderHealth) -> Result<()> {
        let mut providers = self.providers.write();
        let provider = providers
            .get_mut(name)
            .ok_or_else(|| RegistryError::ProviderNotFound(name.to_string()))?;
        provider.health = health;
        Ok(())
    }

    /// Remove a provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider does not exist.
    pub fn delete_provider(&self, name: &str) -> Result<ProviderEntry> {
        self.providers
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::ProviderNotFound(name.to_string()))
    }

    // ------------------------------------------------------------------
    // Models
    // ------------------------------------------------------------------

    /// Register a model. Its provider must already exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the provider is unknown.
    pub fn create_model(&self, model: ModelEntry) -> Result<()> {
        if !self.providers.read().contains_key(&model.provider) {
            return Err(RegistryError::UnknownProvider {
                model: model.name,
                provider: model.provider,
            });
        }
        let mut models = self.models.write();
        if models.contains_key(&model.name) {
            return Err(RegistryError::ModelAlreadyExists(model.name));
        }
        info!(model = model.name, provider = model.provider, "registered model");
        models.insert(model.name.clone(), model);
        Ok(())
    }

    /// Fetch a model by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the model does not exist.
    pub fn get_model(&self, name: &str) -> Result<ModelEntry> {
        self.models
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::ModelNotFound(name.to_string()))
    }

    /// Replace a model entry, refreshing its modification time.
    ///
    /// # Errors
    ///
    /// Returns an error if the model does not exist.
    pub fn update_model(&self, mut model: ModelEntry) -> Result<()> {
        let mut models = self.models.write();
        if !models.contains_key(&model.name) {
            return Err(RegistryError::ModelNotFound(model.name));
        }
        model.updated_at = Utc::now();
        models.insert(model.name.clone(), model);
        Ok(())
    }

    /// Remove a model.
    ///
    /// # Errors
    ///
    /// Returns an error if the model does not exist.
    pub fn delete_model(&self, name: &str) -> Result<ModelEntry> {
        self.models
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::ModelNotFound(name.to_string()))
    }

    /// Models eligible for production selection: active, enabled, on an
    /// enabled provider whose health allows traffic.
    #[must_use]
    pub fn get_enabled_models(&self) -> Vec<ModelEntry> {
        let providers = self.providers.read();
        self.models
            .read()
            .values()
            .filter(|m| m.status == ModelStatus::Active && m.enabled)
            .filter(|m| {
                providers
                    .get(&m.provider)
                    .is_some_and(|p| p.enabled && p.health.is_selectable())
            })
            .cloned()
            .collect()
    }

    /// All shadow models (regardless of provider health).
    #[must_use]
    pub fn get_shadow_models(&self) -> Vec<ModelEntry> {
        self.models
            .read()
            .values()
            .filter(|m| m.status == ModelStatus::Shadow)
            .cloned()
            .collect()
    }

    /// Update a model's observed performance metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if the model does not exist.
    pub fn update_performance_metrics(
        &self,
        name: &str,
        quality_score: Option<f64>,
        latency_p50_ms: Option<f64>,
        latency_p95_ms: Option<f64>,
    ) -> Result<()> {
        let mut models = self.models.write();
        let model = models
            .get_mut(name)
            .ok_or_else(|| RegistryError::ModelNotFound(name.to_string()))?;
        if let Some(q) = quality_score {
            model.quality_score = q;
        }
        if let Some(p50) = latency_p50_ms {
            model.latency_p50_ms = p50;
        }
        if let Some(p95) = latency_p95_ms {
            model.latency_p95_ms = p95;
        }
        model.updated_at = Utc::now();
        Ok(())
    }

    /// Promote a shadow model to active.
    ///
    /// # Errors
    ///
    /// Returns an error if the model does not exist or is not a shadow.
    pub fn promote_shadow(&self, name: &str) -> Result<()> {
        self.transition(name, ModelStatus::Shadow, ModelStatus::Active)
    }

    /// Demote an active model to shadow.
    ///
    /// # Errors
    ///
    /// Returns an error if the model does not exist or is not active.
    pub fn demote_to_shadow(&self, name: &str) -> Result<()> {
        self.transition(name, ModelStatus::Active, ModelStatus::Shadow)
    }

    /// Retire a model permanently.
    ///
    /// # Errors
    ///
    /// Returns an error if the model does not exist.
    pub fn retire_model(&self, name: &str) -> Result<()> {
        let mut models = self.models.write();
        let model = models
            .get_mut(name)
            .ok_or_else(|| RegistryError::ModelNotFound(name.to_string()))?;
        model.status = ModelStatus::Retired;
        model.updated_at = Utc::now();
        info!(model = name, "retired model");
        Ok(())
    }

    fn transition(&self, name: &str, from: ModelStatus, to: ModelStatus) -> Result<()> {
        let mut models = self.models.write();
        let model = models
            .get_mut(name)
            .ok_or_else(|| RegistryError::ModelNotFound(name.to_string()))?;
        if model.status != from {
            return Err(RegistryError::InvalidTransition {
                model: name.to_string(),
                from: model.status.to_string(),
                to: to.to_string(),
            });
        }
        model.status = to;
        model.updated_at = Utc::now();
        info!(model = name, from = %from, to = %to, "model lifecycle transition");
        Ok(())
    }

    /// Catalog counts.
    #[must_use]
    pub fn statistics(&self) -> RegistryStatistics {
        let models = self.models.read();
        let providers = self.providers.read();
        RegistryStatistics {
            total_models: models.len(),
            active_models: models
                .values()
                .filter(|m| m.status == ModelStatus::Active)
                .count(),
            shadow_models: models
                .values()
                .filter(|m| m.status == ModelStatus::Shadow)
                .count(),
            retired_models: models
                .values()
                .filter(|m| m.status == ModelStatus::Retired)
                .count(),
            total_providers: providers.len(),
            healthy_providers: providers
                .values()
                .filter(|p| p.health == ProviderHealth::Healthy)
                .count(),
        }
    }

    /// Flattened `name -> attribute map` view for callers that do not need
    /// rich query.
    #[must_use]
    pub fn registry_view(&self) -> HashMap<String, HashMap<String, Value>> {
        self.models
            .read()
            .values()
            .map(|m| {
                let mut attrs = HashMap::new();
                attrs.insert("provider".to_string(), Value::from(m.provider.clone()));
                attrs.insert("status".to_string(), Value::from(m.status.to_string()));
                attrs.insert("enabled".to_string(), Value::from(m.enabled));
                attrs.insert("family".to_string(), Value::from(m.family.clone()));
                attrs.insert("quality_score".to_string(), Value::from(m.quality_score));
                attrs.insert("latency_p95_ms".to_string(), Value::from(m.latency_p95_ms));
                (m.name.clone(), attrs)
            })
            .collect()
    }

    pub(crate) fn snapshot(&self) -> (HashMap<String, ModelEntry>, HashMap<String, ProviderEntry>) {
        (self.models.read().clone(), self.providers.read().clone())
    }

    pub(crate) fn restore(
        &self,
        models: HashMap<String, ModelEntry>,
        providers: HashMap<String, ProviderEntry>,
    ) {
        *self.models.write() = models;
        *self.providers.write() = providers;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelCapabilities;
    use crate::provider::ProviderType;

    fn registry_with_provider(health: ProviderHealth) -> ModelRegistry {
        let registry = ModelRegistry::new();
        registry
            .create_provider(ProviderEntry::new("prov", ProviderType::Cloud).with_health(health))
            .unwrap();
        registry
    }

    #[test]
    fn test_model_requires_known_provider() {
        let registry = ModelRegistry::new();
        let err = registry
            .create_model(ModelEntry::new("m", "ghost", "fam"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownProvider { .. }));
    }

    #[test]
    fn test_enabled_models_exclude_shadow_and_retired() {
        let registry = registry_with_provider(ProviderHealth::Healthy);
        registry
            .create_model(ModelEntry::new("active", "prov", "fam"))
            .unwrap();
        registry
            .create_model(ModelEntry::new("shadow", "prov", "fam").with_status(ModelStatus::Shadow))
            .unwrap();
        registry
            .create_model(
                ModelEntry::new("retired", "prov", "fam").with_status(ModelStatus::Retired),
            )
            .unwrap();

        let enabled = registry.get_enabled_models();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "active");
        assert_eq!(registry.get_shadow_models().len(), 1);
    }

    #[test]
    fn test_unhealthy_provider_blocks_selection() {
        let registry = registry_with_provider(ProviderHealth::Unhealthy);
        registry
            .create_model(ModelEntry::new("m", "prov", "fam"))
            .unwrap();
        assert!(registry.get_enabled_models().is_empty());

        registry
            .set_provider_health("prov", ProviderHealth::Healthy)
            .unwrap();
        assert_eq!(registry.get_enabled_models().len(), 1);
    }

    #[test]
    fn test_promote_and_demote_are_exclusive() {
        let registry = registry_with_provider(ProviderHealth::Healthy);
        registry
            .create_model(ModelEntry::new("m", "prov", "fam").with_status(ModelStatus::Shadow))
            .unwrap();

        registry.promote_shadow("m").unwrap();
        assert_eq!(registry.get_model("m").unwrap().status, ModelStatus::Active);

        // Promoting an already-active model is an invalid transition.
        let err = registry.promote_shadow("m").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        registry.demote_to_shadow("m").unwrap();
        assert_eq!(registry.get_model("m").unwrap().status, ModelStatus::Shadow);
    }

    #[test]
    fn test_performance_metrics_update() {
        let registry = registry_with_provider(ProviderHealth::Healthy);
        registry
            .create_model(ModelEntry::new("m", "prov", "fam"))
            .unwrap();

        registry
            .update_performance_metrics("m", Some(0.95), None, Some(150.0))
            .unwrap();
        let model = registry.get_model("m").unwrap();
        assert_eq!(model.quality_score, 0.95);
        assert_eq!(model.latency_p95_ms, 150.0);
        assert_eq!(model.latency_p50_ms, 0.0);
    }

    #[test]
    fn test_statistics_and_view() {
        let registry = registry_with_provider(ProviderHealth::Healthy);
        registry
            .create_model(
                ModelEntry::new("m1", "prov", "fam").with_capabilities(ModelCapabilities {
                    streaming: true,
                    ..Default::default()
                }),
            )
            .unwrap();
        registry
            .create_model(ModelEntry::new("m2", "prov", "fam").with_status(ModelStatus::Shadow))
            .unwrap();

        let stats = registry.statistics();
        assert_eq!(stats.total_models, 2);
        assert_eq!(stats.active_models, 1);
        assert_eq!(stats.shadow_models, 1);
        assert_eq!(stats.healthy_providers, 1);

        let view = registry.registry_view();
        assert_eq!(view["m2"]["status"], "shadow");
    }
}
