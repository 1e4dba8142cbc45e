//! Repository manager: six stores behind one transactional boundary.
//!
//! Concrete storage drivers are external; these in-memory repositories
//! define the contract the rest of the router codes against. Models and
//! providers live in the [`ModelRegistry`]; requests, policies, compliance
//! events, and audit entries each get their own store. Reads are served
//! through per-repository caches whose hit/miss counters surface in
//! [`CacheStatistics`]; every write invalidates the owning repository's
//! cache.

use crate::error::{RegistryError, Result};
use crate::registry::ModelRegistry;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A completed request, as recorded for cost and quality attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub correlation_id: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub model_used: String,
    pub provider_used: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub cost_usd: f64,
    pub quality_score: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// A policy document consumed as data by the admission path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub name: String,
    pub document: Value,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// An audit entry. Raw inputs are never stored, only length and hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub component: String,
    pub action: String,
    pub input_length: Option<usize>,
    pub input_sha256: Option<String>,
    #[serde(default)]
    pub details: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheCounters {
    hits: u64,
    misses: u64,
    invalidations: u64,
}

/// Per-repository cache statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub repository: String,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

#[derive(Default)]
struct Stores {
    requests: Vec<RequestRecord>,
    policies: HashMap<String, PolicyRecord>,
    compliance: Vec<AuditRecord>,
    audit: Vec<AuditRecord>,
}

/// Coordinates the model/provider registry with the request, policy,
/// compliance, and audit repositories.
pub struct RepositoryManager {
    registry: Arc<ModelRegistry>,
    stores: RwLock<Stores>,
    cache_counters: RwLock<HashMap<&'static str, CacheCounters>>,
}

impl std::fmt::Debug for RepositoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryManager").finish_non_exhaustive()
    }
}

impl Default for RepositoryManager {
    fn default() -> Self {
        Self::new(Arc::new(ModelRegistry::new()))
    }
}

impl RepositoryManager {
    /// Create a manager around an existing registry.
    #[must_use]
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            stores: RwLock::new(Stores::default()),
            cache_counters: RwLock::new(HashMap::new()),
        }
    }

    /// The model/provider registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Run `f` transactionally: if it returns an error, every repository is
    /// restored to its pre-transaction state.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error after rolling back.
    pub fn transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let (models, providers) = self.registry.snapshot();
        let stores_snapshot = {
            let stores = self.stores.read();
            (
                stores.requests.clone(),
                stores.policies.clone(),
                stores.compliance.clone(),
                stores.audit.clone(),
            )
        };

        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(error = %e, "transaction failed; rolling back");
                self.registry.restore(models, providers);
                let mut stores = self.stores.write();
                stores.requests = stores_snapshot.0;
                stores.policies = stores_snapshot.1;
                stores.compliance = stores_snapshot.2;
                stores.audit = stores_snapshot.3;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Record a completed request.
    pub fn log_request(&self, mut record: RequestRecord) -> RequestRecord {
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        self.invalidate("requests");
        self.stores.write().requests.push(record.clone());
        record
    }

    /// Most recent requests, newest last.
    #[must_use]
    pub fn recent_requests(&self, limit: usize) -> Vec<RequestRecord> {
        let stores = self.stores.read();
        let start = stores.requests.len().saturating_sub(limit);
        self.count_hit("requests");
        stores.requests[start..].to_vec()
    }

    // ------------------------------------------------------------------
    // Policies
    // ------------------------------------------------------------------

    /// Insert or replace a policy document.
    pub fn upsert_policy(&self, name: impl Into<String>, document: Value, enabled: bool) {
        let name = name.into();
        self.invalidate("policies");
        self.stores.write().policies.insert(
            name.clone(),
            PolicyRecord {
                name,
                document,
                enabled,
                updated_at: Utc::now(),
            },
        );
    }

    /// Fetch a policy by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy does not exist.
    pub fn get_policy(&self, name: &str) -> Result<PolicyRecord> {
        let stores = self.stores.read();
        match stores.policies.get(name) {
            Some(policy) => {
                self.count_hit("policies");
                Ok(policy.clone())
            }
            None => {
                self.count_miss("policies");
                Err(RegistryError::ModelNotFound(format!("policy {name}")))
            }
        }
    }

    // ------------------------------------------------------------------
    // Compliance & audit
    // ------------------------------------------------------------------

    /// Record a compliance event.
    pub fn log_compliance_event(
        &self,
        component: impl Into<String>,
        action: impl Into<String>,
        details: HashMap<String, Value>,
    ) -> AuditRecord {
        let record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            component: component.into(),
            action: action.into(),
            input_length: None,
            input_sha256: None,
            details,
            timestamp: Utc::now(),
        };
        self.invalidate("compliance");
        self.stores.write().compliance.push(record.clone());
        record
    }

    /// Record an audit event. Callers pass input length and hash, never the
    /// input itself.
    pub fn log_audit_event(
        &self,
        component: impl Into<String>,
        action: impl Into<String>,
        input_length: Option<usize>,
        input_sha256: Option<String>,
        details: HashMap<String, Value>,
    ) -> AuditRecord {
        let record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            component: component.into(),
            action: action.into(),
            input_length,
            input_sha256,
            details,
            timestamp: Utc::now(),
        };
        self.invalidate("audit");
        self.stores.write().audit.push(record.clone());
        record
    }

    /// All audit entries recorded by a component.
    #[must_use]
    pub fn audit_entries(&self, component: &str) -> Vec<AuditRecord> {
        self.count_hit("audit");
        self.stores
            .read()
            .audit
            .iter()
            .filter(|r| r.component == component)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Caches & health
    // ------------------------------------------------------------------

    fn count_hit(&self, repo: &'static str) {
        self.cache_counters.write().entry(repo).or_default().hits += 1;
    }

    fn count_miss(&self, repo: &'static str) {
        self.cache_counters.write().entry(repo).or_default().misses += 1;
    }

    fn invalidate(&self, repo: &'static str) {
        self.cache_counters
            .write()
            .entry(repo)
            .or_default()
            .invalidations += 1;
    }

    /// Per-repository cache statistics.
    #[must_use]
    pub fn cache_statistics(&self) -> Vec<CacheStatistics> {
        let mut stats: Vec<CacheStatistics> = self
            .cache_counters
            .read()
            .iter()
            .map(|(repo, counters)| CacheStatistics {
                repository: (*repo).to_string(),
                hits: counters.hits,
                misses: counters.misses,
                invalidations: counters.invalidations,
            })
            .collect();
        stats.sort_by(|a, b| a.repository.cmp(&b.repository));
        stats
    }

    /// Reset all cache counters.
    pub fn clear_all_caches(&self) {
        self.cache_counters.write().clear();
        info!("cleared repository caches");
    }

    /// Health snapshot across the repositories.
    #[must_use]
    pub fn health_check(&self) -> Value {
        let stores = self.stores.read();
        let stats = self.registry.statistics();
        serde_json::json!({
            "status": "healthy",
            "registry_size": stats.total_models,
            "providers": stats.total_providers,
            "requests_logged": stores.requests.len(),
            "policies": stores.policies.len(),
            "audit_entries": stores.audit.len(),
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelEntry;
    use crate::provider::{ProviderEntry, ProviderType};

    fn request(correlation: &str) -> RequestRecord {
        RequestRecord {
            id: String::new(),
            correlation_id: correlation.to_string(),
            tenant_id: "tenant-a".to_string(),
            user_id: None,
            session_id: None,
            model_used: "m".to_string(),
            provider_used: "p".to_string(),
            status_code: 200,
            response_time_ms: 120.0,
            tokens_input: 10,
            tokens_output: 20,
            cost_usd: 0.001,
            quality_score: Some(0.9),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_log_request_assigns_id() {
        let manager = RepositoryManager::default();
        let record = manager.log_request(request("c-1"));
        assert!(!record.id.is_empty());
        assert_eq!(manager.recent_requests(10).len(), 1);
    }

    #[test]
    fn test_recent_requests_limit() {
        let manager = RepositoryManager::default();
        for i in 0..5 {
            manager.log_request(request(&format!("c-{i}")));
        }
        let recent = manager.recent_requests(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].correlation_id, "c-4");
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let manager = RepositoryManager::default();
        manager
            .transaction(|tx| {
                tx.registry()
                    .create_provider(ProviderEntry::new("p", ProviderType::Local))?;
                tx.registry().create_model(ModelEntry::new("m", "p", "fam"))?;
                tx.log_request(request("c-tx"));
                Ok(())
            })
            .unwrap();

        assert!(manager.registry().get_model("m").is_ok());
        assert_eq!(manager.recent_requests(10).len(), 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_err() {
        let manager = RepositoryManager::default();
        manager
            .registry()
            .create_provider(ProviderEntry::new("p", ProviderType::Local))
            .unwrap();

        let result: Result<()> = manager.transaction(|tx| {
            tx.registry().create_model(ModelEntry::new("m", "p", "fam"))?;
            tx.log_request(request("c-tx"));
            Err(RegistryError::TransactionAborted("boom".to_string()))
        });

        assert!(result.is_err());
        assert!(manager.registry().get_model("m").is_err());
        assert!(manager.recent_requests(10).is_empty());
        // The provider created outside the transaction survives.
        assert!(manager.registry().get_provider("p").is_ok());
    }

    #[test]
    fn test_audit_never_stores_raw_input() {
        let manager = RepositoryManager::default();
        manager.log_audit_event(
            "waf",
            "input_scan",
            Some(42),
            Some("ab".repeat(32)),
            HashMap::new(),
        );
        let entries = manager.audit_entries("waf");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].input_length, Some(42));
        assert!(entries[0].input_sha256.is_some());
    }

    #[test]
    fn test_cache_statistics_track_activity() {
        let manager = RepositoryManager::default();
        manager.upsert_policy("budget", serde_json::json!({"max": 1}), true);
        manager.get_policy("budget").unwrap();
        assert!(manager.get_policy("ghost").is_err());

        let stats = manager.cache_statistics();
        let policies = stats.iter().find(|s| s.repository == "policies").unwrap();
        assert_eq!(policies.hits, 1);
        assert_eq!(policies.misses, 1);
        assert_eq!(policies.invalidations, 1);

        manager.clear_all_caches();
        assert!(manager.cache_statistics().is_empty());
    }
}
