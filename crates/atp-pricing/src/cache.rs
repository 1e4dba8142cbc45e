//! TTL pricing cache with change detection and bounded history.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Relative price delta that counts as a change (1%).
const CHANGE_THRESHOLD: f64 = 0.01;

/// Maximum history entries kept per (provider, model).
const HISTORY_CAP: usize = 100;

/// History entries live this many times longer than current pricing.
const HISTORY_TTL_FACTOR: u32 = 24;

/// Token pricing for one model, in USD per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
}

impl ModelPricing {
    /// Pricing from per-1K-token USD rates.
    #[must_use]
    pub fn per_1k(input: f64, output: f64) -> Self {
        Self {
            input_cost_per_1k: input,
            output_cost_per_1k: output,
        }
    }

    /// USD cost of a request with the given token counts.
    #[must_use]
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_cost_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_cost_per_1k
    }
}

/// A detected price change on one field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingChange {
    /// Which rate moved (`input_cost_per_1k` / `output_cost_per_1k`).
    pub field: String,
    pub previous: f64,
    pub current: f64,
    /// Signed relative change in percent.
    pub change_percent: f64,
    pub change_absolute: f64,
    pub detected_at: DateTime<Utc>,
}

/// One history record: the pricing that was set and the changes it caused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingHistoryEntry {
    pub pricing: ModelPricing,
    pub changes: Vec<PricingChange>,
    pub recorded_at: DateTime<Utc>,
}

struct CachedPricing {
    pricing: ModelPricing,
    stored_at: Instant,
    metadata: Option<serde_json::Value>,
}

struct HistorySlot {
    entries: VecDeque<PricingHistoryEntry>,
    stored_at: Instant,
}

/// (provider, model) -> pricing cache with TTL and change history.
pub struct PricingCache {
    ttl: Duration,
    entries: RwLock<HashMap<(String, String), CachedPricing>>,
    history: RwLock<HashMap<(String, String), HistorySlot>>,
}

impl std::fmt::Debug for PricingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PricingCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl Default for PricingCache {
    fn default() -> Self {
        Self::with_ttl_seconds(1800)
    }
}

impl PricingCache {
    /// Create a cache whose current-pricing entries expire after `ttl_seconds`.
    #[must_use]
    pub fn with_ttl_seconds(ttl_seconds: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_seconds),
            entries: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Current pricing for a model, or `None` if absent or expired.
    #[must_use]
    pub fn get(&self, provider: &str, model: &str) -> Option<ModelPricing> {
        let entries = self.entries.read();
        let cached = entries.get(&(provider.to_string(), model.to_string()))?;
        if cached.stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(cached.pricing)
    }

    /// Store pricing, detecting changes of at least 1% against the previous
    /// entry. Detected changes are appended to the bounded history and
    /// returned.
    pub fn set(
        &self,
        provider: &str,
        model: &str,
        pricing: ModelPricing,
        metadata: Option<serde_json::Value>,
    ) -> Vec<PricingChange> {
        let key = (provider.to_string(), model.to_string());

        let changes = {
            let entries = self.entries.read();
            entries
                .get(&key)
                .map(|previous| detect_changes(previous.pricing, pricing))
                .unwrap_or_default()
        };

        self.entries.write().insert(
            key.clone(),
            CachedPricing {
                pricing,
                stored_at: Instant::now(),
                metadata,
            },
        );

        if !changes.is_empty() {
            debug!(
                provider,
                model,
                changes = changes.len(),
                "pricing change detected"
            );
            let mut history = self.history.write();
            let slot = history.entry(key).or_insert_with(|| HistorySlot {
                entries: VecDeque::new(),
                stored_at: Instant::now(),
            });
            slot.entries.push_back(PricingHistoryEntry {
                pricing,
                changes: changes.clone(),
                recorded_at: Utc::now(),
            });
            while slot.entries.len() > HISTORY_CAP {
                slot.entries.pop_front();
            }
            slot.stored_at = Instant::now();
        }

        changes
    }

    /// Change history for a model, oldest first, at most `limit` entries.
    #[must_use]
    pub fn history(&self, provider: &str, model: &str, limit: usize) -> Vec<PricingHistoryEntry> {
        let history = self.history.read();
        let Some(slot) = history.get(&(provider.to_string(), model.to_string())) else {
            return Vec::new();
        };
        if slot.stored_at.elapsed() > self.ttl * HISTORY_TTL_FACTOR {
            return Vec::new();
        }
        let start = slot.entries.len().saturating_sub(limit);
        slot.entries.iter().skip(start).cloned().collect()
    }

    /// Entries older than `staleness` (but not yet expired from the map),
    /// as `(provider, model, age_seconds)`.
    #[must_use]
    pub fn stale_entries(&self, staleness: Duration) -> Vec<(String, String, u64)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, cached)| cached.stored_at.elapsed() > staleness)
            .map(|((provider, model), cached)| {
                (
                    provider.clone(),
                    model.clone(),
                    cached.stored_at.elapsed().as_secs(),
                )
            })
            .collect()
    }

    /// All unexpired pricing, keyed by provider then model.
    #[must_use]
    pub fn all(&self) -> HashMap<String, HashMap<String, ModelPricing>> {
        let mut out: HashMap<String, HashMap<String, ModelPricing>> = HashMap::new();
        for ((provider, model), cached) in self.entries.read().iter() {
            if cached.stored_at.elapsed() > self.ttl {
                continue;
            }
            out.entry(provider.clone())
                .or_default()
                .insert(model.clone(), cached.pricing);
        }
        out
    }

    /// Metadata stored with the current entry, if any.
    #[must_use]
    pub fn metadata(&self, provider: &str, model: &str) -> Option<serde_json::Value> {
        self.entries
            .read()
            .get(&(provider.to_string(), model.to_string()))
            .and_then(|c| c.metadata.clone())
    }

    /// Number of cached (provider, model) entries, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn detect_changes(previous: ModelPricing, current: ModelPricing) -> Vec<PricingChange> {
    let mut changes = Vec::new();
    let fields = [
        (
            "input_cost_per_1k",
            previous.input_cost_per_1k,
            current.input_cost_per_1k,
        ),
        (
            "output_cost_per_1k",
            previous.output_cost_per_1k,
            current.output_cost_per_1k,
        ),
    ];
    for (field, prev, curr) in fields {
        if prev <= 0.0 {
            continue;
        }
        let change_percent = ((curr - prev) / prev) * 100.0;
        if change_percent.abs() >= CHANGE_THRESHOLD * 100.0 {
            changes.push(PricingChange {
                field: field.to_string(),
                previous: prev,
                current: curr,
                change_percent,
                change_absolute: curr - prev,
                detected_at: Utc::now(),
            });
        }
    }
    changes
}
