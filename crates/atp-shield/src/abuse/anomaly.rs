// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Behavioral anomaly scoring.
//!
//! Keeps a ten-minute rolling sample of request timestamps, endpoints,
//! methods, and depths per tenant, and combines four signals into a score
//! in `[0, 1]`: request frequency, endpoint diversity, mean depth, and the
//! Shannon entropy of the method distribution.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Rolling sample window.
const SAMPLE_WINDOW: Duration = Duration::from_secs(600);

/// Scores above this are anomalous.
pub(crate) const ANOMALY_THRESHOLD: f64 = 0.8;

/// Scores above this ban the entity temporarily.
pub(crate) const BAN_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone)]
struct Sample {
    at: Instant,
    endpoint: String,
    method: String,
    depth: u32,
}

/// Verdict for one analyzed request.
#[derive(Debug, Clone)]
pub struct AnomalyVerdict {
    pub anomalous: bool,
    pub score: f64,
    pub reason: String,
}

/// Per-tenant rolling anomaly scorer.
pub struct AnomalyScorer {
    samples: Mutex<HashMap<String, Vec<Sample>>>,
    scores: Mutex<HashMap<String, f64>>,
}

impl std::fmt::Debug for AnomalyScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyScorer")
            .field("tenants", &self.samples.lock().len())
            .finish()
    }
}

impl Default for AnomalyScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyScorer {
    /// Create an empty scorer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
            scores: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request and return the tenant's current verdict.
    pub fn analyze(
        &self,
        tenant_id: &str,
        endpoint: &str,
        method: &str,
        depth: u32,
    ) -> AnomalyVerdict {
        let mut samples = self.samples.lock();
        let tenant_samples = samples.entry(tenant_id.to_string()).or_default();

        tenant_samples.push(Sample {
            at: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            depth,
        });
        tenant_samples.retain(|s| s.at.elapsed() < SAMPLE_WINDOW);

        let score = score_samples(tenant_samples);
        let reason = describe(tenant_samples, score);
        drop(samples);

        self.scores.lock().insert(tenant_id.to_string(), score);
        AnomalyVerdict {
            anomalous: score > ANOMALY_THRESHOLD,
            score,
            reason,
        }
    }

    /// Last computed score for a tenant.
    #[must_use]
    pub fn score(&self, tenant_id: &str) -> f64 {
        self.scores.lock().get(tenant_id).copied().unwrap_or(0.0)
    }

    /// All last-computed scores.
    #[must_use]
    pub fn all_scores(&self) -> HashMap<String, f64> {
        self.scores.lock().clone()
    }

    /// Forget a tenant's samples and score.
    pub fn reset(&self, tenant_id: &str) {
        self.samples.lock().remove(tenant_id);
        self.scores.lock().remove(tenant_id);
    }
}

fn score_samples(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut score: f64 = 0.0;

    // Frequency: more than 100 requests in the window.
    let count = samples.len();
    if count > 100 {
        score += ((count - 100) as f64 / 500.0).min(0.4);
    }

    // Endpoint diversity: scanning behavior.
    let unique_endpoints: HashSet<&str> =
        samples.iter().map(|s| s.endpoint.as_str()).collect();
    if unique_endpoints.len() > 20 {
        score += ((unique_endpoints.len() - 20) as f64 / 50.0).min(0.3);
    }

    // Depth: deep recursive chains.
    let mean_depth =
        samples.iter().map(|s| f64::from(s.depth)).sum::<f64>() / samples.len() as f64;
    if mean_depth > 5.0 {
        score += ((mean_depth - 5.0) / 10.0).min(0.3);
    }

    // Method entropy: unusual method mixes.
    let mut method_counts: HashMap<&str, usize> = HashMap::new();
    for sample in samples {
        *method_counts.entry(sample.method.as_str()).or_insert(0) += 1;
    }
    if method_counts.len() > 1 {
        let entropy = shannon_entropy(method_counts.values().copied());
        if entropy > 1.5 {
            score += ((entropy - 1.5) / 2.0).min(0.2);
        }
    }

    score.min(1.0)
}

fn shannon_entropy(counts: impl Iterator<Item = usize> + Clone) -> f64 {
    let total: usize = counts.clone().sum();
    if total == 0 {
        return 0.0;
    }
    counts
        .filter(|&c| c > 0)
        .map(|c| {
            let p = c as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

fn describe(samples: &[Sample], score: f64) -> String {
    let mut reasons = Vec::new();

    let count = samples.len();
    if count > 100 {
        reasons.push(format!("high_frequency_{count}_requests"));
    }
    let unique_endpoints: HashSet<&str> =
        samples.iter().map(|s| s.endpoint.as_str()).collect();
    if unique_endpoints.len() > 20 {
        reasons.push(format!("endpoint_scanning_{}_endpoints", unique_endpoints.len()));
    }
    if !samples.is_empty() {
        let mean_depth =
            samples.iter().map(|s| f64::from(s.depth)).sum::<f64>() / samples.len() as f64;
        if mean_depth > 5.0 {
            reasons.push(format!("deep_recursion_avg_{mean_depth:.1}"));
        }
    }

    if reasons.is_empty() {
        format!("anomaly_score_{score:.2}")
    } else {
        reasons.join("_")
    }
}
