//! Speculative sampling: accept a fast draft model's answer when it agrees
//! with the slower target.

use crate::config::SpeculativeConfig;
use crate::error::Result;
use atp_adapter::{AdapterService, PromptRequest, StreamChunk};
use atp_observability::events::{EventBus, SpeculativeEvent, SpeculativeEventKind};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Deterministic scoring of draft/target agreement.
///
/// Implementations must be pure functions of the two responses.
pub trait ConfidenceScorer: Send + Sync {
    /// Confidence in `[0, 1]` that the draft response is acceptable.
    fn score(&self, draft: &str, target: &str) -> f64;
}

/// The stock scorer: 0.0 when either response is empty, 0.8 when the first
/// tokens match, 0.2 otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstTokenScorer;

impl ConfidenceScorer for FirstTokenScorer {
    fn score(&self, draft: &str, target: &str) -> f64 {
        let draft_first = draft.split_whitespace().next();
        let target_first = target.split_whitespace().next();
        match (draft_first, target_first) {
            (Some(d), Some(t)) if d == t => 0.8,
            (Some(_), Some(_)) => 0.2,
            _ => 0.0,
        }
    }
}

/// Outcome of one speculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculationOutcome {
    pub draft_response: String,
    pub target_response: String,
    pub accepted: bool,
    pub confidence: f64,
    pub draft_latency_ms: f64,
    pub target_latency_ms: f64,
    pub total_latency_ms: f64,
    /// Positive iff the speculation was accepted.
    pub latency_saved_ms: f64,
    pub effective_response: String,
}

/// Aggregate results of a benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculationBenchmark {
    pub trials: usize,
    pub acceptance_rate: f64,
    pub average_latency_saved_ms: f64,
    pub average_confidence: f64,
}

/// Two-stage draft/target sampler with event surfacing.
pub struct SpeculativeSampler {
    config: SpeculativeConfig,
    draft: Arc<dyn AdapterService>,
    target: Arc<dyn AdapterService>,
    scorer: Box<dyn ConfidenceScorer>,
    bus: Arc<EventBus>,
}

impl std::fmt::Debug for SpeculativeSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeculativeSampler")
            .field("config", &self.config)
            .finish()
    }
}

impl SpeculativeSampler {
    /// Create a sampler over draft and target adapters with the stock
    /// scorer.
    #[must_use]
    pub fn new(
        config: SpeculativeConfig,
        draft: Arc<dyn AdapterService>,
        target: Arc<dyn AdapterService>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            draft,
            target,
            scorer: Box::new(FirstTokenScorer),
            bus,
        }
    }

    /// Swap in a different scoring function.
    #[must_use]
    pub fn with_scorer(mut self, scorer: Box<dyn ConfidenceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Run one speculation.
    ///
    /// Emits `speculation_attempted`, then obtains both responses, scores
    /// them, and emits `speculation_accepted` or `speculation_rejected`.
    /// The saved latency is the configured target/draft latency gap, and is
    /// zero whenever the speculation is rejected.
    ///
    /// # Errors
    ///
    /// Propagates adapter failures from either stage.
    pub async fn speculate(
        &self,
        prompt: &PromptRequest,
        request_id: Option<&str>,
    ) -> Result<SpeculationOutcome> {
        let started = Instant::now();

        let mut attempted = SpeculativeEvent::new(
            SpeculativeEventKind::SpeculationAttempted,
            &self.config.draft_model,
        )
        .with_detail("prompt_length", serde_json::json!(prompt.prompt.len()));
        if let Some(id) = request_id {
            attempted = attempted.with_request_id(id);
        }
        self.bus.emit_speculative(attempted);

        let draft_started = Instant::now();
        let draft_response = collect_text(self.draft.as_ref(), prompt).await?;
        let draft_latency_ms = draft_started.elapsed().as_secs_f64() * 1000.0;

        let target_started = Instant::now();
        let target_response = collect_text(self.target.as_ref(), prompt).await?;
        let target_latency_ms = target_started.elapsed().as_secs_f64() * 1000.0;

        let confidence = self.scorer.score(&draft_response, &target_response);
        let accepted = confidence >= self.config.acceptance_threshold;
        let latency_saved_ms = if accepted {
            (self.config.target_latency_ms - self.config.draft_latency_ms).max(0.0)
        } else {
            0.0
        };

        let kind = if accepted {
            SpeculativeEventKind::SpeculationAccepted
        } else {
            SpeculativeEventKind::SpeculationRejected
        };
        let mut event = SpeculativeEvent::new(kind, &self.config.draft_model)
            .with_confidence(confidence)
            .with_detail(
                "acceptance_threshold",
                serde_json::json!(self.config.acceptance_threshold),
            );
        if accepted {
            event = event.with_latency_saved_ms(latency_saved_ms);
        }
        if let Some(id) = request_id {
            event = event.with_request_id(id);
        }
        self.bus.emit_speculative(event);

        let effective_response = if accepted {
            draft_response.clone()
        } else {
            target_response.clone()
        };

        Ok(SpeculationOutcome {
            draft_response,
            target_response,
            accepted,
            confidence,
            draft_latency_ms,
            target_latency_ms,
            total_latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            latency_saved_ms,
            effective_response,
        })
    }

    /// Run `trials` speculations and aggregate the results.
    ///
    /// # Errors
    ///
    /// Propagates the first adapter failure.
    pub async fn benchmark(&self, trials: usize) -> Result<SpeculationBenchmark> {
        let mut accepted = 0usize;
        let mut total_saved = 0.0;
        let mut total_confidence = 0.0;

        for i in 0..trials {
            let prompt = PromptRequest::new(format!("benchmark prompt {i}"));
            let outcome = self
                .speculate(&prompt, Some(&format!("benchmark-{i}")))
                .await?;
            if outcome.accepted {
                accepted += 1;
                total_saved += outcome.latency_saved_ms;
            }
            total_confidence += outcome.confidence;
        }

        Ok(SpeculationBenchmark {
            trials,
            acceptance_rate: accepted as f64 / trials.max(1) as f64,
            average_latency_saved_ms: total_saved / accepted.max(1) as f64,
            average_confidence: total_confidence / trials.max(1) as f64,
        })
    }
}

/// Drain an adapter stream into its concatenated text.
async fn collect_text(adapter: &dyn AdapterService, prompt: &PromptRequest) -> Result<String> {
    let mut stream = adapter.stream(prompt).await?;
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if chunk.is_error() {
            break;
        }
        if let Some(piece) = StreamChunk::text_content(&chunk) {
            text.push_str(&piece);
        }
        if !chunk.more {
            break;
        }
    }
    Ok(text)
}
