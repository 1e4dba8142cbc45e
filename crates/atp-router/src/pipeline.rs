//! The admission and dispatch pipeline.
//!
//! Per inbound request, in order: parse and normalize, input hardening,
//! WAF input scan, replay check, abuse check, model selection, cost
//! pre-check, optional speculative sampling, streamed dispatch with output
//! scanning, DP accounting, and completion bookkeeping.
//!
//! Partial failures follow the adapter contract: a terminal error chunk is
//! surfaced to the caller without retry, and a mid-stream transport failure
//! is converted into a terminal error chunk. Cancellation stops chunk
//! forwarding, records the event, and releases abuse tracking.

use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::speculative::{SpeculationOutcome, SpeculativeSampler};
use atp_adapter::{estimate_tokens, AdapterService, PromptRequest, StreamChunk};
use atp_ledger::{DpLedger, LedgerError};
use atp_observability::events::{EventBus, RejectionEvent, RejectionReason, SpeculativeEvent, SpeculativeEventKind};
use atp_observability::metric_names::{
    METRIC_PIPELINE_LATENCY_SECONDS, METRIC_PIPELINE_REQUESTS_TOTAL,
};
use atp_observability::metrics;
use atp_pricing::PricingCache;
use atp_registry::{ModelEntry, ModelStatus, RepositoryManager, RequestRecord};
use atp_shield::{
    AbusePrevention, InputHardening, InputPayload, NonceStore, RequestCheck, ShieldError, Waf,
    WafAction,
};
use futures::StreamExt;
use parking_lot::RwLock;
use prometheus::{HistogramOpts, Opts};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Raw or structured request payload.
#[derive(Debug, Clone)]
pub enum RequestPayload {
    /// Opaque bytes; must sniff as text.
    Bytes(Vec<u8>),
    /// Parsed JSON object with at least a `prompt` key.
    Structured(Value),
}

/// An inbound request before admission.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub correlation_id: Option<String>,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Anti-replay nonce, when the client supplies one.
    pub nonce: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub payload: RequestPayload,
    pub source_ip: Option<String>,
    pub client_id: Option<String>,
    pub parent_request_id: Option<String>,
    pub depth: u32,
}

impl InboundRequest {
    /// A structured request for a tenant.
    #[must_use]
    pub fn structured(tenant_id: &str, payload: Value) -> Self {
        Self {
            correlation_id: None,
            tenant_id: tenant_id.to_string(),
            user_id: None,
            session_id: None,
            nonce: None,
            endpoint: "/v1/stream".to_string(),
            method: "POST".to_string(),
            payload: RequestPayload::Structured(payload),
            source_ip: None,
            client_id: None,
            parent_request_id: None,
            depth: 0,
        }
    }

    /// A plain-text request for a tenant.
    #[must_use]
    pub fn text(tenant_id: &str, prompt: &str) -> Self {
        Self::structured(tenant_id, serde_json::json!({ "prompt": prompt }))
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_string());
        self
    }

    /// Attach a user id.
    #[must_use]
    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    /// Attach an anti-replay nonce.
    #[must_use]
    pub fn with_nonce(mut self, nonce: &str) -> Self {
        self.nonce = Some(nonce.to_string());
        self
    }
}

/// The pipeline's answer for one request.
#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub request_id: String,
    pub model_name: String,
    pub provider: String,
    /// Concatenated (possibly sanitized) text.
    pub text: String,
    /// The forwarded chunk sequence, including any terminal error chunk.
    pub chunks: Vec<StreamChunk>,
    /// True when the output scan rewrote at least one chunk.
    pub sanitized_output: bool,
    /// Terminal adapter/transport error, surfaced without retry.
    pub error: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
    pub latency_ms: f64,
    pub speculation: Option<SpeculationOutcome>,
}

/// The composed admission pipeline.
pub struct AdmissionPipeline {
    config: RouterConfig,
    bus: Arc<EventBus>,
    hardening: InputHardening,
    waf: Arc<Waf>,
    nonce_store: NonceStore,
    abuse: Arc<AbusePrevention>,
    registry: Arc<atp_registry::ModelRegistry>,
    repository: Arc<RepositoryManager>,
    pricing: Arc<PricingCache>,
    ledger: Option<Arc<DpLedger>>,
    adapters: RwLock<HashMap<String, Arc<dyn AdapterService>>>,
    sampler: Option<SpeculativeSampler>,
    requests_total: prometheus::CounterVec,
    latency_seconds: prometheus::Histogram,
}

impl std::fmt::Debug for AdmissionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPipeline")
            .field("adapters", &self.adapters.read().len())
            .finish()
    }
}

impl AdmissionPipeline {
    /// Wire the pipeline from its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RouterConfig,
        bus: Arc<EventBus>,
        waf: Arc<Waf>,
        abuse: Arc<AbusePrevention>,
        registry: Arc<atp_registry::ModelRegistry>,
        repository: Arc<RepositoryManager>,
        pricing: Arc<PricingCache>,
        ledger: Option<Arc<DpLedger>>,
        sampler: Option<SpeculativeSampler>,
    ) -> Self {
        Self {
            hardening: InputHardening::new(Arc::clone(&bus)),
            nonce_store: NonceStore::new(config.nonce_ttl_s, config.nonce_cap, Arc::clone(&bus)),
            bus,
            waf,
            abuse,
            registry,
            repository,
            pricing,
            ledger,
            adapters: RwLock::new(HashMap::new()),
            sampler,
            requests_total: metrics::counter_vec(
                Opts::new(METRIC_PIPELINE_REQUESTS_TOTAL, "Total pipeline requests"),
                &["outcome"],
            ),
            latency_seconds: metrics::histogram(
                HistogramOpts::new(
                    METRIC_PIPELINE_LATENCY_SECONDS,
                    "End-to-end pipeline latency",
                )
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            ),
            config,
        }
    }

    /// Register the adapter serving a model.
    pub fn register_adapter(&self, model_name: &str, adapter: Arc<dyn AdapterService>) {
        self.adapters
            .write()
            .insert(model_name.to_string(), adapter);
    }

    /// Admit and dispatch a request.
    ///
    /// # Errors
    ///
    /// Returns a typed [`RouterError`] for every rejection class; adapter
    /// stream errors after dispatch are surfaced inside the response, not
    /// as an `Err`.
    pub async fn process(&self, request: InboundRequest) -> Result<PipelineResponse> {
        let (_tx, rx) = watch::channel(false);
        self.process_cancellable(request, rx).await
    }

    /// [`AdmissionPipeline::process`] with a cancellation signal: send
    /// `true` on the paired `watch::Sender` to abort the stream.
    ///
    /// # Errors
    ///
    /// As [`AdmissionPipeline::process`], plus [`RouterError::Cancelled`].
    pub async fn process_cancellable(
        &self,
        request: InboundRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<PipelineResponse> {
        let started = Instant::now();
        let result = self.admit_and_dispatch(request, cancel).await;
        self.latency_seconds.observe(started.elapsed().as_secs_f64());

        let outcome = match &result {
            Ok(response) if response.error.is_some() => "adapter_error",
            Ok(_) => "ok",
            Err(RouterError::InputInvalid(_)) => "input_invalid",
            Err(RouterError::WafBlocked { .. }) => "waf_blocked",
            Err(RouterError::RateLimited { .. }) => "rate_limited",
            Err(RouterError::Replay { .. }) => "replay",
            Err(RouterError::Abuse(_)) => "abuse_blocked",
            Err(RouterError::NoModelAvailable { .. }) => "no_model",
            Err(RouterError::CostBudgetExceeded { .. }) => "cost_budget",
            Err(RouterError::Cancelled) => "cancelled",
            Err(RouterError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        self.requests_total.with_label_values(&[outcome]).inc();
        result
    }

    async fn admit_and_dispatch(
        &self,
        request: InboundRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<PipelineResponse> {
        // Step 1: parse & normalize.
        let request_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut prompt = self.parse_payload(&request, &request_id)?;

        // Step 3: WAF input scan (step 2, hardening, ran during parsing).
        let scan = self.waf.process_input(
            &prompt.prompt,
            request.source_ip.as_deref(),
            request.client_id.as_deref(),
            Some(&request_id),
        );
        match scan.action {
            WafAction::Block | WafAction::Quarantine => {
                self.bus.emit_rejection(
                    RejectionEvent::new(RejectionReason::PolicyViolation, "waf")
                        .with_request_id(&request_id)
                        .with_detail("detections", serde_json::json!(scan.detections.len())),
                );
                return Err(RouterError::WafBlocked {
                    action: scan.action,
                    reason: scan.reason.unwrap_or_else(|| "threat detected".to_string()),
                });
            }
            WafAction::RateLimit => {
                let retry_after_s = scan.retry_after_s.unwrap_or(60);
                self.bus.emit_rejection(
                    RejectionEvent::new(RejectionReason::RateLimitExceeded, "waf")
                        .with_request_id(&request_id),
                );
                return Err(RouterError::RateLimited { retry_after_s });
            }
            WafAction::Sanitize => {
                if let Some(sanitized) = scan.sanitized_input {
                    debug!(request = request_id, "input sanitized by WAF");
                    prompt.prompt = sanitized;
                }
            }
            WafAction::Allow | WafAction::LogOnly => {}
        }

        // Step 4: replay check.
        if let Some(nonce) = &request.nonce {
            if !self.nonce_store.check_and_store(nonce, Some(&request_id)) {
                return Err(RouterError::Replay {
                    nonce: nonce.clone(),
                });
            }
        }

        // Step 5: abuse check. From here on the request is tracked and
        // must be released on every path.
        self.abuse.check_request(&RequestCheck {
            request_id: &request_id,
            tenant_id: &request.tenant_id,
            endpoint: &request.endpoint,
            method: &request.method,
            content: &prompt.prompt,
            user_id: request.user_id.as_deref(),
            source_ip: request.source_ip.as_deref(),
            parent_request_id: request.parent_request_id.as_deref(),
            depth: request.depth,
        })?;

        let timeout = Duration::from_secs(self.config.request_timeout_s);
        let routed = tokio::time::timeout(
            timeout,
            self.route(&request, &request_id, prompt, cancel),
        )
        .await
        .unwrap_or(Err(RouterError::Timeout(timeout.as_millis() as u64)));

        match &routed {
            Ok(response) => {
                self.abuse
                    .end_request(&request_id, response.error.is_none());
                self.record_completion(&request, response);
            }
            Err(_) => self.abuse.end_request(&request_id, false),
        }
        routed
    }

    /// Steps 6-10: selection, cost pre-check, speculation, dispatch, DP.
    async fn route(
        &self,
        request: &InboundRequest,
        request_id: &str,
        prompt: PromptRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<PipelineResponse> {
        let started = Instant::now();

        // Step 6: model selection.
        let model = self.select_model(&prompt)?;
        let adapter = self
            .adapters
            .read()
            .get(&model.name)
            .cloned()
            .ok_or_else(|| RouterError::UnknownAdapter(model.name.clone()))?;
        self.mirror_shadows(&model.family, &prompt);

        // Step 7: cost pre-check.
        let estimate = adapter.estimate(&prompt).await?;
        let estimated_usd = estimate.usd_micros as f64 / 1_000_000.0;
        let budget_usd = self.config.tenant_budget_usd(&request.tenant_id);
        if estimated_usd > budget_usd {
            self.bus.emit_rejection(
                RejectionEvent::new(RejectionReason::ResourceExhausted, "cost_precheck")
                    .with_request_id(request_id)
                    .with_detail("estimated_usd", serde_json::json!(estimated_usd))
                    .with_detail("budget_usd", serde_json::json!(budget_usd)),
            );
            self.bus.emit_speculative(
                SpeculativeEvent::new(SpeculativeEventKind::EarlyTermination, &model.name)
                    .with_request_id(request_id),
            );
            return Err(RouterError::CostBudgetExceeded {
                estimated_usd,
                budget_usd,
            });
        }

        // Step 8: speculative sampling, when configured and the request
        // qualifies.
        if let Some(sampler) = &self.sampler {
            if !prompt.has_images() {
                let outcome = sampler.speculate(&prompt, Some(request_id)).await?;
                let scan = self.waf.process_output(&outcome.effective_response, Some(request_id));
                let text = scan
                    .sanitized_input
                    .clone()
                    .unwrap_or_else(|| outcome.effective_response.clone());
                let output_tokens = estimate_tokens(&text);
                let response = PipelineResponse {
                    request_id: request_id.to_string(),
                    model_name: model.name.clone(),
                    provider: model.provider.clone(),
                    chunks: vec![StreamChunk::text(&text, false)],
                    sanitized_output: scan.sanitized_input.is_some(),
                    error: None,
                    input_tokens: estimate.in_tokens,
                    output_tokens,
                    estimated_cost_usd: estimated_usd,
                    latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                    speculation: Some(outcome),
                    text,
                };
                self.account_dp(request, request_id, &model, response.output_tokens);
                return Ok(response);
            }
        }

        // Step 9: dispatch and forward the stream.
        let (text, chunks, sanitized_output, error, output_tokens) = self
            .consume_stream(adapter.as_ref(), &prompt, request_id, cancel)
            .await?;

        // Step 10: DP accounting. A budget rejection is recorded but never
        // rolls back the completed request.
        self.account_dp(request, request_id, &model, output_tokens);

        Ok(PipelineResponse {
            request_id: request_id.to_string(),
            model_name: model.name.clone(),
            provider: model.provider.clone(),
            text,
            chunks,
            sanitized_output,
            error,
            input_tokens: estimate.in_tokens,
            output_tokens,
            estimated_cost_usd: estimated_usd,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            speculation: None,
        })
    }

    fn parse_payload(
        &self,
        request: &InboundRequest,
        request_id: &str,
    ) -> Result<PromptRequest> {
        match &request.payload {
            RequestPayload::Bytes(bytes) => {
                self.hardening.check_input(
                    InputPayload::Bytes(bytes),
                    None,
                    Some(request_id),
                )?;
                let text = String::from_utf8_lossy(bytes).into_owned();
                // Text payloads may be bare prompts or serialized JSON.
                Ok(PromptRequest::from_json(&text)
                    .unwrap_or_else(|_| PromptRequest::new(text)))
            }
            RequestPayload::Structured(value) => {
                self.hardening.check_input(
                    InputPayload::Structured(value),
                    Some(&["prompt"]),
                    Some(request_id),
                )?;
                serde_json::from_value(value.clone()).map_err(|e| {
                    self.bus.emit_rejection(
                        RejectionEvent::new(RejectionReason::MalformedRequest, "pipeline")
                            .with_request_id(request_id),
                    );
                    RouterError::InputInvalid(ShieldError::InputRejected {
                        reason: RejectionReason::MalformedRequest,
                        detail: e.to_string(),
                    })
                })
            }
        }
    }

    /// Choose an active, enabled model on a healthy provider whose
    /// capabilities match the request: lowest expected cost first, ties
    /// broken by lower p95 latency.
    fn select_model(&self, prompt: &PromptRequest) -> Result<ModelEntry> {
        let adapters = self.adapters.read();
        let needs_vision = prompt.has_images();

        let mut candidates: Vec<ModelEntry> = self
            .registry
            .get_enabled_models()
            .into_iter()
            .filter(|m| prompt.model.as_ref().map_or(true, |want| &m.name == want))
            .filter(|m| m.capabilities.streaming)
            .filter(|m| !needs_vision || m.capabilities.vision)
            .filter(|m| adapters.contains_key(&m.name))
            .collect();

        if candidates.is_empty() {
            return Err(RouterError::NoModelAvailable {
                reason: match &prompt.model {
                    Some(name) => format!("requested model {name} is not selectable"),
                    None => "no active model matches the request capabilities".to_string(),
                },
            });
        }

        let in_tokens = estimate_tokens(&prompt.prompt);
        let out_tokens = u64::from(prompt.max_tokens.unwrap_or(64));
        // Live pricing beats catalog costs when the cache has an entry.
        let expected_cost = |m: &ModelEntry| {
            self.pricing
                .get(&m.provider, &m.name)
                .map_or_else(
                    || m.expected_cost(in_tokens, out_tokens),
                    |p| p.calculate_cost(in_tokens, out_tokens) + m.cost_per_request,
                )
        };
        candidates.sort_by(|a, b| {
            let cost_a = expected_cost(a);
            let cost_b = expected_cost(b);
            cost_a
                .partial_cmp(&cost_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.latency_p95_ms
                        .partial_cmp(&b.latency_p95_ms)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        Ok(candidates.remove(0))
    }

    /// Mirror the prompt to same-family shadow models. Responses are
    /// discarded; observed latency feeds their performance metrics.
    fn mirror_shadows(&self, family: &str, prompt: &PromptRequest) {
        let adapters = self.adapters.read();
        for shadow in self.registry.get_shadow_models() {
            if shadow.family != family || shadow.status != ModelStatus::Shadow {
                continue;
            }
            let Some(adapter) = adapters.get(&shadow.name).cloned() else {
                continue;
            };
            let prompt = prompt.clone();
            let registry = Arc::clone(&self.registry);
            let name = shadow.name.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                if let Ok(mut stream) = adapter.stream(&prompt).await {
                    while let Some(chunk) = stream.next().await {
                        match chunk {
                            Ok(c) if c.more => {}
                            _ => break,
                        }
                    }
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    let _ = registry.update_performance_metrics(
                        &name,
                        None,
                        None,
                        Some(elapsed_ms),
                    );
                    debug!(model = name, elapsed_ms, "shadow mirror completed");
                }
            });
        }
    }

    async fn consume_stream(
        &self,
        adapter: &dyn AdapterService,
        prompt: &PromptRequest,
        request_id: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(String, Vec<StreamChunk>, bool, Option<String>, u64)> {
        let mut stream = adapter.stream(prompt).await?;
        let mut text = String::new();
        let mut chunks = Vec::new();
        let mut sanitized_output = false;
        let mut error = None;
        let mut output_tokens = 0u64;

        let mut cancel_closed = false;
        loop {
            let next = if cancel_closed {
                stream.next().await
            } else {
                tokio::select! {
                    biased;
                    changed = cancel.changed() => {
                        match changed {
                            Ok(()) if *cancel.borrow() => {
                                info!(request = request_id, "client cancelled stream");
                                return Err(RouterError::Cancelled);
                            }
                            Ok(()) => continue,
                            Err(_) => {
                                // Sender dropped without cancelling.
                                cancel_closed = true;
                                continue;
                            }
                        }
                    }
                    next = stream.next() => next,
                }
            };
            let Some(item) = next else { break };

            match item {
                Ok(chunk) => {
                    if chunk.is_error() {
                        // Terminal error chunk: forward, no retry.
                        error = chunk.error_message();
                        chunks.push(chunk);
                        break;
                    }
                    let more = chunk.more;
                    let forwarded = match chunk.text_content() {
                        Some(piece) => {
                            // Output scan: secret-sanitize only.
                            let scan = self.waf.process_output(&piece, Some(request_id));
                            let piece = match scan.sanitized_input {
                                Some(clean) => {
                                    sanitized_output = true;
                                    clean
                                }
                                None => piece,
                            };
                            text.push_str(&piece);
                            output_tokens += 1;
                            chunk.with_text(&piece)
                        }
                        None => chunk,
                    };
                    chunks.push(forwarded);
                    if !more {
                        break;
                    }
                }
                Err(e) => {
                    // Transport failure mid-stream: emit a terminal error
                    // chunk and stop.
                    warn!(request = request_id, error = %e, "transport failure mid-stream");
                    let message = e.to_string();
                    chunks.push(StreamChunk::error(&message));
                    error = Some(message);
                    break;
                }
            }
        }

        Ok((text, chunks, sanitized_output, error, output_tokens))
    }

    fn account_dp(
        &self,
        request: &InboundRequest,
        request_id: &str,
        model: &ModelEntry,
        output_tokens: u64,
    ) {
        let Some(ledger) = &self.ledger else { return };
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("model".to_string(), Value::from(model.name.clone()));
        metadata.insert("request_id".to_string(), Value::from(request_id));
        match ledger.add_entry(
            &request.tenant_id,
            "exposure",
            output_tokens as f64,
            self.config.epsilon_per_request,
            1.0,
            Some(metadata),
        ) {
            Ok(_) => {}
            Err(LedgerError::BudgetExceeded { .. }) => {
                // The request already completed; note the exhaustion only.
                warn!(
                    tenant = request.tenant_id,
                    request = request_id,
                    "DP budget exhausted; response not rolled back"
                );
            }
            Err(e) => warn!(error = %e, "DP ledger append failed"),
        }
    }

    fn record_completion(&self, request: &InboundRequest, response: &PipelineResponse) {
        self.repository.log_request(RequestRecord {
            id: String::new(),
            correlation_id: response.request_id.clone(),
            tenant_id: request.tenant_id.clone(),
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
            model_used: response.model_name.clone(),
            provider_used: response.provider.clone(),
            status_code: if response.error.is_some() { 502 } else { 200 },
            response_time_ms: response.latency_ms,
            tokens_input: response.input_tokens,
            tokens_output: response.output_tokens,
            cost_usd: response.estimated_cost_usd,
            quality_score: None,
            timestamp: chrono::Utc::now(),
            metadata: HashMap::new(),
        });
    }

    /// The replay guard (exposed for operational tooling).
    #[must_use]
    pub fn nonce_store(&self) -> &NonceStore {
        &self.nonce_store
    }
}
