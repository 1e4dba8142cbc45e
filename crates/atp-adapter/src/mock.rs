//! In-memory adapter for tests, benchmarks, and local development.

use crate::contract::{EstimateResponse, HealthReport, StreamChunk};
use crate::error::{AdapterError, Result};
use crate::prompt::PromptRequest;
use crate::service::{AdapterService, ChunkStream};
use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Advisory token-count heuristic: roughly four characters per token.
///
/// Production estimation always goes through [`AdapterService::estimate`];
/// this is the local fallback used by mock estimates only.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// A scripted adapter.
///
/// Streams pop scripted responses in order, falling back to a default
/// response once the script is exhausted. Latency, health, per-token cost,
/// and mid-stream failures are all configurable, which makes this the
/// workhorse of the pipeline and speculative-sampler tests.
pub struct MockAdapter {
    name: String,
    scripted: Mutex<VecDeque<String>>,
    default_response: String,
    latency_ms: u64,
    usd_micros_per_token: u64,
    health: Mutex<HealthReport>,
    /// Emit a terminal error chunk after this many text chunks.
    fail_after_chunks: Option<(usize, String)>,
    fail_estimate: bool,
    stream_calls: AtomicU64,
}

impl std::fmt::Debug for MockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAdapter")
            .field("name", &self.name)
            .field("latency_ms", &self.latency_ms)
            .finish()
    }
}

impl MockAdapter {
    /// Create a mock with a default response and no latency.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripted: Mutex::new(VecDeque::new()),
            default_response: "hello world".to_string(),
            latency_ms: 0,
            usd_micros_per_token: 10,
            health: Mutex::new(HealthReport {
                p95_ms: 25.0,
                error_rate: 0.0,
            }),
            fail_after_chunks: None,
            fail_estimate: false,
            stream_calls: AtomicU64::new(0),
        }
    }

    /// Queue a scripted response; responses are consumed in order.
    #[must_use]
    pub fn with_response(self, response: impl Into<String>) -> Self {
        self.scripted.lock().push_back(response.into());
        self
    }

    /// Set the fallback response used once the script is exhausted.
    #[must_use]
    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    /// Simulated per-call latency in milliseconds.
    #[must_use]
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Cost per token, in USD micros, used by `estimate`.
    #[must_use]
    pub fn with_usd_micros_per_token(mut self, micros: u64) -> Self {
        self.usd_micros_per_token = micros;
        self
    }

    /// Reported health.
    #[must_use]
    pub fn with_health(self, p95_ms: f64, error_rate: f64) -> Self {
        *self.health.lock() = HealthReport { p95_ms, error_rate };
        self
    }

    /// Emit a terminal error chunk after `chunks` text chunks.
    #[must_use]
    pub fn with_stream_error(mut self, chunks: usize, message: impl Into<String>) -> Self {
        self.fail_after_chunks = Some((chunks, message.into()));
        self
    }

    /// Make `estimate` fail.
    #[must_use]
    pub fn with_estimate_failure(mut self) -> Self {
        self.fail_estimate = true;
        self
    }

    /// Number of `stream` calls made against this adapter.
    #[must_use]
    pub fn stream_call_count(&self) -> u64 {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// The simulated latency.
    #[must_use]
    pub fn latency_ms(&self) -> u64 {
        self.latency_ms
    }

    fn next_response(&self) -> String {
        self.scripted
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone())
    }
}

#[async_trait]
impl AdapterService for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn estimate(&self, request: &PromptRequest) -> Result<EstimateResponse> {
        if self.fail_estimate {
            return Err(AdapterError::Backend("estimate unavailable".to_string()));
        }
        let in_tokens = estimate_tokens(&request.prompt);
        let out_tokens = u64::from(request.max_tokens.unwrap_or(64));
        let usd_micros = (in_tokens + out_tokens) * self.usd_micros_per_token;
        Ok(EstimateResponse {
            in_tokens,
            out_tokens,
            usd_micros,
            p95_tokens: out_tokens + out_tokens / 5,
            p95_usd_micros: usd_micros + usd_micros / 5,
            variance_tokens: out_tokens as f64 * 0.1,
            variance_usd: usd_micros as f64 * 0.1 / 1_000_000.0,
            confidence: 0.6,
        })
    }

    async fn health(&self) -> Result<HealthReport> {
        Ok(*self.health.lock())
    }

    async fn stream(&self, _request: &PromptRequest) -> Result<ChunkStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);

        let response = self.next_response();
        let latency = self.latency_ms;
        let fail_after = self.fail_after_chunks.clone();

        let chunks: Vec<String> = {
            let words: Vec<&str> = response.split_whitespace().collect();
            let last = words.len().saturating_sub(1);
            words
                .iter()
                .enumerate()
                .map(|(i, w)| {
                    if i == last {
                        (*w).to_string()
                    } else {
                        format!("{w} ")
                    }
                })
                .collect()
        };

        let output = stream! {
            if latency > 0 {
                tokio::time::sleep(Duration::from_millis(latency)).await;
            }
            let total = chunks.len();
            for (i, piece) in chunks.into_iter().enumerate() {
                if let Some((after, ref message)) = fail_after {
                    if i == after {
                        yield Ok(StreamChunk::error(message));
                        return;
                    }
                }
                yield Ok(StreamChunk::text(&piece, i + 1 < total));
            }
            if total == 0 {
                yield Ok(StreamChunk::text("", false));
            }
        };

        Ok(Box::pin(output))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect_text(adapter: &MockAdapter, prompt: &str) -> (String, Vec<StreamChunk>) {
        let mut stream = adapter
            .stream(&PromptRequest::new(prompt))
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }
        let text = chunks
            .iter()
            .filter_map(StreamChunk::text_content)
            .collect::<String>();
        (text, chunks)
    }

    #[test]
    fn test_estimate_tokens_heuristic() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("a".repeat(40).as_str()), 10);
    }

    #[tokio::test]
    async fn test_stream_reassembles_response() {
        let adapter = MockAdapter::new("mock").with_default_response("the quick brown fox");
        let (text, chunks) = collect_text(&adapter, "hi").await;

        assert_eq!(text, "the quick brown fox");
        assert!(chunks[..chunks.len() - 1].iter().all(|c| c.more));
        assert!(!chunks.last().unwrap().more);
    }

    #[tokio::test]
    async fn test_scripted_responses_consumed_in_order() {
        let adapter = MockAdapter::new("mock")
            .with_response("first")
            .with_response("second")
            .with_default_response("fallback");

        assert_eq!(collect_text(&adapter, "p").await.0, "first");
        assert_eq!(collect_text(&adapter, "p").await.0, "second");
        assert_eq!(collect_text(&adapter, "p").await.0, "fallback");
        assert_eq!(adapter.stream_call_count(), 3);
    }

    #[tokio::test]
    async fn test_stream_error_is_terminal() {
        let adapter = MockAdapter::new("mock")
            .with_default_response("one two three four")
            .with_stream_error(2, "backend exploded");

        let (_, chunks) = collect_text(&adapter, "p").await;
        assert_eq!(chunks.len(), 3);
        let last = chunks.last().unwrap();
        assert!(last.is_error());
        assert!(!last.more);
        assert_eq!(last.error_message().unwrap(), "backend exploded");
    }

    #[tokio::test]
    async fn test_estimate_scales_with_prompt() {
        let adapter = MockAdapter::new("mock").with_usd_micros_per_token(100);
        let estimate = adapter
            .estimate(&PromptRequest::new("a".repeat(400)).with_max_tokens(100))
            .await
            .unwrap();

        assert_eq!(estimate.in_tokens, 100);
        assert_eq!(estimate.out_tokens, 100);
        assert_eq!(estimate.usd_micros, 20_000);
        assert!(estimate.confidence > 0.0 && estimate.confidence <= 1.0);
    }

    #[tokio::test]
    async fn test_health_report() {
        let adapter = MockAdapter::new("mock").with_health(12.5, 0.01);
        let health = adapter.health().await.unwrap();
        assert_eq!(health.p95_ms, 12.5);
        assert_eq!(health.error_rate, 0.01);
    }

    #[tokio::test]
    async fn test_empty_response_still_terminates() {
        let adapter = MockAdapter::new("mock").with_default_response("");
        let (_, chunks) = collect_text(&adapter, "p").await;
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].more);
    }
}
