//! The `AdapterService` trait.

use crate::contract::{EstimateResponse, HealthReport, StreamChunk};
use crate::error::Result;
use crate::prompt::PromptRequest;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// A server-streamed chunk sequence.
///
/// Chunks arrive in production order; the stream ends after the first chunk
/// with `more == false`. Adapters must not buffer unbounded output;
/// backpressure is the transport's concern.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Uniform remote interface to one provider/model deployment.
#[async_trait]
pub trait AdapterService: Send + Sync {
    /// Stable adapter name, used for dispatch and event attribution.
    fn name(&self) -> &str;

    /// Estimate tokens and cost for a prompt. Pure and idempotent; no side
    /// effects on the backend.
    async fn estimate(&self, request: &PromptRequest) -> Result<EstimateResponse>;

    /// Cheap health probe, callable at any time.
    async fn health(&self) -> Result<HealthReport>;

    /// Open a token stream for a prompt.
    async fn stream(&self, request: &PromptRequest) -> Result<ChunkStream>;
}
