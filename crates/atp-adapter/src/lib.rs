//! The adapter contract every inference backend implements.
//!
//! A backend (cloud API, local engine, anything) presents three operations:
//!
//! - `estimate`: pure, idempotent token/cost estimation for a prompt.
//! - `health`: cheap liveness with p95 latency and error rate.
//! - `stream`: server-streamed sequence of [`StreamChunk`]s, delivered in
//!   production order per request, terminated by a chunk with `more ==
//!   false`. A terminal `"error"` chunk signals an irrecoverable failure.
//!
//! Prompts cross the boundary as structured [`PromptRequest`] records: the
//! recognized sampling keys are typed, and anything else rides in an
//! extensions map so adapter-specific keys survive without untyped parsing.
//!
//! [`MockAdapter`] is the in-memory implementation used by tests and the
//! speculative sampler's benchmark mode.

mod contract;
mod error;
mod mock;
mod prompt;
mod service;

pub use contract::{EstimateResponse, HealthReport, StreamChunk, CHUNK_TYPE_ERROR, CHUNK_TYPE_TEXT};
pub use error::{AdapterError, Result};
pub use mock::{estimate_tokens, MockAdapter};
pub use prompt::PromptRequest;
pub use service::{AdapterService, ChunkStream};
