//! Wire messages of the adapter contract.

use serde::{Deserialize, Serialize};

/// Chunk type for token text.
pub const CHUNK_TYPE_TEXT: &str = "text";

/// Chunk type for terminal errors.
pub const CHUNK_TYPE_ERROR: &str = "error";

/// Response to a unary estimate call.
///
/// All token counts are adapter-provided; costs are in USD micros.
/// `confidence` is the adapter's own confidence in the estimate, in
/// `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimateResponse {
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub usd_micros: u64,
    pub p95_tokens: u64,
    pub p95_usd_micros: u64,
    pub variance_tokens: f64,
    pub variance_usd: f64,
    pub confidence: f64,
}

/// Response to a unary health call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub p95_ms: f64,
    pub error_rate: f64,
}

/// One element of a server-streamed response.
///
/// `content_json` is a JSON document whose shape depends on `chunk_type`:
/// `"text"` carries `{"text": "..."}`, `"error"` carries `{"error": "..."}`;
/// other kinds are adapter-defined. `more` is `false` on the final chunk of
/// a stream; consumers must read until then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "type")]
    pub chunk_type: String,
    pub content_json: String,
    pub confidence: f64,
    pub more: bool,
}

impl StreamChunk {
    /// Build a text chunk.
    #[must_use]
    pub fn text(text: &str, more: bool) -> Self {
        Self {
            chunk_type: CHUNK_TYPE_TEXT.to_string(),
            content_json: serde_json::json!({ "text": text }).to_string(),
            confidence: 1.0,
            more,
        }
    }

    /// Build a terminal error chunk (`more == false`).
    #[must_use]
    pub fn error(message: &str) -> Self {
        Self {
            chunk_type: CHUNK_TYPE_ERROR.to_string(),
            content_json: serde_json::json!({ "error": message }).to_string(),
            confidence: 0.0,
            more: false,
        }
    }

    /// Whether this is a terminal error chunk.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.chunk_type == CHUNK_TYPE_ERROR
    }

    /// Text payload of a `"text"` chunk.
    #[must_use]
    pub fn text_content(&self) -> Option<String> {
        if self.chunk_type != CHUNK_TYPE_TEXT {
            return None;
        }
        serde_json::from_str::<serde_json::Value>(&self.content_json)
            .ok()?
            .get("text")?
            .as_str()
            .map(ToString::to_string)
    }

    /// Error payload of an `"error"` chunk.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        serde_json::from_str::<serde_json::Value>(&self.content_json)
            .ok()?
            .get("error")?
            .as_str()
            .map(ToString::to_string)
    }

    /// Replace the text payload of a `"text"` chunk, keeping flags.
    #[must_use]
    pub fn with_text(mut self, text: &str) -> Self {
        self.content_json = serde_json::json!({ "text": text }).to_string();
        self
    }
}
