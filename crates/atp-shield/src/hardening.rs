//! Input hardening: MIME sniffing and schema validation.

use crate::error::{Result, ShieldError};
use atp_observability::events::{EventBus, RejectionEvent, RejectionReason};
use atp_observability::metric_names::METRIC_INPUT_REJECT_TOTAL;
use atp_observability::metrics;
use serde_json::Value;
use std::sync::Arc;

/// Fraction of non-printable bytes above which data is treated as binary.
const NON_PRINTABLE_LIMIT: f64 = 0.05;

/// A payload presented for validation.
#[derive(Debug, Clone, Copy)]
pub enum InputPayload<'a> {
    /// Raw bytes; only `text/plain` is accepted.
    Bytes(&'a [u8]),
    /// Parsed structured payload; required keys are checked at top level.
    Structured(&'a Value),
}

/// Lightweight MIME sniff: `text/plain` iff at most 5% of bytes are
/// non-printable (NUL, below TAB, or between CR and SPACE exclusive).
#[must_use]
pub fn sniff_mime(data: &[u8]) -> &'static str {
    if data.is_empty() {
        return "text/plain";
    }
    let non_printable = data
        .iter()
        .filter(|&&b| b == 0 || b < 9 || (13 < b && b < 32))
        .count();
    let ratio = non_printable as f64 / data.len() as f64;
    if ratio > NON_PRINTABLE_LIMIT {
        "application/octet-stream"
    } else {
        "text/plain"
    }
}

/// Require all `required_keys` at the top level of a JSON object.
#[must_use]
pub fn validate_schema(value: &Value, required_keys: &[&str]) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    required_keys.iter().all(|key| object.contains_key(*key))
}

/// Validates payloads before they enter the pipeline.
pub struct InputHardening {
    bus: Arc<EventBus>,
    reject_total: prometheus::Counter,
}

impl std::fmt::Debug for InputHardening {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputHardening").finish()
    }
}

impl InputHardening {
    /// Create a validator emitting rejections on `bus`.
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            reject_total: metrics::counter(
                METRIC_INPUT_REJECT_TOTAL,
                "Total payloads rejected by input hardening",
            ),
        }
    }

    /// Validate a payload.
    ///
    /// Byte payloads must sniff as `text/plain`; structured payloads must
    /// carry every required key. On failure a rejection event is emitted,
    /// the reject counter incremented, and a typed error returned.
    ///
    /// # Errors
    ///
    /// Returns [`ShieldError::InputRejected`] with reason
    /// `input_validation` (bytes) or `schema_mismatch` (structured).
    pub fn check_input(
        &self,
        payload: InputPayload<'_>,
        required_keys: Option<&[&str]>,
        request_id: Option<&str>,
    ) -> Result<()> {
        match payload {
            InputPayload::Bytes(data) => {
                let mime = sniff_mime(data);
                if mime != "text/plain" {
                    self.reject(
                        RejectionReason::InputValidation,
                        "invalid_mime",
                        request_id,
                        serde_json::json!({ "detected_mime": mime }),
                    );
                    return Err(ShieldError::InputRejected {
                        reason: RejectionReason::InputValidation,
                        detail: format!("invalid mime: {mime}"),
                    });
                }
                Ok(())
            }
            InputPayload::Structured(value) => {
                let keys = required_keys.unwrap_or(&[]);
                if !keys.is_empty() && !validate_schema(value, keys) {
                    self.reject(
                        RejectionReason::SchemaMismatch,
                        "schema_invalid",
                        request_id,
                        serde_json::json!({ "required_keys": keys }),
                    );
                    return Err(ShieldError::InputRejected {
                        reason: RejectionReason::SchemaMismatch,
                        detail: format!("missing required keys, expected {keys:?}"),
                    });
                }
                Ok(())
            }
        }
    }

    fn reject(
        &self,
        reason: RejectionReason,
        kind: &str,
        request_id: Option<&str>,
        detail: Value,
    ) {
        self.reject_total.inc();
        let mut event = RejectionEvent::new(reason, "input_hardening")
            .with_detail("reason", serde_json::json!(kind))
            .with_detail("context", detail);
        if let Some(id) = request_id {
            event = event.with_request_id(id);
        }
        self.bus.emit_rejection(event);
    }
}
