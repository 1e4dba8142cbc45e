// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Prometheus metric name constants for the ATP router.
//!
//! This module centralizes all metric names to ensure consistency across the
//! workspace. Metrics follow Prometheus naming conventions:
//! - Counters end with `_total`
//! - Histograms end with `_seconds`, `_ms`, `_bytes`, etc. (unit suffix)
//! - Gauges have no special suffix

// ============================================================================
// Admission path
// ============================================================================

/// Total payloads rejected by input hardening.
pub const METRIC_INPUT_REJECT_TOTAL: &str = "atp_input_reject_total";

/// Total requests rejected by the replay guard.
pub const METRIC_REPLAY_REJECT_TOTAL: &str = "atp_replay_reject_total";

/// Total requests processed by the WAF, labelled by resulting action.
pub const METRIC_WAF_REQUESTS_TOTAL: &str = "atp_waf_requests_total";

/// Total WAF blocks, labelled by attack type and severity.
pub const METRIC_WAF_BLOCKS_TOTAL: &str = "atp_waf_blocks_total";

/// WAF scan latency in seconds, labelled by component.
pub const METRIC_WAF_LATENCY_SECONDS: &str = "atp_waf_latency_seconds";

/// Total admission pipeline requests, labelled by outcome.
pub const METRIC_PIPELINE_REQUESTS_TOTAL: &str = "atp_pipeline_requests_total";

/// End-to-end admission pipeline latency in seconds.
pub const METRIC_PIPELINE_LATENCY_SECONDS: &str = "atp_pipeline_latency_seconds";

// ============================================================================
// Abuse prevention
// ============================================================================

/// Total loop detections, labelled by detection type.
pub const METRIC_LOOP_DETECTIONS_TOTAL: &str = "atp_loop_detections_total";

/// Total abuse blocks, labelled by block reason.
pub const METRIC_ABUSE_BLOCKS_TOTAL: &str = "atp_abuse_blocks_total";

/// Total rate limit hits, labelled by tier.
pub const METRIC_RATE_LIMIT_HITS_TOTAL: &str = "atp_rate_limit_hits_total";

/// Active in-flight requests per tenant.
pub const METRIC_ACTIVE_REQUESTS: &str = "atp_active_requests";

/// Observed request depth per tenant.
pub const METRIC_REQUEST_DEPTH: &str = "atp_request_depth";

// ============================================================================
// Speculative sampling and events
// ============================================================================

/// Total speculative sampling events emitted.
pub const METRIC_SPECULATIVE_EVENTS_TOTAL: &str = "atp_speculative_events_total";

// ============================================================================
// DP ledger
// ============================================================================

/// Total entries appended to the DP ledger.
pub const METRIC_DP_LEDGER_ENTRIES_TOTAL: &str = "atp_dp_ledger_entries_total";

/// Total ledger exports performed.
pub const METRIC_DP_LEDGER_EXPORTS_TOTAL: &str = "atp_dp_ledger_exports_total";

/// Total entries rejected because a tenant's epsilon budget was exhausted.
pub const METRIC_DP_LEDGER_BUDGET_EXCEEDED_TOTAL: &str = "atp_dp_ledger_budget_exceeded_total";

// ============================================================================
// Evidence packs
// ============================================================================

/// Total evidence pack signatures produced.
pub const METRIC_EVIDENCE_SIGNATURES_TOTAL: &str = "atp_evidence_pack_signatures_total";

/// Total evidence pack notarizations produced.
pub const METRIC_EVIDENCE_NOTARIZATIONS_TOTAL: &str = "atp_evidence_pack_notarizations_total";

/// Total successful signature verifications.
pub const METRIC_EVIDENCE_VERIFICATIONS_TOTAL: &str =
    "atp_evidence_pack_signature_verifications_total";

/// Total tamper detections (hash or signature mismatch).
pub const METRIC_EVIDENCE_TAMPER_DETECTED_TOTAL: &str = "atp_evidence_pack_tamper_detected_total";

// ============================================================================
// Cardinality guardrail
// ============================================================================

/// Total cardinality violations raised, labelled by severity.
pub const METRIC_CARDINALITY_VIOLATIONS_TOTAL: &str = "atp_cardinality_violations_total";

// ============================================================================
// Orchestrator
// ============================================================================

/// Total orchestration sessions created.
pub const METRIC_ORCH_SESSIONS_CREATED_TOTAL: &str = "atp_orchestrator_sessions_created_total";

/// Total orchestration sessions completed successfully.
pub const METRIC_ORCH_SESSIONS_COMPLETED_TOTAL: &str = "atp_orchestrator_sessions_completed_total";

/// Total orchestration sessions that ended failed.
pub const METRIC_ORCH_SESSIONS_FAILED_TOTAL: &str = "atp_orchestrator_sessions_failed_total";

/// Total sub-requests added across sessions.
pub const METRIC_ORCH_SUB_REQUESTS_CREATED_TOTAL: &str =
    "atp_orchestrator_sub_requests_created_total";

/// Total sub-requests completed successfully.
pub const METRIC_ORCH_SUB_REQUESTS_COMPLETED_TOTAL: &str =
    "atp_orchestrator_sub_requests_completed_total";

/// Total sub-requests that failed.
pub const METRIC_ORCH_SUB_REQUESTS_FAILED_TOTAL: &str =
    "atp_orchestrator_sub_requests_failed_total";

/// Currently active orchestration sessions.
pub const METRIC_ORCH_ACTIVE_SESSIONS: &str = "atp_orchestrator_active_sessions";

/// Session wall-clock duration in seconds.
pub const METRIC_ORCH_SESSION_DURATION_SECONDS: &str =
    "atp_orchestrator_session_duration_seconds";

/// Sub-request wall-clock duration in seconds.
pub const METRIC_ORCH_SUB_REQUEST_DURATION_SECONDS: &str =
    "atp_orchestrator_sub_request_duration_seconds";

// ============================================================================
// Continuous improvement and SLOs
// ============================================================================

/// Total continuous-improvement pipeline executions, labelled by outcome.
pub const METRIC_CI_EXECUTIONS_TOTAL: &str = "atp_ci_executions_total";

/// Continuous-improvement step duration in seconds.
pub const METRIC_CI_STEP_DURATION_SECONDS: &str = "atp_ci_step_duration_seconds";

/// Total SLO violations observed, labelled by SLO name.
pub const METRIC_SLO_VIOLATIONS_TOTAL: &str = "atp_slo_violations_total";

// ============================================================================
// Pricing
// ============================================================================

/// Total pricing refresh attempts, labelled by outcome.
pub const METRIC_PRICING_REFRESH_TOTAL: &str = "atp_pricing_refresh_total";
