//! Session-scoped orchestration of multi-step sub-request DAGs.
//!
//! A session owns a set of sub-requests, each naming the adapter to run on
//! and the sub-requests it depends on. The orchestrator is cooperative: it
//! never invokes adapters itself, it only exposes the ready set
//! ([`SubRequestOrchestrator::get_ready_requests`]) to a dispatcher and
//! ingests completions back. This keeps parallelism and backpressure the
//! dispatcher's concern.

use crate::error::{Result, RouterError};
use atp_observability::metric_names::{
    METRIC_ORCH_ACTIVE_SESSIONS, METRIC_ORCH_SESSIONS_COMPLETED_TOTAL,
    METRIC_ORCH_SESSIONS_CREATED_TOTAL, METRIC_ORCH_SESSIONS_FAILED_TOTAL,
    METRIC_ORCH_SESSION_DURATION_SECONDS, METRIC_ORCH_SUB_REQUESTS_COMPLETED_TOTAL,
    METRIC_ORCH_SUB_REQUESTS_CREATED_TOTAL, METRIC_ORCH_SUB_REQUESTS_FAILED_TOTAL,
    METRIC_ORCH_SUB_REQUEST_DURATION_SECONDS,
};
use atp_observability::metrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::HistogramOpts;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    Executing,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// Whether the session can still make progress.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Executing => "executing",
            SessionState::Waiting => "waiting",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Sub-request lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubRequestStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One step of an orchestration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRequest {
    pub request_id: String,
    pub prompt: String,
    pub adapter_name: String,
    pub dependencies: Vec<String>,
    pub timeout: Duration,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: SubRequestStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<HashMap<String, Value>>,
    pub error: Option<String>,
}

impl SubRequest {
    /// Wall-clock duration, when both timestamps exist.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// An orchestration session and its sub-request DAG.
#[derive(Debug, Clone)]
pub struct OrchestrationSession {
    pub session_id: String,
    pub initial_prompt: String,
    pub state: SessionState,
    pub sub_requests: HashMap<String, SubRequest>,
    pub execution_order: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OrchestrationSession {
    fn ready_requests(&self) -> Vec<&SubRequest> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.sub_requests
            .values()
            .filter(|sub| sub.status == SubRequestStatus::Pending)
            .filter(|sub| {
                sub.dependencies.iter().all(|dep| {
                    // Dependencies outside the session are never satisfiable.
                    self.sub_requests
                        .get(dep)
                        .is_some_and(|d| d.status == SubRequestStatus::Completed)
                })
            })
            .collect()
    }

    fn running_count(&self) -> usize {
        self.sub_requests
            .values()
            .filter(|sub| sub.status == SubRequestStatus::Running)
            .count()
    }

    fn failed_count(&self) -> usize {
        self.sub_requests
            .values()
            .filter(|sub| sub.status == SubRequestStatus::Failed)
            .count()
    }

    fn completed_count(&self) -> usize {
        self.sub_requests
            .values()
            .filter(|sub| sub.status == SubRequestStatus::Completed)
            .count()
    }

    /// Pending sub-requests that could still run: every dependency either
    /// completed, is running, or is itself a viable pending request. A
    /// failed or out-of-session dependency poisons its whole chain.
    fn has_viable_pending(&self) -> bool {
        use std::collections::HashSet;
        let mut viable: HashSet<&str> = self
            .sub_requests
            .values()
            .filter(|sub| sub.status == SubRequestStatus::Pending)
            .map(|sub| sub.request_id.as_str())
            .collect();

        loop {
            let poisoned: Vec<&str> = viable
                .iter()
                .copied()
                .filter(|id| {
                    let sub = &self.sub_requests[*id];
                    sub.dependencies.iter().any(|dep| {
                        match self.sub_requests.get(dep) {
                            None => true,
                            Some(d) => match d.status {
                                SubRequestStatus::Failed => true,
                                SubRequestStatus::Pending => !viable.contains(dep.as_str()),
                                SubRequestStatus::Completed | SubRequestStatus::Running => false,
                            },
                        }
                    })
                })
                .collect();
            if poisoned.is_empty() {
                break;
            }
            for id in poisoned {
                viable.remove(id);
            }
        }
        !viable.is_empty()
    }
}

/// Serializable status view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub sub_requests: HashMap<String, SubRequestStatusView>,
}

/// Per-sub-request detail inside a [`SessionStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRequestStatusView {
    pub status: SubRequestStatus,
    pub adapter_name: String,
    pub dependencies: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_s: Option<f64>,
    pub error: Option<String>,
}

struct OrchestratorMetrics {
    sessions_created: prometheus::Counter,
    sessions_completed: prometheus::Counter,
    sessions_failed: prometheus::Counter,
    sub_requests_created: prometheus::Counter,
    sub_requests_completed: prometheus::Counter,
    sub_requests_failed: prometheus::Counter,
    active_sessions: prometheus::Gauge,
    session_duration: prometheus::Histogram,
    sub_request_duration: prometheus::Histogram,
}

impl OrchestratorMetrics {
    fn new() -> Self {
        Self {
            sessions_created: metrics::counter(
                METRIC_ORCH_SESSIONS_CREATED_TOTAL,
                "Total orchestration sessions created",
            ),
            sessions_completed: metrics::counter(
                METRIC_ORCH_SESSIONS_COMPLETED_TOTAL,
                "Total orchestration sessions completed",
            ),
            sessions_failed: metrics::counter(
                METRIC_ORCH_SESSIONS_FAILED_TOTAL,
                "Total orchestration sessions failed",
            ),
            sub_requests_created: metrics::counter(
                METRIC_ORCH_SUB_REQUESTS_CREATED_TOTAL,
                "Total sub-requests created",
            ),
            sub_requests_completed: metrics::counter(
                METRIC_ORCH_SUB_REQUESTS_COMPLETED_TOTAL,
                "Total sub-requests completed",
            ),
            sub_requests_failed: metrics::counter(
                METRIC_ORCH_SUB_REQUESTS_FAILED_TOTAL,
                "Total sub-requests failed",
            ),
            active_sessions: metrics::gauge(
                METRIC_ORCH_ACTIVE_SESSIONS,
                "Currently active orchestration sessions",
            ),
            session_duration: metrics::histogram(
                HistogramOpts::new(
                    METRIC_ORCH_SESSION_DURATION_SECONDS,
                    "Session wall-clock duration",
                )
                .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
            ),
            sub_request_duration: metrics::histogram(
                HistogramOpts::new(
                    METRIC_ORCH_SUB_REQUEST_DURATION_SECONDS,
                    "Sub-request wall-clock duration",
                )
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            ),
        }
    }
}

/// The orchestrator: session registry plus readiness/completion rules.
pub struct SubRequestOrchestrator {
    sessions: Mutex<HashMap<String, OrchestrationSession>>,
    metrics: OrchestratorMetrics,
}

impl fmt::Debug for SubRequestOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubRequestOrchestrator")
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl Default for SubRequestOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SubRequestOrchestrator {
    /// Create an empty orchestrator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            metrics: OrchestratorMetrics::new(),
        }
    }

    /// Create a session for an initial prompt. The session starts idle.
    pub fn create_session(&self, initial_prompt: &str) -> String {
        let session_id = format!("orch_{}", &Uuid::new_v4().simple().to_string()[..8]);
        let session = OrchestrationSession {
            session_id: session_id.clone(),
            initial_prompt: initial_prompt.to_string(),
            state: SessionState::Idle,
            sub_requests: HashMap::new(),
            execution_order: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        self.sessions.lock().insert(session_id.clone(), session);
        self.metrics.sessions_created.inc();
        self.metrics.active_sessions.inc();
        info!(session = session_id, "created orchestration session");
        session_id
    }

    /// Add a sub-request to a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown or already terminal.
    pub fn add_sub_request(
        &self,
        session_id: &str,
        prompt: &str,
        adapter_name: &str,
        dependencies: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RouterError::SessionNotFound(session_id.to_string()))?;
        if session.state.is_terminal() {
            return Err(RouterError::SessionCompleted(session_id.to_string()));
        }

        let request_id = format!("req_{}", &Uuid::new_v4().simple().to_string()[..8]);
        session.sub_requests.insert(
            request_id.clone(),
            SubRequest {
                request_id: request_id.clone(),
                prompt: prompt.to_string(),
                adapter_name: adapter_name.to_string(),
                dependencies,
                timeout: timeout.unwrap_or(Duration::from_secs(30)),
                retry_count: 0,
                max_retries: 3,
                status: SubRequestStatus::Pending,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
            },
        );
        session.execution_order.push(request_id.clone());
        self.metrics.sub_requests_created.inc();
        Ok(request_id)
    }

    /// Start a session: `Executing` if any sub-request is ready,
    /// `Initializing` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown or not idle.
    pub fn start_session(&self, session_id: &str) -> Result<SessionState> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RouterError::SessionNotFound(session_id.to_string()))?;
        if session.state != SessionState::Idle {
            return Err(RouterError::SessionNotIdle(session_id.to_string()));
        }

        session.started_at = Some(Utc::now());
        if session.ready_requests().is_empty() {
            warn!(session = session_id, "no ready sub-requests at start");
            session.state = SessionState::Initializing;
        } else {
            session.state = SessionState::Executing;
        }
        Ok(session.state)
    }

    /// Sub-requests whose dependencies are all satisfied.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown.
    pub fn get_ready_requests(&self, session_id: &str) -> Result<Vec<SubRequest>> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| RouterError::SessionNotFound(session_id.to_string()))?;
        Ok(session.ready_requests().into_iter().cloned().collect())
    }

    /// Mark a pending sub-request as running (dispatcher bookkeeping).
    ///
    /// # Errors
    ///
    /// Returns an error if the session or sub-request is unknown.
    pub fn mark_running(&self, session_id: &str, request_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RouterError::SessionNotFound(session_id.to_string()))?;
        let sub = session.sub_requests.get_mut(request_id).ok_or_else(|| {
            RouterError::SubRequestNotFound {
                session_id: session_id.to_string(),
                request_id: request_id.to_string(),
            }
        })?;
        if sub.status == SubRequestStatus::Pending {
            sub.status = SubRequestStatus::Running;
            sub.started_at = Some(Utc::now());
            session.state = SessionState::Executing;
        }
        Ok(())
    }

    /// Record a sub-request's successful result.
    ///
    /// # Errors
    ///
    /// Returns an error if the session or sub-request is unknown.
    pub fn complete_sub_request(
        &self,
        session_id: &str,
        request_id: &str,
        result: HashMap<String, Value>,
    ) -> Result<()> {
        self.finish_sub_request(session_id, request_id, Ok(result))
    }

    /// Record a sub-request failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the session or sub-request is unknown.
    pub fn fail_sub_request(&self, session_id: &str, request_id: &str, error: &str) -> Result<()> {
        self.finish_sub_request(session_id, request_id, Err(error.to_string()))
    }

    fn finish_sub_request(
        &self,
        session_id: &str,
        request_id: &str,
        outcome: std::result::Result<HashMap<String, Value>, String>,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RouterError::SessionNotFound(session_id.to_string()))?;
        if session.state == SessionState::Cancelled {
            // Completion callbacks become no-ops after cancellation.
            return Ok(());
        }
        let sub = session.sub_requests.get_mut(request_id).ok_or_else(|| {
            RouterError::SubRequestNotFound {
                session_id: session_id.to_string(),
                request_id: request_id.to_string(),
            }
        })?;
        if matches!(
            sub.status,
            SubRequestStatus::Completed | SubRequestStatus::Failed
        ) {
            warn!(
                session = session_id,
                request = request_id,
                "sub-request already finished"
            );
            return Ok(());
        }

        if sub.started_at.is_none() {
            sub.started_at = Some(Utc::now());
        }
        sub.completed_at = Some(Utc::now());
        match outcome {
            Ok(result) => {
                sub.status = SubRequestStatus::Completed;
                sub.result = Some(result);
                self.metrics.sub_requests_completed.inc();
            }
            Err(error) => {
                sub.status = SubRequestStatus::Failed;
                sub.error = Some(error);
                self.metrics.sub_requests_failed.inc();
            }
        }
        if let Some(duration) = sub.duration() {
            self.metrics
                .sub_request_duration
                .observe(duration.as_secs_f64());
        }

        self.check_session_completion(session);
        Ok(())
    }

    fn check_session_completion(&self, session: &mut OrchestrationSession) {
        if session.state.is_terminal()
            || session.running_count() > 0
            || session.has_viable_pending()
        {
            return;
        }
        let failed = session.failed_count();
        if failed == 0 && session.completed_count() < session.sub_requests.len() {
            // Only externally-blocked pending requests remain; the session
            // cannot finish cleanly but nothing has failed yet.
            session.state = SessionState::Waiting;
            return;
        }
        session.completed_at = Some(Utc::now());
        if failed > 0 {
            session.state = SessionState::Failed;
            session.error = Some(format!("{failed} sub-request(s) failed"));
            self.metrics.sessions_failed.inc();
        } else {
            session.state = SessionState::Completed;
            self.metrics.sessions_completed.inc();
        }
        self.metrics.active_sessions.dec();
        if let (Some(start), Some(end)) = (session.started_at, session.completed_at) {
            if let Ok(duration) = (end - start).to_std() {
                self.metrics.session_duration.observe(duration.as_secs_f64());
            }
        }
        info!(
            session = session.session_id,
            state = %session.state,
            "session finished"
        );
    }

    /// Cancel a session. Terminal and idempotent; later completion
    /// callbacks become no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown.
    pub fn cancel_session(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RouterError::SessionNotFound(session_id.to_string()))?;
        if session.state.is_terminal() {
            return Ok(());
        }
        session.state = SessionState::Cancelled;
        session.completed_at = Some(Utc::now());
        self.metrics.active_sessions.dec();
        info!(session = session_id, "cancelled orchestration session");
        Ok(())
    }

    /// Current state of a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown.
    pub fn session_state(&self, session_id: &str) -> Result<SessionState> {
        let sessions = self.sessions.lock();
        sessions
            .get(session_id)
            .map(|s| s.state)
            .ok_or_else(|| RouterError::SessionNotFound(session_id.to_string()))
    }

    /// Serializable status view.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown.
    pub fn get_session_status(&self, session_id: &str) -> Result<SessionStatus> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| RouterError::SessionNotFound(session_id.to_string()))?;
        Ok(SessionStatus {
            session_id: session.session_id.clone(),
            state: session.state,
            created_at: session.created_at,
            started_at: session.started_at,
            completed_at: session.completed_at,
            error: session.error.clone(),
            sub_requests: session
                .sub_requests
                .iter()
                .map(|(id, sub)| {
                    (
                        id.clone(),
                        SubRequestStatusView {
                            status: sub.status,
                            adapter_name: sub.adapter_name.clone(),
                            dependencies: sub.dependencies.clone(),
                            created_at: sub.created_at,
                            started_at: sub.started_at,
                            completed_at: sub.completed_at,
                            duration_s: sub.duration().map(|d| d.as_secs_f64()),
                            error: sub.error.clone(),
                        },
                    )
                })
                .collect(),
        })
    }

    /// A sub-request's recorded result map, when completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the session or sub-request is unknown.
    pub fn sub_request_result(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Result<Option<HashMap<String, Value>>> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| RouterError::SessionNotFound(session_id.to_string()))?;
        let sub = session.sub_requests.get(request_id).ok_or_else(|| {
            RouterError::SubRequestNotFound {
                session_id: session_id.to_string(),
                request_id: request_id.to_string(),
            }
        })?;
        Ok(sub.result.clone())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn result_map(text: &str) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("text".to_string(), Value::from(text));
        map
    }

    /// Build the r1 <- r2 <- r3 chain.
    fn chain() -> (SubRequestOrchestrator, String, [String; 3]) {
        let orchestrator = SubRequestOrchestrator::new();
        let session = orchestrator.create_session("multi-step question");
        let r1 = orchestrator
            .add_sub_request(&session, "step one", "adapter-a", vec![], None)
            .unwrap();
        let r2 = orchestrator
            .add_sub_request(&session, "step two", "adapter-a", vec![r1.clone()], None)
            .unwrap();
        let r3 = orchestrator
            .add_sub_request(&session, "step three", "adapter-b", vec![r2.clone()], None)
            .unwrap();
        (orchestrator, session, [r1, r2, r3])
    }

    #[test]
    fn test_dependency_chain_completes() {
        let (orchestrator, session, [r1, r2, r3]) = chain();

        assert_eq!(
            orchestrator.start_session(&session).unwrap(),
            SessionState::Executing
        );
        let ready: Vec<String> = orchestrator
            .get_ready_requests(&session)
            .unwrap()
            .into_iter()
            .map(|s| s.request_id)
            .collect();
        assert_eq!(ready, vec![r1.clone()]);

        orchestrator
            .complete_sub_request(&session, &r1, result_map("one"))
            .unwrap();
        let ready: Vec<String> = orchestrator
            .get_ready_requests(&session)
            .unwrap()
            .into_iter()
            .map(|s| s.request_id)
            .collect();
        assert_eq!(ready, vec![r2.clone()]);

        orchestrator
            .complete_sub_request(&session, &r2, result_map("two"))
            .unwrap();
        let ready: Vec<String> = orchestrator
            .get_ready_requests(&session)
            .unwrap()
            .into_iter()
            .map(|s| s.request_id)
            .collect();
        assert_eq!(ready, vec![r3.clone()]);

        orchestrator
            .complete_sub_request(&session, &r3, result_map("three"))
            .unwrap();
        assert_eq!(
            orchestrator.session_state(&session).unwrap(),
            SessionState::Completed
        );
        assert_eq!(
            orchestrator
                .sub_request_result(&session, &r2)
                .unwrap()
                .unwrap()["text"],
            "two"
        );
    }

    #[test]
    fn test_failure_fails_session_and_blocks_dependents() {
        let (orchestrator, session, [r1, r2, r3]) = chain();
        orchestrator.start_session(&session).unwrap();

        orchestrator
            .complete_sub_request(&session, &r1, result_map("one"))
            .unwrap();
        orchestrator
            .fail_sub_request(&session, &r2, "adapter timed out")
            .unwrap();

        // r3 depends on r2 and can never become ready, so the failure
        // terminates the session immediately.
        let status = orchestrator.get_session_status(&session).unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.error.as_deref(), Some("1 sub-request(s) failed"));
        assert_eq!(
            status.sub_requests[&r3].status,
            SubRequestStatus::Pending
        );
        assert!(orchestrator.get_ready_requests(&session).unwrap().is_empty());
    }

    #[test]
    fn test_single_failure_message() {
        let orchestrator = SubRequestOrchestrator::new();
        let session = orchestrator.create_session("p");
        let r1 = orchestrator
            .add_sub_request(&session, "only", "a", vec![], None)
            .unwrap();
        orchestrator.start_session(&session).unwrap();
        orchestrator.fail_sub_request(&session, &r1, "boom").unwrap();

        let status = orchestrator.get_session_status(&session).unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.error.as_deref(), Some("1 sub-request(s) failed"));
    }

    #[test]
    fn test_external_dependency_never_ready() {
        let orchestrator = SubRequestOrchestrator::new();
        let session = orchestrator.create_session("p");
        orchestrator
            .add_sub_request(&session, "blocked", "a", vec!["ghost-req".to_string()], None)
            .unwrap();

        assert_eq!(
            orchestrator.start_session(&session).unwrap(),
            SessionState::Initializing
        );
        assert!(orchestrator.get_ready_requests(&session).unwrap().is_empty());
    }

    #[test]
    fn test_cancel_is_terminal_and_idempotent() {
        let (orchestrator, session, [r1, _, _]) = chain();
        orchestrator.start_session(&session).unwrap();

        orchestrator.cancel_session(&session).unwrap();
        assert_eq!(
            orchestrator.session_state(&session).unwrap(),
            SessionState::Cancelled
        );
        // Idempotent.
        orchestrator.cancel_session(&session).unwrap();
        assert_eq!(
            orchestrator.session_state(&session).unwrap(),
            SessionState::Cancelled
        );

        // Completion callbacks are no-ops after cancellation.
        orchestrator
            .complete_sub_request(&session, &r1, result_map("late"))
            .unwrap();
        assert!(orchestrator
            .sub_request_result(&session, &r1)
            .unwrap()
            .is_none());
        assert!(orchestrator.get_ready_requests(&session).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_session_and_request_are_typed_errors() {
        let orchestrator = SubRequestOrchestrator::new();
        assert!(matches!(
            orchestrator.start_session("ghost"),
            Err(RouterError::SessionNotFound(_))
        ));

        let session = orchestrator.create_session("p");
        assert!(matches!(
            orchestrator.complete_sub_request(&session, "ghost", HashMap::new()),
            Err(RouterError::SubRequestNotFound { .. })
        ));
    }

    #[test]
    fn test_add_to_completed_session_rejected() {
        let orchestrator = SubRequestOrchestrator::new();
        let session = orchestrator.create_session("p");
        let r1 = orchestrator
            .add_sub_request(&session, "only", "a", vec![], None)
            .unwrap();
        orchestrator.start_session(&session).unwrap();
        orchestrator
            .complete_sub_request(&session, &r1, result_map("done"))
            .unwrap();

        assert!(matches!(
            orchestrator.add_sub_request(&session, "late", "a", vec![], None),
            Err(RouterError::SessionCompleted(_))
        ));
    }

    #[test]
    fn test_parallel_roots_both_ready() {
        let orchestrator = SubRequestOrchestrator::new();
        let session = orchestrator.create_session("p");
        orchestrator
            .add_sub_request(&session, "a", "x", vec![], None)
            .unwrap();
        orchestrator
            .add_sub_request(&session, "b", "x", vec![], None)
            .unwrap();
        orchestrator.start_session(&session).unwrap();
        assert_eq!(orchestrator.get_ready_requests(&session).unwrap().len(), 2);
    }
}
