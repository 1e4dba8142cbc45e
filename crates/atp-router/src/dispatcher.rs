//! Bounded-parallel dispatch of ready sub-requests onto adapters.

use crate::error::{Result, RouterError};
use crate::orchestrator::{SessionState, SubRequest, SubRequestOrchestrator};
use atp_adapter::{AdapterService, PromptRequest, StreamChunk};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Drives a session to a terminal state by running ready sub-requests on
/// their adapters, at most `max_parallel` at a time.
///
/// The orchestrator decides readiness; the dispatcher only supplies
/// parallelism, per-sub-request timeouts, and completion reporting.
pub struct Dispatcher {
    orchestrator: Arc<SubRequestOrchestrator>,
    adapters: HashMap<String, Arc<dyn AdapterService>>,
    max_parallel: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("adapters", &self.adapters.len())
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher over an orchestrator.
    #[must_use]
    pub fn new(orchestrator: Arc<SubRequestOrchestrator>, max_parallel: usize) -> Self {
        Self {
            orchestrator,
            adapters: HashMap::new(),
            max_parallel: max_parallel.max(1),
        }
    }

    /// Register an adapter under its dispatch name.
    #[must_use]
    pub fn with_adapter(mut self, name: &str, adapter: Arc<dyn AdapterService>) -> Self {
        self.adapters.insert(name.to_string(), adapter);
        self
    }

    /// Run a session until it reaches a terminal state (or stalls on
    /// dependencies that can never be satisfied).
    ///
    /// # Errors
    ///
    /// Returns an error for unknown sessions; sub-request failures are
    /// reported into the orchestrator, not surfaced here.
    pub async fn run_session(&self, session_id: &str) -> Result<SessionState> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut join_set: JoinSet<(String, std::result::Result<HashMap<String, Value>, String>)> =
            JoinSet::new();

        loop {
            let state = self.orchestrator.session_state(session_id)?;
            if state.is_terminal() {
                break;
            }

            for sub in self.orchestrator.get_ready_requests(session_id)? {
                self.orchestrator.mark_running(session_id, &sub.request_id)?;
                let request_id = sub.request_id.clone();
                match self.adapters.get(&sub.adapter_name) {
                    Some(adapter) => {
                        let adapter = Arc::clone(adapter);
                        let permit = Arc::clone(&semaphore)
                            .acquire_owned()
                            .await
                            .map_err(|_| RouterError::Cancelled)?;
                        debug!(session = session_id, request = request_id, "dispatching");
                        join_set.spawn(async move {
                            let outcome = run_sub_request(adapter.as_ref(), &sub).await;
                            drop(permit);
                            (request_id, outcome)
                        });
                    }
                    None => {
                        warn!(
                            session = session_id,
                            request = request_id,
                            adapter = sub.adapter_name,
                            "no adapter registered"
                        );
                        self.orchestrator.fail_sub_request(
                            session_id,
                            &request_id,
                            &format!("no adapter registered for {}", sub.adapter_name),
                        )?;
                    }
                }
            }

            match join_set.join_next().await {
                Some(Ok((request_id, Ok(result)))) => {
                    self.orchestrator
                        .complete_sub_request(session_id, &request_id, result)?;
                }
                Some(Ok((request_id, Err(error)))) => {
                    self.orchestrator
                        .fail_sub_request(session_id, &request_id, &error)?;
                }
                Some(Err(join_error)) => {
                    warn!(session = session_id, error = %join_error, "dispatch task panicked");
                }
                None => {
                    // Nothing in flight and nothing became ready: either the
                    // session just finished, or it is stalled on external
                    // dependencies.
                    let state = self.orchestrator.session_state(session_id)?;
                    if !state.is_terminal() {
                        warn!(session = session_id, state = %state, "session stalled");
                        return Ok(state);
                    }
                    break;
                }
            }
        }

        self.orchestrator.session_state(session_id)
    }
}

/// Run one sub-request against its adapter, within its timeout.
async fn run_sub_request(
    adapter: &dyn AdapterService,
    sub: &SubRequest,
) -> std::result::Result<HashMap<String, Value>, String> {
    let prompt = PromptRequest::new(&sub.prompt);
    let work = async {
        let mut stream = adapter.stream(&prompt).await.map_err(|e| e.to_string())?;
        let mut text = String::new();
        let mut chunks = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            if chunk.is_error() {
                return Err(chunk
                    .error_message()
                    .unwrap_or_else(|| "adapter error".to_string()));
            }
            if let Some(piece) = StreamChunk::text_content(&chunk) {
                text.push_str(&piece);
            }
            chunks += 1;
            if !chunk.more {
                break;
            }
        }
        let mut result = HashMap::new();
        result.insert("text".to_string(), Value::from(text));
        result.insert("chunks".to_string(), Value::from(chunks));
        result.insert("adapter".to_string(), Value::from(adapter.name()));
        Ok(result)
    };

    match tokio::time::timeout(sub.timeout, work).await {
        Ok(outcome) => outcome,
        Err(_) => Err(format!(
            "sub-request timed out after {:.1} s",
            sub.timeout.as_secs_f64()
        )),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use atp_adapter::MockAdapter;
    use std::time::Duration;

    #[tokio::test]
    async fn test_chain_runs_to_completion() {
        let orchestrator = Arc::new(SubRequestOrchestrator::new());
        let session = orchestrator.create_session("question");
        let r1 = orchestrator
            .add_sub_request(&session, "step one", "fast", vec![], None)
            .unwrap();
        let r2 = orchestrator
            .add_sub_request(&session, "step two", "fast", vec![r1], None)
            .unwrap();
        orchestrator.start_session(&session).unwrap();

        let dispatcher = Dispatcher::new(Arc::clone(&orchestrator), 4).with_adapter(
            "fast",
            Arc::new(MockAdapter::new("fast").with_default_response("answer text")),
        );

        let state = dispatcher.run_session(&session).await.unwrap();
        assert_eq!(state, SessionState::Completed);
        let result = orchestrator
            .sub_request_result(&session, &r2)
            .unwrap()
            .unwrap();
        assert_eq!(result["text"], "answer text");
        assert_eq!(result["adapter"], "fast");
    }

    #[tokio::test]
    async fn test_parallel_fanout() {
        let orchestrator = Arc::new(SubRequestOrchestrator::new());
        let session = orchestrator.create_session("fanout");
        for i in 0..6 {
            orchestrator
                .add_sub_request(&session, &format!("branch {i}"), "fast", vec![], None)
                .unwrap();
        }
        orchestrator.start_session(&session).unwrap();

        let adapter = Arc::new(MockAdapter::new("fast").with_latency_ms(10));
        let dispatcher =
            Dispatcher::new(Arc::clone(&orchestrator), 3).with_adapter("fast", adapter);

        let state = dispatcher.run_session(&session).await.unwrap();
        assert_eq!(state, SessionState::Completed);
    }

    #[tokio::test]
    async fn test_adapter_error_fails_session() {
        let orchestrator = Arc::new(SubRequestOrchestrator::new());
        let session = orchestrator.create_session("doomed");
        orchestrator
            .add_sub_request(&session, "will fail", "flaky", vec![], None)
            .unwrap();
        orchestrator.start_session(&session).unwrap();

        let adapter = Arc::new(
            MockAdapter::new("flaky")
                .with_default_response("a b c")
                .with_stream_error(1, "backend exploded"),
        );
        let dispatcher =
            Dispatcher::new(Arc::clone(&orchestrator), 2).with_adapter("flaky", adapter);

        let state = dispatcher.run_session(&session).await.unwrap();
        assert_eq!(state, SessionState::Failed);
        let status = orchestrator.get_session_status(&session).unwrap();
        assert!(status
            .sub_requests
            .values()
            .any(|s| s.error.as_deref() == Some("backend exploded")));
    }

    #[tokio::test]
    async fn test_missing_adapter_fails_sub_request() {
        let orchestrator = Arc::new(SubRequestOrchestrator::new());
        let session = orchestrator.create_session("p");
        orchestrator
            .add_sub_request(&session, "step", "ghost-adapter", vec![], None)
            .unwrap();
        orchestrator.start_session(&session).unwrap();

        let dispatcher = Dispatcher::new(Arc::clone(&orchestrator), 2);
        let state = dispatcher.run_session(&session).await.unwrap();
        assert_eq!(state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_sub_request_timeout() {
        let orchestrator = Arc::new(SubRequestOrchestrator::new());
        let session = orchestrator.create_session("slow");
        orchestrator
            .add_sub_request(
                &session,
                "step",
                "slow",
                vec![],
                Some(Duration::from_millis(20)),
            )
            .unwrap();
        orchestrator.start_session(&session).unwrap();

        let adapter = Arc::new(MockAdapter::new("slow").with_latency_ms(200));
        let dispatcher =
            Dispatcher::new(Arc::clone(&orchestrator), 2).with_adapter("slow", adapter);

        let state = dispatcher.run_session(&session).await.unwrap();
        assert_eq!(state, SessionState::Failed);
        let status = orchestrator.get_session_status(&session).unwrap();
        assert!(status
            .sub_requests
            .values()
            .any(|s| s.error.as_deref().is_some_and(|e| e.contains("timed out"))));
    }
}
