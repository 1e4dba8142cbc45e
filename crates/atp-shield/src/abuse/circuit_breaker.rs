// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Per-(tenant, endpoint) circuit breakers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, Error)]
pub enum CircuitBreakerError {
    /// The breaker is open; retry after the recovery timeout.
    #[error("circuit breaker is open")]
    Open,
    /// The half-open call budget is spent.
    #[error("circuit breaker half-open call budget exhausted")]
    HalfOpenExhausted,
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    half_open_calls: u32,
    last_failure: Option<Instant>,
}

/// A circuit breaker with the standard closed/open/half-open semantics.
///
/// Closed: calls flow, failures count. Open: calls are refused until the
/// recovery timeout elapses, then the breaker moves to half-open. Half-open:
/// at most `half_open_max_calls` trial calls are admitted; a success closes
/// the breaker, a failure re-opens it.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failure_threshold", &self.failure_threshold)
            .finish()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60), 3)
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            half_open_max_calls,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                half_open_calls: 0,
                last_failure: None,
            }),
        }
    }

    /// Current state, accounting for recovery-timeout expiry.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Current failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            let elapsed_recovery = inner
                .last_failure
                .map_or(true, |at| at.elapsed() >= self.recovery_timeout);
            if elapsed_recovery {
                inner.state = BreakerState::HalfOpen;
                inner.half_open_calls = 0;
                info!("circuit breaker half-open");
            }
        }
    }

    /// Reserve permission for one call.
    ///
    /// # Errors
    ///
    /// Refuses when open (until the recovery timeout) or when the half-open
    /// budget is spent.
    pub fn try_acquire(&self) -> Result<(), CircuitBreakerError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(CircuitBreakerError::Open),
            BreakerState::HalfOpen => {
                if inner.half_open_calls >= self.half_open_max_calls {
                    return Err(CircuitBreakerError::HalfOpenExhausted);
                }
                inner.half_open_calls += 1;
                Ok(())
            }
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        if inner.state == BreakerState::HalfOpen {
            info!("circuit breaker closed after successful trial call");
        }
        inner.state = BreakerState::Closed;
    }

    /// Record a failed call.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        if inner.state == BreakerState::HalfOpen
            || inner.failure_count >= self.failure_threshold
        {
            if inner.state != BreakerState::Open {
                warn!(failures = inner.failure_count, "circuit breaker opened");
            }
            inner.state = BreakerState::Open;
        }
    }

    /// Run `f` under the breaker, feeding its outcome back.
    ///
    /// # Errors
    ///
    /// Returns the breaker refusal without invoking `f`; the inner result
    /// is `f`'s own outcome.
    pub fn call<T, E>(
        &self,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<Result<T, E>, CircuitBreakerError> {
        self.try_acquire()?;
        let outcome = f();
        match &outcome {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        Ok(outcome)
    }
}
