//! Anti-replay nonce store.

use atp_observability::events::{EventBus, RejectionEvent, RejectionReason};
use atp_observability::metric_names::METRIC_REPLAY_REJECT_TOTAL;
use atp_observability::metrics;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

struct NonceState {
    slots: HashMap<String, f64>,
    queue: VecDeque<String>,
}

/// Fixed-capacity nonce set with TTL.
///
/// `check_and_store` admits a nonce exactly once within its TTL. Every call
/// prunes expired entries and, past capacity, the oldest ones; a nonce
/// evicted by either path is accepted again. Amortized O(1) per call,
/// worst case bounded by capacity.
pub struct NonceStore {
    ttl_s: f64,
    cap: usize,
    state: Mutex<NonceState>,
    bus: Arc<EventBus>,
    replay_total: prometheus::Counter,
}

impl std::fmt::Debug for NonceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceStore")
            .field("ttl_s", &self.ttl_s)
            .field("cap", &self.cap)
            .finish()
    }
}

impl NonceStore {
    /// Create a store with the given TTL (seconds) and capacity.
    #[must_use]
    pub fn new(ttl_s: f64, cap: usize, bus: Arc<EventBus>) -> Self {
        Self {
            ttl_s,
            cap,
            state: Mutex::new(NonceState {
                slots: HashMap::new(),
                queue: VecDeque::new(),
            }),
            bus,
            replay_total: metrics::counter(
                METRIC_REPLAY_REJECT_TOTAL,
                "Total requests rejected by the replay guard",
            ),
        }
    }

    /// Defaults: 60 s TTL, 10 000 entries.
    #[must_use]
    pub fn with_defaults(bus: Arc<EventBus>) -> Self {
        Self::new(60.0, 10_000, bus)
    }

    /// Record `nonce` iff it is not already present and unexpired.
    ///
    /// Returns `true` when the nonce was fresh and is now stored; `false`
    /// on replay, in which case a `replay_detected` rejection event is
    /// emitted and the replay counter incremented.
    pub fn check_and_store(&self, nonce: &str, request_id: Option<&str>) -> bool {
        self.check_and_store_at(nonce, now_epoch_seconds(), request_id)
    }

    /// [`NonceStore::check_and_store`] with an explicit clock, for tests.
    pub fn check_and_store_at(&self, nonce: &str, now: f64, request_id: Option<&str>) -> bool {
        let mut state = self.state.lock();
        self.prune(&mut state, now);

        if state.slots.contains_key(nonce) {
            self.replay_total.inc();
            let mut event = RejectionEvent::new(RejectionReason::ReplayDetected, "replay_guard")
                .with_detail("nonce", serde_json::json!(nonce))
                .with_detail("detected_at", serde_json::json!(now));
            if let Some(id) = request_id {
                event = event.with_request_id(id);
            }
            self.bus.emit_rejection(event);
            return false;
        }

        state.slots.insert(nonce.to_string(), now);
        state.queue.push_back(nonce.to_string());
        self.prune(&mut state, now);
        true
    }

    fn prune(&self, state: &mut NonceState, now: f64) {
        while let Some(front) = state.queue.front() {
            let inserted = state.slots.get(front).copied().unwrap_or(now);
            if now - inserted > self.ttl_s {
                let key = state.queue.pop_front().unwrap_or_default();
                state.slots.remove(&key);
            } else {
                break;
            }
        }
        while state.queue.len() > self.cap {
            let key = state.queue.pop_front().unwrap_or_default();
            state.slots.remove(&key);
        }
    }

    /// Number of stored nonces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }
}

fn now_epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use atp_observability::events::BusEvent;

    fn store(ttl_s: f64, cap: usize) -> (NonceStore, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        (NonceStore::new(ttl_s, cap, Arc::clone(&bus)), bus)
    }

    #[test]
    fn test_replay_within_ttl_is_rejected() {
        let (store, bus) = store(60.0, 100);
        let replays = Arc::new(parking_lot::Mutex::new(0));
        {
            let replays = Arc::clone(&replays);
            bus.subscribe(move |event| {
                if let BusEvent::Rejection(r) = event {
                    assert_eq!(r.component, "replay_guard");
                    *replays.lock() += 1;
                }
            });
        }

        assert!(store.check_and_store_at("N1", 100.0, Some("r1")));
        // 100 ms later, same nonce.
        assert!(!store.check_and_store_at("N1", 100.1, Some("r2")));
        assert_eq!(*replays.lock(), 1);
    }

    #[test]
    fn test_expired_nonce_is_accepted_again() {
        let (store, _) = store(60.0, 100);
        assert!(store.check_and_store_at("N1", 100.0, None));
        assert!(store.check_and_store_at("N1", 161.0, None));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let (store, _) = store(3600.0, 3);
        for (i, t) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            assert!(store.check_and_store_at(i, t, None));
        }
        // Inserting a fourth evicts "a"; "a" is accepted again.
        assert!(store.check_and_store_at("d", 4.0, None));
        assert_eq!(store.len(), 3);
        assert!(store.check_and_store_at("a", 5.0, None));
        // And now "b" has been evicted in turn.
        assert!(store.check_and_store_at("b", 6.0, None));
    }

    #[test]
    fn test_distinct_nonces_all_admitted() {
        let (store, _) = store(60.0, 100);
        for i in 0..50 {
            assert!(store.check_and_store_at(&format!("nonce-{i}"), 1.0 + f64::from(i), None));
        }
        assert_eq!(store.len(), 50);
    }
}
