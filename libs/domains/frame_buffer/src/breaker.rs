//! Circuit Breaker Manager (C4): one breaker per processor id, created
//! lazily on first failure/selection. The single-breaker state machine
//! (RwLock-guarded state, AtomicU32 counters) is generalized to a
//! registry keyed by processor id.

use crate::config::CircuitBreakerManagerConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Explicit discriminants give `set_breaker_state` a stable numeric
/// encoding to publish, the same convention `PressureLevel` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

/// Per-processor breaker state machine.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    half_open_max_calls: u32,

    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    successes_in_half_open: AtomicU32,
    half_open_calls: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerManagerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_secs(config.recovery_timeout_s),
            success_threshold: config.success_threshold,
            half_open_max_calls: config.half_open_max_calls,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            successes_in_half_open: AtomicU32::new(0),
            half_open_calls: AtomicU32::new(0),
            opened_at: RwLock::new(None),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read().unwrap()
    }

    /// Whether a call may be attempted right now. Transitions OPEN -> HALF_OPEN
    /// when the recovery timeout has elapsed.
    pub fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                self.half_open_calls.load(Ordering::SeqCst) < self.half_open_max_calls
            }
            CircuitState::Open => {
                if self.should_attempt_reset() {
                    self.transition_to_half_open();
                    true
                } else {
                    false
                }
            }
        }
    }

    fn should_attempt_reset(&self) -> bool {
        let opened_at = *self.opened_at.read().unwrap();
        match opened_at {
            Some(t) => t.elapsed() >= self.recovery_timeout,
            None => true,
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                self.half_open_calls.fetch_add(1, Ordering::SeqCst);
                let successes = self.successes_in_half_open.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.success_threshold {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                self.half_open_calls.fetch_add(1, Ordering::SeqCst);
                self.transition_to_open();
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_open(&self) {
        *self.state.write().unwrap() = CircuitState::Open;
        *self.opened_at.write().unwrap() = Some(Instant::now());
        self.successes_in_half_open.store(0, Ordering::SeqCst);
        self.half_open_calls.store(0, Ordering::SeqCst);
        warn!("circuit breaker opened");
    }

    fn transition_to_half_open(&self) {
        *self.state.write().unwrap() = CircuitState::HalfOpen;
        self.successes_in_half_open.store(0, Ordering::SeqCst);
        self.half_open_calls.store(0, Ordering::SeqCst);
        info!("circuit breaker half-open");
    }

    fn transition_to_closed(&self) {
        *self.state.write().unwrap() = CircuitState::Closed;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.successes_in_half_open.store(0, Ordering::SeqCst);
        *self.opened_at.write().unwrap() = None;
        info!("circuit breaker closed");
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

/// Lazily populated map of per-processor breakers, exposing the
/// `is_available`/`available_subset` queries the router consults on every
/// selection.
pub struct CircuitBreakerManager {
    config: CircuitBreakerManagerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerManagerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn breaker_for(&self, processor_id: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().unwrap().get(processor_id) {
            return b.clone();
        }
        let mut guard = self.breakers.write().unwrap();
        guard
            .entry(processor_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(&self.config)))
            .clone()
    }

    pub fn is_available(&self, processor_id: &str) -> bool {
        self.breaker_for(processor_id).can_execute()
    }

    pub fn available_subset<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        ids.into_iter().filter(|id| self.is_available(id)).collect()
    }

    pub fn state_of(&self, processor_id: &str) -> CircuitState {
        self.breaker_for(processor_id).state()
    }

    pub fn record_success(&self, processor_id: &str) {
        self.breaker_for(processor_id).record_success();
    }

    pub fn record_failure(&self, processor_id: &str) {
        self.breaker_for(processor_id).record_failure();
    }

    pub fn snapshot(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .read()
            .unwrap()
            .iter()
            .map(|(id, b)| (id.clone(), b.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerManagerConfig {
        CircuitBreakerManagerConfig {
            failure_threshold: 3,
            recovery_timeout_s: 0,
            success_threshold: 2,
            half_open_max_calls: 2,
        }
    }

    #[test]
    fn starts_closed() {
        let mgr = CircuitBreakerManager::new(test_config());
        assert!(mgr.is_available("p1"));
        assert_eq!(mgr.state_of("p1"), CircuitState::Closed);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let mgr = CircuitBreakerManager::new(test_config());
        mgr.record_failure("p1");
        mgr.record_failure("p1");
        assert_eq!(mgr.state_of("p1"), CircuitState::Closed);
        mgr.record_failure("p1");
        assert_eq!(mgr.state_of("p1"), CircuitState::Open);
        assert!(!mgr.is_available("p1"));
    }

    #[test]
    fn success_resets_failure_count_when_closed() {
        let mgr = CircuitBreakerManager::new(test_config());
        mgr.record_failure("p1");
        mgr.record_failure("p1");
        mgr.record_success("p1");
        assert_eq!(mgr.breaker_for("p1").consecutive_failures(), 0);
    }

    #[test]
    fn half_open_closes_on_enough_successes() {
        let mgr = CircuitBreakerManager::new(test_config());
        mgr.record_failure("p1");
        mgr.record_failure("p1");
        mgr.record_failure("p1");
        assert_eq!(mgr.state_of("p1"), CircuitState::Open);

        // recovery_timeout_s = 0, so the next availability check flips to half-open.
        assert!(mgr.is_available("p1"));
        assert_eq!(mgr.state_of("p1"), CircuitState::HalfOpen);

        mgr.record_success("p1");
        mgr.record_success("p1");
        assert_eq!(mgr.state_of("p1"), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_on_failure() {
        let mgr = CircuitBreakerManager::new(test_config());
        mgr.record_failure("p1");
        mgr.record_failure("p1");
        mgr.record_failure("p1");
        assert!(mgr.is_available("p1"));
        assert_eq!(mgr.state_of("p1"), CircuitState::HalfOpen);

        mgr.record_failure("p1");
        assert_eq!(mgr.state_of("p1"), CircuitState::Open);
    }

    #[test]
    fn available_subset_filters_open_breakers() {
        let mgr = CircuitBreakerManager::new(test_config());
        mgr.record_failure("bad");
        mgr.record_failure("bad");
        mgr.record_failure("bad");

        let subset = mgr.available_subset(["good", "bad"]);
        assert_eq!(subset, vec!["good"]);
    }

    #[test]
    fn breakers_are_independent_per_processor() {
        let mgr = CircuitBreakerManager::new(test_config());
        mgr.record_failure("p1");
        mgr.record_failure("p1");
        mgr.record_failure("p1");
        assert_eq!(mgr.state_of("p1"), CircuitState::Open);
        assert_eq!(mgr.state_of("p2"), CircuitState::Closed);
    }
}
