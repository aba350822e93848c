//! Adapter-level circuit breaker.
//!
//! After `failure_threshold` consecutive execute failures the circuit
//! opens and calls fail fast with `ADAPTER_CIRCUIT_OPEN` without touching
//! the backend. After `open_duration` a single half-open probe is allowed:
//! success closes the circuit, failure reopens it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use ta_domain::awareness::{Awareness, StateSnapshot};
use ta_domain::config::BreakerConfig;
use ta_domain::error::{ErrorCode, Result};

use crate::traits::{
    ActionAdapter, ActionDefinition, ActionResult, AwarenessOptions, ConnectionState, StateOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    /// One probe may be in flight; concurrent callers are rejected.
    HalfOpen { probe_in_flight: bool },
}

/// Thread-safe three-state circuit breaker. Shared by every caller of
/// the adapter it guards.
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            open_duration: Duration::from_millis(config.open_duration_ms),
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        match *self.inner.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Ask permission for one call. `false` means fail fast.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed { .. } => true,
            Inner::Open { since } => {
                if since.elapsed() >= self.open_duration {
                    *inner = Inner::HalfOpen {
                        probe_in_flight: true,
                    };
                    true
                } else {
                    false
                }
            }
            Inner::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    false
                } else {
                    *probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.failure_threshold {
                    tracing::warn!(
                        failures = *consecutive_failures,
                        "circuit breaker opened"
                    );
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                }
            }
            // A failed half-open probe reopens the circuit.
            Inner::HalfOpen { .. } => {
                tracing::warn!("half-open probe failed, circuit reopened");
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wrapper adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wraps any adapter with a shared circuit breaker over `execute`.
/// Reads (`get_state`, `get_awareness`) are not gated: a broken write
/// path should not blind the engine.
pub struct BreakerAdapter<A: ActionAdapter> {
    inner: A,
    breaker: Arc<CircuitBreaker>,
}

impl<A: ActionAdapter> BreakerAdapter<A> {
    pub fn new(inner: A, config: &BreakerConfig) -> Self {
        Self {
            inner,
            breaker: Arc::new(CircuitBreaker::new(config)),
        }
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }
}

#[async_trait::async_trait]
impl<A: ActionAdapter> ActionAdapter for BreakerAdapter<A> {
    async fn connect(&self) -> Result<bool> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    async fn execute(&self, action: &str, params: Value) -> ActionResult {
        if !self.breaker.try_acquire() {
            return ActionResult::err(
                ErrorCode::AdapterCircuitOpen,
                "circuit open after repeated backend failures",
            );
        }

        let result = self.inner.execute(action, params).await;
        if result.success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
        result
    }

    async fn get_state(&self, opts: StateOptions) -> Result<StateSnapshot> {
        self.inner.get_state(opts).await
    }

    async fn get_awareness(&self, opts: AwarenessOptions) -> Result<Awareness> {
        self.inner.get_awareness(opts).await
    }

    fn available_actions(&self) -> Vec<ActionDefinition> {
        self.inner.available_actions()
    }

    fn domain(&self) -> &str {
        self.inner.domain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, open_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(&BreakerConfig {
            failure_threshold: threshold,
            open_duration_ms: open_ms,
        })
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker(5, 30_000);
        for _ in 0..4 {
            assert!(cb.try_acquire());
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(cb.try_acquire());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());
    }

    #[test]
    fn success_resets_failure_streak() {
        let cb = breaker(3, 30_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_allows_single_probe() {
        let cb = breaker(1, 0); // zero duration: immediately probe-able
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // First caller gets the probe, the second is rejected.
        assert!(cb.try_acquire());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.try_acquire());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
    }

    #[test]
    fn failed_probe_reopens() {
        let cb = breaker(1, 0);
        cb.record_failure();
        assert!(cb.try_acquire());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn stays_open_for_configured_duration() {
        let cb = breaker(1, 60_000);
        cb.record_failure();
        // Open duration has not elapsed: every acquire is rejected.
        for _ in 0..10 {
            assert!(!cb.try_acquire());
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
