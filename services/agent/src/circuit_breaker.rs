//! Circuit breaker for the market-data gateway
//!
//! Consecutive provider failures open the breaker; while open, gateway calls
//! fail fast with `AgentError::CircuitOpen` and the cycle falls back to
//! profile data. After a cooldown the breaker half-opens and a few successes
//! close it again.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing, calls are rejected until the cooldown passes.
    Open,
    /// Probing recovery, limited calls allowed.
    HalfOpen,
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Cooldown before probing recovery.
    pub recovery_cooldown: Duration,
    /// Successes required to close from half-open.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_cooldown: Duration::seconds(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<DateTime<Utc>>,
}

/// Thread-safe consecutive-failure breaker.
///
/// Time is passed in by the caller so the breaker follows the injected
/// clock in tests.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed at `now`. Transitions Open to HalfOpen
    /// when the cooldown has elapsed.
    pub fn allow(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| now - at >= self.config.recovery_cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    info!("Gateway circuit breaker half-open, probing provider");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    info!("Gateway circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        failures = inner.consecutive_failures,
                        "Gateway circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!("Gateway circuit breaker reopened from half-open");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_cooldown: Duration::seconds(60),
            success_threshold: 2,
        })
    }

    #[test]
    fn opens_after_threshold_and_recovers() {
        let b = breaker();
        let t0 = Utc::now();

        for _ in 0..3 {
            assert!(b.allow(t0));
            b.record_failure(t0);
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allow(t0 + Duration::seconds(10)));

        // Cooldown elapsed: half-open, then two successes close it.
        assert!(b.allow(t0 + Duration::seconds(61)));
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker();
        let t0 = Utc::now();
        for _ in 0..3 {
            b.record_failure(t0);
        }
        assert!(b.allow(t0 + Duration::seconds(61)));
        b.record_failure(t0 + Duration::seconds(62));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = breaker();
        let t0 = Utc::now();
        b.record_failure(t0);
        b.record_failure(t0);
        b.record_success();
        b.record_failure(t0);
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
