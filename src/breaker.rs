//! Per-backend circuit breaker
//!
//! Three-state failure isolator: Closed admits everything, Open rejects
//! until the reset timeout elapses, HalfOpen admits probes whose outcome
//! decides between Closed and Open. Upstream statuses >= 500 (including
//! synthesized 502/504 for network errors) count as failures; 4xx does not
//! indicate backend failure and resets the counter.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold,
            reset_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Admission check. In Open, the first call after the reset timeout
    /// moves to HalfOpen and admits the probe. HalfOpen admits concurrent
    /// probes; single-flight is not enforced.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let expired = inner
                .last_failure
                .is_some_and(|at| at.elapsed() > self.reset_timeout);
            if expired {
                inner.state = CircuitState::HalfOpen;
                info!("Circuit breaker entering half-open state");
                return true;
            }
            return false;
        }
        // Closed, or HalfOpen admitting the probe
        true
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                info!("Circuit breaker recovered, closing");
            }
            CircuitState::Closed => inner.failures = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.last_failure = Some(Instant::now());
            warn!("Circuit breaker probe failed, re-opening");
        } else {
            inner.failures += 1;
            if inner.failures >= self.threshold {
                inner.state = CircuitState::Open;
                inner.last_failure = Some(Instant::now());
                warn!(failures = inner.failures, "Circuit breaker tripped open");
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }
}
