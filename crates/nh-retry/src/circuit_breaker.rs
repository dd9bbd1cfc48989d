//! Circuit breaker for unhealthy platforms.
//!
//! Three-state gate: closed (normal), open (requests suppressed until the
//! reset timeout elapses), half-open (a probe decides). Driven by the
//! injected clock so tests advance time deterministically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use nh_common::{Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    next_retry_at: Option<Instant>,
}

/// Snapshot for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Milliseconds until an open breaker half-opens; 0 otherwise.
    pub retry_in_ms: u64,
}

pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self::with_clock(threshold, timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(threshold: u32, timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold: threshold.max(1),
            timeout,
            clock,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                next_retry_at: None,
            }),
        }
    }

    /// Current state. Reading performs the open -> half-open transition
    /// once the reset timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        {
            let inner = self.inner.read();
            match inner.state {
                CircuitState::Open => {
                    let due = inner.next_retry_at.map(|t| now >= t).unwrap_or(false);
                    if !due {
                        return CircuitState::Open;
                    }
                }
                state => return state,
            }
        }
        let mut inner = self.inner.write();
        // Re-check under the write lock; another reader may have moved us.
        if inner.state == CircuitState::Open
            && inner.next_retry_at.map(|t| now >= t).unwrap_or(false)
        {
            inner.state = CircuitState::HalfOpen;
            debug!("circuit breaker transitioning to half-open");
        }
        inner.state
    }

    /// Whether a request may proceed. Half-open admits probes.
    pub fn should_allow(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.next_retry_at = None;
                info!("circuit breaker closed after half-open success");
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.threshold {
                    inner.state = CircuitState::Open;
                    inner.next_retry_at = Some(now + self.timeout);
                    warn!(
                        failures = inner.failure_count,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.failure_count += 1;
                inner.next_retry_at = Some(now + self.timeout);
                warn!("circuit breaker re-opened on half-open failure");
            }
            CircuitState::Open => {
                // Late failures while open push the retry window out.
                inner.next_retry_at = Some(now + self.timeout);
            }
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.read().failure_count
    }

    pub fn snapshot(&self) -> CircuitBreakerStats {
        let state = self.state();
        let inner = self.inner.read();
        let retry_in_ms = match (state, inner.next_retry_at) {
            (CircuitState::Open, Some(at)) => {
                at.saturating_duration_since(self.clock.now()).as_millis() as u64
            }
            _ => 0,
        };
        CircuitBreakerStats {
            state,
            failure_count: inner.failure_count,
            retry_in_ms,
        }
    }
}
