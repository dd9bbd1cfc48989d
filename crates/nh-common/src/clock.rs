//! Clock abstraction so every time-based policy can be faked in tests.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Injected time source. `sleep` is the only suspension primitive the
/// rate limiters, circuit breakers and retry executor use.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Real time, sleeping on the tokio timer (and therefore compatible with
/// `tokio::time::pause` in tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug)]
struct Sleeper {
    deadline: Duration,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
struct MockState {
    offset: Duration,
    sleepers: Vec<Sleeper>,
}

/// Manually-driven clock. Time only moves through [`MockClock::advance`],
/// which wakes every sleeper whose deadline has passed.
#[derive(Debug, Clone)]
pub struct MockClock {
    base: Instant,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            state: Arc::new(Mutex::new(MockState {
                offset: Duration::ZERO,
                sleepers: Vec::new(),
            })),
        }
    }

    /// Move time forward and wake due sleepers.
    pub fn advance(&self, duration: Duration) {
        self.state.lock().offset += duration;
        self.wake_due();
    }

    fn wake_due(&self) {
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock();
            let now = state.offset;
            let mut remaining = Vec::with_capacity(state.sleepers.len());
            for sleeper in state.sleepers.drain(..) {
                if sleeper.deadline <= now {
                    ready.push(sleeper.tx);
                } else {
                    remaining.push(sleeper);
                }
            }
            state.sleepers = remaining;
        }
        for tx in ready {
            let _ = tx.send(());
        }
    }

    /// Number of tasks currently blocked in `sleep`.
    pub fn sleeper_count(&self) -> usize {
        self.state.lock().sleepers.len()
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.base + self.state.lock().offset
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let rx = {
            let mut state = self.state.lock();
            let (tx, rx) = oneshot::channel();
            let deadline = state.offset + duration;
            state.sleepers.push(Sleeper { deadline, tx });
            rx
        };
        // A dropped MockClock drops the sender; treat that as a wakeup.
        let _ = rx.await;
    }
}
