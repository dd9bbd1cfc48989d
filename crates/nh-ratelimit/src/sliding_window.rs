//! Sliding window limiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use nh_common::{Clock, Result, SystemClock};

use crate::limiter::{burst_exceeded, Limiter, RefundOnDrop, Reservation};

/// Admits at most `limit` requests per rolling `window`.
///
/// Holds the admission timestamps; entries older than the window are
/// pruned on every call, so the bound `|requests in (now-window, now]| <=
/// limit` holds at every instant.
pub struct SlidingWindow {
    limit: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<VecDeque<Instant>>>,
}

impl SlidingWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self::with_clock(limit, window, Arc::new(SystemClock))
    }

    pub fn with_clock(limit: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit,
            window,
            clock,
            entries: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn prune(&self, entries: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = entries.front() {
            if now.saturating_duration_since(*front) >= self.window {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admissions currently inside the window.
    pub fn in_window(&self) -> usize {
        let mut entries = self.entries.lock();
        self.prune(&mut entries, self.clock.now());
        entries.len()
    }
}

#[async_trait]
impl Limiter for SlidingWindow {
    fn allow(&self, n: u32) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        self.prune(&mut entries, now);
        if entries.len() + n as usize <= self.limit as usize {
            for _ in 0..n {
                entries.push_back(now);
            }
            true
        } else {
            false
        }
    }

    fn reserve(&self, n: u32) -> Reservation {
        if n > self.limit {
            return Reservation::failed();
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        self.prune(&mut entries, now);

        let (stamp, delay) = if entries.len() + n as usize <= self.limit as usize {
            (now, Duration::ZERO)
        } else {
            // Wait until enough old entries age out: the admission that
            // must expire is the one keeping us over the limit.
            let overflow = entries.len() + n as usize - self.limit as usize;
            let blocking = entries[overflow - 1];
            let delay = (blocking + self.window).saturating_duration_since(now);
            (now + delay, delay)
        };

        // Record at the time-to-act so concurrent callers see the slots
        // as taken; ordering within the deque is kept by insertion point.
        let idx = entries.partition_point(|e| *e <= stamp);
        for _ in 0..n {
            entries.insert(idx, stamp);
        }
        drop(entries);

        if delay.is_zero() {
            return Reservation::ready();
        }

        let shared = Arc::clone(&self.entries);
        let clock = Arc::clone(&self.clock);
        let canceller = Box::new(move || {
            if clock.now() < stamp {
                let mut entries = shared.lock();
                let mut removed = 0u32;
                entries.retain(|e| {
                    if removed < n && *e == stamp {
                        removed += 1;
                        false
                    } else {
                        true
                    }
                });
            }
        });
        Reservation::new(delay, canceller)
    }

    async fn wait(&self, n: u32) -> Result<()> {
        let reservation = self.reserve(n);
        if !reservation.ok() {
            return Err(burst_exceeded(n, self.limit));
        }
        let delay = reservation.delay();
        let guard = RefundOnDrop::new(reservation);
        if !delay.is_zero() {
            self.clock.sleep(delay).await;
        }
        guard.disarm();
        Ok(())
    }

    fn limit(&self) -> f64 {
        if self.window.is_zero() {
            f64::INFINITY
        } else {
            self.limit as f64 / self.window.as_secs_f64()
        }
    }

    fn burst(&self) -> u32 {
        self.limit
    }
}
