//! Token bucket limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use nh_common::{Clock, Result, SystemClock};

use crate::limiter::{burst_exceeded, Limiter, RefundOnDrop, Reservation};

#[derive(Debug)]
struct BucketState {
    /// May run negative while reservations are outstanding.
    tokens: f64,
    last: Instant,
}

/// Classic token bucket: `rate` tokens/sec refill up to `burst`.
///
/// Refill is lazy: every operation first advances
/// `tokens = min(burst, tokens + elapsed * rate)` on the injected clock.
pub struct TokenBucket {
    rate: f64,
    burst: u32,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<BucketState>>,
}

impl TokenBucket {
    /// Bucket on the system clock. `rate` may be [`crate::INFINITE_RATE`].
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::with_clock(rate, burst, Arc::new(SystemClock))
    }

    pub fn with_clock(rate: f64, burst: u32, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            rate,
            burst,
            clock,
            state: Arc::new(Mutex::new(BucketState {
                tokens: burst as f64,
                last: now,
            })),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last);
        state.last = now;
        if self.rate.is_infinite() {
            state.tokens = self.burst as f64;
        } else {
            state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate)
                .min(self.burst as f64);
        }
    }

    /// Current token count (after refill); test/introspection hook.
    pub fn tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    fn allow(&self, n: u32) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    fn reserve(&self, n: u32) -> Reservation {
        if n > self.burst {
            return Reservation::failed();
        }
        let mut state = self.state.lock();
        self.refill(&mut state);

        let deficit = n as f64 - state.tokens;
        if deficit > 0.0 && !self.rate.is_infinite() && self.rate <= 0.0 {
            // A zero-rate bucket never refills; an unavailable token can
            // never be promised.
            return Reservation::failed();
        }
        state.tokens -= n as f64;

        if deficit <= 0.0 || self.rate.is_infinite() {
            return Reservation::ready();
        }

        let delay = Duration::from_secs_f64(deficit / self.rate);
        let time_to_act = self.clock.now() + delay;

        let shared = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let burst = self.burst as f64;
        let canceller = Box::new(move || {
            // Refund only while the reservation is still pending.
            if clock.now() < time_to_act {
                let mut state = shared.lock();
                state.tokens = (state.tokens + n as f64).min(burst);
            }
        });
        Reservation::new(delay, canceller)
    }

    async fn wait(&self, n: u32) -> Result<()> {
        let reservation = self.reserve(n);
        if !reservation.ok() {
            return Err(burst_exceeded(n, self.burst));
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
        self.rate
    }

    fn burst(&self) -> u32 {
        self.burst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::per_second;
    use nh_common::MockClock;

    fn bucket(rate: f64, burst: u32) -> (TokenBucket, MockClock) {
        let clock = MockClock::new();
        let b = TokenBucket::with_clock(rate, burst, Arc::new(clock.clone()));
        (b, clock)
    }

    #[tokio::test]
    async fn burst_then_refill() {
        // rate=10/s, burst=2: true, true, false; +100ms -> true again.
        let (bucket, clock) = bucket(per_second(10.0), 2);
        assert!(bucket.allow(1));
        assert!(bucket.allow(1));
        assert!(!bucket.allow(1));

        clock.advance(Duration::from_millis(100));
        assert!(bucket.allow(1));
    }

    #[tokio::test]
    async fn consumption_never_exceeds_burst_plus_refill() {
        let (bucket, clock) = bucket(per_second(5.0), 3);
        let mut consumed = 0u64;
        let mut elapsed = Duration::ZERO;

        for step in 0..200 {
            if bucket.allow(1) {
                consumed += 1;
            }
            if step % 3 == 0 {
                let dt = Duration::from_millis(50);
                clock.advance(dt);
                elapsed += dt;
            }
        }

        let budget = 3.0 + 5.0 * elapsed.as_secs_f64();
        assert!(
            (consumed as f64) <= budget + 1e-6,
            "consumed {consumed} > budget {budget}"
        );
    }

    #[tokio::test]
    async fn infinite_rate_always_allows() {
        let (bucket, _clock) = bucket(f64::INFINITY, 1);
        for _ in 0..100 {
            assert!(bucket.allow(1));
        }
    }

    #[tokio::test]
    async fn reservation_deducts_and_reports_delay() {
        let (bucket, _clock) = bucket(per_second(10.0), 1);
        assert!(bucket.allow(1));

        let reservation = bucket.reserve(1);
        assert!(reservation.ok());
        // One token deficit at 10/s -> 100ms.
        assert_eq!(reservation.delay(), Duration::from_millis(100));
        reservation.commit();
    }

    #[tokio::test]
    async fn cancelled_reservation_refunds_tokens() {
        let (bucket, clock) = bucket(per_second(10.0), 1);
        assert!(bucket.allow(1));

        let reservation = bucket.reserve(1);
        assert!(reservation.ok());
        reservation.cancel();

        // Refunded: the earlier deficit is gone after one refill period.
        clock.advance(Duration::from_millis(100));
        assert!(bucket.allow(1));
    }

    #[tokio::test]
    async fn mid_flight_cancel_refunds_outstanding_debt() {
        let (bucket, clock) = bucket(per_second(10.0), 2);
        assert!(bucket.allow(2));

        // Two-token deficit, 200ms to act. Cancel halfway through.
        let reservation = bucket.reserve(2);
        assert_eq!(reservation.delay(), Duration::from_millis(200));
        clock.advance(Duration::from_millis(100));
        reservation.cancel();

        // Refill (+1) plus refund (+2, capped at burst) leaves one token;
        // without the refund the bucket would still be in deficit.
        assert!(bucket.allow(1));
        assert!(!bucket.allow(1));
    }

    #[tokio::test]
    async fn reserve_more_than_burst_fails() {
        let (bucket, _clock) = bucket(per_second(10.0), 2);
        let r = bucket.reserve(3);
        assert!(!r.ok());
        assert!(bucket.wait(3).await.is_err());
    }

    #[tokio::test]
    async fn dropped_wait_refunds_reservation() {
        let (bucket, clock) = bucket(per_second(10.0), 1);
        assert!(bucket.allow(1)); // empty the bucket

        let waiter = {
            let clock = clock.clone();
            let bucket = Arc::new(bucket);
            let b = Arc::clone(&bucket);
            let task = tokio::spawn(async move { b.wait(1).await });
            // Let the wait register its sleeper, then abort mid-sleep.
            while clock.sleeper_count() == 0 {
                tokio::task::yield_now().await;
            }
            task.abort();
            let _ = task.await;
            bucket
        };

        // The aborted wait refunded its token: after one refill period a
        // single permit is available again (it would still be in deficit
        // had the refund not happened).
        clock.advance(Duration::from_millis(100));
        assert!(waiter.allow(1));
    }

    #[tokio::test]
    async fn wait_completes_when_clock_advances() {
        let (bucket, clock) = bucket(per_second(10.0), 1);
        assert!(bucket.allow(1));

        let bucket = Arc::new(bucket);
        let b = Arc::clone(&bucket);
        let task = tokio::spawn(async move { b.wait(1).await });
        while clock.sleeper_count() == 0 {
            tokio::task::yield_now().await;
        }
        clock.advance(Duration::from_millis(100));
        task.await.unwrap().unwrap();
    }
}
