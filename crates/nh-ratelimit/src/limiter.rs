//! The limiter contract and reservations.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use nh_common::{NotifyError, Result};

/// Admission control contract shared by every limiter shape.
///
/// `wait` suspends on the limiter's clock until `n` tokens are available.
/// Dropping the returned future mid-wait cancels the underlying
/// reservation and refunds its tokens, which is how context cancellation
/// is expressed here.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Consume `n` tokens if immediately available.
    fn allow(&self, n: u32) -> bool;

    /// Suspend until `n` tokens are available.
    async fn wait(&self, n: u32) -> Result<()>;

    /// Reserve `n` tokens, deducting immediately. The reservation tells
    /// the caller how long to wait before acting.
    fn reserve(&self, n: u32) -> Reservation;

    /// Steady-state rate (tokens per second, may be +inf).
    fn limit(&self) -> f64;

    /// Maximum burst.
    fn burst(&self) -> u32;
}

/// A promise of future tokens held by a caller.
///
/// Tokens were deducted when the reservation was issued; `cancel` before
/// the time-to-act refunds them (capped at burst). A reservation keeps
/// the issuing limiter's state alive, so cancelling after the limiter
/// itself is gone is a harmless no-op.
pub struct Reservation {
    ok: bool,
    delay: Duration,
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl Reservation {
    pub(crate) fn new(delay: Duration, canceller: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            ok: true,
            delay,
            canceller: Some(canceller),
        }
    }

    /// Tokens already available; nothing to wait for, nothing to refund.
    pub(crate) fn ready() -> Self {
        Self {
            ok: true,
            delay: Duration::ZERO,
            canceller: None,
        }
    }

    /// The request can never be satisfied (e.g. `n` exceeds burst).
    pub(crate) fn failed() -> Self {
        Self {
            ok: false,
            delay: Duration::ZERO,
            canceller: None,
        }
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    /// How long until the reserved tokens may be acted on.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Give the tokens back. Idempotent by construction (consumes self).
    pub fn cancel(mut self) {
        if let Some(cancel) = self.canceller.take() {
            cancel();
        }
    }

    /// Consume the reservation without refunding - the caller acted.
    pub(crate) fn commit(mut self) {
        self.canceller.take();
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("ok", &self.ok)
            .field("delay", &self.delay)
            .finish()
    }
}

/// Refunds a reservation when dropped before being disarmed. Backs the
/// cancellation semantics of `Limiter::wait`.
pub(crate) struct RefundOnDrop {
    reservation: Option<Reservation>,
}

impl RefundOnDrop {
    pub(crate) fn new(reservation: Reservation) -> Self {
        Self {
            reservation: Some(reservation),
        }
    }

    pub(crate) fn disarm(mut self) {
        if let Some(r) = self.reservation.take() {
            r.commit();
        }
    }
}

impl Drop for RefundOnDrop {
    fn drop(&mut self) {
        if let Some(r) = self.reservation.take() {
            r.cancel();
        }
    }
}

pub(crate) fn burst_exceeded(n: u32, burst: u32) -> NotifyError {
    NotifyError::new(
        nh_common::ErrorCode::ResourcesExhausted,
        format!("requested {n} tokens exceeds burst {burst}"),
    )
}
