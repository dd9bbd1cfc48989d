//! NotifyHub Rate Limiting
//!
//! Two limiter shapes behind one contract:
//! - `TokenBucket`: tokens/sec refill with a burst cap and reservations
//! - `SlidingWindow`: at most `limit` admissions per rolling window
//!
//! `KeyedLimiter` multiplexes either shape per key (per platform, per
//! recipient). All limiters run on an injected [`nh_common::Clock`] so
//! tests drive time deterministically.

pub mod keyed;
pub mod limiter;
pub mod sliding_window;
pub mod token_bucket;

pub use keyed::KeyedLimiter;
pub use limiter::{Limiter, Reservation};
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

/// Unlimited rate for a [`TokenBucket`].
pub const INFINITE_RATE: f64 = f64::INFINITY;

/// Convenience for "n tokens per second".
pub fn per_second(n: f64) -> f64 {
    n
}

/// Convenience for "n tokens per minute".
pub fn per_minute(n: f64) -> f64 {
    n / 60.0
}
