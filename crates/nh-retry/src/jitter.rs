//! Jitter algorithms for retry delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How a computed backoff delay is randomised.
///
/// `factor` is the strategy's jitter factor `j`; `base` and `last` only
/// matter for the decorrelated algorithm, which carries the previous
/// jittered delay as state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterKind {
    /// Use the raw delay unchanged.
    None,
    /// `delay + U(-j*delay, +j*delay)`.
    #[default]
    Uniform,
    /// `U(0, delay)`.
    Full,
    /// `delay * (1 + j*U(0,1))`.
    Exponential,
    /// AWS-style: `base + U(0, 3*last)`.
    Decorrelated,
}

impl JitterKind {
    pub fn apply(&self, raw: Duration, factor: f64, base: Duration, last: &mut Duration) -> Duration {
        self.apply_with_rng(raw, factor, base, last, &mut rand::rng())
    }

    pub fn apply_with_rng<R: Rng>(
        &self,
        raw: Duration,
        factor: f64,
        base: Duration,
        last: &mut Duration,
        rng: &mut R,
    ) -> Duration {
        let raw_s = raw.as_secs_f64();
        let jittered = match self {
            JitterKind::None => raw_s,
            JitterKind::Uniform => {
                let u: f64 = rng.random_range(-1.0..=1.0);
                raw_s + factor * raw_s * u
            }
            JitterKind::Full => {
                if raw_s <= 0.0 {
                    0.0
                } else {
                    rng.random_range(0.0..=raw_s)
                }
            }
            JitterKind::Exponential => {
                let u: f64 = rng.random_range(0.0..1.0);
                raw_s * (1.0 + factor * u)
            }
            JitterKind::Decorrelated => {
                let upper = 3.0 * last.as_secs_f64();
                let spread = if upper <= 0.0 {
                    0.0
                } else {
                    rng.random_range(0.0..=upper)
                };
                base.as_secs_f64() + spread
            }
        };
        let delay = Duration::from_secs_f64(jittered.max(0.0));
        if *self == JitterKind::Decorrelated {
            *last = delay;
        }
        delay
    }
}
