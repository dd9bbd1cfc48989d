//! Per-platform retry configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Overrides applied to the exponential strategy for one platform.
///
/// `enabled = false` disables retries for the platform entirely,
/// regardless of error codes. The platform's `max_attempts` and
/// `max_delay` also parameterise its circuit breaker (threshold and
/// reset timeout respectively).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformRetryConfig {
    pub max_attempts: u32,
    #[serde(with = "nh_common::serde_util::duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "nh_common::serde_util::duration_ms")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub enabled: bool,
}

impl Default for PlatformRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            enabled: true,
        }
    }
}

impl PlatformRetryConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }
}
