//! Retry statistics.

use std::collections::HashMap;
use std::time::Duration;

use nh_common::NotifyError;
use parking_lot::RwLock;
use serde::Serialize;

/// Per-platform slice of the statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlatformStatistics {
    pub attempts: u64,
    pub retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_delay_ms: u64,
    pub max_delay_ms: u64,
    pub errors_by_code: HashMap<String, u64>,
}

/// Aggregate retry statistics, global plus per platform.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStatistics {
    pub total_attempts: u64,
    pub total_retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_delay_ms: u64,
    pub average_delay_ms: u64,
    pub max_delay_ms: u64,
    pub errors_by_code: HashMap<String, u64>,
    pub platforms: HashMap<String, PlatformStatistics>,
}

/// Mutex-guarded collector; `snapshot` copies out a consistent view.
#[derive(Debug, Default)]
pub struct StatisticsCollector {
    inner: RwLock<RetryStatistics>,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one attempt. `delay` is the backoff slept before this
    /// attempt (zero for the first try, which is not a retry).
    pub fn record(
        &self,
        platform: &str,
        delay: Duration,
        error: Option<&NotifyError>,
        success: bool,
    ) {
        let delay_ms = delay.as_millis() as u64;
        let mut stats = self.inner.write();

        stats.total_attempts += 1;
        if delay_ms > 0 {
            stats.total_retries += 1;
            stats.total_delay_ms += delay_ms;
            stats.max_delay_ms = stats.max_delay_ms.max(delay_ms);
        }
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        if let Some(e) = error {
            *stats
                .errors_by_code
                .entry(e.code.as_str().to_string())
                .or_insert(0) += 1;
        }

        if !platform.is_empty() {
            let p = stats.platforms.entry(platform.to_string()).or_default();
            p.attempts += 1;
            if delay_ms > 0 {
                p.retries += 1;
                p.total_delay_ms += delay_ms;
                p.max_delay_ms = p.max_delay_ms.max(delay_ms);
            }
            if success {
                p.successes += 1;
            } else {
                p.failures += 1;
            }
            if let Some(e) = error {
                *p.errors_by_code
                    .entry(e.code.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }
    }

    pub fn snapshot(&self) -> RetryStatistics {
        let mut stats = self.inner.read().clone();
        stats.average_delay_ms = if stats.total_retries == 0 {
            0
        } else {
            stats.total_delay_ms / stats.total_retries
        };
        stats
    }

    pub fn reset(&self) {
        *self.inner.write() = RetryStatistics::default();
    }
}
