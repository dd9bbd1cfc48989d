//! Latency-based performance monitoring and adaptive tuning.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::PlatformRetryConfig;

const WINDOW_SIZE: usize = 100;

/// Percentile summary over the rolling latency window of one platform.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyMetrics {
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub avg_ms: f64,
    pub sample_count: u64,
    pub operations: u64,
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct PlatformWindow {
    samples_ms: VecDeque<u64>,
    operations: u64,
    successes: u64,
}

impl PlatformWindow {
    fn record(&mut self, latency: Duration, success: bool) {
        if self.samples_ms.len() == WINDOW_SIZE {
            self.samples_ms.pop_front();
        }
        self.samples_ms.push_back(latency.as_millis() as u64);
        self.operations += 1;
        if success {
            self.successes += 1;
        }
    }

    fn success_rate(&self) -> f64 {
        if self.operations == 0 {
            1.0
        } else {
            self.successes as f64 / self.operations as f64
        }
    }

    fn metrics(&self) -> Option<LatencyMetrics> {
        if self.samples_ms.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples_ms.iter().copied().collect();
        sorted.sort_unstable();
        let n = sorted.len();
        let pct = |p: f64| -> u64 {
            let idx = ((n as f64 * p).ceil() as usize).saturating_sub(1).min(n - 1);
            sorted[idx]
        };
        let sum: u64 = sorted.iter().sum();
        Some(LatencyMetrics {
            min_ms: sorted[0],
            max_ms: sorted[n - 1],
            p50_ms: pct(0.50),
            p95_ms: pct(0.95),
            p99_ms: pct(0.99),
            avg_ms: sum as f64 / n as f64,
            sample_count: n as u64,
            operations: self.operations,
            success_rate: self.success_rate(),
        })
    }
}

/// Rolling per-platform latency windows feeding adaptive retry tuning.
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    windows: RwLock<HashMap<String, PlatformWindow>>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, platform: &str, latency: Duration, success: bool) {
        if platform.is_empty() {
            return;
        }
        self.windows
            .write()
            .entry(platform.to_string())
            .or_default()
            .record(latency, success);
    }

    pub fn metrics(&self, platform: &str) -> Option<LatencyMetrics> {
        self.windows.read().get(platform).and_then(|w| w.metrics())
    }

    pub fn platforms(&self) -> Vec<String> {
        self.windows.read().keys().cloned().collect()
    }

    /// Tune a platform's retry config from its observed behavior.
    ///
    /// Failing platforms (success < 50% over >10 operations) get more,
    /// slower attempts; slow platforms (p95 > 10s over >5 operations)
    /// get longer delays.
    pub fn optimize(&self, platform: &str, config: &PlatformRetryConfig) -> PlatformRetryConfig {
        let mut tuned = config.clone();
        let Some(metrics) = self.metrics(platform) else {
            return tuned;
        };

        if metrics.success_rate < 0.5 && metrics.operations > 10 {
            tuned.max_attempts = (tuned.max_attempts * 2).min(10);
            tuned.base_delay = tuned.base_delay.mul_f64(1.5);
        }
        if metrics.p95_ms > 10_000 && metrics.operations > 5 {
            tuned.base_delay = tuned.base_delay.mul_f64(2.0);
            tuned.max_delay = tuned.max_delay.mul_f64(1.5);
        }
        tuned
    }

    /// Human-readable findings for struggling platforms.
    pub fn recommendations(&self) -> Vec<String> {
        let windows = self.windows.read();
        let mut out = Vec::new();
        for (platform, window) in windows.iter() {
            let Some(metrics) = window.metrics() else {
                continue;
            };
            if metrics.success_rate < 0.7 {
                out.push(format!(
                    "platform {platform}: success rate {:.0}% - consider raising max attempts or checking platform health",
                    metrics.success_rate * 100.0
                ));
            }
            if metrics.p95_ms > 30_000 {
                out.push(format!(
                    "platform {platform}: p95 latency {}ms - consider longer base delay or a lower concurrency",
                    metrics.p95_ms
                ));
            }
        }
        out.sort();
        out
    }

    pub fn reset(&self) {
        self.windows.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_bounded_to_100_samples() {
        let monitor = PerformanceMonitor::new();
        for i in 0..250 {
            monitor.record("email", Duration::from_millis(i), true);
        }
        let m = monitor.metrics("email").unwrap();
        assert_eq!(m.sample_count, 100);
        assert_eq!(m.operations, 250);
        // Only the most recent 100 samples remain.
        assert_eq!(m.min_ms, 150);
        assert_eq!(m.max_ms, 249);
    }

    #[test]
    fn percentiles_computed_by_sort() {
        let monitor = PerformanceMonitor::new();
        for ms in 1..=100u64 {
            monitor.record("x", Duration::from_millis(ms), true);
        }
        let m = monitor.metrics("x").unwrap();
        assert_eq!(m.p50_ms, 50);
        assert_eq!(m.p95_ms, 95);
        assert_eq!(m.p99_ms, 99);
        assert_eq!(m.min_ms, 1);
        assert_eq!(m.max_ms, 100);
        assert!((m.avg_ms - 50.5).abs() < 1e-9);
    }

    #[test]
    fn optimize_doubles_attempts_for_failing_platform() {
        let monitor = PerformanceMonitor::new();
        for i in 0..20 {
            monitor.record("flaky", Duration::from_millis(5), i % 4 == 0);
        }
        let base = PlatformRetryConfig::default();
        let tuned = monitor.optimize("flaky", &base);
        assert_eq!(tuned.max_attempts, 10);
        assert_eq!(tuned.base_delay, Duration::from_millis(1500));
    }

    #[test]
    fn optimize_caps_attempts_at_ten() {
        let monitor = PerformanceMonitor::new();
        for _ in 0..20 {
            monitor.record("down", Duration::from_millis(5), false);
        }
        let base = PlatformRetryConfig::default().with_max_attempts(8);
        assert_eq!(monitor.optimize("down", &base).max_attempts, 10);
    }

    #[test]
    fn optimize_slows_down_for_high_p95() {
        let monitor = PerformanceMonitor::new();
        for _ in 0..10 {
            monitor.record("slow", Duration::from_secs(15), true);
        }
        let base = PlatformRetryConfig::default();
        let tuned = monitor.optimize("slow", &base);
        assert_eq!(tuned.base_delay, Duration::from_secs(2));
        assert_eq!(tuned.max_delay, Duration::from_secs(45));
    }

    #[test]
    fn healthy_platform_is_untouched() {
        let monitor = PerformanceMonitor::new();
        for _ in 0..50 {
            monitor.record("ok", Duration::from_millis(20), true);
        }
        let base = PlatformRetryConfig::default();
        assert_eq!(monitor.optimize("ok", &base), base);
        assert!(monitor.recommendations().is_empty());
    }

    #[test]
    fn recommendations_flag_low_success_and_high_latency() {
        let monitor = PerformanceMonitor::new();
        for i in 0..10 {
            monitor.record("sad", Duration::from_millis(10), i % 2 == 0);
        }
        for _ in 0..10 {
            monitor.record("slow", Duration::from_secs(40), true);
        }
        let recs = monitor.recommendations();
        assert_eq!(recs.len(), 2);
        assert!(recs.iter().any(|r| r.contains("sad")));
        assert!(recs.iter().any(|r| r.contains("slow")));
    }
}
