//! Retry strategies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nh_common::{Clock, NotifyError, SystemClock};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
use crate::config::PlatformRetryConfig;
use crate::jitter::JitterKind;
use crate::monitor::PerformanceMonitor;
use crate::policy::ConditionalPolicy;
use crate::stats::{RetryStatistics, StatisticsCollector};

/// Retry decision-making contract consumed by the executor and dispatcher.
///
/// `attempt` is the zero-based index of the attempt that just ran.
pub trait RetryStrategy: Send + Sync {
    fn should_retry(&self, error: &NotifyError, attempt: u32) -> bool;

    /// Backoff before attempt `attempt + 1`.
    fn delay(&self, attempt: u32) -> Duration;

    fn max_attempts(&self) -> u32;

    /// Record one attempt outcome into the statistics (and, for
    /// strategies that own circuit breakers, the platform's breaker).
    fn record_attempt(
        &self,
        platform: &str,
        delay: Duration,
        error: Option<&NotifyError>,
        success: bool,
    );

    fn update_platform_config(&self, _platform: &str, _config: PlatformRetryConfig) {}

    fn platform_config(&self, _platform: &str) -> Option<PlatformRetryConfig> {
        None
    }

    fn statistics(&self) -> RetryStatistics;

    fn reset(&self);

    /// Feed the performance monitor, where the strategy has one.
    fn record_latency(&self, _platform: &str, _latency: Duration, _success: bool) {}

    fn circuit_state(&self, _platform: &str) -> Option<CircuitState> {
        None
    }

    /// Whether the platform's circuit admits a request. Strategies
    /// without breakers always admit.
    fn circuit_allows(&self, _platform: &str) -> bool {
        true
    }
}

/// Exponential backoff: `base * multiplier^attempt`, capped at `max_delay`.
///
/// Owns the per-platform machinery of the engine: config overrides,
/// circuit breakers, conditional policies, statistics and the
/// performance monitor.
pub struct ExponentialStrategy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
    jitter_kind: JitterKind,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
    platform_configs: RwLock<HashMap<String, PlatformRetryConfig>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    policies: RwLock<Vec<ConditionalPolicy>>,
    stats: StatisticsCollector,
    monitor: PerformanceMonitor,
    last_jitter_delay: Mutex<Duration>,
}

impl Default for ExponentialStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ExponentialStrategy {
    pub fn new() -> Self {
        let base_delay = Duration::from_secs(1);
        Self {
            base_delay,
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            jitter_kind: JitterKind::Uniform,
            max_attempts: 5,
            clock: Arc::new(SystemClock),
            platform_configs: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            policies: RwLock::new(Vec::new()),
            stats: StatisticsCollector::new(),
            monitor: PerformanceMonitor::new(),
            last_jitter_delay: Mutex::new(base_delay),
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        *self.last_jitter_delay.get_mut() = base_delay;
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

    pub fn with_jitter_kind(mut self, kind: JitterKind) -> Self {
        self.jitter_kind = kind;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(self, policy: ConditionalPolicy) -> Self {
        self.policies.write().push(policy);
        self
    }

    pub fn add_policy(&self, policy: ConditionalPolicy) {
        self.policies.write().push(policy);
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    /// Re-tune a platform's config from observed performance and store it.
    pub fn optimize_platform(&self, platform: &str) -> PlatformRetryConfig {
        let current = self
            .platform_config(platform)
            .unwrap_or_default();
        let tuned = self.monitor.optimize(platform, &current);
        if tuned != current {
            debug!(platform = %platform, "applying optimized retry config");
            self.update_platform_config(platform, tuned.clone());
        }
        tuned
    }

    pub fn recommendations(&self) -> Vec<String> {
        self.monitor.recommendations()
    }

    pub fn circuit_snapshot(&self, platform: &str) -> Option<CircuitBreakerStats> {
        self.breakers.read().get(platform).map(|b| b.snapshot())
    }

    pub fn circuit_snapshots(&self) -> HashMap<String, CircuitBreakerStats> {
        self.breakers
            .read()
            .iter()
            .map(|(name, b)| (name.clone(), b.snapshot()))
            .collect()
    }

    /// Breaker for a platform, created on demand with the platform's
    /// attempts as threshold and its max delay as reset timeout.
    fn breaker(&self, platform: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(platform) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        if let Some(breaker) = breakers.get(platform) {
            return Arc::clone(breaker);
        }
        let cfg = self.platform_configs.read().get(platform).cloned();
        let threshold = cfg.as_ref().map(|c| c.max_attempts).unwrap_or(self.max_attempts);
        let timeout = cfg.as_ref().map(|c| c.max_delay).unwrap_or(self.max_delay);
        let breaker = Arc::new(CircuitBreaker::with_clock(
            threshold,
            timeout,
            Arc::clone(&self.clock),
        ));
        breakers.insert(platform.to_string(), Arc::clone(&breaker));
        breaker
    }

    fn raw_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let capped = (base * self.multiplier.powi(attempt as i32))
            .min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl RetryStrategy for ExponentialStrategy {
    fn should_retry(&self, error: &NotifyError, attempt: u32) -> bool {
        let platform = error.platform.as_deref();
        let platform_cfg = platform.and_then(|p| self.platform_configs.read().get(p).cloned());

        if let Some(cfg) = &platform_cfg {
            if !cfg.enabled {
                debug!(platform = ?platform, "retries disabled for platform");
                return false;
            }
        }

        let max = platform_cfg
            .as_ref()
            .map(|c| c.max_attempts)
            .unwrap_or(self.max_attempts);
        if attempt + 1 >= max {
            return false;
        }

        if let Some(p) = platform {
            if !self.breaker(p).should_allow() {
                debug!(platform = %p, "circuit open, refusing retry");
                return false;
            }
        }

        for policy in self.policies.read().iter() {
            if policy.matches(error, attempt) {
                let decision = policy.decide(error, attempt);
                debug!(
                    policy = policy.name(),
                    should_retry = decision.should_retry,
                    "conditional policy matched"
                );
                return decision.should_retry;
            }
        }

        error.is_retryable()
    }

    fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        let mut last = self.last_jitter_delay.lock();
        let jittered = self
            .jitter_kind
            .apply(raw, self.jitter, self.base_delay, &mut *last);
        match self.jitter_kind {
            // Decorrelated delays honour the cap like everything else.
            JitterKind::Decorrelated => jittered.min(self.max_delay),
            _ => jittered,
        }
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn record_attempt(
        &self,
        platform: &str,
        delay: Duration,
        error: Option<&NotifyError>,
        success: bool,
    ) {
        self.stats.record(platform, delay, error, success);
        if !platform.is_empty() {
            let breaker = self.breaker(platform);
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    fn update_platform_config(&self, platform: &str, config: PlatformRetryConfig) {
        self.platform_configs
            .write()
            .insert(platform.to_string(), config);
        // Breaker thresholds derive from the config; rebuild on next use.
        self.breakers.write().remove(platform);
    }

    fn platform_config(&self, platform: &str) -> Option<PlatformRetryConfig> {
        self.platform_configs.read().get(platform).cloned()
    }

    fn statistics(&self) -> RetryStatistics {
        self.stats.snapshot()
    }

    fn reset(&self) {
        self.stats.reset();
        self.monitor.reset();
        self.breakers.write().clear();
        *self.last_jitter_delay.lock() = self.base_delay;
    }

    fn record_latency(&self, platform: &str, latency: Duration, success: bool) {
        self.monitor.record(platform, latency, success);
    }

    fn circuit_state(&self, platform: &str) -> Option<CircuitState> {
        Some(self.breaker(platform).state())
    }

    fn circuit_allows(&self, platform: &str) -> bool {
        self.breaker(platform).should_allow()
    }
}

/// Linear backoff: `base + attempt * increment`, capped.
pub struct LinearStrategy {
    base_delay: Duration,
    increment: Duration,
    max_delay: Duration,
    max_attempts: u32,
    stats: StatisticsCollector,
}

impl LinearStrategy {
    pub fn new(base_delay: Duration, increment: Duration) -> Self {
        Self {
            base_delay,
            increment,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            stats: StatisticsCollector::new(),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

impl RetryStrategy for LinearStrategy {
    fn should_retry(&self, error: &NotifyError, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts && error.is_retryable()
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_add(self.increment.saturating_mul(attempt))
            .min(self.max_delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn record_attempt(
        &self,
        platform: &str,
        delay: Duration,
        error: Option<&NotifyError>,
        success: bool,
    ) {
        self.stats.record(platform, delay, error, success);
    }

    fn statistics(&self) -> RetryStatistics {
        self.stats.snapshot()
    }

    fn reset(&self) {
        self.stats.reset();
    }
}

/// Fixed backoff: the same delay every attempt.
pub struct FixedStrategy {
    delay: Duration,
    max_attempts: u32,
    stats: StatisticsCollector,
}

impl FixedStrategy {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: 5,
            stats: StatisticsCollector::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

impl RetryStrategy for FixedStrategy {
    fn should_retry(&self, error: &NotifyError, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts && error.is_retryable()
    }

    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn record_attempt(
        &self,
        platform: &str,
        delay: Duration,
        error: Option<&NotifyError>,
        success: bool,
    ) {
        self.stats.record(platform, delay, error, success);
    }

    fn statistics(&self) -> RetryStatistics {
        self.stats.snapshot()
    }

    fn reset(&self) {
        self.stats.reset();
    }
}
