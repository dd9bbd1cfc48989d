//! NotifyHub Retry Engine
//!
//! Classified retry with:
//! - Exponential, linear and fixed strategies behind one trait
//! - Jitter algorithms (uniform, full, exponential, decorrelated)
//! - Per-platform configuration overrides and circuit breakers
//! - Conditional retry policies evaluated before the code taxonomy
//! - Retry statistics and a latency-based performance monitor
//! - `RetryExecutor`: the cancellation-aware retry loop

pub mod circuit_breaker;
pub mod config;
pub mod executor;
pub mod jitter;
pub mod monitor;
pub mod policy;
pub mod stats;
pub mod strategy;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use config::PlatformRetryConfig;
pub use executor::RetryExecutor;
pub use jitter::JitterKind;
pub use monitor::{LatencyMetrics, PerformanceMonitor};
pub use policy::{ConditionalPolicy, PolicyDecision};
pub use stats::{PlatformStatistics, RetryStatistics, StatisticsCollector};
pub use strategy::{ExponentialStrategy, FixedStrategy, LinearStrategy, RetryStrategy};
