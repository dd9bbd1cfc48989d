//! NotifyHub Queue
//!
//! Bounded in-memory queue feeding the dispatcher's worker pool:
//! - ready FIFO with backpressure (enqueue fails fast with QUE001)
//! - fire-time heap + scheduler task for delayed delivery
//! - worker tasks with a queue-level retry policy and dead-letter sink
//! - completion channels so async handles observe the final receipt

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;

use nh_common::{CancelToken, Message, Receipt, Result};

pub use memory::{DeadLetter, MemoryQueue};

/// The queue's view of the dispatcher.
#[async_trait]
pub trait DispatchHandler: Send + Sync {
    async fn dispatch(&self, message: Message, cancel: &CancelToken) -> Result<Receipt>;
}

/// Backoff applied when a dispatched message fails with a retryable code.
#[derive(Debug, Clone, Serialize)]
pub struct QueueRetryPolicy {
    pub max_retries: u32,
    #[serde(with = "nh_common::serde_util::duration_ms")]
    pub initial_interval: Duration,
    pub multiplier: f64,
    #[serde(with = "nh_common::serde_util::duration_ms")]
    pub max_interval: Duration,
}

impl Default for QueueRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl QueueRetryPolicy {
    /// Delay before redelivery number `retries + 1`.
    pub fn delay_for(&self, retries: u32) -> Duration {
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(retries as i32);
        Duration::from_secs_f64(secs.min(self.max_interval.as_secs_f64()).max(0.0))
    }
}

/// Construction parameters for [`MemoryQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Ready-FIFO bound; a full queue rejects enqueues with QUE001.
    pub capacity: usize,
    pub worker_count: usize,
    /// Bound on the scheduled (delayed + retry) set.
    pub scheduled_capacity: usize,
    pub dead_letter_capacity: usize,
    pub retry: QueueRetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            worker_count: 4,
            scheduled_capacity: 1024,
            dead_letter_capacity: 256,
            retry: QueueRetryPolicy::default(),
        }
    }
}

/// One queued unit of work. `completion` publishes the final receipt (or
/// error) to an async handle; `cancel` aborts the item wherever it is.
#[derive(Debug)]
pub struct QueueItem {
    pub message: Message,
    pub attempts: u32,
    pub completion: Option<oneshot::Sender<Result<Receipt>>>,
    pub cancel: CancelToken,
}

impl QueueItem {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            attempts: 0,
            completion: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_completion(mut self, tx: oneshot::Sender<Result<Receipt>>) -> Self {
        self.completion = Some(tx);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn complete(&mut self, result: Result<Receipt>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

/// Counters and gauges for monitoring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub scheduled: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
    pub total_enqueued: u64,
    pub total_dispatched: u64,
    pub total_retried: u64,
    pub total_dead_lettered: u64,
}

/// Queue contract the client façade consumes.
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    fn enqueue(&self, item: QueueItem) -> Result<()>;
    fn stats(&self) -> QueueStats;
    /// Refuse new enqueues and let in-flight work finish.
    async fn stop(&self);
    /// Wait until idle, up to `grace`. Returns whether the queue drained.
    async fn drained(&self, grace: Duration) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_delays_grow_and_cap() {
        let policy = QueueRetryPolicy {
            max_retries: 5,
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(5), Duration::from_millis(350));
    }
}
