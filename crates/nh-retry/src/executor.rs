//! The retry loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nh_common::{CancelToken, Clock, ErrorCode, NotifyError, Result, SystemClock};
use tracing::{debug, warn};

use crate::strategy::RetryStrategy;

/// Runs operations under a [`RetryStrategy`], sleeping the strategy's
/// delays on the injected clock and honouring cancellation at every
/// suspension point.
pub struct RetryExecutor {
    strategy: Arc<dyn RetryStrategy>,
    clock: Arc<dyn Clock>,
}

/// Outcome of [`RetryExecutor::execute_counted`]: the result plus how
/// many attempts ran.
#[derive(Debug)]
pub struct Execution<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl RetryExecutor {
    pub fn new(strategy: Arc<dyn RetryStrategy>) -> Self {
        Self::with_clock(strategy, Arc::new(SystemClock))
    }

    pub fn with_clock(strategy: Arc<dyn RetryStrategy>, clock: Arc<dyn Clock>) -> Self {
        Self { strategy, clock }
    }

    pub fn strategy(&self) -> &Arc<dyn RetryStrategy> {
        &self.strategy
    }

    /// Run `op` until it succeeds, fails non-retryably, exhausts the
    /// attempt budget (wrapped as SYS005), or is cancelled (SYS005).
    pub async fn execute<T, F, Fut>(&self, cancel: &CancelToken, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_callback(cancel, op, |_, _, _| {}).await
    }

    /// Like [`execute`](Self::execute) with an `on_retry(next_attempt,
    /// backoff, error)` hook fired before each backoff sleep.
    pub async fn execute_with_callback<T, F, Fut>(
        &self,
        cancel: &CancelToken,
        op: F,
        on_retry: impl FnMut(u32, Duration, &NotifyError),
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_counted(cancel, op, on_retry).await.result
    }

    /// The full loop, also reporting how many attempts ran.
    pub async fn execute_counted<T, F, Fut>(
        &self,
        cancel: &CancelToken,
        mut op: F,
        mut on_retry: impl FnMut(u32, Duration, &NotifyError),
    ) -> Execution<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.strategy.max_attempts().max(1);
        let mut attempts = 0u32;

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return Execution {
                    result: Err(cancelled_error()),
                    attempts,
                };
            }

            attempts += 1;
            // Racing the operation against cancellation drops the
            // in-flight future, which is how the surrounding I/O is
            // abandoned mid-call.
            let outcome = tokio::select! {
                outcome = op() => outcome,
                _ = cancel.cancelled() => {
                    return Execution {
                        result: Err(cancelled_error()),
                        attempts,
                    };
                }
            };
            match outcome {
                Ok(value) => {
                    return Execution {
                        result: Ok(value),
                        attempts,
                    }
                }
                Err(error) => {
                    if attempt + 1 >= max_attempts {
                        warn!(
                            attempts = attempts,
                            error = %error,
                            "operation failed after all retry attempts"
                        );
                        return Execution {
                            result: Err(exhausted_error(error)),
                            attempts,
                        };
                    }
                    if !self.strategy.should_retry(&error, attempt) {
                        return Execution {
                            result: Err(error),
                            attempts,
                        };
                    }

                    let delay = self.strategy.delay(attempt);
                    debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after backoff"
                    );
                    on_retry(attempt + 1, delay, &error);

                    tokio::select! {
                        _ = self.clock.sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Execution {
                                result: Err(cancelled_error()),
                                attempts,
                            };
                        }
                    }
                }
            }
        }
        unreachable!("loop returns on every path");
    }
}

fn cancelled_error() -> NotifyError {
    NotifyError::new(ErrorCode::Cancelled, "context cancelled during retry")
}

/// Exhaustion wraps the final error as SYS005; the original error (and
/// its code) stays reachable through `cause()`.
fn exhausted_error(last: NotifyError) -> NotifyError {
    let mut wrapped = NotifyError::new(
        ErrorCode::Cancelled,
        "operation failed after all retry attempts",
    )
    .with_details(last.to_string());
    if let Some(platform) = last.platform.clone() {
        wrapped = wrapped.with_platform(platform);
    }
    wrapped.with_source(last)
}
