//! The dispatcher: orchestrates one send.
//!
//! Routing, per-platform fan-out bounded by semaphores, rate-limit
//! admission, circuit gating, retry-executed connector calls, and
//! positionally-aligned receipt assembly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use nh_common::{
    CancelToken, DeliveryResult, ErrorAggregator, ErrorCode, Message, NotifyError, Receipt,
    Result, Target,
};
use nh_queue::DispatchHandler;
use nh_ratelimit::KeyedLimiter;
use nh_retry::{RetryExecutor, RetryStrategy};

use crate::connector::PlatformConnector;
use crate::registry::PlatformRegistry;
use crate::routing::RoutingEngine;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-platform fan-out bound when no explicit override exists.
    pub default_concurrency: usize,
    pub platform_concurrency: HashMap<String, usize>,
    /// How long a target may wait on the platform rate limiter before
    /// failing with PLT004.
    pub rate_wait_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 8,
            platform_concurrency: HashMap::new(),
            rate_wait_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<PlatformRegistry>,
    router: Arc<RoutingEngine>,
    limiters: Arc<KeyedLimiter>,
    strategy: Arc<dyn RetryStrategy>,
    executor: RetryExecutor,
    config: DispatcherConfig,
    semaphores: DashMap<String, Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PlatformRegistry>,
        router: Arc<RoutingEngine>,
        limiters: Arc<KeyedLimiter>,
        strategy: Arc<dyn RetryStrategy>,
        config: DispatcherConfig,
    ) -> Self {
        let executor = RetryExecutor::new(Arc::clone(&strategy));
        Self {
            registry,
            router,
            limiters,
            strategy,
            executor,
            config,
            semaphores: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> &Arc<dyn RetryStrategy> {
        &self.strategy
    }

    pub fn registry(&self) -> &Arc<PlatformRegistry> {
        &self.registry
    }

    fn semaphore(&self, platform: &str) -> Arc<Semaphore> {
        if let Some(semaphore) = self.semaphores.get(platform) {
            return Arc::clone(&semaphore);
        }
        let permits = self
            .config
            .platform_concurrency
            .get(platform)
            .copied()
            .unwrap_or(self.config.default_concurrency)
            .max(1);
        Arc::clone(
            &self
                .semaphores
                .entry(platform.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(permits))),
        )
    }

    /// Run one send to completion. Fails only on submission-time
    /// validation; delivery failures surface as failed results inside
    /// the receipt, positionally aligned with the routed targets.
    pub async fn dispatch(&self, mut message: Message, cancel: &CancelToken) -> Result<Receipt> {
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        message.validate()?;

        let routed = Arc::new(self.router.process(&message));
        let message_id = routed.id.clone();
        let total = routed.targets.len();
        debug!(message_id = %message_id, targets = total, "dispatching message");

        // Pre-sized slots keep receipt order aligned with target order.
        let slots: Arc<Mutex<Vec<Option<DeliveryResult>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));

        let mut tasks = Vec::new();
        for (index, target) in routed.targets.iter().enumerate() {
            match self.registry.get(&target.platform) {
                None => {
                    warn!(
                        message_id = %message_id,
                        platform = %target.platform,
                        "no connector for platform"
                    );
                    let error = NotifyError::new(
                        ErrorCode::NoValidTarget,
                        format!("no connector registered for platform '{}'", target.platform),
                    )
                    .with_platform(target.platform.clone());
                    slots.lock()[index] =
                        Some(DeliveryResult::failed(&message_id, target.clone(), &error, 0));
                }
                Some(connector) => {
                    tasks.push(self.send_target(
                        Arc::clone(&routed),
                        index,
                        target.clone(),
                        connector,
                        cancel,
                        Arc::clone(&slots),
                    ));
                }
            }
        }
        join_all(tasks).await;

        let results: Vec<DeliveryResult> = {
            let mut slots = slots.lock();
            slots
                .drain(..)
                .enumerate()
                .map(|(index, result)| {
                    result.unwrap_or_else(|| {
                        let error =
                            NotifyError::new(ErrorCode::Cancelled, "target dispatch did not run");
                        DeliveryResult::failed(
                            &message_id,
                            routed.targets[index].clone(),
                            &error,
                            0,
                        )
                    })
                })
                .collect()
        };

        Ok(Receipt::new(message_id, results))
    }

    async fn send_target(
        &self,
        message: Arc<Message>,
        index: usize,
        target: Target,
        connector: Arc<dyn PlatformConnector>,
        cancel: &CancelToken,
        slots: Arc<Mutex<Vec<Option<DeliveryResult>>>>,
    ) {
        let platform = target.platform.clone();
        let message_id = message.id.clone();

        let fill = |result: DeliveryResult| {
            slots.lock()[index] = Some(result);
        };

        // Per-platform fan-out bound.
        let semaphore = self.semaphore(&platform);
        let permit = tokio::select! {
            permit = semaphore.acquire() => permit,
            _ = cancel.cancelled() => {
                fill(DeliveryResult::failed(
                    &message_id,
                    target.clone(),
                    &cancelled_error(&platform),
                    0,
                ));
                return;
            }
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(_) => {
                let error = NotifyError::new(ErrorCode::InternalError, "dispatch semaphore closed")
                    .with_platform(platform.clone());
                fill(DeliveryResult::failed(&message_id, target.clone(), &error, 0));
                return;
            }
        };

        // Rate-limit admission, bounded by the configured wait.
        let limiter = self.limiters.limiter(&platform);
        let admitted = tokio::select! {
            outcome = tokio::time::timeout(self.config.rate_wait_timeout, limiter.wait(1)) => {
                match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(error)) => Err(error.with_platform(platform.clone())),
                    Err(_) => Err(NotifyError::new(
                        ErrorCode::PlatformRateLimited,
                        "timed out waiting for rate limit",
                    )
                    .with_platform(platform.clone())),
                }
            }
            _ = cancel.cancelled() => Err(cancelled_error(&platform)),
        };
        if let Err(error) = admitted {
            warn!(message_id = %message_id, platform = %platform, code = %error.code, "target not admitted");
            fill(DeliveryResult::failed(&message_id, target.clone(), &error, 0));
            return;
        }

        // Circuit gate: an open breaker fails the target without touching
        // the connector (and without feeding the breaker further).
        if !self.strategy.circuit_allows(&platform) {
            let error = NotifyError::new(ErrorCode::PlatformUnavailable, "circuit breaker open")
                .with_platform(platform.clone());
            warn!(message_id = %message_id, platform = %platform, "circuit open, skipping send");
            fill(DeliveryResult::failed(&message_id, target.clone(), &error, 0));
            return;
        }

        let started = Instant::now();
        let strategy = Arc::clone(&self.strategy);
        let retry_platform = platform.clone();
        let outcome = self
            .executor
            .execute_counted(
                cancel,
                || {
                    let connector = Arc::clone(&connector);
                    let message = Arc::clone(&message);
                    let target = target.clone();
                    let platform = platform.clone();
                    async move {
                        connector.send(&message, &target).await.map_err(|error| {
                            // Connector errors must be attributable.
                            if error.platform.is_none() {
                                error.with_platform(platform)
                            } else {
                                error
                            }
                        })
                    }
                },
                |_attempt, backoff, error| {
                    strategy.record_attempt(&retry_platform, backoff, Some(error), false);
                },
            )
            .await;
        let latency = started.elapsed();

        match outcome.result {
            Ok(()) => {
                self.strategy
                    .record_attempt(&platform, Duration::ZERO, None, true);
                self.strategy.record_latency(&platform, latency, true);
                debug!(
                    message_id = %message_id,
                    platform = %platform,
                    attempts = outcome.attempts,
                    "target delivered"
                );
                fill(DeliveryResult::sent(
                    &message_id,
                    target.clone(),
                    outcome.attempts,
                ));
            }
            Err(error) => {
                self.strategy
                    .record_attempt(&platform, Duration::ZERO, Some(&error), false);
                self.strategy.record_latency(&platform, latency, false);
                warn!(
                    message_id = %message_id,
                    platform = %platform,
                    attempts = outcome.attempts,
                    error = %error,
                    "target delivery failed"
                );
                fill(DeliveryResult::failed(
                    &message_id,
                    target.clone(),
                    &error,
                    outcome.attempts,
                ));
            }
        }
    }
}

fn cancelled_error(platform: &str) -> NotifyError {
    NotifyError::new(ErrorCode::Cancelled, "dispatch cancelled").with_platform(platform)
}

/// The queue's view: a totally-failed receipt becomes the aggregated
/// message-level error; anything else passes the receipt through.
#[async_trait]
impl DispatchHandler for Dispatcher {
    async fn dispatch(&self, message: Message, cancel: &CancelToken) -> Result<Receipt> {
        let receipt = Dispatcher::dispatch(self, message, cancel).await?;
        if !receipt.results.is_empty() && receipt.all_failed() {
            let aggregator = ErrorAggregator::new();
            for result in &receipt.results {
                if let Some(error) = &result.error {
                    aggregator.add(
                        NotifyError::new(error.code, error.message.clone())
                            .with_platform(result.target.platform.clone()),
                    );
                }
            }
            if let Some(aggregate) = aggregator.aggregate() {
                return Err(aggregate.with_context("message_id", receipt.message_id.clone()));
            }
        }
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Capabilities;
    use crate::routing::RoutingRule;
    use nh_common::{DeliveryStatus, MockClock, Target, TargetType};
    use nh_ratelimit::{Limiter, TokenBucket};
    use nh_retry::{CircuitState, ExponentialStrategy, JitterKind, PlatformRetryConfig};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scriptable connector: fails the first `fail_first` sends with
    /// `fail_code`, then succeeds; optional per-send latency.
    struct MockConnector {
        name: String,
        fail_first: u32,
        fail_code: ErrorCode,
        latency: Duration,
        calls: AtomicU32,
    }

    impl MockConnector {
        fn ok(name: &str) -> Arc<Self> {
            Self::failing(name, 0, ErrorCode::PlatformSendFailed)
        }

        fn failing(name: &str, fail_first: u32, fail_code: ErrorCode) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail_first,
                fail_code,
                latency: Duration::ZERO,
                calls: AtomicU32::new(0),
            })
        }

        fn slow(name: &str, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail_first: 0,
                fail_code: ErrorCode::PlatformSendFailed,
                latency,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl PlatformConnector for MockConnector {
        fn name(&self) -> &str {
            &self.name
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        async fn send(&self, _message: &Message, _target: &Target) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if call < self.fail_first {
                Err(NotifyError::from_code(self.fail_code).with_platform(self.name.clone()))
            } else {
                Ok(())
            }
        }
        fn validate_target(&self, _target: &Target) -> Result<()> {
            Ok(())
        }
    }

    fn strategy(max_attempts: u32, base_ms: u64) -> Arc<ExponentialStrategy> {
        Arc::new(
            ExponentialStrategy::new()
                .with_base_delay(Duration::from_millis(base_ms))
                .with_multiplier(2.0)
                .with_jitter(0.0)
                .with_jitter_kind(JitterKind::None)
                .with_max_attempts(max_attempts),
        )
    }

    fn open_limiters() -> Arc<KeyedLimiter> {
        Arc::new(KeyedLimiter::new(|_| {
            Arc::new(TokenBucket::new(f64::INFINITY, u32::MAX)) as Arc<dyn Limiter>
        }))
    }

    fn dispatcher(
        connectors: Vec<Arc<MockConnector>>,
        rules: Vec<RoutingRule>,
        strategy: Arc<ExponentialStrategy>,
    ) -> Dispatcher {
        let connectors: Vec<Arc<dyn PlatformConnector>> = connectors
            .into_iter()
            .map(|c| c as Arc<dyn PlatformConnector>)
            .collect();
        Dispatcher::new(
            Arc::new(PlatformRegistry::from_connectors(connectors)),
            Arc::new(RoutingEngine::new(rules)),
            open_limiters(),
            strategy,
            DispatcherConfig::default(),
        )
    }

    fn message_to(platform: &str) -> Message {
        let mut m = Message::new("A", "B");
        m.targets
            .push(Target::new(TargetType::Email, "a@x", platform));
        m
    }

    #[tokio::test]
    async fn synchronous_success_first_attempt() {
        let mock = MockConnector::ok("mock");
        let d = dispatcher(vec![mock.clone()], vec![], strategy(5, 10));

        let receipt = d
            .dispatch(message_to("mock"), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.results.len(), 1);
        let result = &receipt.results[0];
        assert!(result.success);
        assert_eq!(result.status, DeliveryStatus::Sent);
        assert_eq!(result.attempts, 1);
        assert!(result.sent_at.is_some());
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
        assert!(!receipt.message_id.is_empty(), "id assigned when absent");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_succeed() {
        let mock = MockConnector::failing("mock", 2, ErrorCode::PlatformUnavailable);
        let d = dispatcher(vec![mock.clone()], vec![], strategy(5, 10));

        let started = tokio::time::Instant::now();
        let receipt = d
            .dispatch(message_to("mock"), &CancelToken::new())
            .await
            .unwrap();

        let result = &receipt.results[0];
        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 3);
        // Backoffs of 10ms then 20ms under paused time.
        assert_eq!(started.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn non_retryable_error_halts_after_one_call() {
        let mock = MockConnector::failing("mock", u32::MAX, ErrorCode::PlatformAuthFailed);
        let d = dispatcher(vec![mock.clone()], vec![], strategy(5, 10));

        let receipt = d
            .dispatch(message_to("mock"), &CancelToken::new())
            .await
            .unwrap();

        let result = &receipt.results[0];
        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().code, ErrorCode::PlatformAuthFailed);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_platform_fails_in_place_without_aborting_others() {
        let mock = MockConnector::ok("mock");
        let d = dispatcher(vec![mock.clone()], vec![], strategy(5, 10));

        let mut m = message_to("mock");
        m.targets.insert(0, Target::user("u", "missing"));

        let receipt = d.dispatch(m, &CancelToken::new()).await.unwrap();
        assert_eq!(receipt.results.len(), 2);
        assert_eq!(
            receipt.results[0].error.as_ref().unwrap().code,
            ErrorCode::NoValidTarget
        );
        assert!(receipt.results[1].success);
    }

    #[tokio::test]
    async fn receipt_results_align_with_routed_targets() {
        let a = MockConnector::ok("a");
        let b = MockConnector::failing("b", u32::MAX, ErrorCode::PlatformAuthFailed);
        let d = dispatcher(vec![a, b], vec![], strategy(3, 1));

        let mut m = Message::new("t", "b");
        m.targets = vec![
            Target::user("u1", "a"),
            Target::user("u2", "b"),
            Target::user("u3", "missing"),
            Target::user("u4", "a"),
        ];
        let expected = m.targets.clone();

        let receipt = d.dispatch(m, &CancelToken::new()).await.unwrap();
        assert_eq!(receipt.results.len(), expected.len());
        for (result, target) in receipt.results.iter().zip(&expected) {
            assert_eq!(&result.target, target);
        }
        assert!(receipt.results[0].success);
        assert!(!receipt.results[1].success);
        assert!(!receipt.results[2].success);
        assert!(receipt.results[3].success);
    }

    #[tokio::test]
    async fn routing_added_targets_appear_in_receipt() {
        let mock = MockConnector::ok("mock");
        let rules = vec![RoutingRule::new("oncall")
            .when_priority_in([5])
            .add_target(Target::email("oncall@c", "mock"))];
        let d = dispatcher(vec![mock.clone()], rules, strategy(3, 1));

        let mut m = message_to("mock");
        m.priority = 5;
        let receipt = d.dispatch(m, &CancelToken::new()).await.unwrap();

        assert_eq!(receipt.results.len(), 2);
        assert!(receipt.results.iter().all(|r| r.success));
        assert_eq!(mock.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_then_recovers_through_half_open() {
        let clock = MockClock::new();
        let strategy = Arc::new(
            ExponentialStrategy::new()
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(0.0)
                .with_jitter_kind(JitterKind::None)
                .with_max_attempts(5)
                .with_clock(Arc::new(clock.clone())),
        );
        strategy.update_platform_config(
            "mock",
            PlatformRetryConfig::default()
                .with_max_attempts(3)
                .with_max_delay(Duration::from_millis(500))
                .with_base_delay(Duration::from_millis(1)),
        );

        let mock = MockConnector::failing("mock", 3, ErrorCode::PlatformUnavailable);
        let d = dispatcher(vec![mock.clone()], vec![], Arc::clone(&strategy));

        // First message: three failing attempts trip the breaker.
        let receipt = d
            .dispatch(message_to("mock"), &CancelToken::new())
            .await
            .unwrap();
        assert!(!receipt.results[0].success);
        assert_eq!(strategy.circuit_state("mock"), Some(CircuitState::Open));

        // Next message is gated without touching the connector.
        let calls_before = mock.calls.load(Ordering::SeqCst);
        let gated = d
            .dispatch(message_to("mock"), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(
            gated.results[0].error.as_ref().unwrap().code,
            ErrorCode::PlatformUnavailable
        );
        assert_eq!(mock.calls.load(Ordering::SeqCst), calls_before);

        // After the reset timeout the breaker half-opens; a success closes it.
        clock.advance(Duration::from_millis(501));
        assert_eq!(strategy.circuit_state("mock"), Some(CircuitState::HalfOpen));
        let recovered = d
            .dispatch(message_to("mock"), &CancelToken::new())
            .await
            .unwrap();
        assert!(recovered.results[0].success);
        assert_eq!(strategy.circuit_state("mock"), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_marks_results_sys005_and_stops_calls() {
        let mock = MockConnector::slow("mock", Duration::from_millis(500));
        let d = dispatcher(vec![mock.clone()], vec![], strategy(5, 10));

        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let mut m = message_to("mock");
        m.targets.push(Target::user("second", "mock"));
        let receipt = d.dispatch(m, &cancel).await.unwrap();

        assert_eq!(receipt.results.len(), 2);
        for result in &receipt.results {
            assert!(!result.success);
            assert_eq!(result.error.as_ref().unwrap().code, ErrorCode::Cancelled);
        }
        // One in-flight call per target at most; nothing after cancellation.
        assert!(mock.calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn rate_limited_target_fails_with_plt004() {
        let clock = MockClock::new();
        let limiters = {
            let clock = clock.clone();
            Arc::new(KeyedLimiter::new(move |_| {
                Arc::new(TokenBucket::with_clock(1.0, 1, Arc::new(clock.clone())))
                    as Arc<dyn Limiter>
            }))
        };
        let mock = MockConnector::ok("mock");
        let d = Dispatcher::new(
            Arc::new(PlatformRegistry::from_connectors(vec![
                mock.clone() as Arc<dyn PlatformConnector>
            ])),
            Arc::new(RoutingEngine::empty()),
            limiters,
            strategy(3, 1),
            DispatcherConfig {
                rate_wait_timeout: Duration::from_millis(20),
                ..DispatcherConfig::default()
            },
        );

        // First send consumes the single token.
        let first = d
            .dispatch(message_to("mock"), &CancelToken::new())
            .await
            .unwrap();
        assert!(first.results[0].success);

        // Second send cannot be admitted before the wait timeout.
        let second = d
            .dispatch(message_to("mock"), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(
            second.results[0].error.as_ref().unwrap().code,
            ErrorCode::PlatformRateLimited
        );
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_surfaces_aggregate_when_every_target_fails() {
        let mock = MockConnector::failing("mock", u32::MAX, ErrorCode::PlatformAuthFailed);
        let d = dispatcher(vec![mock], vec![], strategy(3, 1));

        let mut m = message_to("mock");
        m.targets.push(Target::user("u2", "mock"));

        let error = DispatchHandler::dispatch(&d, m, &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(error.code, ErrorCode::InternalError);
        assert_eq!(error.context["error_count"], serde_json::json!(2));
        let codes = error.context["code_histogram"].as_object().unwrap();
        assert_eq!(codes["PLT003"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn handler_passes_partial_receipts_through() {
        let good = MockConnector::ok("good");
        let bad = MockConnector::failing("bad", u32::MAX, ErrorCode::PlatformAuthFailed);
        let d = dispatcher(vec![good, bad], vec![], strategy(3, 1));

        let mut m = Message::new("t", "b");
        m.targets = vec![Target::user("u1", "good"), Target::user("u2", "bad")];

        let receipt = DispatchHandler::dispatch(&d, m, &CancelToken::new())
            .await
            .unwrap();
        assert!(receipt.is_partial());
    }

    #[tokio::test]
    async fn invalid_priority_is_rejected_before_routing() {
        let d = dispatcher(vec![MockConnector::ok("mock")], vec![], strategy(3, 1));
        let mut m = message_to("mock");
        m.priority = 9;
        let error = d.dispatch(m, &CancelToken::new()).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::PriorityOutOfRange);
    }
}
