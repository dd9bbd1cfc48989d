//! The client façade.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use nh_common::{CancelToken, ErrorCode, Message, NotifyError, Receipt, Result};
use nh_dispatch::{
    Capabilities, Dispatcher, DispatcherConfig, HealthService, HealthServiceConfig,
    HealthSnapshot, PlatformConnector, PlatformRegistry, RoutingEngine,
};
use nh_queue::{
    DeadLetter, DispatchHandler, MemoryQueue, NotificationQueue, QueueConfig, QueueItem,
    QueueStats,
};
use nh_ratelimit::{KeyedLimiter, Limiter, TokenBucket};
use nh_retry::{CircuitBreakerStats, ExponentialStrategy, RetryStatistics, RetryStrategy};

use crate::connectors::{EmailConnector, FeishuConnector, MockConnector, WebhookConnector};
use crate::handle::SendHandle;
use crate::options::{ClientOptions, ConnectorSpec};

/// Point-in-time view of one platform for status surfaces.
#[derive(Debug, Serialize)]
pub struct PlatformStatus {
    pub name: String,
    pub healthy: bool,
    pub circuit: Option<CircuitBreakerStats>,
    pub capabilities: Capabilities,
}

struct ClientInner {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<PlatformRegistry>,
    strategy: Arc<ExponentialStrategy>,
    queue: MemoryQueue,
    health: HealthService,
    timeout: Duration,
    drain_grace: Duration,
    closed: AtomicBool,
}

/// A NotifyHub client.
///
/// Owns its dispatcher, queue, registry, limiters and retry engine
/// exclusively; independent clients share no state. Cloning is cheap and
/// clones address the same underlying client.
///
/// Construction spawns the queue's worker tasks, so `new` must run
/// inside a tokio runtime.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let mut registry = PlatformRegistry::new();
        for spec in options.connectors {
            let connector: Arc<dyn PlatformConnector> = match spec {
                ConnectorSpec::Feishu { url, secret } => {
                    Arc::new(FeishuConnector::new(url, secret)?)
                }
                ConnectorSpec::EmailSmtp {
                    host,
                    port,
                    user,
                    pass,
                    from,
                } => Arc::new(EmailConnector::new(&host, port, user, pass, &from)?),
                ConnectorSpec::Webhook { url } => Arc::new(WebhookConnector::new(url)?),
                ConnectorSpec::Mock { name } => Arc::new(MockConnector::new(name)),
                ConnectorSpec::Custom(connector) => connector,
            };
            registry.register(connector);
        }
        let registry = Arc::new(registry);

        let mut strategy = ExponentialStrategy::new().with_max_attempts(options.max_retries);
        for policy in options.retry_policies {
            strategy = strategy.with_policy(policy);
        }
        let strategy = Arc::new(strategy);
        for (platform, config) in options.platform_retry {
            strategy.update_platform_config(&platform, config);
        }

        let default_rate = options.default_rate_limit;
        let limiters = Arc::new(KeyedLimiter::new(move |_key| match default_rate {
            Some((rate, burst)) => Arc::new(TokenBucket::new(rate, burst)) as Arc<dyn Limiter>,
            None => Arc::new(TokenBucket::new(f64::INFINITY, u32::MAX)) as Arc<dyn Limiter>,
        }));
        for (platform, (rate, burst)) in options.rate_limits {
            limiters.insert(platform, Arc::new(TokenBucket::new(rate, burst)));
        }

        let router = Arc::new(RoutingEngine::new(options.rules));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            router,
            limiters,
            Arc::clone(&strategy) as Arc<dyn RetryStrategy>,
            DispatcherConfig {
                platform_concurrency: options.platform_concurrency,
                ..DispatcherConfig::default()
            },
        ));

        let queue = MemoryQueue::new(QueueConfig {
            capacity: options.queue.buffer,
            worker_count: options.queue.workers,
            ..QueueConfig::default()
        });
        queue.start(Arc::clone(&dispatcher) as Arc<dyn DispatchHandler>)?;

        info!(
            platforms = registry.len(),
            workers = options.queue.workers,
            "notifyhub client ready"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                dispatcher,
                registry,
                strategy,
                queue,
                health: HealthService::new(HealthServiceConfig::default()),
                timeout: options.timeout,
                drain_grace: options.drain_grace,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NotifyError::new(ErrorCode::ShuttingDown, "client is closed"));
        }
        Ok(())
    }

    /// Synchronous send: routes, fans out, retries and returns the
    /// receipt. Runs under the client's overall deadline; targets still
    /// pending at the deadline are reported as failed (SYS005), not
    /// dropped.
    pub async fn send(&self, message: Message) -> Result<Receipt> {
        self.ensure_open()?;
        let cancel = CancelToken::new();
        let dispatch = self.inner.dispatcher.dispatch(message, &cancel);
        tokio::pin!(dispatch);
        tokio::select! {
            result = &mut dispatch => result,
            _ = tokio::time::sleep(self.inner.timeout) => {
                warn!(timeout_ms = self.inner.timeout.as_millis() as u64, "send deadline exceeded, cancelling");
                cancel.cancel();
                // Dispatch unwinds promptly once cancelled and reports
                // per-target SYS005 results.
                dispatch.await
            }
        }
    }

    /// Queue the message and return a handle publishing the receipt.
    pub fn send_async(&self, mut message: Message) -> Result<SendHandle> {
        self.ensure_open()?;
        message.validate()?;
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        let message_id = message.id.clone();

        let (tx, rx) = oneshot::channel();
        let cancel = CancelToken::new();
        self.inner.queue.enqueue(
            QueueItem::new(message)
                .with_completion(tx)
                .with_cancel(cancel.clone()),
        )?;
        Ok(SendHandle::new(message_id, rx, cancel))
    }

    /// Send several messages concurrently, one receipt each.
    pub async fn send_batch(&self, messages: Vec<Message>) -> Result<Vec<Receipt>> {
        self.ensure_open()?;
        let sends = messages.into_iter().map(|message| self.send(message));
        join_all(sends).await.into_iter().collect()
    }

    pub async fn platform_status(&self, name: &str) -> Result<PlatformStatus> {
        self.ensure_open()?;
        let connector = self.inner.registry.get(name).ok_or_else(|| {
            NotifyError::new(
                ErrorCode::PlatformNotFound,
                format!("platform '{name}' is not registered"),
            )
        })?;
        let healthy = tokio::time::timeout(Duration::from_secs(10), connector.health_check())
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);
        Ok(PlatformStatus {
            name: name.to_string(),
            healthy,
            circuit: self.inner.strategy.circuit_snapshot(name),
            capabilities: connector.capabilities(),
        })
    }

    /// Poll every connector's liveness and aggregate.
    pub async fn health(&self) -> Result<HealthSnapshot> {
        self.ensure_open()?;
        Ok(self.inner.health.check(&self.inner.registry).await)
    }

    pub fn statistics(&self) -> RetryStatistics {
        self.inner.strategy.statistics()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.queue.dead_letters()
    }

    pub fn circuit_states(&self) -> HashMap<String, CircuitBreakerStats> {
        self.inner.strategy.circuit_snapshots()
    }

    /// Tuning suggestions from the performance monitor.
    pub fn recommendations(&self) -> Vec<String> {
        self.inner.strategy.recommendations()
    }

    pub fn registered_platforms(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Stop the queue, drain with the configured grace period, close
    /// every connector and mark the client shut down. Later calls on the
    /// client fail with SYS001.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(NotifyError::new(
                ErrorCode::ShuttingDown,
                "client already closed",
            ));
        }
        info!("closing notifyhub client");
        self.inner.queue.stop().await;
        if !self.inner.queue.drained(self.inner.drain_grace).await {
            warn!(
                grace_ms = self.inner.drain_grace.as_millis() as u64,
                "grace period elapsed with work still in flight"
            );
        }
        self.inner.registry.close_all().await;
        Ok(())
    }
}
