//! Client construction options.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nh_dispatch::{PlatformConnector, RoutingRule};
use nh_retry::{ConditionalPolicy, PlatformRetryConfig};

/// How a connector is obtained at client construction time.
pub(crate) enum ConnectorSpec {
    Feishu {
        url: String,
        secret: Option<String>,
    },
    EmailSmtp {
        host: String,
        port: u16,
        user: String,
        pass: String,
        from: String,
    },
    Webhook {
        url: String,
    },
    Mock {
        name: String,
    },
    Custom(Arc<dyn PlatformConnector>),
}

pub(crate) struct QueueSettings {
    pub buffer: usize,
    pub workers: usize,
}

/// Composable options; later options win where they overwrite the same
/// field.
pub struct ClientOptions {
    pub(crate) connectors: Vec<ConnectorSpec>,
    pub(crate) rules: Vec<RoutingRule>,
    pub(crate) timeout: Duration,
    pub(crate) max_retries: u32,
    pub(crate) queue: QueueSettings,
    pub(crate) rate_limits: HashMap<String, (f64, u32)>,
    pub(crate) default_rate_limit: Option<(f64, u32)>,
    pub(crate) platform_concurrency: HashMap<String, usize>,
    pub(crate) platform_retry: HashMap<String, PlatformRetryConfig>,
    pub(crate) retry_policies: Vec<ConditionalPolicy>,
    pub(crate) drain_grace: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connectors: Vec::new(),
            rules: Vec::new(),
            timeout: Duration::from_secs(30),
            max_retries: 5,
            queue: QueueSettings {
                buffer: 1024,
                workers: 4,
            },
            rate_limits: HashMap::new(),
            default_rate_limit: None,
            platform_concurrency: HashMap::new(),
            platform_retry: HashMap::new(),
            retry_policies: Vec::new(),
            drain_grace: Duration::from_secs(30),
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feishu bot webhook, optionally with its signing secret.
    pub fn with_feishu_webhook(mut self, url: impl Into<String>, secret: Option<String>) -> Self {
        self.connectors.push(ConnectorSpec::Feishu {
            url: url.into(),
            secret,
        });
        self
    }

    /// SMTP relay with STARTTLS and password auth.
    pub fn with_email_smtp(
        mut self,
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        pass: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        self.connectors.push(ConnectorSpec::EmailSmtp {
            host: host.into(),
            port,
            user: user.into(),
            pass: pass.into(),
            from: from.into(),
        });
        self
    }

    /// Plain JSON webhook without signing.
    pub fn with_webhook_basic(mut self, url: impl Into<String>) -> Self {
        self.connectors.push(ConnectorSpec::Webhook { url: url.into() });
        self
    }

    /// In-memory mock connector, for tests and smoke runs.
    pub fn with_mock_notifier(mut self, name: impl Into<String>) -> Self {
        self.connectors.push(ConnectorSpec::Mock { name: name.into() });
        self
    }

    /// Escape hatch: any pre-built connector.
    pub fn with_connector(mut self, connector: Arc<dyn PlatformConnector>) -> Self {
        self.connectors.push(ConnectorSpec::Custom(connector));
        self
    }

    /// Async-path queue sizing.
    pub fn with_queue(mut self, buffer: usize, workers: usize) -> Self {
        self.queue = QueueSettings {
            buffer: buffer.max(1),
            workers: workers.max(1),
        };
        self
    }

    pub fn with_routing(mut self, rules: impl IntoIterator<Item = RoutingRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Overall deadline for one `send`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attempt budget for the retry engine.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Token-bucket rate limit for one platform (tokens/sec, burst).
    pub fn with_rate_limit(mut self, platform: impl Into<String>, rate: f64, burst: u32) -> Self {
        self.rate_limits.insert(platform.into(), (rate, burst));
        self
    }

    /// Token-bucket applied to platforms without an explicit limit.
    pub fn with_default_rate_limit(mut self, rate: f64, burst: u32) -> Self {
        self.default_rate_limit = Some((rate, burst));
        self
    }

    /// Fan-out bound for one platform's concurrent sends.
    pub fn with_platform_concurrency(
        mut self,
        platform: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        self.platform_concurrency
            .insert(platform.into(), concurrency.max(1));
        self
    }

    /// Per-platform retry override (attempts, delays, enabled).
    pub fn with_platform_retry(
        mut self,
        platform: impl Into<String>,
        config: PlatformRetryConfig,
    ) -> Self {
        self.platform_retry.insert(platform.into(), config);
        self
    }

    /// Conditional retry policy, evaluated before the code taxonomy.
    pub fn with_retry_policy(mut self, policy: ConditionalPolicy) -> Self {
        self.retry_policies.push(policy);
        self
    }

    /// How long `close` waits for in-flight work.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }
}
