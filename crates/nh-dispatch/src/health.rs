//! Connector health aggregation.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::registry::PlatformRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub last_check: DateTime<Utc>,
    pub details: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

/// Aggregate view of every registered connector.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub summary: HealthSummary,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.status == ComponentStatus::Healthy
    }
}

#[derive(Debug, Clone)]
pub struct HealthServiceConfig {
    /// Budget for each connector's liveness probe.
    pub check_timeout: Duration,
}

impl Default for HealthServiceConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(10),
        }
    }
}

type AlertCallback = Box<dyn Fn(&str, &ComponentHealth) + Send + Sync>;

/// Fires when a component stays non-healthy for N consecutive checks.
pub struct AlertRule {
    /// Component name, or `"*"` for any component.
    pub component: String,
    pub consecutive_failures: u32,
    callback: AlertCallback,
}

impl AlertRule {
    pub fn new(
        component: impl Into<String>,
        consecutive_failures: u32,
        callback: impl Fn(&str, &ComponentHealth) + Send + Sync + 'static,
    ) -> Self {
        Self {
            component: component.into(),
            consecutive_failures: consecutive_failures.max(1),
            callback: Box::new(callback),
        }
    }

    fn applies_to(&self, component: &str) -> bool {
        self.component == "*" || self.component == component
    }
}

/// Polls connector liveness and synthesizes an aggregate snapshot.
pub struct HealthService {
    config: HealthServiceConfig,
    alert_rules: Vec<AlertRule>,
    failure_streaks: RwLock<HashMap<String, u32>>,
}

impl HealthService {
    pub fn new(config: HealthServiceConfig) -> Self {
        Self {
            config,
            alert_rules: Vec::new(),
            failure_streaks: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_alert_rule(mut self, rule: AlertRule) -> Self {
        self.alert_rules.push(rule);
        self
    }

    /// Probe every registered connector (bounded per-check timeout) and
    /// aggregate the results. Overall status: healthy when everything
    /// passes, unhealthy when everything fails, degraded in between.
    pub async fn check(&self, registry: &PlatformRegistry) -> HealthSnapshot {
        let mut components = HashMap::new();
        let mut summary = HealthSummary::default();

        for (name, connector) in registry.iter() {
            let outcome =
                tokio::time::timeout(self.config.check_timeout, connector.health_check()).await;
            let component = match outcome {
                Ok(Ok(())) => ComponentHealth {
                    status: ComponentStatus::Healthy,
                    last_check: Utc::now(),
                    details: "ok".to_string(),
                },
                Ok(Err(error)) => ComponentHealth {
                    status: ComponentStatus::Unhealthy,
                    last_check: Utc::now(),
                    details: error.to_string(),
                },
                Err(_) => ComponentHealth {
                    status: ComponentStatus::Unhealthy,
                    last_check: Utc::now(),
                    details: format!(
                        "health check timed out after {}ms",
                        self.config.check_timeout.as_millis()
                    ),
                },
            };

            match component.status {
                ComponentStatus::Healthy => summary.healthy += 1,
                ComponentStatus::Degraded => summary.degraded += 1,
                ComponentStatus::Unhealthy => summary.unhealthy += 1,
            }
            self.track_streak(name, &component);
            components.insert(name.to_string(), component);
        }

        let status = if summary.unhealthy == 0 && summary.degraded == 0 {
            ComponentStatus::Healthy
        } else if summary.healthy == 0 && !components.is_empty() {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Degraded
        };

        if status != ComponentStatus::Healthy {
            debug!(
                healthy = summary.healthy,
                unhealthy = summary.unhealthy,
                "health check found problems"
            );
        }

        HealthSnapshot {
            status,
            components,
            summary,
        }
    }

    fn track_streak(&self, name: &str, component: &ComponentHealth) {
        let streak = {
            let mut streaks = self.failure_streaks.write();
            if component.status == ComponentStatus::Healthy {
                streaks.remove(name);
                0
            } else {
                let streak = streaks.entry(name.to_string()).or_insert(0);
                *streak += 1;
                *streak
            }
        };

        if streak == 0 {
            return;
        }
        for rule in &self.alert_rules {
            if rule.applies_to(name) && streak >= rule.consecutive_failures {
                warn!(component = %name, streak, "health alert firing");
                (rule.callback)(name, component);
            }
        }
    }

    /// Current consecutive-failure count for a component.
    pub fn failure_streak(&self, name: &str) -> u32 {
        self.failure_streaks.read().get(name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Capabilities, PlatformConnector};
    use async_trait::async_trait;
    use nh_common::{ErrorCode, Message, NotifyError, Result, Target};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    struct ProbeConnector {
        name: String,
        healthy: AtomicBool,
        hang: bool,
    }

    impl ProbeConnector {
        fn up(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                healthy: AtomicBool::new(true),
                hang: false,
            })
        }

        fn down(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                healthy: AtomicBool::new(false),
                hang: false,
            })
        }

        fn hanging(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                healthy: AtomicBool::new(true),
                hang: true,
            })
        }
    }

    #[async_trait]
    impl PlatformConnector for ProbeConnector {
        fn name(&self) -> &str {
            &self.name
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        async fn send(&self, _message: &Message, _target: &Target) -> Result<()> {
            Ok(())
        }
        fn validate_target(&self, _target: &Target) -> Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> Result<()> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(NotifyError::from_code(ErrorCode::PlatformUnavailable))
            }
        }
    }

    fn registry(connectors: Vec<Arc<ProbeConnector>>) -> PlatformRegistry {
        PlatformRegistry::from_connectors(
            connectors
                .into_iter()
                .map(|c| c as Arc<dyn PlatformConnector>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn all_healthy_components_report_healthy() {
        let service = HealthService::new(HealthServiceConfig::default());
        let registry = registry(vec![ProbeConnector::up("email"), ProbeConnector::up("feishu")]);

        let snapshot = service.check(&registry).await;
        assert!(snapshot.is_healthy());
        assert_eq!(snapshot.summary.healthy, 2);
        assert_eq!(snapshot.components["email"].status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn mixed_health_reports_degraded() {
        let service = HealthService::new(HealthServiceConfig::default());
        let registry = registry(vec![ProbeConnector::up("email"), ProbeConnector::down("sms")]);

        let snapshot = service.check(&registry).await;
        assert_eq!(snapshot.status, ComponentStatus::Degraded);
        assert_eq!(snapshot.summary.unhealthy, 1);
        assert!(snapshot.components["sms"].details.contains("PLT002"));
    }

    #[tokio::test]
    async fn all_failing_reports_unhealthy() {
        let service = HealthService::new(HealthServiceConfig::default());
        let registry = registry(vec![ProbeConnector::down("a"), ProbeConnector::down("b")]);
        let snapshot = service.check(&registry).await;
        assert_eq!(snapshot.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_is_bounded_by_timeout() {
        let service = HealthService::new(HealthServiceConfig {
            check_timeout: Duration::from_millis(100),
        });
        let registry = registry(vec![ProbeConnector::hanging("stuck")]);

        let snapshot = service.check(&registry).await;
        assert_eq!(snapshot.status, ComponentStatus::Unhealthy);
        assert!(snapshot.components["stuck"].details.contains("timed out"));
    }

    #[tokio::test]
    async fn alert_fires_after_consecutive_failures() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_in = Arc::clone(&fired);
        let service = HealthService::new(HealthServiceConfig::default()).with_alert_rule(
            AlertRule::new("sms", 3, move |_, _| {
                fired_in.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let registry = registry(vec![ProbeConnector::down("sms")]);

        service.check(&registry).await;
        service.check(&registry).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        service.check(&registry).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(service.failure_streak("sms"), 3);
    }

    #[tokio::test]
    async fn recovery_resets_the_streak() {
        let service = HealthService::new(HealthServiceConfig::default());
        let probe = ProbeConnector::down("flappy");
        let registry = registry(vec![probe.clone()]);

        service.check(&registry).await;
        assert_eq!(service.failure_streak("flappy"), 1);

        probe.healthy.store(true, Ordering::SeqCst);
        service.check(&registry).await;
        assert_eq!(service.failure_streak("flappy"), 0);
    }
}
