//! Instance-owned connector registry.
//!
//! Built once at client construction; there is no process-wide registry,
//! so two clients can register different connectors for the same name
//! with no interference.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::connector::PlatformConnector;

#[derive(Default)]
pub struct PlatformRegistry {
    connectors: HashMap<String, Arc<dyn PlatformConnector>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_connectors(connectors: Vec<Arc<dyn PlatformConnector>>) -> Self {
        let mut registry = Self::new();
        for connector in connectors {
            registry.register(connector);
        }
        registry
    }

    /// Register under the connector's own name. Last registration wins.
    pub fn register(&mut self, connector: Arc<dyn PlatformConnector>) {
        let name = connector.name().to_string();
        info!(platform = %name, "registering platform connector");
        self.connectors.insert(name, connector);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PlatformConnector>> {
        self.connectors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connectors.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn PlatformConnector>)> {
        self.connectors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub async fn close_all(&self) {
        for (name, connector) in &self.connectors {
            if let Err(error) = connector.close().await {
                warn!(platform = %name, error = %error, "connector close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Capabilities;
    use async_trait::async_trait;
    use nh_common::{Message, Result, Target};

    struct Named(&'static str);

    #[async_trait]
    impl PlatformConnector for Named {
        fn name(&self) -> &str {
            self.0
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
    }

    #[test]
    fn registries_are_instance_owned() {
        let mut a = PlatformRegistry::new();
        a.register(Arc::new(Named("email")));

        let b = PlatformRegistry::new();
        assert!(a.contains("email"));
        assert!(!b.contains("email"));
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = PlatformRegistry::new();
        registry.register(Arc::new(Named("webhook")));
        registry.register(Arc::new(Named("webhook")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["webhook"]);
    }
}
