//! Per-key limiter multiplexing.

use std::collections::HashMap;
use std::sync::Arc;

use nh_common::Result;
use parking_lot::RwLock;
use tracing::debug;

use crate::limiter::{Limiter, Reservation};

type LimiterFactory = Box<dyn Fn(&str) -> Arc<dyn Limiter> + Send + Sync>;

/// Multiplexes one limiter per string key (platform name, recipient, ...).
///
/// Limiters are created on demand by the factory under a double-checked
/// write lock; explicit per-key overrides can be installed up front.
pub struct KeyedLimiter {
    factory: LimiterFactory,
    limiters: RwLock<HashMap<String, Arc<dyn Limiter>>>,
}

impl KeyedLimiter {
    pub fn new(factory: impl Fn(&str) -> Arc<dyn Limiter> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// Install a specific limiter for a key, replacing any existing one.
    pub fn insert(&self, key: impl Into<String>, limiter: Arc<dyn Limiter>) {
        let key = key.into();
        debug!(key = %key, "installing keyed limiter override");
        self.limiters.write().insert(key, limiter);
    }

    /// Fetch (or lazily create) the limiter for a key.
    pub fn limiter(&self, key: &str) -> Arc<dyn Limiter> {
        if let Some(limiter) = self.limiters.read().get(key) {
            return Arc::clone(limiter);
        }
        let mut limiters = self.limiters.write();
        if let Some(limiter) = limiters.get(key) {
            return Arc::clone(limiter);
        }
        let limiter = (self.factory)(key);
        limiters.insert(key.to_string(), Arc::clone(&limiter));
        limiter
    }

    pub fn allow(&self, key: &str, n: u32) -> bool {
        self.limiter(key).allow(n)
    }

    pub async fn wait(&self, key: &str, n: u32) -> Result<()> {
        // Hold only the Arc across the suspension, never the map lock.
        let limiter = self.limiter(key);
        limiter.wait(n).await
    }

    pub fn reserve(&self, key: &str, n: u32) -> Reservation {
        self.limiter(key).reserve(n)
    }

    pub fn keys(&self) -> Vec<String> {
        self.limiters.read().keys().cloned().collect()
    }
}
