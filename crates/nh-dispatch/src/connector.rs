//! The platform connector contract.

use async_trait::async_trait;
use serde::Serialize;

use nh_common::{Message, MessageFormat, Result, Target};

/// What a connector can accept.
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub formats: Vec<MessageFormat>,
    pub max_message_size: usize,
    pub supports_attachments: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            formats: vec![MessageFormat::Text],
            max_message_size: 64 * 1024,
            supports_attachments: false,
        }
    }
}

/// Adapter delivering to one external platform.
///
/// Implementations must be internally thread-safe: the dispatcher calls
/// `send` concurrently. Errors returned from `send` must carry a
/// structured code and the platform name so the retry engine and circuit
/// breaker can act on them.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn send(&self, message: &Message, target: &Target) -> Result<()>;

    /// Cheap static validation of a target's shape for this platform.
    fn validate_target(&self, target: &Target) -> Result<()>;

    /// Liveness probe used by the health service.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
