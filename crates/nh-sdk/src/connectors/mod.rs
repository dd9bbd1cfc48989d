//! Built-in platform connectors.
//!
//! The dispatch core only sees the `PlatformConnector` contract; these
//! are the stock implementations wired up by `ClientOptions`.

pub mod email;
pub mod feishu;
pub mod mock;
pub mod webhook;

pub use email::EmailConnector;
pub use feishu::FeishuConnector;
pub use mock::MockConnector;
pub use webhook::WebhookConnector;
