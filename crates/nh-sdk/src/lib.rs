//! NotifyHub SDK
//!
//! The client façade: construct a [`Client`] from [`ClientOptions`],
//! then `send` / `send_async` / `send_batch` messages. Each client
//! exclusively owns its dispatcher, queue, registry, limiters and retry
//! engine; two clients share nothing.
//!
//! ```rust,ignore
//! let client = Client::new(
//!     ClientOptions::new()
//!         .with_feishu_webhook("https://open.feishu.cn/...", Some("secret".into()))
//!         .with_webhook_basic("https://hooks.example.com/notify")
//!         .with_timeout(Duration::from_secs(10)),
//! )?;
//!
//! let receipt = client
//!     .send(
//!         Message::builder()
//!             .title("deploy finished")
//!             .body("v1.2.3 is live")
//!             .target(Target::webhook("https://hooks.example.com/notify"))
//!             .build(),
//!     )
//!     .await?;
//! ```

pub mod client;
pub mod connectors;
pub mod handle;
pub mod options;

pub use client::{Client, PlatformStatus};
pub use handle::SendHandle;
pub use options::ClientOptions;

pub use nh_common::{
    CancelToken, DeliveryResult, DeliveryStatus, ErrorCode, Message, MessageBuilder,
    MessageFormat, NotifyError, Receipt, Result, Target, TargetType,
};
pub use nh_dispatch::{HealthSnapshot, PlatformConnector, RoutingRule};
pub use nh_retry::{PlatformRetryConfig, RetryStatistics};
