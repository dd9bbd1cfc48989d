//! NotifyHub Common Types
//!
//! Shared building blocks for the NotifyHub workspace:
//! - Message, Target, DeliveryResult and Receipt data model
//! - Error taxonomy with categorised codes and retryability metadata
//! - Clock abstraction with a mockable implementation for tests
//! - Cancellation token used by the dispatcher, queue and retry executor
//! - Structured logging initialisation

pub mod cancel;
pub mod clock;
pub mod error;
pub mod logging;
pub mod message;
pub mod receipt;
pub mod serde_util;

pub use cancel::CancelToken;
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{
    info_for, is_retryable, CodeInfo, ErrorAggregator, ErrorCategory, ErrorCode, ErrorSeverity,
    NotifyError,
};
pub use message::{Message, MessageBuilder, MessageFormat, Target, TargetType};
pub use receipt::{DeliveryResult, DeliveryStatus, Receipt, ResultError};

pub type Result<T> = std::result::Result<T, NotifyError>;
