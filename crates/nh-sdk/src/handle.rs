//! Handle for queued (async-path) sends.

use nh_common::{CancelToken, ErrorCode, NotifyError, Receipt, Result};
use tokio::sync::oneshot;

/// Tracks one queued message. `wait` resolves when a queue worker
/// finishes dispatching it; `cancel` aborts the message wherever it is,
/// including mid-retry.
#[derive(Debug)]
pub struct SendHandle {
    message_id: String,
    rx: oneshot::Receiver<Result<Receipt>>,
    cancel: CancelToken,
}

impl SendHandle {
    pub(crate) fn new(
        message_id: String,
        rx: oneshot::Receiver<Result<Receipt>>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            message_id,
            rx,
            cancel,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Wait for the final receipt (or the message-level error).
    pub async fn wait(self) -> Result<Receipt> {
        match self.rx.await {
            Ok(result) => result,
            // The queue dropped the completion without publishing.
            Err(_) => Err(NotifyError::new(
                ErrorCode::Cancelled,
                "queue dropped the message before completion",
            )),
        }
    }

    /// Cancel the message and any in-flight retries for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
