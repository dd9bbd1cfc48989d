//! Per-target delivery results and the aggregate receipt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, NotifyError};
use crate::message::Target;

/// Lifecycle state of a single target's delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Scheduled,
}

/// The wire form of a delivery error: code plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&NotifyError> for ResultError {
    fn from(e: &NotifyError) -> Self {
        Self {
            code: e.code,
            message: e.to_string(),
        }
    }
}

/// Outcome for one target of one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub message_id: String,
    pub target: Target,
    pub status: DeliveryStatus,
    pub success: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<ResultError>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl DeliveryResult {
    pub fn pending(message_id: impl Into<String>, target: Target) -> Self {
        Self {
            message_id: message_id.into(),
            target,
            status: DeliveryStatus::Pending,
            success: false,
            sent_at: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            end_time: None,
        }
    }

    pub fn sent(message_id: impl Into<String>, target: Target, attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            target,
            status: DeliveryStatus::Sent,
            success: true,
            sent_at: Some(now),
            error: None,
            attempts,
            created_at: now,
            end_time: Some(now),
        }
    }

    pub fn failed(
        message_id: impl Into<String>,
        target: Target,
        error: &NotifyError,
        attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            target,
            status: DeliveryStatus::Failed,
            success: false,
            sent_at: None,
            error: Some(ResultError::from(error)),
            attempts,
            created_at: now,
            end_time: Some(now),
        }
    }

    pub fn scheduled(message_id: impl Into<String>, target: Target) -> Self {
        Self {
            status: DeliveryStatus::Scheduled,
            ..Self::pending(message_id, target)
        }
    }
}

/// Aggregate of per-target results for one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub message_id: String,
    pub results: Vec<DeliveryResult>,
}

impl Receipt {
    pub fn new(message_id: impl Into<String>, results: Vec<DeliveryResult>) -> Self {
        Self {
            message_id: message_id.into(),
            results,
        }
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| !r.success)
    }

    /// Some targets succeeded and some failed.
    pub fn is_partial(&self) -> bool {
        self.success_count() > 0 && self.failed_count() > 0
    }
}
