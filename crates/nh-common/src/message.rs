//! Message and target data model.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, NotifyError};

/// Rendering format of the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Text,
    Markdown,
    Html,
}

/// Kind of delivery endpoint a target addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Email,
    Phone,
    User,
    Group,
    Channel,
    Webhook,
}

/// A single delivery endpoint: an address plus the platform to send through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "type")]
    pub kind: TargetType,
    pub value: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Target {
    pub fn new(kind: TargetType, value: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            platform: platform.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn email(address: impl Into<String>, platform: impl Into<String>) -> Self {
        Self::new(TargetType::Email, address, platform)
    }

    pub fn user(id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self::new(TargetType::User, id, platform)
    }

    pub fn group(id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self::new(TargetType::Group, id, platform)
    }

    pub fn webhook(url: impl Into<String>) -> Self {
        Self::new(TargetType::Webhook, url, "webhook")
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// The unit of work submitted to the engine.
///
/// `priority` runs 1..=5 with 5 urgent. `targets` may be empty at submit
/// time when routing rules supply them. `delay` (milliseconds on the wire)
/// schedules the message instead of dispatching immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub format: MessageFormat,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(
        default,
        with = "crate::serde_util::option_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub delay: Option<Duration>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_priority() -> u8 {
    3
}

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;
pub const URGENT_PRIORITY: u8 = 5;

impl Message {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            body: body.into(),
            format: MessageFormat::Text,
            priority: default_priority(),
            targets: Vec::new(),
            variables: HashMap::new(),
            metadata: HashMap::new(),
            template: None,
            delay: None,
            created_at: Utc::now(),
        }
    }

    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    /// Scheduled rather than immediate?
    pub fn is_scheduled(&self) -> bool {
        self.delay.map(|d| !d.is_zero()).unwrap_or(false)
    }

    /// Absolute fire time for a scheduled message.
    pub fn fire_at(&self) -> Option<DateTime<Utc>> {
        self.delay.map(|d| {
            self.created_at + chrono::Duration::milliseconds(d.as_millis() as i64)
        })
    }

    /// Submission-time validation. Targets may be empty (routing can add
    /// them), but any target present must be fully addressed.
    pub fn validate(&self) -> Result<(), NotifyError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(NotifyError::new(
                ErrorCode::PriorityOutOfRange,
                format!("priority {} outside [{MIN_PRIORITY}, {MAX_PRIORITY}]", self.priority),
            ));
        }
        for target in &self.targets {
            if target.value.is_empty() {
                return Err(NotifyError::new(
                    ErrorCode::MalformedAddress,
                    "target value is empty",
                ));
            }
            if target.platform.is_empty() {
                return Err(NotifyError::new(
                    ErrorCode::NoValidTarget,
                    format!("target {:?} has no platform", target.value),
                ));
            }
        }
        Ok(())
    }
}

/// Fluent builder for [`Message`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    inner: Option<Message>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self {
            inner: Some(Message::new("", "")),
        }
    }

    fn message(&mut self) -> &mut Message {
        self.inner.as_mut().expect("builder consumed")
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.message().id = id.into();
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.message().title = title.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.message().body = body.into();
        self
    }

    pub fn format(mut self, format: MessageFormat) -> Self {
        self.message().format = format;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.message().priority = priority;
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.message().targets.push(target);
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = Target>) -> Self {
        self.message().targets.extend(targets);
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.message().variables.insert(key.into(), value.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message().metadata.insert(key.into(), value.into());
        self
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.message().template = Some(template.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.message().delay = Some(delay);
        self
    }

    pub fn build(mut self) -> Message {
        self.inner.take().expect("builder consumed")
    }
}
