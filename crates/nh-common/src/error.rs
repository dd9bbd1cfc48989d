//! Error taxonomy
//!
//! Every failure in NotifyHub carries an `ErrorCode` of the shape `CAT###`.
//! The code's static metadata (category, severity, retryability) drives the
//! retry engine and the circuit breakers; the surrounding `NotifyError`
//! carries the runtime context (platform, details, cause).

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

/// Three-letter error category, the `CAT` of `CAT###`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Configuration,
    Platform,
    Message,
    Template,
    Queue,
    Network,
    Validation,
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "CON",
            ErrorCategory::Platform => "PLT",
            ErrorCategory::Message => "MSG",
            ErrorCategory::Template => "TPL",
            ErrorCategory::Queue => "QUE",
            ErrorCategory::Network => "NET",
            ErrorCategory::Validation => "VAL",
            ErrorCategory::System => "SYS",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to each error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

/// The full code catalog.
///
/// Codes are stable wire identifiers; variants are the readable names used
/// in source. `is_retryable` is the default consulted by the retry engine
/// when no platform override or conditional policy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // CON - configuration
    InvalidConfig,
    MissingConfigField,
    ConflictingConfig,
    // PLT - platform
    PlatformNotFound,
    PlatformUnavailable,
    PlatformAuthFailed,
    PlatformRateLimited,
    PlatformTimeout,
    PlatformSendFailed,
    PlatformInternalError,
    // MSG - message
    InvalidMessage,
    MessageTooLarge,
    NoValidTarget,
    UnsupportedFormat,
    DeliveryInterrupted,
    TemporarilyUndeliverable,
    // TPL - template
    TemplateNotFound,
    TemplateParseFailed,
    TemplateRenderFailed,
    MissingTemplateVariable,
    InvalidTemplateSyntax,
    TemplateStoreUnavailable,
    // QUE - queue
    QueueFull,
    QueueClosed,
    EnqueueTimeout,
    DequeueTimeout,
    QueueCorrupted,
    SchedulerLagging,
    // NET - network
    ConnectionFailed,
    RequestTimeout,
    HostUnreachable,
    TlsFailure,
    InvalidUrl,
    // VAL - validation
    ValidationFailed,
    PriorityOutOfRange,
    MalformedAddress,
    // SYS - system
    ShuttingDown,
    InternalError,
    ResourcesExhausted,
    NotImplemented,
    Cancelled,
    Busy,
}

/// Static metadata rows: (code, category, severity, retryable, description).
const CATALOG: &[(ErrorCode, &str, ErrorCategory, ErrorSeverity, bool, &str)] = &[
    (ErrorCode::InvalidConfig, "CON001", ErrorCategory::Configuration, ErrorSeverity::Error, false, "invalid configuration"),
    (ErrorCode::MissingConfigField, "CON002", ErrorCategory::Configuration, ErrorSeverity::Error, false, "missing required configuration field"),
    (ErrorCode::ConflictingConfig, "CON003", ErrorCategory::Configuration, ErrorSeverity::Error, false, "conflicting configuration options"),
    (ErrorCode::PlatformNotFound, "PLT001", ErrorCategory::Platform, ErrorSeverity::Error, false, "platform not registered"),
    (ErrorCode::PlatformUnavailable, "PLT002", ErrorCategory::Platform, ErrorSeverity::Warn, true, "platform unavailable"),
    (ErrorCode::PlatformAuthFailed, "PLT003", ErrorCategory::Platform, ErrorSeverity::Error, false, "platform authentication failed"),
    (ErrorCode::PlatformRateLimited, "PLT004", ErrorCategory::Platform, ErrorSeverity::Warn, true, "platform rate limited"),
    (ErrorCode::PlatformTimeout, "PLT005", ErrorCategory::Platform, ErrorSeverity::Warn, true, "platform request timed out"),
    (ErrorCode::PlatformSendFailed, "PLT006", ErrorCategory::Platform, ErrorSeverity::Error, true, "platform send failed"),
    (ErrorCode::PlatformInternalError, "PLT007", ErrorCategory::Platform, ErrorSeverity::Error, true, "platform internal error"),
    (ErrorCode::InvalidMessage, "MSG001", ErrorCategory::Message, ErrorSeverity::Error, false, "invalid message"),
    (ErrorCode::MessageTooLarge, "MSG002", ErrorCategory::Message, ErrorSeverity::Error, false, "message exceeds platform size limit"),
    (ErrorCode::NoValidTarget, "MSG003", ErrorCategory::Message, ErrorSeverity::Error, false, "no registered platform accepts the target"),
    (ErrorCode::UnsupportedFormat, "MSG004", ErrorCategory::Message, ErrorSeverity::Error, false, "unsupported message format"),
    (ErrorCode::DeliveryInterrupted, "MSG005", ErrorCategory::Message, ErrorSeverity::Warn, true, "message delivery interrupted"),
    (ErrorCode::TemporarilyUndeliverable, "MSG006", ErrorCategory::Message, ErrorSeverity::Warn, true, "message temporarily undeliverable"),
    (ErrorCode::TemplateNotFound, "TPL001", ErrorCategory::Template, ErrorSeverity::Error, false, "template not found"),
    (ErrorCode::TemplateParseFailed, "TPL002", ErrorCategory::Template, ErrorSeverity::Error, false, "template parse failed"),
    (ErrorCode::TemplateRenderFailed, "TPL003", ErrorCategory::Template, ErrorSeverity::Error, false, "template render failed"),
    (ErrorCode::MissingTemplateVariable, "TPL004", ErrorCategory::Template, ErrorSeverity::Error, false, "missing template variable"),
    (ErrorCode::InvalidTemplateSyntax, "TPL005", ErrorCategory::Template, ErrorSeverity::Error, false, "invalid template syntax"),
    (ErrorCode::TemplateStoreUnavailable, "TPL006", ErrorCategory::Template, ErrorSeverity::Warn, true, "template store unavailable"),
    (ErrorCode::QueueFull, "QUE001", ErrorCategory::Queue, ErrorSeverity::Warn, true, "queue full"),
    (ErrorCode::QueueClosed, "QUE002", ErrorCategory::Queue, ErrorSeverity::Error, false, "queue closed"),
    (ErrorCode::EnqueueTimeout, "QUE003", ErrorCategory::Queue, ErrorSeverity::Warn, true, "enqueue timed out"),
    (ErrorCode::DequeueTimeout, "QUE004", ErrorCategory::Queue, ErrorSeverity::Warn, true, "dequeue timed out"),
    (ErrorCode::QueueCorrupted, "QUE005", ErrorCategory::Queue, ErrorSeverity::Critical, false, "queue state corrupted"),
    (ErrorCode::SchedulerLagging, "QUE006", ErrorCategory::Queue, ErrorSeverity::Warn, true, "scheduler lagging"),
    (ErrorCode::ConnectionFailed, "NET001", ErrorCategory::Network, ErrorSeverity::Warn, true, "connection failed"),
    (ErrorCode::RequestTimeout, "NET002", ErrorCategory::Network, ErrorSeverity::Warn, true, "request timed out"),
    (ErrorCode::HostUnreachable, "NET003", ErrorCategory::Network, ErrorSeverity::Warn, true, "host unreachable"),
    (ErrorCode::TlsFailure, "NET004", ErrorCategory::Network, ErrorSeverity::Error, false, "TLS handshake failed"),
    (ErrorCode::InvalidUrl, "NET005", ErrorCategory::Network, ErrorSeverity::Error, false, "invalid URL"),
    (ErrorCode::ValidationFailed, "VAL001", ErrorCategory::Validation, ErrorSeverity::Error, false, "validation failed"),
    (ErrorCode::PriorityOutOfRange, "VAL002", ErrorCategory::Validation, ErrorSeverity::Error, false, "priority out of range"),
    (ErrorCode::MalformedAddress, "VAL003", ErrorCategory::Validation, ErrorSeverity::Error, false, "malformed address"),
    (ErrorCode::ShuttingDown, "SYS001", ErrorCategory::System, ErrorSeverity::Warn, true, "client shutting down"),
    (ErrorCode::InternalError, "SYS002", ErrorCategory::System, ErrorSeverity::Critical, false, "internal error"),
    (ErrorCode::ResourcesExhausted, "SYS003", ErrorCategory::System, ErrorSeverity::Warn, true, "resources exhausted"),
    (ErrorCode::NotImplemented, "SYS004", ErrorCategory::System, ErrorSeverity::Error, false, "not implemented"),
    (ErrorCode::Cancelled, "SYS005", ErrorCategory::System, ErrorSeverity::Warn, true, "operation cancelled or timed out"),
    (ErrorCode::Busy, "SYS006", ErrorCategory::System, ErrorSeverity::Warn, true, "system busy"),
];

impl ErrorCode {
    fn row(&self) -> &'static (ErrorCode, &'static str, ErrorCategory, ErrorSeverity, bool, &'static str) {
        CATALOG
            .iter()
            .find(|row| row.0 == *self)
            .expect("every code has a catalog row")
    }

    /// Wire identifier, e.g. `"PLT002"`.
    pub fn as_str(&self) -> &'static str {
        self.row().1
    }

    pub fn category(&self) -> ErrorCategory {
        self.row().2
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.row().3
    }

    /// Whether the retry engine may retry this code absent any override.
    pub fn is_retryable(&self) -> bool {
        self.row().4
    }

    pub fn description(&self) -> &'static str {
        self.row().5
    }

    /// Parse a wire identifier back into a code.
    pub fn parse(s: &str) -> Option<ErrorCode> {
        CATALOG.iter().find(|row| row.1 == s).map(|row| row.0)
    }

    /// All codes in the catalog, in wire order.
    pub fn all() -> impl Iterator<Item = ErrorCode> {
        CATALOG.iter().map(|row| row.0)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ErrorCode::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown error code: {s}")))
    }
}

/// Static metadata for a code, as exposed by [`info_for`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CodeInfo {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub description: &'static str,
}

/// Look up the static metadata for a code.
pub fn info_for(code: ErrorCode) -> CodeInfo {
    CodeInfo {
        code,
        category: code.category(),
        severity: code.severity(),
        retryable: code.is_retryable(),
        description: code.description(),
    }
}

/// Shortcut for `code.is_retryable()`.
pub fn is_retryable(code: ErrorCode) -> bool {
    code.is_retryable()
}

/// A structured NotifyHub error.
///
/// Displays as `[CODE] message: details` (details omitted when empty).
#[derive(Debug, Clone)]
pub struct NotifyError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
    pub platform: Option<String>,
    pub context: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl NotifyError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            platform: None,
            context: HashMap::new(),
            timestamp: Utc::now(),
            source: None,
        }
    }

    /// Error with the code's own description as the message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.description())
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.code.severity()
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// The wrapped cause, if any. The top-level code is unchanged by
    /// wrapping; callers inspect the cause through here.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Full structured form for logs and the API error body.
    pub fn to_json(&self) -> Value {
        json!({
            "code": self.code.as_str(),
            "message": self.message,
            "details": self.details.as_deref().unwrap_or(""),
            "platform": self.platform.as_deref().unwrap_or(""),
            "context": self.context,
            "timestamp": self.timestamp.to_rfc3339(),
            "category": self.code.category().as_str(),
            "severity": self.code.severity(),
            "retryable": self.code.is_retryable(),
        })
    }

    /// Context restricted to the keys safe to expose in API responses.
    pub fn api_context(&self) -> HashMap<String, Value> {
        const WHITELIST: &[&str] = &["platform", "category", "target_type", "message_id"];
        self.context
            .iter()
            .filter(|(k, _)| WHITELIST.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.details.as_deref() {
            Some(details) if !details.is_empty() => {
                write!(f, "[{}] {}: {}", self.code, self.message, details)
            }
            _ => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

impl StdError for NotifyError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

/// Collects errors from concurrent work and commits them as one aggregate.
///
/// The aggregate carries SYS002 with `error_count`, `error_details`, a
/// per-code histogram and a per-platform histogram in its context.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    errors: Mutex<Vec<NotifyError>>,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, error: NotifyError) {
        self.errors.lock().push(error);
    }

    pub fn count(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    /// Commit the collected errors as a single aggregate error.
    /// Returns `None` when nothing was collected.
    pub fn aggregate(&self) -> Option<NotifyError> {
        let errors = self.errors.lock();
        if errors.is_empty() {
            return None;
        }

        let mut by_code: HashMap<&'static str, u64> = HashMap::new();
        let mut by_platform: HashMap<String, u64> = HashMap::new();
        let mut details = Vec::with_capacity(errors.len());
        for e in errors.iter() {
            *by_code.entry(e.code.as_str()).or_insert(0) += 1;
            if let Some(p) = &e.platform {
                *by_platform.entry(p.clone()).or_insert(0) += 1;
            }
            details.push(Value::String(e.to_string()));
        }

        Some(
            NotifyError::new(
                ErrorCode::InternalError,
                format!("{} error(s) occurred", errors.len()),
            )
            .with_context("error_count", errors.len() as u64)
            .with_context("error_details", Value::Array(details))
            .with_context("code_histogram", json!(by_code))
            .with_context("platform_histogram", json!(by_platform)),
        )
    }
}
