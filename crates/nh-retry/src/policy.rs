//! Conditional retry policies.
//!
//! Evaluated in order before the error-code taxonomy; the first policy
//! whose condition matches decides the retry.

use std::time::Duration;

use nh_common::{ErrorCategory, ErrorCode, NotifyError};

/// What a matching policy decided.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyDecision {
    pub should_retry: bool,
    /// Delay override for the next attempt, if any.
    pub delay: Option<Duration>,
    /// Attempt-budget override, if any.
    pub max_attempts: Option<u32>,
}

impl PolicyDecision {
    pub fn retry() -> Self {
        Self {
            should_retry: true,
            ..Self::default()
        }
    }

    pub fn stop() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

type Condition = Box<dyn Fn(&NotifyError, u32) -> bool + Send + Sync>;
type Action = Box<dyn Fn(&NotifyError, u32) -> PolicyDecision + Send + Sync>;

/// A named `(condition, action)` pair.
pub struct ConditionalPolicy {
    name: String,
    condition: Condition,
    action: Action,
}

impl ConditionalPolicy {
    pub fn new(
        name: impl Into<String>,
        condition: impl Fn(&NotifyError, u32) -> bool + Send + Sync + 'static,
        action: impl Fn(&NotifyError, u32) -> PolicyDecision + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            condition: Box::new(condition),
            action: Box::new(action),
        }
    }

    /// Fixed decision whenever a specific code is seen.
    pub fn for_code(code: ErrorCode, decision: PolicyDecision) -> Self {
        Self::new(
            format!("code:{}", code.as_str()),
            move |e, _| e.code == code,
            move |_, _| decision,
        )
    }

    /// Fixed decision for a whole error category.
    pub fn for_category(category: ErrorCategory, decision: PolicyDecision) -> Self {
        Self::new(
            format!("category:{}", category.as_str()),
            move |e, _| e.category() == category,
            move |_, _| decision,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, error: &NotifyError, attempt: u32) -> bool {
        (self.condition)(error, attempt)
    }

    pub fn decide(&self, error: &NotifyError, attempt: u32) -> PolicyDecision {
        (self.action)(error, attempt)
    }
}

impl std::fmt::Debug for ConditionalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalPolicy")
            .field("name", &self.name)
            .finish()
    }
}
