//! Rule-driven message routing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use nh_common::{Message, Target};

fn default_true() -> bool {
    true
}

/// Conjunctive match conditions; an empty set matches every message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConditions {
    /// Message priority must be one of these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priorities: Vec<u8>,
    /// Every key must be present in the message metadata with this value.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// At least one target already routes through this platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl RuleConditions {
    fn matches(&self, message: &Message) -> bool {
        if !self.priorities.is_empty() && !self.priorities.contains(&message.priority) {
            return false;
        }
        for (key, value) in &self.metadata {
            if message.metadata.get(key) != Some(value) {
                return false;
            }
        }
        if let Some(template) = &self.template {
            if message.template.as_ref() != Some(template) {
                return false;
            }
        }
        if let Some(platform) = &self.platform {
            if !message.targets.iter().any(|t| &t.platform == platform) {
                return false;
            }
        }
        true
    }
}

/// Mutations applied to the routed copy when a rule matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleActions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub add_metadata: HashMap<String, String>,
    /// Applied only when greater than zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_priority: Option<u8>,
    /// Re-points every target at this platform when non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_platform: Option<String>,
}

impl RuleActions {
    fn apply(&self, message: &mut Message) {
        message.targets.extend(self.add_targets.iter().cloned());
        for (key, value) in &self.add_metadata {
            message.metadata.insert(key.clone(), value.clone());
        }
        if let Some(priority) = self.set_priority {
            if priority > 0 {
                message.priority = priority;
            }
        }
        if let Some(platform) = &self.set_platform {
            if !platform.is_empty() {
                for target in &mut message.targets {
                    target.platform = platform.clone();
                }
            }
        }
    }
}

/// One ordered routing transformation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    /// Higher priority rules evaluate first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: RuleConditions,
    #[serde(default)]
    pub actions: RuleActions,
    /// Skip the remaining rules when this one matches.
    #[serde(default)]
    pub stop_processing: bool,
}

impl RoutingRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            enabled: true,
            conditions: RuleConditions::default(),
            actions: RuleActions::default(),
            stop_processing: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn when_priority_in(mut self, priorities: impl IntoIterator<Item = u8>) -> Self {
        self.conditions.priorities = priorities.into_iter().collect();
        self
    }

    pub fn when_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.metadata.insert(key.into(), value.into());
        self
    }

    pub fn when_template(mut self, template: impl Into<String>) -> Self {
        self.conditions.template = Some(template.into());
        self
    }

    pub fn when_platform(mut self, platform: impl Into<String>) -> Self {
        self.conditions.platform = Some(platform.into());
        self
    }

    pub fn add_target(mut self, target: Target) -> Self {
        self.actions.add_targets.push(target);
        self
    }

    pub fn add_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.actions.add_metadata.insert(key.into(), value.into());
        self
    }

    pub fn set_priority(mut self, priority: u8) -> Self {
        self.actions.set_priority = Some(priority);
        self
    }

    pub fn set_platform(mut self, platform: impl Into<String>) -> Self {
        self.actions.set_platform = Some(platform.into());
        self
    }

    pub fn stop_processing(mut self) -> Self {
        self.stop_processing = true;
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.conditions.matches(message)
    }
}

/// Immutable, ordered rule set.
///
/// Disabled rules are dropped at construction; the rest sort by priority
/// descending (stable on ties). Every rule matches against the original
/// message so earlier rules' mutations never influence later matching.
pub struct RoutingEngine {
    rules: Vec<RoutingRule>,
}

impl RoutingEngine {
    pub fn new(mut rules: Vec<RoutingRule>) -> Self {
        rules.retain(|r| r.enabled);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { rules }
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Apply the rule set, returning the routed copy.
    pub fn process(&self, message: &Message) -> Message {
        let mut routed = message.clone();
        for rule in &self.rules {
            if rule.matches(message) {
                debug!(rule = %rule.name, message_id = %message.id, "routing rule matched");
                rule.actions.apply(&mut routed);
                if rule.stop_processing {
                    break;
                }
            }
        }
        routed
    }

    /// Look a rule up by name. Returns a clone; rules are immutable for
    /// the engine's lifetime and mutations to the clone change nothing.
    pub fn find_rule(&self, name: &str) -> Option<RoutingRule> {
        self.rules.iter().find(|r| r.name == name).cloned()
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }
}
