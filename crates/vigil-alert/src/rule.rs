use crate::condition::RuleCondition;
use crate::error::{Result, RuleError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_common::types::{Priority, Severity};

/// Effect executed when a rule matches, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Raise an alert. `alert_type`, `title` and `message` are `${...}` templates
    /// rendered against the triggering event.
    CreateAlert {
        #[serde(default)]
        alert_type: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    /// Fan the alert out to directory recipients.
    Notify { recipients: Vec<String> },
    /// Post the alert payload to a webhook channel.
    WebhookCall {
        channel_id: String,
        #[serde(default)]
        url: Option<String>,
    },
    /// Notify recipients at an explicit priority, bypassing the severity mapping.
    Escalate {
        recipients: Vec<String>,
        #[serde(default = "default_escalation_priority")]
        priority: Priority,
    },
}

fn default_escalation_priority() -> Priority {
    Priority::Immediate
}

/// Runtime counters maintained by the engine, never part of a rule's definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleStats {
    pub evaluation_count: u64,
    pub trigger_count: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// Running mean of evaluation time over triggered executions.
    pub average_execution_micros: f64,
}

impl RuleStats {
    pub(crate) fn record_trigger(&mut self, elapsed_micros: f64, at: DateTime<Utc>) {
        self.trigger_count += 1;
        self.last_triggered_at = Some(at);
        self.average_execution_micros +=
            (elapsed_micros - self.average_execution_micros) / self.trigger_count as f64;
    }
}

/// A named, versioned condition → action mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub priority: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Glob over `Event::event_type` (e.g. `survey.*`).
    #[serde(default = "default_event_pattern")]
    pub event_pattern: String,
    pub condition: RuleCondition,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    /// Minimum seconds between two triggers of this rule.
    #[serde(default)]
    pub cooldown_secs: u64,
    #[serde(skip)]
    pub stats: RuleStats,
}

/// Longest accepted cooldown: one year.
pub const MAX_COOLDOWN_SECS: u64 = 366 * 24 * 3600;

fn default_category() -> String {
    "general".to_string()
}

fn default_version() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

fn default_event_pattern() -> String {
    "*".to_string()
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        priority: Severity,
        condition: RuleCondition,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            category: default_category(),
            version: default_version(),
            priority,
            enabled: true,
            event_pattern: default_event_pattern(),
            condition,
            actions: Vec::new(),
            cooldown_secs: 0,
            stats: RuleStats::default(),
        }
    }

    pub fn with_actions(mut self, actions: Vec<RuleAction>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_event_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.event_pattern = pattern.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Whether this rule applies to events of the given type.
    pub fn matches_event_type(&self, event_type: &str) -> bool {
        self.event_pattern == "*" || glob_match::glob_match(&self.event_pattern, event_type)
    }

    /// Checks the rule definition. Called on every load and update.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| RuleError::InvalidDefinition {
            rule_id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.event_pattern.trim().is_empty() {
            return Err(invalid("event_pattern must not be empty"));
        }
        if self.cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(invalid(&format!(
                "cooldown_secs {} exceeds the maximum of {MAX_COOLDOWN_SECS}",
                self.cooldown_secs
            )));
        }

        // A disabled draft may still have an empty tree.
        if self.condition.leaf_count() == 0 {
            if self.enabled {
                return Err(RuleError::NoLeaf(self.id.clone()));
            }
        } else {
            self.condition
                .validate()
                .map_err(|reason| RuleError::MalformedCondition {
                    rule_id: self.id.clone(),
                    reason,
                })?;
        }

        for action in &self.actions {
            match action {
                RuleAction::Notify { recipients } | RuleAction::Escalate { recipients, .. }
                    if recipients.is_empty() =>
                {
                    return Err(invalid("notify/escalate action needs at least one recipient"));
                }
                RuleAction::WebhookCall { channel_id, .. } if channel_id.trim().is_empty() => {
                    return Err(invalid("webhook_call action needs a channel_id"));
                }
                _ => {}
            }
        }

        Ok(())
    }
}
