use crate::rule::{Rule, RuleAction};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use vigil_common::clock::{Clock, SystemClock};
use vigil_common::path::interpolate;
use vigil_common::types::{Alert, Event};

/// Builds alerts from triggered rules. Pure construction, no I/O.
pub struct AlertDetector {
    clock: Arc<dyn Clock>,
}

impl Default for AlertDetector {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl AlertDetector {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Turns a matched rule and its triggering event into an [`Alert`].
    ///
    /// Severity comes from the rule priority; location is copied from the event.
    /// A `create_alert` action, when present, supplies templated type/title/message.
    pub fn detect(&self, rule: &Rule, event: &Event) -> Alert {
        let (alert_type, title, message) = rule
            .actions
            .iter()
            .find_map(|a| match a {
                RuleAction::CreateAlert {
                    alert_type,
                    title,
                    message,
                } => Some((alert_type.as_deref(), title.as_deref(), message.as_deref())),
                _ => None,
            })
            .unwrap_or((None, None, None));

        let context = template_context(rule, event);
        let render = |template: Option<&str>, fallback: String| match template {
            Some(t) => interpolate(t, &context),
            None => fallback,
        };

        let alert_type = render(alert_type, rule.category.clone());
        let title = render(title, rule.name.clone());
        let message = render(
            message,
            rule.description.clone().unwrap_or_else(|| {
                format!("Rule '{}' matched event '{}'", rule.name, event.event_type)
            }),
        );

        Alert::new(alert_type, rule.priority, title, message, self.clock.now())
            .with_rule(rule.id.clone())
            .with_event(event.id.clone())
            .with_location(event.location())
            .with_context(event.data.clone())
    }
}

/// Event data at the top level plus `event` and `rule` metadata objects.
fn template_context(rule: &Rule, event: &Event) -> Value {
    let mut map = match &event.data {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };
    map.insert(
        "event".to_string(),
        json!({
            "id": event.id,
            "type": event.event_type,
            "occurred_at": event.occurred_at.to_rfc3339(),
        }),
    );
    map.insert(
        "rule".to_string(),
        json!({
            "id": rule.id,
            "name": rule.name,
            "category": rule.category,
            "priority": rule.priority.as_str(),
        }),
    );
    Value::Object(map)
}
