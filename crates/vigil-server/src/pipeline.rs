use std::sync::{Arc, Mutex, PoisonError};
use vigil_alert::detect::AlertDetector;
use vigil_alert::engine::RuleEngine;
use vigil_alert::rule::RuleAction;
use vigil_common::clock::Clock;
use vigil_common::types::{Alert, Event};
use vigil_notify::dispatcher::DispatchEngine;
use vigil_notify::message::NotificationMessage;

/// Everything one event produced.
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub alerts: Vec<Alert>,
    pub messages: Vec<NotificationMessage>,
    /// Actions that could not be executed, one line each.
    pub failed_actions: Vec<String>,
}

/// Event → rules → alerts → notifications.
///
/// Each triggered rule yields one alert; its actions then run in order
/// against that alert. A failing action is logged and does not stop the
/// remaining actions or rules.
pub struct AlertPipeline {
    rules: Mutex<RuleEngine>,
    detector: AlertDetector,
    engine: Arc<DispatchEngine>,
    clock: Arc<dyn Clock>,
}

impl AlertPipeline {
    pub fn new(rules: RuleEngine, engine: Arc<DispatchEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rules: Mutex::new(rules),
            detector: AlertDetector::new(clock.clone()),
            engine,
            clock,
        }
    }

    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    /// Runs `f` with exclusive access to the rule set (enable/disable, reload).
    pub fn with_rules<R>(&self, f: impl FnOnce(&mut RuleEngine) -> R) -> R {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rules)
    }

    pub async fn handle_event(&self, event: &Event) -> PipelineOutcome {
        let triggered = self
            .rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process_at(event, self.clock.now());

        let mut outcome = PipelineOutcome::default();
        for hit in triggered {
            let alert = self.detector.detect(&hit.rule, event);
            tracing::info!(
                alert_id = %alert.id(),
                rule_id = %hit.rule.id,
                event_id = %event.id,
                severity = %alert.severity(),
                title = %alert.title(),
                "Alert raised"
            );

            for action in hit.actions() {
                match action {
                    RuleAction::CreateAlert { .. } => {}
                    RuleAction::Notify { recipients } => {
                        let sent = self.engine.send_alert_notification(&alert, recipients).await;
                        outcome.messages.extend(sent);
                    }
                    RuleAction::Escalate { recipients, priority } => {
                        let sent = self
                            .engine
                            .send_alert_notification_with_priority(&alert, recipients, *priority)
                            .await;
                        tracing::info!(
                            alert_id = %alert.id(),
                            priority = %priority,
                            messages = sent.len(),
                            "Alert escalated"
                        );
                        outcome.messages.extend(sent);
                    }
                    RuleAction::WebhookCall { channel_id, url } => {
                        match self
                            .engine
                            .send_webhook_call(&alert, channel_id, url.as_deref())
                            .await
                        {
                            Ok(message) => outcome.messages.push(message),
                            Err(e) => {
                                tracing::error!(
                                    alert_id = %alert.id(),
                                    rule_id = %hit.rule.id,
                                    channel_id = %channel_id,
                                    error = %e,
                                    "Webhook call action failed"
                                );
                                outcome
                                    .failed_actions
                                    .push(format!("rule '{}': webhook_call '{channel_id}': {e}", hit.rule.id));
                            }
                        }
                    }
                }
            }
            outcome.alerts.push(alert);
        }
        outcome
    }
}
