//! Builds the rule engine and dispatch engine from a [`ServerConfig`].
//!
//! Startup never aborts on a single bad definition: channels, templates and
//! rules that fail validation are logged, left out, and listed in the
//! [`BootstrapReport`]. `check-config` turns a non-empty report into an error.

use crate::config::ServerConfig;
use std::collections::BTreeSet;
use std::sync::Arc;
use vigil_alert::engine::RuleEngine;
use vigil_alert::rule::RuleAction;
use vigil_common::clock::{Clock, SystemClock};
use vigil_common::types::ChannelType;
use vigil_notify::channel::ChannelRegistry;
use vigil_notify::channels::in_app::InAppInbox;
use vigil_notify::dispatcher::DispatchEngine;
use vigil_notify::plugin::PluginRegistry;
use vigil_notify::recipient::{InMemoryDirectory, RecipientDirectory};
use vigil_notify::template::TemplateStore;

/// What was loaded, and every definition that was rejected or looks wrong.
#[derive(Debug, Default)]
pub struct BootstrapReport {
    pub channels: usize,
    pub templates: usize,
    pub recipients: usize,
    pub rules: usize,
    pub problems: Vec<String>,
}

impl BootstrapReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

pub struct Components {
    pub engine: Arc<DispatchEngine>,
    pub rules: RuleEngine,
    pub directory: Arc<InMemoryDirectory>,
    pub inbox: InAppInbox,
    pub report: BootstrapReport,
}

/// Assembles components with the built-in channel plugins and the system clock.
pub fn assemble(config: &ServerConfig) -> Components {
    let plugins = PluginRegistry::with_builtins(InAppInbox::with_capacity(config.inbox_capacity));
    assemble_with(config, &plugins, Arc::new(SystemClock))
}

pub fn assemble_with(config: &ServerConfig, plugins: &PluginRegistry, clock: Arc<dyn Clock>) -> Components {
    let mut report = BootstrapReport::default();

    let mut registry = ChannelRegistry::new();
    for spec in &config.channels {
        let id = spec.id.clone();
        let redacted = plugins.redact(spec);
        match plugins.build_channel(spec.clone()).and_then(|c| registry.register(c)) {
            Ok(channel) => {
                tracing::info!(
                    channel_id = %id,
                    channel_type = %channel.channel_type(),
                    enabled = channel.is_enabled(),
                    config = %redacted,
                    "Channel loaded"
                );
            }
            Err(e) => {
                tracing::error!(channel_id = %id, config = %redacted, error = %e, "Failed to load channel, skipping");
                report.problems.push(format!("channel '{id}': {e}"));
            }
        }
    }
    report.channels = registry.len();

    let mut templates = TemplateStore::with_defaults();
    for template in &config.templates {
        let id = template.id.clone();
        if let Err(e) = templates.insert(template.clone()) {
            tracing::error!(template_id = %id, error = %e, "Failed to load template, skipping");
            report.problems.push(format!("template '{id}': {e}"));
        }
    }
    report.templates = templates.len();
    if templates.get(&config.dispatch.alert_template_id).is_none() {
        report.problems.push(format!(
            "dispatch.alert_template_id '{}' does not name a template",
            config.dispatch.alert_template_id
        ));
    }

    let directory = Arc::new(InMemoryDirectory::new(config.recipients.iter().cloned()));
    report.recipients = directory.len();
    let configured_types: BTreeSet<ChannelType> = registry.channels().map(|c| c.channel_type()).collect();
    for recipient in &config.recipients {
        let wanted: BTreeSet<ChannelType> = recipient.severity_thresholds.values().flatten().copied().collect();
        for channel_type in wanted.difference(&configured_types) {
            tracing::warn!(
                recipient_id = %recipient.id,
                channel_type = %channel_type,
                "Recipient wants a channel type with no configured channel"
            );
        }
    }

    let (rules, rule_errors) = RuleEngine::load(config.rules.clone());
    for e in rule_errors {
        report.problems.push(e.to_string());
    }
    for rule in rules.rules() {
        for action in &rule.actions {
            match action {
                RuleAction::Notify { recipients } | RuleAction::Escalate { recipients, .. } => {
                    for id in recipients.iter().filter(|id| directory.get(id).is_none()) {
                        report
                            .problems
                            .push(format!("rule '{}': unknown recipient '{id}'", rule.id));
                    }
                }
                RuleAction::WebhookCall { channel_id, .. } => {
                    let is_webhook = registry
                        .get(channel_id)
                        .is_some_and(|c| c.channel_type() == ChannelType::Webhook);
                    if !is_webhook {
                        report.problems.push(format!(
                            "rule '{}': '{channel_id}' is not a configured webhook channel",
                            rule.id
                        ));
                    }
                }
                RuleAction::CreateAlert { .. } => {}
            }
        }
    }
    report.rules = rules.rules().len();

    let engine = Arc::new(DispatchEngine::with_clock(
        Arc::new(registry),
        Arc::new(templates),
        directory.clone(),
        config.dispatch.clone(),
        clock,
    ));

    tracing::info!(
        channels = report.channels,
        templates = report.templates,
        recipients = report.recipients,
        rules = report.rules,
        problems = report.problems.len(),
        "Configuration assembled"
    );

    Components {
        engine,
        rules,
        directory,
        inbox: plugins.inbox().clone(),
        report,
    }
}
