use crate::error::{Result, RuleError};
use crate::rule::{Rule, RuleAction};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use vigil_common::types::Event;

/// A rule whose condition matched an event.
#[derive(Debug, Clone)]
pub struct TriggeredRule {
    /// Snapshot of the rule at trigger time, stats included.
    pub rule: Rule,
    pub triggered_at: DateTime<Utc>,
}

impl TriggeredRule {
    pub fn actions(&self) -> &[RuleAction] {
        &self.rule.actions
    }
}

/// Holds the loaded rule set and evaluates events against it.
///
/// The engine owns rule statistics and cooldown bookkeeping; rule definitions
/// only change through [`RuleEngine::add_rule`], [`RuleEngine::update_rule`],
/// [`RuleEngine::set_enabled`] and friends.
#[derive(Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
    last_fired: HashMap<String, DateTime<Utc>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a rule batch, keeping every valid rule.
    ///
    /// Invalid or duplicate rules are rejected individually and reported back so
    /// one bad definition never blocks the rest of the batch.
    pub fn load(rules: Vec<Rule>) -> (Self, Vec<RuleError>) {
        let mut engine = Self::new();
        let mut errors = Vec::new();
        for rule in rules {
            let id = rule.id.clone();
            if let Err(e) = engine.add_rule(rule) {
                tracing::warn!(rule_id = %id, error = %e, "Rejected rule at load time");
                errors.push(e);
            }
        }
        (engine, errors)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Get a rule by its ID.
    pub fn get_rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Add a new rule at runtime.
    pub fn add_rule(&mut self, rule: Rule) -> Result<()> {
        rule.validate()?;
        if self.get_rule(&rule.id).is_some() {
            return Err(RuleError::DuplicateId(rule.id));
        }
        self.rules.push(rule);
        self.sort();
        Ok(())
    }

    /// Replace an existing rule's definition. Statistics carry over.
    pub fn update_rule(&mut self, mut rule: Rule) -> Result<()> {
        rule.validate()?;
        let existing = self
            .rules
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or_else(|| RuleError::NotFound(rule.id.clone()))?;
        rule.stats = std::mem::take(&mut existing.stats);
        *existing = rule;
        self.sort();
        Ok(())
    }

    /// Enable or disable a rule. Enabling re-runs validation.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let rule = self
            .rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        if enabled {
            let mut candidate = rule.clone();
            candidate.enabled = true;
            candidate.validate()?;
        }
        rule.enabled = enabled;
        Ok(())
    }

    /// Remove a rule by ID. Returns true if found and removed.
    pub fn remove_rule(&mut self, id: &str) -> bool {
        let len_before = self.rules.len();
        self.rules.retain(|r| r.id != id);
        self.last_fired.remove(id);
        self.rules.len() < len_before
    }

    /// Replace all rules with a new set, returning rejected definitions.
    pub fn replace_rules(&mut self, rules: Vec<Rule>) -> Vec<RuleError> {
        let (engine, errors) = Self::load(rules);
        *self = engine;
        errors
    }

    /// Pure verdict for one rule against an event context.
    ///
    /// Disabled rules never match.
    pub fn evaluate(rule: &Rule, context: &Value) -> bool {
        rule.enabled && rule.condition.evaluate(context)
    }

    pub fn process(&mut self, event: &Event) -> Vec<TriggeredRule> {
        self.process_at(event, Utc::now())
    }

    /// Evaluates every applicable rule against `event` and returns those that
    /// triggered, highest priority first.
    pub fn process_at(&mut self, event: &Event, now: DateTime<Utc>) -> Vec<TriggeredRule> {
        let mut triggered = Vec::new();

        for rule in &mut self.rules {
            if !rule.enabled || !rule.matches_event_type(&event.event_type) {
                continue;
            }

            let started = Instant::now();
            let matched = Self::evaluate(rule, &event.data);
            let elapsed_micros = started.elapsed().as_secs_f64() * 1_000_000.0;
            rule.stats.evaluation_count += 1;

            if !matched {
                continue;
            }

            let suppressed = self
                .last_fired
                .get(&rule.id)
                .is_some_and(|last| in_cooldown(rule.cooldown_secs, *last, now));
            if suppressed {
                tracing::debug!(
                    rule_id = %rule.id,
                    event_id = %event.id,
                    "Rule trigger suppressed (cooldown)"
                );
                continue;
            }

            rule.stats.record_trigger(elapsed_micros, now);
            self.last_fired.insert(rule.id.clone(), now);
            tracing::debug!(
                rule_id = %rule.id,
                event_id = %event.id,
                trigger_count = rule.stats.trigger_count,
                "Rule triggered"
            );
            triggered.push(TriggeredRule {
                rule: rule.clone(),
                triggered_at: now,
            });
        }

        triggered
    }

    fn sort(&mut self) {
        self.rules
            .sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    }
}

/// Whether a rule that last fired at `last` is still cooling down at `now`.
/// A cooldown too large to represent never expires.
pub(crate) fn in_cooldown(cooldown_secs: u64, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if cooldown_secs == 0 {
        return false;
    }
    match i64::try_from(cooldown_secs).ok().and_then(chrono::Duration::try_seconds) {
        Some(cooldown) => now.signed_duration_since(last) < cooldown,
        None => true,
    }
}
