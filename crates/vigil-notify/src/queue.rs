use crate::template::ALERT_DEFAULT_TEMPLATE;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use vigil_common::types::{Priority, Severity};

/// What happens to an alert notification that exceeds a recipient's budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Count it as suppressed and move on.
    #[default]
    Drop,
    /// Schedule it for when the budget window reopens.
    Defer,
}

fn default_tick_interval_ms() -> u64 {
    2_000
}

fn default_alert_template_id() -> String {
    ALERT_DEFAULT_TEMPLATE.to_string()
}

fn default_unhealthy_after_failures() -> u32 {
    5
}

/// Dispatch tuning: tick rate, severity mapping, per-lane batch sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityPolicy {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Overrides of the built-in severity to priority mapping.
    #[serde(default)]
    pub severity_priority: BTreeMap<Severity, Priority>,
    /// Overrides of the built-in per-tick batch sizes.
    #[serde(default)]
    pub batch_sizes: BTreeMap<Priority, usize>,
    #[serde(default)]
    pub recipient_overflow: OverflowPolicy,
    #[serde(default = "default_alert_template_id")]
    pub alert_template_id: String,
    /// Consecutive failed attempts before a channel is marked unhealthy. 0 never.
    #[serde(default = "default_unhealthy_after_failures")]
    pub unhealthy_after_failures: u32,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            severity_priority: BTreeMap::new(),
            batch_sizes: BTreeMap::new(),
            recipient_overflow: OverflowPolicy::default(),
            alert_template_id: default_alert_template_id(),
            unhealthy_after_failures: default_unhealthy_after_failures(),
        }
    }
}

impl PriorityPolicy {
    pub fn priority_for(&self, severity: Severity) -> Priority {
        if let Some(p) = self.severity_priority.get(&severity) {
            return *p;
        }
        match severity {
            Severity::Critical => Priority::Immediate,
            Severity::High => Priority::High,
            Severity::Medium => Priority::Normal,
            Severity::Low => Priority::Low,
            Severity::Info => Priority::Batch,
        }
    }

    /// Messages pulled from a lane per tick. Never below 1.
    pub fn batch_size(&self, priority: Priority) -> usize {
        let size = self.batch_sizes.get(&priority).copied().unwrap_or(match priority {
            Priority::Immediate => 1,
            Priority::High => 3,
            Priority::Normal => 5,
            Priority::Low => 10,
            Priority::Batch => 20,
        });
        size.max(1)
    }
}

/// One FIFO lane of message ids per priority.
#[derive(Debug, Default)]
pub struct PriorityQueues {
    lanes: [Mutex<VecDeque<String>>; 5],
}

impl PriorityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, priority: Priority) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.lanes[priority.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, priority: Priority, id: String) {
        self.lane(priority).push_back(id);
    }

    /// Removes up to `max` ids from the front of a lane.
    pub fn pull(&self, priority: Priority, max: usize) -> Vec<String> {
        let mut lane = self.lane(priority);
        let n = max.min(lane.len());
        lane.drain(..n).collect()
    }

    pub fn len(&self, priority: Priority) -> usize {
        self.lane(priority).len()
    }

    pub fn total_len(&self) -> usize {
        Priority::ALL.iter().map(|p| self.len(*p)).sum()
    }

    pub fn depths(&self) -> BTreeMap<Priority, usize> {
        Priority::ALL.iter().map(|p| (*p, self.len(*p))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mapping() {
        let policy = PriorityPolicy::default();
        assert_eq!(policy.priority_for(Severity::Critical), Priority::Immediate);
        assert_eq!(policy.priority_for(Severity::Medium), Priority::Normal);
        assert_eq!(policy.priority_for(Severity::Info), Priority::Batch);
        assert_eq!(policy.batch_size(Priority::High), 3);
    }

    #[test]
    fn overrides_apply_per_key() {
        let mut policy = PriorityPolicy::default();
        policy.severity_priority.insert(Severity::Low, Priority::Normal);
        policy.batch_sizes.insert(Priority::Low, 0);
        assert_eq!(policy.priority_for(Severity::Low), Priority::Normal);
        assert_eq!(policy.priority_for(Severity::High), Priority::High);
        assert_eq!(policy.batch_size(Priority::Low), 1);
    }

    #[test]
    fn lanes_are_fifo_and_bounded_by_batch() {
        let queues = PriorityQueues::new();
        for i in 0..5 {
            queues.push(Priority::Normal, format!("m{i}"));
        }
        queues.push(Priority::Immediate, "urgent".to_string());

        assert_eq!(queues.pull(Priority::Normal, 2), vec!["m0", "m1"]);
        assert_eq!(queues.len(Priority::Normal), 3);
        assert_eq!(queues.total_len(), 4);
        assert_eq!(queues.pull(Priority::Immediate, 10), vec!["urgent"]);
        assert!(queues.pull(Priority::Batch, 10).is_empty());
    }
}
