use crate::channel::ChannelRegistry;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use vigil_common::types::Priority;

/// Delivered over sent; 0 when nothing was sent.
pub fn delivery_rate(delivered: u64, sent: u64) -> f64 {
    if sent == 0 {
        0.0
    } else {
        delivered as f64 / sent as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub delivery_rate: f64,
    pub average_latency_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowSnapshot {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub delivery_rate: f64,
}

/// Dispatch statistics at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_sent: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub total_suppressed: u64,
    pub total_cancelled: u64,
    pub delivery_rate: f64,
    pub by_channel: BTreeMap<String, CounterSnapshot>,
    pub by_priority: BTreeMap<Priority, CounterSnapshot>,
    pub last_24_hours: WindowSnapshot,
    pub queue_depth: BTreeMap<Priority, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counter {
    sent: u64,
    delivered: u64,
    failed: u64,
    total_latency_ms: u64,
}

impl Counter {
    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            sent: self.sent,
            delivered: self.delivered,
            failed: self.failed,
            delivery_rate: delivery_rate(self.delivered, self.sent),
            average_latency_ms: if self.delivered == 0 {
                0.0
            } else {
                self.total_latency_ms as f64 / self.delivered as f64
            },
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    totals: Counter,
    by_priority: [Counter; 5],
    suppressed: u64,
    cancelled: u64,
    recent: VecDeque<(DateTime<Utc>, Outcome)>,
}

impl Inner {
    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(24);
        while self.recent.front().is_some_and(|(t, _)| *t <= cutoff) {
            self.recent.pop_front();
        }
    }
}

/// Engine-wide counters. "Sent" counts messages that reached their first
/// delivery attempt.
#[derive(Debug, Default)]
pub(crate) struct DispatchStats {
    inner: Mutex<Inner>,
}

impl DispatchStats {
    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn record_sent(&self, priority: Priority, now: DateTime<Utc>) {
        self.with(|s| {
            s.totals.sent += 1;
            s.by_priority[priority.index()].sent += 1;
            s.recent.push_back((now, Outcome::Sent));
            s.prune(now);
        });
    }

    pub(crate) fn record_delivered(&self, priority: Priority, latency_ms: u64, now: DateTime<Utc>) {
        self.with(|s| {
            for c in [&mut s.totals, &mut s.by_priority[priority.index()]] {
                c.delivered += 1;
                c.total_latency_ms += latency_ms;
            }
            s.recent.push_back((now, Outcome::Delivered));
            s.prune(now);
        });
    }

    pub(crate) fn record_failed(&self, priority: Priority, now: DateTime<Utc>) {
        self.with(|s| {
            s.totals.failed += 1;
            s.by_priority[priority.index()].failed += 1;
            s.recent.push_back((now, Outcome::Failed));
            s.prune(now);
        });
    }

    pub(crate) fn record_suppressed(&self) {
        self.with(|s| s.suppressed += 1);
    }

    pub(crate) fn record_cancelled(&self) {
        self.with(|s| s.cancelled += 1);
    }

    pub(crate) fn snapshot(
        &self,
        now: DateTime<Utc>,
        registry: &ChannelRegistry,
        queue_depth: BTreeMap<Priority, usize>,
    ) -> StatsSnapshot {
        self.with(|s| {
            s.prune(now);
            let mut window = WindowSnapshot::default();
            for (_, outcome) in &s.recent {
                match outcome {
                    Outcome::Sent => window.sent += 1,
                    Outcome::Delivered => window.delivered += 1,
                    Outcome::Failed => window.failed += 1,
                }
            }
            window.delivery_rate = delivery_rate(window.delivered, window.sent);

            StatsSnapshot {
                total_sent: s.totals.sent,
                total_delivered: s.totals.delivered,
                total_failed: s.totals.failed,
                total_suppressed: s.suppressed,
                total_cancelled: s.cancelled,
                delivery_rate: delivery_rate(s.totals.delivered, s.totals.sent),
                by_channel: registry
                    .channels()
                    .map(|c| (c.id().to_string(), c.counters()))
                    .collect(),
                by_priority: Priority::ALL
                    .iter()
                    .map(|p| (*p, s.by_priority[p.index()].snapshot()))
                    .collect(),
                last_24_hours: window,
                queue_depth,
            }
        })
    }
}
