use crate::error::{NotifyError, Result};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::retry::{RetryClassification, RetryClassifier, RetryPolicy};
use crate::stats::{delivery_rate, CounterSnapshot};
use crate::Deliverer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use vigil_common::types::{ChannelType, Priority};

fn default_true() -> bool {
    true
}

/// Static definition of a channel instance, as loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Plugin-specific settings (SMTP host, gateway URL, secrets).
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Empty means every priority.
    #[serde(default)]
    pub supported_priorities: Vec<Priority>,
    #[serde(default)]
    pub retry_classification: RetryClassification,
}

impl ChannelSpec {
    pub fn new(id: impl Into<String>, channel_type: ChannelType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            channel_type,
            enabled: true,
            config: Value::Null,
            retry_policy: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            supported_priorities: Vec::new(),
            retry_classification: RetryClassification::default(),
        }
    }
}

#[derive(Debug, Default)]
struct ChannelCounters {
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    total_latency_ms: AtomicU64,
}

/// A configured channel instance with its live health and counters.
///
/// Static settings are immutable after construction; health, counters and
/// the rate limiter use interior mutability so the registry can be shared.
pub struct NotificationChannel {
    spec: ChannelSpec,
    deliverer: Arc<dyn Deliverer>,
    classifier: Box<dyn RetryClassifier>,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    counters: ChannelCounters,
    limiter: Mutex<RateLimiter>,
}

impl NotificationChannel {
    pub fn new(spec: ChannelSpec, deliverer: Arc<dyn Deliverer>) -> Result<Self> {
        if spec.id.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("channel id is empty".to_string()));
        }
        if deliverer.channel_type() != spec.channel_type {
            return Err(NotifyError::InvalidConfig(format!(
                "channel '{}' is declared as {} but its deliverer handles {}",
                spec.id,
                spec.channel_type,
                deliverer.channel_type()
            )));
        }
        spec.retry_policy
            .validate()
            .map_err(|e| NotifyError::InvalidConfig(format!("channel '{}': {e}", spec.id)))?;

        Ok(Self {
            classifier: spec.retry_classification.classifier(),
            limiter: Mutex::new(RateLimiter::new(spec.rate_limit.clone())),
            spec,
            deliverer,
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            counters: ChannelCounters::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn channel_type(&self) -> ChannelType {
        self.spec.channel_type
    }

    pub fn is_enabled(&self) -> bool {
        self.spec.enabled
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.spec.retry_policy
    }

    pub fn deliverer(&self) -> &Arc<dyn Deliverer> {
        &self.deliverer
    }

    pub fn should_retry(&self, error: &NotifyError) -> bool {
        self.classifier.should_retry(error)
    }

    pub fn supports(&self, priority: Priority) -> bool {
        self.spec.supported_priorities.is_empty() || self.spec.supported_priorities.contains(&priority)
    }

    /// Enabled, healthy and accepting this priority.
    pub fn is_eligible(&self, priority: Priority) -> bool {
        self.is_enabled() && self.is_healthy() && self.supports(priority)
    }

    /// Takes one slot from the rolling rate budget.
    pub fn try_acquire(&self, now: DateTime<Utc>) -> bool {
        let granted = self
            .limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_acquire(now);
        if !granted {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
        }
        granted
    }

    pub(crate) fn record_sent(&self) {
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// A successful attempt. Restores health.
    pub(crate) fn record_delivered(&self, latency_ms: u64) {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_latency_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if !self.healthy.swap(true, Ordering::Relaxed) {
            tracing::info!(channel_id = %self.spec.id, "Channel healthy again");
        }
    }

    /// A failed attempt. Returns true when this failure flipped the channel
    /// to unhealthy.
    pub(crate) fn record_attempt_failure(&self, unhealthy_after: u32) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        unhealthy_after > 0 && failures >= unhealthy_after && self.healthy.swap(false, Ordering::Relaxed)
    }

    /// The message on this channel failed for good.
    pub(crate) fn record_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    pub fn restore(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.healthy.store(true, Ordering::Relaxed);
    }

    pub fn counters(&self) -> CounterSnapshot {
        let sent = self.counters.sent.load(Ordering::Relaxed);
        let delivered = self.counters.delivered.load(Ordering::Relaxed);
        let total_latency = self.counters.total_latency_ms.load(Ordering::Relaxed);
        CounterSnapshot {
            sent,
            delivered,
            failed: self.counters.failed.load(Ordering::Relaxed),
            delivery_rate: delivery_rate(delivered, sent),
            average_latency_ms: if delivered == 0 {
                0.0
            } else {
                total_latency as f64 / delivered as f64
            },
        }
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            channel_type: self.spec.channel_type,
            enabled: self.spec.enabled,
            healthy: self.is_healthy(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            counters: self.counters(),
        }
    }
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("id", &self.spec.id)
            .field("channel_type", &self.spec.channel_type)
            .field("enabled", &self.spec.enabled)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

/// Point-in-time view of a channel for logs and status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub id: String,
    pub name: String,
    pub channel_type: ChannelType,
    pub enabled: bool,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub rate_limited: u64,
    pub counters: CounterSnapshot,
}

/// All configured channels, keyed by id.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, Arc<NotificationChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: NotificationChannel) -> Result<Arc<NotificationChannel>> {
        if self.channels.contains_key(channel.id()) {
            return Err(NotifyError::InvalidConfig(format!(
                "duplicate channel id '{}'",
                channel.id()
            )));
        }
        let channel = Arc::new(channel);
        self.channels.insert(channel.id().to_string(), channel.clone());
        Ok(channel)
    }

    pub fn get(&self, id: &str) -> Option<Arc<NotificationChannel>> {
        self.channels.get(id).cloned()
    }

    /// Channels ordered by id.
    pub fn channels(&self) -> impl Iterator<Item = &Arc<NotificationChannel>> {
        self.channels.values()
    }

    /// First eligible channel of a type, by id order.
    pub fn select(&self, channel_type: ChannelType, priority: Priority) -> Option<Arc<NotificationChannel>> {
        self.channels
            .values()
            .find(|c| c.channel_type() == channel_type && c.is_eligible(priority))
            .cloned()
    }

    pub fn mark_unhealthy(&self, id: &str) -> Result<()> {
        self.get(id)
            .ok_or_else(|| NotifyError::ChannelNotFound(id.to_string()))?
            .mark_unhealthy();
        Ok(())
    }

    pub fn restore(&self, id: &str) -> Result<()> {
        self.get(id)
            .ok_or_else(|| NotifyError::ChannelNotFound(id.to_string()))?
            .restore();
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        self.channels.values().map(|c| c.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
