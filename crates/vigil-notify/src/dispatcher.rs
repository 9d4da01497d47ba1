//! Priority-queued delivery of notification messages.
//!
//! Messages live in one map keyed by id; the priority lanes only hold ids.
//! A message is claimed (`Queued -> Sending`) under the map lock, delivered
//! with no lock held, then its outcome is recorded under the lock again.
//! Retries and deferred sends are timers that put the id back into its lane.

use crate::channel::{ChannelRegistry, NotificationChannel};
use crate::error::{FailureKind, NotifyError, Result};
use crate::message::{
    AttemptOutcome, DeliveryAttempt, MessageRecipient, MessageStatus, NewMessage, NotificationMessage,
};
use crate::queue::{OverflowPolicy, PriorityPolicy, PriorityQueues};
use crate::recipient::{NotificationRecipient, RecipientDirectory};
use crate::stats::{DispatchStats, StatsSnapshot};
use crate::template::{RenderedContent, TemplateStore};
use crate::utils::{truncate_string, MAX_BODY_LENGTH};
use crate::{Delivery, DeliveryReceipt};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use vigil_common::clock::{Clock, SystemClock};
use vigil_common::types::{Alert, ChannelType, Priority, Severity};

/// Identifier used as the recipient of direct webhook calls.
const WEBHOOK_RECIPIENT_ID: &str = "webhook";

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Outcome of one delivery attempt, handed back to the message store.
struct AttemptReport {
    attempted_at: DateTime<Utc>,
    latency_ms: u64,
    result: Result<DeliveryReceipt>,
    rendered: Option<RenderedContent>,
    /// False for failures no retry can fix (rendering errors).
    retryable: bool,
}

struct Shared {
    registry: Arc<ChannelRegistry>,
    templates: Arc<TemplateStore>,
    directory: Arc<dyn RecipientDirectory>,
    policy: PriorityPolicy,
    clock: Arc<dyn Clock>,
    queues: PriorityQueues,
    messages: Mutex<HashMap<String, NotificationMessage>>,
    /// Per-recipient send times (and deferred slots) over the last day.
    budgets: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    stats: DispatchStats,
    running: AtomicBool,
}

/// Turns alerts into per-recipient, per-channel messages and delivers them.
///
/// Call [`DispatchEngine::start`] to run the periodic dispatch loop, or drive
/// it by hand with [`DispatchEngine::process_tick`].
pub struct DispatchEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl DispatchEngine {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        templates: Arc<TemplateStore>,
        directory: Arc<dyn RecipientDirectory>,
        policy: PriorityPolicy,
    ) -> Self {
        Self::with_clock(registry, templates, directory, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        registry: Arc<ChannelRegistry>,
        templates: Arc<TemplateStore>,
        directory: Arc<dyn RecipientDirectory>,
        policy: PriorityPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                templates,
                directory,
                policy,
                clock,
                queues: PriorityQueues::new(),
                messages: Mutex::new(HashMap::new()),
                budgets: Mutex::new(HashMap::new()),
                stats: DispatchStats::default(),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.shared.registry
    }

    pub fn policy(&self) -> &PriorityPolicy {
        &self.shared.policy
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Fans an alert out at the priority its severity maps to.
    ///
    /// Returns the created messages as they were at creation. Recipients in
    /// quiet hours, over budget (with `drop` overflow) or without an eligible
    /// channel produce nothing. Channel types the alert template has no
    /// variant for are skipped.
    pub async fn send_alert_notification(&self, alert: &Alert, recipient_ids: &[String]) -> Vec<NotificationMessage> {
        let priority = self.shared.policy.priority_for(alert.severity());
        self.send_alert_notification_with_priority(alert, recipient_ids, priority)
            .await
    }

    /// Like [`Self::send_alert_notification`] with an explicit priority.
    pub async fn send_alert_notification_with_priority(
        &self,
        alert: &Alert,
        recipient_ids: &[String],
        priority: Priority,
    ) -> Vec<NotificationMessage> {
        let shared = &self.shared;
        let now = shared.clock.now();
        let alert_json = alert_context(alert);
        let mut created = Vec::new();

        for recipient_id in recipient_ids {
            let Some(recipient) = shared.directory.get(recipient_id) else {
                tracing::warn!(alert_id = %alert.id(), recipient_id = %recipient_id, "Unknown recipient, skipping");
                continue;
            };

            if alert.severity() < Severity::Critical && recipient.in_quiet_hours(now) {
                tracing::info!(
                    alert_id = %alert.id(),
                    recipient_id = %recipient.id,
                    severity = %alert.severity(),
                    "Notification suppressed (quiet hours)"
                );
                shared.stats.record_suppressed();
                continue;
            }

            for channel_type in recipient.channels_for(alert.severity()) {
                if let Err(e) = shared.check_template(&shared.policy.alert_template_id, channel_type) {
                    tracing::debug!(
                        alert_id = %alert.id(),
                        recipient_id = %recipient.id,
                        channel_type = %channel_type,
                        error = %e,
                        "Alert template cannot render this channel"
                    );
                    continue;
                }
                let Some(channel) = shared.registry.select(channel_type, priority) else {
                    tracing::debug!(
                        alert_id = %alert.id(),
                        recipient_id = %recipient.id,
                        channel_type = %channel_type,
                        "No eligible channel"
                    );
                    continue;
                };
                let Some(address) = recipient.address(channel_type) else {
                    continue;
                };
                let Some(scheduled_at) = shared.reserve_budget(&recipient, now) else {
                    tracing::info!(
                        alert_id = %alert.id(),
                        recipient_id = %recipient.id,
                        channel_type = %channel_type,
                        "Notification dropped (recipient budget exhausted)"
                    );
                    shared.stats.record_suppressed();
                    continue;
                };

                let message = NotificationMessage::new(
                    NewMessage {
                        alert_id: Some(alert.id().to_string()),
                        channel_id: channel.id().to_string(),
                        channel_type,
                        recipient: MessageRecipient {
                            id: recipient.id.clone(),
                            name: recipient.name.clone(),
                            address: address.to_string(),
                        },
                        template_id: shared.policy.alert_template_id.clone(),
                        priority,
                        scheduled_at,
                        context: json!({
                            "alert": alert_json,
                            "recipient": recipient.template_context(),
                        }),
                    },
                    now,
                );
                created.push(message.clone());
                shared.admit(message, now);
            }
        }

        tracing::debug!(
            alert_id = %alert.id(),
            priority = %priority,
            messages = created.len(),
            "Alert fanned out"
        );
        if priority == Priority::Immediate && !created.is_empty() {
            self.drain_immediate().await;
        }
        created
    }

    /// Sends one templated message to a recipient over a named channel.
    ///
    /// `context` is exposed to the template at the top level, alongside
    /// `recipient`. Recipient budgets and quiet hours do not apply.
    pub async fn send_custom_notification(
        &self,
        recipient_id: &str,
        channel_id: &str,
        template_id: &str,
        context: Value,
        priority: Priority,
    ) -> Result<NotificationMessage> {
        let shared = &self.shared;
        let channel = shared.enabled_channel(channel_id)?;
        shared.check_template(template_id, channel.channel_type())?;
        let recipient = shared
            .directory
            .get(recipient_id)
            .ok_or_else(|| NotifyError::RecipientNotFound(recipient_id.to_string()))?;
        let address = recipient.address(channel.channel_type()).ok_or_else(|| {
            NotifyError::InvalidConfig(format!(
                "recipient '{}' has no {} contact",
                recipient.id,
                channel.channel_type()
            ))
        })?;

        let mut map = match context {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        map.entry("recipient")
            .or_insert_with(|| recipient.template_context());

        let now = shared.clock.now();
        let message = NotificationMessage::new(
            NewMessage {
                alert_id: None,
                channel_id: channel.id().to_string(),
                channel_type: channel.channel_type(),
                recipient: MessageRecipient {
                    id: recipient.id.clone(),
                    name: recipient.name.clone(),
                    address: address.to_string(),
                },
                template_id: template_id.to_string(),
                priority,
                scheduled_at: now,
                context: Value::Object(map),
            },
            now,
        );
        Ok(self.submit(message).await)
    }

    /// Posts an alert to a webhook channel, optionally at a different URL.
    pub async fn send_webhook_call(
        &self,
        alert: &Alert,
        channel_id: &str,
        url: Option<&str>,
    ) -> Result<NotificationMessage> {
        let shared = &self.shared;
        let channel = shared.enabled_channel(channel_id)?;
        if channel.channel_type() != ChannelType::Webhook {
            return Err(NotifyError::InvalidConfig(format!(
                "channel '{channel_id}' is a {} channel, not a webhook",
                channel.channel_type()
            )));
        }
        shared.check_template(&shared.policy.alert_template_id, ChannelType::Webhook)?;

        let now = shared.clock.now();
        let message = NotificationMessage::new(
            NewMessage {
                alert_id: Some(alert.id().to_string()),
                channel_id: channel.id().to_string(),
                channel_type: ChannelType::Webhook,
                recipient: MessageRecipient {
                    id: WEBHOOK_RECIPIENT_ID.to_string(),
                    name: channel.name().to_string(),
                    address: url.unwrap_or_default().to_string(),
                },
                template_id: shared.policy.alert_template_id.clone(),
                priority: shared.policy.priority_for(alert.severity()),
                scheduled_at: now,
                context: json!({ "alert": alert_context(alert) }),
            },
            now,
        );
        Ok(self.submit(message).await)
    }

    /// Cancels a queued message. Messages already sending or finished cannot
    /// be cancelled.
    pub fn cancel(&self, message_id: &str) -> Result<NotificationMessage> {
        let mut messages = self.shared.lock_messages();
        let message = messages
            .get_mut(message_id)
            .ok_or_else(|| NotifyError::MessageNotFound(message_id.to_string()))?;
        message.cancel()?;
        self.shared.stats.record_cancelled();
        tracing::info!(message_id = %message_id, "Notification cancelled");
        Ok(message.clone())
    }

    pub fn message(&self, message_id: &str) -> Option<NotificationMessage> {
        self.shared.lock_messages().get(message_id).cloned()
    }

    /// All known messages, oldest first.
    pub fn messages(&self) -> Vec<NotificationMessage> {
        let mut all: Vec<_> = self.shared.lock_messages().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Forgets terminal messages last touched before `older_than`.
    pub fn prune_terminal(&self, older_than: DateTime<Utc>) -> usize {
        let mut messages = self.shared.lock_messages();
        let before = messages.len();
        messages.retain(|_, m| !m.status.is_terminal() || m.updated_at() >= older_than);
        before - messages.len()
    }

    pub fn queue_depth(&self, priority: Priority) -> usize {
        self.shared.queues.len(priority)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot(
            self.shared.clock.now(),
            &self.shared.registry,
            self.shared.queues.depths(),
        )
    }

    /// Drains every lane once, highest priority first, and waits for the
    /// deliveries. Returns how many ids were pulled.
    pub async fn process_tick(&self) -> usize {
        self.shared.drain_all().await
    }

    /// Health-checks every enabled channel, then starts the periodic dispatch
    /// loop. Channels failing the check are marked unhealthy.
    pub async fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.check_channels().await;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let period = Duration::from_millis(self.shared.policy.tick_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        shared.drain_all().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("Dispatch loop exited");
        });

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(Worker { shutdown, handle });
        tracing::info!(
            tick_interval_ms = self.shared.policy.tick_interval_ms,
            channels = self.shared.registry.len(),
            "Dispatch engine started"
        );
    }

    /// Stops the dispatch loop after its current tick completes. Queued
    /// messages stay queued.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            if let Err(e) = worker.handle.await {
                tracing::error!(error = %e, "Dispatch loop task failed");
            }
        }
        tracing::info!(queued = self.shared.queues.total_len(), "Dispatch engine stopped");
    }

    async fn submit(&self, message: NotificationMessage) -> NotificationMessage {
        let priority = message.priority;
        let snapshot = message.clone();
        self.shared.admit(message, snapshot.created_at);
        if priority == Priority::Immediate {
            self.drain_immediate().await;
        }
        snapshot
    }

    /// Empties the immediate lane inline. Retries re-enter through timers, so
    /// this terminates.
    async fn drain_immediate(&self) {
        if !self.is_running() {
            return;
        }
        while self.shared.drain_lane(Priority::Immediate).await > 0 {}
    }
}

/// The alert as templates and webhook payloads see it.
fn alert_context(alert: &Alert) -> Value {
    json!({
        "id": alert.id(),
        "rule_id": alert.rule_id(),
        "event_id": alert.event_id(),
        "type": alert.alert_type(),
        "severity": alert.severity().as_str(),
        "title": alert.title(),
        "message": alert.message(),
        "detected_at": alert.detected_at().to_rfc3339(),
        "location": alert.location(),
        "context": alert.context(),
    })
}

/// When a retry scheduled `delay` after `now` is due. Saturates at the
/// latest representable instant.
pub(crate) fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Shared {
    fn lock_messages(&self) -> MutexGuard<'_, HashMap<String, NotificationMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enabled_channel(&self, channel_id: &str) -> Result<Arc<NotificationChannel>> {
        let channel = self
            .registry
            .get(channel_id)
            .ok_or_else(|| NotifyError::ChannelNotFound(channel_id.to_string()))?;
        if !channel.is_enabled() {
            return Err(NotifyError::ChannelDisabled(channel_id.to_string()));
        }
        Ok(channel)
    }

    fn check_template(&self, template_id: &str, channel_type: ChannelType) -> Result<()> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| NotifyError::TemplateNotFound(template_id.to_string()))?;
        if !template.supports(channel_type) {
            return Err(NotifyError::TemplateUnsupported {
                template_id: template_id.to_string(),
                channel_type,
            });
        }
        Ok(())
    }

    /// Takes a slot from the recipient's hourly/daily budget.
    ///
    /// Returns when the message may go out, or `None` when it should be
    /// dropped. A limit of 0 is treated as no limit.
    fn reserve_budget(&self, recipient: &NotificationRecipient, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limits = [
            (recipient.max_notifications_per_hour, chrono::Duration::hours(1)),
            (recipient.max_notifications_per_day, chrono::Duration::days(1)),
        ];
        if limits.iter().all(|(limit, _)| limit.unwrap_or(0) == 0) {
            return Some(now);
        }

        let mut budgets = self.budgets.lock().unwrap_or_else(PoisonError::into_inner);
        let history = budgets.entry(recipient.id.clone()).or_default();
        let day_ago = now - chrono::Duration::days(1);
        while history.front().is_some_and(|t| *t <= day_ago) {
            history.pop_front();
        }

        let reopens_at = limits
            .iter()
            .filter_map(|(limit, window)| {
                let limit = limit.filter(|l| *l > 0)? as usize;
                let cutoff = now - *window;
                let in_window: Vec<DateTime<Utc>> = history.iter().copied().filter(|t| *t > cutoff).collect();
                (in_window.len() >= limit).then(|| in_window[in_window.len() - limit] + *window)
            })
            .max();

        let slot = match reopens_at {
            None => now,
            Some(_) if self.policy.recipient_overflow == OverflowPolicy::Drop => return None,
            Some(at) => at,
        };
        let pos = history.partition_point(|t| *t <= slot);
        history.insert(pos, slot);
        Some(slot)
    }

    /// Stores a new message and queues it, now or at its scheduled time.
    fn admit(self: &Arc<Self>, message: NotificationMessage, now: DateTime<Utc>) {
        let id = message.id.clone();
        let priority = message.priority;
        let delay = (message.scheduled_at - now).to_std().unwrap_or(Duration::ZERO);
        self.lock_messages().insert(id.clone(), message);
        if delay.is_zero() {
            self.queues.push(priority, id);
        } else {
            tracing::debug!(message_id = %id, delay_ms = delay.as_millis() as u64, "Notification deferred");
            self.schedule(id, priority, delay);
        }
    }

    fn schedule(self: &Arc<Self>, id: String, priority: Priority, delay: Duration) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.requeue(id, priority);
        });
    }

    fn requeue(&self, id: String, priority: Priority) {
        let queued = self
            .lock_messages()
            .get(&id)
            .is_some_and(|m| m.status == MessageStatus::Queued);
        if queued {
            self.queues.push(priority, id);
        } else {
            tracing::debug!(message_id = %id, "Dropping timer for message no longer queued");
        }
    }

    async fn check_channels(&self) {
        let mut checks = JoinSet::new();
        for channel in self.registry.channels().filter(|c| c.is_enabled()) {
            let channel = Arc::clone(channel);
            checks.spawn(async move {
                let result = channel.deliverer().health_check().await;
                (channel, result)
            });
        }
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((channel, Ok(()))) => {
                    tracing::debug!(channel_id = %channel.id(), "Channel health check ok");
                }
                Ok((channel, Err(e))) => {
                    channel.mark_unhealthy();
                    tracing::error!(
                        channel_id = %channel.id(),
                        error = %e,
                        "Channel failed startup health check, marked unhealthy"
                    );
                }
                Err(e) => tracing::error!(error = %e, "Channel health check task failed"),
            }
        }
    }

    async fn drain_all(self: &Arc<Self>) -> usize {
        let mut pulled = 0;
        for priority in Priority::ALL {
            pulled += self.drain_lane(priority).await;
        }
        pulled
    }

    /// Delivers one batch from a lane concurrently and waits for all of it.
    async fn drain_lane(self: &Arc<Self>, priority: Priority) -> usize {
        let ids = self.queues.pull(priority, self.policy.batch_size(priority));
        let pulled = ids.len();
        if pulled == 0 {
            return 0;
        }

        let mut batch = JoinSet::new();
        for id in ids {
            let shared = Arc::clone(self);
            batch.spawn(async move { shared.deliver(id).await });
        }
        while let Some(joined) = batch.join_next().await {
            if let Err(e) = joined {
                tracing::error!(priority = %priority, error = %e, "Delivery task failed");
            }
        }
        pulled
    }

    async fn deliver(self: &Arc<Self>, id: String) {
        let attempted_at = self.clock.now();
        let claimed = self
            .lock_messages()
            .get_mut(&id)
            .and_then(|m| m.begin_sending().ok().map(|()| m.clone()));
        let Some(message) = claimed else {
            tracing::debug!(message_id = %id, "Skipping message no longer queued");
            return;
        };

        let Some(channel) = self.registry.get(&message.channel_id) else {
            self.fail_orphan(&id, attempted_at, NotifyError::ChannelNotFound(message.channel_id.clone()));
            return;
        };

        if message.attempts.is_empty() {
            self.stats.record_sent(message.priority, attempted_at);
            channel.record_sent();
        }

        let rendered = if message.is_rendered() {
            None
        } else {
            match self.render(&message) {
                Ok(r) => Some(r),
                Err(e) => {
                    let report = AttemptReport {
                        attempted_at,
                        latency_ms: 0,
                        result: Err(e),
                        rendered: None,
                        retryable: false,
                    };
                    self.complete(&id, &channel, report);
                    return;
                }
            }
        };
        let (subject, body, format) = match &rendered {
            Some(r) => (r.subject.as_str(), r.body.as_str(), r.format),
            None => (
                message.subject.as_deref().unwrap_or_default(),
                message.body.as_deref().unwrap_or_default(),
                message.format,
            ),
        };

        let started = Instant::now();
        let result = if channel.try_acquire(attempted_at) {
            let delivery = Delivery {
                message_id: &message.id,
                recipient_id: &message.recipient.id,
                address: &message.recipient.address,
                subject,
                body,
                format,
                priority: message.priority,
                context: &message.context,
            };
            channel.deliverer().deliver(&delivery).await
        } else {
            Err(NotifyError::RateLimited(channel.id().to_string()))
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let report = AttemptReport {
            attempted_at,
            latency_ms,
            result,
            rendered,
            retryable: true,
        };
        self.complete(&id, &channel, report);
    }

    fn render(&self, message: &NotificationMessage) -> Result<RenderedContent> {
        self.templates
            .get(&message.template_id)
            .ok_or_else(|| NotifyError::TemplateNotFound(message.template_id.clone()))?
            .render(message.channel_type, &message.context)
    }

    /// Records an attempt outcome and decides between delivered, retry and
    /// failed.
    fn complete(self: &Arc<Self>, id: &str, channel: &NotificationChannel, report: AttemptReport) {
        let now = self.clock.now();
        let mut requeue = None;
        {
            let mut messages = self.lock_messages();
            let Some(message) = messages.get_mut(id) else {
                return;
            };
            if let Some(rendered) = report.rendered {
                message.subject = Some(rendered.subject);
                message.body = Some(rendered.body);
                message.format = rendered.format;
            }

            let attempt_number = message.next_attempt_number();
            let mut attempt = DeliveryAttempt {
                attempt_number,
                attempted_at: report.attempted_at,
                outcome: AttemptOutcome::Success,
                response_code: None,
                response_message: None,
                error: None,
                latency_ms: report.latency_ms,
                retry_delay_ms: None,
            };

            match report.result {
                Ok(receipt) => {
                    attempt.response_code = receipt.response_code;
                    attempt.response_message = receipt
                        .response_message
                        .map(|m| truncate_string(&m, MAX_BODY_LENGTH));
                    if let Err(e) = message.record_success(attempt, now) {
                        tracing::warn!(message_id = %id, error = %e, "Could not record delivery");
                        return;
                    }
                    channel.record_delivered(report.latency_ms);
                    self.stats
                        .record_delivered(message.priority, report.latency_ms, now);
                    tracing::info!(
                        message_id = %id,
                        channel_id = %channel.id(),
                        attempt = attempt_number,
                        latency_ms = report.latency_ms,
                        "Notification delivered"
                    );
                }
                Err(err) => {
                    attempt.error = Some(err.to_string());
                    if let NotifyError::ApiError { status, .. } = &err {
                        attempt.response_code = Some(*status);
                    }

                    let counts_against_channel =
                        err.kind() == FailureKind::Transient && !matches!(err, NotifyError::RateLimited(_));
                    if counts_against_channel
                        && channel.record_attempt_failure(self.policy.unhealthy_after_failures)
                    {
                        tracing::error!(
                            channel_id = %channel.id(),
                            threshold = self.policy.unhealthy_after_failures,
                            "Channel marked unhealthy after consecutive failures"
                        );
                    }

                    let policy = channel.retry_policy();
                    if report.retryable && channel.should_retry(&err) && policy.allows_retry(attempt_number) {
                        let delay = policy.delay_for(attempt_number);
                        attempt.outcome = AttemptOutcome::Retry;
                        attempt.retry_delay_ms = Some(delay.as_millis() as u64);
                        let next_at = retry_at(now, delay);
                        if message.record_retry(attempt, next_at).is_ok() {
                            tracing::warn!(
                                message_id = %id,
                                channel_id = %channel.id(),
                                attempt = attempt_number,
                                retry_in_ms = delay.as_millis() as u64,
                                error = %err,
                                "Delivery failed, retry scheduled"
                            );
                            requeue = Some((message.priority, delay));
                        }
                    } else {
                        attempt.outcome = AttemptOutcome::Failed;
                        if message.record_failure(attempt).is_ok() {
                            channel.record_failed();
                            self.stats.record_failed(message.priority, now);
                            tracing::error!(
                                message_id = %id,
                                channel_id = %channel.id(),
                                attempt = attempt_number,
                                error = %err,
                                "Delivery failed permanently"
                            );
                        }
                    }
                }
            }
        }

        if let Some((priority, delay)) = requeue {
            self.schedule(id.to_string(), priority, delay);
        }
    }

    fn fail_orphan(&self, id: &str, attempted_at: DateTime<Utc>, err: NotifyError) {
        let mut messages = self.lock_messages();
        let Some(message) = messages.get_mut(id) else {
            return;
        };
        let attempt = DeliveryAttempt {
            attempt_number: message.next_attempt_number(),
            attempted_at,
            outcome: AttemptOutcome::Failed,
            response_code: None,
            response_message: None,
            error: Some(err.to_string()),
            latency_ms: 0,
            retry_delay_ms: None,
        };
        let first_attempt = message.attempts.is_empty();
        if message.record_failure(attempt).is_ok() {
            let now = self.clock.now();
            if first_attempt {
                self.stats.record_sent(message.priority, now);
            }
            self.stats.record_failed(message.priority, now);
            tracing::error!(message_id = %id, error = %err, "Message references an unknown channel");
        }
    }
}
