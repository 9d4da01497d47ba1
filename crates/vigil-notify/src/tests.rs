use crate::channel::{ChannelRegistry, ChannelSpec};
use crate::dispatcher::{retry_at, DispatchEngine};
use crate::error::{NotifyError, Result};
use crate::message::{AttemptOutcome, MessageStatus};
use crate::plugin::PluginRegistry;
use crate::queue::{OverflowPolicy, PriorityPolicy};
use crate::rate_limit::RateLimitConfig;
use crate::recipient::{ChannelPreference, InMemoryDirectory, NotificationRecipient, QuietHours};
use crate::retry::{RetryClassification, RetryPolicy};
use crate::template::{ChannelTemplate, NotificationTemplate, Personalization, TemplateFormat, TemplateStore};
use crate::{Deliverer, Delivery, DeliveryReceipt};
use async_trait::async_trait;
use chrono::{NaiveTime, TimeZone, Utc};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vigil_common::clock::ManualClock;
use vigil_common::types::{Alert, ChannelType, Priority, Severity};

// ── Test doubles ──

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    FailTransient,
    FailPermanent,
}

struct ScriptedDeliverer {
    channel_type: ChannelType,
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    healthy: bool,
    calls: AtomicUsize,
    delivered: Mutex<Vec<(String, String)>>,
}

impl ScriptedDeliverer {
    fn new(channel_type: ChannelType, fallback: Behavior) -> Arc<Self> {
        Self::scripted(channel_type, Vec::new(), fallback)
    }

    fn scripted(channel_type: ChannelType, script: Vec<Behavior>, fallback: Behavior) -> Arc<Self> {
        Arc::new(Self {
            channel_type,
            script: Mutex::new(script.into()),
            fallback,
            healthy: true,
            calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn unreachable(channel_type: ChannelType) -> Arc<Self> {
        Arc::new(Self {
            channel_type,
            script: Mutex::new(VecDeque::new()),
            fallback: Behavior::Succeed,
            healthy: false,
            calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// (subject, body) of every successful delivery, in order.
    fn delivered(&self) -> Vec<(String, String)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Deliverer for ScriptedDeliverer {
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<DeliveryReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        match behavior {
            Behavior::Succeed => {
                self.delivered
                    .lock()
                    .unwrap()
                    .push((delivery.subject.to_string(), delivery.body.to_string()));
                Ok(DeliveryReceipt {
                    response_code: Some(200),
                    response_message: Some("ok".to_string()),
                })
            }
            Behavior::FailTransient => Err(NotifyError::ApiError {
                service: "fake".to_string(),
                status: 503,
                body: "unavailable".to_string(),
            }),
            Behavior::FailPermanent => Err(NotifyError::Rejected("bad address".to_string())),
        }
    }

    fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    async fn health_check(&self) -> Result<()> {
        if self.healthy {
            Ok(())
        } else {
            Err(NotifyError::Unavailable("health check refused".to_string()))
        }
    }
}

// ── Fixtures ──

fn spec(id: &str, channel_type: ChannelType) -> ChannelSpec {
    let mut spec = ChannelSpec::new(id, channel_type);
    spec.rate_limit = RateLimitConfig::unlimited();
    spec.retry_policy = RetryPolicy {
        max_retries: 3,
        retry_delay_ms: 5_000,
        backoff_multiplier: 2.0,
        max_retry_delay_ms: 60_000,
    };
    spec
}

fn registry(channels: Vec<(ChannelSpec, Arc<ScriptedDeliverer>)>) -> Arc<ChannelRegistry> {
    let mut registry = ChannelRegistry::new();
    for (spec, deliverer) in channels {
        let channel = crate::channel::NotificationChannel::new(spec, deliverer).unwrap();
        registry.register(channel).unwrap();
    }
    Arc::new(registry)
}

fn field_engineer() -> NotificationRecipient {
    let mut recipient = NotificationRecipient::new("r1", "Dana")
        .with_contact(ChannelType::Email, "dana@example.com")
        .with_contact(ChannelType::Sms, "+15550100");
    for severity in Severity::ALL {
        let channels = if severity == Severity::Critical {
            vec![ChannelType::Email, ChannelType::Sms]
        } else {
            vec![ChannelType::Email]
        };
        recipient = recipient.with_channels(severity, channels);
    }
    recipient
}

fn engine_with(
    registry: Arc<ChannelRegistry>,
    recipients: Vec<NotificationRecipient>,
    policy: PriorityPolicy,
    clock: Arc<ManualClock>,
) -> DispatchEngine {
    DispatchEngine::with_clock(
        registry,
        Arc::new(TemplateStore::with_defaults()),
        Arc::new(InMemoryDirectory::new(recipients)),
        policy,
        clock,
    )
}

fn noon() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
}

fn alert(severity: Severity, title: &str) -> Alert {
    Alert::new("quality", severity, title, format!("{title} detected"), noon())
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ── Alert fan-out ──

#[tokio::test(start_paused = true)]
async fn critical_alert_goes_out_immediately_on_every_channel() {
    let email = ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed);
    let sms = ScriptedDeliverer::new(ChannelType::Sms, Behavior::Succeed);
    let engine = engine_with(
        registry(vec![
            (spec("email-ops", ChannelType::Email), email.clone()),
            (spec("sms-ops", ChannelType::Sms), sms.clone()),
        ]),
        vec![field_engineer()],
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );
    engine.start().await;

    let created = engine
        .send_alert_notification(&alert(Severity::Critical, "Crane overload"), &ids(&["r1"]))
        .await;

    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|m| m.priority == Priority::Immediate));
    for message in &created {
        let stored = engine.message(&message.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Delivered);
        assert_eq!(stored.attempts.len(), 1);
        assert_eq!(stored.attempts[0].response_code, Some(200));
    }
    assert_eq!(email.calls(), 1);
    assert_eq!(sms.calls(), 1);
    assert_eq!(sms.delivered()[0].1, "[critical] Crane overload: Crane overload detected");

    let stats = engine.stats();
    assert_eq!(stats.total_sent, 2);
    assert_eq!(stats.total_delivered, 2);
    assert_eq!(stats.delivery_rate, 1.0);
    assert_eq!(stats.by_priority[&Priority::Immediate].delivered, 2);
    assert_eq!(stats.by_channel["sms-ops"].delivered, 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failing_channel_backs_off_then_fails() {
    let email = ScriptedDeliverer::new(ChannelType::Email, Behavior::FailTransient);
    let engine = engine_with(
        registry(vec![(spec("email-ops", ChannelType::Email), email.clone())]),
        vec![field_engineer()],
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );
    engine.start().await;

    let created = engine
        .send_alert_notification(&alert(Severity::High, "Pump pressure"), &ids(&["r1"]))
        .await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].priority, Priority::High);

    tokio::time::sleep(Duration::from_secs(120)).await;
    engine.stop().await;

    let message = engine.message(&created[0].id).unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.attempts.len(), 4);
    assert_eq!(email.calls(), 4);

    let delays: Vec<_> = message.attempts.iter().map(|a| a.retry_delay_ms).collect();
    assert_eq!(delays, vec![Some(5_000), Some(10_000), Some(20_000), None]);
    let outcomes: Vec<_> = message.attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::Retry,
            AttemptOutcome::Retry,
            AttemptOutcome::Retry,
            AttemptOutcome::Failed
        ]
    );
    assert_eq!(message.attempts[3].response_code, Some(503));

    let stats = engine.stats();
    assert_eq!(stats.total_sent, 1);
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.delivery_rate, 0.0);
}

#[tokio::test(start_paused = true)]
async fn retry_succeeds_and_keeps_rendered_content() {
    let email = ScriptedDeliverer::scripted(
        ChannelType::Email,
        vec![Behavior::FailTransient],
        Behavior::Succeed,
    );
    let engine = engine_with(
        registry(vec![(spec("email-ops", ChannelType::Email), email.clone())]),
        vec![field_engineer()],
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );

    let created = engine
        .send_alert_notification(&alert(Severity::Medium, "Noise level"), &ids(&["r1"]))
        .await;
    engine.process_tick().await;

    let after_first = engine.message(&created[0].id).unwrap();
    assert_eq!(after_first.status, MessageStatus::Queued);
    assert_eq!(after_first.subject.as_deref(), Some("[medium] Noise level"));

    tokio::time::sleep(Duration::from_millis(5_001)).await;
    assert_eq!(engine.queue_depth(Priority::Normal), 1);
    engine.process_tick().await;

    let done = engine.message(&created[0].id).unwrap();
    assert_eq!(done.status, MessageStatus::Delivered);
    assert_eq!(done.attempts.len(), 2);
    assert_eq!(email.delivered()[0].0, "[medium] Noise level");
}

#[test]
fn retry_time_saturates_instead_of_overflowing() {
    assert_eq!(
        retry_at(noon(), Duration::from_secs(5)),
        noon() + chrono::Duration::seconds(5)
    );
    let far = retry_at(noon(), Duration::from_millis(9_000_000_000_000_000));
    assert_eq!(far, chrono::DateTime::<Utc>::MAX_UTC);
    assert_eq!(retry_at(noon(), Duration::MAX), chrono::DateTime::<Utc>::MAX_UTC);
}

#[tokio::test]
async fn transient_only_classifier_fails_rejections_at_once() {
    let email = ScriptedDeliverer::new(ChannelType::Email, Behavior::FailPermanent);
    let mut email_spec = spec("email-ops", ChannelType::Email);
    email_spec.retry_classification = RetryClassification::TransientOnly;
    let engine = engine_with(
        registry(vec![(email_spec, email.clone())]),
        vec![field_engineer()],
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );

    let created = engine
        .send_alert_notification(&alert(Severity::Low, "Dust"), &ids(&["r1"]))
        .await;
    engine.process_tick().await;

    let message = engine.message(&created[0].id).unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.attempts.len(), 1);
    assert!(message.attempts[0].error.as_deref().unwrap().contains("bad address"));
    // rejections are not the channel's fault
    assert!(engine.registry().get("email-ops").unwrap().is_healthy());
}

#[tokio::test]
async fn lanes_drain_in_priority_order() {
    let email = ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed);
    let engine = engine_with(
        registry(vec![(spec("email-ops", ChannelType::Email), email.clone())]),
        vec![field_engineer()],
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );

    for (severity, title) in [
        (Severity::Info, "batch"),
        (Severity::Low, "low"),
        (Severity::High, "high"),
        (Severity::Critical, "immediate"),
        (Severity::Medium, "normal"),
    ] {
        engine.send_alert_notification(&alert(severity, title), &ids(&["r1"])).await;
    }
    // not running: nothing drained inline, not even the immediate lane
    assert_eq!(email.calls(), 0);
    assert_eq!(engine.stats().queue_depth[&Priority::Batch], 1);
    assert_eq!(engine.queue_depth(Priority::Immediate), 1);

    assert_eq!(engine.process_tick().await, 5);
    let order: Vec<_> = email.delivered().into_iter().map(|(subject, _)| subject).collect();
    assert_eq!(
        order,
        vec![
            "[critical] immediate",
            "[high] high",
            "[medium] normal",
            "[low] low",
            "[info] batch"
        ]
    );
}

#[tokio::test]
async fn batch_size_limits_each_tick() {
    let email = ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed);
    let mut policy = PriorityPolicy::default();
    policy.batch_sizes.insert(Priority::Low, 2);
    let engine = engine_with(
        registry(vec![(spec("email-ops", ChannelType::Email), email.clone())]),
        vec![field_engineer()],
        policy,
        Arc::new(ManualClock::new(noon())),
    );
    for i in 0..5 {
        engine
            .send_alert_notification(&alert(Severity::Low, &format!("dust {i}")), &ids(&["r1"]))
            .await;
    }
    assert_eq!(engine.process_tick().await, 2);
    assert_eq!(engine.queue_depth(Priority::Low), 3);
    assert_eq!(email.calls(), 2);
}

// ── Recipient rules ──

#[tokio::test]
async fn quiet_hours_hold_back_all_but_critical() {
    let email = ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed);
    let mut recipient = field_engineer();
    recipient.quiet_hours = Some(QuietHours {
        start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
        end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
    });
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 23, 15, 0).unwrap()));
    let engine = engine_with(
        registry(vec![
            (spec("email-ops", ChannelType::Email), email.clone()),
            (spec("sms-ops", ChannelType::Sms), ScriptedDeliverer::new(ChannelType::Sms, Behavior::Succeed)),
        ]),
        vec![recipient],
        PriorityPolicy::default(),
        clock.clone(),
    );

    let held = engine
        .send_alert_notification(&alert(Severity::High, "Vibration"), &ids(&["r1"]))
        .await;
    assert!(held.is_empty());
    assert_eq!(engine.stats().total_suppressed, 1);

    let urgent = engine
        .send_alert_notification(&alert(Severity::Critical, "Collapse risk"), &ids(&["r1"]))
        .await;
    assert_eq!(urgent.len(), 2);

    clock.set(Utc.with_ymd_and_hms(2026, 6, 2, 7, 0, 0).unwrap());
    let morning = engine
        .send_alert_notification(&alert(Severity::High, "Vibration"), &ids(&["r1"]))
        .await;
    assert_eq!(morning.len(), 1);
}

#[tokio::test]
async fn disabled_channel_preference_is_never_used() {
    let email = ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed);
    let sms = ScriptedDeliverer::new(ChannelType::Sms, Behavior::Succeed);
    let mut dana = field_engineer();
    dana.preferences
        .insert(ChannelType::Sms, ChannelPreference { enabled: false });
    let engine = engine_with(
        registry(vec![
            (spec("email-ops", ChannelType::Email), email.clone()),
            (spec("sms-ops", ChannelType::Sms), sms.clone()),
        ]),
        vec![dana],
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );

    let created = engine
        .send_alert_notification(&alert(Severity::Critical, "Crane overload"), &ids(&["r1"]))
        .await;

    assert_eq!(created.len(), 1);
    assert_eq!(created[0].channel_type, ChannelType::Email);
    assert_eq!(engine.queue_depth(Priority::Immediate), 1);
    engine.process_tick().await;
    assert_eq!(email.calls(), 1);
    assert_eq!(sms.calls(), 0);
}

#[tokio::test]
async fn hourly_budget_drops_the_overflow() {
    let mut recipient = field_engineer();
    recipient.max_notifications_per_hour = Some(5);
    let engine = engine_with(
        registry(vec![(
            spec("email-ops", ChannelType::Email),
            ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed),
        )]),
        vec![recipient],
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );

    let mut created = 0;
    for i in 0..6 {
        created += engine
            .send_alert_notification(&alert(Severity::Medium, &format!("Dust {i}")), &ids(&["r1"]))
            .await
            .len();
    }
    assert_eq!(created, 5);
    assert_eq!(engine.stats().total_suppressed, 1);
    assert_eq!(engine.queue_depth(Priority::Normal), 5);
}

#[tokio::test(start_paused = true)]
async fn hourly_budget_defers_the_overflow() {
    let mut recipient = field_engineer();
    recipient.max_notifications_per_hour = Some(5);
    let policy = PriorityPolicy {
        recipient_overflow: OverflowPolicy::Defer,
        ..PriorityPolicy::default()
    };
    let engine = engine_with(
        registry(vec![(
            spec("email-ops", ChannelType::Email),
            ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed),
        )]),
        vec![recipient],
        policy,
        Arc::new(ManualClock::new(noon())),
    );

    let mut created = Vec::new();
    for i in 0..6 {
        created.extend(
            engine
                .send_alert_notification(&alert(Severity::Medium, &format!("Dust {i}")), &ids(&["r1"]))
                .await,
        );
    }
    assert_eq!(created.len(), 6);
    assert_eq!(created[5].scheduled_at, noon() + chrono::Duration::hours(1));
    assert_eq!(engine.queue_depth(Priority::Normal), 5);
    assert_eq!(engine.stats().total_suppressed, 0);

    tokio::time::sleep(Duration::from_secs(3_601)).await;
    assert_eq!(engine.queue_depth(Priority::Normal), 6);
}

// ── Channel health and limits ──

#[tokio::test]
async fn rate_limited_attempts_are_retried_later() {
    let email = ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed);
    let mut email_spec = spec("email-ops", ChannelType::Email);
    email_spec.rate_limit = RateLimitConfig {
        max_requests_per_minute: 2,
        max_requests_per_hour: 0,
        burst_allowance: 0,
    };
    let engine = engine_with(
        registry(vec![(email_spec, email.clone())]),
        vec![field_engineer()],
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );

    let mut created = Vec::new();
    for i in 0..3 {
        created.extend(
            engine
                .send_alert_notification(&alert(Severity::Medium, &format!("Dust {i}")), &ids(&["r1"]))
                .await,
        );
    }
    engine.process_tick().await;

    assert_eq!(email.calls(), 2);
    let statuses: Vec<_> = created
        .iter()
        .map(|m| engine.message(&m.id).unwrap())
        .collect();
    let limited: Vec<_> = statuses
        .iter()
        .filter(|m| m.status == MessageStatus::Queued)
        .collect();
    assert_eq!(limited.len(), 1);
    assert!(limited[0].attempts[0].error.as_deref().unwrap().contains("rate limit"));
    assert_eq!(limited[0].attempts[0].outcome, AttemptOutcome::Retry);
    assert_eq!(engine.registry().snapshot()[0].rate_limited, 1);
    assert!(engine.registry().get("email-ops").unwrap().is_healthy());
}

#[tokio::test]
async fn repeated_failures_take_a_channel_out_of_rotation() {
    let email = ScriptedDeliverer::new(ChannelType::Email, Behavior::FailTransient);
    let mut email_spec = spec("email-ops", ChannelType::Email);
    email_spec.retry_policy.max_retries = 0;
    let policy = PriorityPolicy {
        unhealthy_after_failures: 2,
        ..PriorityPolicy::default()
    };
    let engine = engine_with(
        registry(vec![(email_spec, email.clone())]),
        vec![field_engineer()],
        policy,
        Arc::new(ManualClock::new(noon())),
    );

    for i in 0..2 {
        engine
            .send_alert_notification(&alert(Severity::Medium, &format!("Dust {i}")), &ids(&["r1"]))
            .await;
    }
    engine.process_tick().await;
    assert!(!engine.registry().get("email-ops").unwrap().is_healthy());

    let skipped = engine
        .send_alert_notification(&alert(Severity::Medium, "Dust again"), &ids(&["r1"]))
        .await;
    assert!(skipped.is_empty());

    engine.registry().restore("email-ops").unwrap();
    let resumed = engine
        .send_alert_notification(&alert(Severity::Medium, "Dust again"), &ids(&["r1"]))
        .await;
    assert_eq!(resumed.len(), 1);
}

#[tokio::test]
async fn failed_startup_health_check_marks_channel_unhealthy() {
    let engine = engine_with(
        registry(vec![
            (
                spec("email-ops", ChannelType::Email),
                ScriptedDeliverer::unreachable(ChannelType::Email),
            ),
            (
                spec("email-standby", ChannelType::Email),
                ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed),
            ),
        ]),
        vec![field_engineer()],
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );
    engine.start().await;

    assert!(!engine.registry().get("email-ops").unwrap().is_healthy());
    let created = engine
        .send_alert_notification(&alert(Severity::Medium, "Dust"), &ids(&["r1"]))
        .await;
    assert_eq!(created[0].channel_id, "email-standby");
    engine.stop().await;
}

#[tokio::test]
async fn channels_skip_unsupported_priorities() {
    let mut urgent_only = spec("email-ops", ChannelType::Email);
    urgent_only.supported_priorities = vec![Priority::Immediate, Priority::High];
    let engine = engine_with(
        registry(vec![(urgent_only, ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed))]),
        vec![field_engineer()],
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );
    assert!(engine
        .send_alert_notification(&alert(Severity::Low, "Dust"), &ids(&["r1"]))
        .await
        .is_empty());
    assert_eq!(
        engine
            .send_alert_notification_with_priority(&alert(Severity::Low, "Dust"), &ids(&["r1"]), Priority::High)
            .await
            .len(),
        1
    );
}

// ── Direct sends and lifecycle ──

#[tokio::test]
async fn cancel_only_applies_to_queued_messages() {
    let email = ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed);
    let engine = engine_with(
        registry(vec![(spec("email-ops", ChannelType::Email), email.clone())]),
        vec![field_engineer()],
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );
    let created = engine
        .send_alert_notification(&alert(Severity::Low, "Dust"), &ids(&["r1"]))
        .await;
    let cancelled = engine.cancel(&created[0].id).unwrap();
    assert_eq!(cancelled.status, MessageStatus::Cancelled);

    engine.process_tick().await;
    assert_eq!(email.calls(), 0);
    assert!(matches!(
        engine.cancel(&created[0].id),
        Err(NotifyError::InvalidTransition { .. })
    ));
    assert!(matches!(engine.cancel("nope"), Err(NotifyError::MessageNotFound(_))));
    assert_eq!(engine.stats().total_cancelled, 1);
}

#[tokio::test]
async fn custom_notification_uses_named_template() {
    let sms = ScriptedDeliverer::new(ChannelType::Sms, Behavior::Succeed);
    let mut templates = TemplateStore::with_defaults();
    let mut channels = BTreeMap::new();
    channels.insert(
        ChannelType::Sms,
        ChannelTemplate {
            subject: None,
            body: "Shift change at ${site}: ${shift.start}".to_string(),
            format: TemplateFormat::Text,
        },
    );
    templates
        .insert(NotificationTemplate {
            id: "shift-change".to_string(),
            name: "Shift change".to_string(),
            channels,
            conditionals: Vec::new(),
            personalization: Personalization {
                greeting: true,
                signature: None,
            },
        })
        .unwrap();
    let engine = DispatchEngine::with_clock(
        registry(vec![(spec("sms-ops", ChannelType::Sms), sms.clone())]),
        Arc::new(templates),
        Arc::new(InMemoryDirectory::new(vec![field_engineer()])),
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );

    let message = engine
        .send_custom_notification(
            "r1",
            "sms-ops",
            "shift-change",
            json!({"site": "Pier 4", "shift": {"start": "06:00"}}),
            Priority::Normal,
        )
        .await
        .unwrap();
    assert_eq!(message.recipient.address, "+15550100");
    engine.process_tick().await;
    assert_eq!(sms.delivered()[0].1, "Hello Dana,\n\nShift change at Pier 4: 06:00");

    let err = engine
        .send_custom_notification("r1", "sms-ops", "missing", json!({}), Priority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::TemplateNotFound(_)));
    let err = engine
        .send_custom_notification("r1", "email-ops", "shift-change", json!({}), Priority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::ChannelNotFound(_)));
    let err = engine
        .send_custom_notification("ghost", "sms-ops", "shift-change", json!({}), Priority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::RecipientNotFound(_)));
}

#[tokio::test]
async fn custom_notification_rejects_unsupported_template_and_disabled_channel() {
    let mut disabled = spec("push-ops", ChannelType::Push);
    disabled.enabled = false;
    let mut templates = TemplateStore::with_defaults();
    let mut channels = BTreeMap::new();
    channels.insert(
        ChannelType::Email,
        ChannelTemplate {
            subject: Some("Report".to_string()),
            body: "Weekly report".to_string(),
            format: TemplateFormat::Markdown,
        },
    );
    templates
        .insert(NotificationTemplate {
            id: "weekly".to_string(),
            name: String::new(),
            channels,
            conditionals: Vec::new(),
            personalization: Personalization::default(),
        })
        .unwrap();
    let engine = DispatchEngine::with_clock(
        registry(vec![
            (spec("sms-ops", ChannelType::Sms), ScriptedDeliverer::new(ChannelType::Sms, Behavior::Succeed)),
            (disabled, ScriptedDeliverer::new(ChannelType::Push, Behavior::Succeed)),
        ]),
        Arc::new(templates),
        Arc::new(InMemoryDirectory::new(vec![field_engineer()])),
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );

    let err = engine
        .send_custom_notification("r1", "sms-ops", "weekly", json!({}), Priority::Low)
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::TemplateUnsupported { .. }));
    let err = engine
        .send_custom_notification("r1", "push-ops", "alert-default", json!({}), Priority::Low)
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::ChannelDisabled(_)));
}

#[tokio::test]
async fn alert_fan_out_skips_channels_the_alert_template_lacks() {
    let email = ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed);
    let sms = ScriptedDeliverer::new(ChannelType::Sms, Behavior::Succeed);
    let mut templates = TemplateStore::with_defaults();
    let mut channels = BTreeMap::new();
    channels.insert(
        ChannelType::Email,
        ChannelTemplate {
            subject: Some("${alert.title}".to_string()),
            body: "${alert.message}".to_string(),
            format: TemplateFormat::Text,
        },
    );
    templates
        .insert(NotificationTemplate {
            id: "mail-only".to_string(),
            name: String::new(),
            channels,
            conditionals: Vec::new(),
            personalization: Personalization::default(),
        })
        .unwrap();
    let mut policy = PriorityPolicy::default();
    policy.alert_template_id = "mail-only".to_string();
    let engine = DispatchEngine::with_clock(
        registry(vec![
            (spec("email-ops", ChannelType::Email), email.clone()),
            (spec("sms-ops", ChannelType::Sms), sms.clone()),
        ]),
        Arc::new(templates),
        Arc::new(InMemoryDirectory::new(vec![field_engineer()])),
        policy,
        Arc::new(ManualClock::new(noon())),
    );

    let created = engine
        .send_alert_notification(&alert(Severity::Critical, "Crane overload"), &ids(&["r1"]))
        .await;

    assert_eq!(created.len(), 1);
    assert_eq!(created[0].channel_id, "email-ops");
    engine.process_tick().await;
    let stored = engine.message(&created[0].id).unwrap();
    assert_eq!(stored.status, MessageStatus::Delivered);
    assert_eq!(email.delivered()[0].0, "Crane overload");
    assert_eq!(sms.calls(), 0);
    assert_eq!(engine.stats().total_failed, 0);
}

#[tokio::test]
async fn webhook_call_targets_given_url() {
    let hook = ScriptedDeliverer::new(ChannelType::Webhook, Behavior::Succeed);
    let engine = engine_with(
        registry(vec![
            (spec("hook-ops", ChannelType::Webhook), hook.clone()),
            (
                spec("email-ops", ChannelType::Email),
                ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed),
            ),
        ]),
        vec![],
        PriorityPolicy::default(),
        Arc::new(ManualClock::new(noon())),
    );

    let message = engine
        .send_webhook_call(
            &alert(Severity::High, "Pump offline"),
            "hook-ops",
            Some("https://ops.example.com/hooks/pump"),
        )
        .await
        .unwrap();
    assert_eq!(message.recipient.address, "https://ops.example.com/hooks/pump");
    assert_eq!(message.context["alert"]["title"], "Pump offline");
    engine.process_tick().await;
    assert_eq!(hook.calls(), 1);

    let err = engine
        .send_webhook_call(&alert(Severity::High, "Pump offline"), "email-ops", None)
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::InvalidConfig(_)));
}

#[tokio::test]
async fn prune_forgets_old_terminal_messages() {
    let clock = Arc::new(ManualClock::new(noon()));
    let engine = engine_with(
        registry(vec![(
            spec("email-ops", ChannelType::Email),
            ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed),
        )]),
        vec![field_engineer()],
        PriorityPolicy::default(),
        clock.clone(),
    );
    engine
        .send_alert_notification(&alert(Severity::Low, "Dust"), &ids(&["r1"]))
        .await;
    engine.process_tick().await;
    let pending = engine
        .send_alert_notification(&alert(Severity::Low, "Dust again"), &ids(&["r1"]))
        .await;

    clock.advance(chrono::Duration::days(2));
    assert_eq!(engine.prune_terminal(noon() + chrono::Duration::days(1)), 1);
    let remaining = engine.messages();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, pending[0].id);
}

// ── Plugin registry ──

#[test]
fn plugin_registry_has_all_builtin_channel_types() {
    let registry = PluginRegistry::default();
    assert_eq!(
        registry.channel_types(),
        vec![
            ChannelType::Email,
            ChannelType::Sms,
            ChannelType::Webhook,
            ChannelType::Push,
            ChannelType::InApp,
            ChannelType::Chat,
        ]
    );
}

#[test]
fn plugin_registry_builds_channels_from_spec() {
    let registry = PluginRegistry::default();

    let mut sms = ChannelSpec::new("sms-ops", ChannelType::Sms);
    sms.config = json!({"gateway_url": "https://sms.example.com/send", "api_key": "k"});
    let channel = registry.build_channel(sms).unwrap();
    assert_eq!(channel.channel_type(), ChannelType::Sms);

    let mut broken = ChannelSpec::new("sms-broken", ChannelType::Sms);
    broken.config = json!({});
    assert!(matches!(
        registry.build_channel(broken),
        Err(NotifyError::InvalidConfig(_))
    ));

    let mut bad_policy = ChannelSpec::new("chat-ops", ChannelType::Chat);
    bad_policy.config = json!({"webhook_url": "https://hooks.slack.com/x", "flavor": "slack"});
    bad_policy.retry_policy.backoff_multiplier = 0.2;
    assert!(registry.build_channel(bad_policy).is_err());
}

#[test]
fn plugin_registry_rejects_unregistered_types() {
    let registry = PluginRegistry::new(Default::default());
    let spec = ChannelSpec::new("email-ops", ChannelType::Email);
    assert!(matches!(
        registry.build_channel(spec),
        Err(NotifyError::UnknownChannelType(_))
    ));
}

#[test]
fn plugin_registry_redacts_secrets() {
    let registry = PluginRegistry::default();
    let mut spec = ChannelSpec::new("email-ops", ChannelType::Email);
    spec.config = json!({"smtp_host": "smtp.example.com", "smtp_password": "hunter2", "from": "a@b.c"});
    let redacted = registry.redact(&spec);
    assert_eq!(redacted["smtp_password"], "***");
    assert_eq!(redacted["smtp_host"], "smtp.example.com");
}

#[test]
fn channel_registry_rejects_duplicates_and_type_mismatch() {
    let mut registry = ChannelRegistry::new();
    let deliverer = ScriptedDeliverer::new(ChannelType::Email, Behavior::Succeed);
    registry
        .register(crate::channel::NotificationChannel::new(spec("email-ops", ChannelType::Email), deliverer.clone()).unwrap())
        .unwrap();
    let dup = crate::channel::NotificationChannel::new(spec("email-ops", ChannelType::Email), deliverer.clone()).unwrap();
    assert!(registry.register(dup).is_err());
    assert!(crate::channel::NotificationChannel::new(spec("sms-ops", ChannelType::Sms), deliverer).is_err());
}

#[tokio::test]
async fn in_app_plugin_delivers_into_shared_inbox() {
    let plugins = PluginRegistry::default();
    let spec = ChannelSpec::new("inbox", ChannelType::InApp);
    let channel = plugins.build_channel(spec).unwrap();
    let context = json!({});
    channel
        .deliverer()
        .deliver(&Delivery {
            message_id: "m1",
            recipient_id: "r1",
            address: "",
            subject: "Crane overload",
            body: "Load 112%",
            format: TemplateFormat::Text,
            priority: Priority::Immediate,
            context: &context,
        })
        .await
        .unwrap();
    let inbox = plugins.inbox().list("r1");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].title, "Crane overload");
}
