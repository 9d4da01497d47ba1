#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;
use vigil_common::clock::ManualClock;
use vigil_common::types::ChannelType;
use vigil_notify::channels::in_app::InAppInbox;
use vigil_notify::error::Result as NotifyResult;
use vigil_notify::plugin::{ChannelPlugin, PluginRegistry};
use vigil_notify::{Deliverer, Delivery, DeliveryReceipt};
use vigil_server::bootstrap::{self, Components};
use vigil_server::config::ServerConfig;
use vigil_server::pipeline::AlertPipeline;

/// One delivery seen by a [`RecordingDeliverer`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub channel_type: ChannelType,
    pub address: String,
    pub subject: String,
    pub body: String,
}

/// Stands in for an outbound transport and remembers every delivery.
pub struct RecordingDeliverer {
    channel_type: ChannelType,
    log: Arc<Mutex<Vec<Recorded>>>,
}

#[async_trait]
impl Deliverer for RecordingDeliverer {
    async fn deliver(&self, delivery: &Delivery<'_>) -> NotifyResult<DeliveryReceipt> {
        self.log.lock().unwrap().push(Recorded {
            channel_type: self.channel_type,
            address: delivery.address.to_string(),
            subject: delivery.subject.to_string(),
            body: delivery.body.to_string(),
        });
        Ok(DeliveryReceipt {
            response_code: Some(200),
            response_message: None,
        })
    }

    fn channel_type(&self) -> ChannelType {
        self.channel_type
    }
}

struct RecordingPlugin {
    channel_type: ChannelType,
    log: Arc<Mutex<Vec<Recorded>>>,
}

impl ChannelPlugin for RecordingPlugin {
    fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    fn recipient_type(&self) -> &str {
        "test"
    }

    fn validate_config(&self, _config: &Value) -> NotifyResult<()> {
        Ok(())
    }

    fn create(&self, _instance_id: &str, _config: &Value) -> NotifyResult<Arc<dyn Deliverer>> {
        Ok(Arc::new(RecordingDeliverer {
            channel_type: self.channel_type,
            log: self.log.clone(),
        }))
    }
}

pub const BASE_CONFIG: &str = r#"
[dispatch]
tick_interval_ms = 100

[[channels]]
id = "email-ops"
type = "email"

[[channels]]
id = "sms-ops"
type = "sms"

[[channels]]
id = "hook-ops"
type = "webhook"

[[channels]]
id = "inbox"
type = "in_app"

[[recipients]]
id = "site-lead"
name = "Dana"

[recipients.contacts]
email = "dana@example.com"
sms = "+15550100"
in_app = "dana"

[recipients.severity_thresholds]
critical = ["email", "sms", "in_app"]
high = ["email", "in_app"]
medium = ["email"]

[[rules]]
id = "survey-accuracy"
name = "Survey accuracy degraded"
priority = "high"
event_pattern = "survey.*"
condition = { type = "comparison", field = "accuracy", operator = "lt", value = 0.1 }
actions = [
    { type = "create_alert", title = "Accuracy ${accuracy} at ${location.label}" },
    { type = "notify", recipients = ["site-lead"] },
]

[[rules]]
id = "crane-overload"
name = "Crane overload"
priority = "critical"
event_pattern = "equipment.load"
actions = [
    { type = "notify", recipients = ["site-lead"] },
    { type = "webhook_call", channel_id = "hook-ops", url = "https://ops.example.com/hooks/crane" },
]

[rules.condition]
type = "logical"
operator = "and"
children = [
    { type = "comparison", field = "load_pct", operator = "gt", value = 100 },
    { type = "comparison", field = "kind", operator = "eq", value = "crane" },
]
"#;

pub struct TestContext {
    pub temp_dir: TempDir,
    pub config_path: PathBuf,
    pub clock: Arc<ManualClock>,
    pub components: Components,
    pub pipeline: AlertPipeline,
    pub inbox: InAppInbox,
    log: Arc<Mutex<Vec<Recorded>>>,
}

impl TestContext {
    pub fn recorded(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn recorded_on(&self, channel_type: ChannelType) -> Vec<Recorded> {
        self.recorded()
            .into_iter()
            .filter(|r| r.channel_type == channel_type)
            .collect()
    }
}

pub fn ensure_rustls_provider() {
    static RUSTLS_PROVIDER_INIT: OnceLock<()> = OnceLock::new();
    RUSTLS_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap()
}

pub fn write_config(dir: &TempDir, content: &str) -> Result<PathBuf> {
    let path = dir.path().join("vigil.toml");
    std::fs::write(&path, content)?;
    Ok(path)
}

/// Loads `BASE_CONFIG` plus `extra` from a temp file and assembles it with
/// email, SMS and webhook transports replaced by recorders.
pub fn build_test_context(extra: &str) -> Result<TestContext> {
    ensure_rustls_provider();
    let temp_dir = tempfile::tempdir()?;
    let config_path = write_config(&temp_dir, &format!("{BASE_CONFIG}\n{extra}"))?;
    let config = ServerConfig::load(&config_path.to_string_lossy())?;

    let log = Arc::new(Mutex::new(Vec::new()));
    let inbox = InAppInbox::default();
    let mut plugins = PluginRegistry::with_builtins(inbox.clone());
    for channel_type in [ChannelType::Email, ChannelType::Sms, ChannelType::Webhook] {
        plugins.register(Box::new(RecordingPlugin {
            channel_type,
            log: log.clone(),
        }));
    }

    let clock = Arc::new(ManualClock::new(start_time()));
    let mut components = bootstrap::assemble_with(&config, &plugins, clock.clone());
    let rules = std::mem::take(&mut components.rules);
    let pipeline = AlertPipeline::new(rules, components.engine.clone(), clock.clone());

    Ok(TestContext {
        temp_dir,
        config_path,
        clock,
        components,
        pipeline,
        inbox,
        log,
    })
}
