use crate::channels::{http_client, parse_config, receipt_from_response};
use crate::error::{NotifyError, Result};
use crate::plugin::ChannelPlugin;
use crate::{Deliverer, Delivery, DeliveryReceipt};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use vigil_common::types::ChannelType;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the base64 HMAC-SHA256 of the request body.
pub const SIGNATURE_HEADER: &str = "X-Vigil-Signature";

/// POSTs `{event, alert}` JSON to a URL.
///
/// The message address, when set, overrides the configured default URL.
pub struct WebhookDeliverer {
    client: reqwest::Client,
    default_url: Option<String>,
    secret: Option<String>,
    event: String,
    headers: BTreeMap<String, String>,
}

impl WebhookDeliverer {
    pub fn new(client: reqwest::Client, cfg: WebhookConfig) -> Self {
        Self {
            client,
            default_url: cfg.url,
            secret: cfg.secret,
            event: cfg.event,
            headers: cfg.headers,
        }
    }

    /// Builds the JSON body. Alert messages carry the triggering alert; other
    /// messages describe themselves in the same shape.
    pub fn payload(&self, delivery: &Delivery<'_>) -> Value {
        let alert = match delivery.context.get("alert") {
            Some(alert) if alert.is_object() => json!({
                "id": alert.get("id"),
                "type": alert.get("type"),
                "severity": alert.get("severity"),
                "title": alert.get("title"),
                "message": alert.get("message"),
                "detectedAt": alert.get("detected_at"),
                "location": alert.get("location"),
            }),
            _ => json!({
                "id": delivery.message_id,
                "type": "notification",
                "severity": Value::Null,
                "title": delivery.subject,
                "message": delivery.body,
                "detectedAt": Value::Null,
                "location": Value::Null,
            }),
        };
        json!({
            "event": self.event,
            "alert": alert,
        })
    }

    pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| NotifyError::InvalidConfig(format!("webhook secret: {e}")))?;
        mac.update(body);
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl Deliverer for WebhookDeliverer {
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<DeliveryReceipt> {
        let url = match delivery.address.trim() {
            "" => self
                .default_url
                .as_deref()
                .ok_or_else(|| NotifyError::Rejected("no webhook URL for message".to_string()))?,
            addr => addr,
        };

        let body = serde_json::to_vec(&self.payload(delivery))?;
        let mut req = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(secret) = &self.secret {
            req = req.header(SIGNATURE_HEADER, Self::sign(secret, &body)?);
        }

        let resp = req.body(body).send().await?;
        receipt_from_response("webhook", resp).await
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Webhook
    }
}

// Plugin

fn default_event() -> String {
    "alert.triggered".to_string()
}

#[derive(Deserialize)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub secret: Option<String>,
    #[serde(default = "default_event")]
    pub event: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "super::default_timeout_secs")]
    pub timeout_secs: u64,
}

pub struct WebhookPlugin;

impl ChannelPlugin for WebhookPlugin {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Webhook
    }

    fn recipient_type(&self) -> &str {
        "webhook_url"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: WebhookConfig = parse_config("webhook", config)?;
        if let Some(url) = &cfg.url {
            if !url.starts_with("http") {
                return Err(NotifyError::InvalidConfig(format!(
                    "webhook: url '{url}' is not an http(s) URL"
                )));
            }
        }
        Ok(())
    }

    fn create(&self, _instance_id: &str, config: &Value) -> Result<Arc<dyn Deliverer>> {
        let cfg: WebhookConfig = parse_config("webhook", config)?;
        let client = http_client(cfg.timeout_secs)?;
        Ok(Arc::new(WebhookDeliverer::new(client, cfg)))
    }
}
