use crate::channels::{http_client, parse_config, receipt_from_response};
use crate::error::{NotifyError, Result};
use crate::plugin::ChannelPlugin;
use crate::{Deliverer, Delivery, DeliveryReceipt};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use vigil_common::types::ChannelType;

/// Longest SMS body sent; longer bodies are cut on a character boundary.
const MAX_SMS_CHARS: usize = 480;

/// Posts `{to, message, from}` to a generic SMS gateway with a bearer key.
pub struct SmsDeliverer {
    client: reqwest::Client,
    gateway_url: String,
    api_key: String,
    sender: Option<String>,
}

impl SmsDeliverer {
    pub fn new(client: reqwest::Client, gateway_url: &str, api_key: &str, sender: Option<String>) -> Self {
        Self {
            client,
            gateway_url: gateway_url.to_string(),
            api_key: api_key.to_string(),
            sender,
        }
    }

    fn format_message(body: &str) -> String {
        if body.chars().count() <= MAX_SMS_CHARS {
            return body.to_string();
        }
        let mut out: String = body.chars().take(MAX_SMS_CHARS - 1).collect();
        out.push('…');
        out
    }
}

#[async_trait]
impl Deliverer for SmsDeliverer {
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<DeliveryReceipt> {
        let phone = delivery.address.trim();
        if phone.is_empty() {
            return Err(NotifyError::Rejected("empty phone number".to_string()));
        }

        let payload = serde_json::json!({
            "to": phone,
            "message": Self::format_message(delivery.body),
            "from": self.sender,
        });

        let resp = self
            .client
            .post(&self.gateway_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await?;
        receipt_from_response("sms", resp).await
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Sms
    }
}

// Plugin

#[derive(Deserialize)]
struct SmsConfig {
    gateway_url: String,
    api_key: String,
    sender: Option<String>,
    #[serde(default = "super::default_timeout_secs")]
    timeout_secs: u64,
}

pub struct SmsPlugin;

impl ChannelPlugin for SmsPlugin {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Sms
    }

    fn recipient_type(&self) -> &str {
        "phone"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: SmsConfig = parse_config("sms", config)?;
        if !cfg.gateway_url.starts_with("http") {
            return Err(NotifyError::InvalidConfig(format!(
                "sms: gateway_url '{}' is not an http(s) URL",
                cfg.gateway_url
            )));
        }
        Ok(())
    }

    fn create(&self, _instance_id: &str, config: &Value) -> Result<Arc<dyn Deliverer>> {
        let cfg: SmsConfig = parse_config("sms", config)?;
        Ok(Arc::new(SmsDeliverer::new(
            http_client(cfg.timeout_secs)?,
            &cfg.gateway_url,
            &cfg.api_key,
            cfg.sender,
        )))
    }
}
