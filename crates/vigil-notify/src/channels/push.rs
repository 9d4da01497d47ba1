use crate::channels::{http_client, parse_config, receipt_from_response};
use crate::error::{NotifyError, Result};
use crate::plugin::ChannelPlugin;
use crate::{Deliverer, Delivery, DeliveryReceipt};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use vigil_common::types::{ChannelType, Priority};

/// Sends to a push gateway that fans out to mobile devices by token.
pub struct PushDeliverer {
    client: reqwest::Client,
    gateway_url: String,
    api_key: String,
}

impl PushDeliverer {
    pub fn new(client: reqwest::Client, gateway_url: &str, api_key: &str) -> Self {
        Self {
            client,
            gateway_url: gateway_url.to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn payload(delivery: &Delivery<'_>) -> Value {
        let urgency = match delivery.priority {
            Priority::Immediate | Priority::High => "high",
            _ => "normal",
        };
        serde_json::json!({
            "to": delivery.address,
            "title": delivery.subject,
            "body": delivery.body,
            "priority": urgency,
            "data": {
                "message_id": delivery.message_id,
                "alert_id": delivery.context.pointer("/alert/id"),
            },
        })
    }
}

#[async_trait]
impl Deliverer for PushDeliverer {
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<DeliveryReceipt> {
        if delivery.address.trim().is_empty() {
            return Err(NotifyError::Rejected("empty device token".to_string()));
        }
        let resp = self
            .client
            .post(&self.gateway_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&Self::payload(delivery))
            .send()
            .await?;
        receipt_from_response("push", resp).await
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Push
    }
}

// Plugin

#[derive(Deserialize)]
struct PushConfig {
    gateway_url: String,
    api_key: String,
    #[serde(default = "super::default_timeout_secs")]
    timeout_secs: u64,
}

pub struct PushPlugin;

impl ChannelPlugin for PushPlugin {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Push
    }

    fn recipient_type(&self) -> &str {
        "device_token"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        parse_config::<PushConfig>("push", config)?;
        Ok(())
    }

    fn create(&self, _instance_id: &str, config: &Value) -> Result<Arc<dyn Deliverer>> {
        let cfg: PushConfig = parse_config("push", config)?;
        Ok(Arc::new(PushDeliverer::new(
            http_client(cfg.timeout_secs)?,
            &cfg.gateway_url,
            &cfg.api_key,
        )))
    }
}
