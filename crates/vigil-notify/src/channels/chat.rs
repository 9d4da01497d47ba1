use crate::channels::{http_client, parse_config};
use crate::error::{NotifyError, Result};
use crate::plugin::ChannelPlugin;
use crate::utils::{truncate_string, MAX_BODY_LENGTH};
use crate::{Deliverer, Delivery, DeliveryReceipt};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use vigil_common::types::ChannelType;

type HmacSha256 = Hmac<Sha256>;

/// Which chat robot API the webhook speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatFlavor {
    DingTalk,
    WeCom,
    Slack,
}

impl ChatFlavor {
    fn service(self) -> &'static str {
        match self {
            Self::DingTalk => "dingtalk",
            Self::WeCom => "wecom",
            Self::Slack => "slack",
        }
    }
}

/// Team chat robot webhook (DingTalk, WeCom, Slack).
///
/// A non-empty message address is used as the robot URL instead of the
/// configured one, so recipients can route to their own group chats.
pub struct ChatDeliverer {
    instance_id: String,
    client: reqwest::Client,
    webhook_url: String,
    flavor: ChatFlavor,
    secret: Option<String>,
}

impl ChatDeliverer {
    pub fn new(
        instance_id: &str,
        client: reqwest::Client,
        webhook_url: &str,
        flavor: ChatFlavor,
        secret: Option<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            client,
            webhook_url: webhook_url.to_string(),
            flavor,
            secret,
        }
    }

    /// Appends DingTalk's `timestamp` and `sign` query parameters when a
    /// secret is configured.
    pub fn sign_url(&self, base_url: &str) -> Result<String> {
        let Some(secret) = self.secret.as_deref().filter(|_| self.flavor == ChatFlavor::DingTalk) else {
            return Ok(base_url.to_string());
        };

        let timestamp = chrono::Utc::now().timestamp_millis();
        let string_to_sign = format!("{}\n{}", timestamp, secret);

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| NotifyError::InvalidConfig(format!("dingtalk secret: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        let sign = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        let sign_encoded = urlencoding::encode(&sign);

        Ok(format!("{}&timestamp={}&sign={}", base_url, timestamp, sign_encoded))
    }

    fn payload(&self, delivery: &Delivery<'_>) -> Value {
        let title = if delivery.subject.is_empty() {
            "Vigil notification"
        } else {
            delivery.subject
        };
        match self.flavor {
            ChatFlavor::DingTalk => json!({
                "msgtype": "markdown",
                "markdown": {
                    "title": title,
                    "text": format!("### {title}\n\n{}", delivery.body),
                }
            }),
            ChatFlavor::WeCom => json!({
                "msgtype": "markdown",
                "markdown": {
                    "content": format!("**{title}**\n{}", delivery.body),
                }
            }),
            ChatFlavor::Slack => json!({
                "text": format!("*{title}*\n{}", delivery.body),
            }),
        }
    }
}

#[async_trait]
impl Deliverer for ChatDeliverer {
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<DeliveryReceipt> {
        let base = match delivery.address.trim() {
            "" => self.webhook_url.as_str(),
            addr => addr,
        };
        let url = self.sign_url(base)?;
        let service = self.flavor.service();

        let resp = self
            .client
            .post(&url)
            .json(&self.payload(delivery))
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let body = truncate_string(&text, MAX_BODY_LENGTH);
        let code = status.as_u16();

        if code == 429 || status.is_server_error() {
            return Err(NotifyError::ApiError {
                service: service.to_string(),
                status: code,
                body,
            });
        }
        if !status.is_success() {
            return Err(NotifyError::Rejected(format!("{service} returned HTTP {code}: {body}")));
        }

        // DingTalk and WeCom answer 200 with an errcode field.
        if self.flavor != ChatFlavor::Slack {
            let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let errcode = parsed.get("errcode").and_then(Value::as_i64);
            if errcode.is_some_and(|c| c != 0) {
                let errmsg = parsed.get("errmsg").and_then(Value::as_str).unwrap_or("unknown");
                tracing::warn!(
                    channel_id = %self.instance_id,
                    service,
                    errcode = ?errcode,
                    errmsg,
                    "Chat robot returned error"
                );
                return Err(NotifyError::ApiError {
                    service: service.to_string(),
                    status: code,
                    body,
                });
            }
        }

        Ok(DeliveryReceipt {
            response_code: Some(code),
            response_message: (!body.is_empty()).then_some(body),
        })
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Chat
    }
}

// Plugin

#[derive(Deserialize)]
struct ChatConfig {
    webhook_url: String,
    flavor: ChatFlavor,
    secret: Option<String>,
    #[serde(default = "super::default_timeout_secs")]
    timeout_secs: u64,
}

pub struct ChatPlugin;

impl ChannelPlugin for ChatPlugin {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Chat
    }

    fn recipient_type(&self) -> &str {
        "webhook_url"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: ChatConfig = parse_config("chat", config)?;
        if !cfg.webhook_url.starts_with("http") {
            return Err(NotifyError::InvalidConfig(format!(
                "chat: webhook_url '{}' is not an http(s) URL",
                cfg.webhook_url
            )));
        }
        Ok(())
    }

    fn create(&self, instance_id: &str, config: &Value) -> Result<Arc<dyn Deliverer>> {
        let cfg: ChatConfig = parse_config("chat", config)?;
        Ok(Arc::new(ChatDeliverer::new(
            instance_id,
            http_client(cfg.timeout_secs)?,
            &cfg.webhook_url,
            cfg.flavor,
            cfg.secret,
        )))
    }
}
