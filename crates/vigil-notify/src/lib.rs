//! Notification dispatch with pluggable delivery channels.
//!
//! Alerts fan out to recipients as [`message::NotificationMessage`]s, one per
//! eligible channel. The [`dispatcher::DispatchEngine`] queues them by
//! priority, renders templates, enforces per-channel rate limits and
//! per-recipient budgets, and retries failed deliveries with exponential
//! backoff. Built-in deliverers cover email (SMTP), SMS, webhook, push,
//! in-app inboxes and chat webhooks (DingTalk, WeCom, Slack).

pub mod channel;
pub mod channels;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod plugin;
pub mod queue;
pub mod rate_limit;
pub mod recipient;
pub mod retry;
pub mod stats;
pub mod template;
pub mod utils;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use error::Result;
use serde_json::Value;
use template::TemplateFormat;
use vigil_common::types::{ChannelType, Priority};

/// One rendered message bound for one address.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub message_id: &'a str,
    pub recipient_id: &'a str,
    /// Channel-specific address: email, phone number, device token, URL.
    pub address: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub format: TemplateFormat,
    pub priority: Priority,
    /// Message context; alert messages carry the alert under `alert`.
    pub context: &'a Value,
}

/// What the provider said about an accepted delivery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReceipt {
    pub response_code: Option<u16>,
    pub response_message: Option<String>,
}

/// Transport for one channel instance (an SMTP relay, an SMS gateway, a
/// webhook endpoint).
///
/// Implementations are created by the corresponding [`plugin::ChannelPlugin`]
/// and attached to a [`channel::NotificationChannel`] registry entry. A
/// deliverer makes exactly one attempt per call; retries belong to the
/// dispatch engine.
#[async_trait]
pub trait Deliverer: Send + Sync {
    /// Makes one delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns a [`error::NotifyError`] whose [`error::NotifyError::kind`]
    /// tells the engine whether the failure is worth retrying.
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<DeliveryReceipt>;

    fn channel_type(&self) -> ChannelType;

    /// Startup health check. Channels that fail it start out unhealthy.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
