use crate::error::{NotifyError, Result};
use crate::template::TemplateFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vigil_common::types::{ChannelType, Priority};

/// Lifecycle of a notification message.
///
/// ```text
/// Queued -> Sending -> Delivered
///              |  \--> Failed
///              \-----> Queued (retry scheduled)
/// Queued -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Sending,
    Delivered,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// Final failure; no further attempts.
    Failed,
    /// Failed, another attempt is scheduled.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// 1-based.
    pub attempt_number: u32,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    /// Backoff chosen after this attempt, when it was retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
}

/// Who a message goes to, frozen at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecipient {
    pub id: String,
    pub name: String,
    pub address: String,
}

/// One notification bound for one recipient over one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<String>,
    pub channel_id: String,
    pub channel_type: ChannelType,
    pub recipient: MessageRecipient,
    pub template_id: String,
    /// Rendered once, on the first attempt.
    pub subject: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub format: TemplateFormat,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub attempts: Vec<DeliveryAttempt>,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Fields needed to create a message; everything else starts empty.
pub struct NewMessage {
    pub alert_id: Option<String>,
    pub channel_id: String,
    pub channel_type: ChannelType,
    pub recipient: MessageRecipient,
    pub template_id: String,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
    pub context: Value,
}

impl NotificationMessage {
    pub fn new(spec: NewMessage, now: DateTime<Utc>) -> Self {
        Self {
            id: vigil_common::id::next_id(),
            alert_id: spec.alert_id,
            channel_id: spec.channel_id,
            channel_type: spec.channel_type,
            recipient: spec.recipient,
            template_id: spec.template_id,
            subject: None,
            body: None,
            format: TemplateFormat::default(),
            priority: spec.priority,
            scheduled_at: spec.scheduled_at,
            status: MessageStatus::Queued,
            attempts: Vec::new(),
            context: spec.context,
            created_at: now,
            delivered_at: None,
        }
    }

    pub fn next_attempt_number(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    pub fn last_attempt(&self) -> Option<&DeliveryAttempt> {
        self.attempts.last()
    }

    pub fn is_rendered(&self) -> bool {
        self.subject.is_some() && self.body.is_some()
    }

    /// Last time anything happened to this message.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.delivered_at
            .or_else(|| self.attempts.last().map(|a| a.attempted_at))
            .unwrap_or(self.created_at)
    }

    pub(crate) fn begin_sending(&mut self) -> Result<()> {
        self.transition(&[MessageStatus::Queued], MessageStatus::Sending)
    }

    pub(crate) fn record_success(&mut self, attempt: DeliveryAttempt, now: DateTime<Utc>) -> Result<()> {
        self.transition(&[MessageStatus::Sending], MessageStatus::Delivered)?;
        self.attempts.push(attempt);
        self.delivered_at = Some(now);
        Ok(())
    }

    pub(crate) fn record_retry(&mut self, attempt: DeliveryAttempt, next_at: DateTime<Utc>) -> Result<()> {
        self.transition(&[MessageStatus::Sending], MessageStatus::Queued)?;
        self.attempts.push(attempt);
        self.scheduled_at = next_at;
        Ok(())
    }

    pub(crate) fn record_failure(&mut self, attempt: DeliveryAttempt) -> Result<()> {
        self.transition(&[MessageStatus::Sending], MessageStatus::Failed)?;
        self.attempts.push(attempt);
        Ok(())
    }

    pub(crate) fn cancel(&mut self) -> Result<()> {
        self.transition(&[MessageStatus::Queued], MessageStatus::Cancelled)
    }

    fn transition(&mut self, from: &[MessageStatus], to: MessageStatus) -> Result<()> {
        if !from.contains(&self.status) {
            return Err(NotifyError::InvalidTransition {
                message_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}
