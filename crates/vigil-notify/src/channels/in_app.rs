use crate::error::{NotifyError, Result};
use crate::plugin::ChannelPlugin;
use crate::{Deliverer, Delivery, DeliveryReceipt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use vigil_common::types::{ChannelType, Priority};

const DEFAULT_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InAppNotification {
    pub message_id: String,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

/// Per-recipient in-app notification lists, newest last.
///
/// Cloning shares the same storage.
#[derive(Debug, Clone)]
pub struct InAppInbox {
    inner: Arc<Mutex<HashMap<String, VecDeque<InAppNotification>>>>,
    capacity: usize,
}

impl Default for InAppInbox {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InAppInbox {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Appends, evicting the oldest entries past capacity.
    pub fn push(&self, recipient: &str, notification: InAppNotification) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let list = inner.entry(recipient.to_string()).or_default();
        list.push_back(notification);
        while list.len() > self.capacity {
            list.pop_front();
        }
    }

    pub fn list(&self, recipient: &str) -> Vec<InAppNotification> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(recipient)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, recipient: &str) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(recipient)
            .map_or(0, |l| l.iter().filter(|n| !n.read).count())
    }

    /// Returns false when the notification is not in the recipient's inbox.
    pub fn mark_read(&self, recipient: &str, message_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner
            .get_mut(recipient)
            .and_then(|l| l.iter_mut().find(|n| n.message_id == message_id))
        {
            Some(n) => {
                n.read = true;
                true
            }
            None => false,
        }
    }
}

pub struct InAppDeliverer {
    inbox: InAppInbox,
}

impl InAppDeliverer {
    pub fn new(inbox: InAppInbox) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl Deliverer for InAppDeliverer {
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<DeliveryReceipt> {
        let recipient = match delivery.address.trim() {
            "" => delivery.recipient_id,
            addr => addr,
        };
        if recipient.is_empty() {
            return Err(NotifyError::Rejected("in-app message without recipient".to_string()));
        }
        self.inbox.push(
            recipient,
            InAppNotification {
                message_id: delivery.message_id.to_string(),
                title: delivery.subject.to_string(),
                body: delivery.body.to_string(),
                priority: delivery.priority,
                created_at: Utc::now(),
                read: false,
            },
        );
        Ok(DeliveryReceipt::default())
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::InApp
    }
}

// Plugin

/// Builds in-app deliverers that all write into one shared inbox.
pub struct InAppPlugin {
    inbox: InAppInbox,
}

impl InAppPlugin {
    pub fn new(inbox: InAppInbox) -> Self {
        Self { inbox }
    }
}

impl ChannelPlugin for InAppPlugin {
    fn channel_type(&self) -> ChannelType {
        ChannelType::InApp
    }

    fn recipient_type(&self) -> &str {
        "user_id"
    }

    fn validate_config(&self, _config: &Value) -> Result<()> {
        Ok(())
    }

    fn create(&self, _instance_id: &str, _config: &Value) -> Result<Arc<dyn Deliverer>> {
        Ok(Arc::new(InAppDeliverer::new(self.inbox.clone())))
    }
}
