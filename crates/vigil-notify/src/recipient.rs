use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use vigil_common::types::{ChannelType, Severity};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPreference {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ChannelPreference {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Daily window (UTC) during which only critical alerts get through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let current_time = now.time();
        if self.start <= self.end {
            current_time >= self.start && current_time <= self.end
        } else {
            // Overnight window (e.g., 22:00 - 06:00)
            current_time >= self.start || current_time <= self.end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecipient {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Address per channel type: email address, phone number, device token.
    #[serde(default)]
    pub contacts: BTreeMap<ChannelType, String>,
    /// Channel types without an entry count as enabled.
    #[serde(default)]
    pub preferences: BTreeMap<ChannelType, ChannelPreference>,
    /// Channel types to use per alert severity.
    #[serde(default)]
    pub severity_thresholds: BTreeMap<Severity, Vec<ChannelType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHours>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_notifications_per_hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_notifications_per_day: Option<u32>,
}

impl NotificationRecipient {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            locale: None,
            contacts: BTreeMap::new(),
            preferences: BTreeMap::new(),
            severity_thresholds: BTreeMap::new(),
            quiet_hours: None,
            max_notifications_per_hour: None,
            max_notifications_per_day: None,
        }
    }

    pub fn with_contact(mut self, channel_type: ChannelType, address: impl Into<String>) -> Self {
        self.contacts.insert(channel_type, address.into());
        self
    }

    pub fn with_channels(mut self, severity: Severity, channel_types: Vec<ChannelType>) -> Self {
        self.severity_thresholds.insert(severity, channel_types);
        self
    }

    pub fn address(&self, channel_type: ChannelType) -> Option<&str> {
        self.contacts
            .get(&channel_type)
            .map(String::as_str)
            .filter(|a| !a.trim().is_empty())
    }

    pub fn channel_enabled(&self, channel_type: ChannelType) -> bool {
        self.preferences.get(&channel_type).map_or(true, |p| p.enabled)
    }

    /// Channel types that should carry an alert of this severity, in the
    /// order configured. Disabled channels and ones without a contact are
    /// dropped.
    pub fn channels_for(&self, severity: Severity) -> Vec<ChannelType> {
        let mut out: Vec<ChannelType> = Vec::new();
        for channel_type in self.severity_thresholds.get(&severity).into_iter().flatten() {
            if self.channel_enabled(*channel_type)
                && self.address(*channel_type).is_some()
                && !out.contains(channel_type)
            {
                out.push(*channel_type);
            }
        }
        out
    }

    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        self.quiet_hours.as_ref().is_some_and(|q| q.is_active(now))
    }

    /// The slice of the recipient exposed to templates as `recipient`.
    pub fn template_context(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "locale": self.locale,
        })
    }
}

/// Source of recipient records.
pub trait RecipientDirectory: Send + Sync {
    fn get(&self, id: &str) -> Option<NotificationRecipient>;
}

/// Directory held in memory, editable at runtime.
#[derive(Default)]
pub struct InMemoryDirectory {
    recipients: RwLock<HashMap<String, NotificationRecipient>>,
}

impl InMemoryDirectory {
    pub fn new(recipients: impl IntoIterator<Item = NotificationRecipient>) -> Self {
        Self {
            recipients: RwLock::new(recipients.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }

    pub fn upsert(&self, recipient: NotificationRecipient) {
        self.recipients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(recipient.id.clone(), recipient);
    }

    pub fn remove(&self, id: &str) -> Option<NotificationRecipient> {
        self.recipients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.recipients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecipientDirectory for InMemoryDirectory {
    fn get(&self, id: &str) -> Option<NotificationRecipient> {
        self.recipients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}
