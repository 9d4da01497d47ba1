use crate::error::{NotifyError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use vigil_common::path::{interpolate, lookup};
use vigil_common::types::ChannelType;

/// Identifier of the built-in template used for alert fan-out.
pub const ALERT_DEFAULT_TEMPLATE: &str = "alert-default";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateFormat {
    #[default]
    Text,
    Markdown,
    Html,
}

/// Subject and body for one channel type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelTemplate {
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub format: TemplateFormat,
}

/// Overrides subject/body when a context field equals a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalTemplate {
    pub field: String,
    pub equals: Value,
    /// Restricts the override to one channel type.
    #[serde(default)]
    pub channel_type: Option<ChannelType>,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Personalization {
    /// Prefix the body with "Hello <recipient name>,".
    #[serde(default)]
    pub greeting: bool,
    #[serde(default)]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub channels: BTreeMap<ChannelType, ChannelTemplate>,
    #[serde(default)]
    pub conditionals: Vec<ConditionalTemplate>,
    #[serde(default)]
    pub personalization: Personalization,
}

impl NotificationTemplate {
    pub fn supports(&self, channel_type: ChannelType) -> bool {
        self.channels.contains_key(&channel_type)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("template id is empty".to_string()));
        }
        if self.channels.is_empty() {
            return Err(NotifyError::InvalidConfig(format!(
                "template '{}' defines no channel variants",
                self.id
            )));
        }
        Ok(())
    }

    /// Interpolates the variant for `channel_type` against `context`.
    ///
    /// The first matching conditional replaces the variant's subject and body.
    /// Placeholders that do not resolve are left verbatim.
    pub fn render(&self, channel_type: ChannelType, context: &Value) -> Result<RenderedContent> {
        let variant = self
            .channels
            .get(&channel_type)
            .ok_or_else(|| NotifyError::TemplateUnsupported {
                template_id: self.id.clone(),
                channel_type,
            })?;

        let (subject, body) = match self.conditionals.iter().find(|c| {
            c.channel_type.map_or(true, |t| t == channel_type)
                && lookup(context, &c.field) == Some(&c.equals)
        }) {
            Some(c) => (c.subject.as_deref().or(variant.subject.as_deref()), c.body.as_str()),
            None => (variant.subject.as_deref(), variant.body.as_str()),
        };

        let mut rendered_body = interpolate(body, context);
        if self.personalization.greeting {
            let name = lookup(context, "recipient.name")
                .and_then(Value::as_str)
                .unwrap_or("there");
            rendered_body = format!("Hello {name},\n\n{rendered_body}");
        }
        if let Some(signature) = &self.personalization.signature {
            rendered_body = format!("{rendered_body}\n\n-- \n{}", interpolate(signature, context));
        }

        Ok(RenderedContent {
            subject: subject.map(|s| interpolate(s, context)).unwrap_or_default(),
            body: rendered_body,
            format: variant.format,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedContent {
    pub subject: String,
    pub body: String,
    pub format: TemplateFormat,
}

/// Template lookup by id.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<String, NotificationTemplate>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-loaded with the built-in [`ALERT_DEFAULT_TEMPLATE`].
    pub fn with_defaults() -> Self {
        let mut store = Self::new();
        store
            .templates
            .insert(ALERT_DEFAULT_TEMPLATE.to_string(), default_alert_template());
        store
    }

    /// Adds or replaces a template.
    pub fn insert(&mut self, template: NotificationTemplate) -> Result<()> {
        template.validate()?;
        self.templates.insert(template.id.clone(), template);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&NotificationTemplate> {
        self.templates.get(id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn default_alert_template() -> NotificationTemplate {
    let subject = Some("[${alert.severity}] ${alert.title}".to_string());
    let plain = ChannelTemplate {
        subject: subject.clone(),
        body: "${alert.message}".to_string(),
        format: TemplateFormat::Text,
    };
    let markdown = ChannelTemplate {
        subject: subject.clone(),
        body: "**${alert.title}**\n\n${alert.message}\n\n- Severity: ${alert.severity}\n- Type: ${alert.type}\n- Detected: ${alert.detected_at}".to_string(),
        format: TemplateFormat::Markdown,
    };

    let mut channels = BTreeMap::new();
    channels.insert(ChannelType::Email, markdown.clone());
    channels.insert(ChannelType::Chat, markdown);
    channels.insert(
        ChannelType::Sms,
        ChannelTemplate {
            subject: None,
            body: "[${alert.severity}] ${alert.title}: ${alert.message}".to_string(),
            format: TemplateFormat::Text,
        },
    );
    channels.insert(ChannelType::Push, plain.clone());
    channels.insert(ChannelType::InApp, plain.clone());
    channels.insert(ChannelType::Webhook, plain);

    NotificationTemplate {
        id: ALERT_DEFAULT_TEMPLATE.to_string(),
        name: "Default alert".to_string(),
        channels,
        conditionals: Vec::new(),
        personalization: Personalization::default(),
    }
}
