use crate::channel::{ChannelSpec, NotificationChannel};
use crate::channels::in_app::{InAppInbox, InAppPlugin};
use crate::error::{NotifyError, Result};
use crate::utils::redact_sensitive_json;
use crate::Deliverer;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use vigil_common::types::ChannelType;

/// Factory for [`Deliverer`] instances from JSON configuration.
///
/// Each plugin is registered in the [`PluginRegistry`] under its channel
/// type. At startup the registry validates every configured channel and
/// instantiates its deliverer through the matching plugin.
pub trait ChannelPlugin: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    /// Describes the kind of address this channel accepts
    /// (e.g., `"email"`, `"phone"`, `"webhook_url"`).
    fn recipient_type(&self) -> &str;

    /// Validates a JSON config blob against this plugin's expected schema.
    fn validate_config(&self, config: &Value) -> Result<()>;

    /// Creates a deliverer from a validated JSON config. `instance_id` is the
    /// channel id, used in logs.
    fn create(&self, instance_id: &str, config: &Value) -> Result<Arc<dyn Deliverer>>;

    /// Returns a copy of `config` with secrets replaced by `"***"`, for logs.
    fn redact_config(&self, config: &Value) -> Value {
        redact_sensitive_json(config)
    }
}

/// Registry of available [`ChannelPlugin`]s, used to build channels from
/// configuration.
///
/// # Examples
///
/// ```
/// use vigil_common::types::ChannelType;
/// use vigil_notify::plugin::PluginRegistry;
///
/// let registry = PluginRegistry::default();
/// assert!(registry.has_plugin(ChannelType::Email));
/// assert!(registry.has_plugin(ChannelType::Chat));
/// assert_eq!(registry.channel_types().len(), 6);
/// ```
pub struct PluginRegistry {
    plugins: HashMap<ChannelType, Box<dyn ChannelPlugin>>,
    inbox: InAppInbox,
}

impl PluginRegistry {
    /// Empty registry; in-app deliverers it creates write to `inbox`.
    pub fn new(inbox: InAppInbox) -> Self {
        Self {
            plugins: HashMap::new(),
            inbox,
        }
    }

    /// All built-in plugins, sharing `inbox` for in-app delivery.
    pub fn with_builtins(inbox: InAppInbox) -> Self {
        let mut registry = Self::new(inbox.clone());
        registry.register(Box::new(crate::channels::email::EmailPlugin));
        registry.register(Box::new(crate::channels::sms::SmsPlugin));
        registry.register(Box::new(crate::channels::webhook::WebhookPlugin));
        registry.register(Box::new(crate::channels::push::PushPlugin));
        registry.register(Box::new(InAppPlugin::new(inbox)));
        registry.register(Box::new(crate::channels::chat::ChatPlugin));
        registry
    }

    pub fn register(&mut self, plugin: Box<dyn ChannelPlugin>) {
        self.plugins.insert(plugin.channel_type(), plugin);
    }

    pub fn get_plugin(&self, channel_type: ChannelType) -> Option<&dyn ChannelPlugin> {
        self.plugins.get(&channel_type).map(|p| p.as_ref())
    }

    pub fn has_plugin(&self, channel_type: ChannelType) -> bool {
        self.plugins.contains_key(&channel_type)
    }

    pub fn channel_types(&self) -> Vec<ChannelType> {
        let mut types: Vec<_> = self.plugins.keys().copied().collect();
        types.sort();
        types
    }

    pub fn inbox(&self) -> &InAppInbox {
        &self.inbox
    }

    pub fn create_deliverer(&self, spec: &ChannelSpec) -> Result<Arc<dyn Deliverer>> {
        let plugin = self
            .get_plugin(spec.channel_type)
            .ok_or_else(|| NotifyError::UnknownChannelType(spec.channel_type.to_string()))?;
        plugin.validate_config(&spec.config)?;
        plugin.create(&spec.id, &spec.config)
    }

    /// Validates `spec`, builds its deliverer and wraps both in a registry entry.
    pub fn build_channel(&self, spec: ChannelSpec) -> Result<NotificationChannel> {
        let deliverer = self.create_deliverer(&spec)?;
        NotificationChannel::new(spec, deliverer)
    }

    pub fn redact(&self, spec: &ChannelSpec) -> Value {
        match self.get_plugin(spec.channel_type) {
            Some(plugin) => plugin.redact_config(&spec.config),
            None => redact_sensitive_json(&spec.config),
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins(InAppInbox::default())
    }
}
