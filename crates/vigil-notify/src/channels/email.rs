use crate::channels::parse_config;
use crate::error::{NotifyError, Result};
use crate::plugin::ChannelPlugin;
use crate::template::TemplateFormat;
use crate::{Deliverer, Delivery, DeliveryReceipt};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use vigil_common::types::ChannelType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpSecurity {
    /// Implicit TLS (usually port 465).
    #[default]
    Tls,
    StartTls,
    /// Plaintext; local relays only.
    None,
}

pub struct EmailDeliverer {
    instance_id: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailDeliverer {
    pub fn new(instance_id: &str, cfg: &EmailConfig) -> Result<Self> {
        let smtp_err = |e: lettre::transport::smtp::Error| NotifyError::InvalidConfig(format!("smtp relay: {e}"));
        let mut builder = match cfg.security {
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.smtp_host).map_err(smtp_err)?,
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host).map_err(smtp_err)?
            }
            SmtpSecurity::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.smtp_host),
        }
        .port(cfg.smtp_port)
        .timeout(Some(Duration::from_secs(cfg.timeout_secs.max(1))));

        if let (Some(user), Some(pass)) = (&cfg.smtp_username, &cfg.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from = cfg
            .from
            .parse::<Mailbox>()
            .map_err(|e| NotifyError::InvalidConfig(format!("invalid from address '{}': {e}", cfg.from)))?;

        Ok(Self {
            instance_id: instance_id.to_string(),
            transport: builder.build(),
            from,
        })
    }

    fn build_message(&self, delivery: &Delivery<'_>) -> Result<Message> {
        let to = delivery
            .address
            .parse::<Mailbox>()
            .map_err(|e| NotifyError::Rejected(format!("invalid recipient address '{}': {e}", delivery.address)))?;

        let (content_type, body) = match delivery.format {
            TemplateFormat::Text => (ContentType::TEXT_PLAIN, delivery.body.to_string()),
            TemplateFormat::Html => (ContentType::TEXT_HTML, delivery.body.to_string()),
            TemplateFormat::Markdown => (ContentType::TEXT_HTML, markdown_to_html(delivery.body)),
        };

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(delivery.subject)
            .header(content_type)
            .body(body)
            .map_err(|e| NotifyError::Rejected(format!("failed to build email: {e}")))
    }
}

/// Renders markdown to an HTML fragment.
pub fn markdown_to_html(markdown: &str) -> String {
    use pulldown_cmark::{html, Options, Parser};

    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let parser = Parser::new_ext(markdown, options);
    let mut html_output = String::new();
    html::push_html(&mut html_output, parser);
    html_output
}

#[async_trait]
impl Deliverer for EmailDeliverer {
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<DeliveryReceipt> {
        let email = self.build_message(delivery)?;
        match self.transport.send(email).await {
            Ok(resp) => Ok(DeliveryReceipt {
                response_code: resp.code().to_string().parse().ok(),
                response_message: resp.message().next().map(|line| line.to_string()),
            }),
            Err(e) if e.is_permanent() => Err(NotifyError::Rejected(format!("smtp: {e}"))),
            Err(e) => {
                tracing::warn!(
                    channel_id = %self.instance_id,
                    message_id = %delivery.message_id,
                    error = %e,
                    "SMTP send failed"
                );
                Err(NotifyError::SmtpError(e.to_string()))
            }
        }
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    async fn health_check(&self) -> Result<()> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(NotifyError::Unavailable(format!(
                "smtp relay for '{}' refused the connection",
                self.instance_id
            ))),
            Err(e) => Err(NotifyError::Unavailable(format!("smtp relay for '{}': {e}", self.instance_id))),
        }
    }
}

// Plugin

fn default_smtp_port() -> u16 {
    465
}

#[derive(Debug, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub from: String,
    #[serde(default)]
    pub security: SmtpSecurity,
    #[serde(default = "super::default_timeout_secs")]
    pub timeout_secs: u64,
}

pub struct EmailPlugin;

impl ChannelPlugin for EmailPlugin {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    fn recipient_type(&self) -> &str {
        "email"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: EmailConfig = parse_config("email", config)?;
        if cfg.smtp_host.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("email: smtp_host is empty".to_string()));
        }
        cfg.from
            .parse::<Mailbox>()
            .map_err(|e| NotifyError::InvalidConfig(format!("email: invalid from address: {e}")))?;
        Ok(())
    }

    fn create(&self, instance_id: &str, config: &Value) -> Result<Arc<dyn Deliverer>> {
        let cfg: EmailConfig = parse_config("email", config)?;
        Ok(Arc::new(EmailDeliverer::new(instance_id, &cfg)?))
    }
}
