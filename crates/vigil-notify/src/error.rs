use crate::message::MessageStatus;
use vigil_common::types::ChannelType;

/// Errors that can occur within the notification subsystem.
///
/// Every variant maps onto a [`FailureKind`], which the dispatch engine and the
/// per-channel retry classifiers use to decide what happens next.
///
/// # Examples
///
/// ```rust
/// use vigil_notify::error::{FailureKind, NotifyError};
///
/// let err = NotifyError::ChannelDisabled("sms-primary".to_string());
/// assert!(err.to_string().contains("sms-primary"));
/// assert_eq!(err.kind(), FailureKind::Configuration);
///
/// let throttled = NotifyError::ApiError {
///     service: "sms".to_string(),
///     status: 429,
///     body: String::new(),
/// };
/// assert_eq!(throttled.kind(), FailureKind::Transient);
/// ```
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Channel configuration is missing a required field or contains an invalid value.
    #[error("Notify: invalid channel configuration: {0}")]
    InvalidConfig(String),

    /// No plugin is registered for the channel type.
    #[error("Notify: unknown channel type '{0}'")]
    UnknownChannelType(String),

    #[error("Notify: channel '{0}' not found")]
    ChannelNotFound(String),

    #[error("Notify: channel '{0}' is disabled")]
    ChannelDisabled(String),

    #[error("Notify: template '{0}' not found")]
    TemplateNotFound(String),

    #[error("Notify: template '{template_id}' has no variant for channel type '{channel_type}'")]
    TemplateUnsupported {
        template_id: String,
        channel_type: ChannelType,
    },

    #[error("Notify: recipient '{0}' not found")]
    RecipientNotFound(String),

    #[error("Notify: message '{0}' not found")]
    MessageNotFound(String),

    /// A message state change that the lifecycle does not allow.
    #[error("Notify: message '{message_id}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        message_id: String,
        from: MessageStatus,
        to: MessageStatus,
    },

    /// An HTTP request to an external notification endpoint failed.
    #[error("Notify: HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// SMTP transport error when sending email.
    #[error("Notify: SMTP error: {0}")]
    SmtpError(String),

    /// JSON serialization or deserialization failed (e.g. channel config parsing).
    #[error("Notify: JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The external API returned a non-success response.
    #[error("Notify: API error from {service}: status={status}, body={body}")]
    ApiError {
        service: String,
        status: u16,
        body: String,
    },

    /// The provider refused the message outright (bad address, malformed payload).
    #[error("Notify: delivery rejected: {0}")]
    Rejected(String),

    /// The channel's rolling request budget is exhausted.
    #[error("Notify: rate limit exceeded on channel '{0}'")]
    RateLimited(String),

    /// The provider could not be reached (failed health check or refused connection).
    #[error("Notify: channel unavailable: {0}")]
    Unavailable(String),

    /// Generic notification error for cases not covered by other variants.
    #[error("Notify: {0}")]
    Other(String),
}

/// Coarse classification of a [`NotifyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Wrong setup; surfaced synchronously to callers.
    Configuration,
    /// Timeouts, throttling, 5xx: worth retrying.
    Transient,
    /// The provider rejected this message for good.
    Permanent,
}

impl NotifyError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidConfig(_)
            | Self::UnknownChannelType(_)
            | Self::ChannelNotFound(_)
            | Self::ChannelDisabled(_)
            | Self::TemplateNotFound(_)
            | Self::TemplateUnsupported { .. }
            | Self::RecipientNotFound(_)
            | Self::MessageNotFound(_)
            | Self::InvalidTransition { .. }
            | Self::JsonError(_) => FailureKind::Configuration,
            Self::ApiError { status, .. } if *status == 429 || *status >= 500 => {
                FailureKind::Transient
            }
            Self::ApiError { .. } | Self::Rejected(_) => FailureKind::Permanent,
            Self::HttpError(_)
            | Self::SmtpError(_)
            | Self::RateLimited(_)
            | Self::Unavailable(_)
            | Self::Other(_) => FailureKind::Transient,
        }
    }
}

/// Convenience `Result` alias for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;
