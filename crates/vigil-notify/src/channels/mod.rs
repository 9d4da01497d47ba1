//! Built-in deliverers and the plugins that construct them.

pub mod chat;
pub mod email;
pub mod in_app;
pub mod push;
pub mod sms;
pub mod webhook;

use crate::error::{NotifyError, Result};
use crate::utils::{truncate_string, MAX_BODY_LENGTH};
use crate::DeliveryReceipt;
use std::time::Duration;

fn default_timeout_secs() -> u64 {
    10
}

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()?)
}

/// Turns an HTTP response into a receipt or a classified error.
///
/// 429 and 5xx become [`NotifyError::ApiError`] (transient); any other
/// non-success status is a permanent [`NotifyError::Rejected`].
pub(crate) async fn receipt_from_response(service: &str, resp: reqwest::Response) -> Result<DeliveryReceipt> {
    let status = resp.status();
    let body = match resp.text().await {
        Ok(text) => truncate_string(&text, MAX_BODY_LENGTH),
        Err(_) => "[Failed to read response body]".to_string(),
    };

    if status.is_success() {
        return Ok(DeliveryReceipt {
            response_code: Some(status.as_u16()),
            response_message: (!body.is_empty()).then_some(body),
        });
    }

    let code = status.as_u16();
    if code == 429 || status.is_server_error() {
        Err(NotifyError::ApiError {
            service: service.to_string(),
            status: code,
            body,
        })
    } else {
        Err(NotifyError::Rejected(format!("{service} returned HTTP {code}: {body}")))
    }
}

/// Parses a plugin config blob, tagging errors with the plugin name.
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(plugin: &str, config: &serde_json::Value) -> Result<T> {
    let config = match config {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(config)
        .map_err(|e| NotifyError::InvalidConfig(format!("invalid {plugin} config: {e}")))
}
