use crate::error::{FailureKind, NotifyError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retry_delay_ms() -> u64 {
    300_000
}

/// Longest accepted `max_retry_delay_ms`: one day.
pub const MAX_RETRY_DELAY_MS: u64 = 24 * 3600 * 1000;

/// Exponential backoff settings for one channel.
///
/// `max_retries` counts re-attempts, so a message gets at most
/// `max_retries + 1` delivery attempts.
///
/// ```
/// use std::time::Duration;
/// use vigil_notify::retry::RetryPolicy;
///
/// let policy = RetryPolicy {
///     max_retries: 3,
///     retry_delay_ms: 5_000,
///     backoff_multiplier: 2.0,
///     max_retry_delay_ms: 60_000,
/// };
/// assert_eq!(policy.delay_for(1), Duration::from_millis(5_000));
/// assert_eq!(policy.delay_for(3), Duration::from_millis(20_000));
/// assert!(policy.allows_retry(3));
/// assert!(!policy.allows_retry(4));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_retry_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(format!(
                "max_retry_delay_ms ({}) exceeds the maximum of {MAX_RETRY_DELAY_MS}",
                self.max_retry_delay_ms
            ));
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(format!(
                "max_retry_delay_ms ({}) is below retry_delay_ms ({})",
                self.max_retry_delay_ms, self.retry_delay_ms
            ));
        }
        Ok(())
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1) as i32;
        let raw = self.retry_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_retry_delay_ms as f64)
        } else {
            self.max_retry_delay_ms as f64
        };
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt may follow the given (1-based) attempt.
    pub fn allows_retry(&self, attempt_number: u32) -> bool {
        attempt_number <= self.max_retries
    }
}

/// Decides which delivery errors are worth another attempt.
pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, error: &NotifyError) -> bool;
}

/// Retries every failure until the policy runs out.
pub struct RetryAll;

impl RetryClassifier for RetryAll {
    fn should_retry(&self, _error: &NotifyError) -> bool {
        true
    }
}

/// Retries only transient failures; permanent rejections fail immediately.
pub struct TransientOnly;

impl RetryClassifier for TransientOnly {
    fn should_retry(&self, error: &NotifyError) -> bool {
        error.kind() == FailureKind::Transient
    }
}

/// Configurable choice of [`RetryClassifier`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClassification {
    #[default]
    All,
    TransientOnly,
}

impl RetryClassification {
    pub fn classifier(self) -> Box<dyn RetryClassifier> {
        match self {
            Self::All => Box::new(RetryAll),
            Self::TransientOnly => Box::new(TransientOnly),
        }
    }
}
