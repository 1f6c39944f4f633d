//! Crate-level error types
//!
//! Each module owns its error enum; [`RelayError`] aggregates them for the
//! service and binary. Only connection lifecycle and configuration loading
//! return errors to callers. Per-message failures are contained by the router.

use crate::config::ConfigError;
use crate::protocol::{DecodeError, TopicError};
use crate::routing::HandlerError;
use crate::tasks::TaskQueueError;
use crate::transport::mqtt::MqttError;
use crate::transport::PublishError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length of a sanitized message, suffix included
const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATED_SUFFIX: &str = "...[truncated]";

/// Main error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Task queue error: {0}")]
    TaskQueue(#[from] TaskQueueError),

    #[error("HTTP server error: {0}")]
    Server(#[from] warp::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RelayError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Display form with credentials redacted
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

/// Redact credentials and sensitive paths, and cap the length of messages that
/// may echo broker or HTTP errors into logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }
    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATED_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATED_SUFFIX);
    }

    sanitized
}
