//! Error taxonomy for the gate client
//!
//! Errors are split by how callers should react: transient failures are
//! retried by the retry manager, circuit-open failures fail fast so the UI can
//! report a degraded service, and everything else surfaces immediately with
//! enough context (operation, attempt count) for user-facing messages.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for gate client operations
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Transient network error: {message}")]
    TransientNetwork { message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    RequestTimeout { operation: String, timeout_ms: u64 },

    #[error("Connecting to {endpoint} timed out after {timeout_ms}ms")]
    ConnectTimeout { endpoint: String, timeout_ms: u64 },

    #[error("{context} failed after {attempts} attempts: {last_error}")]
    PublishFailed {
        context: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{context} exhausted {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        context: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Circuit breaker '{name}' is open, retry in {retry_in_ms}ms")]
    CircuitOpen { name: String, retry_in_ms: u64 },

    #[error("Subscription to '{topic}' failed: {message}")]
    Subscription { topic: String, message: String },

    #[error("Connection attempt already in progress")]
    ConnectionInProgress,

    #[error("Not connected")]
    NotConnected,

    #[error("'{actor}' may not issue the {command} command")]
    Unauthorized { actor: String, command: String },

    #[error("{context} cancelled")]
    Cancelled { context: String },

    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Sync store I/O failed: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl GateError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::TransientNetwork {
            message: message.into(),
        }
    }

    pub fn request_timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn connect_timeout<S: Into<String>>(endpoint: S, timeout_ms: u64) -> Self {
        Self::ConnectTimeout {
            endpoint: endpoint.into(),
            timeout_ms,
        }
    }

    pub fn subscription<T: Into<String>, M: Into<String>>(topic: T, message: M) -> Self {
        Self::Subscription {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(context: S) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            GateError::TransientNetwork { .. }
            | GateError::RequestTimeout { .. }
            | GateError::ConnectTimeout { .. }
            | GateError::NotConnected => true,
            GateError::Http { status, .. } => *status >= 500 || *status == 429,
            GateError::PublishFailed { .. }
            | GateError::ExhaustedRetries { .. }
            | GateError::CircuitOpen { .. }
            | GateError::Subscription { .. }
            | GateError::ConnectionInProgress
            | GateError::Unauthorized { .. }
            | GateError::Cancelled { .. }
            | GateError::InvalidBrokerUrl(_)
            | GateError::Serialization(_)
            | GateError::Storage(_)
            | GateError::Config(_) => false,
        }
    }

    /// True for fail-fast rejections that should read as "service degraded"
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, GateError::CircuitOpen { .. })
    }

    /// Sanitized message safe to show in a UI or publish to a log
    pub fn user_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

impl From<reqwest::Error> for GateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return GateError::RequestTimeout {
                operation: err
                    .url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|| "HTTP request".to_string()),
                timeout_ms: 0,
            };
        }
        if let Some(status) = err.status() {
            return GateError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        if err.is_decode() {
            return GateError::Http {
                status: 200,
                message: format!("Invalid response body: {err}"),
            };
        }
        GateError::transient(err.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("static regex compiles")
});

static CREDENTIAL_URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([a-z][a-z0-9+.-]*://)[^/\s:@]+:[^/\s@]+@").expect("static regex compiles")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials and bound the length of an error message
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();
    sanitized = CREDENTIAL_URL_PATTERN
        .replace_all(&sanitized, "${1}***@")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Result type for gate client operations
pub type GateResult<T> = Result<T, GateError>;
