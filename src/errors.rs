use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retry metadata surfaced on transport/API errors when retries were attempted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryMetadata {
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Structured validation error raised before any request is sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "{}: {}", field, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<String> for ValidationError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ValidationError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Error envelope returned by the gateway (`{"error": {"code", "message"}}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct APIError {
    /// HTTP status, or 0 when the error arrived inside an event stream.
    pub status: u16,
    pub code: Option<String>,
    pub message: String,
    pub request_id: Option<String>,
    /// Parsed `Retry-After` hint (rate limiting only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryMetadata>,
    /// Raw response body for debugging (when available).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
}

impl APIError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
            request_id: None,
            retry_after: None,
            retries: None,
            raw_body: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Remote error code, or `UNKNOWN` when the gateway did not send one.
    pub fn code_or_unknown(&self) -> &str {
        self.code.as_deref().unwrap_or("UNKNOWN")
    }
}

impl fmt::Display for APIError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "{} ({}): {}", code, self.status, self.message)
        } else {
            write!(f, "{}: {}", self.status, self.message)
        }
    }
}

impl std::error::Error for APIError {}

/// Convenience alias for fallible SDK results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Transport-level error (timeouts, DNS/TLS/connectivity, dropped streams).
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    #[source]
    pub source: Option<reqwest::Error>,
    pub retries: Option<RetryMetadata>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            retries: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, retries: Option<RetryMetadata>) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_request() || err.is_body() {
            TransportErrorKind::Request
        } else {
            TransportErrorKind::Other
        };
        Self {
            kind,
            message: err.to_string(),
            source: Some(err),
            retries,
        }
    }
}

/// Broad transport error kinds for classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Request,
    /// The peer closed a streaming connection.
    Closed,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Request => "request",
            TransportErrorKind::Closed => "closed",
            TransportErrorKind::Other => "transport",
        };
        write!(f, "{label}")
    }
}

/// Why a wait stopped before the call finished.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired.
    Signal,
    /// The wait's deadline elapsed.
    Deadline,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Signal => write!(f, "cancelled by caller"),
            CancelReason::Deadline => write!(f, "deadline exceeded"),
        }
    }
}

/// Coarse error taxonomy used by callers and by the waiter's recovery rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AuthFailure,
    RateLimited,
    PolicyViolation,
    TransientTransport,
    Cancelled,
    MalformedResponse,
    /// Any other non-retryable remote error.
    Api,
    Validation,
    Configuration,
}

/// Unified error type surfaced by the SDK.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("authorization failed: {0}")]
    Auth(APIError),

    #[error("rate limited: {0}")]
    RateLimited(APIError),

    #[error("call rejected: {0}")]
    Policy(APIError),

    #[error("{0}")]
    Api(APIError),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("malformed response: {message}")]
    MalformedResponse {
        message: String,
        raw_data: Option<String>,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unexpected stream content type: expected {expected}, got {received} (status {status})")]
    StreamContentType {
        expected: &'static str,
        received: String,
        status: u16,
    },

    #[error("wait cancelled: {reason}")]
    Cancelled { reason: CancelReason },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Auth(_) => ErrorKind::AuthFailure,
            Error::RateLimited(_) => ErrorKind::RateLimited,
            Error::Policy(_) => ErrorKind::PolicyViolation,
            Error::Api(api) if api.status >= 500 || api.status == 408 => {
                ErrorKind::TransientTransport
            }
            Error::Api(_) => ErrorKind::Api,
            Error::Transport(_) => ErrorKind::TransientTransport,
            Error::MalformedResponse { .. }
            | Error::Serialization(_)
            | Error::StreamContentType { .. } => ErrorKind::MalformedResponse,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// True for failures the poll loop may retry locally.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientTransport
    }

    /// Remote error envelope, when the failure came from the gateway.
    pub fn api_error(&self) -> Option<&APIError> {
        match self {
            Error::Auth(api) | Error::RateLimited(api) | Error::Policy(api) | Error::Api(api) => {
                Some(api)
            }
            _ => None,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>, raw: Option<&str>) -> Self {
        Error::MalformedResponse {
            message: message.into(),
            raw_data: raw.map(|data| truncate_for_error(data, 200)),
        }
    }
}

/// Truncate raw data for error messages (avoid huge payloads in logs).
pub(crate) fn truncate_for_error(data: &str, max_len: usize) -> String {
    if data.len() <= max_len {
        return data.to_string();
    }
    let mut end = max_len;
    while !data.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes total)", &data[..end], data.len())
}
