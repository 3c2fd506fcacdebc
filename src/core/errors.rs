use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw failure produced by transports, codecs and configuration.
///
/// This is what the classifier consumes. It never crosses the public
/// `request`/`subscribe` contracts on its own; callers only ever see a
/// [`ClassifiedError`] wrapping it.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("Venue error {code}: {message}")]
    Venue {
        code: String,
        message: String,
        status: Option<u16>,
    },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::core::config::ConfigError),

    #[error("Other error: {0}")]
    Other(String),
}

impl ExchangeError {
    /// HTTP status attached to this failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Venue { status, .. } => *status,
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Shared failure taxonomy across every venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad caller input.
    ValidationError,
    /// Credentials rejected; the caller must refresh them.
    AuthenticationError,
    /// Venue-side throttling.
    RateLimitedError,
    NotFoundError,
    /// Network, timeout or 5xx.
    TransientError,
    /// Circuit open, failed without touching the network.
    ServiceUnavailable,
    UnclassifiedError,
}

impl ErrorKind {
    /// Retryability verdict used when nothing more specific is known.
    pub const fn default_retryable(self) -> bool {
        matches!(self, Self::RateLimitedError | Self::TransientError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ValidationError => "ValidationError",
            Self::AuthenticationError => "AuthenticationError",
            Self::RateLimitedError => "RateLimitedError",
            Self::NotFoundError => "NotFoundError",
            Self::TransientError => "TransientError",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::UnclassifiedError => "UnclassifiedError",
        };
        f.write_str(name)
    }
}

/// Normalized failure record. Immutable once produced.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub venue_code: Option<String>,
    pub status: Option<u16>,
    pub message: String,
    pub retry_after: Option<Duration>,
    pub venue: Option<String>,
    #[source]
    pub cause: Option<Arc<ExchangeError>>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.default_retryable(),
            venue_code: None,
            status: None,
            message: message.into(),
            retry_after: None,
            venue: None,
            cause: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientError, message)
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_venue_code(mut self, code: impl Into<String>) -> Self {
        self.venue_code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_cause(mut self, cause: ExchangeError) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Annotate with the venue name. The kind and verdict are left untouched.
    pub fn with_venue(mut self, venue: impl Into<String>) -> Self {
        self.venue = Some(venue.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_default_retryability() {
        assert!(ErrorKind::TransientError.default_retryable());
        assert!(ErrorKind::RateLimitedError.default_retryable());
        assert!(!ErrorKind::AuthenticationError.default_retryable());
        assert!(!ErrorKind::ServiceUnavailable.default_retryable());
        assert!(!ErrorKind::UnclassifiedError.default_retryable());
    }

    #[test]
    fn test_classified_error_keeps_cause() {
        let err = ClassifiedError::transient("upstream reset")
            .with_cause(ExchangeError::Network("connection reset by peer".to_string()))
            .with_venue("bybit");

        assert_eq!(err.to_string(), "TransientError: upstream reset");
        assert_eq!(err.venue.as_deref(), Some("bybit"));
        let source = err.source().expect("cause should be exposed as source");
        assert!(source.to_string().contains("connection reset"));
    }

    #[test]
    fn test_status_extraction() {
        let err = ExchangeError::Http {
            status: 503,
            body: String::new(),
            retry_after: None,
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(ExchangeError::Timeout("x".to_string()).status(), None);
    }
}
