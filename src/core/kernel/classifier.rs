use crate::core::errors::{ClassifiedError, ErrorKind, ExchangeError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Verdict for one venue error code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueErrorRule {
    pub kind: ErrorKind,
    /// Overrides the kind's default retryability.
    #[serde(default)]
    pub retryable: Option<bool>,
}

/// Substring match on the venue message, for venues without stable codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePattern {
    pub contains: String,
    pub kind: ErrorKind,
    #[serde(default)]
    pub retryable: Option<bool>,
}

/// Per-venue lookup table injected into the classifier at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VenueErrorTable {
    pub codes: HashMap<String, VenueErrorRule>,
    pub message_patterns: Vec<MessagePattern>,
    /// JSON pointer to the venue code inside a response body, e.g. `/code` or `/retCode`.
    pub code_pointer: Option<String>,
    /// JSON pointer to the venue message inside a response body.
    pub message_pointer: Option<String>,
    /// When non-empty, a 2xx body whose code is not listed here is a venue failure.
    pub success_codes: Vec<String>,
}

impl VenueErrorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code(self, code: impl Into<String>, kind: ErrorKind) -> Self {
        self.with_rule(code, kind, None)
    }

    pub fn with_rule(
        mut self,
        code: impl Into<String>,
        kind: ErrorKind,
        retryable: Option<bool>,
    ) -> Self {
        self.codes
            .insert(code.into(), VenueErrorRule { kind, retryable });
        self
    }

    pub fn with_pattern(mut self, contains: impl Into<String>, kind: ErrorKind) -> Self {
        self.message_patterns.push(MessagePattern {
            contains: contains.into(),
            kind,
            retryable: None,
        });
        self
    }

    pub fn with_code_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.code_pointer = Some(pointer.into());
        self
    }

    pub fn with_message_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.message_pointer = Some(pointer.into());
        self
    }

    pub fn with_success_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.success_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    /// Pull `(code, message)` out of a JSON body using the configured pointers.
    pub fn extract(&self, body: &[u8]) -> Option<(String, Option<String>)> {
        let pointer = self.code_pointer.as_deref()?;
        let value: Value = serde_json::from_slice(body).ok()?;
        let code = value.pointer(pointer).and_then(scalar_to_string)?;
        let message = self
            .message_pointer
            .as_deref()
            .and_then(|p| value.pointer(p))
            .and_then(scalar_to_string);
        Some((code, message))
    }

    /// A venue failure hidden inside a successful HTTP response, if any.
    pub fn failure_in_success_body(&self, status: u16, body: &[u8]) -> Option<ExchangeError> {
        if self.success_codes.is_empty() {
            return None;
        }
        let (code, message) = self.extract(body)?;
        if self.success_codes.iter().any(|c| *c == code) {
            return None;
        }
        Some(ExchangeError::Venue {
            code,
            message: message.unwrap_or_else(|| String::from_utf8_lossy(body).into_owned()),
            status: Some(status),
        })
    }

    fn rule_for_code(&self, code: &str) -> Option<(ErrorKind, Option<bool>)> {
        self.codes.get(code).map(|rule| (rule.kind, rule.retryable))
    }

    fn rule_for_message(&self, message: &str) -> Option<(ErrorKind, Option<bool>)> {
        let lowered = message.to_lowercase();
        self.message_patterns
            .iter()
            .find(|p| lowered.contains(&p.contains.to_lowercase()))
            .map(|p| (p.kind, p.retryable))
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Generic HTTP status defaults shared by all venues.
fn kind_for_status(status: u16) -> Option<ErrorKind> {
    match status {
        401 | 403 => Some(ErrorKind::AuthenticationError),
        404 => Some(ErrorKind::NotFoundError),
        429 => Some(ErrorKind::RateLimitedError),
        500..=599 => Some(ErrorKind::TransientError),
        _ => None,
    }
}

fn kind_for_transport(raw: &ExchangeError) -> Option<ErrorKind> {
    match raw {
        ExchangeError::Timeout(_)
        | ExchangeError::Network(_)
        | ExchangeError::ConnectionClosed(_)
        | ExchangeError::WebSocket(_) => Some(ErrorKind::TransientError),
        ExchangeError::Request(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
            Some(ErrorKind::TransientError)
        }
        ExchangeError::InvalidParameters(_) | ExchangeError::Config(_) => {
            Some(ErrorKind::ValidationError)
        }
        ExchangeError::AuthError(_) => Some(ErrorKind::AuthenticationError),
        _ => None,
    }
}

/// Maps raw failures into the shared taxonomy.
///
/// Precedence: venue code table, then venue message patterns, then the
/// generic HTTP status defaults, then the transport failure type. Anything
/// left is `UnclassifiedError` and not retryable.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    table: Arc<VenueErrorTable>,
    venue: Option<String>,
}

impl ErrorClassifier {
    pub fn new(table: VenueErrorTable) -> Self {
        Self {
            table: Arc::new(table),
            venue: None,
        }
    }

    /// Annotate every produced error with the venue name.
    pub fn for_venue(mut self, venue: impl Into<String>) -> Self {
        self.venue = Some(venue.into());
        self
    }

    pub fn table(&self) -> &VenueErrorTable {
        &self.table
    }

    pub fn classify(&self, raw: ExchangeError) -> ClassifiedError {
        let classified = classify(raw, &self.table);
        match &self.venue {
            Some(venue) => classified.with_venue(venue.clone()),
            None => classified,
        }
    }
}

/// Classify one raw failure against a venue table.
pub fn classify(raw: ExchangeError, table: &VenueErrorTable) -> ClassifiedError {
    let status = raw.status();

    let (venue_code, message, retry_after) = match &raw {
        ExchangeError::Http {
            body, retry_after, ..
        } => match table.extract(body.as_bytes()) {
            Some((code, message)) => (Some(code), message.unwrap_or_else(|| body.clone()), *retry_after),
            None => (None, body.clone(), *retry_after),
        },
        ExchangeError::Venue { code, message, .. } => (Some(code.clone()), message.clone(), None),
        other => (None, other.to_string(), None),
    };

    let verdict = venue_code
        .as_deref()
        .and_then(|code| table.rule_for_code(code))
        .or_else(|| table.rule_for_message(&message))
        .or_else(|| status.and_then(kind_for_status).map(|kind| (kind, None)))
        .or_else(|| kind_for_transport(&raw).map(|kind| (kind, None)));

    let (kind, retryable) = match verdict {
        Some((kind, override_retryable)) => {
            (kind, override_retryable.unwrap_or_else(|| kind.default_retryable()))
        }
        None => (ErrorKind::UnclassifiedError, false),
    };

    let message = if message.is_empty() {
        raw.to_string()
    } else {
        message
    };

    let mut classified = ClassifiedError::new(kind, message).with_retryable(retryable);
    if let Some(code) = venue_code {
        classified = classified.with_venue_code(code);
    }
    if let Some(status) = status {
        classified = classified.with_status(status);
    }
    if let Some(retry_after) = retry_after {
        classified = classified.with_retry_after(retry_after);
    }
    classified.with_cause(raw)
}
