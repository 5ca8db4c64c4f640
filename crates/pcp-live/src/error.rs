//! Error types for the pcp-live crate.

use std::fmt;

use thiserror::Error;

/// Error code pmwebd reports for an unknown context identifier.
const LEGACY_EXPIRED_CODE: &str = "12376";

/// Message pmproxy reports for an unknown context identifier.
const EXPIRED_MESSAGE: &str = "unknown context identifier";

/// Body of a failed backend response.
///
/// pmproxy answers with a JSON object (`{"success": false, "message": ...}`),
/// pmwebd with plain text.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorBody {
    /// Plain-text body.
    Text(String),
    /// JSON body.
    Json(serde_json::Value),
}

impl ErrorBody {
    /// Builds a body from raw response text, preferring JSON when it parses.
    #[must_use]
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) if value.is_object() => Self::Json(value),
            _ => Self::Text(text),
        }
    }

    /// Returns the human-readable message carried by the body.
    ///
    /// For JSON bodies this is the `message` field, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(value) => value.get("message").and_then(serde_json::Value::as_str),
        }
    }

    /// Returns `true` if the message contains the given fragment.
    #[must_use]
    pub fn mentions(&self, fragment: &str) -> bool {
        self.message().is_some_and(|m| m.contains(fragment))
    }

    /// Returns `true` for a JSON body that explicitly reports `success: false`.
    #[must_use]
    pub fn is_unsuccessful(&self) -> bool {
        match self {
            Self::Text(_) => false,
            Self::Json(value) => {
                value.get("success").and_then(serde_json::Value::as_bool) == Some(false)
            }
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{text}"),
            Self::Json(value) => match self.message() {
                Some(message) => write!(f, "{message}"),
                None => write!(f, "{value}"),
            },
        }
    }
}

/// Errors that can occur when talking to a PMAPI backend.
#[derive(Debug, Error)]
pub enum PmapiError {
    /// The request never produced a response.
    #[error("network error: {message}")]
    Network {
        /// Description of the transport failure.
        message: String,
    },

    /// The backend answered with an error status.
    #[error("backend error (status {status}): {body}")]
    Backend {
        /// HTTP status code.
        status: u16,
        /// Error body as returned by the backend.
        body: ErrorBody,
    },

    /// The response is missing a required field or has the wrong shape.
    #[error("received malformed response: {reason}")]
    MalformedResponse {
        /// What was wrong with the response.
        reason: String,
    },

    /// A lone metadata lookup named a metric the backend does not know.
    #[error("unknown metric name: {}", names.join(", "))]
    UnknownMetric {
        /// The requested names.
        names: Vec<String>,
    },

    /// The metric has no instance domain.
    #[error("metric {metric} has no instance domain")]
    NoIndom {
        /// The metric name.
        metric: String,
    },

    /// A store targeted a metric the backend cannot look up.
    #[error("cannot find metric {metric}, please check if the PMDA is enabled")]
    MetricNotFound {
        /// The metric name.
        metric: String,
    },

    /// The backend refused a store.
    #[error("insufficient permissions to store metric {metric}, please check the PMDA configuration")]
    PermissionDenied {
        /// The metric name.
        metric: String,
    },

    /// The stored value does not fit the metric's type.
    #[error("bad input for metric {metric}")]
    BadInput {
        /// The metric name.
        metric: String,
    },

    /// Semantic error in a derived metric expression.
    #[error("semantic error in '{expr}' definition")]
    DerivedSemantic {
        /// The offending expression.
        expr: String,
    },

    /// Syntax error in a derived metric expression.
    #[error("syntax error in '{expr}' definition")]
    DerivedSyntax {
        /// The offending expression.
        expr: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {reason}")]
    Config {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// The requested target format cannot be served.
    #[error("unsupported format: {reason}")]
    UnsupportedFormat {
        /// Why the format is unsupported.
        reason: String,
    },
}

impl PmapiError {
    /// Returns `true` if the backend no longer recognises the session handle.
    #[must_use]
    pub fn is_session_expired(&self) -> bool {
        match self {
            Self::Backend {
                body: ErrorBody::Text(text),
                ..
            } => text.contains(LEGACY_EXPIRED_CODE),
            Self::Backend {
                body: body @ ErrorBody::Json(_),
                ..
            } => body.mentions(EXPIRED_MESSAGE),
            _ => false,
        }
    }

    /// Returns the backend error body, if this is a backend error.
    #[must_use]
    pub const fn body(&self) -> Option<&ErrorBody> {
        match self {
            Self::Backend { body, .. } => Some(body),
            _ => None,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            reason: reason.into(),
        }
    }
}

/// Result type for PMAPI operations.
pub type Result<T> = std::result::Result<T, PmapiError>;
