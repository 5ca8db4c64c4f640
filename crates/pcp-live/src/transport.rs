//! Request transport used by [`Context`](crate::context::Context).
//!
//! The context never talks HTTP directly: it hands [`Request`]s to a
//! [`Transport`], which returns the decoded JSON body or a
//! [`PmapiError`]. [`HttpTransport`] is the reqwest-backed implementation.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::trace;

use crate::error::{ErrorBody, PmapiError, Result};

/// A GET request against the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Absolute URL, without query string.
    pub url: String,
    /// Query parameters, in order.
    pub params: Vec<(String, String)>,
}

impl Request {
    /// Creates a request without parameters.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: Vec::new(),
        }
    }

    /// Adds a query parameter and returns self for chaining.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    /// Returns the value of a query parameter, if present.
    #[must_use]
    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Sends requests to the backend.
///
/// Failed responses must be reported as [`PmapiError::Backend`] with the
/// response body intact, since session-expiry and unknown-metric
/// detection look at it.
pub trait Transport: Send + Sync {
    /// Performs the request and returns the JSON response body.
    ///
    /// # Errors
    ///
    /// Returns `PmapiError::Network` if no response was received and
    /// `PmapiError::Backend` for error statuses.
    fn request<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>>;
}

/// Transport over HTTP using reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with the given per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `PmapiError::Network` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PmapiError::Network {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, request: &Request) -> Result<serde_json::Value> {
        trace!(url = %request.url, params = ?request.params, "sending request");

        let response = self
            .client
            .get(&request.url)
            .query(&request.params)
            .send()
            .await
            .map_err(|e| PmapiError::Network {
                message: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| PmapiError::Network {
            message: format!("failed to read response: {e}"),
        })?;

        if !status.is_success() {
            return Err(PmapiError::Backend {
                status: status.as_u16(),
                body: ErrorBody::from_text(text),
            });
        }

        serde_json::from_str(&text).map_err(|e| PmapiError::malformed(format!("invalid JSON: {e}")))
    }
}

impl Transport for HttpTransport {
    fn request<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>> {
        Box::pin(self.send(request))
    }
}
