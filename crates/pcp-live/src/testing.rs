//! Scripted backend shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use crate::error::{ErrorBody, PmapiError, Result};
use crate::transport::{Request, Transport};

/// Answers requests from per-endpoint queues and records every request.
///
/// Session creation answers automatically with increasing context ids unless
/// a `context` response was queued.
#[derive(Debug)]
pub(crate) struct FakeBackend {
    legacy: bool,
    next_context: Mutex<u64>,
    queued: Mutex<HashMap<String, VecDeque<Result<serde_json::Value>>>>,
    requests: Mutex<Vec<Request>>,
}

impl FakeBackend {
    pub(crate) fn modern() -> Arc<Self> {
        Arc::new(Self::with_dialect(false))
    }

    pub(crate) fn legacy() -> Arc<Self> {
        Arc::new(Self::with_dialect(true))
    }

    fn with_dialect(legacy: bool) -> Self {
        Self {
            legacy,
            next_context: Mutex::new(0),
            queued: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues a response for an endpoint (`context`, `metric`, `fetch`, ...).
    pub(crate) fn push(&self, endpoint: &str, response: Result<serde_json::Value>) {
        self.queued
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(response);
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Number of requests made to an endpoint.
    pub(crate) fn count(&self, endpoint: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| endpoint_of(r) == endpoint)
            .count()
    }

    fn respond(&self, request: &Request) -> Result<serde_json::Value> {
        self.requests.lock().push(request.clone());
        let endpoint = endpoint_of(request);

        let queued = self
            .queued
            .lock()
            .get_mut(&endpoint)
            .and_then(VecDeque::pop_front);
        if let Some(response) = queued {
            return response;
        }

        if endpoint == "context" {
            let mut next = self.next_context.lock();
            *next += 1;
            return Ok(if self.legacy {
                json!({"context": *next})
            } else {
                json!({"context": *next, "source": "0e89c1192db79326900d82697d9ab9ee"})
            });
        }

        Err(PmapiError::Backend {
            status: 500,
            body: ErrorBody::Text(format!("no scripted response for {endpoint}")),
        })
    }
}

fn endpoint_of(request: &Request) -> String {
    request
        .url
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim_start_matches('_')
        .to_string()
}

impl Transport for FakeBackend {
    fn request<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>> {
        Box::pin(async move {
            // give interleaved callers a chance to run
            tokio::task::yield_now().await;
            self.respond(request)
        })
    }
}
