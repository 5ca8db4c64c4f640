//! PMAPI session handling.
//!
//! A [`Context`] owns at most one backend session ("context" in PMAPI
//! terms). Every operation runs inside an ensure-session envelope: the
//! session is created on first use, and if the backend reports the handle
//! as unknown the session is recreated once and the operation retried
//! once.
//!
//! This module is also the only place that knows about the legacy pmwebd
//! dialect. Everything it returns uses millisecond timestamps, `None` for
//! "no instance" and empty label sets where the backend has none.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::ContextConfig;
use crate::error::{PmapiError, Result};
use crate::transport::{Request, Transport};
use crate::types::{
    ChildrenResponse, FetchResponse, IndomInstance, InstanceValue, MetricMetadata, MetricValues,
    StoreResponse,
};

/// Metric used to bind a session to a container.
const CONTAINER_METRIC: &str = "pmcd.client.container";

/// Instance id pmwebd uses for singular metrics.
const LEGACY_NO_INSTANCE: i64 = -1;

/// pmwebd error code for a fetch of a single unknown metric.
const LEGACY_UNKNOWN_FETCH_CODE: &str = "-12443";

/// An open backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    /// Backend context identifier.
    pub id: u64,
    /// Whether the backend speaks the legacy (pmwebd) dialect.
    pub legacy: bool,
    generation: u64,
}

impl Session {
    /// Path prefix of per-context endpoints (`_` on the legacy backend).
    #[must_use]
    pub const fn endpoint_prefix(&self) -> &'static str {
        if self.legacy { "_" } else { "" }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedContext {
    context: u64,
    #[serde(default)]
    source: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MetricsBody {
    metrics: Vec<MetricMetadata>,
}

#[derive(Debug, Deserialize)]
struct IndomBody {
    instances: Vec<IndomInstance>,
}

/// Fetch timestamp in either dialect.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    /// Legacy: whole seconds plus microseconds.
    Split { s: f64, us: f64 },
    /// Modern: fractional epoch seconds.
    Seconds(f64),
}

impl WireTimestamp {
    fn to_millis(&self) -> i64 {
        let millis = match self {
            Self::Split { s, us } => s * 1000.0 + us / 1000.0,
            Self::Seconds(s) => s * 1000.0,
        };
        millis.round() as i64
    }
}

#[derive(Debug, Deserialize)]
struct FetchBody {
    timestamp: WireTimestamp,
    #[serde(default)]
    values: Vec<MetricValues>,
}

/// Client-side handle on one backend session.
pub struct Context {
    transport: Arc<dyn Transport>,
    config: ContextConfig,
    session: RwLock<Option<Session>>,
    generation: RwLock<u64>,
    /// Serializes session creation.
    create_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("session", &*self.session.read())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Creates a context. No request is made until the first operation.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: ContextConfig) -> Self {
        Self {
            transport,
            config,
            session: RwLock::new(None),
            generation: RwLock::new(0),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Creates an independent context with the same transport and settings.
    #[must_use]
    pub fn new_instance(&self) -> Self {
        Self::new(Arc::clone(&self.transport), self.config.clone())
    }

    /// Returns the connection settings.
    #[must_use]
    pub const fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Returns the current session, if one is open.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        *self.session.read()
    }

    /// Opens a new session, replacing the current one.
    ///
    /// Concurrent callers are serialized; each call performs its own
    /// creation round trip.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be created or bound.
    pub async fn create_session(&self) -> Result<Session> {
        let _guard = self.create_lock.lock().await;
        self.open_session().await
    }

    /// Returns a usable session, creating one unless another caller already
    /// replaced the one this caller saw (`seen` is its generation).
    async fn acquire_session(&self, seen: Option<u64>) -> Result<Session> {
        let _guard = self.create_lock.lock().await;

        let current = *self.session.read();
        if let Some(current) = current {
            if seen != Some(current.generation) {
                return Ok(current);
            }
        }

        self.open_session().await
    }

    /// Must be called with `create_lock` held.
    async fn open_session(&self) -> Result<Session> {
        let request = Request::new(format!("{}/pmapi/context", self.config.url))
            .param("hostspec", &self.config.hostspec)
            .param("polltimeout", self.config.polltimeout_secs);
        let created: CreatedContext = decode(self.transport.request(&request).await?, "context")?;

        // only pmproxy reports a source
        let legacy = created.source.is_none();
        let generation = {
            let mut generation = self.generation.write();
            *generation += 1;
            *generation
        };
        let session = Session {
            id: created.context,
            legacy,
            generation,
        };

        if let Some(container) = &self.config.container {
            let request = self
                .endpoint_request(&session, "store")
                .param("name", CONTAINER_METRIC)
                .param("value", container);
            self.transport.request(&request).await?;
            debug!(context = session.id, container = %container, "bound context to container");
        }

        *self.session.write() = Some(session);
        debug!(context = session.id, legacy, "created context");
        Ok(session)
    }

    fn endpoint_request(&self, session: &Session, endpoint: &str) -> Request {
        Request::new(format!(
            "{}/pmapi/{}/{}{endpoint}",
            self.config.url,
            session.id,
            session.endpoint_prefix()
        ))
    }

    /// Runs `op` against a session, recreating the session and retrying
    /// once if the backend no longer knows it.
    async fn with_session<T, F, Fut>(&self, mut op: F) -> Result<(Session, T)>
    where
        F: FnMut(Session) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let current = *self.session.read();
        let session = match current {
            Some(session) => session,
            None => self.acquire_session(None).await?,
        };

        match op(session).await {
            Err(err) if err.is_session_expired() => {
                info!(context = session.id, "context expired, creating new context");
                let fresh = self.acquire_session(Some(session.generation)).await?;
                op(fresh).await.map(|value| (fresh, value))
            }
            result => result.map(|value| (session, value)),
        }
    }

    /// Sends a request to a per-context endpoint inside the envelope.
    async fn call(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<(Session, serde_json::Value)> {
        let transport = &self.transport;
        self.with_session(|session| {
            let request = params.iter().fold(
                self.endpoint_request(&session, endpoint),
                |request, (key, value)| request.param(*key, value),
            );
            async move { transport.request(&request).await }
        })
        .await
    }

    /// Looks up metadata for the given metrics.
    ///
    /// The backend silently drops unknown names from multi-metric requests
    /// but fails a request for a single unknown metric; that failure is
    /// reported as `PmapiError::UnknownMetric`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn metrics(&self, names: &[String]) -> Result<Vec<MetricMetadata>> {
        let joined = names.join(",");
        let (session, body) = self
            .call("metric", &[("names", &joined)])
            .await
            .map_err(|err| match err.body() {
                Some(body)
                    if !err.is_session_expired()
                        && (body.mentions("Unknown metric name")
                            || (names.len() == 1 && body.is_unsuccessful())) =>
                {
                    PmapiError::UnknownMetric {
                        names: names.to_vec(),
                    }
                }
                _ => err,
            })?;

        let mut metrics = decode::<MetricsBody>(body, "metrics")?.metrics;
        if session.legacy {
            for metric in &mut metrics {
                metric.labels.clear();
            }
        }
        Ok(metrics)
    }

    /// Lists the instance domain of a metric.
    ///
    /// # Errors
    ///
    /// Returns `PmapiError::NoIndom` if the metric has no instance domain.
    pub async fn indom(&self, metric: &str) -> Result<Vec<IndomInstance>> {
        let (session, body) = self
            .call("indom", &[("name", metric)])
            .await
            .map_err(|err| match err.body() {
                Some(body) if body.mentions("metric has null indom") => PmapiError::NoIndom {
                    metric: metric.to_string(),
                },
                _ => err,
            })?;

        let mut instances = decode::<IndomBody>(body, "instances")?.instances;
        if session.legacy {
            for instance in &mut instances {
                instance.labels.clear();
            }
        }
        Ok(instances)
    }

    /// Fetches current values.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn fetch(&self, names: &[String]) -> Result<FetchResponse> {
        let joined = names.join(",");
        let result = self.call("fetch", &[("names", &joined)]).await;

        let (session, body) = match result {
            Ok(ok) => ok,
            Err(err)
                if err
                    .body()
                    .is_some_and(|body| body.mentions(LEGACY_UNKNOWN_FETCH_CODE)) =>
            {
                debug!(metrics = %joined, "fetch of unknown metric, returning empty result");
                return Ok(FetchResponse::default());
            }
            Err(err) => return Err(err),
        };

        let fetched = decode::<FetchBody>(body, "timestamp")?;
        let mut values = fetched.values;
        if session.legacy {
            for instance in values.iter_mut().flat_map(|m| m.instances.iter_mut()) {
                normalize_legacy_instance(instance);
            }
        }

        Ok(FetchResponse {
            timestamp: fetched.timestamp.to_millis(),
            values,
        })
    }

    /// Stores a value into a metric.
    ///
    /// # Errors
    ///
    /// Returns `MetricNotFound`, `PermissionDenied` or `BadInput` for the
    /// corresponding backend refusals.
    pub async fn store(&self, metric: &str, value: &str) -> Result<StoreResponse> {
        let (_, body) = self
            .call("store", &[("name", metric), ("value", value)])
            .await
            .map_err(|err| {
                let metric = metric.to_string();
                match err.body() {
                    Some(body) if body.mentions("failed to lookup metric") => {
                        PmapiError::MetricNotFound { metric }
                    }
                    Some(body) if body.mentions("No permission to perform requested operation") => {
                        PmapiError::PermissionDenied { metric }
                    }
                    Some(body) if body.mentions("Bad input") => PmapiError::BadInput { metric },
                    _ => err,
                }
            })?;

        decode(body, "success")
    }

    /// Lists the names directly below a namespace prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn children(&self, prefix: &str) -> Result<ChildrenResponse> {
        let (_, body) = self.call("children", &[("prefix", prefix)]).await?;
        serde_json::from_value(body).map_err(|e| PmapiError::malformed(e.to_string()))
    }

    /// Defines a derived metric.
    ///
    /// An already existing derived metric of the same name counts as success.
    ///
    /// # Errors
    ///
    /// Returns `DerivedSemantic` or `DerivedSyntax` for invalid expressions.
    pub async fn derive(&self, name: &str, expr: &str) -> Result<StoreResponse> {
        let result = self.call("derive", &[("name", name), ("expr", expr)]).await;

        let body = match result {
            Ok((_, body)) => body,
            Err(err) => {
                let expr = expr.to_string();
                return match err.body() {
                    Some(body) if body.mentions("Duplicate derived metric name") => {
                        Ok(StoreResponse { success: true })
                    }
                    Some(body) if body.mentions("Semantic Error") => {
                        Err(PmapiError::DerivedSemantic { expr })
                    }
                    Some(body) if body.mentions("Syntax Error") => {
                        Err(PmapiError::DerivedSyntax { expr })
                    }
                    _ => Err(err),
                };
            }
        };

        decode(body, "success")
    }
}

fn normalize_legacy_instance(instance: &mut InstanceValue) {
    if instance.instance == Some(LEGACY_NO_INSTANCE) {
        instance.instance = None;
    }
}

fn decode<T: DeserializeOwned>(body: serde_json::Value, required: &str) -> Result<T> {
    if body.get(required).is_none() {
        return Err(PmapiError::malformed(format!(
            "missing field '{required}'"
        )));
    }
    serde_json::from_value(body).map_err(|e| PmapiError::malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorBody;
    use crate::testing::FakeBackend;
    use serde_json::json;

    fn context(backend: &Arc<FakeBackend>) -> Context {
        Context::new(backend.clone(), ContextConfig::new("http://localhost:44322"))
    }

    fn expired_json() -> PmapiError {
        PmapiError::Backend {
            status: 400,
            body: ErrorBody::Json(json!({
                "success": false,
                "message": "unknown context identifier: 348"
            })),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    mod session_tests {
        use super::*;

        #[tokio::test]
        async fn creates_session_lazily_with_fixed_hostspec() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            assert!(ctx.session().is_none());

            backend.push("children", Ok(json!({"leaf": [], "nonleaf": ["kernel"]})));
            ctx.children("").await.unwrap();

            let requests = backend.requests();
            assert_eq!(requests[0].url, "http://localhost:44322/pmapi/context");
            assert_eq!(requests[0].get_param("hostspec"), Some("127.0.0.1"));
            assert_eq!(requests[0].get_param("polltimeout"), Some("30"));
            assert_eq!(requests[1].url, "http://localhost:44322/pmapi/1/children");

            let session = ctx.session().unwrap();
            assert_eq!(session.id, 1);
            assert!(!session.legacy);
        }

        #[tokio::test]
        async fn detects_legacy_backend_and_prefixes_paths() {
            let backend = FakeBackend::legacy();
            let ctx = context(&backend);

            backend.push("children", Ok(json!({"leaf": ["load"], "nonleaf": []})));
            ctx.children("kernel.all").await.unwrap();

            assert!(ctx.session().unwrap().legacy);
            assert_eq!(
                backend.requests()[1].url,
                "http://localhost:44322/pmapi/1/_children"
            );
        }

        #[tokio::test]
        async fn binds_container_after_creation() {
            let backend = FakeBackend::modern();
            let ctx = Context::new(
                backend.clone(),
                ContextConfig::new("http://localhost:44322").with_container("web"),
            );

            backend.push("store", Ok(json!({"success": true})));
            ctx.create_session().await.unwrap();

            let requests = backend.requests();
            assert_eq!(requests.len(), 2);
            assert_eq!(requests[1].url, "http://localhost:44322/pmapi/1/store");
            assert_eq!(requests[1].get_param("name"), Some("pmcd.client.container"));
            assert_eq!(requests[1].get_param("value"), Some("web"));
        }

        #[tokio::test]
        async fn failed_creation_leaves_no_session_and_releases_lock() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);

            backend.push(
                "context",
                Err(PmapiError::Network {
                    message: "connection refused".into(),
                }),
            );
            assert!(ctx.children("").await.is_err());
            assert!(ctx.session().is_none());

            backend.push("children", Ok(json!({"leaf": [], "nonleaf": []})));
            assert!(ctx.children("").await.is_ok());
        }

        #[tokio::test]
        async fn malformed_creation_response_is_rejected() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);

            backend.push("context", Ok(json!({"source": "abc"})));
            assert!(matches!(
                ctx.create_session().await,
                Err(PmapiError::MalformedResponse { .. })
            ));
        }

        #[tokio::test]
        async fn concurrent_callers_share_one_session() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);

            backend.push("children", Ok(json!({"leaf": ["a"], "nonleaf": []})));
            backend.push("children", Ok(json!({"leaf": ["b"], "nonleaf": []})));

            let (a, b) = tokio::join!(ctx.children("x"), ctx.children("y"));
            assert!(a.is_ok());
            assert!(b.is_ok());

            assert_eq!(backend.count("context"), 1);
            assert_eq!(backend.count("children"), 2);
        }

        #[tokio::test]
        async fn new_instance_has_its_own_session() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            ctx.create_session().await.unwrap();

            let other = ctx.new_instance();
            assert!(other.session().is_none());
            assert_eq!(other.config(), ctx.config());
        }
    }

    mod expiry_tests {
        use super::*;

        #[tokio::test]
        async fn interleaved_expiries_share_one_recreation() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            ctx.create_session().await.unwrap();

            backend.push("children", Err(expired_json()));
            backend.push("children", Err(expired_json()));
            backend.push("children", Ok(json!({"leaf": ["a"], "nonleaf": []})));
            backend.push("children", Ok(json!({"leaf": ["b"], "nonleaf": []})));

            let (a, b) = tokio::join!(ctx.children("x"), ctx.children("y"));
            assert!(a.is_ok());
            assert!(b.is_ok());

            assert_eq!(backend.count("context"), 2);
            assert_eq!(backend.count("children"), 4);
            assert_eq!(ctx.session().unwrap().id, 2);
        }

        #[tokio::test]
        async fn recreates_session_and_retries_once() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);

            backend.push("children", Err(expired_json()));
            backend.push("children", Ok(json!({"leaf": ["load"], "nonleaf": []})));

            let children = ctx.children("kernel.all").await.unwrap();
            assert_eq!(children.leaf, vec!["load".to_string()]);

            assert_eq!(backend.count("context"), 2);
            assert_eq!(backend.count("children"), 2);
            assert_eq!(ctx.session().unwrap().id, 2);
            assert_eq!(
                backend.requests().last().unwrap().url,
                "http://localhost:44322/pmapi/2/children"
            );
        }

        #[tokio::test]
        async fn legacy_expiry_code_is_recognized() {
            let backend = FakeBackend::legacy();
            let ctx = context(&backend);

            backend.push(
                "children",
                Err(PmapiError::Backend {
                    status: 400,
                    body: ErrorBody::Text("-12376".into()),
                }),
            );
            backend.push("children", Ok(json!({"leaf": [], "nonleaf": []})));

            assert!(ctx.children("").await.is_ok());
            assert_eq!(backend.count("context"), 2);
        }

        #[tokio::test]
        async fn second_expiry_propagates() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);

            backend.push("metric", Err(expired_json()));
            backend.push("metric", Err(expired_json()));

            let err = ctx.metrics(&names(&["a.b"])).await.unwrap_err();
            assert!(err.is_session_expired());
            assert_eq!(backend.count("context"), 2);
            assert_eq!(backend.count("metric"), 2);
        }

        #[tokio::test]
        async fn other_failures_are_not_retried() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);

            backend.push(
                "children",
                Err(PmapiError::Network {
                    message: "reset".into(),
                }),
            );

            assert!(matches!(
                ctx.children("").await,
                Err(PmapiError::Network { .. })
            ));
            assert_eq!(backend.count("context"), 1);
            assert_eq!(backend.count("children"), 1);
        }
    }

    mod metrics_tests {
        use super::*;

        fn metric(name: &str) -> serde_json::Value {
            json!({
                "name": name,
                "pmid": "1.0.1",
                "type": "u64",
                "sem": "instant",
                "units": "",
                "labels": {"agent": "sample"}
            })
        }

        #[tokio::test]
        async fn returns_metadata() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            backend.push("metric", Ok(json!({"metrics": [metric("a.b"), metric("c.d")]})));

            let metrics = ctx.metrics(&names(&["a.b", "c.d"])).await.unwrap();
            assert_eq!(metrics.len(), 2);
            assert_eq!(metrics[0].labels["agent"], json!("sample"));
            assert_eq!(backend.requests()[1].get_param("names"), Some("a.b,c.d"));
        }

        #[tokio::test]
        async fn lone_unknown_metric_is_reported() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            backend.push(
                "metric",
                Err(PmapiError::Backend {
                    status: 400,
                    body: ErrorBody::Json(json!({
                        "success": false,
                        "message": "Unknown metric name - no.such.metric"
                    })),
                }),
            );

            let err = ctx.metrics(&names(&["no.such.metric"])).await.unwrap_err();
            assert!(matches!(err, PmapiError::UnknownMetric { names } if names == ["no.such.metric"]));
            assert_eq!(backend.count("context"), 1);
        }

        #[tokio::test]
        async fn lone_metric_failure_without_message_is_unknown() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            backend.push(
                "metric",
                Err(PmapiError::Backend {
                    status: 400,
                    body: ErrorBody::Json(json!({"success": false})),
                }),
            );

            let err = ctx.metrics(&names(&["no.such.metric"])).await.unwrap_err();
            assert!(matches!(err, PmapiError::UnknownMetric { .. }));
        }

        #[tokio::test]
        async fn multi_metric_backend_failure_propagates() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            backend.push(
                "metric",
                Err(PmapiError::Backend {
                    status: 500,
                    body: ErrorBody::Json(json!({
                        "success": false,
                        "message": "Not enough memory"
                    })),
                }),
            );

            let err = ctx.metrics(&names(&["a.b", "c.d"])).await.unwrap_err();
            assert!(matches!(err, PmapiError::Backend { status: 500, .. }));
        }

        #[tokio::test]
        async fn mixed_known_and_unknown_metrics_return_known_only() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            backend.push("metric", Ok(json!({"metrics": [metric("a.b")]})));

            let metrics = ctx.metrics(&names(&["a.b", "no.such.metric"])).await.unwrap();
            assert_eq!(metrics.len(), 1);
            assert_eq!(metrics[0].name, "a.b");
        }

        #[tokio::test]
        async fn legacy_metrics_have_no_labels() {
            let backend = FakeBackend::legacy();
            let ctx = context(&backend);
            backend.push("metric", Ok(json!({"metrics": [metric("a.b")]})));

            let metrics = ctx.metrics(&names(&["a.b"])).await.unwrap();
            assert!(metrics[0].labels.is_empty());
        }

        #[tokio::test]
        async fn missing_metrics_field_is_malformed() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            backend.push("metric", Ok(json!({"unexpected": true})));

            assert!(matches!(
                ctx.metrics(&names(&["a.b"])).await,
                Err(PmapiError::MalformedResponse { .. })
            ));
        }
    }

    mod indom_tests {
        use super::*;

        #[tokio::test]
        async fn legacy_instances_have_no_labels() {
            let backend = FakeBackend::legacy();
            let ctx = context(&backend);
            backend.push(
                "indom",
                Ok(json!({"instances": [{"instance": 0, "name": "cpu0", "labels": {"x": 1}}]})),
            );

            let instances = ctx.indom("kernel.percpu.cpu.user").await.unwrap();
            assert_eq!(instances[0].name, "cpu0");
            assert!(instances[0].labels.is_empty());
        }

        #[tokio::test]
        async fn null_indom_is_reported() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            backend.push(
                "indom",
                Err(PmapiError::Backend {
                    status: 400,
                    body: ErrorBody::Json(json!({"success": false, "message": "metric has null indom"})),
                }),
            );

            assert!(matches!(
                ctx.indom("kernel.all.load").await,
                Err(PmapiError::NoIndom { metric }) if metric == "kernel.all.load"
            ));
        }
    }

    mod fetch_tests {
        use super::*;

        #[tokio::test]
        async fn modern_timestamps_become_millis() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            backend.push(
                "fetch",
                Ok(json!({
                    "timestamp": 1_547_483_646.214,
                    "values": [{"pmid": "1.0.1", "name": "a.b", "instances": [{"instance": null, "value": 3}]}]
                })),
            );

            let fetched = ctx.fetch(&names(&["a.b"])).await.unwrap();
            assert_eq!(fetched.timestamp, 1_547_483_646_214);
            assert_eq!(fetched.values[0].instances[0].instance, None);
        }

        #[tokio::test]
        async fn legacy_shapes_are_normalized() {
            let backend = FakeBackend::legacy();
            let ctx = context(&backend);
            backend.push(
                "fetch",
                Ok(json!({
                    "timestamp": {"s": 5, "us": 2000},
                    "values": [{"pmid": 633_356_298, "name": "a.b", "instances": [
                        {"instance": -1, "value": 45200},
                        {"instance": 3, "value": 1}
                    ]}]
                })),
            );

            let fetched = ctx.fetch(&names(&["a.b"])).await.unwrap();
            assert_eq!(fetched.timestamp, 5002);
            assert_eq!(fetched.values[0].instances[0].instance, None);
            assert_eq!(fetched.values[0].instances[1].instance, Some(3));
        }

        #[tokio::test]
        async fn legacy_lone_unknown_fetch_is_empty() {
            let backend = FakeBackend::legacy();
            let ctx = context(&backend);
            backend.push(
                "fetch",
                Err(PmapiError::Backend {
                    status: 400,
                    body: ErrorBody::Text("-12443".into()),
                }),
            );

            let fetched = ctx.fetch(&names(&["no.such"])).await.unwrap();
            assert_eq!(fetched, FetchResponse::default());
        }

        #[tokio::test]
        async fn missing_timestamp_is_malformed() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            backend.push("fetch", Ok(json!({"values": []})));

            assert!(matches!(
                ctx.fetch(&names(&["a.b"])).await,
                Err(PmapiError::MalformedResponse { .. })
            ));
        }
    }

    mod store_tests {
        use super::*;
        use test_case::test_case;

        fn refusal(message: &str) -> PmapiError {
            PmapiError::Backend {
                status: 400,
                body: ErrorBody::Json(json!({"success": false, "message": message})),
            }
        }

        #[tokio::test]
        async fn store_passes_name_and_value() {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            backend.push("store", Ok(json!({"success": true})));

            let response = ctx.store("sample.write_me", "5").await.unwrap();
            assert!(response.success);

            let request = backend.requests().pop().unwrap();
            assert_eq!(request.get_param("name"), Some("sample.write_me"));
            assert_eq!(request.get_param("value"), Some("5"));
        }

        #[test_case("failed to lookup metric 'x'", "not_found" ; "unknown metric")]
        #[test_case("No permission to perform requested operation", "permission" ; "permission denied")]
        #[test_case("Bad input", "bad_input" ; "bad input")]
        #[tokio::test]
        async fn store_refusals_are_named(message: &str, kind: &str) {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            backend.push("store", Err(refusal(message)));

            let err = ctx.store("x", "abc").await.unwrap_err();
            let matched = match kind {
                "not_found" => matches!(err, PmapiError::MetricNotFound { ref metric } if metric == "x"),
                "permission" => matches!(err, PmapiError::PermissionDenied { ref metric } if metric == "x"),
                _ => matches!(err, PmapiError::BadInput { ref metric } if metric == "x"),
            };
            assert!(matched, "unexpected error: {err}");
        }

        #[test_case("Duplicate derived metric name", true ; "duplicate is success")]
        #[test_case("Semantic Error: bad units", false ; "semantic")]
        #[test_case("Syntax Error: unexpected end", false ; "syntax")]
        #[tokio::test]
        async fn derive_error_mapping(message: &str, ok: bool) {
            let backend = FakeBackend::modern();
            let ctx = context(&backend);
            backend.push("derive", Err(refusal(message)));

            let result = ctx.derive("my.derived", "a.b +").await;
            if ok {
                assert!(result.unwrap().success);
            } else {
                let err = result.unwrap_err();
                assert!(matches!(
                    err,
                    PmapiError::DerivedSemantic { .. } | PmapiError::DerivedSyntax { .. }
                ));
                assert!(err.to_string().contains("a.b +"));
            }
        }
    }
}
