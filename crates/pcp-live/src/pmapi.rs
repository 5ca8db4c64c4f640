//! Caching layer over a [`Context`].
//!
//! [`PmapiSrv`] keeps three caches:
//!
//! - metric metadata, kept until a fetch no longer returns the metric
//! - instance domains per metric, always replaced wholesale on refresh
//! - namespace children per prefix, never evicted
//!
//! It also implements [`MetadataSource`], the synchronous cache-only view
//! the [`DataStore`](crate::datastore::DataStore) uses during ingest.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::debug;

use crate::context::Context;
use crate::error::{PmapiError, Result};
use crate::types::{
    ChildrenResponse, FetchResponse, IndomInstance, InstanceId, Labels, MetricMetadata,
    StoreResponse,
};

/// Cache-only metadata lookups.
///
/// Implementations must not block or perform I/O.
pub trait MetadataSource: Send + Sync {
    /// Returns cached metadata for a metric.
    fn find_metric_metadata(&self, metric: &str) -> Option<MetricMetadata>;

    /// Returns a cached instance of a metric's instance domain.
    fn find_instance(&self, metric: &str, instance: InstanceId) -> Option<IndomInstance>;

    /// Returns metric labels merged with instance labels.
    ///
    /// Instance labels win on key collisions.
    fn find_labels(&self, metric: &str, instance: Option<InstanceId>) -> Labels {
        let Some(metadata) = self.find_metric_metadata(metric) else {
            return Labels::new();
        };
        let mut labels = metadata.labels;
        if let Some(instance) = instance.and_then(|id| self.find_instance(metric, id)) {
            labels.extend(instance.labels);
        }
        labels
    }
}

/// Metadata, instance domain and namespace caches around one context.
#[derive(Debug)]
pub struct PmapiSrv {
    context: Context,
    metadata_cache: RwLock<HashMap<String, MetricMetadata>>,
    /// `instance_cache[metric][instance_id]`
    instance_cache: RwLock<HashMap<String, HashMap<InstanceId, IndomInstance>>>,
    children_cache: RwLock<HashMap<String, ChildrenResponse>>,
}

impl PmapiSrv {
    /// Wraps a context with empty caches.
    #[must_use]
    pub fn new(context: Context) -> Self {
        Self {
            context,
            metadata_cache: RwLock::new(HashMap::new()),
            instance_cache: RwLock::new(HashMap::new()),
            children_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the wrapped context.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// Returns metadata for the requested metrics.
    ///
    /// Only names missing from the cache are requested. Unknown metrics are
    /// simply absent from the returned map.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails for any other reason.
    pub async fn get_metric_metadatas(
        &self,
        metrics: &[String],
    ) -> Result<HashMap<String, MetricMetadata>> {
        let required: Vec<String> = {
            let cache = self.metadata_cache.read();
            let mut seen = HashSet::new();
            metrics
                .iter()
                .filter(|m| !cache.contains_key(*m) && seen.insert(m.as_str()))
                .cloned()
                .collect()
        };

        if !required.is_empty() {
            match self.context.metrics(&required).await {
                Ok(metadatas) => {
                    let mut cache = self.metadata_cache.write();
                    for metadata in metadatas {
                        cache.insert(metadata.name.clone(), metadata);
                    }
                }
                Err(PmapiError::UnknownMetric { names }) => {
                    debug!(metrics = ?names, "metadata lookup for unknown metric");
                }
                Err(err) => return Err(err),
            }
        }

        let cache = self.metadata_cache.read();
        Ok(metrics
            .iter()
            .filter_map(|m| cache.get(m).map(|md| (m.clone(), md.clone())))
            .collect())
    }

    /// Returns metadata for a single metric, `None` if it is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub async fn get_metric_metadata(&self, metric: &str) -> Result<Option<MetricMetadata>> {
        let mut metadatas = self.get_metric_metadatas(&[metric.to_string()]).await?;
        Ok(metadatas.remove(metric))
    }

    /// Returns the instance domain of a metric, keyed by instance id.
    ///
    /// Metrics without an instance domain yield an empty map.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub async fn get_indoms(
        &self,
        metric: &str,
        ignore_cache: bool,
    ) -> Result<HashMap<InstanceId, IndomInstance>> {
        if !ignore_cache {
            if let Some(instances) = self.instance_cache.read().get(metric) {
                return Ok(instances.clone());
            }
        }

        let instances = match self.context.indom(metric).await {
            Ok(instances) => instances,
            Err(PmapiError::NoIndom { .. }) => Vec::new(),
            Err(err) => return Err(err),
        };
        let instances: HashMap<InstanceId, IndomInstance> = instances
            .into_iter()
            .map(|instance| (instance.instance, instance))
            .collect();

        self.instance_cache
            .write()
            .insert(metric.to_string(), instances.clone());
        Ok(instances)
    }

    /// Returns one instance of a metric.
    ///
    /// Unless `cache_only` is set, a cache miss refreshes the whole
    /// instance domain first.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh fails.
    pub async fn get_indom(
        &self,
        metric: &str,
        instance: InstanceId,
        cache_only: bool,
    ) -> Result<Option<IndomInstance>> {
        let cached = self.find_instance(metric, instance);
        if cached.is_some() || cache_only {
            return Ok(cached);
        }

        let mut instances = self.get_indoms(metric, true).await?;
        Ok(instances.remove(&instance))
    }

    /// Fetches current values.
    ///
    /// Requested metrics missing from the result are evicted from the
    /// metadata and instance caches, so the next access resolves them again.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch fails.
    pub async fn get_metric_values(&self, metrics: &[String]) -> Result<FetchResponse> {
        let response = self.context.fetch(metrics).await?;

        let returned: HashSet<&str> = response.values.iter().map(|m| m.name.as_str()).collect();
        let missing: Vec<&String> = metrics
            .iter()
            .filter(|m| !returned.contains(m.as_str()))
            .collect();

        if !missing.is_empty() {
            debug!(
                metrics = ?missing,
                "fetch didn't include result, clearing metric metadata and indom cache"
            );
            let mut metadata_cache = self.metadata_cache.write();
            let mut instance_cache = self.instance_cache.write();
            for metric in missing {
                metadata_cache.remove(metric);
                instance_cache.remove(metric);
            }
        }

        Ok(response)
    }

    /// Stores a value into a metric.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refuses the store.
    pub async fn store_metric_value(&self, metric: &str, value: &str) -> Result<StoreResponse> {
        self.context.store(metric, value).await
    }

    /// Defines a derived metric.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is rejected.
    pub async fn create_derived(&self, name: &str, expr: &str) -> Result<StoreResponse> {
        self.context.derive(name, expr).await
    }

    /// Returns the names below a namespace prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub async fn get_children(&self, prefix: &str) -> Result<ChildrenResponse> {
        if let Some(children) = self.children_cache.read().get(prefix) {
            return Ok(children.clone());
        }

        let children = self.context.children(prefix).await?;
        self.children_cache
            .write()
            .insert(prefix.to_string(), children.clone());
        Ok(children)
    }

    /// Returns metric labels, merged with instance labels when an instance
    /// is given. Unknown metrics yield an empty map.
    ///
    /// # Errors
    ///
    /// Returns an error if a lookup fails.
    pub async fn get_labels(
        &self,
        metric: &str,
        instance: Option<InstanceId>,
        cache_only: bool,
    ) -> Result<Labels> {
        let Some(metadata) = self.get_metric_metadata(metric).await? else {
            return Ok(Labels::new());
        };

        let mut labels = metadata.labels;
        if let Some(instance) = instance {
            if let Some(instance) = self.get_indom(metric, instance, cache_only).await? {
                labels.extend(instance.labels);
            }
        }
        Ok(labels)
    }
}

impl MetadataSource for PmapiSrv {
    fn find_metric_metadata(&self, metric: &str) -> Option<MetricMetadata> {
        self.metadata_cache.read().get(metric).cloned()
    }

    fn find_instance(&self, metric: &str, instance: InstanceId) -> Option<IndomInstance> {
        self.instance_cache
            .read()
            .get(metric)
            .and_then(|instances| instances.get(&instance))
            .cloned()
    }
}
