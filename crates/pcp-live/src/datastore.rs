//! In-memory time series built from fetch snapshots.
//!
//! Every (metric, instance) pair gets its own series. How a sample is
//! stored depends on the metric:
//!
//! - counters are converted to per-second rates; the first observation
//!   only sets the baseline
//! - metrics labelled `metrictype` = `output` or `control` keep only their
//!   latest sample
//! - everything else is appended, skipping timestamps already present
//!
//! History is bounded by a max-age window, see
//! [`DataStore::clean_expired_metrics`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use tracing::{debug, warn};

use crate::pmapi::MetadataSource;
use crate::types::{
    FetchResponse, InstanceId, Labels, MetricMetadata, SampleValue, Semantics, TimeRange,
    now_millis,
};

/// Label values of metrics that only retain their latest sample.
const LATEST_ONLY_METRIC_TYPES: [&str; 2] = ["output", "control"];

/// One stored sample.
///
/// Serializes as `[value, timestamp]`, or `[rate, timestamp, raw]` for
/// counters.
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    /// Sample value, or the rate for counters.
    pub value: SampleValue,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Raw cumulative counter value.
    pub raw: Option<f64>,
}

impl Datapoint {
    /// Creates a plain sample.
    #[must_use]
    pub fn new(value: impl Into<SampleValue>, timestamp: i64) -> Self {
        Self {
            value: value.into(),
            timestamp,
            raw: None,
        }
    }

    /// Creates a counter sample.
    #[must_use]
    pub const fn rate(rate: f64, timestamp: i64, raw: f64) -> Self {
        Self {
            value: SampleValue::Number(rate),
            timestamp,
            raw: Some(raw),
        }
    }
}

impl Serialize for Datapoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.raw.is_some() { 3 } else { 2 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.value)?;
        seq.serialize_element(&self.timestamp)?;
        if let Some(raw) = &self.raw {
            seq.serialize_element(raw)?;
        }
        seq.end()
    }
}

/// One series in a [`DataStore::query_time_series`] result.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TimeSeriesResult {
    /// Instance name if known, else the metric name.
    pub target: String,
    /// Samples within the queried range, oldest first.
    pub datapoints: Vec<Datapoint>,
}

/// One instance in a [`DataStore::query_metrics`] result.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct InstanceSeries {
    /// Instance id, `None` for singular metrics.
    pub id: Option<InstanceId>,
    /// Instance name, empty if unknown or singular.
    pub name: String,
    /// Samples within the queried range, oldest first.
    pub values: Vec<Datapoint>,
    /// Metric labels merged with instance labels.
    pub labels: Labels,
}

/// One metric in a [`DataStore::query_metrics`] result.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MetricQueryResult {
    /// Metric name.
    pub name: String,
    /// Instances with samples in the queried range.
    pub instances: Vec<InstanceSeries>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeriesKind {
    Counter,
    LatestOnly,
    Instant,
}

impl SeriesKind {
    fn of(metadata: Option<&MetricMetadata>) -> Self {
        let Some(metadata) = metadata else {
            return Self::Instant;
        };
        if metadata.sem == Semantics::Counter {
            Self::Counter
        } else if metadata
            .metric_type_label()
            .is_some_and(|t| LATEST_ONLY_METRIC_TYPES.contains(&t))
        {
            Self::LatestOnly
        } else {
            Self::Instant
        }
    }
}

#[derive(Debug, Default)]
struct Series {
    instance_name: Option<String>,
    samples: Vec<Datapoint>,
    /// Previous raw counter value and its timestamp.
    baseline: Option<(f64, i64)>,
}

impl Series {
    fn push_instant(&mut self, value: &SampleValue, timestamp: i64) {
        // keep timestamp order and skip duplicate ticks
        if let Err(pos) = self
            .samples
            .binary_search_by_key(&timestamp, |p| p.timestamp)
        {
            self.samples
                .insert(pos, Datapoint::new(value.clone(), timestamp));
        }
    }

    fn replace_latest(&mut self, value: &SampleValue, timestamp: i64) {
        self.samples.clear();
        self.samples.push(Datapoint::new(value.clone(), timestamp));
    }

    fn push_counter(&mut self, metric: &str, value: &SampleValue, timestamp: i64) {
        let Some(raw) = value.as_f64() else {
            warn!(metric = %metric, "ignoring non-numeric counter sample");
            return;
        };

        match self.baseline {
            Some((previous, previous_ts)) if previous_ts < timestamp => {
                let seconds = (timestamp - previous_ts) as f64 / 1000.0;
                self.samples
                    .push(Datapoint::rate((raw - previous) / seconds, timestamp, raw));
                self.baseline = Some((raw, timestamp));
            }
            Some((_, previous_ts)) => {
                warn!(
                    metric = %metric,
                    previous_ts,
                    timestamp,
                    "counter sample not newer than baseline, skipping"
                );
            }
            None => self.baseline = Some((raw, timestamp)),
        }
    }

    fn in_range(&self, range: TimeRange) -> Vec<Datapoint> {
        self.samples
            .iter()
            .filter(|p| range.contains(p.timestamp))
            .cloned()
            .collect()
    }

    /// Drops samples older than `cutoff`, always keeping the newest one.
    fn expire(&mut self, cutoff: i64) -> usize {
        if self.samples.len() <= 1 {
            return 0;
        }
        let expired = self
            .samples
            .partition_point(|p| p.timestamp < cutoff)
            .min(self.samples.len() - 1);
        self.samples.drain(..expired);
        expired
    }

    fn is_stale(&self, cutoff: i64) -> bool {
        self.samples.is_empty() && self.baseline.is_none_or(|(_, ts)| ts < cutoff)
    }
}

type InstanceSeriesMap = BTreeMap<Option<InstanceId>, Series>;

/// Thread-safe store of per-instance time series.
pub struct DataStore {
    source: Arc<dyn MetadataSource>,
    max_age_millis: i64,
    data: RwLock<HashMap<String, InstanceSeriesMap>>,
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("max_age_millis", &self.max_age_millis)
            .field("metrics", &self.data.read().len())
            .finish_non_exhaustive()
    }
}

impl DataStore {
    /// Creates a store that retains roughly `max_age` of history.
    #[must_use]
    pub fn new(source: Arc<dyn MetadataSource>, max_age: Duration) -> Self {
        Self {
            source,
            max_age_millis: max_age.as_millis() as i64,
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the retention window in milliseconds.
    #[must_use]
    pub const fn max_age_millis(&self) -> i64 {
        self.max_age_millis
    }

    /// Ingests one fetch snapshot.
    ///
    /// Metadata is looked up in the metadata source's cache; metrics without
    /// cached metadata are treated as plain instant metrics.
    pub fn ingest(&self, fetch: &FetchResponse) {
        let timestamp = fetch.timestamp;
        let mut data = self.data.write();

        for metric in &fetch.values {
            let kind = SeriesKind::of(self.source.find_metric_metadata(&metric.name).as_ref());
            let series_map = data.entry(metric.name.clone()).or_default();

            for value in &metric.instances {
                let series = series_map.entry(value.instance).or_default();
                if series.instance_name.is_none() {
                    series.instance_name = value.instance_name.clone().or_else(|| {
                        value
                            .instance
                            .and_then(|id| self.source.find_instance(&metric.name, id))
                            .map(|instance| instance.name)
                    });
                }

                match kind {
                    SeriesKind::Counter => series.push_counter(&metric.name, &value.value, timestamp),
                    SeriesKind::LatestOnly => series.replace_latest(&value.value, timestamp),
                    SeriesKind::Instant => series.push_instant(&value.value, timestamp),
                }
            }
        }

        debug!(
            timestamp,
            metrics = fetch.values.len(),
            "ingested fetch result"
        );
    }

    fn instance_name(&self, metric: &str, instance: Option<InstanceId>, series: &Series) -> Option<String> {
        series.instance_name.clone().or_else(|| {
            instance
                .and_then(|id| self.source.find_instance(metric, id))
                .map(|instance| instance.name)
        })
    }

    /// Returns one record per (metric, instance) with samples in `range`.
    ///
    /// Results follow the order of `names`, then instance id.
    #[must_use]
    pub fn query_time_series(&self, names: &[String], range: TimeRange) -> Vec<TimeSeriesResult> {
        let data = self.data.read();
        let mut results = Vec::new();

        for name in names {
            let Some(series_map) = data.get(name) else {
                continue;
            };
            for (instance, series) in series_map {
                let datapoints = series.in_range(range);
                if datapoints.is_empty() {
                    continue;
                }
                results.push(TimeSeriesResult {
                    target: self
                        .instance_name(name, *instance, series)
                        .unwrap_or_else(|| name.clone()),
                    datapoints,
                });
            }
        }

        results
    }

    /// Returns per-instance records for each metric with samples in `range`.
    #[must_use]
    pub fn query_metrics(&self, names: &[String], range: TimeRange) -> Vec<MetricQueryResult> {
        let data = self.data.read();

        names
            .iter()
            .filter_map(|name| {
                let series_map = data.get(name)?;
                let instances: Vec<InstanceSeries> = series_map
                    .iter()
                    .filter_map(|(instance, series)| {
                        let values = series.in_range(range);
                        (!values.is_empty()).then(|| InstanceSeries {
                            id: *instance,
                            name: self
                                .instance_name(name, *instance, series)
                                .unwrap_or_default(),
                            values,
                            labels: self.source.find_labels(name, *instance),
                        })
                    })
                    .collect();
                (!instances.is_empty()).then(|| MetricQueryResult {
                    name: name.clone(),
                    instances,
                })
            })
            .collect()
    }

    /// Returns the per-instance records of a single metric.
    #[must_use]
    pub fn query_metric(&self, name: &str, range: TimeRange) -> Vec<InstanceSeries> {
        self.query_metrics(&[name.to_string()], range)
            .pop()
            .map(|metric| metric.instances)
            .unwrap_or_default()
    }

    /// Drops samples older than the retention window.
    ///
    /// The newest sample of every series is always kept.
    pub fn clean_expired_metrics(&self) {
        self.clean_expired_metrics_at(now_millis());
    }

    /// Like [`Self::clean_expired_metrics`], relative to `now` (epoch ms).
    pub fn clean_expired_metrics_at(&self, now: i64) {
        let cutoff = now - self.max_age_millis;
        let mut data = self.data.write();
        let mut expired = 0;

        for series_map in data.values_mut() {
            for series in series_map.values_mut() {
                expired += series.expire(cutoff);
            }
            series_map.retain(|_, series| !series.is_stale(cutoff));
        }
        data.retain(|_, series_map| !series_map.is_empty());

        debug!(expired, metrics = data.len(), "cleaned expired samples");
    }

    /// Returns the number of samples stored for a metric across instances.
    #[must_use]
    pub fn sample_count(&self, name: &str) -> usize {
        self.data
            .read()
            .get(name)
            .map_or(0, |series_map| series_map.values().map(|s| s.samples.len()).sum())
    }

    /// Returns the names of all metrics with at least one series.
    #[must_use]
    pub fn metrics_list(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }
}
