//! Core types shared by the context, cache, store and poller layers.
//!
//! All response types here are already normalized: timestamps are epoch
//! milliseconds and "no instance" is `None`, whatever dialect the backend
//! speaks. See [`crate::context`] for the normalization boundary.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PmapiError, Result};

/// Label set attached to a metric or an instance.
pub type Labels = HashMap<String, serde_json::Value>;

/// Numeric instance identifier within an instance domain.
pub type InstanceId = i64;

/// Returns the current time as epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A PMID or instance domain identifier.
///
/// pmproxy reports these as dotted strings (`"60.0.4"`), pmwebd as numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    /// Numeric form.
    Number(u64),
    /// Dotted string form.
    Text(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Value semantics of a metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Semantics {
    /// Gauge-like value.
    #[default]
    Instant,
    /// Monotonic counter, converted to a rate on ingest.
    Counter,
    /// Value that changes rarely.
    Discrete,
    /// Anything the backend reports that we do not recognise.
    #[serde(other)]
    Unknown,
}

/// Metadata describing one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricMetadata {
    /// Metric name.
    pub name: String,
    /// Metric identifier.
    pub pmid: Identifier,
    /// Instance domain, absent for singular metrics.
    #[serde(default)]
    pub indom: Option<Identifier>,
    /// Value type (`u32`, `double`, `string`, ...).
    #[serde(rename = "type", default)]
    pub metric_type: String,
    /// Value semantics.
    #[serde(default)]
    pub sem: Semantics,
    /// Unit descriptor.
    #[serde(default)]
    pub units: String,
    /// Metric labels. Always empty on the legacy backend.
    #[serde(default)]
    pub labels: Labels,
    /// One-line help text.
    #[serde(rename = "text-oneline", default)]
    pub text_oneline: String,
    /// Long help text.
    #[serde(rename = "text-help", default)]
    pub text_help: String,
}

impl MetricMetadata {
    /// Returns the `metrictype` label, if present and a string.
    #[must_use]
    pub fn metric_type_label(&self) -> Option<&str> {
        self.labels
            .get("metrictype")
            .and_then(serde_json::Value::as_str)
    }
}

/// One member of an instance domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndomInstance {
    /// Instance identifier.
    pub instance: InstanceId,
    /// Human-readable instance name.
    pub name: String,
    /// Instance labels. Always empty on the legacy backend.
    #[serde(default)]
    pub labels: Labels,
}

/// A sampled value: numeric, or text for string metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    /// Numeric value.
    Number(f64),
    /// String value.
    Text(String),
}

impl SampleValue {
    /// Returns the numeric value, if this is a number.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    /// Returns the text value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::Text(s) => Some(s),
        }
    }
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for SampleValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for SampleValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// The value of one instance in a fetch result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceValue {
    /// Instance identifier, `None` for singular metrics.
    pub instance: Option<InstanceId>,
    /// Sampled value.
    pub value: SampleValue,
    /// Instance name, when the backend includes it.
    #[serde(rename = "instanceName", default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

impl InstanceValue {
    /// Creates an instance value without a name.
    #[must_use]
    pub fn new(instance: Option<InstanceId>, value: impl Into<SampleValue>) -> Self {
        Self {
            instance,
            value: value.into(),
            instance_name: None,
        }
    }

    /// Attaches an instance name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }
}

/// All instance values of one metric in a fetch result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    /// Metric identifier.
    #[serde(default)]
    pub pmid: Option<Identifier>,
    /// Metric name.
    pub name: String,
    /// Values per instance.
    #[serde(default)]
    pub instances: Vec<InstanceValue>,
}

impl MetricValues {
    /// Creates an entry with the given instances.
    #[must_use]
    pub fn new(name: impl Into<String>, instances: Vec<InstanceValue>) -> Self {
        Self {
            pmid: None,
            name: name.into(),
            instances,
        }
    }
}

/// A normalized fetch snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Sample time in epoch milliseconds.
    pub timestamp: i64,
    /// Values per metric.
    pub values: Vec<MetricValues>,
}

/// Names directly below a namespace prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildrenResponse {
    /// Leaf (metric) names.
    #[serde(default)]
    pub leaf: Vec<String>,
    /// Non-leaf (namespace) names.
    #[serde(default)]
    pub nonleaf: Vec<String>,
}

/// Outcome of a store or derive request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreResponse {
    /// Whether the backend accepted the request.
    #[serde(default)]
    pub success: bool,
}

/// A time range for queries.
///
/// Both start and end are inclusive epoch timestamps in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds.
    pub start: i64,
    /// End timestamp (inclusive), in milliseconds.
    pub end: i64,
}

impl TimeRange {
    /// Creates a new time range.
    ///
    /// # Errors
    ///
    /// Returns `PmapiError::Config` if start > end.
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(PmapiError::Config {
                reason: format!("invalid time range: start={start}, end={end}"),
            });
        }
        Ok(Self { start, end })
    }

    /// A range covering every representable timestamp.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    /// Creates a time range for the last N milliseconds from now.
    #[must_use]
    pub fn last_millis(millis: i64) -> Self {
        let now = now_millis();
        Self {
            start: now - millis,
            end: now,
        }
    }

    /// Creates an open-ended range starting at `start`.
    #[must_use]
    pub const fn since(start: i64) -> Self {
        Self {
            start,
            end: i64::MAX,
        }
    }

    /// Checks if a timestamp falls within this range (inclusive).
    #[must_use]
    pub const fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod metadata_tests {
        use super::*;

        #[test]
        fn parses_pmproxy_metadata() {
            let metadata: MetricMetadata = serde_json::from_value(json!({
                "name": "disk.dev.read",
                "series": "605fc77742cd0317597291329561ac4e50c0dd12",
                "pmid": "60.0.4",
                "indom": "60.1",
                "type": "u32",
                "sem": "counter",
                "units": "count",
                "labels": {"agent": "linux", "hostname": "web01"},
                "text-oneline": "per-disk read operations",
                "text-help": "Cumulative number of disk read operations."
            }))
            .unwrap();

            assert_eq!(metadata.pmid, Identifier::Text("60.0.4".to_string()));
            assert_eq!(metadata.indom, Some(Identifier::Text("60.1".to_string())));
            assert_eq!(metadata.sem, Semantics::Counter);
            assert_eq!(metadata.metric_type, "u32");
            assert_eq!(metadata.labels["agent"], json!("linux"));
            assert_eq!(metadata.text_oneline, "per-disk read operations");
        }

        #[test]
        fn parses_legacy_metadata_without_labels() {
            let metadata: MetricMetadata = serde_json::from_value(json!({
                "name": "kernel.all.load",
                "pmid": 251_658_264,
                "indom": 251_658_241,
                "sem": "instant",
                "type": "FLOAT",
                "units": ""
            }))
            .unwrap();

            assert_eq!(metadata.pmid, Identifier::Number(251_658_264));
            assert!(metadata.labels.is_empty());
        }

        #[test]
        fn unknown_semantics_do_not_fail() {
            let metadata: MetricMetadata = serde_json::from_value(json!({
                "name": "x", "pmid": 1, "sem": "bogus"
            }))
            .unwrap();
            assert_eq!(metadata.sem, Semantics::Unknown);
        }

        #[test]
        fn metric_type_label_reads_string_labels_only() {
            let mut metadata: MetricMetadata =
                serde_json::from_value(json!({"name": "x", "pmid": 1})).unwrap();
            assert_eq!(metadata.metric_type_label(), None);

            metadata.labels.insert("metrictype".into(), json!("output"));
            assert_eq!(metadata.metric_type_label(), Some("output"));

            metadata.labels.insert("metrictype".into(), json!(3));
            assert_eq!(metadata.metric_type_label(), None);
        }
    }

    mod value_tests {
        use super::*;

        #[test]
        fn sample_values_accept_numbers_and_text() {
            let value: InstanceValue = serde_json::from_value(json!({
                "instance": null, "value": 100
            }))
            .unwrap();
            assert_eq!(value.instance, None);
            assert_eq!(value.value.as_f64(), Some(100.0));

            let value: InstanceValue = serde_json::from_value(json!({
                "instance": 1, "value": "line1\n", "instanceName": "/dev/sda1"
            }))
            .unwrap();
            assert_eq!(value.value.as_str(), Some("line1\n"));
            assert_eq!(value.instance_name.as_deref(), Some("/dev/sda1"));
        }
    }

    mod time_range_tests {
        use super::*;

        #[test]
        fn rejects_inverted_range() {
            assert!(TimeRange::new(10, 5).is_err());
        }

        #[test]
        fn contains_is_inclusive() {
            let range = TimeRange::new(6002, 6003).unwrap();
            assert!(range.contains(6002));
            assert!(range.contains(6003));
            assert!(!range.contains(6001));
            assert!(!range.contains(6004));
        }

        #[test]
        fn all_contains_everything() {
            let range = TimeRange::all();
            assert!(range.contains(i64::MIN));
            assert!(range.contains(0));
            assert!(range.contains(i64::MAX));
        }

        #[test]
        fn since_is_open_ended() {
            let range = TimeRange::since(1000);
            assert!(!range.contains(999));
            assert!(range.contains(i64::MAX));
        }

        #[test]
        fn last_millis_ends_now() {
            let range = TimeRange::last_millis(60_000);
            assert_eq!(range.end - range.start, 60_000);
        }
    }
}
