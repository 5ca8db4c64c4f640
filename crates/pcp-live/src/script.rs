//! State of bpftrace scripts registered with the PMDA.
//!
//! A registered script exposes three control metrics
//! (`bpftrace.scripts.<name>.{status,exit_code,output}`) and one data
//! metric per script variable (`bpftrace.scripts.<name>.data.<var>`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::datastore::DataStore;
use crate::error::{PmapiError, Result};
use crate::pmapi::PmapiSrv;
use crate::types::{SampleValue, TimeRange, now_millis};

/// Lifecycle state of a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStatus {
    /// Not running.
    Stopped,
    /// Being started.
    Starting,
    /// Running.
    Started,
    /// Being stopped.
    Stopping,
}

impl ScriptStatus {
    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptStatus {
    type Err = PmapiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "started" => Ok(Self::Started),
            "stopping" => Ok(Self::Stopping),
            other => Err(PmapiError::malformed(format!("unknown script status '{other}'"))),
        }
    }
}

/// Panel format a script is queried for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetFormat {
    /// One series per variable.
    TimeSeries,
    /// Histogram buckets.
    Heatmap,
    /// Text output of `printf()` scripts.
    Table,
}

/// Registration response of the bpftrace PMDA.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisteredScript {
    /// Script name assigned by the PMDA.
    pub name: String,
    /// Variables exported as metrics.
    #[serde(default)]
    pub vars: Vec<String>,
    /// Current state.
    pub status: ScriptStatus,
    /// Exit code once stopped.
    #[serde(default)]
    pub exit_code: Option<i64>,
    /// Output of the bpftrace process.
    #[serde(default)]
    pub output: String,
}

/// A registered bpftrace script.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    /// Script name assigned by the PMDA.
    pub name: String,
    /// Variables exported as metrics.
    pub vars: Vec<String>,
    /// Current state.
    pub status: ScriptStatus,
    /// Exit code once stopped.
    pub exit_code: Option<i64>,
    /// Output of the bpftrace process, not of the script.
    pub output: String,
    /// Source code of the script.
    pub code: String,
    /// Epoch ms the script was last requested by a caller.
    pub last_requested: i64,
}

type FieldSetter = fn(&mut Script, &SampleValue);

/// Control metric suffix to the field it updates.
const SYNCED_FIELDS: [(&str, FieldSetter); 3] = [
    ("status", set_status),
    ("exit_code", set_exit_code),
    ("output", set_output),
];

fn set_status(script: &mut Script, value: &SampleValue) {
    match value.as_str().map(str::parse::<ScriptStatus>) {
        Some(Ok(status)) => script.status = status,
        _ => warn!(script = %script.name, value = %value, "ignoring invalid script status"),
    }
}

fn set_exit_code(script: &mut Script, value: &SampleValue) {
    match value.as_f64() {
        Some(code) => script.exit_code = Some(code as i64),
        None => warn!(script = %script.name, value = %value, "ignoring invalid exit code"),
    }
}

fn set_output(script: &mut Script, value: &SampleValue) {
    script.output = value.to_string();
}

impl Script {
    /// Creates a script from its registration response.
    #[must_use]
    pub fn new(registered: RegisteredScript, code: impl Into<String>) -> Self {
        Self::new_at(registered, code, now_millis())
    }

    /// Like [`Self::new`], requested at `now` (epoch ms).
    #[must_use]
    pub fn new_at(registered: RegisteredScript, code: impl Into<String>, now: i64) -> Self {
        Self {
            name: registered.name,
            vars: registered.vars,
            status: registered.status,
            exit_code: registered.exit_code,
            output: registered.output,
            code: code.into(),
            last_requested: now,
        }
    }

    /// Returns true if the script stopped with a non-zero exit code.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.status == ScriptStatus::Stopped && self.exit_code != Some(0)
    }

    /// Returns the metrics reporting the script's own state.
    #[must_use]
    pub fn control_metrics(&self) -> Vec<String> {
        SYNCED_FIELDS
            .iter()
            .map(|(field, _)| format!("bpftrace.scripts.{}.{field}", self.name))
            .collect()
    }

    fn data_metric(&self, var: &str) -> String {
        format!("bpftrace.scripts.{}.data.{var}", self.name)
    }

    async fn find_metric_for_type(&self, pmapi: &PmapiSrv, metric_type: &str) -> Result<Option<String>> {
        for var in &self.vars {
            let metric = self.data_metric(var);
            let labels = pmapi.get_labels(&metric, None, false).await?;
            if labels.get("metrictype").and_then(serde_json::Value::as_str) == Some(metric_type) {
                return Ok(Some(metric));
            }
        }
        Ok(None)
    }

    /// Returns the data metrics to query for a panel format.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedFormat` if no variable fits the format, or the
    /// error of a failed label lookup.
    pub async fn data_metrics(&self, pmapi: &PmapiSrv, format: TargetFormat) -> Result<Vec<String>> {
        let (metric_type, reason) = match format {
            TargetFormat::TimeSeries => {
                return Ok(self.vars.iter().map(|var| self.data_metric(var)).collect());
            }
            TargetFormat::Heatmap => (
                "histogram",
                "cannot find any histogram in this bpftrace script",
            ),
            TargetFormat::Table => (
                "output",
                "table format is only supported with printf() bpftrace scripts",
            ),
        };

        match self.find_metric_for_type(pmapi, metric_type).await? {
            Some(metric) => Ok(vec![metric]),
            None => Err(PmapiError::UnsupportedFormat {
                reason: reason.to_string(),
            }),
        }
    }

    /// Updates status, exit code and output from the latest control metric
    /// samples in the store.
    pub fn sync_state(&mut self, datastore: &DataStore) {
        let metrics = datastore.query_metrics(&self.control_metrics(), TimeRange::all());
        for metric in metrics {
            let Some(value) = metric
                .instances
                .first()
                .and_then(|instance| instance.values.last())
                .map(|point| point.value.clone())
            else {
                continue;
            };

            let field = metric.name.rsplit('.').next().unwrap_or_default();
            if let Some((_, setter)) = SYNCED_FIELDS.iter().find(|(name, _)| *name == field) {
                setter(self, &value);
            }
        }
    }
}
