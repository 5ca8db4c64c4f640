//! Live metric polling against a Performance Co-Pilot backend.
#![forbid(unsafe_code)]
//!
//! `pcp-live` talks the PMAPI HTTP protocol of pmproxy (and the older
//! pmwebd), caches metric metadata and instance domains, and keeps a short
//! rolling window of per-instance time series for the metrics a caller is
//! currently interested in.
//!
//! # Components
//!
//! - [`Context`]: one backend session, recreated transparently on expiry
//! - [`PmapiSrv`]: metadata, instance domain and namespace caches
//! - [`DataStore`]: per-instance series with counter rate conversion
//! - [`PollSrv`]: the set of polled metrics and their interest expiry
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pcp_live::{Context, DataStore, HttpTransport, LiveConfig, PmapiSrv, PollSrv, TimeRange};
//!
//! # async fn run() -> pcp_live::Result<()> {
//! let config = LiveConfig::new("http://localhost:44322");
//! let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
//! let pmapi = Arc::new(PmapiSrv::new(Context::new(transport, config.context_config())));
//! let datastore = Arc::new(DataStore::new(pmapi.clone(), config.data_max_age()));
//! let poll = PollSrv::new(pmapi, datastore.clone(), config.poll_max_age());
//!
//! let names = vec!["kernel.all.load".to_string()];
//! poll.ensure_polling(&names).await?;
//! poll.poll().await?;
//! let series = datastore.query_time_series(&names, TimeRange::last_millis(60_000));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod context;
pub mod datastore;
pub mod error;
pub mod pmapi;
pub mod poll;
pub mod script;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use config::{ContextConfig, LiveConfig};
pub use context::{Context, Session};
pub use datastore::{DataStore, Datapoint, InstanceSeries, MetricQueryResult, TimeSeriesResult};
pub use error::{ErrorBody, PmapiError, Result};
pub use pmapi::{MetadataSource, PmapiSrv};
pub use poll::PollSrv;
pub use script::{RegisteredScript, Script, ScriptStatus, TargetFormat};
pub use transport::{HttpTransport, Request, Transport};
pub use types::{
    ChildrenResponse, FetchResponse, Identifier, IndomInstance, InstanceId, InstanceValue, Labels,
    MetricMetadata, MetricValues, SampleValue, Semantics, StoreResponse, TimeRange, now_millis,
};
