//! Poll-target scheduling.
//!
//! [`PollSrv`] tracks which metrics callers are interested in and when
//! they last asked for them. Each [`PollSrv::poll`] fetches all tracked
//! metrics in one request and feeds the snapshot into the [`DataStore`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::datastore::DataStore;
use crate::error::Result;
use crate::pmapi::{MetadataSource, PmapiSrv};
use crate::types::now_millis;

/// Drives fetch and ingest cycles for the current poll targets.
#[derive(Debug)]
pub struct PollSrv {
    pmapi: Arc<PmapiSrv>,
    datastore: Arc<DataStore>,
    max_age_millis: i64,
    /// Metric name to the epoch ms it was last requested at.
    targets: RwLock<BTreeMap<String, i64>>,
}

impl PollSrv {
    /// Creates a poller; targets not requested within `max_age` expire.
    #[must_use]
    pub fn new(pmapi: Arc<PmapiSrv>, datastore: Arc<DataStore>, max_age: Duration) -> Self {
        Self {
            pmapi,
            datastore,
            max_age_millis: max_age.as_millis() as i64,
            targets: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the shared metadata service.
    #[must_use]
    pub fn pmapi(&self) -> &Arc<PmapiSrv> {
        &self.pmapi
    }

    /// Returns the shared data store.
    #[must_use]
    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.datastore
    }

    /// Marks metrics as requested now.
    ///
    /// # Errors
    ///
    /// Returns an error if warming the metadata of new targets fails.
    pub async fn ensure_polling(&self, names: &[String]) -> Result<()> {
        self.ensure_polling_at(names, now_millis()).await
    }

    /// Marks metrics as requested at `now` (epoch ms).
    ///
    /// Metadata of newly added targets is loaded so the next ingest can
    /// classify their samples.
    ///
    /// # Errors
    ///
    /// Returns an error if warming the metadata of new targets fails.
    pub async fn ensure_polling_at(&self, names: &[String], now: i64) -> Result<()> {
        let added: Vec<String> = {
            let mut targets = self.targets.write();
            names
                .iter()
                .filter(|name| targets.insert((*name).clone(), now).is_none())
                .cloned()
                .collect()
        };

        if !added.is_empty() {
            debug!(metrics = ?added, "added poll targets");
            self.pmapi.get_metric_metadatas(&added).await?;
        }
        Ok(())
    }

    /// Stops polling the given metrics.
    pub fn remove_metrics_from_polling(&self, names: &[String]) {
        let mut targets = self.targets.write();
        for name in names {
            targets.remove(name);
        }
    }

    /// Returns the current poll targets in name order.
    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        self.targets.read().keys().cloned().collect()
    }

    /// Fetches all targets once and ingests the result.
    ///
    /// Metrics returned without cached metadata are resolved first. Does
    /// nothing if there are no targets.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch or the metadata lookup fails.
    pub async fn poll(&self) -> Result<()> {
        let names = self.targets();
        if names.is_empty() {
            return Ok(());
        }

        let values = self.pmapi.get_metric_values(&names).await?;

        // metrics evicted earlier may be back; classify them before ingest
        let unresolved: Vec<String> = values
            .values
            .iter()
            .filter(|metric| self.pmapi.find_metric_metadata(&metric.name).is_none())
            .map(|metric| metric.name.clone())
            .collect();
        if !unresolved.is_empty() {
            debug!(metrics = ?unresolved, "resolving metadata before ingest");
            self.pmapi.get_metric_metadatas(&unresolved).await?;
        }

        self.datastore.ingest(&values);
        Ok(())
    }

    /// Drops targets that were not requested within the max age.
    pub fn clean_expired_metrics(&self) {
        self.clean_expired_metrics_at(now_millis());
    }

    /// Like [`Self::clean_expired_metrics`], relative to `now` (epoch ms).
    pub fn clean_expired_metrics_at(&self, now: i64) {
        let cutoff = now - self.max_age_millis;
        let mut targets = self.targets.write();
        let before = targets.len();
        targets.retain(|_, last_requested| *last_requested >= cutoff);

        let expired = before - targets.len();
        if expired > 0 {
            debug!(expired, remaining = targets.len(), "expired poll targets");
        }
    }
}
