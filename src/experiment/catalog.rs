//! Run catalog
//!
//! The validation core only ever reads the catalog (`count` before and after a
//! plan, `latest` to check the scan id and data keys). [`InMemoryCatalog`] is the
//! store the simulated engine writes to.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Metadata of one persisted run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run identifier
    pub uid: String,
    /// Monotonic scan number, starting at 1
    pub scan_id: u64,
    /// Plan that produced the run
    pub plan_name: String,
    /// Recorded data-variable names
    pub data_keys: BTreeSet<String>,
    /// Number of events in the primary stream
    pub num_events: usize,
    /// `success`, `fail` or `abort`
    pub exit_status: String,
    /// Run start time
    pub started_at: DateTime<Utc>,
}

/// Read-only catalog contract
pub trait Catalog: Send + Sync {
    /// Number of stored runs
    fn count(&self) -> usize;

    /// Most recently stored run
    fn latest(&self) -> Option<RunRecord>;
}

/// Catalog held in memory for the lifetime of a validation run
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    records: RwLock<Vec<RunRecord>>,
}

impl InMemoryCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan id the next run will receive
    pub fn next_scan_id(&self) -> u64 {
        self.records
            .read()
            .last()
            .map(|r| r.scan_id + 1)
            .unwrap_or(1)
    }

    /// Append a run
    pub fn insert(&self, record: RunRecord) {
        self.records.write().push(record);
    }

    /// Copy of every stored run, oldest first
    pub fn records(&self) -> Vec<RunRecord> {
        self.records.read().clone()
    }
}

impl Catalog for InMemoryCatalog {
    fn count(&self) -> usize {
        self.records.read().len()
    }

    fn latest(&self) -> Option<RunRecord> {
        self.records.read().last().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(scan_id: u64) -> RunRecord {
        RunRecord {
            uid: format!("run-{scan_id}"),
            scan_id,
            plan_name: "count".into(),
            data_keys: ["scaler1".to_string()].into_iter().collect(),
            num_events: 1,
            exit_status: "success".into(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn scan_ids_start_at_one_and_increase() {
        let catalog = InMemoryCatalog::new();
        assert_eq!(catalog.count(), 0);
        assert!(catalog.latest().is_none());
        assert_eq!(catalog.next_scan_id(), 1);

        catalog.insert(record(catalog.next_scan_id()));
        catalog.insert(record(catalog.next_scan_id()));

        assert_eq!(catalog.count(), 2);
        assert_eq!(catalog.latest().unwrap().scan_id, 2);
        assert_eq!(catalog.records()[0].uid, "run-1");
    }
}
