use std::collections::{BTreeMap, BTreeSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::market_data::base_data::DataBatch;
use crate::securities::symbols::SymbolId;

/// Which active root groups a data batch covered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationReport {
    pub time: DateTime<Utc>,
    /// `true` iff the batch held at least one derivative of the root.
    pub represented: BTreeMap<SymbolId, bool>,
}

impl CorrelationReport {
    /// Roots whose group had no data in the batch.
    pub fn missing(&self) -> Vec<&SymbolId> {
        self.represented.iter().filter(|(_, hit)| !**hit).map(|(root, _)| root).collect()
    }

    pub fn all_represented(&self) -> bool {
        self.represented.values().all(|hit| *hit)
    }
}

/// Maps a data batch onto the subscribed root groups.
///
/// Pure: reads the batch and the root list it is handed, never the registry
/// itself, and keeps no state between calls.
#[derive(Clone, Copy, Debug, Default)]
pub struct DataCorrelator;

impl DataCorrelator {
    pub fn correlate(&self, batch: &DataBatch, active_roots: &BTreeSet<SymbolId>) -> CorrelationReport {
        let represented = active_roots
            .iter()
            .map(|root| (root.clone(), batch.has_derivative_of(root)))
            .collect();
        CorrelationReport { time: batch.time, represented }
    }
}
