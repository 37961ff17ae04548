use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use kubenap_common::ServiceIdentity;
use log::debug;

/// Last observed request time per service.
///
/// The ledger is volatile: it is rebuilt from observed traffic after a
/// restart, and a missing entry means "unknown", never "idle".
#[derive(Debug, Default)]
pub struct ActivityLedger {
    records: RwLock<HashMap<ServiceIdentity, DateTime<Utc>>>,
}

impl ActivityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the stored timestamp. Writes are not required to be
    /// monotonic; the latest write wins.
    pub fn update(&self, id: &ServiceIdentity, timestamp: DateTime<Utc>) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.insert(id.clone(), timestamp);
        debug!(target: "activity", "Updated last activity for {} to {}", id, timestamp);
    }

    /// Records `timestamp` only if it is newer than what is stored, so a
    /// lagging source cannot roll back a fresher observation. Returns whether
    /// the ledger changed.
    pub fn observe(&self, id: &ServiceIdentity, timestamp: DateTime<Utc>) -> bool {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.get(id) {
            Some(seen) if *seen >= timestamp => false,
            _ => {
                records.insert(id.clone(), timestamp);
                debug!(target: "activity", "Observed activity for {} at {}", id, timestamp);
                true
            }
        }
    }

    pub fn touch(&self, id: &ServiceIdentity) {
        self.update(id, Utc::now());
    }

    pub fn get(&self, id: &ServiceIdentity) -> Option<DateTime<Utc>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
    }

    pub fn snapshot(&self) -> BTreeMap<ServiceIdentity, DateTime<Utc>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
