//! In-memory snapshot backend.
//!
//! Intended for embedded usage and tests. Writes can be made to fail on
//! demand to exercise the registry's degraded-persistence paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::record::Record;

use super::traits::{MonitorsSnapshot, SnapshotStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    records: RwLock<Option<Vec<Record>>>,
    monitors: RwLock<Option<MonitorsSnapshot>>,
    fail_writes: AtomicBool,
    record_saves: AtomicUsize,
}

impl InMemorySnapshotStore {
    /// Seed a store as if a previous process had flushed these snapshots.
    #[must_use]
    pub fn seeded(records: Option<Vec<Record>>, monitors: Option<MonitorsSnapshot>) -> Self {
        Self {
            records: RwLock::new(records),
            monitors: RwLock::new(monitors),
            ..Self::default()
        }
    }

    /// Make every subsequent save fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful records-snapshot writes so far.
    #[must_use]
    pub fn record_saves(&self) -> usize {
        self.record_saves.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load_records(&self) -> Result<Option<Vec<Record>>, StorageError> {
        Ok(self.records.read().map_err(|_| lock_err("records"))?.clone())
    }

    fn save_records(&self, records: &[Record]) -> Result<(), StorageError> {
        self.check_writable()?;
        *self.records.write().map_err(|_| lock_err("records"))? = Some(records.to_vec());
        self.record_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_monitors(&self) -> Result<Option<MonitorsSnapshot>, StorageError> {
        Ok(self.monitors.read().map_err(|_| lock_err("monitors"))?.clone())
    }

    fn save_monitors(&self, snapshot: &MonitorsSnapshot) -> Result<(), StorageError> {
        self.check_writable()?;
        *self.monitors.write().map_err(|_| lock_err("monitors"))? = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_failure_toggle() {
        let store = InMemorySnapshotStore::default();
        assert!(store.load_records().unwrap().is_none());

        store.save_records(&[]).unwrap();
        assert_eq!(store.load_records().unwrap(), Some(vec![]));
        assert_eq!(store.record_saves(), 1);

        store.set_fail_writes(true);
        assert!(store.save_monitors(&MonitorsSnapshot::default()).is_err());
        assert!(store.load_monitors().unwrap().is_none());

        store.set_fail_writes(false);
        store.save_monitors(&MonitorsSnapshot::default()).unwrap();
        assert!(store.load_monitors().unwrap().is_some());
    }
}
