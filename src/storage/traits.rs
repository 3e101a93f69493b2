//! Snapshot storage contract.
//!
//! The registry persists two independent artifacts: the union of every
//! monitor's records, and the monitor configuration table. Both are
//! overwritten wholesale; backends only have to make each write all-or-nothing.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitor::{MonitorConfig, MonitorId};
use crate::record::Record;

/// Errors that can occur during snapshot operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure on a snapshot path.
    #[error("I/O error on {}: {message}", path.display())]
    Io {
        path: PathBuf,
        message: String,
    },

    /// Snapshot content could not be encoded or decoded.
    #[error("Serialization error on {}: {message}", path.display())]
    Serialization {
        path: PathBuf,
        message: String,
    },

    /// Backend-specific failure.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// On-disk shape of the monitor configuration snapshot.
///
/// ```json
/// { "monitors": { "<id>": { "name": "...", "sources": [...], "domains": [...], "created": "..." } },
///   "active":   { "<id>": true } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorsSnapshot {
    #[serde(default)]
    pub monitors: BTreeMap<MonitorId, MonitorConfig>,

    #[serde(default)]
    pub active: BTreeMap<MonitorId, bool>,
}

/// Storage trait for the two registry snapshots.
///
/// # Safety Considerations
/// - Each save must never leave a half-written snapshot behind
/// - Concurrent saves must be serialized by the implementation
pub trait SnapshotStore: Send + Sync {
    /// Load the records snapshot. `Ok(None)` when it has never been written.
    fn load_records(&self) -> Result<Option<Vec<Record>>, StorageError>;

    /// Overwrite the records snapshot.
    fn save_records(&self, records: &[Record]) -> Result<(), StorageError>;

    /// Load the monitor configuration snapshot. `Ok(None)` when absent.
    fn load_monitors(&self) -> Result<Option<MonitorsSnapshot>, StorageError>;

    /// Overwrite the monitor configuration snapshot.
    fn save_monitors(&self, snapshot: &MonitorsSnapshot) -> Result<(), StorageError>;
}
