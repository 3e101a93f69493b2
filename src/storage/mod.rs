//! Snapshot persistence for credmon.
//!
//! The `SnapshotStore` trait is the seam: the registry only ever talks to it.
//! `JsonSnapshotStore` is the durable backend; `InMemorySnapshotStore` serves
//! tests and embedded use.

mod file_lock;
mod json;
mod memory;
mod traits;

pub(crate) use file_lock::describe_holder;
pub use file_lock::{LockError, LockHolder, StateLock, LOCK_FILE_NAME};
pub use json::JsonSnapshotStore;
pub use memory::InMemorySnapshotStore;
pub use traits::{MonitorsSnapshot, SnapshotStore, StorageError};
