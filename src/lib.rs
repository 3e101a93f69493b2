//! # credmon - credential capture monitoring engine
//!
//! credmon watches two external sources for captured credentials and keeps
//! them in named monitors:
//!
//! - **Log source**: a line-oriented proxy log whose lines embed JSON session
//!   objects
//! - **Site source**: per-site directories each holding a JSON drop file
//!
//! Each active monitor runs a background watch loop that extracts both
//! sources, filters by the monitor's sources and domains, deduplicates by
//! record identifier and appends what is new. Records and monitor
//! configuration are persisted as JSON snapshots and recovered on restart.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use credmon::{EngineConfig, NewMonitor, Registry, SourceKind};
//!
//! let registry = Registry::open(EngineConfig::from_env()?)?;
//! let id = registry.create_monitor(
//!     NewMonitor::new()
//!         .name("o365 only")
//!         .sources([SourceKind::LogSource])
//!         .domains(["o365"]),
//! )?;
//! let records = registry.list_credentials(Some(&id))?;
//! registry.stop_monitor(&id)?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod extract;
pub mod identity;
pub mod monitor;
pub mod record;
pub mod storage;

pub use config::EngineConfig;
pub use error::{ConfigError, MonitorError, MonitorResult};
pub use extract::{extract_log_source, extract_site_source, ExtractionPreview, SourcePaths};
pub use identity::{derive_identifier, DedupKey, DedupSet};
pub use monitor::{
    MonitorConfig, MonitorId, MonitorState, MonitorStatus, NewMonitor, Reactivation, Registry,
    RegistrySummary, WatchState,
};
pub use record::{Record, SourceKind};
pub use storage::{InMemorySnapshotStore, JsonSnapshotStore, MonitorsSnapshot, SnapshotStore, StorageError};
