//! Monitor registry and watch loops.
//!
//! A monitor is a named, filtered view over the two credential sources. While
//! active it owns exactly one watch loop that polls on a fixed cadence and
//! admits new records into the monitor's ordered store.

/// Registry of monitors and the control surface over them.
pub mod registry;
/// Identifiers, configuration and status projections.
pub mod types;

mod watch;

pub use registry::Registry;
pub use types::{
    MonitorConfig, MonitorId, MonitorState, MonitorStatus, NewMonitor, Reactivation, RegistrySummary,
    WatchState,
};
