//! Per-monitor watch loop.
//!
//! Each active monitor owns one thread that polls both sources on a fixed
//! cadence. The thread holds only a weak reference to the registry and a
//! wake receiver; it exits when the monitor is stopped, when another loop
//! has been bound in its place, or when the registry goes away.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::MonitorResult;
use crate::extract::SourcePaths;
use crate::record::{Record, SourceKind};

use super::registry::Shared;
use super::types::MonitorId;

/// Registry-side handle of a running watch loop.
#[derive(Debug)]
pub(crate) struct WatchHandle {
    generation: u64,
    wake: Sender<()>,
    join: JoinHandle<()>,
}

impl WatchHandle {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    /// Cut the current sleep short. Never blocks.
    pub(crate) fn wake(&self) {
        let _ = self.wake.try_send(());
    }
}

pub(crate) fn spawn(
    shared: Weak<Shared>,
    id: MonitorId,
    generation: u64,
    interval: Duration,
) -> std::io::Result<WatchHandle> {
    let (wake_tx, wake_rx) = bounded(1);
    let join = thread::Builder::new()
        .name(format!("credmon-watch-{}", id.short()))
        .spawn(move || run(shared, id, generation, interval, wake_rx))?;
    Ok(WatchHandle {
        generation,
        wake: wake_tx,
        join,
    })
}

fn run(shared: Weak<Shared>, id: MonitorId, generation: u64, interval: Duration, wake: Receiver<()>) {
    tracing::info!(monitor_id = %id, generation, "watch loop started");
    let mut last_mtime: Option<SystemTime> = None;

    loop {
        {
            let Some(shared) = shared.upgrade() else { break };
            match shared.keep_running(&id, generation) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::error!(monitor_id = %id, error = %e, "watch loop lost registry state");
                    break;
                }
            }
            match poll_once(&shared, &id, &mut last_mtime) {
                Ok(0) => {}
                Ok(n) => tracing::info!(monitor_id = %id, count = n, "admitted new records"),
                Err(e) => tracing::warn!(monitor_id = %id, error = %e, "watch iteration failed"),
            }
        }

        match wake.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::info!(monitor_id = %id, generation, "watch loop stopped");
}

/// One iteration: extract, filter, admit, flush.
///
/// The log file is only re-read when its mtime moved. Site drop files are
/// small and re-read every time; dedup keeps that idempotent.
fn poll_once(shared: &Shared, id: &MonitorId, last_mtime: &mut Option<SystemTime>) -> MonitorResult<usize> {
    let config = shared.monitor_config(id)?;
    let mut candidates: Vec<Record> = Vec::new();

    if config.watches(SourceKind::LogSource) {
        candidates.extend(changed_log_records(&shared.sources, last_mtime));
    }

    if config.watches(SourceKind::SiteSource) {
        candidates.extend(shared.sources.extract(SourceKind::SiteSource));
    }

    candidates.retain(|r| r.matches_domains(&config.domains));

    let admitted = shared.admit(id, candidates)?;
    if admitted > 0 || shared.records_dirty() {
        shared.flush_records()?;
    }
    Ok(admitted)
}

/// Credential-bearing log records, or nothing when the file is unchanged
/// since the last clean read. An interrupted read leaves `last_mtime` alone
/// so the next iteration tries again.
fn changed_log_records(sources: &SourcePaths, last_mtime: &mut Option<SystemTime>) -> Vec<Record> {
    let mtime = sources.log_source_mtime();
    if mtime.is_none() || mtime == *last_mtime {
        return Vec::new();
    }
    let scan = sources.scan_log_source();
    if scan.complete {
        *last_mtime = mtime;
    }
    scan.records.into_iter().filter(|r| r.has_credentials).collect()
}
