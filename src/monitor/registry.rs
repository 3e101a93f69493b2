//! Process-wide monitor registry.
//!
//! The registry owns every monitor, its records and the handle of its watch
//! loop behind a single `RwLock`. Control operations and watch loops only
//! ever touch that state through the methods here.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{lock_err, MonitorError, MonitorResult};
use crate::extract::{ExtractionPreview, SourcePaths};
use crate::record::Record;
use crate::storage::{JsonSnapshotStore, LockError, MonitorsSnapshot, SnapshotStore, StateLock, StorageError};

use super::types::{
    Monitor, MonitorConfig, MonitorId, MonitorState, MonitorStatus, NewMonitor, Reactivation,
    RegistrySummary, WatchState,
};
use super::watch::{self, WatchHandle};

#[derive(Debug, Default)]
pub(crate) struct Table {
    pub(crate) monitors: BTreeMap<MonitorId, Monitor>,
    pub(crate) tasks: HashMap<MonitorId, WatchHandle>,
}

impl Table {
    fn has_live_task(&self, id: &MonitorId) -> bool {
        self.tasks.get(id).is_some_and(WatchHandle::is_alive)
    }

    fn monitor_mut(&mut self, id: &MonitorId) -> MonitorResult<&mut Monitor> {
        self.monitors
            .get_mut(id)
            .ok_or_else(|| MonitorError::NotFound { id: id.clone() })
    }

    fn ensure_default(&mut self) -> (&mut Monitor, bool) {
        let id = MonitorId::default_monitor();
        let created = !self.monitors.contains_key(&id);
        let monitor = self
            .monitors
            .entry(id)
            .or_insert_with(|| Monitor::new(MonitorConfig::recovery(), MonitorState::Stopped));
        (monitor, created)
    }

    fn all_records(&self) -> Vec<Record> {
        self.monitors
            .values()
            .flat_map(|m| m.records.iter().cloned())
            .collect()
    }

    fn config_snapshot(&self) -> MonitorsSnapshot {
        let mut snap = MonitorsSnapshot::default();
        for (id, m) in &self.monitors {
            snap.monitors.insert(id.clone(), m.config.clone());
            snap.active.insert(id.clone(), m.is_active());
        }
        snap
    }
}

/// State shared between the registry handle and its watch loops.
pub(crate) struct Shared {
    table: RwLock<Table>,
    store: Arc<dyn SnapshotStore>,
    pub(crate) sources: SourcePaths,
    pub(crate) poll_interval: Duration,
    persist_lock: Mutex<()>,
    records_dirty: AtomicBool,
    next_generation: AtomicU64,
    /// Held until the last loop lets go, so no flush outlives the lock.
    _lock: Option<StateLock>,
    #[cfg(test)]
    fail_next_spawn: AtomicBool,
}

impl Shared {
    fn read(&self) -> MonitorResult<RwLockReadGuard<'_, Table>> {
        self.table.read().map_err(|_| lock_err("registry table"))
    }

    fn write(&self) -> MonitorResult<RwLockWriteGuard<'_, Table>> {
        self.table.write().map_err(|_| lock_err("registry table"))
    }

    /// Configuration of one monitor, copied out so extraction runs unlocked.
    pub(crate) fn monitor_config(&self, id: &MonitorId) -> MonitorResult<MonitorConfig> {
        self.read()?
            .monitors
            .get(id)
            .map(|m| m.config.clone())
            .ok_or_else(|| MonitorError::NotFound { id: id.clone() })
    }

    /// Decide, under the write lock, whether the loop of `generation` keeps
    /// running. A loop that must exit unbinds itself in the same critical
    /// section, so `reactivate` never sees a handle that is about to vanish.
    pub(crate) fn keep_running(&self, id: &MonitorId, generation: u64) -> MonitorResult<bool> {
        let mut table = self.write()?;
        let active = table.monitors.get(id).is_some_and(Monitor::is_active);
        let bound = table.tasks.get(id).is_some_and(|h| h.generation() == generation);
        if active && bound {
            return Ok(true);
        }
        if bound {
            table.tasks.remove(id);
        }
        Ok(false)
    }

    /// Append new candidates to a monitor. Returns how many were admitted.
    pub(crate) fn admit(&self, id: &MonitorId, candidates: Vec<Record>) -> MonitorResult<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let mut table = self.write()?;
        Ok(table.monitor_mut(id)?.admit(candidates))
    }

    pub(crate) fn records_dirty(&self) -> bool {
        self.records_dirty.load(Ordering::Acquire)
    }

    /// Overwrite the records snapshot with the union of all monitors.
    ///
    /// Holding `persist_lock` across snapshot and write keeps flushes ordered:
    /// the last write always reflects the latest in-memory state.
    pub(crate) fn flush_records(&self) -> MonitorResult<()> {
        let _guard = self.persist_lock.lock().map_err(|_| lock_err("persist"))?;
        let records = self.read()?.all_records();
        match self.store.save_records(&records) {
            Ok(()) => {
                self.records_dirty.store(false, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.records_dirty.store(true, Ordering::Release);
                Err(e.into())
            }
        }
    }

    fn flush_monitors(&self) -> MonitorResult<()> {
        let _guard = self.persist_lock.lock().map_err(|_| lock_err("persist"))?;
        let snapshot = self.read()?.config_snapshot();
        self.store.save_monitors(&snapshot)?;
        Ok(())
    }

    #[cfg(test)]
    fn take_injected_spawn_failure(&self) -> bool {
        self.fail_next_spawn.swap(false, Ordering::SeqCst)
    }

    #[cfg(not(test))]
    fn take_injected_spawn_failure(&self) -> bool {
        false
    }

    /// Persistence failures on control paths are logged, not surfaced: the
    /// in-memory table stays authoritative and the next write retries.
    fn persist_monitors_logged(&self) {
        if let Err(e) = self.flush_monitors() {
            tracing::warn!(error = %e, "failed to persist monitor configuration");
        }
    }

    fn persist_records_logged(&self) {
        if let Err(e) = self.flush_records() {
            tracing::warn!(error = %e, "failed to persist records snapshot");
        }
    }
}

/// Handle to the monitor registry.
///
/// Watch loops only hold a weak reference and wind down on their own; they
/// are never joined. The state-directory lock is released once the registry
/// and any loop iteration still in flight have both finished.
pub struct Registry {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sources", &self.shared.sources)
            .field("poll_interval", &self.shared.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Open the registry described by `config`.
    ///
    /// Locks the state directory, recovers both snapshots, then runs one
    /// reconciliation pass into the `default` monitor.
    ///
    /// A snapshot that fails to decode is moved aside by the store and
    /// recovery proceeds without it.
    ///
    /// # Errors
    /// - `Locked` if another process owns the state directory
    /// - `Persistence` if the state directory or a snapshot cannot be read
    pub fn open(config: EngineConfig) -> MonitorResult<Self> {
        let config = config.validate()?;

        let io_err = |e: std::io::Error| {
            MonitorError::Persistence(StorageError::Io {
                path: config.state_dir.clone(),
                message: e.to_string(),
            })
        };
        fs::create_dir_all(&config.state_dir).map_err(io_err)?;

        let lock = StateLock::acquire(&config.state_dir).map_err(|e| match e {
            LockError::Held { holder } => MonitorError::Locked {
                path: config.state_dir.clone(),
                holder,
            },
            LockError::Io(e) => io_err(e),
        })?;
        tracing::info!(state_dir = %config.state_dir.display(), pid = lock.holder().pid, "state directory locked");

        let store = JsonSnapshotStore::open(config.records_path(), config.monitors_path())?;
        Self::build(Arc::new(store), &config, Some(lock))
    }

    /// Build a registry on an arbitrary snapshot store, without a directory lock.
    pub fn with_store(store: Arc<dyn SnapshotStore>, config: &EngineConfig) -> MonitorResult<Self> {
        Self::build(store, config, None)
    }

    fn build(
        store: Arc<dyn SnapshotStore>,
        config: &EngineConfig,
        lock: Option<StateLock>,
    ) -> MonitorResult<Self> {
        let shared = Arc::new(Shared {
            table: RwLock::new(Table::default()),
            store,
            sources: SourcePaths::from_config(config),
            poll_interval: config.poll_interval,
            persist_lock: Mutex::new(()),
            records_dirty: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
            _lock: lock,
            #[cfg(test)]
            fail_next_spawn: AtomicBool::new(false),
        });
        let registry = Self { shared };

        let resumable = registry.recover()?;

        match registry.force_reload() {
            Ok(n) if n > 0 => tracing::info!(count = n, "reconciliation merged records into default monitor"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "reconciliation pass failed"),
        }

        if config.resume_active_on_start {
            for id in resumable {
                if let Err(e) = registry.reactivate_monitor(&id) {
                    tracing::warn!(monitor_id = %id, error = %e, "failed to resume monitor");
                }
            }
        }

        Ok(registry)
    }

    /// Load both snapshots. Every monitor comes back `Stopped`; the ids that
    /// were persisted as active are returned for optional resumption.
    fn recover(&self) -> MonitorResult<Vec<MonitorId>> {
        let monitors = self.shared.store.load_monitors()?;
        let records = self.shared.store.load_records()?;

        let mut table = self.shared.write()?;
        let mut resumable = Vec::new();

        if let Some(snap) = monitors {
            let MonitorsSnapshot { monitors, active } = snap;
            for (id, mut config) in monitors {
                config.normalize();
                table.monitors.insert(id, Monitor::new(config, MonitorState::Stopped));
            }
            for (id, was_active) in active {
                if !table.monitors.contains_key(&id) {
                    let config = MonitorConfig::new(format!("Monitor {}", id.short()), Vec::new(), Vec::new());
                    table.monitors.insert(id.clone(), Monitor::new(config, MonitorState::Stopped));
                }
                if was_active {
                    resumable.push(id);
                }
            }
            tracing::info!(monitors = table.monitors.len(), "loaded monitor configuration");
        }

        // The snapshot is the union of every monitor, so the same event can
        // appear once per monitor that admitted it. `default` keeps one copy.
        if let Some(records) = records {
            let loaded = records.len();
            let (default, _) = table.ensure_default();
            let kept = default.admit(records);
            tracing::info!(loaded, kept, "loaded records snapshot into default monitor");
        }

        Ok(resumable)
    }

    /// Create a monitor, persist its configuration and start its watch loop.
    ///
    /// # Errors
    /// `Spawn` if the watch loop could not be started; the monitor is kept
    /// in the `Stopped` state.
    pub fn create_monitor(&self, request: NewMonitor) -> MonitorResult<MonitorId> {
        let id = MonitorId::generate();
        let name = request
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Monitor {}", id.short()));
        let config = MonitorConfig::new(name, request.sources, request.domains);

        let spawned = {
            let mut table = self.shared.write()?;
            table.monitors.insert(id.clone(), Monitor::new(config, MonitorState::Active));
            let spawned = self.spawn_locked(&mut table, &id);
            if spawned.is_err() {
                table.monitor_mut(&id)?.state = MonitorState::Stopped;
            }
            spawned
        };

        self.shared.persist_monitors_logged();
        spawned?;

        tracing::info!(monitor_id = %id, "monitor started");
        Ok(id)
    }

    /// Flip a monitor to `Stopped`. The loop exits within one poll interval;
    /// this call does not wait for it.
    pub fn stop_monitor(&self, id: &MonitorId) -> MonitorResult<()> {
        {
            let mut table = self.shared.write()?;
            table.monitor_mut(id)?.state = MonitorState::Stopped;
            if let Some(handle) = table.tasks.get(id) {
                handle.wake();
            }
        }
        self.shared.persist_monitors_logged();
        tracing::info!(monitor_id = %id, "monitor stopped");
        Ok(())
    }

    /// Reactivate a stopped monitor.
    ///
    /// A loop is spawned only if none is still bound; a loop that is halting
    /// simply observes the monitor active again and carries on.
    pub fn reactivate_monitor(&self, id: &MonitorId) -> MonitorResult<Reactivation> {
        let spawned = {
            let mut table = self.shared.write()?;
            let monitor = table.monitor_mut(id)?;
            if monitor.is_active() {
                tracing::info!(monitor_id = %id, "monitor already active");
                return Ok(Reactivation::AlreadyActive);
            }
            monitor.state = MonitorState::Active;

            if table.has_live_task(id) {
                Ok(())
            } else {
                let spawned = self.spawn_locked(&mut table, id);
                if spawned.is_err() {
                    table.monitor_mut(id)?.state = MonitorState::Stopped;
                }
                spawned
            }
        };

        self.shared.persist_monitors_logged();
        spawned?;

        tracing::info!(monitor_id = %id, "monitor reactivated");
        Ok(Reactivation::Reactivated)
    }

    fn spawn_locked(&self, table: &mut Table, id: &MonitorId) -> MonitorResult<()> {
        if self.shared.take_injected_spawn_failure() {
            return Err(MonitorError::Spawn {
                id: id.clone(),
                reason: "injected failure".to_string(),
            });
        }

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = watch::spawn(Arc::downgrade(&self.shared), id.clone(), generation, self.shared.poll_interval)
            .map_err(|e| MonitorError::Spawn {
                id: id.clone(),
                reason: e.to_string(),
            })?;
        table.tasks.insert(id.clone(), handle);
        Ok(())
    }

    /// Records of one monitor, or of every monitor in id order.
    ///
    /// An unknown id yields an empty list.
    pub fn list_credentials(&self, id: Option<&MonitorId>) -> MonitorResult<Vec<Record>> {
        let table = self.shared.read()?;
        Ok(match id {
            Some(id) => table.monitors.get(id).map(|m| m.records.clone()).unwrap_or_default(),
            None => table.all_records(),
        })
    }

    /// Empty one monitor's records, or every monitor's, then persist.
    /// Returns the number of records removed.
    ///
    /// Dedup sets are kept, so cleared records are not re-admitted by a
    /// running loop. They are not durable across a restart: the dedup sets
    /// are rebuilt from the (now empty) snapshot, and reconciliation on the
    /// next `open` merges anything still present in the sources back into
    /// `default`.
    pub fn clear_credentials(&self, id: Option<&MonitorId>) -> MonitorResult<usize> {
        let removed = {
            let mut table = self.shared.write()?;
            match id {
                Some(id) => {
                    let monitor = table.monitor_mut(id)?;
                    let n = monitor.records.len();
                    monitor.records.clear();
                    n
                }
                None => table
                    .monitors
                    .values_mut()
                    .map(|m| {
                        let n = m.records.len();
                        m.records.clear();
                        n
                    })
                    .sum(),
            }
        };

        self.shared.persist_records_logged();
        tracing::info!(count = removed, "cleared records");
        Ok(removed)
    }

    /// Status projection for every monitor.
    pub fn list_monitors(&self) -> MonitorResult<BTreeMap<MonitorId, MonitorStatus>> {
        let table = self.shared.read()?;
        Ok(table
            .monitors
            .iter()
            .map(|(id, m)| (id.clone(), m.status()))
            .collect())
    }

    /// Registry-wide counters.
    pub fn summary(&self) -> MonitorResult<RegistrySummary> {
        let table = self.shared.read()?;
        Ok(RegistrySummary {
            monitors: table.monitors.len(),
            active_monitors: table.monitors.values().filter(|m| m.is_active()).count(),
            records: table.monitors.values().map(|m| m.records.len()).sum(),
        })
    }

    /// Lifecycle of the watch task bound to `id`.
    pub fn watch_state(&self, id: &MonitorId) -> MonitorResult<WatchState> {
        let table = self.shared.read()?;
        let monitor = table
            .monitors
            .get(id)
            .ok_or_else(|| MonitorError::NotFound { id: id.clone() })?;
        Ok(match (table.has_live_task(id), monitor.is_active()) {
            (true, true) => WatchState::Running,
            (true, false) => WatchState::Halting,
            (false, _) => WatchState::Stopped,
        })
    }

    /// Run both extractors without admitting anything.
    #[must_use]
    pub fn extract_all(&self) -> ExtractionPreview {
        self.shared.sources.preview()
    }

    /// Run both extractors once and merge everything new into the `default`
    /// monitor, bypassing loop cadence and monitor filters. Returns the count
    /// of newly merged records.
    pub fn force_reload(&self) -> MonitorResult<usize> {
        let candidates = self.shared.sources.preview().into_records();

        let (admitted, created) = {
            let mut table = self.shared.write()?;
            let (default, created) = table.ensure_default();
            (default.admit(candidates), created)
        };

        if created {
            self.shared.persist_monitors_logged();
        }
        if admitted > 0 || self.shared.records_dirty() {
            self.shared.flush_records()?;
        }
        if admitted > 0 {
            tracing::info!(count = admitted, "force reload merged new records");
        }
        Ok(admitted)
    }
}
