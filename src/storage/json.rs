//! JSON file snapshot backend.
//!
//! Every save goes through `AtomicFile`: write to a uniquely named temp file
//! beside the target, fsync, then rename over the target. Readers therefore
//! see either the previous snapshot or the new one, never a partial write.
//! A snapshot that no longer decodes is renamed aside, never overwritten.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::record::Record;

use super::traits::{MonitorsSnapshot, SnapshotStore, StorageError};

const TEMP_MARKER: &str = ".tmp.";
const CORRUPT_MARKER: &str = ".corrupt.";

fn io_err(path: &Path, e: &std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Write-to-temp-then-rename helper.
struct AtomicFile {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    writer: BufWriter<File>,
}

impl AtomicFile {
    fn create(final_path: &Path) -> Result<Self, StorageError> {
        let file_name = final_path
            .file_name()
            .map_or_else(|| "snapshot".to_string(), |n| n.to_string_lossy().into_owned());
        let temp_path = final_path.with_file_name(format!("{file_name}{TEMP_MARKER}{}", Uuid::new_v4()));

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| io_err(&temp_path, &e))?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path: final_path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    fn write_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), StorageError> {
        serde_json::to_writer_pretty(&mut self.writer, value).map_err(|e| StorageError::Serialization {
            path: self.final_path.clone(),
            message: e.to_string(),
        })
    }

    /// Flush, fsync and rename into place. This is the commit point.
    fn commit(mut self) -> Result<(), StorageError> {
        let temp_path = self
            .temp_path
            .take()
            .ok_or_else(|| StorageError::Backend("temp path already consumed".to_string()))?;

        let result = self
            .writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_all())
            .and_then(|()| fs::rename(&temp_path, &self.final_path));

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(io_err(&self.final_path, &e));
        }
        Ok(())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        // Not committed: drop the temp file.
        if let Some(ref temp_path) = self.temp_path {
            let _ = fs::remove_file(temp_path);
        }
    }
}

/// Snapshot store backed by two JSON files.
#[derive(Debug)]
pub struct JsonSnapshotStore {
    records_path: PathBuf,
    monitors_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonSnapshotStore {
    /// Open the store, creating the parent directories and sweeping stale
    /// temp files left by an interrupted write.
    pub fn open(records_path: PathBuf, monitors_path: PathBuf) -> Result<Self, StorageError> {
        for path in [&records_path, &monitors_path] {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir).map_err(|e| io_err(dir, &e))?;
                sweep_stale_temps(dir, path);
            }
        }

        Ok(Self {
            records_path,
            monitors_path,
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn records_path(&self) -> &Path {
        &self.records_path
    }

    #[must_use]
    pub fn monitors_path(&self) -> &Path {
        &self.monitors_path
    }

    fn save<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: snapshot writer".to_string()))?;
        let mut file = AtomicFile::create(path)?;
        file.write_json(value)?;
        file.commit()
    }
}

/// Read a snapshot. A missing file loads as `None`; so does an undecodable
/// one, after it has been moved aside by `quarantine`.
fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, &e)),
    };
    match serde_json::from_str(&text) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            let moved_to = quarantine(path)?;
            tracing::warn!(
                path = %path.display(),
                moved_to = %moved_to.display(),
                error = %e,
                "snapshot is corrupt; moved aside and starting without it"
            );
            Ok(None)
        }
    }
}

/// Rename a corrupt snapshot to `<name>.corrupt.<utc timestamp>` beside it,
/// so the next flush cannot overwrite the only copy.
fn quarantine(path: &Path) -> Result<PathBuf, StorageError> {
    let file_name = path
        .file_name()
        .map_or_else(|| "snapshot".to_string(), |n| n.to_string_lossy().into_owned());
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let target = path.with_file_name(format!("{file_name}{CORRUPT_MARKER}{stamp}"));
    fs::rename(path, &target).map_err(|e| io_err(path, &e))?;
    Ok(target)
}

fn sweep_stale_temps(dir: &Path, target: &Path) {
    let Some(prefix) = target
        .file_name()
        .map(|n| format!("{}{TEMP_MARKER}", n.to_string_lossy()))
    else {
        return;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            let _ = fs::remove_file(entry.path());
        }
    }
}

impl SnapshotStore for JsonSnapshotStore {
    fn load_records(&self) -> Result<Option<Vec<Record>>, StorageError> {
        load(&self.records_path)
    }

    fn save_records(&self, records: &[Record]) -> Result<(), StorageError> {
        self.save(&self.records_path, records)
    }

    fn load_monitors(&self) -> Result<Option<MonitorsSnapshot>, StorageError> {
        load(&self.monitors_path)
    }

    fn save_monitors(&self, snapshot: &MonitorsSnapshot) -> Result<(), StorageError> {
        self.save(&self.monitors_path, snapshot)
    }
}
