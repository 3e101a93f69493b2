//! Single-owner lock on the state directory.
//!
//! Two registries flushing the same snapshots would overwrite each other's
//! records. The owner stamps its pid and start time into the lock file, so a
//! refused `open` can name the process that holds the directory.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lock file name inside the state directory.
pub const LOCK_FILE_NAME: &str = ".credmon.lock";

/// Process that owns a state directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub started: DateTime<Utc>,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            started: Utc::now(),
        }
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} (since {})", self.pid, self.started.to_rfc3339())
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Another open file description holds the lock. `holder` is `None` when
    /// its stamp is missing or unreadable.
    #[error("state directory is held by {}", describe_holder(holder.as_ref()))]
    Held { holder: Option<LockHolder> },

    #[error("lock file I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Held lock on a state directory. Released when dropped.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
    path: PathBuf,
    holder: LockHolder,
}

impl StateLock {
    /// Take the lock on `dir` without blocking and stamp this process into it.
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        let path = dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !platform::try_lock_exclusive(&file)? {
            return Err(LockError::Held {
                holder: read_stamp(&mut file),
            });
        }

        let holder = LockHolder::current();
        write_stamp(&mut file, &holder)?;
        tracing::debug!(path = %path.display(), pid = holder.pid, "state directory locked");

        Ok(Self {
            _file: file,
            path,
            holder,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }
}

pub(crate) fn describe_holder(holder: Option<&LockHolder>) -> String {
    holder.map_or_else(|| "another process".to_string(), ToString::to_string)
}

fn read_stamp(file: &mut File) -> Option<LockHolder> {
    let mut text = String::new();
    file.read_to_string(&mut text).ok()?;
    serde_json::from_str(text.trim()).ok()
}

fn write_stamp(file: &mut File, holder: &LockHolder) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    serde_json::to_writer(&mut *file, holder).map_err(io::Error::other)?;
    file.flush()?;
    file.sync_data()
}

#[cfg(unix)]
mod platform {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    /// `Ok(false)` when another descriptor already holds the lock.
    pub(super) fn try_lock_exclusive(file: &File) -> io::Result<bool> {
        // SAFETY: the descriptor is owned by `file` and open for the whole call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    /// Locked byte sits at 4 GiB, well past the stamp, so a refused
    /// contender can still read who holds the directory.
    const LOCK_OFFSET_HIGH: u32 = 1;

    pub(super) fn try_lock_exclusive(file: &File) -> io::Result<bool> {
        // SAFETY: the handle is valid while `file` is borrowed; OVERLAPPED is plain data.
        let ok = unsafe {
            let mut overlapped: OVERLAPPED = std::mem::zeroed();
            overlapped.Anonymous.Anonymous.OffsetHigh = LOCK_OFFSET_HIGH;
            LockFileEx(
                file.as_raw_handle() as HANDLE,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };
        if ok != 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use std::fs::File;
    use std::io;

    pub(super) fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "state directory locking is not supported on this platform",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_stamps_current_process() {
        let dir = tempdir().unwrap();
        let lock = StateLock::acquire(dir.path()).unwrap();
        assert_eq!(lock.holder().pid, std::process::id());

        let stamped: LockHolder =
            serde_json::from_str(&std::fs::read_to_string(lock.path()).unwrap()).unwrap();
        assert_eq!(&stamped, lock.holder());
    }

    #[test]
    fn test_refusal_names_the_holder() {
        let dir = tempdir().unwrap();
        let held = StateLock::acquire(dir.path()).unwrap();

        match StateLock::acquire(dir.path()) {
            Err(LockError::Held { holder: Some(h) }) => assert_eq!(&h, held.holder()),
            other => panic!("expected Held with a holder, got {other:?}"),
        }
    }

    #[test]
    fn test_restamped_after_release() {
        let dir = tempdir().unwrap();
        // A stale, unparsable stamp from a crashed owner is simply replaced.
        std::fs::write(dir.path().join(LOCK_FILE_NAME), "garbage that is longer than a stamp could be ............................................").unwrap();

        let lock = StateLock::acquire(dir.path()).unwrap();
        let text = std::fs::read_to_string(lock.path()).unwrap();
        assert!(serde_json::from_str::<LockHolder>(&text).is_ok());
        drop(lock);

        assert!(StateLock::acquire(dir.path()).is_ok());
    }
}
