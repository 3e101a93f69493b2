//! Record extractors.
//!
//! Both extractors are stateless total scans: every call re-reads its source
//! in full. Incrementality (mtime checks, dedup) belongs to the watch loop.

/// Line-oriented proxy log.
pub mod log_source;
/// Per-site drop files.
pub mod site_source;

use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::record::{Record, SourceKind};

pub use log_source::{extract_log_source, first_balanced_object, scan_log_source, LogScan};
pub use site_source::{extract_site_source, DEFAULT_SITE_FILE};

/// Locations of the two external sources.
#[derive(Debug, Clone)]
pub struct SourcePaths {
    pub log_source: PathBuf,
    pub site_root: PathBuf,
    pub site_file_name: String,
}

impl SourcePaths {
    #[must_use]
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            log_source: cfg.log_source_path.clone(),
            site_root: cfg.site_root.clone(),
            site_file_name: cfg.site_file_name.clone(),
        }
    }

    /// Run the extractor for one source kind.
    #[must_use]
    pub fn extract(&self, kind: SourceKind) -> Vec<Record> {
        match kind {
            SourceKind::LogSource => extract_log_source(&self.log_source),
            SourceKind::SiteSource => extract_site_source(&self.site_root, &self.site_file_name),
        }
    }

    /// One pass over the log file, reporting whether the read finished.
    #[must_use]
    pub fn scan_log_source(&self) -> LogScan {
        scan_log_source(&self.log_source)
    }

    /// Modification time of the log file, or `None` when it is missing.
    #[must_use]
    pub fn log_source_mtime(&self) -> Option<SystemTime> {
        fs::metadata(&self.log_source).and_then(|m| m.modified()).ok()
    }

    /// Run both extractors once without admitting anything.
    #[must_use]
    pub fn preview(&self) -> ExtractionPreview {
        ExtractionPreview {
            log_source: self.extract(SourceKind::LogSource),
            site_source: self.extract(SourceKind::SiteSource),
        }
    }
}

/// Result of a one-shot scan of both sources.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionPreview {
    pub log_source: Vec<Record>,
    pub site_source: Vec<Record>,
}

impl ExtractionPreview {
    #[must_use]
    pub fn total(&self) -> usize {
        self.log_source.len() + self.site_source.len()
    }

    /// Log-source records first, then site-source records.
    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        let mut all = self.log_source;
        all.extend(self.site_source);
        all
    }
}
