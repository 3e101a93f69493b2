//! Monitor identifiers, configuration and read-only projections.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::DedupSet;
use crate::record::{Record, SourceKind};

/// Unique identifier for a monitor.
///
/// Generated monitors get a UUID; the recovery monitor uses the fixed id
/// `default`, so the inner value is kept as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitorId(String);

impl MonitorId {
    /// Id of the monitor that owns recovered and reconciled records.
    pub const DEFAULT: &'static str = "default";

    /// Create a new random monitor id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The recovery monitor id.
    #[must_use]
    pub fn default_monitor() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used for generated display names.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MonitorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MonitorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Persisted monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub name: String,

    /// Enabled sources; never empty after normalization.
    #[serde(default = "all_sources")]
    pub sources: Vec<SourceKind>,

    /// Domain allow-list; empty admits everything.
    #[serde(default)]
    pub domains: Vec<String>,

    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
}

fn all_sources() -> Vec<SourceKind> {
    SourceKind::ALL.to_vec()
}

impl MonitorConfig {
    /// Build a normalized configuration stamped with the current time.
    #[must_use]
    pub fn new(name: impl Into<String>, sources: Vec<SourceKind>, domains: Vec<String>) -> Self {
        let mut cfg = Self {
            name: name.into(),
            sources,
            domains,
            created: Utc::now(),
        };
        cfg.normalize();
        cfg
    }

    /// Configuration of the synthesized recovery monitor.
    #[must_use]
    pub fn recovery() -> Self {
        Self::new("Default Monitor", Vec::new(), Vec::new())
    }

    /// Sort and dedup sources (defaulting to all kinds) and trim domains.
    pub fn normalize(&mut self) {
        self.sources.sort();
        self.sources.dedup();
        if self.sources.is_empty() {
            self.sources = all_sources();
        }
        self.domains = self
            .domains
            .iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
        self.domains.sort();
        self.domains.dedup();
    }

    #[must_use]
    pub fn watches(&self, kind: SourceKind) -> bool {
        self.sources.contains(&kind)
    }
}

/// Lifecycle state of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Active,
    Stopped,
}

/// Lifecycle of the watch task bound to a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Task alive, monitor active.
    Running,
    /// Monitor stopped, task alive until it observes the flag.
    Halting,
    /// No live task.
    Stopped,
}

/// Outcome of a successful reactivation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reactivation {
    /// The monitor was stopped and is now active.
    Reactivated,
    /// The monitor was already active; nothing changed.
    AlreadyActive,
}

/// Read-only projection of one monitor, safe for frequent polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub active: bool,
    pub record_count: usize,
    pub name: String,
    pub sources: Vec<SourceKind>,
    pub domains: Vec<String>,
    pub created: DateTime<Utc>,
}

/// Registry-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub monitors: usize,
    pub active_monitors: usize,
    pub records: usize,
}

/// Request to create a monitor. Unset fields take their defaults.
#[derive(Debug, Clone, Default)]
pub struct NewMonitor {
    pub name: Option<String>,
    pub sources: Vec<SourceKind>,
    pub domains: Vec<String>,
}

impl NewMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn sources(mut self, sources: impl IntoIterator<Item = SourceKind>) -> Self {
        self.sources = sources.into_iter().collect();
        self
    }

    #[must_use]
    pub fn domains<S: Into<String>>(mut self, domains: impl IntoIterator<Item = S>) -> Self {
        self.domains = domains.into_iter().map(Into::into).collect();
        self
    }
}

/// A monitor as held by the registry.
#[derive(Debug)]
pub(crate) struct Monitor {
    pub(crate) config: MonitorConfig,
    pub(crate) state: MonitorState,
    pub(crate) records: Vec<Record>,
    pub(crate) seen: DedupSet,
}

impl Monitor {
    pub(crate) fn new(config: MonitorConfig, state: MonitorState) -> Self {
        Self {
            config,
            state,
            records: Vec::new(),
            seen: DedupSet::default(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == MonitorState::Active
    }

    /// Admit every candidate not seen before, in order. Returns the count.
    pub(crate) fn admit(&mut self, candidates: Vec<Record>) -> usize {
        let before = self.records.len();
        for record in candidates {
            if self.seen.mark_seen(&record) {
                self.records.push(record);
            }
        }
        self.records.len() - before
    }

    pub(crate) fn status(&self) -> MonitorStatus {
        MonitorStatus {
            active: self.is_active(),
            record_count: self.records.len(),
            name: self.config.name.clone(),
            sources: self.config.sources.clone(),
            domains: self.config.domains.clone(),
            created: self.config.created,
        }
    }
}
