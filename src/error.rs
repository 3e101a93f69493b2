//! Error types for credmon.
//!
//! All errors in credmon are strongly typed using thiserror.
//! Extraction and persistence failures inside a watch loop are logged and
//! retried on cadence; only control operations surface errors to callers.

use std::path::PathBuf;

use thiserror::Error;

use crate::monitor::MonitorId;
use crate::storage::{describe_holder, LockHolder, StorageError};

/// Configuration errors detected by `EngineConfig::validate`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("Field '{field}' cannot be empty")]
    EmptyField {
        field: &'static str,
    },

    #[error("records file and monitors file must differ (both are '{name}')")]
    SnapshotCollision {
        name: String,
    },

    #[error("invalid value for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        reason: String,
    },
}

/// Top-level error type for credmon.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Monitor not found: {id}")]
    NotFound {
        id: MonitorId,
    },

    #[error("Failed to parse {what}: {reason}")]
    Parse {
        what: String,
        reason: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("Failed to spawn watch loop for monitor {id}: {reason}")]
    Spawn {
        id: MonitorId,
        reason: String,
    },

    #[error("State directory {} is locked by {}", path.display(), describe_holder(holder.as_ref()))]
    Locked {
        path: PathBuf,
        /// Owner stamped in the lock file, when it could be read.
        holder: Option<LockHolder>,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl MonitorError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the error names an unknown monitor.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a persistence error.
    #[must_use]
    pub const fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence(_) | Self::Spawn { .. } | Self::Locked { .. } => true,
            Self::NotFound { .. }
            | Self::Parse { .. }
            | Self::Config(_)
            | Self::Internal { .. } => false,
        }
    }
}

/// Poisoned-lock mapping shared by the registry.
pub(crate) fn lock_err(context: &'static str) -> MonitorError {
    MonitorError::internal(format!("poisoned lock: {context}"))
}

/// Result type alias for credmon operations.
pub type MonitorResult<T> = Result<T, MonitorError>;
