//! Record identity and per-monitor deduplication.
//!
//! Identifiers are best-effort: two distinct events with the same
//! username, password and IP collapse into one.

use std::collections::HashSet;

use blake3::Hasher;

use crate::record::{Record, SourceKind};

/// Field separator fed to the digest so ("ab", "c") and ("a", "bc") differ.
const FIELD_SEPARATOR: &[u8] = &[0x1f];

/// Derive the identifier for an upstream record.
///
/// A non-empty supplied id is used verbatim. Otherwise the id is the hex
/// blake3 digest of username, password and IP, with absent fields hashed
/// as empty strings.
#[must_use]
pub fn derive_identifier(
    supplied: Option<&str>,
    username: Option<&str>,
    password: Option<&str>,
    ip: Option<&str>,
) -> String {
    match supplied {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => content_digest(
            username.unwrap_or_default(),
            password.unwrap_or_default(),
            ip.unwrap_or_default(),
        ),
    }
}

/// Stable digest over the identifying triple.
#[must_use]
pub fn content_digest(username: &str, password: &str, ip: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(username.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(password.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(ip.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Dedup key: identifiers are namespaced by source kind so an upstream id can
/// never shadow a synthetic digest from the other source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub source_kind: SourceKind,
    pub id: String,
}

impl DedupKey {
    #[must_use]
    pub fn of(record: &Record) -> Self {
        Self {
            source_kind: record.source_kind,
            id: record.id.clone(),
        }
    }
}

/// Identifiers already admitted by one monitor.
///
/// Always rebuilt from the monitor's records; never persisted on its own.
#[derive(Debug, Clone, Default)]
pub struct DedupSet {
    seen: HashSet<DedupKey>,
}

impl DedupSet {
    /// Rebuild from an admitted record sequence.
    #[must_use]
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut set = Self::default();
        for r in records {
            set.mark_seen(r);
        }
        set
    }

    /// True iff the record has not been admitted yet.
    #[must_use]
    pub fn is_new(&self, record: &Record) -> bool {
        !record.id.is_empty() && !self.seen.contains(&DedupKey::of(record))
    }

    /// Mark a record as admitted. Returns false if it was already present.
    pub fn mark_seen(&mut self, record: &Record) -> bool {
        if record.id.is_empty() {
            return false;
        }
        self.seen.insert(DedupKey::of(record))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
