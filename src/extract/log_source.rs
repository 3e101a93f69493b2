//! Log-source extractor.
//!
//! The proxy appends one entry per line; entries that describe a captured
//! session embed a JSON object keyed by `"phishlet"`. Everything else on the
//! line (key prefixes, command verbs) is ignored.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::Path;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value};

use crate::record::{Record, SourceKind};

/// Status tag stamped on every log-source record.
const SESSION_STATUS: &str = "extracted";

fn marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r#""phishlet"\s*:"#).expect("marker regex is valid"))
}

/// Outcome of one pass over the log file.
#[derive(Debug, Default)]
pub struct LogScan {
    pub records: Vec<Record>,
    /// False when the file could not be opened or a read failed partway.
    /// Malformed entries do not count: rereading them would not help.
    pub complete: bool,
}

/// Scan the whole log file and return every parsable session record.
///
/// A missing file yields an empty result. Unreadable or malformed lines are
/// logged and skipped; the scan never aborts on a single line.
#[must_use]
pub fn extract_log_source(path: &Path) -> Vec<Record> {
    scan_log_source(path).records
}

/// Like `extract_log_source`, but also reports whether the read finished.
#[must_use]
pub fn scan_log_source(path: &Path) -> LogScan {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return LogScan {
                records: Vec::new(),
                complete: true,
            }
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "log source unreadable");
            return LogScan::default();
        }
    };

    let detail = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    let now = Utc::now();
    let mut out = Vec::new();
    let mut complete = true;

    for (idx, chunk) in BufReader::new(file).split(b'\n').enumerate() {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "log source read interrupted");
                complete = false;
                break;
            }
        };
        let line = decode_lossy(&bytes);
        if !marker().is_match(&line) {
            continue;
        }

        match parse_line(&line) {
            Ok(mut obj) => {
                obj.insert("session_status".to_string(), Value::from(SESSION_STATUS));
                out.push(Record::from_upstream(obj, SourceKind::LogSource, detail.clone(), None, now));
            }
            Err(reason) => {
                tracing::warn!(path = %path.display(), line = idx + 1, %reason, "skipping malformed log entry");
            }
        }
    }

    LogScan {
        records: out,
        complete,
    }
}

/// Decode a line, dropping invalid UTF-8 sequences instead of replacing them.
fn decode_lossy(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.contains(char::REPLACEMENT_CHARACTER) && std::str::from_utf8(bytes).is_err() {
        text.chars().filter(|c| *c != char::REPLACEMENT_CHARACTER).collect()
    } else {
        text.into_owned()
    }
}

fn parse_line(line: &str) -> Result<Map<String, Value>, String> {
    let span = first_balanced_object(line).ok_or_else(|| "no balanced JSON object".to_string())?;
    serde_json::from_str::<Map<String, Value>>(span).map_err(|e| e.to_string())
}

/// Return the first balanced `{...}` span, honouring JSON string escapes.
#[must_use]
pub fn first_balanced_object(line: &str) -> Option<&str> {
    let start = line.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (off, ch) in line[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&line[start..=start + off]);
                }
            }
            _ => {}
        }
    }
    None
}
