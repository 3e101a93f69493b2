//! Site-source extractor.
//!
//! Each immediate subdirectory of the site root is one deployed target. Its
//! drop file holds either a single JSON object or an array of them.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::record::{Record, SourceKind};

/// Default drop file name inside each site directory.
pub const DEFAULT_SITE_FILE: &str = "creds.json";

/// Walk the site root and return every record found in the drop files.
///
/// Directories are visited in name order. A missing root yields an empty
/// result; a malformed drop file is logged and skipped.
#[must_use]
pub fn extract_site_source(root: &Path, file_name: &str) -> Vec<Record> {
    let entries = match fs::read_dir(root) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %e, "site root unreadable");
            return Vec::new();
        }
    };

    let mut dirs: Vec<(String, std::path::PathBuf)> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            Some((name, path))
        })
        .collect();
    dirs.sort_by(|a, b| a.0.cmp(&b.0));

    let now = Utc::now();
    let mut out = Vec::new();

    for (name, dir) in dirs {
        let doc_path = dir.join(file_name);
        let text = match fs::read_to_string(&doc_path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                tracing::warn!(path = %doc_path.display(), error = %e, "site drop file unreadable");
                continue;
            }
        };

        let objects = match parse_document(&text) {
            Ok(objs) => objs,
            Err(reason) => {
                tracing::warn!(path = %doc_path.display(), %reason, "skipping malformed site drop file");
                continue;
            }
        };

        out.extend(objects.into_iter().map(|obj| {
            Record::from_upstream(obj, SourceKind::SiteSource, name.clone(), Some(name.clone()), now)
        }));
    }

    out
}

fn parse_document(text: &str) -> Result<Vec<Map<String, Value>>, String> {
    let doc: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    match doc {
        Value::Object(obj) => Ok(vec![obj]),
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(obj) => Some(obj),
                _ => None,
            })
            .collect()),
        other => Err(format!("expected object or array, got {}", type_name(&other))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        assert!(extract_site_source(&dir.path().join("nope"), DEFAULT_SITE_FILE).is_empty());
    }

    #[test]
    fn test_array_and_object_documents() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("b_site")).unwrap();
        fs::write(
            dir.path().join("b_site").join(DEFAULT_SITE_FILE),
            r#"{"id":"x1","username":"u","password":"p","timestamp":"2024-01-02 03:04:05"}"#,
        )
        .unwrap();
        fs::create_dir(dir.path().join("a_site")).unwrap();
        fs::write(
            dir.path().join("a_site").join(DEFAULT_SITE_FILE),
            r#"[{"username":"a","password":"b"}, 5, {"username":"c"}]"#,
        )
        .unwrap();

        let recs = extract_site_source(dir.path(), DEFAULT_SITE_FILE);
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].domain.as_deref(), Some("a_site"));
        assert_eq!(recs[2].id, "x1");
        assert_eq!(recs[2].source_detail, "b_site");
        assert!(recs.iter().all(|r| r.source_kind == SourceKind::SiteSource));
    }

    #[test]
    fn test_malformed_document_is_skipped() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("bad")).unwrap();
        fs::write(dir.path().join("bad").join(DEFAULT_SITE_FILE), "{not json").unwrap();
        fs::create_dir(dir.path().join("scalar")).unwrap();
        fs::write(dir.path().join("scalar").join(DEFAULT_SITE_FILE), "42").unwrap();
        fs::create_dir(dir.path().join("good")).unwrap();
        fs::write(dir.path().join("good").join(DEFAULT_SITE_FILE), r#"[{"username":"g"}]"#).unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        fs::write(dir.path().join("loose.json"), "[]").unwrap();

        let recs = extract_site_source(dir.path(), DEFAULT_SITE_FILE);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].domain.as_deref(), Some("good"));
    }
}
