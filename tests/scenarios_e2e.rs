use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::tempdir;

use credmon::{
    extract_log_source, extract_site_source, EngineConfig, NewMonitor, Record, Registry, SourceKind,
};

const BOB: &str = r#"{"phishlet":"o365","username":"bob","password":"x","ip":"1.2.3.4"}"#;
const BOB_PAYPAL: &str = r#"{"phishlet":"paypal","username":"bob","password":"x","ip":"1.2.3.4"}"#;

fn config(dir: &Path) -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(20),
        ..EngineConfig::rooted_at(dir)
    }
}

fn write_site(cfg: &EngineConfig, site: &str, body: &str) {
    let dir = cfg.site_root.join(site);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(&cfg.site_file_name), body).unwrap();
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn log_line_becomes_credential_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.db");
    fs::write(&path, format!("*3\r\n$3\r\nset\r\n$9\r\nsessions:1\r\n{BOB}\r\n")).unwrap();

    let records = extract_log_source(&path);
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.source_kind, SourceKind::LogSource);
    assert!(r.has_credentials);
    assert!(!r.id.is_empty());
    assert_eq!(r.domain.as_deref(), Some("o365"));
    assert_eq!(r.username.as_deref(), Some("bob"));
    assert_eq!(r.ip.as_deref(), Some("1.2.3.4"));
}

#[test]
fn site_drop_file_labels_records_with_directory() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    write_site(&cfg, "evil_com", r#"[{"username":"a","password":"b"}]"#);

    let records = extract_site_source(&cfg.site_root, &cfg.site_file_name);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].domain.as_deref(), Some("evil_com"));
    assert_eq!(records[0].source_kind, SourceKind::SiteSource);
    assert_eq!(records[0].source_detail, "evil_com");
}

#[test]
fn domain_filter_admits_only_listed_labels() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let registry = Registry::open(cfg.clone()).unwrap();

    let id = registry
        .create_monitor(NewMonitor::new().name("o365 only").domains(["o365"]))
        .unwrap();
    fs::write(&cfg.log_source_path, format!("{BOB}\n{BOB_PAYPAL}\n")).unwrap();

    assert!(wait_until(|| !registry.list_credentials(Some(&id)).unwrap().is_empty()));
    thread::sleep(Duration::from_millis(100));

    let records = registry.list_credentials(Some(&id)).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].domain.as_deref(), Some("o365"));
    registry.stop_monitor(&id).unwrap();
}

#[test]
fn clear_all_empties_every_monitor_and_snapshot() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    write_site(&cfg, "evil_com", r#"[{"username":"a","password":"b"}]"#);
    let registry = Registry::open(cfg.clone()).unwrap();

    let id = registry.create_monitor(NewMonitor::new()).unwrap();
    assert!(wait_until(|| registry.list_credentials(Some(&id)).unwrap().len() == 1));
    registry.stop_monitor(&id).unwrap();
    // Reconciliation already put the same record in `default`.
    assert_eq!(registry.list_credentials(None).unwrap().len(), 2);

    assert_eq!(registry.clear_credentials(None).unwrap(), 2);
    assert!(registry.list_credentials(None).unwrap().is_empty());
    assert_eq!(registry.summary().unwrap().records, 0);

    let on_disk: Value = serde_json::from_str(&fs::read_to_string(cfg.records_path()).unwrap()).unwrap();
    assert_eq!(on_disk, Value::Array(vec![]));
}

#[test]
fn repeated_extraction_admits_nothing_new() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    fs::write(&cfg.log_source_path, format!("{BOB}\n")).unwrap();
    write_site(&cfg, "evil_com", r#"{"username":"a","password":"b"}"#);

    let registry = Registry::open(cfg).unwrap();
    assert_eq!(registry.list_credentials(None).unwrap().len(), 2);
    assert_eq!(registry.force_reload().unwrap(), 0);
    assert_eq!(registry.force_reload().unwrap(), 0);
    assert_eq!(registry.list_credentials(None).unwrap().len(), 2);
}

#[test]
fn identifier_is_stable_across_scans_and_trusts_upstream_ids() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.db");
    fs::write(
        &path,
        format!("{BOB}\n{{\"phishlet\":\"o365\",\"id\":42,\"username\":\"carol\"}}\n"),
    )
    .unwrap();

    let first: Vec<String> = extract_log_source(&path).into_iter().map(|r| r.id).collect();
    let second: Vec<String> = extract_log_source(&path).into_iter().map(|r| r.id).collect();
    assert_eq!(first, second);
    assert_eq!(first[1], "42");
    assert_ne!(first[0], first[1]);
}

#[test]
fn force_reload_ignores_monitor_filters() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let registry = Registry::open(cfg.clone()).unwrap();
    assert_eq!(registry.force_reload().unwrap(), 0);

    fs::write(&cfg.log_source_path, format!("{BOB_PAYPAL}\n")).unwrap();
    write_site(&cfg, "s1", r#"[{"username":"x"},{"note":"no credentials"}]"#);

    assert_eq!(registry.force_reload().unwrap(), 3);
    let default = registry
        .list_credentials(Some(&credmon::MonitorId::default_monitor()))
        .unwrap();
    let kinds: Vec<SourceKind> = default.iter().map(|r| r.source_kind).collect();
    assert_eq!(
        kinds,
        vec![SourceKind::LogSource, SourceKind::SiteSource, SourceKind::SiteSource]
    );

    let persisted: Vec<Record> =
        serde_json::from_str(&fs::read_to_string(cfg.records_path()).unwrap()).unwrap();
    assert_eq!(persisted, default);
}

#[test]
fn extract_all_previews_without_admitting() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let registry = Registry::open(cfg.clone()).unwrap();

    fs::write(&cfg.log_source_path, format!("{BOB}\nnoise line\n")).unwrap();
    write_site(&cfg, "evil_com", r#"[{"username":"a"}]"#);

    let preview = registry.extract_all();
    assert_eq!(preview.log_source.len(), 1);
    assert_eq!(preview.site_source.len(), 1);
    assert_eq!(preview.total(), 2);
    assert!(registry.list_credentials(None).unwrap().is_empty());
}
