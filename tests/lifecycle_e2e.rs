use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use credmon::{EngineConfig, MonitorId, NewMonitor, Reactivation, Registry, SourceKind, WatchState};

fn config(dir: &Path) -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(20),
        ..EngineConfig::rooted_at(dir)
    }
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

fn log_line(user: &str) -> String {
    format!("{{\"phishlet\":\"o365\",\"username\":\"{user}\",\"password\":\"pw\"}}\n")
}

#[test]
fn stop_then_reactivate_runs_exactly_one_loop() {
    let dir = tempdir().unwrap();
    let registry = Registry::open(config(dir.path())).unwrap();

    let id = registry.create_monitor(NewMonitor::new().name("lifecycle")).unwrap();
    assert_eq!(registry.watch_state(&id).unwrap(), WatchState::Running);
    assert_eq!(registry.reactivate_monitor(&id).unwrap(), Reactivation::AlreadyActive);

    registry.stop_monitor(&id).unwrap();
    assert!(!registry.list_monitors().unwrap()[&id].active);
    assert!(wait_until(|| registry.watch_state(&id).unwrap() == WatchState::Stopped));

    // Stopping twice is harmless.
    registry.stop_monitor(&id).unwrap();

    assert_eq!(registry.reactivate_monitor(&id).unwrap(), Reactivation::Reactivated);
    assert_eq!(registry.watch_state(&id).unwrap(), WatchState::Running);
    assert!(registry.list_monitors().unwrap()[&id].active);

    registry.stop_monitor(&id).unwrap();
    assert!(wait_until(|| registry.watch_state(&id).unwrap() == WatchState::Stopped));
}

#[test]
fn quick_reactivate_reuses_halting_loop() {
    let dir = tempdir().unwrap();
    let cfg = EngineConfig {
        poll_interval: Duration::from_millis(200),
        ..EngineConfig::rooted_at(dir.path())
    };
    let registry = Registry::open(cfg.clone()).unwrap();
    let id = registry.create_monitor(NewMonitor::new()).unwrap();

    registry.stop_monitor(&id).unwrap();
    assert_eq!(registry.reactivate_monitor(&id).unwrap(), Reactivation::Reactivated);
    assert_eq!(registry.watch_state(&id).unwrap(), WatchState::Running);

    // Whichever loop survived keeps admitting.
    fs::write(&cfg.log_source_path, log_line("alice")).unwrap();
    assert!(wait_until(|| registry.list_credentials(Some(&id)).unwrap().len() == 1));
    registry.stop_monitor(&id).unwrap();
}

#[test]
fn unknown_monitor_ids() {
    let dir = tempdir().unwrap();
    let registry = Registry::open(config(dir.path())).unwrap();
    let ghost = MonitorId::from("ghost");

    assert!(registry.stop_monitor(&ghost).unwrap_err().is_not_found());
    assert!(registry.reactivate_monitor(&ghost).unwrap_err().is_not_found());
    assert!(registry.clear_credentials(Some(&ghost)).unwrap_err().is_not_found());
    assert!(registry.watch_state(&ghost).unwrap_err().is_not_found());
    assert!(registry.list_credentials(Some(&ghost)).unwrap().is_empty());
}

#[test]
fn create_applies_defaults() {
    let dir = tempdir().unwrap();
    let registry = Registry::open(config(dir.path())).unwrap();

    let id = registry.create_monitor(NewMonitor::new().name("  ")).unwrap();
    let status = registry.list_monitors().unwrap()[&id].clone();
    assert_eq!(status.name, format!("Monitor {}", id.short()));
    assert_eq!(status.sources, SourceKind::ALL.to_vec());
    assert!(status.domains.is_empty());
    assert!(status.active);
    assert_eq!(status.record_count, 0);

    let summary = registry.summary().unwrap();
    assert_eq!(summary.monitors, 2);
    assert_eq!(summary.active_monitors, 1);
    registry.stop_monitor(&id).unwrap();
}

#[test]
fn loop_appends_in_order_and_skips_credentialless_log_lines() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let registry = Registry::open(cfg.clone()).unwrap();
    let id = registry
        .create_monitor(NewMonitor::new().sources([SourceKind::LogSource]))
        .unwrap();

    fs::write(&cfg.log_source_path, log_line("alice")).unwrap();
    assert!(wait_until(|| registry.list_credentials(Some(&id)).unwrap().len() == 1));

    let mut f = OpenOptions::new().append(true).open(&cfg.log_source_path).unwrap();
    f.write_all(b"{\"phishlet\":\"o365\",\"tokens\":{\"sid\":\"abc\"}}\n").unwrap();
    f.write_all(log_line("bob").as_bytes()).unwrap();
    drop(f);
    bump_mtime(&cfg.log_source_path);

    assert!(wait_until(|| registry.list_credentials(Some(&id)).unwrap().len() == 2));
    let users: Vec<String> = registry
        .list_credentials(Some(&id))
        .unwrap()
        .into_iter()
        .filter_map(|r| r.username)
        .collect();
    assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);
    registry.stop_monitor(&id).unwrap();
}

#[test]
fn unchanged_mtime_skips_log_rescan() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let registry = Registry::open(cfg.clone()).unwrap();
    let id = registry
        .create_monitor(NewMonitor::new().sources([SourceKind::LogSource]))
        .unwrap();

    fs::write(&cfg.log_source_path, log_line("alice")).unwrap();
    assert!(wait_until(|| registry.list_credentials(Some(&id)).unwrap().len() == 1));
    let stamp = fs::metadata(&cfg.log_source_path).unwrap().modified().unwrap();

    // Swap in new content carrying the old mtime: the loop must not notice.
    let staged = dir.path().join("data.db.staged");
    fs::write(&staged, format!("{}{}", log_line("alice"), log_line("bob"))).unwrap();
    File::options().write(true).open(&staged).unwrap().set_modified(stamp).unwrap();
    fs::rename(&staged, &cfg.log_source_path).unwrap();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(registry.list_credentials(Some(&id)).unwrap().len(), 1);

    bump_mtime(&cfg.log_source_path);
    assert!(wait_until(|| registry.list_credentials(Some(&id)).unwrap().len() == 2));
    registry.stop_monitor(&id).unwrap();
}

#[test]
fn cleared_records_are_not_readmitted() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let registry = Registry::open(cfg.clone()).unwrap();
    let id = registry.create_monitor(NewMonitor::new()).unwrap();

    fs::write(&cfg.log_source_path, log_line("alice")).unwrap();
    assert!(wait_until(|| registry.list_credentials(Some(&id)).unwrap().len() == 1));

    assert_eq!(registry.clear_credentials(Some(&id)).unwrap(), 1);
    bump_mtime(&cfg.log_source_path);
    thread::sleep(Duration::from_millis(150));
    assert!(registry.list_credentials(Some(&id)).unwrap().is_empty());
    registry.stop_monitor(&id).unwrap();
}

#[test]
fn monitors_are_independent() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let registry = Registry::open(cfg.clone()).unwrap();
    let a = registry.create_monitor(NewMonitor::new().name("a")).unwrap();
    let b = registry.create_monitor(NewMonitor::new().name("b")).unwrap();

    fs::write(&cfg.log_source_path, log_line("alice")).unwrap();
    assert!(wait_until(|| {
        registry.list_credentials(Some(&a)).unwrap().len() == 1
            && registry.list_credentials(Some(&b)).unwrap().len() == 1
    }));

    registry.stop_monitor(&a).unwrap();
    assert_eq!(registry.clear_credentials(Some(&a)).unwrap(), 1);
    assert_eq!(registry.list_credentials(Some(&b)).unwrap().len(), 1);
    assert_eq!(registry.watch_state(&b).unwrap(), WatchState::Running);
    registry.stop_monitor(&b).unwrap();
}

fn bump_mtime(path: &Path) {
    let later = fs::metadata(path).unwrap().modified().unwrap() + Duration::from_secs(5);
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(later)
        .unwrap();
}
