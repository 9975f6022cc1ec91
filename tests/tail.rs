// SPDX-License-Identifier: Apache-2.0

//! End-to-end tailing scenarios on real temporary directories.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tailfeed::{LineSink, TailConfig, TailCoordinator, WatchMode};

#[derive(Default, Clone)]
struct VecSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl VecSink {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl LineSink for VecSink {
    fn deliver(&self, line: &[u8]) {
        self.lines
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(line).into_owned());
    }
}

fn fast_config(file: PathBuf) -> TailConfig {
    TailConfig {
        file,
        fetch_interval: Duration::from_millis(20),
        min_fetch_interval: Duration::from_millis(10),
        max_fetch_interval: Duration::from_millis(100),
        workers: 2,
        watch_mode: WatchMode::Poll,
        ..Default::default()
    }
}

fn append(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
}

fn wait_for(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

#[test]
fn restart_resumes_without_duplicates() {
    let dir = tempfile::TempDir::new().unwrap();
    let log = dir.path().join("service.log");
    append(&log, b"alpha\nbeta\n");

    let sink = VecSink::default();
    let coordinator =
        TailCoordinator::start(fast_config(log.clone()), Arc::new(sink.clone())).unwrap();
    assert!(wait_for(Duration::from_secs(5), || sink.lines().len() == 2));
    coordinator.shutdown();

    // Same sink, fresh coordinator: nothing is replayed.
    let coordinator =
        TailCoordinator::start(fast_config(log.clone()), Arc::new(sink.clone())).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(sink.lines(), vec!["alpha", "beta"]);

    append(&log, b"gamma\n");
    assert!(wait_for(Duration::from_secs(5), || sink.lines().len() == 3));
    assert_eq!(sink.lines(), vec!["alpha", "beta", "gamma"]);
    coordinator.shutdown();
}

#[test]
fn incomplete_lines_wait_for_their_newline() {
    let dir = tempfile::TempDir::new().unwrap();
    let log = dir.path().join("service.log");

    let sink = VecSink::default();
    let coordinator =
        TailCoordinator::start(fast_config(log.clone()), Arc::new(sink.clone())).unwrap();

    append(&log, b"half-a-li");
    std::thread::sleep(Duration::from_millis(300));
    assert!(sink.lines().is_empty());

    append(&log, b"ne\n");
    assert!(wait_for(Duration::from_secs(5), || {
        sink.lines() == ["half-a-line"]
    }));
    coordinator.shutdown();
}

#[test]
fn rotation_by_rename_restarts_at_zero() {
    let dir = tempfile::TempDir::new().unwrap();
    let log = dir.path().join("service.log");
    append(&log, b"old-1\nold-2\n");

    let sink = VecSink::default();
    let coordinator =
        TailCoordinator::start(fast_config(log.clone()), Arc::new(sink.clone())).unwrap();
    assert!(wait_for(Duration::from_secs(5), || sink.lines().len() == 2));

    std::fs::rename(&log, dir.path().join("service.log.1")).unwrap();
    append(&log, b"new-1\n");

    assert!(wait_for(Duration::from_secs(5), || {
        sink.lines().len() == 3
    }));
    assert_eq!(sink.lines(), vec!["old-1", "old-2", "new-1"]);
    coordinator.shutdown();
}

#[test]
fn dated_template_tails_an_undated_writer_via_alias() {
    let dir = tempfile::TempDir::new().unwrap();
    let raw = dir.path().join("access.log");
    append(&raw, b"req-1\n");

    let sink = VecSink::default();
    let config = fast_config(dir.path().join("access.log.${yyyy-MM-dd}"));
    let coordinator = TailCoordinator::start(config, Arc::new(sink.clone())).unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        sink.lines() == ["req-1"]
    }));

    let today = chrono::Local::now().date_naive();
    let alias = dir
        .path()
        .join(format!("access.log.{}", today.format("%Y-%m-%d")));
    assert!(alias.symlink_metadata().unwrap().file_type().is_symlink());
    assert_eq!(coordinator.active_files(), vec![alias]);

    append(&raw, b"req-2\n");
    assert!(wait_for(Duration::from_secs(5), || {
        sink.lines().len() == 2
    }));
    // Settle: the raw path and its alias resolve to one cursor, so no dupes.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(sink.lines(), vec!["req-1", "req-2"]);
    coordinator.shutdown();
}
