// SPDX-License-Identifier: Apache-2.0

//! Tailing coordinator.
//!
//! Owns the discovery set (one slot per tailed path), a worker pool of OS
//! threads fed over bounded channels, the directory watcher, and the
//! retirement policy. Cursors are single-flight: the cursor value itself moves
//! to a worker and back, so a file can never be processed by two workers at
//! once. The coordinator thread never touches file contents; it only
//! schedules, discovers, and retires.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender, TrySendError};
use crate::clock::{SharedClock, SystemClock};
use crate::config::TailConfig;
use crate::cursor::{Cursor, Outcome};
use crate::error::{Error, Result};
use crate::offset;
use crate::pattern::{self, LogNamePattern};
use crate::sink::LineSink;
use crate::watcher::{create_watcher, DirWatcher, FileEvent, FileEventKind};

/// Time allowed for in-flight cursors to drain at shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

struct WorkItem {
    path: PathBuf,
    cursor: Cursor,
}

struct WorkResult {
    path: PathBuf,
    cursor: Cursor,
    outcome: Outcome,
}

enum Slot {
    Resident(Cursor),
    InFlight,
}

struct TailedFile {
    slot: Slot,
    /// Canonical path of the underlying file, for alias/raw dedup.
    canonical: PathBuf,
    last_progress: SystemTime,
    /// Idle confirmations accumulated toward retirement.
    confirmations: u32,
    backoff_until: Option<SystemTime>,
}

/// Handle to a running tailer. Dropping without `shutdown()` detaches the
/// threads; `shutdown()` drains in-flight work and flushes every offset.
pub struct TailCoordinator {
    cancel: CancellationToken,
    coordinator: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    active: Arc<Mutex<Vec<PathBuf>>>,
}

impl TailCoordinator {
    /// Validate the config and start tailing with the system clock.
    pub fn start(config: TailConfig, sink: Arc<dyn LineSink>) -> Result<Self> {
        Self::start_with_clock(config, sink, Arc::new(SystemClock))
    }

    /// Start tailing with an injected clock.
    pub fn start_with_clock(
        config: TailConfig,
        sink: Arc<dyn LineSink>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;

        let file_name = config
            .file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| Error::Config("file path has no usable file name".into()))?;
        let pattern = LogNamePattern::detect(&file_name)?;
        let literal = if pattern.is_none() {
            Some(config.file.clone())
        } else {
            None
        };
        let dir = config
            .file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let watcher = create_watcher(config.watch_mode, config.fetch_interval)?;
        let cancel = CancellationToken::new();
        let active = Arc::new(Mutex::new(Vec::new()));

        let capacity = config.workers * 2;
        let (work_tx, work_rx) = bounded::<WorkItem>(capacity);
        let (results_tx, results_rx) = bounded::<WorkResult>(capacity);

        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let rx = work_rx.clone();
            let tx = results_tx.clone();
            let sink = sink.clone();
            let handle = std::thread::Builder::new()
                .name(format!("tailfeed-worker-{i}"))
                .spawn(move || worker_loop(rx, tx, sink))?;
            workers.push(handle);
        }

        let inner = Inner {
            config,
            dir,
            pattern,
            literal,
            clock,
            cancel: cancel.clone(),
            watcher,
            files: HashMap::new(),
            resolved: HashSet::new(),
            work_tx,
            results_rx,
            active: active.clone(),
            made_progress: false,
        };
        let coordinator = std::thread::Builder::new()
            .name("tailfeed-coordinator".into())
            .spawn(move || inner.run())?;

        Ok(Self {
            cancel,
            coordinator: Some(coordinator),
            workers,
            active,
        })
    }

    /// Paths currently tailed, refreshed once per scheduling pass.
    pub fn active_files(&self) -> Vec<PathBuf> {
        self.active.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Token observed by the coordinator loop; cancelling it begins shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop tailing: drain in-flight work, flush every offset, join threads.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.coordinator.take() {
            if handle.join().is_err() {
                error!("coordinator thread panicked");
            }
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(
    work_rx: BoundedReceiver<WorkItem>,
    results_tx: BoundedSender<WorkResult>,
    sink: Arc<dyn LineSink>,
) {
    while let Some(mut item) = work_rx.recv_blocking() {
        let outcome = item.cursor.process(sink.as_ref());
        let result = WorkResult {
            path: item.path,
            cursor: item.cursor,
            outcome,
        };
        if results_tx.send_blocking(result).is_err() {
            return;
        }
    }
}

struct Inner {
    config: TailConfig,
    dir: PathBuf,
    pattern: Option<LogNamePattern>,
    literal: Option<PathBuf>,
    clock: SharedClock,
    cancel: CancellationToken,
    watcher: Box<dyn DirWatcher>,
    files: HashMap<PathBuf, TailedFile>,
    /// Canonical targets already covered by some tailed path.
    resolved: HashSet<PathBuf>,
    work_tx: BoundedSender<WorkItem>,
    results_rx: BoundedReceiver<WorkResult>,
    active: Arc<Mutex<Vec<PathBuf>>>,
    /// Whether any cursor progressed since the last pacing decision.
    made_progress: bool,
}

impl Inner {
    fn run(mut self) {
        if let Err(e) = self.watcher.watch(&self.dir) {
            warn!(dir = ?self.dir, error = %e, "directory watch failed, relying on startup scan");
        }
        self.startup_scan();

        let mut wait = self.config.fetch_interval;
        while !self.cancel.is_cancelled() {
            self.drain_results();
            // Retirement must run while cursors are resident, before dispatch
            // moves them in flight.
            self.retire_pass();
            self.dispatch();
            self.publish_active();

            match self.watcher.recv_timeout(wait) {
                Ok(events) => {
                    for event in events {
                        self.handle_event(event);
                    }
                }
                Err(e) => warn!(error = %e, "watcher receive failed"),
            }

            wait = self.adapt_wait(wait);
        }

        self.drain_shutdown();
    }

    fn startup_scan(&mut self) {
        if let Some(path) = self.literal.clone() {
            self.spawn_cursor(path);
            return;
        }
        match fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    self.consider(entry.path());
                }
            }
            Err(e) => warn!(dir = ?self.dir, error = %e, "startup scan failed"),
        }
    }

    fn handle_event(&mut self, event: FileEvent) {
        match event.kind {
            FileEventKind::Created | FileEventKind::Modified => self.consider(event.path),
            // Cursors notice vanished files on their own.
            FileEventKind::Removed => {}
        }
    }

    /// Discovery: decide whether `path` should be tailed, creating a dated
    /// alias for undated active files.
    fn consider(&mut self, path: PathBuf) {
        if self.files.contains_key(&path) || offset::is_sidecar(&path) {
            return;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return;
        };

        let Some(pattern) = &self.pattern else {
            if Some(&path) == self.literal.as_ref() {
                self.spawn_cursor(path);
            }
            return;
        };

        let today = self.clock.today();
        if pattern.matches(name, today) {
            self.spawn_cursor(path);
        } else if let Some(alias_name) = pattern.undated_alias(name, today) {
            let alias = self.dir.join(&alias_name);
            if self.files.contains_key(&alias) {
                return;
            }
            match pattern::create_alias(&path, &alias) {
                Ok(alias) => {
                    info!(target = ?path, alias = ?alias, "created dated alias for active file");
                    self.spawn_cursor(alias);
                }
                Err(e) => warn!(target = ?path, error = %e, "alias creation failed"),
            }
        }
    }

    fn spawn_cursor(&mut self, path: PathBuf) {
        let canonical = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        if self.resolved.contains(&canonical) {
            debug!(path = ?path, "target already tailed under another name");
            return;
        }
        match Cursor::new(path.clone(), self.config.buffer_size, self.clock.clone()) {
            Ok(cursor) => {
                info!(path = ?path, offset = cursor.committed(), "tailing file");
                self.resolved.insert(canonical.clone());
                self.files.insert(
                    path,
                    TailedFile {
                        slot: Slot::Resident(cursor),
                        canonical,
                        last_progress: self.clock.now(),
                        confirmations: 0,
                        backoff_until: None,
                    },
                );
            }
            Err(e) => error!(path = ?path, error = %e, "cannot open cursor"),
        }
    }

    fn drain_results(&mut self) {
        while let Some(result) = self.results_rx.try_recv() {
            self.restore(result);
        }
    }

    fn restore(&mut self, result: WorkResult) {
        let now = self.clock.now();
        let today = self.clock.today();
        let stale = self.is_stale(&result.path, today);

        let Some(tf) = self.files.get_mut(&result.path) else {
            // Entry vanished while in flight; flush and drop.
            result.cursor.close();
            return;
        };

        match result.outcome {
            Outcome::Progressed(lines) => {
                debug!(path = ?result.path, lines, "progressed");
                tf.slot = Slot::Resident(result.cursor);
                tf.last_progress = now;
                tf.confirmations = 0;
                tf.backoff_until = None;
                self.made_progress = true;
            }
            Outcome::NoNewData => {
                tf.slot = Slot::Resident(result.cursor);
                let idle = now
                    .duration_since(tf.last_progress)
                    .unwrap_or_default();
                if stale && idle >= self.config.idle_grace {
                    tf.confirmations += 1;
                } else {
                    tf.confirmations = 0;
                }
            }
            Outcome::RotationDetected => {
                info!(path = ?result.path, "rotation detected, reopening at start");
                result.cursor.close();
                match Cursor::new(
                    result.path.clone(),
                    self.config.buffer_size,
                    self.clock.clone(),
                ) {
                    Ok(cursor) => {
                        tf.slot = Slot::Resident(cursor);
                        tf.last_progress = now;
                        tf.confirmations = 0;
                    }
                    Err(e) => {
                        error!(path = ?result.path, error = %e, "reopen after rotation failed");
                        if let Some(tf) = self.files.remove(&result.path) {
                            self.resolved.remove(&tf.canonical);
                        }
                    }
                }
            }
            Outcome::Failed(kind) => {
                warn!(path = ?result.path, ?kind, "cursor failing, backing off");
                tf.slot = Slot::Resident(result.cursor);
                tf.backoff_until = Some(now + self.config.max_fetch_interval);
            }
        }
    }

    fn dispatch(&mut self) {
        let now = self.clock.now();
        let due: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|(_, tf)| {
                matches!(tf.slot, Slot::Resident(_))
                    && !tf.backoff_until.is_some_and(|until| now < until)
            })
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            // Keep the results side flowing so workers never block on a full
            // results channel while work is still being handed out.
            self.drain_results();

            let Some(tf) = self.files.get_mut(&path) else {
                continue;
            };
            let slot = std::mem::replace(&mut tf.slot, Slot::InFlight);
            let Slot::Resident(cursor) = slot else {
                continue;
            };
            match self.work_tx.try_send(WorkItem { path, cursor }) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    // Queue is full; the cursor stays resident and is
                    // rescheduled on the next pass.
                    if let Some(tf) = self.files.get_mut(&item.path) {
                        tf.slot = Slot::Resident(item.cursor);
                    }
                    return;
                }
                Err(TrySendError::Closed(item)) => {
                    error!("worker pool unavailable, stopping");
                    item.cursor.close();
                    self.cancel.cancel();
                    return;
                }
            }
        }
    }

    /// Close cursors for files no longer matching today once they have been
    /// idle past the grace period and confirmed idle enough extra times.
    fn retire_pass(&mut self) {
        if self.pattern.is_none() {
            return;
        }
        let today = self.clock.today();
        let retire: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|(path, tf)| {
                matches!(tf.slot, Slot::Resident(_))
                    && tf.confirmations >= self.config.retire_confirmations
                    && self.is_stale(path, today)
            })
            .map(|(path, _)| path.clone())
            .collect();

        for path in retire {
            if let Some(tf) = self.files.remove(&path) {
                info!(path = ?path, "retiring idle cursor");
                self.resolved.remove(&tf.canonical);
                if let Slot::Resident(cursor) = tf.slot {
                    cursor.close();
                }
            }
        }
    }

    fn is_stale(&self, path: &Path, today: chrono::NaiveDate) -> bool {
        let Some(pattern) = &self.pattern else {
            return false;
        };
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|name| !pattern.matches(name, today))
            .unwrap_or(false)
    }

    fn adapt_wait(&mut self, wait: Duration) -> Duration {
        let progressed = std::mem::take(&mut self.made_progress);
        next_wait(wait, progressed, self.work_tx.len(), &self.config)
    }

    fn publish_active(&self) {
        if let Ok(mut active) = self.active.lock() {
            *active = self.files.keys().cloned().collect();
        }
    }

    fn drain_shutdown(&mut self) {
        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        loop {
            let in_flight = self
                .files
                .values()
                .filter(|tf| matches!(tf.slot, Slot::InFlight))
                .count();
            if in_flight == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(in_flight, "shutdown drain timed out");
                break;
            }
            match self.results_rx.recv_timeout(deadline - now) {
                Some(result) => self.restore(result),
                None => break,
            }
        }

        for (path, tf) in self.files.drain() {
            if let Slot::Resident(cursor) = tf.slot {
                debug!(path = ?path, "closing cursor");
                cursor.close();
            }
        }
        self.publish_active();
    }
}

/// Pacing: lengthen the wait while workers are behind; shorten it only once
/// every cursor is caught up to file end; hold steady while progressing.
fn next_wait(wait: Duration, progressed: bool, queued: usize, config: &TailConfig) -> Duration {
    if queued >= config.workers {
        (wait * 2).min(config.max_fetch_interval)
    } else if !progressed {
        (wait / 2).max(config.min_fetch_interval)
    } else {
        wait.clamp(config.min_fetch_interval, config.max_fetch_interval)
    }
}
