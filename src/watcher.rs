// SPDX-License-Identifier: Apache-2.0

//! Directory-watch backends.
//!
//! Two strategies: native OS notifications via the `notify` crate (inotify,
//! FSEvents, ReadDirectoryChangesW), and a polling scanner for environments
//! where native watching is unreliable (NFS and friends). `Auto` tries native
//! first and falls back to polling. Both backends expose a
//! non-blocking-with-timeout receive so the coordinator loop stays responsive
//! to shutdown.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant, SystemTime};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Kind of change observed in the watched directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Removed,
}

/// A change to one path in the watched directory.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
}

/// Directory watcher abstraction.
pub trait DirWatcher: Send {
    /// Start watching a directory (non-recursive).
    fn watch(&mut self, dir: &Path) -> Result<()>;

    /// Receive pending events, blocking at most `timeout`. An empty vec means
    /// the timeout expired quietly.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<FileEvent>>;

    /// Receive already-queued events without blocking.
    fn try_recv(&mut self) -> Result<Vec<FileEvent>>;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}

/// Watch strategy selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Native notifications, falling back to polling on failure.
    #[default]
    Auto,
    /// Native notifications only.
    Native,
    /// Polling only. Use for network file systems.
    Poll,
}

/// Build a watcher for `mode`. Poll-based watchers scan on `poll_interval`.
pub fn create_watcher(mode: WatchMode, poll_interval: Duration) -> Result<Box<dyn DirWatcher>> {
    match mode {
        WatchMode::Native => Ok(Box::new(NotifyWatcher::new()?)),
        WatchMode::Poll => Ok(Box::new(PollWatcher::new(poll_interval))),
        WatchMode::Auto => match NotifyWatcher::new() {
            Ok(w) => {
                info!(backend = w.backend_name(), "using native directory watcher");
                Ok(Box::new(w))
            }
            Err(e) => {
                warn!(error = %e, "native watching unavailable, falling back to polling");
                Ok(Box::new(PollWatcher::new(poll_interval)))
            }
        },
    }
}

/// Native watcher backed by the `notify` crate.
pub struct NotifyWatcher {
    watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
}

impl NotifyWatcher {
    pub fn new() -> Result<Self> {
        let (tx, rx) = channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .map_err(|e| Error::Watcher(e.to_string()))?;

        Ok(Self {
            watcher,
            events: rx,
        })
    }

    fn convert(event: Event) -> Vec<FileEvent> {
        let kind = match event.kind {
            EventKind::Create(_) => FileEventKind::Created,
            EventKind::Modify(_) => FileEventKind::Modified,
            EventKind::Remove(_) => FileEventKind::Removed,
            _ => return Vec::new(),
        };
        event
            .paths
            .into_iter()
            .map(|path| FileEvent { kind, path })
            .collect()
    }

    fn drain_pending(&mut self, into: &mut Vec<FileEvent>) -> Result<()> {
        loop {
            match self.events.try_recv() {
                Ok(Ok(event)) => into.extend(Self::convert(event)),
                Ok(Err(e)) => warn!(error = %e, "directory watch event error"),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    return Err(Error::Watcher("notify channel disconnected".into()))
                }
            }
        }
    }
}

impl DirWatcher for NotifyWatcher {
    fn watch(&mut self, dir: &Path) -> Result<()> {
        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watcher(e.to_string()))
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<FileEvent>> {
        let mut events = Vec::new();
        match self.events.recv_timeout(timeout) {
            Ok(Ok(event)) => events.extend(Self::convert(event)),
            Ok(Err(e)) => warn!(error = %e, "directory watch event error"),
            Err(RecvTimeoutError::Timeout) => return Ok(events),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::Watcher("notify channel disconnected".into()))
            }
        }
        // Batch up anything else already queued.
        self.drain_pending(&mut events)?;
        Ok(events)
    }

    fn try_recv(&mut self) -> Result<Vec<FileEvent>> {
        let mut events = Vec::new();
        self.drain_pending(&mut events)?;
        Ok(events)
    }

    fn backend_name(&self) -> &'static str {
        #[cfg(target_os = "linux")]
        {
            "inotify"
        }
        #[cfg(target_os = "macos")]
        {
            "fsevents"
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            "native"
        }
    }
}

/// Snapshot used by the polling watcher to detect changes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryState {
    len: u64,
    modified: Option<SystemTime>,
}

/// Polling watcher: scans the directory on an interval and diffs length and
/// mtime against the previous pass.
pub struct PollWatcher {
    dirs: Vec<PathBuf>,
    known: HashMap<PathBuf, EntryState>,
    poll_interval: Duration,
    last_scan: Option<Instant>,
    pending: Vec<FileEvent>,
}

impl PollWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            dirs: Vec::new(),
            known: HashMap::new(),
            poll_interval,
            last_scan: None,
            pending: Vec::new(),
        }
    }

    fn scan(&mut self) {
        let mut seen: HashMap<PathBuf, EntryState> = HashMap::new();
        for dir in &self.dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = ?dir, error = %e, "directory scan failed");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(metadata) = fs::metadata(&path) else {
                    continue;
                };
                if !metadata.is_file() {
                    continue;
                }
                seen.insert(
                    path,
                    EntryState {
                        len: metadata.len(),
                        modified: metadata.modified().ok(),
                    },
                );
            }
        }

        for (path, state) in &seen {
            match self.known.get(path) {
                None => self.pending.push(FileEvent {
                    kind: FileEventKind::Created,
                    path: path.clone(),
                }),
                Some(old) if old != state => self.pending.push(FileEvent {
                    kind: FileEventKind::Modified,
                    path: path.clone(),
                }),
                Some(_) => {}
            }
        }
        for path in self.known.keys() {
            if !seen.contains_key(path) {
                self.pending.push(FileEvent {
                    kind: FileEventKind::Removed,
                    path: path.clone(),
                });
            }
        }

        self.known = seen;
        self.last_scan = Some(Instant::now());
    }

    fn scan_due(&self) -> bool {
        match self.last_scan {
            None => true,
            Some(at) => at.elapsed() >= self.poll_interval,
        }
    }
}

impl DirWatcher for PollWatcher {
    fn watch(&mut self, dir: &Path) -> Result<()> {
        let dir = dir.to_path_buf();
        if !self.dirs.contains(&dir) {
            self.dirs.push(dir);
        }
        // Baseline scan; existing files produce no events.
        self.scan();
        self.pending.clear();
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<FileEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.scan_due() {
                self.scan();
            }
            if !self.pending.is_empty() {
                return Ok(std::mem::take(&mut self.pending));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let until_scan = self
                .last_scan
                .map(|at| self.poll_interval.saturating_sub(at.elapsed()))
                .unwrap_or_default();
            let nap = until_scan.min(deadline - now);
            if !nap.is_zero() {
                std::thread::sleep(nap);
            }
        }
    }

    fn try_recv(&mut self) -> Result<Vec<FileEvent>> {
        if self.scan_due() {
            self.scan();
        }
        Ok(std::mem::take(&mut self.pending))
    }

    fn backend_name(&self) -> &'static str {
        "poll"
    }
}
