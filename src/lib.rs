// SPDX-License-Identifier: Apache-2.0

//! Durable, rotation-aware log-file tailing.
//!
//! `tailfeed` continuously follows append-only log files, delivering each
//! complete line to a [`LineSink`] exactly in file order and persisting the
//! read offset in a binary sidecar so a restart resumes where it left off.
//! Files are discovered through a date-templated name pattern
//! (`access.log.${yyyy-MM-dd}`); undated active files are normalized with a
//! dated symlink alias, and cursors for files that are no longer current are
//! retired after a grace period.
//!
//! The crate emits `tracing` events but installs no subscriber; delivery,
//! config parsing, and process lifecycle belong to the host.

pub mod bounded_channel;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod offset;
pub mod pattern;
pub mod sink;
pub mod watcher;

pub use clock::{Clock, SharedClock, SystemClock};
pub use config::{TailConfig, DEFAULT_BUFFER_SIZE};
pub use coordinator::TailCoordinator;
pub use cursor::{Cursor, FailureKind, FileId, Outcome};
pub use error::{Error, Result};
pub use offset::OffsetStore;
pub use pattern::LogNamePattern;
pub use sink::LineSink;
pub use watcher::{DirWatcher, FileEvent, FileEventKind, WatchMode};
