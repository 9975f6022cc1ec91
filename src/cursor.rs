// SPDX-License-Identifier: Apache-2.0

//! Per-file tailing engine.
//!
//! A [`Cursor`] owns the read handle, a fixed-capacity buffer, and the durable
//! [`OffsetStore`] for exactly one file path. Each `process()` call reads the
//! newly appended bytes, delivers every complete line downstream (one event
//! per line, in file order), and commits the offset once at the end of the
//! call. Bytes after the last newline are carried as leftover into the next
//! call, so a partial trailing line is never delivered as if it were complete.
//!
//! When a read reaches end-of-stream the cursor compares the file's length,
//! mtime, and inode against its last snapshot to tell quiescence, truncation,
//! and rotation apart. Classification is conservative: contradictory signals
//! resolve to "keep reading", never to a forced rotation.

use std::fs::{File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::error::Result;
use crate::offset::OffsetStore;
use crate::sink::LineSink;

/// Pause before re-checking an ambiguous size/mtime observation.
const ROTATION_CHECK_PAUSE: Duration = Duration::from_millis(100);
/// Pause before concluding a vanished file is really gone.
const MISSING_RECHECK_PAUSE: Duration = Duration::from_millis(100);
/// Failures tolerated before `process` reports `Failed`.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Result of one `process()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered this many events (lines or oversized chunks).
    Progressed(usize),
    /// Nothing new; the file is quiescent, missing, or was truncated.
    NoNewData,
    /// The file was replaced; the cursor reset itself to offset 0 and the
    /// caller should redrive it against the replacement.
    RotationDetected,
    /// More than `MAX_CONSECUTIVE_FAILURES` consecutive failures.
    Failed(FailureKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Io,
    Storage,
}

/// File identity that survives renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

/// Live tailing state for one file path.
pub struct Cursor {
    path: PathBuf,
    file: Option<File>,
    file_id: Option<FileId>,
    store: OffsetStore,
    buffer_size: usize,
    /// Read-but-undelivered bytes since the last line boundary.
    leftover: Vec<u8>,
    last_len: u64,
    last_mtime: Option<SystemTime>,
    consecutive_failures: u32,
    clock: SharedClock,
}

impl Cursor {
    /// Create a cursor for `path`. The offset sidecar is opened (and created
    /// if absent) eagerly; the log file itself is opened lazily, so a cursor
    /// may exist for a file that has not appeared yet.
    pub fn new(path: PathBuf, buffer_size: usize, clock: SharedClock) -> Result<Self> {
        let store = OffsetStore::open(&path)?;
        Ok(Self {
            path,
            file: None,
            file_id: None,
            store,
            buffer_size,
            leftover: Vec::new(),
            last_len: 0,
            last_mtime: None,
            consecutive_failures: 0,
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the last delivered line boundary.
    pub fn committed(&self) -> u64 {
        self.store.current_value()
    }

    /// Drive the cursor: read, extract lines, deliver, commit.
    pub fn process(&mut self, sink: &dyn LineSink) -> Outcome {
        if self.file.is_none() && !self.try_open() {
            return if self.consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                Outcome::Failed(FailureKind::Io)
            } else {
                Outcome::NoNewData
            };
        }

        let mut events = 0usize;
        let mut consumed_total = 0u64;
        let mut read_anything = false;

        loop {
            let read_pos = self.committed() + consumed_total + self.leftover.len() as u64;
            let want = self.buffer_size - self.leftover.len();
            let mut chunk = vec![0u8; want];

            let Some(file) = self.file.as_mut() else {
                return Outcome::NoNewData;
            };
            let n = {
                match file
                    .seek(SeekFrom::Start(read_pos))
                    .and_then(|_| file.read(&mut chunk))
                {
                    Ok(n) => n,
                    Err(e) => {
                        return self.io_failure("read failed", &e);
                    }
                }
            };

            if n == 0 {
                break;
            }
            read_anything = true;
            self.consecutive_failures = 0;
            self.leftover.extend_from_slice(&chunk[..n]);

            // Deliver every complete line in the buffer.
            let mut line_start = 0usize;
            for i in newline_positions(&self.leftover) {
                sink.deliver(&self.leftover[line_start..i]);
                events += 1;
                line_start = i + 1;
            }
            if line_start > 0 {
                self.leftover.drain(..line_start);
                consumed_total += line_start as u64;
            }

            // A full buffer with no newline: this line exceeds the buffer.
            // Force-flush the whole region as one chunk rather than growing
            // without bound or dropping data.
            if self.leftover.len() >= self.buffer_size {
                sink.deliver(&self.leftover);
                events += 1;
                consumed_total += self.leftover.len() as u64;
                self.leftover.clear();
            }
        }

        if consumed_total > 0 {
            let new_offset = self.committed() + consumed_total;
            if let Err(e) = self.store.commit(new_offset) {
                warn!(path = ?self.path, error = %e, "offset commit failed");
                self.consecutive_failures += 1;
                return if self.consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                    Outcome::Failed(FailureKind::Storage)
                } else {
                    Outcome::NoNewData
                };
            }
        }

        if read_anything {
            self.refresh_snapshot();
            return Outcome::Progressed(events);
        }

        self.classify_eof(sink)
    }

    /// Close the cursor, flushing the offset store. An ordinary close never
    /// force-flushes an incomplete trailing line.
    pub fn close(self) {
        self.store.close();
    }

    fn try_open(&mut self) -> bool {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return false;
            }
            Err(e) => {
                self.consecutive_failures += 1;
                debug!(path = ?self.path, error = %e, "open failed");
                return false;
            }
        };

        let metadata = match file.metadata() {
            Ok(m) => m,
            Err(e) => {
                self.consecutive_failures += 1;
                debug!(path = ?self.path, error = %e, "stat after open failed");
                return false;
            }
        };

        // A sidecar from a previous, larger incarnation would point past the
        // end of this file. Clamp to the current length.
        if self.committed() + self.leftover.len() as u64 > metadata.len() {
            debug!(
                path = ?self.path,
                committed = self.committed(),
                len = metadata.len(),
                "stored offset beyond file end, resetting to length"
            );
            self.leftover.clear();
            if let Err(e) = self.store.commit(metadata.len()) {
                warn!(path = ?self.path, error = %e, "offset reset failed");
            }
        }

        self.last_len = metadata.len();
        self.last_mtime = metadata.modified().ok();
        self.file_id = Some(FileId::from_metadata(&metadata));
        self.file = Some(file);
        true
    }

    /// End-of-stream: decide between quiescence, truncation, and rotation.
    fn classify_eof(&mut self, sink: &dyn LineSink) -> Outcome {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Double-check: an in-flight rename can make the path vanish
                // for a moment.
                self.clock.sleep(MISSING_RECHECK_PAUSE);
                return match std::fs::metadata(&self.path) {
                    Ok(m) => self.classify_with(&m, sink),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!(path = ?self.path, "file gone, treating as rotation");
                        self.rotate(sink)
                    }
                    // Any other stat error is transient, not a rotation.
                    Err(e) => self.io_failure("re-stat failed", &e),
                };
            }
            Err(e) => return self.io_failure("stat failed", &e),
        };

        self.classify_with(&metadata, sink)
    }

    fn classify_with(&mut self, metadata: &Metadata, sink: &dyn LineSink) -> Outcome {
        self.consecutive_failures = 0;

        // Identity first: if the path now names a different inode, the file
        // we hold was rotated away regardless of what the sizes say.
        let path_id = FileId::from_metadata(metadata);
        if self.file_id.is_some() && self.file_id != Some(path_id) {
            debug!(path = ?self.path, "inode changed, rotation detected");
            return self.rotate(sink);
        }

        let len = metadata.len();
        let mtime = metadata.modified().ok();

        if len < self.last_len {
            // Truncation, not rotation: fall back to the new end of file.
            debug!(
                path = ?self.path,
                from = self.committed(),
                to = len,
                "file truncated, resetting offset"
            );
            self.leftover.clear();
            if let Err(e) = self.store.commit(len) {
                warn!(path = ?self.path, error = %e, "offset reset failed");
            }
            self.last_len = len;
            self.last_mtime = mtime;
            return Outcome::NoNewData;
        }

        if len == self.last_len {
            if mtime == self.last_mtime {
                return Outcome::NoNewData;
            }
            // Same size, new mtime: possibly a rename-in-place to an
            // equally-sized file. Pause and re-check; if the size moved in
            // the meantime the file is alive and rotation handling is
            // aborted.
            self.clock.sleep(ROTATION_CHECK_PAUSE);
            return match std::fs::metadata(&self.path) {
                Ok(again) => {
                    let again_id = FileId::from_metadata(&again);
                    if self.file_id.is_some() && self.file_id != Some(again_id) {
                        self.rotate(sink)
                    } else {
                        // Same inode: a touch or an append racing with us.
                        self.last_mtime = again.modified().ok();
                        Outcome::NoNewData
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.rotate(sink),
                Err(e) => self.io_failure("re-stat failed", &e),
            };
        }

        // len > last_len while our handle saw EOF: bytes landed after the
        // read. They surface on the next call; leave the snapshot length
        // untouched so progress is re-attempted.
        self.last_mtime = mtime;
        Outcome::NoNewData
    }

    /// The path now serves a replacement file. Flush the pending partial line
    /// as a final (possibly incomplete) event, drop the old handle, and reset
    /// to offset 0.
    fn rotate(&mut self, sink: &dyn LineSink) -> Outcome {
        if !self.leftover.is_empty() {
            sink.deliver(&self.leftover);
            self.leftover.clear();
        }
        self.file = None;
        self.file_id = None;
        self.last_len = 0;
        self.last_mtime = None;
        if let Err(e) = self.store.commit(0) {
            warn!(path = ?self.path, error = %e, "offset reset after rotation failed");
        }
        Outcome::RotationDetected
    }

    fn io_failure(&mut self, what: &str, e: &std::io::Error) -> Outcome {
        self.consecutive_failures += 1;
        debug!(
            path = ?self.path,
            failures = self.consecutive_failures,
            error = %e,
            "{what}"
        );
        if self.consecutive_failures > MAX_CONSECUTIVE_FAILURES {
            Outcome::Failed(FailureKind::Io)
        } else {
            Outcome::NoNewData
        }
    }

    fn refresh_snapshot(&mut self) {
        if let Some(file) = &self.file {
            if let Ok(metadata) = file.metadata() {
                self.last_len = metadata.len();
                self.last_mtime = metadata.modified().ok();
            }
        }
    }
}

/// Indexes of every newline byte in `buf`.
fn newline_positions(buf: &[u8]) -> impl Iterator<Item = usize> + '_ {
    buf.iter()
        .enumerate()
        .filter_map(|(i, &b)| (b == b'\n').then_some(i))
}
