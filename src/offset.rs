// SPDX-License-Identifier: Apache-2.0

//! Durable read-offset storage.
//!
//! Each tailed file gets a hidden sidecar next to it (`.NAME.offset`) holding
//! a single little-endian u64: the absolute offset of the next unread byte.
//! Commits overwrite the slot in place and flush, so the persisted value is
//! crash-durable at 8-byte granularity. The value never runs ahead of the last
//! line boundary actually delivered downstream.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};

const SLOT_SIZE: u64 = 8;

/// Single-slot durable offset ledger for one tailed file.
#[derive(Debug)]
pub struct OffsetStore {
    sidecar_path: PathBuf,
    file: File,
    value: u64,
}

impl OffsetStore {
    /// Open the offset store for `log_path`'s sidecar, creating it
    /// zero-initialized if absent.
    pub fn open(log_path: &Path) -> Result<Self> {
        let sidecar_path = sidecar_path_for(log_path);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&sidecar_path)
            .map_err(|e| Error::Storage {
                path: sidecar_path.clone(),
                message: format!("cannot open sidecar: {e}"),
            })?;

        let len = file
            .metadata()
            .map_err(|e| Error::Storage {
                path: sidecar_path.clone(),
                message: format!("cannot stat sidecar: {e}"),
            })?
            .len();

        let value = if len < SLOT_SIZE {
            // Fresh (or torn short) sidecar: initialize to zero.
            write_slot(&mut file, 0).map_err(|e| Error::Storage {
                path: sidecar_path.clone(),
                message: format!("cannot initialize sidecar: {e}"),
            })?;
            0
        } else {
            let mut buf = [0u8; SLOT_SIZE as usize];
            file.seek(SeekFrom::Start(0)).and_then(|_| file.read_exact(&mut buf)).map_err(
                |e| Error::Storage {
                    path: sidecar_path.clone(),
                    message: format!("cannot read sidecar: {e}"),
                },
            )?;
            u64::from_le_bytes(buf)
        };

        Ok(Self {
            sidecar_path,
            file,
            value,
        })
    }

    /// The last committed offset.
    pub fn current_value(&self) -> u64 {
        self.value
    }

    /// Durably overwrite the stored offset with an absolute value.
    pub fn commit(&mut self, new_value: u64) -> Result<()> {
        write_slot(&mut self.file, new_value).map_err(|e| Error::Storage {
            path: self.sidecar_path.clone(),
            message: format!("commit failed: {e}"),
        })?;
        self.value = new_value;
        Ok(())
    }

    /// Flush and release the sidecar. Failures degrade durability but are not
    /// fatal to the caller; they are logged and swallowed.
    pub fn close(self) {
        if let Err(e) = self.file.sync_all() {
            warn!(sidecar = ?self.sidecar_path, error = %e, "offset sidecar close flush failed");
        }
    }

    #[cfg(test)]
    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar_path
    }
}

fn write_slot(file: &mut File, value: u64) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&value.to_le_bytes())?;
    file.sync_data()
}

/// Derive the sidecar path for a log file: a dot-prefixed sibling with an
/// `.offset` suffix.
pub fn sidecar_path_for(log_path: &Path) -> PathBuf {
    let name = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sidecar_name = format!(".{name}.offset");
    match log_path.parent() {
        Some(parent) => parent.join(sidecar_name),
        None => PathBuf::from(sidecar_name),
    }
}

/// Whether a path names an offset sidecar. Discovery must skip these.
pub fn is_sidecar(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(".offset"))
        .unwrap_or(false)
}
