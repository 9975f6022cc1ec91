// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset storage error for {path}: {message}")]
    Storage { path: PathBuf, message: String },

    #[error("invalid log name pattern: {0}")]
    Pattern(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("watcher error: {0}")]
    Watcher(String),

    #[error("channel disconnected")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
