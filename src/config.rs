// SPDX-License-Identifier: Apache-2.0

//! Resolved tailer configuration.
//!
//! The host resolves and supplies this; the tailer only consumes it.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::watcher::WatchMode;

/// Default read buffer size: 400 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 409_600;

/// Configuration for a [`TailCoordinator`](crate::coordinator::TailCoordinator).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// Path to the log file, or a date-templated path such as
    /// `/var/log/access.log.${yyyy-MM-dd}`.
    pub file: PathBuf,
    /// Read buffer size per cursor; also the maximum size of a single
    /// delivered event.
    pub buffer_size: usize,
    /// Baseline interval between scheduling passes.
    pub fetch_interval: Duration,
    /// Lower bound for the adaptive wait when all cursors are caught up.
    pub min_fetch_interval: Duration,
    /// Upper bound for the adaptive wait under downstream backpressure.
    pub max_fetch_interval: Duration,
    /// Wall-clock idle time after which a no-longer-matching file becomes a
    /// retirement candidate.
    pub idle_grace: Duration,
    /// Additional idle confirmation passes before a candidate is closed,
    /// tolerating slow final writers.
    pub retire_confirmations: u32,
    /// Worker pool size for per-cursor processing.
    pub workers: usize,
    /// Directory watch strategy.
    pub watch_mode: WatchMode,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            fetch_interval: Duration::from_secs(1),
            min_fetch_interval: Duration::from_millis(250),
            max_fetch_interval: Duration::from_secs(5),
            idle_grace: Duration::from_secs(300),
            retire_confirmations: 3,
            workers: 4,
            watch_mode: WatchMode::Auto,
        }
    }
}

impl TailConfig {
    pub fn validate(&self) -> Result<()> {
        if self.file.as_os_str().is_empty() {
            return Err(Error::Config("file path must be set".into()));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be positive".into()));
        }
        if self.fetch_interval.is_zero() {
            return Err(Error::Config("fetch_interval must be positive".into()));
        }
        if self.min_fetch_interval > self.max_fetch_interval {
            return Err(Error::Config(
                "min_fetch_interval must not exceed max_fetch_interval".into(),
            ));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_invalid_without_file() {
        let config = TailConfig::default();
        assert!(config.validate().is_err());

        let config = TailConfig {
            file: PathBuf::from("/var/log/app.log"),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_workers_and_buffer() {
        let base = TailConfig {
            file: PathBuf::from("/var/log/app.log"),
            ..Default::default()
        };

        let config = TailConfig { workers: 0, ..base.clone() };
        assert!(config.validate().is_err());

        let config = TailConfig { buffer_size: 0, ..base };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: TailConfig = serde_json::from_str(
            r#"{"file": "/var/log/access.log.${yyyy-MM-dd}", "workers": 2}"#,
        )
        .unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.watch_mode, WatchMode::Auto);
        assert!(config.validate().is_ok());
    }
}
