// SPDX-License-Identifier: MIT

//! Engine configuration.
//!
//! Generalizes `hdds-persistence/src/config.rs`'s builder-with-validation
//! shape: a plain `Config` struct, a `ConfigBuilder` for fluent
//! construction, and a `validate()` step (grounded on
//! `original_source/src/options.cpp`'s option checks) that is the source
//! of the `ConfigInvalid` error kind.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default per-file cap, in bytes: 1 GiB.
pub const DEFAULT_LOG_FILE_SIZE_BYTES: u64 = 1024 * 1024 * 1024;

/// Default active consolidation-array slots.
pub const DEFAULT_ACTIVE_SLOTS: usize = 3;

/// Engine configuration. See spec §6 for the option list this mirrors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding log files and (unless relocated) the block index.
    pub logpath: PathBuf,

    /// On start, delete existing log files and the block index.
    pub format: bool,

    /// Enable old-file deletion by the recycler hook.
    pub log_recycle: bool,

    /// Per-file cap in bytes, rounded down to a multiple of the page size.
    pub log_file_size: u64,

    /// Recycling threshold; 0 means unlimited.
    pub log_max_files: usize,

    /// Block-index file name or path.
    pub log_index_path: String,

    /// Interpret `log_index_path` relative to `logpath`.
    pub log_index_path_relative: bool,

    /// Number of consolidation-array slots reachable by clock-hand
    /// rotation.
    pub active_slots: usize,

    /// Group-commit watchdog timeout, in milliseconds.
    pub watchdog_timeout_ms: u64,

    /// Ring buffer capacity (number of shared pages in flight).
    pub ring_capacity: usize,

    /// Shared and private log page size, in bytes.
    pub page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logpath: PathBuf::new(),
            format: false,
            log_recycle: false,
            log_file_size: DEFAULT_LOG_FILE_SIZE_BYTES,
            log_max_files: 0,
            log_index_path: "index.db".to_string(),
            log_index_path_relative: true,
            active_slots: DEFAULT_ACTIVE_SLOTS,
            watchdog_timeout_ms: crate::commit::DEFAULT_WATCHDOG_TIMEOUT_MS,
            ring_capacity: 8,
            page_size: crate::page::DEFAULT_PAGE_SIZE,
        }
    }
}

impl Config {
    /// Start a builder rooted at `logpath`.
    pub fn builder(logpath: impl Into<PathBuf>) -> ConfigBuilder {
        let mut builder = ConfigBuilder::default();
        builder.logpath = Some(logpath.into());
        builder
    }

    /// Resolved path to the block-index file.
    pub fn log_index_file(&self) -> PathBuf {
        if self.log_index_path_relative {
            self.logpath.join(&self.log_index_path)
        } else {
            PathBuf::from(&self.log_index_path)
        }
    }

    /// Reject configurations the engine cannot operate under. Mirrors the
    /// option checks of the reference implementation: an empty `logpath`
    /// and a page size smaller than a record header are both fatal at
    /// startup.
    pub fn validate(&self) -> Result<()> {
        if self.logpath.as_os_str().is_empty() {
            return Err(Error::ConfigInvalid("logpath must not be empty".into()));
        }
        if self.page_size < crate::record::HEADER_ALIGNMENT {
            return Err(Error::ConfigInvalid(format!(
                "page_size {} is smaller than a record header",
                self.page_size
            )));
        }
        if self.active_slots == 0 || self.active_slots > crate::carray::ALL_SLOT_COUNT {
            return Err(Error::ConfigInvalid(format!(
                "active_slots must be in 1..={}",
                crate::carray::ALL_SLOT_COUNT
            )));
        }
        if self.ring_capacity == 0 {
            return Err(Error::ConfigInvalid("ring_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Fluent builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    logpath: Option<PathBuf>,
    format: Option<bool>,
    log_recycle: Option<bool>,
    log_file_size: Option<u64>,
    log_max_files: Option<usize>,
    log_index_path: Option<String>,
    log_index_path_relative: Option<bool>,
    active_slots: Option<usize>,
    watchdog_timeout_ms: Option<u64>,
    ring_capacity: Option<usize>,
    page_size: Option<usize>,
}

impl ConfigBuilder {
    pub fn logpath(mut self, path: impl AsRef<Path>) -> Self {
        self.logpath = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn format(mut self, format: bool) -> Self {
        self.format = Some(format);
        self
    }

    pub fn log_recycle(mut self, recycle: bool) -> Self {
        self.log_recycle = Some(recycle);
        self
    }

    pub fn log_file_size(mut self, bytes: u64) -> Self {
        self.log_file_size = Some(bytes);
        self
    }

    pub fn log_max_files(mut self, count: usize) -> Self {
        self.log_max_files = Some(count);
        self
    }

    pub fn log_index_path(mut self, path: impl Into<String>) -> Self {
        self.log_index_path = Some(path.into());
        self
    }

    pub fn log_index_path_relative(mut self, relative: bool) -> Self {
        self.log_index_path_relative = Some(relative);
        self
    }

    pub fn active_slots(mut self, count: usize) -> Self {
        self.active_slots = Some(count);
        self
    }

    pub fn watchdog_timeout_ms(mut self, ms: u64) -> Self {
        self.watchdog_timeout_ms = Some(ms);
        self
    }

    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = Some(capacity);
        self
    }

    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = Some(bytes);
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<Config> {
        let defaults = Config::default();
        let config = Config {
            logpath: self.logpath.unwrap_or(defaults.logpath),
            format: self.format.unwrap_or(defaults.format),
            log_recycle: self.log_recycle.unwrap_or(defaults.log_recycle),
            log_file_size: self.log_file_size.unwrap_or(defaults.log_file_size),
            log_max_files: self.log_max_files.unwrap_or(defaults.log_max_files),
            log_index_path: self.log_index_path.unwrap_or(defaults.log_index_path),
            log_index_path_relative: self
                .log_index_path_relative
                .unwrap_or(defaults.log_index_path_relative),
            active_slots: self.active_slots.unwrap_or(defaults.active_slots),
            watchdog_timeout_ms: self.watchdog_timeout_ms.unwrap_or(defaults.watchdog_timeout_ms),
            ring_capacity: self.ring_capacity.unwrap_or(defaults.ring_capacity),
            page_size: self.page_size.unwrap_or(defaults.page_size),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_overrides_over_defaults() {
        let config = Config::builder("/tmp/calog-test")
            .log_file_size(2048)
            .active_slots(5)
            .build()
            .unwrap();
        assert_eq!(config.log_file_size, 2048);
        assert_eq!(config.active_slots, 5);
        assert_eq!(config.log_recycle, false);
    }

    #[test]
    fn empty_logpath_is_rejected() {
        let err = Config::builder("").build().unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn log_index_file_resolves_relative_to_logpath() {
        let config = Config::builder("/var/lib/calog").build().unwrap();
        assert_eq!(config.log_index_file(), PathBuf::from("/var/lib/calog/index.db"));
    }

    #[test]
    fn log_index_file_absolute_when_not_relative() {
        let config = Config::builder("/var/lib/calog")
            .log_index_path("/elsewhere/index.db")
            .log_index_path_relative(false)
            .build()
            .unwrap();
        assert_eq!(config.log_index_file(), PathBuf::from("/elsewhere/index.db"));
    }
}
