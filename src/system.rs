// SPDX-License-Identifier: MIT

//! The `System` value: explicit ownership of every long-lived piece of the
//! engine, replacing the process-wide singleton (`SysEnv`-style global)
//! the teacher's DDS persistence layer and the original logging engine
//! both avoid differently. Per spec.md §9, there is no global mutable
//! state here except the thread-local transaction handle in
//! [`crate::txn`]; everything else is reached through a `System` passed by
//! shared reference (an `Arc`, so transaction contexts on other threads
//! can hold their own clone).

use crate::carray::ConsolidationArray;
use crate::commit::{CommitBuffer, DEFAULT_WATCHDOG_TIMEOUT_MS};
use crate::config::Config;
use crate::file_log::FileBasedLog;
use crate::flusher::Flusher;
use crate::index::{BlockIndex, SqliteBlockIndex};
use crate::ring::{EpochRing, INITIAL_EPOCH};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Owns the ring, consolidation array, commit buffer, flusher thread,
/// watchdog thread, file-based log, and block index for one logical
/// engine instance.
pub struct System {
    commit_buffer: Arc<CommitBuffer>,
    flusher: Arc<Flusher>,
    log: Arc<FileBasedLog>,
    index: Arc<dyn BlockIndex>,
    ring: EpochRing,
    page_size: usize,
    _watchdog: crate::commit::Watchdog,
}

impl System {
    /// Assemble a fully wired engine from `config`: opens the block index
    /// and file log, then spins up the commit buffer's watchdog and the
    /// flusher thread.
    pub fn open(config: Config) -> crate::error::Result<Self> {
        config.validate()?;
        let index: Arc<dyn BlockIndex> = Arc::new(SqliteBlockIndex::open(&config.log_index_file())?);
        let log = Arc::new(FileBasedLog::open(config.clone(), index.clone())?);
        Self::assemble_with(config, log, index)
    }

    /// Wire a `System` around an already-open log and index, with default
    /// ring/slot/timeout settings. Primarily for tests that need direct
    /// access to the log/index before the engine exists.
    pub fn assemble(log: Arc<FileBasedLog>, index: Arc<dyn BlockIndex>) -> Self {
        Self::assemble_with(Config::default(), log, index).expect("default config is always valid once logpath is set")
    }

    fn assemble_with(config: Config, log: Arc<FileBasedLog>, index: Arc<dyn BlockIndex>) -> crate::error::Result<Self> {
        let ca = ConsolidationArray::new(config.active_slots.max(1));
        let ring = EpochRing::new(config.ring_capacity.max(1), config.page_size);
        let commit_buffer = Arc::new(CommitBuffer::new(ca, ring.clone()));
        let flusher = Flusher::spawn(ring.clone(), log.clone(), INITIAL_EPOCH);
        let timeout_ms = if config.watchdog_timeout_ms == 0 {
            DEFAULT_WATCHDOG_TIMEOUT_MS
        } else {
            config.watchdog_timeout_ms
        };
        let watchdog = commit_buffer.spawn_watchdog(Duration::from_millis(timeout_ms));
        info!(watchdog_timeout_ms = timeout_ms, "engine assembled");
        Ok(Self {
            commit_buffer,
            flusher,
            log,
            index,
            ring,
            page_size: config.page_size,
            _watchdog: watchdog,
        })
    }

    /// The shared/private log page size every transaction on this engine
    /// must stage into, so a plog's pages always fit within one shared-page
    /// group-commit reservation.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn commit_buffer(&self) -> &CommitBuffer {
        &self.commit_buffer
    }

    pub fn flusher(&self) -> &Flusher {
        &self.flusher
    }

    pub fn log(&self) -> &Arc<FileBasedLog> {
        &self.log
    }

    pub fn index(&self) -> &Arc<dyn BlockIndex> {
        &self.index
    }

    /// Drain the ring and stop the flusher. In-flight transactions must
    /// abort; commit waiters woken after this point see `false`.
    pub fn shutdown(&self) {
        info!("engine shutting down");
        self.ring.shutdown();
        let _ = self.flusher.join();
    }
}
