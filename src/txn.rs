// SPDX-License-Identifier: MIT

//! Transaction context (C3): a thread-local scoped handle over a private
//! log, with guaranteed release on drop.
//!
//! Per spec.md §9's redesign note, the process-wide singleton this
//! mirrors (`SysEnv`-style globals) becomes an explicit [`crate::system::System`]
//! value passed by shared reference, with the thread-local transaction
//! handle as the sole, deliberate exception. The plog itself — not the
//! whole context struct — lives in thread-local storage, so the object
//! logger (C12) can reach it through a typed accessor without the context
//! handing out an address that could outlive its scope.

use crate::error::{Error, Result};
use crate::page::LogPage;
use crate::plog::Plog;
use crate::record::RecordHeader;
use crate::system::System;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static ACTIVE_PLOG: RefCell<Option<Plog>> = RefCell::new(None);
}

/// Forward one record into the active thread's plog. Used by the object
/// logger; fails with [`Error::InactiveContext`] if no context is active.
pub(crate) fn log_into_active(hdr: RecordHeader, payload: &[u8]) -> Result<()> {
    ACTIVE_PLOG.with(|cell| {
        let mut guard = cell.borrow_mut();
        match guard.as_mut() {
            Some(plog) => plog.log(hdr, payload),
            None => Err(Error::InactiveContext(
                "no transaction context is active on this thread".into(),
            )),
        }
    })
}

/// Scoped handle over one transaction's private log. At most one may be
/// active per thread; constructing a second fails fast.
pub struct TransactionContext {
    system: Arc<System>,
    finished: bool,
    auto_commit: bool,
}

impl TransactionContext {
    /// Begin a transaction on the current thread. Aborts on drop unless
    /// `commit()` is called first.
    pub fn begin(system: Arc<System>) -> Result<Self> {
        let already_active = ACTIVE_PLOG.with(|cell| cell.borrow().is_some());
        if already_active {
            return Err(Error::AlreadyInitialized(
                "a transaction context is already active on this thread".into(),
            ));
        }
        let page_size = system.page_size();
        ACTIVE_PLOG.with(|cell| *cell.borrow_mut() = Some(Plog::new(page_size)));
        Ok(Self {
            system,
            finished: false,
            auto_commit: false,
        })
    }

    /// Like `begin`, but commits automatically on drop instead of
    /// aborting.
    pub fn begin_auto_commit(system: Arc<System>) -> Result<Self> {
        let mut ctx = Self::begin(system)?;
        ctx.auto_commit = true;
        Ok(ctx)
    }

    /// Log one record directly (bypassing an object logger). Fails if the
    /// context has already committed or aborted.
    pub fn log(&mut self, hdr: RecordHeader, payload: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::InactiveContext("context already finished".into()));
        }
        log_into_active(hdr, payload)
    }

    /// Insert the plog into the commit buffer and wait until its epoch is
    /// hardened. Returns `false` on failure or shutdown; the caller must
    /// then treat the transaction as aborted.
    pub fn commit(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        let plog = ACTIVE_PLOG.with(|cell| cell.borrow_mut().take());
        let Some(mut plog) = plog else {
            return false;
        };
        match plog.insert_into_buffer(self.system.commit_buffer()) {
            Ok(epoch) => self.system.flusher().wait_until_hardened(epoch),
            Err(_) => false,
        }
    }

    /// Discard the plog without any durability wait.
    pub fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        ACTIVE_PLOG.with(|cell| {
            cell.borrow_mut().take();
        });
    }

    /// Run `f` against the active plog's primary page, for introspection
    /// (e.g. counting records staged so far). Fails if the context has
    /// already finished.
    pub fn with_plog<R>(&self, f: impl FnOnce(&LogPage) -> R) -> Result<R> {
        if self.finished {
            return Err(Error::InactiveContext("context already finished".into()));
        }
        ACTIVE_PLOG.with(|cell| {
            let guard = cell.borrow();
            let plog = guard.as_ref().expect("active context implies a plog is present");
            Ok(f(plog.primary_page()))
        })
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.auto_commit {
            self.commit();
        } else {
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::file_log::FileBasedLog;
    use crate::index::SqliteBlockIndex;
    use crate::record::{encode_args, Arg, RecordType};
    use tempfile::tempdir;

    fn test_system() -> Arc<System> {
        let dir = tempdir().unwrap();
        let config = Config::builder(dir.path().to_path_buf()).build().unwrap();
        let index = Arc::new(SqliteBlockIndex::open(&config.log_index_file()).unwrap());
        let log = Arc::new(FileBasedLog::open(config, index.clone()).unwrap());
        std::mem::forget(dir);
        Arc::new(System::assemble(log, index))
    }

    #[test]
    fn second_context_on_same_thread_fails_fast() {
        let system = test_system();
        let _first = TransactionContext::begin(system.clone()).unwrap();
        let second = TransactionContext::begin(system);
        assert!(matches!(second, Err(Error::AlreadyInitialized(_))));
    }

    #[test]
    fn abort_discards_without_durability_wait() {
        let system = test_system();
        let mut ctx = TransactionContext::begin(system).unwrap();
        let hdr = RecordHeader::new(1, 0, RecordType::Insert);
        ctx.log(hdr, &encode_args(&[Arg::U64(1)])).unwrap();
        ctx.abort();
        // Thread-local slot is free again immediately.
        let system2 = test_system();
        assert!(TransactionContext::begin(system2).is_ok());
    }

    #[test]
    fn commit_returns_true_and_releases_the_slot() {
        let system = test_system();
        let mut ctx = TransactionContext::begin(system).unwrap();
        let hdr = RecordHeader::new(1, 0, RecordType::Insert);
        ctx.log(hdr, &encode_args(&[Arg::U64(1)])).unwrap();
        assert!(ctx.commit());
    }
}
