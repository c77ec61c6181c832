// SPDX-License-Identifier: MIT

//! Log flusher (C8): the single dedicated thread that drains the epoch
//! ring in strict order and persists pages to the file-based log.
//!
//! Grounded on `hdds-persistence/src/subscriber.rs`'s `run()` loop shape
//! (a background thread consuming from a channel/queue and tracking
//! progress via an atomic watermark) adapted to the epoch ring's
//! blocking `consume`.

use crate::error::Result;
use crate::file_log::FileBasedLog;
use crate::ring::EpochRing;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

struct HardenedState {
    epoch: u64,
}

/// Background thread that sorts and persists shared pages in epoch order,
/// tracking the highest epoch known durable.
pub struct Flusher {
    hardened: Mutex<HardenedState>,
    cv: Condvar,
    shutting_down: AtomicBool,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Flusher {
    /// Spawn the flusher loop against `ring`, writing through `log`.
    /// `start_epoch` is the ring's current epoch before any page has been
    /// produced (the flusher's `hardened_epoch` cursor starts one behind
    /// it).
    pub fn spawn(ring: EpochRing, log: Arc<FileBasedLog>, start_epoch: u64) -> Arc<Self> {
        let flusher = Arc::new(Self {
            hardened: Mutex::new(HardenedState {
                epoch: start_epoch.saturating_sub(1),
            }),
            cv: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            handle: Mutex::new(None),
        });
        let worker = flusher.clone();
        let handle = thread::Builder::new()
            .name("calog-flusher".into())
            .spawn(move || worker.run(ring, log))
            .expect("failed to spawn flusher thread");
        *flusher.handle.lock() = Some(handle);
        flusher
    }

    fn run(&self, ring: EpochRing, log: Arc<FileBasedLog>) {
        loop {
            let (epoch, handle) = match ring.consume() {
                Some(pair) => pair,
                None => {
                    info!("flusher exiting: ring shut down and drained");
                    break;
                }
            };
            {
                let mut page = handle.lock();
                page.sort_slots();
                if page.is_empty() {
                    debug!(epoch, "flusher skipping empty page");
                } else if let Err(err) = log.append_page(&page, epoch) {
                    error!(epoch, error = %err, "flusher failed to append page; stopping");
                    self.shutting_down.store(true, Ordering::Release);
                    break;
                }
            }
            let mut state = self.hardened.lock();
            assert_eq!(
                state.epoch + 1,
                epoch,
                "flusher observed a non-contiguous epoch"
            );
            state.epoch = epoch;
            drop(state);
            self.cv.notify_all();
        }
    }

    /// Block until `epoch` is durable, or the flusher has shut down.
    /// Returns `false` on shutdown (caller must treat the commit as an
    /// abort, per spec).
    pub fn wait_until_hardened(&self, epoch: u64) -> bool {
        let mut state = self.hardened.lock();
        while state.epoch < epoch {
            if self.shutting_down.load(Ordering::Acquire) {
                return false;
            }
            self.cv.wait(&mut state);
        }
        true
    }

    /// Highest epoch known durable, for diagnostics.
    pub fn hardened_epoch(&self) -> u64 {
        self.hardened.lock().epoch
    }

    pub fn join(&self) -> Result<()> {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::index::SqliteBlockIndex;
    use crate::record::{encode_args, Arg, RecordType};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn test_log(dir: &std::path::Path) -> Arc<FileBasedLog> {
        let config = Config::builder(dir.to_path_buf()).build().unwrap();
        let index = Arc::new(SqliteBlockIndex::open(&config.log_index_file()).unwrap());
        Arc::new(FileBasedLog::open(config, index).unwrap())
    }

    #[test]
    fn flusher_drains_pages_in_epoch_order_and_hardens() {
        let dir = tempdir().unwrap();
        let log = test_log(dir.path());
        let ring = EpochRing::new(4, 65536);
        let flusher = Flusher::spawn(ring.clone(), log, crate::ring::INITIAL_EPOCH);

        let handle = ring.produce().unwrap();
        {
            let mut page = handle.lock();
            let hdr = crate::record::RecordHeader::new(1, 0, RecordType::Insert);
            let payload = encode_args(&[Arg::U64(7)]);
            assert!(page.try_insert(hdr, &payload));
        }
        drop(handle);

        assert!(flusher.wait_until_hardened(crate::ring::INITIAL_EPOCH));
        assert_eq!(flusher.hardened_epoch(), crate::ring::INITIAL_EPOCH);

        ring.shutdown();
        flusher.join().unwrap();
    }
}
