// SPDX-License-Identifier: MIT

//! Epoch ring buffer (C6): bounded hand-off of shared log pages between
//! the commit side and the flusher.
//!
//! Mirrors the writer/reader protocol documentation style of
//! `hdds/src/transport/shm/ring.rs` and the head/tail atomic bookkeeping of
//! `hdds/src/core/rt/indexring.rs`, adapted from that SPSC design to the
//! mutex + condvar access pattern spec.md requires here: producers are
//! "whichever thread is the current consolidation-array leader," not a
//! single fixed thread, so a lock-free SPSC ring does not apply.
//!
//! Capacity is fixed at `R` slots, indexed by `epoch mod R`. Every shared
//! page slot carries an atomic reference count; [`PageHandle`] clones
//! increment it, drops decrement it, and the ring only reuses (on
//! `produce`) or hands to the flusher (on `consume`) a slot whose count has
//! returned to zero.
//!
//! Each slot's [`LogPage`] still sits behind a `Mutex` for the operations
//! that need exclusive access (`clear` on reuse, `reserve` when a group
//! leader claims a fresh range), but the per-record copy that follows a
//! `reserve` is lock-free: [`PageHandle::write_reserved`] reaches the page
//! through `parking_lot::Mutex::data_ptr`, bypassing the lock entirely, the
//! same way `crate::carray`'s `CArraySlot` exposes its `UnsafeCell`-backed
//! data without a latch. This is sound because `LogPage::write_reserved`
//! itself only ever touches a disjoint, already-allocated range per caller.

use crate::error::{Error, Result};
use crate::page::LogPage;
use crate::record::RecordHeader;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// First epoch ever handed out; epoch 0 is reserved (spec.md §3).
pub const INITIAL_EPOCH: u64 = 1;

struct RingState {
    /// Next epoch to produce.
    end: u64,
    /// Next epoch to consume.
    begin: u64,
    shutdown: bool,
}

struct Shared {
    slots: Vec<Mutex<LogPage>>,
    refcounts: Vec<AtomicUsize>,
    epochs: Vec<AtomicU64>,
    capacity: u64,
    state: Mutex<RingState>,
    cv: Condvar,
}

/// Bounded ring of `R` shared-page slots.
#[derive(Clone)]
pub struct EpochRing {
    shared: Arc<Shared>,
}

impl EpochRing {
    /// Create a ring with `capacity` slots, each sized for `page_size`
    /// bytes, starting at [`INITIAL_EPOCH`].
    pub fn new(capacity: usize, page_size: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be > 0");
        let slots = (0..capacity).map(|_| Mutex::new(LogPage::new(page_size))).collect();
        let refcounts = (0..capacity).map(|_| AtomicUsize::new(0)).collect();
        let epochs = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self {
            shared: Arc::new(Shared {
                slots,
                refcounts,
                epochs,
                capacity: capacity as u64,
                state: Mutex::new(RingState {
                    end: INITIAL_EPOCH,
                    begin: INITIAL_EPOCH,
                    shutdown: false,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Assign the next epoch and return a writable handle to a fresh page.
    /// Blocks while the ring is full (`end - begin == R`) or while the
    /// physical slot about to be reused is still referenced by a prior
    /// occupant.
    pub fn produce(&self) -> Result<PageHandle> {
        let mut state = self.shared.state.lock();
        loop {
            if state.shutdown {
                return Err(Error::Shutdown);
            }
            let idx = (state.end % self.shared.capacity) as usize;
            let full = state.end - state.begin >= self.shared.capacity;
            let slot_busy = self.shared.refcounts[idx].load(Ordering::Acquire) != 0;
            if !full && !slot_busy {
                let epoch = state.end;
                state.end += 1;
                self.shared.slots[idx].lock().clear();
                self.shared.epochs[idx].store(epoch, Ordering::Release);
                self.shared.refcounts[idx].store(1, Ordering::Release);
                self.shared.cv.notify_all();
                return Ok(PageHandle {
                    shared: self.shared.clone(),
                    idx,
                    epoch,
                });
            }
            self.wait(&mut state);
        }
    }

    /// Hand the next unreferenced produced page to the flusher, in strict
    /// epoch order. Returns `None` once shut down with nothing left to
    /// drain.
    pub fn consume(&self) -> Option<(u64, PageHandle)> {
        let mut state = self.shared.state.lock();
        loop {
            if state.begin < state.end {
                let idx = (state.begin % self.shared.capacity) as usize;
                if self.shared.refcounts[idx].load(Ordering::Acquire) == 0 {
                    let epoch = state.begin;
                    state.begin += 1;
                    self.shared.refcounts[idx].store(1, Ordering::Release);
                    self.shared.cv.notify_all();
                    return Some((
                        epoch,
                        PageHandle {
                            shared: self.shared.clone(),
                            idx,
                            epoch,
                        },
                    ));
                }
            }
            if state.shutdown {
                return None;
            }
            self.wait(&mut state);
        }
    }

    fn wait(&self, state: &mut MutexGuard<'_, RingState>) {
        self.shared.cv.wait(state);
    }

    /// Signal shutdown and wake every waiter; `consume` returns `None` and
    /// `produce` returns `Err(Error::Shutdown)` from then on.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.cv.notify_all();
    }

    /// Current `begin` counter (next epoch to consume), for diagnostics.
    pub fn begin_epoch(&self) -> u64 {
        self.shared.state.lock().begin
    }

    /// Current `end` counter (next epoch to produce), for diagnostics.
    pub fn end_epoch(&self) -> u64 {
        self.shared.state.lock().end
    }
}

/// Reference-counted handle to one ring-owned page. Cloning increments the
/// slot's reference count; the slot is only reused (by `produce`) or handed
/// to the flusher (by `consume`) once every handle has dropped.
pub struct PageHandle {
    shared: Arc<Shared>,
    idx: usize,
    epoch: u64,
}

impl PageHandle {
    /// Epoch this page was produced (or consumed) under.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Lock the underlying page for exclusive access (reservation sizing,
    /// clearing on reuse, flusher reads).
    pub fn lock(&self) -> MutexGuard<'_, LogPage> {
        self.shared.slots[self.idx].lock()
    }

    /// Write one record into a previously reserved slot without taking the
    /// page's lock.
    ///
    /// Every group-commit participant holds a disjoint `(slot_index,
    /// payload_offset)` range handed out by the consolidation array, so
    /// concurrent callers never touch the same bytes; see
    /// [`crate::page::LogPage::write_reserved`] for the full invariant this
    /// relies on.
    ///
    /// SAFETY: `Mutex::data_ptr` returns a pointer to the protected value
    /// without locking. Dereferencing it here is sound because the
    /// reservation this call targets was already published by the group
    /// leader via `finish_slot_reservation`'s Release store, and every
    /// caller reaches this point only after observing that store through
    /// `wait_for_leader`'s Acquire load — so the leader's own `reserve()`
    /// call (which is the only one that can resize the page) has already
    /// completed and cannot race this write.
    pub fn write_reserved(&self, slot_index: usize, payload_offset: usize, hdr: RecordHeader, payload_bytes: &[u8]) {
        let page: &LogPage = unsafe { &*self.shared.slots[self.idx].data_ptr() };
        page.write_reserved(slot_index, payload_offset, hdr, payload_bytes);
    }
}

impl Clone for PageHandle {
    fn clone(&self) -> Self {
        self.shared.refcounts[self.idx].fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
            idx: self.idx,
            epoch: self.epoch,
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        let prev = self.shared.refcounts[self.idx].fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            // Last reference to this slot: wake anyone waiting for it to
            // become unreferenced (a blocked `produce` wanting to reuse the
            // slot, or a blocked `consume` wanting to hand it to the
            // flusher).
            let _guard = self.shared.state.lock();
            self.shared.cv.notify_all();
        }
    }
}
