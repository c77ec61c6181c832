// SPDX-License-Identifier: MIT

//! Commit buffer (C5) and timeout watchdog (C7): the group-commit merge
//! point where private logs become shared, epoch-stamped pages.
//!
//! Grounded on `hdds-persistence/src/subscriber.rs`'s background-task shape
//! for the watchdog, and on `original_source/src/legacy/carray_slot.h`'s
//! `PayloadBits = 32` bit-packing for the reservation word shared with the
//! consolidation array.
//!
//! The only latch in the whole protocol is `current`, held briefly by
//! whichever thread wins leader election to reserve a group's disjoint
//! slot/payload range (one latch acquire per group, not per record — see
//! [`CommitBuffer::lead_group`]). Every participant's subsequent copy runs
//! through [`crate::ring::PageHandle::write_reserved`], which never takes
//! that latch.

use crate::carray::{ConsolidationArray, GroupReservation, SlotRef};
use crate::error::{Error, Result};
use crate::page::LogPage;
use crate::record::RecordHeader;
use crate::ring::{EpochRing, PageHandle};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Bit width given to the payload-byte count in a packed reservation word;
/// the slot count occupies the high bits.
pub const PAYLOAD_BITS: u32 = 32;

/// Default group-commit watchdog timeout, in milliseconds.
pub const DEFAULT_WATCHDOG_TIMEOUT_MS: u64 = 10;

/// Decoded halves of a reservation word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub slots: u32,
    pub payload_bytes: u32,
}

/// Pack a `(slot_count, payload_bytes)` pair into the status-word encoding
/// the consolidation array accumulates via plain integer addition.
pub fn encode_reservation(slot_count: u32, payload_bytes: u32) -> i64 {
    ((slot_count as i64) << PAYLOAD_BITS) | (payload_bytes as i64)
}

/// Inverse of [`encode_reservation`].
pub fn decode_reservation(word: i64) -> Reservation {
    Reservation {
        slots: (word >> PAYLOAD_BITS) as u32,
        payload_bytes: (word & 0xFFFF_FFFF) as u32,
    }
}

/// CA-coordinated merger of plog pages into the current shared page,
/// handing closed pages to the ring on epoch boundaries.
pub struct CommitBuffer {
    ca: ConsolidationArray,
    ring: EpochRing,
    current: Mutex<Option<PageHandle>>,
}

impl CommitBuffer {
    pub fn new(ca: ConsolidationArray, ring: EpochRing) -> Self {
        Self {
            ca,
            ring,
            current: Mutex::new(None),
        }
    }

    /// Merge every record of `plog_page` into a shared page, returning the
    /// epoch the caller must wait on for durability.
    ///
    /// Implements the seven-step group-commit protocol: join the
    /// consolidation array, elect a leader to reserve space (rotating the
    /// shared page via the ring when the current one cannot fit the
    /// group), have every participant copy its own disjoint range, then
    /// have the last leaver to depart release the page handle and free the
    /// slot.
    pub fn insert(&self, plog_page: &mut LogPage) -> Result<u64> {
        let slot_count = plog_page.slot_count();
        let payload_bytes = plog_page.payload_used();
        if slot_count == 0 {
            return Err(Error::InactiveContext("commit of an empty page".into()));
        }
        if slot_count >= (1usize << 31) {
            return Err(Error::CapacityExceeded(format!(
                "slot count {slot_count} exceeds reservation width"
            )));
        }
        if payload_bytes >= (1usize << 32) {
            return Err(Error::CapacityExceeded(format!(
                "payload size {payload_bytes} exceeds reservation width"
            )));
        }
        let to_reserve = encode_reservation(slot_count as u32, payload_bytes as u32);
        let (cslot, prior) = self.ca.join_slot(to_reserve);

        if ConsolidationArray::is_leader(prior) {
            self.lead_group(&cslot, to_reserve)?;
        } else {
            self.ca.wait_for_leader(&cslot);
        }

        let my_offset = decode_reservation(prior);
        self.copy_group_member(&cslot, &my_offset, plog_page);
        let epoch = self.ca.reservation(&cslot).epoch;

        let end = self.ca.leave_slot(&cslot, to_reserve);
        if ConsolidationArray::is_last_to_leave(end, to_reserve) {
            let reservation = self.ca.take_reservation(&cslot);
            drop(reservation); // drops the held PageHandle, releasing the ring reference
            self.ca.free_slot(&cslot);
        }
        Ok(epoch)
    }

    fn lead_group(&self, cslot: &SlotRef, _to_reserve: i64) -> Result<()> {
        let mut guard = self.current.lock();
        self.ca.replace_active_slot(cslot);
        let prior_total = self.ca.fetch_slot_status(cslot);
        let group = decode_reservation(prior_total);

        loop {
            if let Some(handle) = guard.as_ref() {
                let mut page = handle.lock();
                if let Some((first_slot, first_payload)) =
                    page.reserve(group.slots as usize, group.payload_bytes as usize)
                {
                    drop(page);
                    let handle = guard.as_ref().unwrap().clone();
                    let epoch = handle.epoch();
                    self.ca.set_reservation(
                        cslot,
                        GroupReservation {
                            log_page: Some(handle),
                            first_slot,
                            first_payload,
                            epoch,
                        },
                    );
                    break;
                }
            }
            self.release_current_epoch_locked(&mut guard)?;
        }
        self.ca.finish_slot_reservation(cslot, prior_total);
        Ok(())
    }

    /// Copy this participant's records into its disjoint slice of the
    /// group's reserved range. No latch is taken: the ranges handed out by
    /// the consolidation array never overlap, so every member of the group
    /// copies concurrently through [`PageHandle::write_reserved`].
    fn copy_group_member(&self, cslot: &SlotRef, my_offset: &Reservation, plog_page: &mut LogPage) {
        let reservation = self.ca.reservation(cslot);
        let page_handle = reservation
            .log_page
            .as_ref()
            .expect("leader always publishes a page handle before finishing reservation")
            .clone();
        let mut slot_idx = reservation.first_slot + my_offset.slots as usize;
        let mut payload_off = reservation.first_payload + my_offset.payload_bytes as usize;
        for (hdr, payload) in plog_page.iterate(true) {
            let hdr: RecordHeader = *hdr;
            page_handle.write_reserved(slot_idx, payload_off, hdr, payload);
            slot_idx += 1;
            payload_off += payload.len();
        }
    }

    /// Close the current page (if any) and obtain a fresh one from the
    /// ring, assigning it the next epoch. Caller must hold `self.current`'s
    /// latch.
    fn release_current_epoch_locked(&self, current: &mut MutexGuard<'_, Option<PageHandle>>) -> Result<()> {
        let fresh = self.ring.produce()?;
        debug!(epoch = fresh.epoch(), "commit buffer rotated to a fresh shared page");
        **current = Some(fresh);
        Ok(())
    }

    /// Spawn the background watchdog that force-closes an idle non-empty
    /// current page after `timeout`, bounding worst-case commit latency to
    /// roughly twice the timeout.
    pub fn spawn_watchdog(self: &Arc<Self>, timeout: Duration) -> Watchdog {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let buffer = self.clone();
        let handle = thread::Builder::new()
            .name("calog-watchdog".into())
            .spawn(move || buffer.watchdog_loop(stop_flag, timeout))
            .expect("failed to spawn watchdog thread");
        Watchdog {
            stop,
            handle: Some(handle),
        }
    }

    fn watchdog_loop(self: Arc<Self>, stop: Arc<AtomicBool>, timeout: Duration) {
        while !stop.load(Ordering::Acquire) {
            let sampled_epoch = self.current.lock().as_ref().map(|h| h.epoch());
            thread::sleep(timeout);
            if stop.load(Ordering::Acquire) {
                break;
            }
            let mut guard = self.current.lock();
            let still_same = guard.as_ref().map(|h| h.epoch()) == sampled_epoch;
            if !still_same {
                continue;
            }
            let non_empty = guard.as_ref().map(|h| !h.lock().is_empty()).unwrap_or(false);
            if !non_empty {
                continue;
            }
            debug!(epoch = ?sampled_epoch, "watchdog closing idle shared page");
            if let Err(err) = self.release_current_epoch_locked(&mut guard) {
                warn!(error = %err, "watchdog failed to rotate shared page");
            }
        }
    }
}

/// Handle to the background timeout watchdog thread. Dropping it signals
/// shutdown and joins the thread.
pub struct Watchdog {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carray::ConsolidationArray;
    use crate::record::{encode_args, Arg, RecordType};

    fn new_buffer() -> CommitBuffer {
        CommitBuffer::new(ConsolidationArray::new(3), EpochRing::new(4, 65536))
    }

    #[test]
    fn reservation_word_roundtrips() {
        let word = encode_reservation(7, 4096);
        let decoded = decode_reservation(word);
        assert_eq!(decoded.slots, 7);
        assert_eq!(decoded.payload_bytes, 4096);
    }

    #[test]
    fn single_transaction_insert_returns_positive_epoch() {
        let buffer = new_buffer();
        let mut page = LogPage::new(4096);
        for i in 0..4u64 {
            let hdr = RecordHeader::new(1, i, RecordType::Insert);
            let payload = encode_args(&[Arg::U64(i)]);
            assert!(page.try_insert(hdr, &payload));
        }
        let epoch = buffer.insert(&mut page).expect("commit succeeds");
        assert!(epoch >= crate::ring::INITIAL_EPOCH);
    }

    #[test]
    fn concurrent_inserts_each_see_a_valid_epoch() {
        let buffer = Arc::new(new_buffer());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let buffer = buffer.clone();
            handles.push(thread::spawn(move || {
                let mut page = LogPage::new(4096);
                for i in 0..50u64 {
                    let hdr = RecordHeader::new(t, i, RecordType::Insert);
                    let payload = encode_args(&[Arg::U64(i)]);
                    assert!(page.try_insert(hdr, &payload));
                }
                buffer.insert(&mut page).expect("commit succeeds")
            }));
        }
        for h in handles {
            let epoch = h.join().expect("thread joins");
            assert!(epoch >= crate::ring::INITIAL_EPOCH);
        }
    }

    #[test]
    fn empty_page_is_rejected() {
        let buffer = new_buffer();
        let mut page = LogPage::new(4096);
        assert!(matches!(buffer.insert(&mut page), Err(Error::InactiveContext(_))));
    }
}
