// SPDX-License-Identifier: MIT

//! Fixed-capacity slotted log page (C1).
//!
//! A page holds a slot directory growing from the low end and payload bytes
//! growing from the high end, exactly mirroring the classic slotted-page
//! layout. `try_insert` is all-or-nothing: on failure no partial state is
//! left behind.

use crate::record::RecordHeader;
use std::cell::UnsafeCell;
use std::cmp::Ordering;

/// Default page capacity: 1 MiB, matching spec.md's `P`.
pub const DEFAULT_PAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct Slot {
    header: RecordHeader,
    payload_offset: u32,
    ghost: bool,
}

/// A slotted, sortable container of records.
///
/// `slots`/`payload` are `UnsafeCell`-wrapped, the same technique
/// [`crate::carray`]'s `CArraySlot` uses, so that
/// [`write_reserved`](Self::write_reserved) can take `&self`: once the
/// commit buffer's leader has [`reserve`](Self::reserve)d a
/// group's disjoint slot/payload ranges, every participant copies its own
/// records into the page concurrently, through a shared reference, with no
/// latch. A page is still never read or reserved from more than one thread
/// at a time outside that copy phase — handing one across threads happens
/// only through the reference-counted handles in [`crate::ring`].
pub struct LogPage {
    capacity: usize,
    slots: UnsafeCell<Vec<Slot>>,
    payload: UnsafeCell<Vec<u8>>,
    /// Next free offset from the *end* of the payload area, i.e. bytes
    /// already consumed by payload data.
    payload_used: usize,
}

// SAFETY: concurrent access to `slots`/`payload` only ever happens through
// `write_reserved`, whose own SAFETY comment establishes that every such
// write touches a disjoint, already-allocated range and cannot race a
// reallocation. All other accesses require `&mut self` (unique ownership)
// or happen strictly before/after the concurrent copy phase under the
// consolidation array's leader-election happens-before edge.
unsafe impl Sync for LogPage {}

impl LogPage {
    /// Create an empty page of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: UnsafeCell::new(Vec::new()),
            payload: UnsafeCell::new(Vec::new()),
            payload_used: 0,
        }
    }

    /// SAFETY: callers must not hold this alongside a concurrent
    /// `write_reserved` call targeting an overlapping range; in practice
    /// this is only ever called single-threaded (construction, sizing,
    /// sorting, clearing, iteration after a group has fully drained).
    #[inline]
    fn slots(&self) -> &[Slot] {
        unsafe { &*self.slots.get() }
    }

    #[inline]
    fn payload_bytes(&self) -> &[u8] {
        unsafe { &*self.payload.get() }
    }

    /// Create a page of the default size.
    pub fn with_default_size() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }

    fn directory_bytes(&self) -> usize {
        self.slots().len() * std::mem::size_of::<Slot>()
    }

    /// Bytes still available for a new slot + its payload.
    pub fn free_space(&self) -> usize {
        self.capacity
            .saturating_sub(self.directory_bytes())
            .saturating_sub(self.payload_used)
    }

    /// Number of live slots (ghosted slots still count; they are only
    /// skipped by callers, not physically removed).
    pub fn slot_count(&self) -> usize {
        self.slots().len()
    }

    /// Total payload bytes consumed so far, for group-reservation sizing.
    pub fn payload_used(&self) -> usize {
        self.payload_used
    }

    /// `true` if the page holds no records.
    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    fn would_fit(&self, payload_len: usize) -> bool {
        let needed = std::mem::size_of::<Slot>() + payload_len;
        self.free_space() >= needed
    }

    /// Insert `payload_bytes` verbatim under `hdr`, filling in `hdr.length`.
    /// Returns `false` (no mutation) if the page cannot fit the record.
    ///
    /// Used both for normal inserts and for plog-to-plog / plog-to-shared-page
    /// bulk copies, where the payload is already encoded.
    pub fn try_insert_raw(&mut self, mut hdr: RecordHeader, payload_bytes: &[u8]) -> bool {
        if payload_bytes.len() > u16::MAX as usize || !self.would_fit(payload_bytes.len()) {
            return false;
        }
        hdr.set_length(payload_bytes.len() as u16);
        let offset = self.payload_used as u32;
        self.payload.get_mut().extend_from_slice(payload_bytes);
        self.payload_used += payload_bytes.len();
        self.slots.get_mut().push(Slot {
            header: hdr,
            payload_offset: offset,
            ghost: false,
        });
        true
    }

    /// Insert a fresh record built from `hdr` and an already-encoded
    /// argument payload. Equivalent to `try_insert_raw` but named to match
    /// spec.md's `try_insert(hdr, args...)` — callers encode args via
    /// [`crate::record::encode_args`] first.
    pub fn try_insert(&mut self, hdr: RecordHeader, encoded_args: &[u8]) -> bool {
        self.try_insert_raw(hdr, encoded_args)
    }

    /// Reserve `slot_count` slots and `payload_bytes` contiguous payload
    /// bytes without writing any data, for the commit buffer's group
    /// pre-allocation step (spec.md §4.5 step 3d). Returns the starting
    /// slot index and starting payload offset, or `None` if it does not
    /// fit.
    pub fn reserve(&mut self, slot_count: usize, payload_bytes: usize) -> Option<(usize, usize)> {
        let needed = slot_count * std::mem::size_of::<Slot>() + payload_bytes;
        if self.free_space() < needed {
            return None;
        }
        let first_slot = self.slots().len();
        let first_payload = self.payload_used;
        // Pre-grow with placeholder slots/payload; participants overwrite
        // their disjoint ranges directly afterward. This is the *only* call
        // that can reallocate either vector for this reservation — every
        // `write_reserved` that follows only ever touches bytes this call
        // already allocated, never growing either vector further.
        let placeholder_hdr = RecordHeader::new(0, 0, crate::record::RecordType::Custom(0xFF));
        let slots = self.slots.get_mut();
        for _ in 0..slot_count {
            slots.push(Slot {
                header: placeholder_hdr,
                payload_offset: 0,
                ghost: true,
            });
        }
        self.payload.get_mut().resize(self.payload_used + payload_bytes, 0);
        self.payload_used += payload_bytes;
        Some((first_slot, first_payload))
    }

    /// Write a record into a previously [`reserve`](Self::reserve)d slot.
    /// `slot_index`/`payload_offset` must be disjoint from every other
    /// writer's range within the same reservation — the commit buffer
    /// guarantees this by construction.
    ///
    /// Takes `&self`, not `&mut self`: this is the page's lock-free
    /// group-commit copy path. A consolidation-array group reserves a
    /// contiguous slot/payload range, then every participant writes its own
    /// disjoint sub-range through a shared reference concurrently, matching
    /// the way `crate::carray`'s `CArraySlot` publishes `GroupReservation`
    /// data through an `UnsafeCell` instead of a mutex.
    ///
    /// SAFETY (of the `unsafe` block below): `reserve` is the only call that
    /// can grow or reallocate `slots`/`payload`, and it always completes
    /// before any participant's `write_reserved` begins — a follower only
    /// starts copying after `wait_for_leader`'s Acquire load observes the
    /// leader's Release store in `finish_slot_reservation`, which happens
    /// after the leader's own `reserve()` call returned. So every raw
    /// pointer obtained here points at already-allocated, stable memory.
    /// `slot_index`/`payload_offset` are a disjoint range handed out by the
    /// consolidation array, so two participants never write the same byte.
    pub fn write_reserved(&self, slot_index: usize, payload_offset: usize, mut hdr: RecordHeader, payload_bytes: &[u8]) {
        hdr.set_length(payload_bytes.len() as u16);
        unsafe {
            // `.as_ptr()` only ever needs a shared `&Vec<_>`, so this never
            // manufactures a transient `&mut` that could alias another
            // caller's in-flight write to a different offset in the same
            // buffer.
            let payload_ptr = (*self.payload.get()).as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(payload_bytes.as_ptr(), payload_ptr.add(payload_offset), payload_bytes.len());
            let slots_ptr = (*self.slots.get()).as_ptr() as *mut Slot;
            std::ptr::write(
                slots_ptr.add(slot_index),
                Slot {
                    header: hdr,
                    payload_offset: payload_offset as u32,
                    ghost: false,
                },
            );
        }
    }

    fn payload_at(&self, slot: &Slot) -> &[u8] {
        let start = slot.payload_offset as usize;
        let end = start + slot.header.length() as usize;
        &self.payload_bytes()[start..end]
    }

    /// Stable-sort the slot directory by the normalized `(object_id,
    /// seq_num)` comparator. Payload bytes are untouched; only directory
    /// entries move.
    pub fn sort_slots(&mut self) {
        self.slots
            .get_mut()
            .sort_by(|a, b| a.header.cmp(&b.header).then(Ordering::Equal));
    }

    /// Iterate over `(header, payload)` pairs, forward or reverse.
    pub fn iterate(&self, forward: bool) -> PageIter<'_> {
        PageIter {
            page: self,
            forward,
            front: 0,
            back: self.slots().len(),
        }
    }

    /// Drop all records, resetting the page to empty (reused by the ring
    /// once a consumed page has been flushed).
    pub fn clear(&mut self) {
        self.slots.get_mut().clear();
        self.payload.get_mut().clear();
        self.payload_used = 0;
    }

    /// Smallest `object_id` across all non-ghost slots (the page must be
    /// sorted and non-empty; used when registering a block-index entry).
    pub fn min_object_id(&self) -> Option<u64> {
        self.slots().first().map(|s| s.header.object_id())
    }

    /// Largest `object_id` across all non-ghost slots.
    pub fn max_object_id(&self) -> Option<u64> {
        self.slots().last().map(|s| s.header.object_id())
    }
}

/// Iterator over a page's slots, in insertion order or reverse. Borrows the
/// page: it must outlive the iterator.
pub struct PageIter<'p> {
    page: &'p LogPage,
    forward: bool,
    front: usize,
    back: usize,
}

impl<'p> Iterator for PageIter<'p> {
    type Item = (&'p RecordHeader, &'p [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.front >= self.back {
                return None;
            }
            let idx = if self.forward {
                let i = self.front;
                self.front += 1;
                i
            } else {
                self.back -= 1;
                self.back
            };
            let slot = &self.page.slots()[idx];
            if slot.ghost {
                continue;
            }
            return Some((&slot.header, self.page.payload_at(slot)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{encode_args, Arg, RecordType};

    #[test]
    fn insert_and_iterate_forward() {
        let mut page = LogPage::new(4096);
        for i in 0..5u64 {
            let hdr = RecordHeader::new(1, i, RecordType::Insert);
            let payload = encode_args(&[Arg::U64(i)]);
            assert!(page.try_insert(hdr, &payload));
        }
        let seqs: Vec<u64> = page.iterate(true).map(|(h, _)| h.seq_num()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        let rev: Vec<u64> = page.iterate(false).map(|(h, _)| h.seq_num()).collect();
        assert_eq!(rev, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn try_insert_fails_cleanly_when_full() {
        let mut page = LogPage::new(256);
        let big_payload = vec![0u8; 1024];
        let hdr = RecordHeader::new(1, 0, RecordType::Insert);
        assert!(!page.try_insert_raw(hdr, &big_payload));
        assert_eq!(page.slot_count(), 0);
        assert_eq!(page.free_space(), 256);
    }

    #[test]
    fn sort_slots_orders_by_normalized_key() {
        let mut page = LogPage::new(4096);
        for (obj, seq) in [(2u64, 0u64), (0, 5), (1, 1), (0, 0)] {
            let hdr = RecordHeader::new(obj, seq, RecordType::Insert);
            page.try_insert(hdr, &[]);
        }
        page.sort_slots();
        let keys: Vec<(u64, u64)> = page
            .iterate(true)
            .map(|(h, _)| (h.object_id(), h.seq_num()))
            .collect();
        assert_eq!(keys, vec![(0, 0), (0, 5), (1, 1), (2, 0)]);
    }

    #[test]
    fn reserve_then_write_reserved_roundtrips() {
        let mut page = LogPage::new(4096);
        let payload_a = encode_args(&[Arg::U64(1)]);
        let payload_b = encode_args(&[Arg::U64(2)]);
        let (first_slot, first_payload) = page
            .reserve(2, payload_a.len() + payload_b.len())
            .expect("reservation fits");
        page.write_reserved(
            first_slot,
            first_payload,
            RecordHeader::new(9, 0, RecordType::Insert),
            &payload_a,
        );
        page.write_reserved(
            first_slot + 1,
            first_payload + payload_a.len(),
            RecordHeader::new(9, 1, RecordType::Insert),
            &payload_b,
        );
        let seqs: Vec<u64> = page.iterate(true).map(|(h, _)| h.seq_num()).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn empty_page_is_legal_and_flushable() {
        let page = LogPage::new(4096);
        assert!(page.is_empty());
        assert_eq!(page.iterate(true).count(), 0);
    }
}
