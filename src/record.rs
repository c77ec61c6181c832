// SPDX-License-Identifier: MIT

//! Record header, normalized key ordering, and argument encoding.
//!
//! `object_id` and `seq_num` are stored big-endian ("normalized key") so a
//! byte-wise `memcmp` over the header prefix matches the logical
//! `(object_id, seq_num)` order, independent of host endianness.

use std::cmp::Ordering;

/// Half a cache line on common 64-byte-line hardware; the header is padded
/// to this so slot directories stay cache-friendly.
pub const HEADER_ALIGNMENT: usize = 32;

/// Record kind. Extensible: new variants append; never renumber existing
/// ones, since `as u8` values are persisted on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// First record for an object; marks its construction.
    Construct = 0,
    /// A value was inserted.
    Insert = 1,
    /// A value was removed.
    Remove = 2,
    /// An existing value was updated in place.
    Update = 3,
    /// Escape hatch for caller-defined record kinds.
    Custom(u8),
}

impl RecordType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Construct => 0,
            Self::Insert => 1,
            Self::Remove => 2,
            Self::Update => 3,
            Self::Custom(v) => v,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Construct,
            1 => Self::Insert,
            2 => Self::Remove,
            3 => Self::Update,
            other => Self::Custom(other),
        }
    }
}

/// `(object_id, seq_num)` stored in their on-disk, big-endian-normalized
/// form plus the decoded `length`/`type` fields.
///
/// Layout is `#[repr(C)]` and padded to [`HEADER_ALIGNMENT`] bytes so pages
/// can treat the slot directory as a flat array of headers.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(32))]
pub struct RecordHeader {
    object_id_be: [u8; 8],
    seq_num_be: [u8; 8],
    length: u16,
    record_type: u8,
    _pad: [u8; 13],
}

impl RecordHeader {
    /// Build a new header. `length` is filled in later by the page that
    /// actually places the payload (mirrors `LogrecHeader`'s two-phase
    /// construction: identity fields at creation, length on insert).
    pub fn new(object_id: u64, seq_num: u64, record_type: RecordType) -> Self {
        Self {
            object_id_be: object_id.to_be_bytes(),
            seq_num_be: seq_num.to_be_bytes(),
            length: 0,
            record_type: record_type.to_u8(),
            _pad: [0u8; 13],
        }
    }

    /// Object identity this record belongs to.
    pub fn object_id(&self) -> u64 {
        u64::from_be_bytes(self.object_id_be)
    }

    /// Per-object monotonic sequence number.
    pub fn seq_num(&self) -> u64 {
        u64::from_be_bytes(self.seq_num_be)
    }

    /// Payload byte count, as recorded by the page on insert.
    pub fn length(&self) -> u16 {
        self.length
    }

    /// Record kind.
    pub fn record_type(&self) -> RecordType {
        RecordType::from_u8(self.record_type)
    }

    pub(crate) fn set_length(&mut self, len: u16) {
        self.length = len;
    }

    /// Normalized key bytes used for the `(object_id, seq_num)` comparator:
    /// a plain `memcmp` over these 16 bytes matches logical order because
    /// both fields are stored big-endian.
    pub fn normalized_key(&self) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&self.object_id_be);
        key[8..].copy_from_slice(&self.seq_num_be);
        key
    }
}

impl PartialEq for RecordHeader {
    fn eq(&self, other: &Self) -> bool {
        self.normalized_key() == other.normalized_key()
    }
}
impl Eq for RecordHeader {}

impl PartialOrd for RecordHeader {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecordHeader {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized_key().cmp(&other.normalized_key())
    }
}

/// A variadic argument to be length-prefix encoded into a record payload.
pub enum Arg<'a> {
    U64(u64),
    U32(u32),
    Bytes(&'a [u8]),
    Str(&'a str),
}

/// Encode a sequence of arguments into a single payload buffer.
///
/// Integers are encoded length-prefixed by `sizeof` (i.e. a one-byte tag
/// naming the width, then the big-endian value); strings and byte arrays are
/// prefixed by a `u32` length. Decoding mirrors this in argument order via
/// [`ArgReader`].
pub fn encode_args(args: &[Arg<'_>]) -> Vec<u8> {
    let mut buf = Vec::new();
    for arg in args {
        match arg {
            Arg::U64(v) => {
                buf.push(8u8);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Arg::U32(v) => {
                buf.push(4u8);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Arg::Bytes(b) => {
                buf.push(0xFFu8);
                buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                buf.extend_from_slice(b);
            }
            Arg::Str(s) => {
                buf.push(0xFEu8);
                buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }
    buf
}

/// Sequential reader over a payload produced by [`encode_args`].
pub struct ArgReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

/// A decoded argument, owned (so readers can outlive the source buffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedArg {
    U64(u64),
    U32(u32),
    Bytes(Vec<u8>),
    Str(String),
}

impl<'a> ArgReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for ArgReader<'a> {
    type Item = DecodedArg;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let tag = self.buf[self.pos];
        self.pos += 1;
        match tag {
            8 => {
                let bytes: [u8; 8] = self.buf[self.pos..self.pos + 8].try_into().ok()?;
                self.pos += 8;
                Some(DecodedArg::U64(u64::from_be_bytes(bytes)))
            }
            4 => {
                let bytes: [u8; 4] = self.buf[self.pos..self.pos + 4].try_into().ok()?;
                self.pos += 4;
                Some(DecodedArg::U32(u32::from_be_bytes(bytes)))
            }
            0xFF => {
                let len_bytes: [u8; 4] = self.buf[self.pos..self.pos + 4].try_into().ok()?;
                self.pos += 4;
                let len = u32::from_be_bytes(len_bytes) as usize;
                let data = self.buf[self.pos..self.pos + len].to_vec();
                self.pos += len;
                Some(DecodedArg::Bytes(data))
            }
            0xFE => {
                let len_bytes: [u8; 4] = self.buf[self.pos..self.pos + 4].try_into().ok()?;
                self.pos += 4;
                let len = u32::from_be_bytes(len_bytes) as usize;
                let data = self.buf[self.pos..self.pos + len].to_vec();
                self.pos += len;
                Some(DecodedArg::Str(String::from_utf8_lossy(&data).into_owned()))
            }
            _ => None,
        }
    }
}
