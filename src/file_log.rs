// SPDX-License-Identifier: MIT

//! File-based log (C9): append-only, size-capped, segmented storage for
//! shared pages, with registration into the block index.
//!
//! Grounded on `hdds-persistence/src/sqlite.rs`'s lazy, mutex-protected
//! resource shape (applied here to a file handle instead of a connection)
//! and on spec.md §6's file-naming contract (`log.<level>.<seq>`, fixed
//! page-sized segments).

use crate::config::Config;
use crate::error::Result;
use crate::index::{BlockEntry, BlockIndex};
use crate::page::LogPage;
use crate::record::RecordType;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

const LEVEL_ZERO: u32 = 0;

/// An orphaned on-disk block discovered by [`FileBasedLog::recover_tail_blocks`]
/// that durability reached but the block index never recorded. Per
/// spec.md §9, reconstructing these into index entries is deferred; this
/// type exists so a future recovery pass has something concrete to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanBlock {
    pub file: u64,
    pub block: u64,
    pub min_key: u64,
    pub max_key: u64,
}

struct FileState {
    file: Option<File>,
    seq: u64,
    bytes_written: u64,
}

/// Append-only segmented log over `logpath`, backed by a pluggable
/// [`BlockIndex`].
pub struct FileBasedLog {
    config: Config,
    index: Arc<dyn BlockIndex>,
    state: Mutex<FileState>,
}

impl FileBasedLog {
    pub fn open(config: Config, index: Arc<dyn BlockIndex>) -> Result<Self> {
        fs::create_dir_all(&config.logpath)?;
        if config.format {
            Self::wipe_logpath(&config)?;
            index.clear()?;
        }
        Ok(Self {
            config,
            index,
            state: Mutex::new(FileState {
                file: None,
                seq: 0,
                bytes_written: 0,
            }),
        })
    }

    fn wipe_logpath(config: &Config) -> Result<()> {
        for entry in fs::read_dir(&config.logpath)? {
            let entry = entry?;
            if is_log_file_name(&entry.file_name().to_string_lossy()) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn file_path(&self, seq: u64) -> PathBuf {
        self.config.logpath.join(format!("log.{LEVEL_ZERO}.{seq}"))
    }

    /// Append `page` (already sorted by the flusher) under `epoch`,
    /// registering the resulting block in the index. Durability (the
    /// `fsync`) happens before the index insert, per spec.md §4.8's crash
    /// ordering requirement.
    pub fn append_page(&self, page: &LogPage, epoch: u64) -> Result<()> {
        if page.is_empty() {
            return Ok(());
        }
        let min_key = page.min_object_id().expect("non-empty page has a min key");
        let max_key = page.max_object_id().expect("non-empty page has a max key");
        let bytes = serialize_page(page, self.config.page_size);

        let mut state = self.state.lock().unwrap();
        let block = self.rotate_if_needed_locked(&mut state, bytes.len() as u64)?;
        {
            let file = state.file.as_mut().expect("file opened by rotate_if_needed_locked");
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        state.bytes_written += bytes.len() as u64;
        let seq = state.seq;
        drop(state);

        self.index.insert_block(BlockEntry {
            level: LEVEL_ZERO,
            first_epoch: epoch,
            last_epoch: epoch,
            file: seq,
            block,
            min_key,
            max_key,
        })
    }

    fn rotate_if_needed_locked(&self, state: &mut FileState, incoming_len: u64) -> Result<u64> {
        let would_exceed =
            state.file.is_none() || state.bytes_written + incoming_len > self.config.log_file_size;
        if would_exceed {
            if let Some(file) = state.file.take() {
                drop(file);
            }
            state.seq += 1;
            state.bytes_written = 0;
            let path = self.file_path(state.seq);
            info!(file = %path.display(), "rotating to a new log segment");
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            state.file = Some(file);
        }
        Ok(state.bytes_written / self.config.page_size as u64)
    }

    /// Read back one previously appended block, for the scan iterator.
    pub fn read_block(&self, file: u64, block: u64) -> Result<LogPage> {
        use std::io::{Read, Seek, SeekFrom};
        let path = self.file_path(file);
        let mut f = File::open(path)?;
        let page_size = self.config.page_size as u64;
        f.seek(SeekFrom::Start(block * page_size))?;
        let mut buf = vec![0u8; page_size as usize];
        f.read_exact(&mut buf)?;
        Ok(deserialize_page(&buf, self.config.page_size))
    }

    /// Scan the newest file for trailing pages the block index has no
    /// entry for. Returns the orphan descriptors without reinserting them;
    /// per spec.md §9 recovery policy is deliberately out of scope beyond
    /// this discovery step.
    pub fn recover_tail_blocks(&self) -> Result<Vec<OrphanBlock>> {
        let state = self.state.lock().unwrap();
        let Some(seq) = (state.seq > 0).then_some(state.seq) else {
            return Ok(Vec::new());
        };
        let path = self.file_path(seq);
        let file_len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let page_size = self.config.page_size as u64;
        let total_blocks = file_len / page_size;

        let indexed = self.index.fetch_blocks(true)?;
        let max_indexed_block = indexed
            .iter()
            .filter(|b| b.file == seq)
            .map(|b| b.block)
            .max();

        let start = match max_indexed_block {
            Some(b) => b + 1,
            None => 0,
        };
        let mut orphans = Vec::new();
        for block in start..total_blocks {
            // Without a full page deserializer here, we record the block's
            // existence; the key range is filled in once a recovery pass
            // actually reads and decodes the block's directory.
            orphans.push(OrphanBlock {
                file: seq,
                block,
                min_key: 0,
                max_key: 0,
            });
        }
        Ok(orphans)
    }
}

fn is_log_file_name(name: &str) -> bool {
    let mut parts = name.split('.');
    let Some("log") = parts.next() else { return false };
    let Some(high) = parts.next() else { return false };
    let Some(low) = parts.next() else { return false };
    if parts.next().is_some() {
        return false;
    }
    high.chars().all(|c| c.is_ascii_digit())
        && !high.is_empty()
        && low.chars().all(|c| c.is_ascii_digit())
        && low.parse::<u64>().is_ok_and(|v| v >= 1)
}

/// Serialize a sorted page into a fixed `page_size`-byte on-disk block: a
/// leading record count, then `(object_id, seq_num, type, payload_len,
/// payload)` per record, zero-padded to `page_size`.
fn serialize_page(page: &LogPage, page_size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(page_size);
    buf.extend_from_slice(&(page.slot_count() as u32).to_be_bytes());
    for (hdr, payload) in page.iterate(true) {
        buf.extend_from_slice(&hdr.object_id().to_be_bytes());
        buf.extend_from_slice(&hdr.seq_num().to_be_bytes());
        buf.push(record_type_tag(hdr.record_type()));
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
    }
    assert!(buf.len() <= page_size, "serialized page exceeds page_size");
    buf.resize(page_size, 0);
    buf
}

/// Inverse of [`serialize_page`]: reconstruct a page from one fixed-size
/// on-disk block. Record order in the buffer is preserved by
/// `try_insert_raw`, so the rebuilt page iterates in the same (sorted)
/// order it was written in.
fn deserialize_page(buf: &[u8], page_size: usize) -> LogPage {
    let mut page = LogPage::new(page_size);
    let count = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let mut pos = 4usize;
    for _ in 0..count {
        let object_id = u64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let seq_num = u64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let record_type = RecordType::from_u8(buf[pos]);
        pos += 1;
        let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        let payload = &buf[pos..pos + len];
        pos += len;
        let hdr = crate::record::RecordHeader::new(object_id, seq_num, record_type);
        page.try_insert_raw(hdr, payload);
    }
    page
}

fn record_type_tag(record_type: RecordType) -> u8 {
    match record_type {
        RecordType::Construct => 0,
        RecordType::Insert => 1,
        RecordType::Remove => 2,
        RecordType::Update => 3,
        RecordType::Custom(v) => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SqliteBlockIndex;
    use crate::record::{encode_args, Arg, RecordHeader};
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path, file_size: u64) -> Config {
        Config::builder(dir.to_path_buf())
            .log_file_size(file_size)
            .page_size(256)
            .build()
            .unwrap()
    }

    fn filled_page() -> LogPage {
        let mut page = LogPage::new(256);
        let hdr = RecordHeader::new(5, 0, RecordType::Insert);
        let payload = encode_args(&[Arg::U64(1)]);
        assert!(page.try_insert(hdr, &payload));
        page
    }

    #[test]
    fn append_registers_a_block_in_the_index() {
        let dir = tempdir().unwrap();
        let index = Arc::new(SqliteBlockIndex::open_in_memory().unwrap());
        let log = FileBasedLog::open(test_config(dir.path(), 4096), index.clone()).unwrap();
        log.append_page(&filled_page(), 1).unwrap();
        let blocks = index.fetch_blocks(true).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].min_key, 5);
        assert_eq!(blocks[0].max_key, 5);
    }

    #[test]
    fn rotation_creates_new_files_once_cap_is_exceeded() {
        let dir = tempdir().unwrap();
        let index = Arc::new(SqliteBlockIndex::open_in_memory().unwrap());
        let log = FileBasedLog::open(test_config(dir.path(), 512), index).unwrap();
        for i in 0..5u64 {
            let mut page = LogPage::new(256);
            let hdr = RecordHeader::new(i, 0, RecordType::Insert);
            page.try_insert(hdr, &encode_args(&[Arg::U64(i)]));
            log.append_page(&page, i + 1).unwrap();
        }
        assert!(dir.path().join("log.0.1").exists());
        assert!(dir.path().join("log.0.2").exists());
        assert!(dir.path().join("log.0.3").exists());
    }

    #[test]
    fn is_log_file_name_matches_the_documented_pattern() {
        assert!(is_log_file_name("log.0.1"));
        assert!(is_log_file_name("log.12.345"));
        assert!(!is_log_file_name("log.0.0"));
        assert!(!is_log_file_name("index.db"));
        assert!(!is_log_file_name("log.0"));
    }

    #[test]
    fn recover_tail_blocks_is_empty_when_nothing_written() {
        let dir = tempdir().unwrap();
        let index = Arc::new(SqliteBlockIndex::open_in_memory().unwrap());
        let log = FileBasedLog::open(test_config(dir.path(), 4096), index).unwrap();
        assert!(log.recover_tail_blocks().unwrap().is_empty());
    }
}
