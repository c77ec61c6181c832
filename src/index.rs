// SPDX-License-Identifier: MIT

//! Block index (C10): persistent map from object-id range to the file
//! pages that carry a record of it.
//!
//! Grounded on `hdds-persistence/src/sqlite.rs` for the `Mutex<Connection>`
//! + `init_schema` + row-mapping shape; schema columns are spec.md §3's
//! block-index entry.

use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// One row of the block index: a shared page's location plus the
/// object-id range it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub level: u32,
    pub first_epoch: u64,
    pub last_epoch: u64,
    pub file: u64,
    pub block: u64,
    pub min_key: u64,
    pub max_key: u64,
}

/// Storage-agnostic block index contract; `log_file_size` rotation and the
/// SQL engine choice stay behind this trait so a different ordered store
/// could stand in without touching the flusher or scan iterator.
pub trait BlockIndex: Send + Sync {
    fn insert_block(&self, entry: BlockEntry) -> Result<()>;
    fn fetch_blocks(&self, forward: bool) -> Result<Vec<BlockEntry>>;
    fn fetch_blocks_for_key(&self, key: u64, forward: bool) -> Result<Vec<BlockEntry>>;
    fn clear(&self) -> Result<()>;
}

/// SQLite-backed block index, the reference implementation spec.md names.
pub struct SqliteBlockIndex {
    conn: Mutex<Connection>,
}

impl SqliteBlockIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let index = Self { conn: Mutex::new(conn) };
        index.init_schema()?;
        Ok(index)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let index = Self { conn: Mutex::new(conn) };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                level INTEGER NOT NULL,
                first_epoch INTEGER NOT NULL,
                last_epoch INTEGER NOT NULL,
                file INTEGER NOT NULL,
                block INTEGER NOT NULL,
                min_key INTEGER NOT NULL,
                max_key INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_blocks_key_range ON blocks(min_key, max_key)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_blocks_epoch ON blocks(first_epoch)",
            [],
        )?;
        Ok(())
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<BlockEntry> {
        Ok(BlockEntry {
            level: row.get::<_, i64>(0)? as u32,
            first_epoch: row.get::<_, i64>(1)? as u64,
            last_epoch: row.get::<_, i64>(2)? as u64,
            file: row.get::<_, i64>(3)? as u64,
            block: row.get::<_, i64>(4)? as u64,
            min_key: row.get::<_, i64>(5)? as u64,
            max_key: row.get::<_, i64>(6)? as u64,
        })
    }

    #[allow(dead_code)]
    fn find_orphan_candidate(&self, file: u64, block: u64) -> Result<Option<BlockEntry>> {
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                "SELECT level, first_epoch, last_epoch, file, block, min_key, max_key
                 FROM blocks WHERE file = ?1 AND block = ?2",
                params![file as i64, block as i64],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }
}

impl BlockIndex for SqliteBlockIndex {
    fn insert_block(&self, entry: BlockEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO blocks (level, first_epoch, last_epoch, file, block, min_key, max_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.level as i64,
                entry.first_epoch as i64,
                entry.last_epoch as i64,
                entry.file as i64,
                entry.block as i64,
                entry.min_key as i64,
                entry.max_key as i64,
            ],
        )?;
        Ok(())
    }

    fn fetch_blocks(&self, forward: bool) -> Result<Vec<BlockEntry>> {
        let conn = self.conn.lock().unwrap();
        let query = if forward {
            "SELECT level, first_epoch, last_epoch, file, block, min_key, max_key
             FROM blocks ORDER BY level DESC, first_epoch ASC"
        } else {
            "SELECT level, first_epoch, last_epoch, file, block, min_key, max_key
             FROM blocks ORDER BY level DESC, last_epoch DESC"
        };
        let mut stmt = conn.prepare(query)?;
        let rows = stmt.query_map([], Self::row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn fetch_blocks_for_key(&self, key: u64, forward: bool) -> Result<Vec<BlockEntry>> {
        let conn = self.conn.lock().unwrap();
        let query = if forward {
            "SELECT level, first_epoch, last_epoch, file, block, min_key, max_key
             FROM blocks WHERE min_key <= ?1 AND ?1 <= max_key
             ORDER BY level DESC, first_epoch ASC"
        } else {
            "SELECT level, first_epoch, last_epoch, file, block, min_key, max_key
             FROM blocks WHERE min_key <= ?1 AND ?1 <= max_key
             ORDER BY level DESC, last_epoch DESC"
        };
        let mut stmt = conn.prepare(query)?;
        let rows = stmt.query_map(params![key as i64], Self::row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM blocks", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(first_epoch: u64, file: u64, block: u64, min_key: u64, max_key: u64) -> BlockEntry {
        BlockEntry {
            level: 0,
            first_epoch,
            last_epoch: first_epoch,
            file,
            block,
            min_key,
            max_key,
        }
    }

    #[test]
    fn insert_and_fetch_all_forward_orders_by_epoch_ascending() {
        let index = SqliteBlockIndex::open_in_memory().unwrap();
        index.insert_block(entry(2, 0, 1, 10, 20)).unwrap();
        index.insert_block(entry(1, 0, 0, 0, 9)).unwrap();
        let blocks = index.fetch_blocks(true).unwrap();
        assert_eq!(blocks.iter().map(|b| b.first_epoch).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn fetch_blocks_for_key_filters_by_range() {
        let index = SqliteBlockIndex::open_in_memory().unwrap();
        index.insert_block(entry(1, 0, 0, 0, 9)).unwrap();
        index.insert_block(entry(2, 0, 1, 10, 20)).unwrap();
        let blocks = index.fetch_blocks_for_key(15, true).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block, 1);
    }

    #[test]
    fn clear_empties_the_index() {
        let index = SqliteBlockIndex::open_in_memory().unwrap();
        index.insert_block(entry(1, 0, 0, 0, 9)).unwrap();
        index.clear().unwrap();
        assert!(index.fetch_blocks(true).unwrap().is_empty());
    }
}
