// SPDX-License-Identifier: MIT

//! Object logger (C12) and redo recovery contract.
//!
//! `Logger` is the per-object `(object_id, seq)` counter an application's
//! data structure embeds to emit records. Recovery is expressed as the
//! [`Redoable`] trait, a generalization of the type-dispatched redo
//! functions described by `original_source/src/lrtype.h` and
//! `persistent_map.h`: recovery knows nothing about a specific object's
//! semantics beyond "apply this record".

use crate::error::Result;
use crate::file_log::FileBasedLog;
use crate::index::BlockIndex;
use crate::record::{Arg, ArgReader, RecordHeader, RecordType};
use crate::scan::ScanIterator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-object identity and sequence counter. Embedded by the application's
/// data structure; every mutation calls [`Logger::log`] to emit a record
/// into the active transaction context.
#[derive(Debug, Default)]
pub struct Logger {
    object_id: u64,
    seq: u64,
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    /// Assign a fresh process-wide object id. When `log_it` is set, also
    /// emits a `Construct` record.
    pub fn initialize(&mut self, log_it: bool) -> Result<()> {
        self.object_id = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        self.seq = 0;
        if log_it {
            self.log(RecordType::Construct, &[])?;
        }
        Ok(())
    }

    /// Construct a header `{object_id, seq, record_type}`, encode `args`,
    /// and forward it to the active transaction context's plog.
    pub fn log(&mut self, record_type: RecordType, args: &[Arg<'_>]) -> Result<()> {
        let hdr = RecordHeader::new(self.object_id, self.seq, record_type);
        let payload = crate::record::encode_args(args);
        crate::txn::log_into_active(hdr, &payload)?;
        self.seq += 1;
        Ok(())
    }
}

/// Implemented by an application's data structure to replay its own
/// records during recovery. `apply` sees records in `(epoch, seq_num)`
/// order, i.e. the order they were originally logged in.
pub trait Redoable: Default {
    fn apply(&mut self, record_type: RecordType, args: &mut ArgReader<'_>);
}

/// Rebuild a `T` by replaying every durable record for `object_id`, oldest
/// first.
pub fn recover<T: Redoable>(log: Arc<FileBasedLog>, index: &dyn BlockIndex, object_id: u64) -> Result<T> {
    let mut target = T::default();
    for record in ScanIterator::fetch(log, index, object_id, true)? {
        let mut reader = ArgReader::new(&record.payload);
        target.apply(record.header.record_type(), &mut reader);
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::index::SqliteBlockIndex;
    use crate::record::DecodedArg;
    use crate::txn::TransactionContext;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[derive(Default)]
    struct ReplayedMap {
        entries: BTreeMap<String, String>,
    }

    impl Redoable for ReplayedMap {
        fn apply(&mut self, record_type: RecordType, args: &mut ArgReader<'_>) {
            if let RecordType::Insert = record_type {
                if let (Some(DecodedArg::Str(k)), Some(DecodedArg::Str(v))) = (args.next(), args.next()) {
                    self.entries.insert(k, v);
                }
            }
        }
    }

    #[test]
    fn recover_replays_inserts_in_order() {
        let dir = tempdir().unwrap();
        let config = Config::builder(dir.path().to_path_buf()).build().unwrap();
        let index = Arc::new(SqliteBlockIndex::open(&config.log_index_file()).unwrap());
        let log = Arc::new(FileBasedLog::open(config, index.clone()).unwrap());
        let system = Arc::new(crate::system::System::assemble(log.clone(), index.clone()));

        let mut logger = Logger::new();
        let mut ctx = TransactionContext::begin(system.clone()).unwrap();
        logger.initialize(false).unwrap();
        for (k, v) in [("key0", "value0"), ("key1", "value1")] {
            logger
                .log(RecordType::Insert, &[Arg::Str(k), Arg::Str(v)])
                .unwrap();
        }
        assert!(ctx.commit());

        let replayed: ReplayedMap = recover(log, index.as_ref(), logger.object_id()).unwrap();
        assert_eq!(replayed.entries.get("key0"), Some(&"value0".to_string()));
        assert_eq!(replayed.entries.get("key1"), Some(&"value1".to_string()));
    }
}
