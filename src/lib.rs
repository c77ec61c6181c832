// SPDX-License-Identifier: MIT

//! A write-optimized, per-object redo logging engine.
//!
//! Each logical object carries a durable, append-only redo log keyed by
//! `(object_id, seq_num)`. Transactions stage records in a per-thread
//! private log; at commit, the consolidation array elects a group leader
//! that merges every participant's records into a shared, epoch-stamped
//! page; a dedicated flusher thread persists pages in epoch order and
//! registers them in a block index, which a scan iterator later uses to
//! replay any object's history.
//!
//! # Example
//!
//! ```no_run
//! use calog::config::Config;
//! use calog::logger::Logger;
//! use calog::record::{Arg, RecordType};
//! use calog::system::System;
//! use calog::txn::TransactionContext;
//! use std::sync::Arc;
//!
//! let config = Config::builder("/var/lib/calog").build()?;
//! let system = Arc::new(System::open(config)?);
//!
//! let mut logger = Logger::new();
//! let mut ctx = TransactionContext::begin(system.clone())?;
//! logger.initialize(true)?;
//! logger.log(RecordType::Insert, &[Arg::Str("key0"), Arg::Str("value0")])?;
//! assert!(ctx.commit());
//! # Ok::<(), calog::error::Error>(())
//! ```

pub mod carray;
pub mod commit;
pub mod config;
pub mod error;
pub mod file_log;
pub mod flusher;
pub mod index;
pub mod logger;
pub mod page;
pub mod plog;
pub mod record;
pub mod ring;
pub mod scan;
pub mod system;
pub mod txn;

pub use config::Config;
pub use error::{Error, Result};
pub use logger::{Logger, Redoable};
pub use system::System;
pub use txn::TransactionContext;
