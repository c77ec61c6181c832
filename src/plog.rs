// SPDX-License-Identifier: MIT

//! Private log (plog, C2): per-transaction staging area.
//!
//! A plog is a tagged union of one primary page and an overflow chain,
//! as spec.md §9 prescribes: `Plog = Primary(Page) | Overflow(Chain)`. The
//! transition is one-way — once a record spills, the plog never goes back
//! to `Primary`.

use crate::commit::CommitBuffer;
use crate::error::{Error, Result};
use crate::page::{LogPage, DEFAULT_PAGE_SIZE};
use crate::record::RecordHeader;

enum PlogState {
    Primary(LogPage),
    Overflow { primary: LogPage, chain: Vec<LogPage> },
}

/// Per-transaction staging area. Records land here via [`Plog::log`] until
/// the owning [`crate::txn::TransactionContext`] commits, at which point
/// every page is merged into the shared log through a [`CommitBuffer`].
pub struct Plog {
    state: PlogState,
    page_size: usize,
}

impl Plog {
    pub fn new(page_size: usize) -> Self {
        Self {
            state: PlogState::Primary(LogPage::new(page_size)),
            page_size,
        }
    }

    pub fn with_default_page_size() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }

    /// The primary page, for introspection (e.g. counting staged records
    /// before commit). Does not reflect overflow pages.
    pub fn primary_page(&self) -> &LogPage {
        match &self.state {
            PlogState::Primary(p) => p,
            PlogState::Overflow { primary, .. } => primary,
        }
    }

    fn current_page_mut(&mut self) -> &mut LogPage {
        match &mut self.state {
            PlogState::Primary(p) => p,
            PlogState::Overflow { chain, .. } => chain.last_mut().expect("overflow chain never empty"),
        }
    }

    fn spill(&mut self) {
        let fresh = LogPage::new(self.page_size);
        let placeholder = PlogState::Overflow {
            primary: LogPage::new(0),
            chain: Vec::new(),
        };
        match std::mem::replace(&mut self.state, placeholder) {
            PlogState::Primary(primary) => {
                self.state = PlogState::Overflow {
                    primary,
                    chain: vec![fresh],
                };
            }
            PlogState::Overflow { primary, mut chain } => {
                chain.push(fresh);
                self.state = PlogState::Overflow { primary, chain };
            }
        }
    }

    /// Insert a record, encoding `encoded_args` as the payload. On failure
    /// (the current page is full), appends a new empty overflow page and
    /// retries once; a second failure on a fresh page means the record
    /// itself is larger than a page and is fatal.
    pub fn log(&mut self, hdr: RecordHeader, encoded_args: &[u8]) -> Result<()> {
        if self.current_page_mut().try_insert(hdr, encoded_args) {
            return Ok(());
        }
        self.spill();
        if self.current_page_mut().try_insert(hdr, encoded_args) {
            return Ok(());
        }
        Err(Error::CapacityExceeded(format!(
            "record of {} bytes does not fit in an empty page",
            encoded_args.len()
        )))
    }

    /// Iterate every record across primary then overflow pages, in
    /// insertion order.
    pub fn iterate(&self) -> impl Iterator<Item = (&RecordHeader, &[u8])> {
        let pages: Vec<&LogPage> = match &self.state {
            PlogState::Primary(p) => vec![p],
            PlogState::Overflow { primary, chain } => {
                let mut v = vec![primary];
                v.extend(chain.iter());
                v
            }
        };
        pages.into_iter().flat_map(|p| p.iterate(true))
    }

    /// Merge every page (primary, then overflow) into `commit_buffer`,
    /// returning the epoch of the *last* page's insertion. A multi-page
    /// transaction may straddle multiple epochs; waiting on the last one
    /// covers all prior ones since epochs are flushed strictly in order.
    pub fn insert_into_buffer(&mut self, commit_buffer: &CommitBuffer) -> Result<u64> {
        let pages: Vec<&mut LogPage> = match &mut self.state {
            PlogState::Primary(p) => vec![p],
            PlogState::Overflow { primary, chain } => {
                let mut v = vec![primary];
                v.extend(chain.iter_mut());
                v
            }
        };
        let mut last_epoch = None;
        for page in pages {
            if page.is_empty() {
                continue;
            }
            last_epoch = Some(commit_buffer.insert(page)?);
        }
        last_epoch.ok_or_else(|| Error::InactiveContext("commit of an empty plog".into()))
    }
}
