// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Claim, check and chain freeing
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// After a crash the blocks of the unsynced part of the chain were allocated
// in generations that never synced, so the allocator no longer knows about
// them. Claiming walks the chain once and re-reserves those blocks (and the
// data blocks indirect write records point at) before anything else can
// allocate over them. The claim records how far it got, which bounds every
// later walk of the same chain.

use std::collections::HashSet;

use tracing::{debug, info, trace, warn};

use crate::blkptr::{BlockAddr, BlockPtr};
use crate::config::ClaimMode;
use crate::crypt::BlockTransform;
use crate::error::{LogError, LogResult, StoreError};
use crate::header::{LogHeader, CLAIM_LR_SEQ_VALID, REPLAY_NEEDED};
use crate::log::IntentLog;
use crate::record::{LogRecord, RecordBody};
use crate::store::BlockStore;
use crate::walker::{walk, ChainVisitor};

// ---------------------------------------------------------------------------
// Visitors
// ---------------------------------------------------------------------------

/// Claims (or, without a generation, only verifies) every block born at or
/// after `first_txg`.
struct ClaimVisitor<'a> {
    store: &'a dyn BlockStore,
    txg: Option<u64>,
    first_txg: u64,
    seen: HashSet<BlockAddr>,
}

impl<'a> ClaimVisitor<'a> {
    fn new(store: &'a dyn BlockStore, txg: Option<u64>, first_txg: u64) -> Self {
        Self {
            store,
            txg,
            first_txg,
            seen: HashSet::new(),
        }
    }

    fn claim(&mut self, bp: &BlockPtr) -> Result<(), LogError> {
        if bp.birth < self.first_txg || !self.seen.insert(bp.addr()) {
            return Ok(());
        }
        match self.store.claim_block(bp, self.txg) {
            Ok(()) => Ok(()),
            Err(StoreError::AlreadyAllocated { .. }) => {
                trace!(block = %bp, "Block already allocated");
                Ok(())
            }
            Err(e) => Err(LogError::Store(e)),
        }
    }
}

impl ChainVisitor for ClaimVisitor<'_> {
    fn visit_block(&mut self, bp: &BlockPtr) -> Result<(), LogError> {
        self.claim(bp)
    }

    fn visit_record(&mut self, record: &LogRecord, _block: &BlockPtr) -> Result<(), LogError> {
        let RecordBody::Write(body) = &record.body else {
            return Ok(());
        };
        let Some(data) = body.blkptr else {
            return Ok(());
        };
        if data.birth < self.first_txg {
            return Ok(());
        }
        // A log block can reach the disk before the data it points at.
        // Nothing past such a record was ever acknowledged.
        match self.store.read_block(&data) {
            Ok(_) => {}
            Err(StoreError::NotFound { .. }) => {
                return Err(LogError::UnreadableData { seq: record.seq });
            }
            Err(e) => return Err(LogError::Store(e)),
        }
        self.claim(&data)
    }
}

/// Frees every block of a chain, plus the claimed data blocks of its write
/// records.
struct FreeVisitor<'a> {
    store: &'a dyn BlockStore,
    txg: u64,
    claim_txg: u64,
    seen: HashSet<BlockAddr>,
    freed: usize,
}

impl ChainVisitor for FreeVisitor<'_> {
    fn visit_block(&mut self, bp: &BlockPtr) -> Result<(), LogError> {
        if self.seen.insert(bp.addr()) {
            self.store.free_block(bp, self.txg);
            self.freed += 1;
        }
        Ok(())
    }

    fn visit_record(&mut self, record: &LogRecord, _block: &BlockPtr) -> Result<(), LogError> {
        if let RecordBody::Write(body) = &record.body {
            if let Some(data) = body.blkptr {
                // Unclaimed data blocks belong to the object store.
                if self.claim_txg != 0 && data.birth >= self.claim_txg && self.seen.insert(data.addr()) {
                    self.store.free_block(&data, self.txg);
                    self.freed += 1;
                }
            }
        }
        Ok(())
    }
}

/// Free the chain starting at `header.log` as part of generation `txg`.
pub(crate) fn free_chain(
    header: &LogHeader,
    store: &dyn BlockStore,
    transform: Option<&dyn BlockTransform>,
    txg: u64,
) {
    let mut visitor = FreeVisitor {
        store,
        txg,
        claim_txg: header.claim_txg,
        seen: HashSet::new(),
        freed: 0,
    };
    let summary = walk(header, store, transform, &mut visitor);
    debug!(txg, freed = visitor.freed, "Freed log chain");
    if let Some(e) = summary.fatal() {
        warn!(txg, error = %e, "Log chain only partly freed");
    }
}

// ---------------------------------------------------------------------------
// Claim and check
// ---------------------------------------------------------------------------

impl IntentLog {
    /// Reserve the storage of the unsynced part of the chain after a crash
    /// and decide whether a replay is needed.
    ///
    /// Runs at most once per crash; a claimed header makes later calls a
    /// no-op. `ClaimMode::Discard` drops the chain instead.
    pub fn claim(&self, mode: ClaimMode) -> LogResult<()> {
        let tx = self.engine.begin_transaction()?;
        let txg = tx.txg();
        let first_txg = self.engine.first_usable_generation();
        let header = self.header();

        let head_missing = header
            .log
            .is_some_and(|bp| !self.store.device_present(bp.device));
        let tolerated =
            head_missing && !header.replay_needed() && self.config.tolerate_missing_log_device;

        if mode == ClaimMode::Discard || tolerated {
            if let Some(head) = header.log {
                self.store.free_block(&head, txg);
            }
            *self.header.lock() = LogHeader::default();
            self.engine.mark_dirty(self.dataset, &tx);
            self.engine.commit_transaction(tx);
            info!(dataset = %self.dataset, txg, missing_device = tolerated, "Discarded intent log");
            return Ok(());
        }

        if header.claim_txg != 0 || header.log.is_none() {
            self.engine.commit_transaction(tx);
            return Ok(());
        }

        let transform = self.transform.read().clone();
        let mut visitor = ClaimVisitor::new(self.store.as_ref(), Some(txg), first_txg);
        let summary = walk(&header, self.store.as_ref(), transform.as_deref(), &mut visitor);
        let (blk_seq, lr_seq) = (summary.max_blk_seq, summary.max_lr_seq);
        let (blk_count, lr_count) = (summary.blk_count, summary.lr_count);
        if let Some(e) = summary.fatal() {
            self.engine.commit_transaction(tx);
            warn!(dataset = %self.dataset, error = %e, "Log claim failed");
            return Err(e);
        }

        let replay_needed = lr_count > 0 || blk_count > 1;
        {
            let mut header = self.header.lock();
            header.claim_txg = first_txg;
            header.claim_blk_seq = blk_seq;
            header.claim_lr_seq = lr_seq;
            header.flags |= CLAIM_LR_SEQ_VALID;
            if replay_needed {
                header.flags |= REPLAY_NEEDED;
            }
        }
        self.engine.mark_dirty(self.dataset, &tx);
        self.engine.commit_transaction(tx);

        info!(
            dataset = %self.dataset,
            claim_txg = first_txg,
            blocks = blk_count,
            records = lr_count,
            replay_needed,
            "Claimed intent log"
        );
        Ok(())
    }

    /// Verify that the chain can be claimed (before a claim) or replayed
    /// (after one) without changing anything.
    pub fn check_log_chain(&self) -> LogResult<()> {
        let header = self.header();
        let Some(head) = header.log else {
            return Ok(());
        };
        if !self.store.device_present(head.device)
            && !header.replay_needed()
            && self.config.tolerate_missing_log_device
        {
            warn!(dataset = %self.dataset, device = %head.device, "Log device missing; nothing to replay");
            return Ok(());
        }

        let first_txg = if header.claim_txg != 0 {
            u64::MAX
        } else {
            self.engine.first_usable_generation()
        };
        let transform = self.transform.read().clone();
        let mut visitor = ClaimVisitor::new(self.store.as_ref(), None, first_txg);
        let summary = walk(&header, self.store.as_ref(), transform.as_deref(), &mut visitor);
        match summary.fatal() {
            Some(e) => {
                warn!(dataset = %self.dataset, error = %e, "Log chain check failed");
                Err(e)
            }
            None => Ok(()),
        }
    }
}
