// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Chain walker
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Walks a log chain from the header's first block, handing every block and
// every record to a visitor. Claim, check, replay and destroy are all
// visitors over this one walk.
//
// Once a chain has been claimed, the walk never goes past the highest block
// and record sequence the claim saw. A device that was missing during the
// claim may come back later and make more of the chain readable; those
// blocks were never claimed and must not be replayed or freed.

use tracing::{debug, trace};

use crate::blkptr::BlockPtr;
use crate::chain::decode_and_validate_block;
use crate::crypt::BlockTransform;
use crate::error::{LogError, StoreError};
use crate::header::LogHeader;
use crate::record::LogRecord;
use crate::store::BlockStore;

/// Callbacks driven by [`walk`].
pub trait ChainVisitor {
    /// Called for a block before it is read. An error stops the walk.
    fn visit_block(&mut self, bp: &BlockPtr) -> Result<(), LogError>;

    /// Called for every record of a valid block. An error stops the walk.
    fn visit_record(&mut self, record: &LogRecord, block: &BlockPtr) -> Result<(), LogError>;
}

/// What a walk saw.
#[derive(Debug, Default)]
pub struct WalkSummary {
    /// Why the walk stopped early, if it did. End-of-chain errors are
    /// included; callers decide whether they matter.
    pub error: Option<LogError>,
    /// Highest block sequence visited.
    pub max_blk_seq: u64,
    /// Highest record sequence visited.
    pub max_lr_seq: u64,
    /// Blocks visited.
    pub blk_count: u64,
    /// Records visited.
    pub lr_count: u64,
}

impl WalkSummary {
    /// The stop reason, unless it was the ordinary end of the chain.
    pub fn fatal(self) -> Option<LogError> {
        self.error.filter(|e| !e.is_end_of_chain())
    }
}

/// Walk the chain starting at `header.log`.
pub fn walk(
    header: &LogHeader,
    store: &dyn BlockStore,
    transform: Option<&dyn BlockTransform>,
    visitor: &mut dyn ChainVisitor,
) -> WalkSummary {
    let claimed = header.claim_txg != 0;
    let claim_blk_seq = if claimed { header.claim_blk_seq } else { u64::MAX };
    let claim_lr_seq = if claimed && header.claim_lr_seq_valid() {
        header.claim_lr_seq
    } else {
        u64::MAX
    };

    let mut summary = WalkSummary::default();
    let Some(mut bp) = header.log else {
        summary.error = Some(LogError::NoChain);
        return summary;
    };

    'chain: loop {
        let blk_seq = bp.seed.seq;
        if blk_seq > claim_blk_seq {
            break;
        }
        if let Err(e) = visitor.visit_block(&bp) {
            summary.error = Some(e);
            break;
        }
        summary.max_blk_seq = blk_seq;
        summary.blk_count += 1;

        if summary.max_lr_seq == claim_lr_seq && summary.max_blk_seq == claim_blk_seq {
            break;
        }

        let decoded = store
            .read_block(&bp)
            .map_err(|e| match e {
                StoreError::NotFound { .. } => LogError::ChecksumMismatch { seq: blk_seq },
                other => LogError::Store(other),
            })
            .and_then(|raw| decode_and_validate_block(&raw, &bp, transform));
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) if claimed && e.is_end_of_chain() && blk_seq < claim_blk_seq => {
                debug!(seq = blk_seq, "Claimed log block no longer validates");
                summary.error = Some(LogError::CorruptChain { seq: blk_seq });
                break;
            }
            Err(e) => {
                trace!(seq = blk_seq, error = %e, "Log chain walk stopped");
                summary.error = Some(e);
                break;
            }
        };

        for record in &decoded.records {
            if record.seq > claim_lr_seq {
                break 'chain;
            }
            if let Err(e) = visitor.visit_record(record, &bp) {
                summary.error = Some(e);
                break 'chain;
            }
            summary.max_lr_seq = record.seq;
            summary.lr_count += 1;
        }
        bp = decoded.next;
    }

    debug!(
        blocks = summary.blk_count,
        records = summary.lr_count,
        max_blk_seq = summary.max_blk_seq,
        max_lr_seq = summary.max_lr_seq,
        "Walked log chain"
    );
    summary
}
