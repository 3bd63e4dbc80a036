// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Log write buffers
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A log write buffer (lwb) is one allocated log block plus, until its write
// completes, the staging buffer being filled for it.
//
// Two views exist. `LwbEntry` lives in the log's block list (under the log
// lock) and is what checkpoint sync looks at to decide which blocks can be
// freed. `OpenLwb` is owned by the committing writer while records are
// copied in; it never needs the log lock.

use crate::blkptr::BlockPtr;
use crate::chain::block_capacity;

/// Number of recent block-size choices remembered by [`BlockSizer`].
pub const PREV_BLOCKS: usize = 16;

/// A block in the log's block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LwbEntry {
    /// Writer-assigned identity.
    pub id: u64,
    /// The block.
    pub blk: BlockPtr,
    /// Highest generation of anything in the block, including the
    /// generation its allocation belongs to.
    pub max_txg: u64,
    /// The block's buffer is still held (not written, or write in flight).
    pub buffered: bool,
}

/// The block currently being filled.
#[derive(Debug)]
pub struct OpenLwb {
    /// Matches the [`LwbEntry`] of the same block.
    pub id: u64,
    /// The block.
    pub blk: BlockPtr,
    /// Staging buffer, exactly `blk.size` bytes.
    pub buf: Vec<u8>,
    /// Bytes of records copied in.
    pub nused: usize,
    /// Highest generation of any record copied in.
    pub max_txg: u64,
    /// Set once the block joined a batch; touched blocks are written at the
    /// end of the batch even if every record turned out to be skippable.
    pub touched: bool,
}

impl OpenLwb {
    /// A fresh, empty buffer for `blk`.
    pub fn new(id: u64, blk: BlockPtr, max_txg: u64) -> Self {
        let size = usize::try_from(blk.size).unwrap_or(0);
        Self {
            id,
            blk,
            buf: vec![0u8; size],
            nused: 0,
            max_txg,
            touched: false,
        }
    }

    /// Bytes available for records.
    pub fn capacity(&self) -> usize {
        block_capacity(self.blk.size)
    }

    /// Returns `true` if `len` more bytes fit.
    pub fn fits(&self, len: usize) -> bool {
        len <= self.capacity().saturating_sub(self.nused)
    }

    /// Returns `true` if no record was copied in.
    pub fn is_empty(&self) -> bool {
        self.nused == 0
    }
}

/// Chooses the size of the next log block.
///
/// The size is the smallest bucket that holds everything committed since
/// the last batch plus the trailer, clamped to the largest block, then
/// raised to the largest choice among the last [`PREV_BLOCKS`]. Bursty
/// workloads therefore keep getting blocks big enough for their bursts.
#[derive(Debug, Clone)]
pub struct BlockSizer {
    buckets: Vec<u64>,
    max_block_size: u64,
    prev: [u64; PREV_BLOCKS],
    rotor: usize,
}

impl BlockSizer {
    /// A sizer over ascending `buckets`.
    pub fn new(buckets: Vec<u64>, max_block_size: u64) -> Self {
        Self {
            buckets,
            max_block_size,
            prev: [0; PREV_BLOCKS],
            rotor: 0,
        }
    }

    /// Size for a block that should hold `needed` bytes including trailer.
    pub fn next_size(&mut self, needed: u64) -> u64 {
        let bucket = self
            .buckets
            .iter()
            .copied()
            .find(|bucket| needed <= *bucket)
            .unwrap_or(self.max_block_size);
        let size = bucket.min(self.max_block_size);

        self.prev[self.rotor] = size;
        self.rotor = (self.rotor + 1) % PREV_BLOCKS;
        self.prev.iter().copied().fold(size, u64::max)
    }
}
