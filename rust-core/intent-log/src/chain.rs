// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Chained block format
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Every log block ends with a chain-link trailer that points to the next
// block and carries the seed the block was allocated with.
//
// Block layout:
//   [records ... (nused bytes)] [zero padding] [trailer (CHAIN_LINK_SIZE)]
//
// Trailer format (u64 fields in the block's byte order):
//   [magic] [next block pointer (72 bytes)] [nused] [mac] [seed (32 bytes)]
//   [checksum]
//
// The checksum is a CRC32 over the *expected* seed followed by the whole
// block with the checksum field zeroed. A torn write, a stale block from an
// older chain, or a block that was never written all fail this check, which
// is how a chain ends. Blocks whose next pointer is a hole were written
// after an allocation failure; their records were covered by a checkpoint
// instead, so they end the chain too.

use crc32fast::Hasher as Crc32Hasher;

use crate::blkptr::{BlockPtr, ByteOrder, ChainSeed, Decoder, BLKPTR_SIZE, SEED_SIZE};
use crate::crypt::{record_regions, BlockTransform};
use crate::error::{LogError, LogResult};
use crate::record::{decode_record, LogRecord};

/// Size of the trailer at the end of every log block.
pub const CHAIN_LINK_SIZE: usize = 8 + BLKPTR_SIZE + 8 + 8 + SEED_SIZE + 8;

/// Marks a trailer written by this format.
pub const CHAIN_LINK_MAGIC: u64 = 0x2f5b_ab10_c0de_1091;

const CHECKSUM_LEN: usize = 8;

/// Bytes available for records in a block of `block_size` bytes.
pub fn block_capacity(block_size: u64) -> usize {
    usize::try_from(block_size)
        .unwrap_or(usize::MAX)
        .saturating_sub(CHAIN_LINK_SIZE)
}

/// Seed block number `seq` must carry when it follows a block with
/// `prev_seed`.
pub fn encode_chain_header(seq: u64, prev_seed: &ChainSeed) -> ChainSeed {
    ChainSeed { seq, ..*prev_seed }
}

// ---------------------------------------------------------------------------
// ChainLink
// ---------------------------------------------------------------------------

/// Decoded block trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    /// Next block of the chain, or a hole.
    pub next: Option<BlockPtr>,
    /// Bytes of records at the start of the block.
    pub nused: u64,
    /// MAC produced by the block transform (0 when unencrypted).
    pub mac: u64,
    /// Seed the block was allocated with.
    pub seed: ChainSeed,
    /// CRC32 of the block, widened to 64 bits.
    pub checksum: u64,
}

impl ChainLink {
    /// Encode the trailer, exactly [`CHAIN_LINK_SIZE`] bytes.
    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHAIN_LINK_SIZE);
        order.put_u64(&mut out, CHAIN_LINK_MAGIC);
        BlockPtr::encode_into(self.next.as_ref(), &mut out, order);
        order.put_u64(&mut out, self.nused);
        order.put_u64(&mut out, self.mac);
        self.seed.encode_into(&mut out, order);
        order.put_u64(&mut out, self.checksum);
        out
    }

    /// Decode a trailer. Returns `None` on a short buffer or a bad magic.
    pub fn decode(bytes: &[u8], order: ByteOrder) -> Option<ChainLink> {
        if bytes.len() != CHAIN_LINK_SIZE {
            return None;
        }
        let mut dec = Decoder::new(bytes, order);
        if dec.u64()? != CHAIN_LINK_MAGIC {
            return None;
        }
        Some(ChainLink {
            next: dec.blkptr()?,
            nused: dec.u64()?,
            mac: dec.u64()?,
            seed: dec.seed()?,
            checksum: dec.u64()?,
        })
    }

    /// Trailer bytes fed to the transform as associated data.
    fn aad(&self, order: ByteOrder) -> Vec<u8> {
        ChainLink {
            mac: 0,
            checksum: 0,
            ..*self
        }
        .encode(order)
    }
}

fn block_checksum(seed: &ChainSeed, block: &[u8], order: ByteOrder) -> u64 {
    let mut seed_bytes = Vec::with_capacity(SEED_SIZE);
    seed.encode_into(&mut seed_bytes, order);
    let body_end = block.len() - CHECKSUM_LEN;

    let mut hasher = Crc32Hasher::new();
    hasher.update(&seed_bytes);
    hasher.update(&block[..body_end]);
    hasher.update(&[0u8; CHECKSUM_LEN]);
    u64::from(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Sealing
// ---------------------------------------------------------------------------

/// Finish a block for writing: seal its records with `transform` (encrypted
/// blocks only), then write the trailer and checksum. `link.mac` and
/// `link.checksum` are filled in.
pub fn seal_block(
    block: &mut [u8],
    link: &mut ChainLink,
    transform: Option<&dyn BlockTransform>,
    order: ByteOrder,
) -> LogResult<()> {
    let nused = usize::try_from(link.nused).unwrap_or(usize::MAX);
    if block.len() < CHAIN_LINK_SIZE || nused > block_capacity(block.len() as u64) {
        return Err(LogError::MalformedRecord {
            offset: nused,
            reason: format!("{nused} used bytes do not fit a {}-byte block", block.len()),
        });
    }

    link.mac = 0;
    link.checksum = 0;
    if let Some(transform) = transform {
        let regions = record_regions(&block[..nused], order)?;
        let aad = link.aad(order);
        link.mac = transform.seal(&link.seed, &mut block[..nused], &regions, &aad);
    }

    let trailer_at = block.len() - CHAIN_LINK_SIZE;
    block[trailer_at..].copy_from_slice(&link.encode(order));
    link.checksum = block_checksum(&link.seed, block, order);
    let checksum_at = block.len() - CHECKSUM_LEN;
    order.write_u64_at(block, checksum_at, link.checksum);
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Records and successor of a validated block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    /// Records in on-media order.
    pub records: Vec<LogRecord>,
    /// Next block of the chain.
    pub next: BlockPtr,
    /// Bytes of records in the block.
    pub nused: usize,
}

/// Validate a raw block read from `bp` and decode its records.
///
/// Returns `ChecksumMismatch` for every failure that means "the chain ends
/// here" and `MalformedRecord` only for a block that passed validation but
/// carries an invalid record.
pub fn decode_and_validate_block(
    raw: &[u8],
    bp: &BlockPtr,
    transform: Option<&dyn BlockTransform>,
) -> LogResult<DecodedBlock> {
    let order = bp.order;
    let end_of_chain = || LogError::ChecksumMismatch { seq: bp.seed.seq };

    if raw.len() < CHAIN_LINK_SIZE || raw.len() as u64 != bp.size {
        return Err(end_of_chain());
    }
    let trailer_at = raw.len() - CHAIN_LINK_SIZE;
    let link = ChainLink::decode(&raw[trailer_at..], order).ok_or_else(end_of_chain)?;

    if link.seed != bp.seed || link.checksum != block_checksum(&bp.seed, raw, order) {
        return Err(end_of_chain());
    }
    let next = link.next.ok_or_else(end_of_chain)?;
    if next.seed != bp.seed.successor() {
        return Err(end_of_chain());
    }
    let nused = usize::try_from(link.nused).map_err(|_| end_of_chain())?;
    if nused > trailer_at {
        return Err(end_of_chain());
    }

    let mut payload = raw[..nused].to_vec();
    if bp.encrypted {
        let transform = transform.ok_or(LogError::AuthenticationFailed { seq: bp.seed.seq })?;
        let regions = record_regions(&payload, order)?;
        transform.open(&bp.seed, &mut payload, &regions, &link.aad(order), link.mac)?;
    }

    let mut records = Vec::new();
    let mut at = 0usize;
    while at < nused {
        let (record, len) = decode_record(&payload[at..], order).map_err(|e| match e {
            LogError::MalformedRecord { offset, reason } => LogError::MalformedRecord {
                offset: offset + at,
                reason,
            },
            other => other,
        })?;
        records.push(record);
        at += len;
    }

    Ok(DecodedBlock {
        records,
        next,
        nused,
    })
}
