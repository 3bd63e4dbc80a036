// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Persisted log header
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The header is the only piece of log state the checkpoint engine persists
// with the dataset. It is rewritten from `IntentLog::sync` once per
// generation.
//
// On-media format:
//   [magic] [log block pointer (72 bytes)] [claim_txg] [replay_seq]
//   [claim_blk_seq] [claim_lr_seq] [flags]
//
// The magic doubles as a byte-order mark. An empty buffer is the header of
// a dataset that never had a log.

use crate::blkptr::{BlockPtr, ByteOrder, Decoder, BLKPTR_SIZE};
use crate::error::{LogError, LogResult};

/// Encoded header size.
pub const HEADER_SIZE: usize = 8 + BLKPTR_SIZE + 5 * 8;

const HEADER_MAGIC: u64 = 0x1a7e_17c0_9e11_d0c5;

/// Header flag: the log holds records that have not been replayed.
pub const REPLAY_NEEDED: u64 = 1 << 0;

/// Header flag: `claim_lr_seq` is meaningful.
pub const CLAIM_LR_SEQ_VALID: u64 = 1 << 1;

/// Persisted per-dataset log state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogHeader {
    /// First block of the chain.
    pub log: Option<BlockPtr>,
    /// Generation in which the chain was claimed (0 if unclaimed).
    pub claim_txg: u64,
    /// Highest record sequence already replayed.
    pub replay_seq: u64,
    /// Highest block sequence seen by the claim.
    pub claim_blk_seq: u64,
    /// Highest record sequence seen by the claim.
    pub claim_lr_seq: u64,
    /// `REPLAY_NEEDED` | `CLAIM_LR_SEQ_VALID`.
    pub flags: u64,
}

impl LogHeader {
    /// Returns `true` if the chain still needs replay.
    pub fn replay_needed(&self) -> bool {
        self.flags & REPLAY_NEEDED != 0
    }

    /// Returns `true` if `claim_lr_seq` may be used as a walk limit.
    pub fn claim_lr_seq_valid(&self) -> bool {
        self.flags & CLAIM_LR_SEQ_VALID != 0
    }

    /// Returns `true` if the chain was written in a foreign byte order.
    pub fn is_foreign(&self) -> bool {
        self.log.is_some_and(|bp| !bp.order.is_native())
    }

    /// Encode in the host byte order.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_in(ByteOrder::NATIVE)
    }

    /// Encode in an explicit byte order.
    pub fn encode_in(&self, order: ByteOrder) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        order.put_u64(&mut out, HEADER_MAGIC);
        BlockPtr::encode_into(self.log.as_ref(), &mut out, order);
        for v in [
            self.claim_txg,
            self.replay_seq,
            self.claim_blk_seq,
            self.claim_lr_seq,
            self.flags,
        ] {
            order.put_u64(&mut out, v);
        }
        out
    }

    /// Decode a persisted header, detecting its byte order.
    pub fn decode(bytes: &[u8]) -> LogResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        if bytes.len() != HEADER_SIZE {
            return Err(LogError::CorruptHeader(format!(
                "expected {HEADER_SIZE} bytes, found {}",
                bytes.len()
            )));
        }
        let order = [ByteOrder::NATIVE, ByteOrder::NATIVE.swapped()]
            .into_iter()
            .find(|order| Decoder::new(bytes, *order).u64() == Some(HEADER_MAGIC))
            .ok_or_else(|| LogError::CorruptHeader("bad magic".to_string()))?;

        let truncated = || LogError::CorruptHeader("truncated".to_string());
        let mut dec = Decoder::new(&bytes[8..], order);
        Ok(Self {
            log: dec.blkptr().ok_or_else(truncated)?,
            claim_txg: dec.u64().ok_or_else(truncated)?,
            replay_seq: dec.u64().ok_or_else(truncated)?,
            claim_blk_seq: dec.u64().ok_or_else(truncated)?,
            claim_lr_seq: dec.u64().ok_or_else(truncated)?,
            flags: dec.u64().ok_or_else(truncated)?,
        })
    }
}
