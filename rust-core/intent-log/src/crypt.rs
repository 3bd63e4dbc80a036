// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Record encryption regions
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Encrypted datasets still need the claim walk to run without keys: it has
// to know each record's kind, length, generation and, for writes, where the
// referenced data lives. So every record is split into a *public* part (the
// common prefix, plus the block pointer of a write record) that stays in the
// clear and is only authenticated, and a *private* remainder handed to the
// block transform for sealing.

use crate::blkptr::{ByteOrder, ChainSeed, Decoder, BLKPTR_SIZE};
use crate::error::{LogError, LogResult};
use crate::record::{RecordKind, RECORD_PREFIX_LEN, TXTYPE_CASE_INSENSITIVE};

/// A byte range of a block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First byte of the range.
    pub start: usize,
    /// One past the last byte.
    pub end: usize,
    /// Whether the range is sealed (encrypted) or only authenticated.
    pub private: bool,
}

impl Region {
    fn new(start: usize, end: usize, private: bool) -> Self {
        Self { start, end, private }
    }

    /// Length of the range.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` for an empty range.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Split the used part of a block into public and private regions.
///
/// Only the public record prefixes are read, so this works on sealed and
/// unsealed payloads alike.
pub fn record_regions(payload: &[u8], order: ByteOrder) -> LogResult<Vec<Region>> {
    let mut regions = Vec::new();
    let mut at = 0usize;
    while at < payload.len() {
        let mut dec = Decoder::new(&payload[at..], order);
        let malformed = |reason: &str| LogError::MalformedRecord {
            offset: at,
            reason: reason.to_string(),
        };
        let txtype = dec.u64().ok_or_else(|| malformed("truncated record prefix"))?;
        let reclen = dec.u64().ok_or_else(|| malformed("truncated record prefix"))?;
        let reclen = usize::try_from(reclen).map_err(|_| malformed("record length overflows"))?;
        if reclen < RECORD_PREFIX_LEN || reclen % 8 != 0 || reclen > payload.len() - at {
            return Err(malformed("record length out of bounds"));
        }
        let kind = RecordKind::from_code(txtype & !TXTYPE_CASE_INSENSITIVE)?;

        let body = at + RECORD_PREFIX_LEN;
        let end = at + reclen;
        regions.push(Region::new(at, body, false));
        if kind == RecordKind::Write && reclen >= RECORD_PREFIX_LEN + 4 * 8 + BLKPTR_SIZE {
            let bp_start = body + 4 * 8;
            let bp_end = bp_start + BLKPTR_SIZE;
            regions.push(Region::new(body, bp_start, true));
            regions.push(Region::new(bp_start, bp_end, false));
            if bp_end < end {
                regions.push(Region::new(bp_end, end, true));
            }
        } else if body < end {
            regions.push(Region::new(body, end, true));
        }
        at = end;
    }
    Ok(regions)
}

// ---------------------------------------------------------------------------
// BlockTransform
// ---------------------------------------------------------------------------

/// Pluggable authenticated encryption over a block's private regions.
///
/// `aad` is the encoded chain-link trailer with its MAC and checksum fields
/// zeroed, so the trailer is bound to the payload.
pub trait BlockTransform: Send + Sync {
    /// Encrypt the private regions of `payload` in place and return the MAC.
    fn seal(&self, seed: &ChainSeed, payload: &mut [u8], regions: &[Region], aad: &[u8]) -> u64;

    /// Verify `mac` and decrypt the private regions of `payload` in place.
    fn open(
        &self,
        seed: &ChainSeed,
        payload: &mut [u8],
        regions: &[Region],
        aad: &[u8],
        mac: u64,
    ) -> LogResult<()>;
}

/// The identity transform used for unencrypted datasets.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransform;

impl BlockTransform for NoTransform {
    fn seal(&self, _seed: &ChainSeed, _payload: &mut [u8], _regions: &[Region], _aad: &[u8]) -> u64 {
        0
    }

    fn open(
        &self,
        seed: &ChainSeed,
        _payload: &mut [u8],
        _regions: &[Region],
        _aad: &[u8],
        mac: u64,
    ) -> LogResult<()> {
        if mac != 0 {
            return Err(LogError::AuthenticationFailed { seq: seed.seq });
        }
        Ok(())
    }
}
