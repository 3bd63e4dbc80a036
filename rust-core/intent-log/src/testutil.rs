// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Helpers shared by the unit tests.

use crate::blkptr::{BlockPtr, ByteOrder, ChainSeed};
use crate::chain::{seal_block, ChainLink};
use crate::engine::CheckpointEngine;
use crate::memory::MemoryPool;
use crate::record::{encode_record, LogRecord, RecordBody};
use crate::store::BlockStore;

const BLOCK_SIZE: u64 = 4096;

/// Write a chain with one block per entry of `blocks` straight to durable
/// storage. Records are numbered from 1 and carry the pool's open
/// generation. The block after the last one is allocated but never
/// written, like the open block of a live log. Returns the head.
pub(crate) fn write_chain(pool: &MemoryPool, seed: ChainSeed, blocks: &[Vec<RecordBody>]) -> BlockPtr {
    let txg = pool.current_generation();
    let alloc = |seed: ChainSeed| {
        let addr = pool.alloc_log_block(txg, BLOCK_SIZE, false).unwrap();
        BlockPtr {
            device: addr.device,
            offset: addr.offset,
            size: BLOCK_SIZE,
            birth: txg,
            seed,
            order: ByteOrder::NATIVE,
            encrypted: false,
        }
    };

    let head = alloc(seed);
    let mut bp = head;
    let mut seq = 0;
    for bodies in blocks {
        let next = alloc(bp.seed.successor());
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        let mut nused = 0;
        for body in bodies {
            seq += 1;
            let record = LogRecord {
                case_insensitive: false,
                txg,
                seq,
                body: body.clone(),
            };
            let encoded = encode_record(&record);
            buf[nused..nused + encoded.len()].copy_from_slice(&encoded);
            nused += encoded.len();
        }
        let mut link = ChainLink {
            next: Some(next),
            nused: nused as u64,
            mac: 0,
            seed: bp.seed,
            checksum: 0,
        };
        seal_block(&mut buf, &mut link, None, ByteOrder::NATIVE).unwrap();
        pool.write_durable(&bp, buf);
        bp = next;
    }
    head
}
