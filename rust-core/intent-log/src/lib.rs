// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log crate
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A write-ahead intent log for a copy-on-write transactional store. Callers
// record the effect of each modifying operation as an intent transaction
// (itx); `commit` makes the synchronous ones durable in a chain of log
// blocks long before the store's next checkpoint (generation sync) writes
// the change itself. After a crash the chain is claimed and replayed.
//
// # Architecture
//
// ```text
// itx_assign --> ItxStore (per generation) --commit--> log blocks --> BlockStore
//                                                         |
//          CheckpointEngine <-- sync / clean hooks --------+
//
// open --> claim --> replay (walk chain, ReplayTarget callbacks) --> destroy
// ```
//
// Itxs are queued per generation. A commit drains the synchronous ones into
// log blocks; one committer at a time is the writer for a batch. Itxs whose
// generation already synced are skipped. Written blocks are freed by the
// sync of the last generation they hold records of.
//
// ## On-media block format (host byte order of the writer)
//
// ```text
// [records ...]             -- each: txtype, reclen, txg, seq, body; 8-aligned
// [zero padding]
// [chain link trailer]      -- magic, next block pointer, nused, mac, seed, crc32
// ```
//
// A block is valid only when its trailer carries the seed predicted by the
// previous block's pointer and its checksum matches. The first invalid block
// ends the chain.
//
// ## Usage
//
// ```no_run
// use std::sync::Arc;
// use intent_log::{ClaimMode, DatasetId, IntentLog, LogConfig, MemoryPool};
//
// let pool = Arc::new(MemoryPool::new());
// let log = IntentLog::open(DatasetId(1), pool.clone(), pool.clone(), LogConfig::default()).unwrap();
// log.check_log_chain().unwrap();
// log.claim(ClaimMode::Normal).unwrap();
// // log.replay(&my_filesystem).unwrap();
// ```

pub mod blkptr;
pub mod chain;
pub mod commit;
pub mod config;
pub mod crypt;
pub mod engine;
pub mod error;
pub mod header;
pub mod itx;
pub mod log;
pub mod lwb;
pub mod memory;
pub mod record;
pub mod recovery;
pub mod replay;
pub mod stats;
pub mod store;
pub mod walker;

#[cfg(test)]
mod testutil;

// Re-export the primary public API for ergonomic imports.
pub use blkptr::{BlockAddr, BlockPtr, ByteOrder, ChainSeed, DeviceId};
pub use config::{ClaimMode, LogBias, LogConfig, SyncMode};
pub use crypt::{BlockTransform, NoTransform};
pub use engine::{CheckpointEngine, DatasetId, SyncContext, SyncParticipant, TxHandle};
pub use error::{EngineError, FetchError, LogError, LogResult, ReplayError, StoreError};
pub use header::LogHeader;
pub use itx::{DataFetcher, FetchContext, FetchOutcome, FetchTarget, Itx, ItxId, WriteState};
pub use log::IntentLog;
pub use memory::MemoryPool;
pub use record::{LogRecord, ObjectId, RecordBody, RecordKind};
pub use replay::{ReplayContext, ReplayTarget};
pub use stats::LogStats;
pub use store::{BlockStore, PendingWrite, WriteCompletion};
