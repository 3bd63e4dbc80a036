// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Block store interface
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The allocator and durable object store behind the log. Block writes are
// asynchronous: the caller hands over an owned buffer together with a
// one-shot completion, and later waits on the matching `PendingWrite`.

use std::collections::BTreeSet;

use crossbeam::channel::{self, Receiver, Sender};

use crate::blkptr::{BlockAddr, BlockPtr, DeviceId};
use crate::error::StoreError;

// ---------------------------------------------------------------------------
// Write completions
// ---------------------------------------------------------------------------

/// Sending half of a block write's completion. The store calls
/// [`WriteCompletion::complete`] exactly once when the write finished.
#[derive(Debug)]
pub struct WriteCompletion {
    tx: Sender<Result<(), StoreError>>,
}

/// Receiving half of a block write's completion.
#[derive(Debug)]
pub struct PendingWrite {
    rx: Receiver<Result<(), StoreError>>,
}

impl WriteCompletion {
    /// Create a connected completion / pending pair.
    pub fn pair() -> (WriteCompletion, PendingWrite) {
        let (tx, rx) = channel::bounded(1);
        (WriteCompletion { tx }, PendingWrite { rx })
    }

    /// Report the outcome of the write.
    pub fn complete(self, result: Result<(), StoreError>) {
        // The waiter may have given up already.
        let _ = self.tx.send(result);
    }
}

impl PendingWrite {
    /// Block until the write finished. A completion dropped without being
    /// signalled counts as an I/O error.
    pub fn wait(self) -> Result<(), StoreError> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(StoreError::Io("write abandoned".to_string())))
    }

    /// Returns the outcome if the write already finished.
    pub fn try_wait(&self) -> Option<Result<(), StoreError>> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// BlockStore
// ---------------------------------------------------------------------------

/// Allocator and durable block storage.
pub trait BlockStore: Send + Sync {
    /// Allocate `size` bytes for a log block in `generation`. The
    /// allocation only survives a crash once `generation` synced.
    fn alloc_log_block(
        &self,
        generation: u64,
        size: u64,
        prefer_fast_tier: bool,
    ) -> Result<BlockAddr, StoreError>;

    /// Free a block as part of `generation`. The space becomes reusable
    /// only after that generation synced.
    fn free_block(&self, bp: &BlockPtr, generation: u64);

    /// Claim an allocation found by the recovery walk. With `None` only
    /// check that the claim would succeed.
    fn claim_block(&self, bp: &BlockPtr, generation: Option<u64>) -> Result<(), StoreError>;

    /// Start writing `data` to `bp`; `done` is completed when the write is
    /// on the device (not necessarily past its write cache).
    fn write_block_async(&self, bp: &BlockPtr, data: Vec<u8>, done: WriteCompletion);

    /// Read a whole block.
    fn read_block(&self, bp: &BlockPtr) -> Result<Vec<u8>, StoreError>;

    /// Flush the write caches of `devices`.
    fn flush_device_caches(&self, devices: &BTreeSet<DeviceId>) -> Result<(), StoreError>;

    /// Returns `true` if `device` is present.
    fn device_present(&self, device: DeviceId) -> bool;
}
