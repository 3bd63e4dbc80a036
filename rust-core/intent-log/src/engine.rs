// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Checkpoint engine interface
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The intent log sits beside a copy-on-write engine that commits all dirty
// state in numbered generations. This module defines what the log needs
// from that engine, and the callbacks the engine drives during a sync.

use std::fmt;
use std::sync::Weak;

use crate::error::EngineError;

/// A dataset (one mounted filesystem) owning one intent log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DatasetId(pub u64);

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ds#{}", self.0)
    }
}

/// An open engine transaction. While a handle exists its generation cannot
/// finish syncing, so every handle must be passed back to
/// [`CheckpointEngine::commit_transaction`].
#[derive(Debug, PartialEq, Eq)]
pub struct TxHandle {
    txg: u64,
    id: u64,
}

impl TxHandle {
    /// Create a handle. Only engines construct these.
    pub fn new(txg: u64, id: u64) -> Self {
        Self { txg, id }
    }

    /// Generation the transaction was assigned to.
    pub fn txg(&self) -> u64 {
        self.txg
    }

    /// Engine-assigned transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Context passed to [`SyncParticipant::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncContext {
    /// Generation being synced.
    pub txg: u64,
}

/// Per-dataset hooks the engine calls while syncing a generation.
pub trait SyncParticipant: Send + Sync {
    /// Called while generation `ctx.txg` is syncing, before the dataset's
    /// header is written out.
    fn sync(&self, ctx: &SyncContext);

    /// Called after generation `synced` is fully on stable storage.
    fn clean(&self, synced: u64);
}

/// Services the intent log needs from the checkpoint engine.
pub trait CheckpointEngine: Send + Sync {
    /// Open a transaction in the currently open generation.
    fn begin_transaction(&self) -> Result<TxHandle, EngineError>;

    /// Release a transaction.
    fn commit_transaction(&self, tx: TxHandle);

    /// Make sure `dataset` takes part in the sync of `tx`'s generation.
    fn mark_dirty(&self, dataset: DatasetId, tx: &TxHandle);

    /// The currently open generation.
    fn current_generation(&self) -> u64;

    /// The newest generation fully on stable storage.
    fn last_synced_generation(&self) -> u64;

    /// First generation opened after the engine was (re)loaded. Blocks born
    /// before it were allocated by synced generations.
    fn first_usable_generation(&self) -> u64;

    /// Block until `generation` has synced. `0` means the currently open
    /// generation.
    fn wait_until_generation_synced(&self, generation: u64) -> Result<(), EngineError>;

    /// Generations after a freeze point are never written to the main
    /// store, so the log must carry everything in them.
    fn is_generation_frozen(&self, generation: u64) -> bool;

    /// Read the persisted log header of `dataset` (empty if none).
    fn load_log_header(&self, dataset: DatasetId) -> Result<Vec<u8>, EngineError>;

    /// Persist the log header of `dataset` as part of generation `txg`.
    fn store_log_header(&self, dataset: DatasetId, header: &[u8], txg: u64);

    /// Register the dataset's sync hooks.
    fn register_participant(&self, dataset: DatasetId, participant: Weak<dyn SyncParticipant>);

    /// Remove the dataset's sync hooks.
    fn unregister_participant(&self, dataset: DatasetId);
}
