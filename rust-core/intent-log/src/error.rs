// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Error types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Defines the error conditions raised by the intent log and by the
// collaborators it drives: the block store, the checkpoint engine, the
// payload fetcher and the replay target.
//
// Some variants are *benign* and terminate a chain walk without failing it:
// `ChecksumMismatch` (the normal end of a log chain after a crash),
// `UnreadableData` (a write record whose data never made it out) and
// `NoChain` (the header has no first block). Everything else aborts the
// operation that observed it.

use thiserror::Error;

use crate::record::RecordKind;

/// Errors reported by a [`crate::store::BlockStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The device failed the read or write.
    #[error("device I/O error: {0}")]
    Io(String),

    /// The allocator has no room for a block of the requested size.
    #[error("no space for a {size}-byte block")]
    NoSpace {
        /// The requested block size in bytes.
        size: u64,
    },

    /// The block's device is not present.
    #[error("device {0} is missing")]
    MissingDevice(u32),

    /// The block was never written (or was lost with a volatile cache).
    #[error("block at device {device} offset {offset:#x} does not exist")]
    NotFound {
        /// Device holding the block.
        device: u32,
        /// Byte offset on the device.
        offset: u64,
    },

    /// A claim targeted a block that is already allocated to someone else.
    #[error("block at device {device} offset {offset:#x} is already in use")]
    AlreadyAllocated {
        /// Device holding the block.
        device: u32,
        /// Byte offset on the device.
        offset: u64,
    },
}

/// Errors reported by a [`crate::engine::CheckpointEngine`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine is shutting down and will not sync further generations.
    #[error("checkpoint engine is shut down")]
    Shutdown,

    /// Syncing a generation failed.
    #[error("generation {generation} failed to sync: {reason}")]
    SyncFailed {
        /// The generation that could not be synced.
        generation: u64,
        /// Engine-provided description.
        reason: String,
    },

    /// The stored log header could not be read.
    #[error("log header unavailable: {0}")]
    HeaderUnavailable(String),
}

/// Outcome of a payload fetch that did not produce data.
///
/// Every variant except `Io` means the record is no longer needed in the
/// log (the object is gone or its data is already on stable storage); `Io`
/// forces the commit to wait for a full checkpoint instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Reading or writing the payload failed.
    #[error("payload I/O error: {0}")]
    Io(String),

    /// The object was removed before its data could be logged.
    #[error("object no longer exists")]
    NotFound,

    /// The data already reached the main store.
    #[error("data already synced")]
    AlreadySynced,

    /// Another writer is already logging this block.
    #[error("block write already in progress")]
    InProgress,
}

/// Errors returned by a [`crate::replay::ReplayTarget`] callback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplayError {
    /// The target object does not exist.
    #[error("object {0} not found")]
    ObjectNotFound(u64),

    /// The name or object being created already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The callback failed for another reason.
    #[error("{0}")]
    Failed(String),
}

/// Errors that can occur during intent log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// A log block failed validation: its checksum, seed, chain link, or
    /// used-byte count did not match what the previous block predicted.
    /// This is how every log chain ends, so walkers treat it as the end of
    /// valid data rather than a failure.
    #[error("checksum mismatch in log block seq {seq}")]
    ChecksumMismatch {
        /// Sequence number of the block that failed validation.
        seq: u64,
    },

    /// The header does not point at any log block.
    #[error("log has no chain")]
    NoChain,

    /// A write record's data block could not be read. The log block was
    /// written before the data it points to, so the record was never
    /// acknowledged and the walk ends here.
    #[error("data block of record seq {seq} is unreadable")]
    UnreadableData {
        /// Sequence number of the write record.
        seq: u64,
    },

    /// A block inside the claimed range no longer validates.
    #[error("log block seq {seq} inside the claimed range is corrupt")]
    CorruptChain {
        /// Sequence number of the block.
        seq: u64,
    },

    /// A record inside a validated block is structurally invalid.
    #[error("malformed record at offset {offset}: {reason}")]
    MalformedRecord {
        /// Byte offset of the record within the block payload.
        offset: usize,
        /// What was wrong.
        reason: String,
    },

    /// A record carries a type code this build does not understand.
    #[error("unknown record type {0}")]
    UnknownRecordKind(u64),

    /// The block store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The checkpoint engine failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A replay callback failed for a reason other than a vanished object.
    #[error("replay of {kind:?} record seq {seq} failed: {source}")]
    ReplayFailed {
        /// Sequence number of the lowest failing record.
        seq: u64,
        /// The record kind being replayed.
        kind: RecordKind,
        /// The callback's error.
        #[source]
        source: ReplayError,
    },

    /// The block transform rejected a block.
    #[error("block authentication failed for seq {seq}")]
    AuthenticationFailed {
        /// Sequence number of the block.
        seq: u64,
    },

    /// The log holds records that have not been replayed yet.
    #[error("log has unreplayed records")]
    Busy,

    /// The persisted header could not be decoded.
    #[error("corrupt log header: {0}")]
    CorruptHeader(String),

    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON (de)serialization of the configuration failed.
    #[error("configuration JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LogError {
    /// Returns `true` for errors that mark the end of the valid log rather
    /// than a failure.
    pub fn is_end_of_chain(&self) -> bool {
        matches!(
            self,
            LogError::ChecksumMismatch { .. } | LogError::NoChain | LogError::UnreadableData { .. }
        )
    }
}

/// Convenience type alias for intent log results.
pub type LogResult<T> = Result<T, LogError>;
