// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Intent transaction store
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Pending itxs are queued per generation. Each generation slot holds a
// synchronous list (committed by the next `commit`) and an asynchronous
// index keyed by object, whose entries only reach the log when something
// asks for them: a commit of that object, a full commit, or a rename of the
// object (which must not become durable before the object's data).
//
// The slots form a ring of `GENERATION_SLOTS` entries indexed by
// `txg % GENERATION_SLOTS`. At most `CONCURRENT_GENERATIONS` generations are
// unsynced at once, so a slot still holding an older generation when a newer
// one arrives was synced but not yet cleaned; its itxs can be dropped.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::blkptr::{BlockPtr, DeviceId};
use crate::error::FetchError;
use crate::record::{pad8, LogRecord, ObjectId, RecordBody, RecordKind};
use crate::store::PendingWrite;

/// Number of generation slots in the ring.
pub const GENERATION_SLOTS: usize = 4;

/// Generations that can be open, quiescing or syncing at the same time.
pub const CONCURRENT_GENERATIONS: u64 = 3;

// ---------------------------------------------------------------------------
// Itx
// ---------------------------------------------------------------------------

/// Stable identity of an itx.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItxId(pub u64);

impl fmt::Display for ItxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "itx#{}", self.0)
    }
}

/// How a write record's data reaches the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteState {
    /// The data is already inside the record.
    #[default]
    Copied,
    /// The data is fetched into the log block when the record is committed.
    NeedCopy,
    /// The data is written to its own block; the record only points to it.
    Indirect,
}

/// One pending operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Itx {
    /// Stable identity.
    pub id: ItxId,
    /// The record to log. `txg` is set on assignment, `seq` on commit.
    pub record: LogRecord,
    /// Object the itx is queued under.
    pub object: ObjectId,
    /// Synchronous itxs are committed by the next commit of any object.
    pub sync: bool,
    /// Data handling for write records.
    pub write_state: WriteState,
}

impl Itx {
    /// A synchronous itx for `body` with data already inline.
    pub fn new(id: ItxId, body: RecordBody) -> Self {
        let object = body.object();
        Self {
            id,
            record: LogRecord::new(body),
            object,
            sync: true,
            write_state: WriteState::Copied,
        }
    }

    /// Builder-style write state.
    pub fn with_write_state(mut self, state: WriteState) -> Self {
        self.write_state = state;
        self
    }

    /// Builder-style sync flag.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Generation the itx was assigned to.
    pub fn txg(&self) -> u64 {
        self.record.txg
    }

    /// Kind of the record.
    pub fn kind(&self) -> RecordKind {
        self.record.kind()
    }

    /// Bytes of log space this itx needs: its record plus any data copied
    /// in at commit time.
    pub fn sod(&self) -> u64 {
        let mut size = self.record.encoded_len();
        if let (WriteState::NeedCopy, RecordBody::Write(body)) = (self.write_state, &self.record.body) {
            if body.data.is_none() {
                size = size.saturating_add(pad8(usize::try_from(body.length).unwrap_or(usize::MAX)));
            }
        }
        size as u64
    }
}

// ---------------------------------------------------------------------------
// Payload fetching
// ---------------------------------------------------------------------------

/// Where a fetcher should put a write record's data.
#[derive(Debug)]
pub enum FetchTarget<'a> {
    /// Copy the data into this slice of the log block.
    Buffer(&'a mut [u8]),
    /// Write the data to its own block and return its pointer.
    Indirect,
}

/// What a successful fetch produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The buffer was filled.
    Copied,
    /// The data was written to the returned block.
    Indirect(BlockPtr),
}

/// Side channel through which a fetcher hands its own block writes to the
/// committing writer, so they complete and get flushed with the batch.
#[derive(Debug, Default)]
pub struct FetchContext {
    pub(crate) writes: Vec<PendingWrite>,
    pub(crate) devices: Vec<DeviceId>,
}

impl FetchContext {
    /// Attach a data block write issued by the fetcher.
    pub fn attach_write(&mut self, write: PendingWrite, device: DeviceId) {
        self.writes.push(write);
        self.devices.push(device);
    }
}

/// Supplies write data lazily at commit time.
pub trait DataFetcher: Send + Sync {
    /// Produce the data for `record` (a write record) into `target`.
    fn fetch(
        &self,
        record: &LogRecord,
        target: FetchTarget<'_>,
        ctx: &mut FetchContext,
    ) -> Result<FetchOutcome, FetchError>;
}

// ---------------------------------------------------------------------------
// ItxStore
// ---------------------------------------------------------------------------

/// Itxs of one generation.
#[derive(Debug, Default)]
pub struct ItxLists {
    /// Synchronous itxs in assignment order.
    pub sync: VecDeque<Itx>,
    /// Asynchronous itxs per object, each in assignment order.
    pub by_object: BTreeMap<ObjectId, VecDeque<Itx>>,
}

impl ItxLists {
    /// Total itxs held.
    pub fn len(&self) -> usize {
        self.sync.len() + self.by_object.values().map(VecDeque::len).sum::<usize>()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the bytes moved onto the synchronous list.
    fn promote(&mut self, object: Option<ObjectId>) -> u64 {
        let lists: Vec<VecDeque<Itx>> = match object {
            None => std::mem::take(&mut self.by_object).into_values().collect(),
            Some(object) => self.by_object.remove(&object).into_iter().collect(),
        };
        let mut moved = 0u64;
        for mut list in lists {
            moved = list.iter().fold(moved, |sum, itx| sum.saturating_add(itx.sod()));
            self.sync.append(&mut list);
        }
        moved
    }
}

#[derive(Debug, Default)]
struct ItxGeneration {
    txg: u64,
    lists: Option<ItxLists>,
    /// Bytes of synchronous itxs queued in this generation.
    sod: u64,
}

/// A batch detached for commit.
#[derive(Debug, Default)]
pub struct CommitBatch {
    /// Itxs in generation, then assignment, order.
    pub itxs: Vec<Itx>,
    /// Bytes the synchronous part of the batch needs.
    pub bytes: u64,
}

/// Per-generation queues of pending itxs.
#[derive(Debug, Default)]
pub struct ItxStore {
    slots: [Mutex<ItxGeneration>; GENERATION_SLOTS],
    /// Bytes of synchronous itxs queued across all generations.
    queued_bytes: AtomicU64,
}

impl ItxStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, txg: u64) -> &Mutex<ItxGeneration> {
        &self.slots[(txg % GENERATION_SLOTS as u64) as usize]
    }

    /// Queue `itx` under generation `txg`.
    ///
    /// A rename first promotes the renamed object's asynchronous itxs so the
    /// data reaches the log before the name change.
    pub fn assign(&self, mut itx: Itx, txg: u64, last_synced: u64) {
        if itx.kind() == RecordKind::Rename {
            self.promote_async_to_sync(Some(itx.object), last_synced);
        }

        itx.record.txg = txg;
        let stale = {
            let mut slot = self.slot(txg).lock();
            let mut stale = None;
            if slot.txg != txg {
                // Synced but never cleaned.
                stale = slot.lists.take();
                self.queued_bytes.fetch_sub(slot.sod, Ordering::Relaxed);
                slot.sod = 0;
                slot.txg = txg;
            }
            if itx.sync {
                let sod = itx.sod();
                slot.sod = slot.sod.saturating_add(sod);
                self.queued_bytes.fetch_add(sod, Ordering::Relaxed);
                lists_mut(&mut slot).sync.push_back(itx);
            } else {
                lists_mut(&mut slot)
                    .by_object
                    .entry(itx.object)
                    .or_default()
                    .push_back(itx);
            }
            stale
        };

        if let Some(stale) = stale {
            debug!(txg, dropped = stale.len(), "Dropped itxs of an uncleaned generation");
        }
    }

    /// Move asynchronous itxs of `object` (or of every object) to the tail
    /// of their generation's synchronous list.
    pub fn promote_async_to_sync(&self, object: Option<ObjectId>, last_synced: u64) {
        let first = last_synced + 1;
        for txg in first..first + CONCURRENT_GENERATIONS {
            let mut slot = self.slot(txg).lock();
            if slot.txg != txg {
                continue;
            }
            let moved = slot.lists.as_mut().map_or(0, |lists| lists.promote(object));
            slot.sod = slot.sod.saturating_add(moved);
            self.queued_bytes.fetch_add(moved, Ordering::Relaxed);
        }
    }

    /// Detach the synchronous lists of every unsynced generation.
    pub fn collect_commit_batch(&self, last_synced: u64) -> CommitBatch {
        let mut batch = CommitBatch::default();
        let first = last_synced + 1;
        for txg in first..first + CONCURRENT_GENERATIONS {
            let mut slot = self.slot(txg).lock();
            if slot.txg != txg {
                continue;
            }
            let Some(lists) = slot.lists.as_mut() else {
                continue;
            };
            batch.itxs.extend(lists.sync.drain(..));
            batch.bytes += slot.sod;
            self.queued_bytes.fetch_sub(slot.sod, Ordering::Relaxed);
            slot.sod = 0;
        }
        batch
    }

    /// Drop whatever generation `synced` still holds; it is on stable
    /// storage now. Returns the number of itxs dropped.
    pub fn discard_on_checkpoint(&self, synced: u64) -> usize {
        let stale = {
            let mut slot = self.slot(synced).lock();
            if slot.txg != synced {
                return 0;
            }
            slot.txg = 0;
            self.queued_bytes.fetch_sub(slot.sod, Ordering::Relaxed);
            slot.sod = 0;
            slot.lists.take()
        };
        stale.map_or(0, |lists| lists.len())
    }

    /// Drop every queued itx. Used when the log is closed.
    pub fn drain_all(&self) -> usize {
        let mut dropped = 0;
        for slot in &self.slots {
            let lists = {
                let mut slot = slot.lock();
                slot.txg = 0;
                slot.sod = 0;
                slot.lists.take()
            };
            dropped += lists.map_or(0, |l| l.len());
        }
        self.queued_bytes.store(0, Ordering::Relaxed);
        dropped
    }

    /// Bytes of synchronous itxs waiting for a commit.
    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes.load(Ordering::Relaxed)
    }

    /// Number of queued itxs (synchronous and asynchronous).
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.lock().lists.as_ref().map_or(0, ItxLists::len))
            .sum()
    }

    /// Returns `true` if no itx is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lists_mut(slot: &mut ItxGeneration) -> &mut ItxLists {
    slot.lists.get_or_insert_with(ItxLists::default)
}
