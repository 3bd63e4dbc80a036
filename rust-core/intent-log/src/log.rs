// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Log handle and lifecycle
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// `IntentLog` is the per-dataset handle. It owns the itx store, the list of
// log blocks that are not yet freed, the in-memory copy of the persisted
// header and the batch-ticket state used by `commit`.
//
// Lock order: `writer` -> `state` -> `header`. Only the writer lock is ever
// held across a wait for I/O or for a generation to sync.
//
// The header is only ever persisted from `sync_generation`, which runs while
// the checkpoint engine syncs a generation the dataset was marked dirty in.
// Every path that changes the header therefore marks the dataset dirty in
// an open transaction first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::blkptr::{BlockPtr, ChainSeed};
use crate::commit::{WriterState, BATCH_SLOTS};
use crate::config::{LogConfig, SyncMode};
use crate::crypt::BlockTransform;
use crate::engine::{CheckpointEngine, DatasetId, SyncContext, SyncParticipant, TxHandle};
use crate::error::{EngineError, LogResult};
use crate::header::LogHeader;
use crate::itx::{DataFetcher, Itx, ItxId, ItxStore, WriteState, GENERATION_SLOTS};
use crate::lwb::LwbEntry;
use crate::record::RecordBody;
use crate::recovery;
use crate::stats::LogStats;
use crate::store::BlockStore;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Replay bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct ReplayState {
    /// A replay is running.
    pub(crate) active: bool,
    /// Sequence of the record being replayed in order.
    pub(crate) seq: u64,
}

/// Everything guarded by the log lock.
#[derive(Debug)]
pub(crate) struct LogState {
    /// Blocks not yet freed, oldest first. The tail is the open block.
    pub(crate) lwbs: VecDeque<LwbEntry>,
    /// Ticket handed to the next arriving committer.
    pub(crate) next_batch: u64,
    /// Last batch whose commit finished.
    pub(crate) com_batch: u64,
    /// A committer is currently writing a batch.
    pub(crate) writer_active: bool,
    /// Fallback failures of recent batches, indexed by `batch % BATCH_SLOTS`.
    pub(crate) failed_batches: [(u64, Option<EngineError>); BATCH_SLOTS],
    /// Nesting depth of `suspend`.
    pub(crate) suspend: u32,
    /// The first suspender is still draining the log.
    pub(crate) suspending: bool,
    /// Generation in which a scheduled destroy takes effect.
    pub(crate) destroy_txg: u64,
    /// The scheduled destroy keeps the first block.
    pub(crate) keep_first: bool,
    pub(crate) replay: ReplayState,
    /// Highest replayed sequence per generation slot.
    pub(crate) replayed_seq: [u64; GENERATION_SLOTS],
}

impl Default for LogState {
    fn default() -> Self {
        Self {
            lwbs: VecDeque::new(),
            next_batch: 1,
            com_batch: 0,
            writer_active: false,
            failed_batches: std::array::from_fn(|_| (0, None)),
            suspend: 0,
            suspending: false,
            destroy_txg: 0,
            keep_first: false,
            replay: ReplayState::default(),
            replayed_seq: [0; GENERATION_SLOTS],
        }
    }
}

pub(crate) fn generation_slot(txg: u64) -> usize {
    (txg % GENERATION_SLOTS as u64) as usize
}

// ---------------------------------------------------------------------------
// IntentLog
// ---------------------------------------------------------------------------

/// The intent log of one dataset.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use intent_log::config::LogConfig;
/// use intent_log::engine::{CheckpointEngine, DatasetId};
/// use intent_log::log::IntentLog;
/// use intent_log::memory::MemoryPool;
/// use intent_log::record::{ObjectId, RecordBody, TruncateBody};
///
/// let pool = Arc::new(MemoryPool::new());
/// let log = IntentLog::open(DatasetId(1), pool.clone(), pool.clone(), LogConfig::default()).unwrap();
///
/// let tx = pool.begin_transaction().unwrap();
/// let itx = log.itx_create(RecordBody::Truncate(TruncateBody {
///     foid: ObjectId(7),
///     offset: 0,
///     length: 512,
/// }));
/// log.itx_assign(itx, &tx);
/// pool.commit_transaction(tx);
///
/// // The first commit creates the chain.
/// log.commit(Some(ObjectId(7))).unwrap();
/// assert!(log.header().log.is_some());
/// log.close().unwrap();
/// ```
pub struct IntentLog {
    pub(crate) dataset: DatasetId,
    pub(crate) engine: Arc<dyn CheckpointEngine>,
    pub(crate) store: Arc<dyn BlockStore>,
    pub(crate) config: LogConfig,
    pub(crate) itxs: ItxStore,
    next_itx: AtomicU64,
    pub(crate) header: Mutex<LogHeader>,
    pub(crate) state: Mutex<LogState>,
    pub(crate) batch_cv: [Condvar; BATCH_SLOTS],
    pub(crate) suspend_cv: Condvar,
    pub(crate) writer: Mutex<WriterState>,
    pub(crate) fetcher: RwLock<Option<Arc<dyn DataFetcher>>>,
    pub(crate) transform: RwLock<Option<Arc<dyn BlockTransform>>>,
    pub(crate) stats: Mutex<LogStats>,
}

impl std::fmt::Debug for IntentLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentLog")
            .field("dataset", &self.dataset)
            .field("header", &*self.header.lock())
            .finish_non_exhaustive()
    }
}

impl IntentLog {
    /// Open the log of `dataset` and register it with the engine.
    pub fn open(
        dataset: DatasetId,
        engine: Arc<dyn CheckpointEngine>,
        store: Arc<dyn BlockStore>,
        config: LogConfig,
    ) -> LogResult<Arc<Self>> {
        config.validate()?;
        let header = LogHeader::decode(&engine.load_log_header(dataset)?)?;
        let writer = WriterState::new(&config);

        let log = Arc::new(Self {
            dataset,
            engine,
            store,
            config,
            itxs: ItxStore::new(),
            next_itx: AtomicU64::new(1),
            header: Mutex::new(header),
            state: Mutex::new(LogState::default()),
            batch_cv: std::array::from_fn(|_| Condvar::new()),
            suspend_cv: Condvar::new(),
            writer: Mutex::new(writer),
            fetcher: RwLock::new(None),
            transform: RwLock::new(None),
            stats: Mutex::new(LogStats::default()),
        });
        let participant: Weak<IntentLog> = Arc::downgrade(&log);
        log.engine.register_participant(dataset, participant);

        info!(
            dataset = %dataset,
            has_chain = header.log.is_some(),
            claim_txg = header.claim_txg,
            replay_needed = header.replay_needed(),
            "Opened intent log"
        );
        Ok(log)
    }

    /// Install the fetcher that supplies write data at commit time.
    pub fn set_fetcher(&self, fetcher: Arc<dyn DataFetcher>) {
        *self.fetcher.write() = Some(fetcher);
    }

    /// Install the transform used to seal new log blocks and open encrypted
    /// ones.
    pub fn set_transform(&self, transform: Arc<dyn BlockTransform>) {
        *self.transform.write() = Some(transform);
    }

    /// The dataset this log belongs to.
    pub fn dataset(&self) -> DatasetId {
        self.dataset
    }

    /// The log's configuration.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    // -- itx API -----------------------------------------------------------

    /// Create a synchronous itx for `body`.
    pub fn itx_create(&self, body: RecordBody) -> Itx {
        let id = ItxId(self.next_itx.fetch_add(1, Ordering::Relaxed));
        Itx::new(id, body)
    }

    /// Queue `itx` under the generation of `tx`.
    pub fn itx_assign(&self, mut itx: Itx, tx: &TxHandle) {
        let txg = tx.txg();
        if self.config.sync == SyncMode::Always || self.engine.is_generation_frozen(txg) {
            itx.sync = true;
        }
        if let (WriteState::NeedCopy, RecordBody::Write(body)) = (itx.write_state, &itx.record.body) {
            if body.data.is_none() && body.length > self.config.max_copied_data() {
                itx.write_state = WriteState::Indirect;
            }
        }
        self.engine.mark_dirty(self.dataset, tx);
        self.itxs.assign(itx, txg, self.engine.last_synced_generation());
    }

    // -- inspection --------------------------------------------------------

    /// Counters accumulated since the log was opened.
    pub fn stats(&self) -> LogStats {
        self.stats.lock().clone()
    }

    /// The in-memory copy of the header.
    pub fn header(&self) -> LogHeader {
        *self.header.lock()
    }

    /// Highest record sequence known to be on stable storage.
    pub fn committed_seq(&self) -> u64 {
        self.writer.lock().commit_lr_seq
    }

    /// Number of blocks in the log's block list.
    pub fn block_count(&self) -> usize {
        self.state.lock().lwbs.len()
    }

    // -- checkpoint hooks ---------------------------------------------------

    /// Work done while generation `txg` syncs: persist the replay cursor,
    /// apply a destroy scheduled for `txg`, free head blocks that are
    /// written and whose generations have synced, and persist the header.
    pub(crate) fn sync_generation(&self, txg: u64) {
        let mut freed: Vec<BlockPtr> = Vec::new();
        let encoded = {
            let mut state = self.state.lock();
            let mut header = self.header.lock();

            let slot = generation_slot(txg);
            let replayed = std::mem::take(&mut state.replayed_seq[slot]);
            header.replay_seq = header.replay_seq.max(replayed);

            if state.destroy_txg == txg {
                let keep = if state.keep_first { header.log } else { None };
                *header = LogHeader::default();
                state.replayed_seq = [0; GENERATION_SLOTS];
                if let Some(mut first) = keep {
                    // A fresh guid invalidates whatever the kept block holds.
                    first.seed = ChainSeed::new_chain(self.dataset.0);
                    header.log = Some(first);
                }
            }

            while let Some(head) = state.lwbs.front().copied() {
                header.log = Some(head.blk);
                if head.buffered || head.max_txg > txg {
                    break;
                }
                state.lwbs.pop_front();
                freed.push(head.blk);
                if state.lwbs.is_empty() {
                    header.log = None;
                }
            }
            header.encode()
        };

        for bp in &freed {
            self.store.free_block(bp, txg);
        }
        self.engine.store_log_header(self.dataset, &encoded, txg);
        if !freed.is_empty() {
            debug!(dataset = %self.dataset, txg, freed = freed.len(), "Freed synced log blocks");
        }
    }

    // -- lifecycle ---------------------------------------------------------

    /// Block until a scheduled destroy has taken effect.
    pub(crate) fn wait_for_destroy(&self) -> LogResult<()> {
        let destroy_txg = self.state.lock().destroy_txg;
        if destroy_txg > self.engine.last_synced_generation() {
            self.engine.wait_until_generation_synced(destroy_txg)?;
        }
        Ok(())
    }

    /// Discard the whole chain. The header is cleared by the sync of the
    /// returned generation; with `keep_first` the first block stays
    /// allocated and is reused, under a new chain identity, by the next
    /// commit. Returns `0` if there was no chain.
    pub fn destroy(&self, keep_first: bool) -> LogResult<u64> {
        self.wait_for_destroy()?;

        let header = *self.header.lock();
        if header.log.is_none() {
            return Ok(0);
        }

        let tx = self.engine.begin_transaction()?;
        self.engine.mark_dirty(self.dataset, &tx);
        let txg = tx.txg();

        let drained: Vec<LwbEntry> = {
            let mut writer = self.writer.lock();
            writer.open = None;
            let mut state = self.state.lock();
            state.destroy_txg = txg;
            state.keep_first = keep_first && state.lwbs.is_empty();
            state.lwbs.drain(..).collect()
        };

        if !drained.is_empty() {
            for entry in &drained {
                self.store.free_block(&entry.blk, txg);
            }
        } else if !keep_first {
            let transform = self.transform.read().clone();
            recovery::free_chain(&header, self.store.as_ref(), transform.as_deref(), txg);
        }
        self.engine.commit_transaction(tx);

        info!(
            dataset = %self.dataset,
            txg,
            keep_first,
            blocks = drained.len(),
            "Destroyed log chain"
        );
        Ok(txg)
    }

    /// Drain the log and route every later commit through checkpoint syncs
    /// until [`IntentLog::resume`]. Fails with `Busy` if the log still has
    /// unreplayed records.
    pub fn suspend(&self) -> LogResult<()> {
        {
            let mut state = self.state.lock();
            if self.header.lock().replay_needed() {
                return Err(crate::error::LogError::Busy);
            }
            state.suspend += 1;
            if state.suspend > 1 {
                // Another caller is already draining.
                while state.suspending {
                    self.suspend_cv.wait(&mut state);
                }
                return Ok(());
            }
            if self.header.lock().log.is_none() && state.lwbs.is_empty() {
                return Ok(());
            }
            state.suspending = true;
        }

        let drained = self.commit(None).and_then(|()| {
            let txg = self.destroy(false)?;
            if txg != 0 {
                self.engine.wait_until_generation_synced(txg)?;
            }
            Ok(())
        });

        {
            let mut state = self.state.lock();
            state.suspending = false;
            if drained.is_err() {
                state.suspend = state.suspend.saturating_sub(1);
            }
        }
        self.suspend_cv.notify_all();

        if drained.is_ok() {
            info!(dataset = %self.dataset, "Suspended intent log");
        }
        drained
    }

    /// Undo one [`IntentLog::suspend`].
    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.suspend = state.suspend.saturating_sub(1);
        debug!(dataset = %self.dataset, depth = state.suspend, "Resumed intent log");
    }

    /// Returns `true` while at least one suspend is in effect.
    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspend > 0
    }

    /// Commit everything, wait for the written blocks' generations, drop
    /// the in-memory state and unregister from the engine.
    ///
    /// The unwritten open block stays the head of the chain and is reused
    /// when the log is opened again.
    pub fn close(&self) -> LogResult<()> {
        self.commit(None)?;

        let tail_txg = self.state.lock().lwbs.back().map_or(0, |entry| entry.max_txg);
        if tail_txg != 0 {
            self.engine.wait_until_generation_synced(tail_txg)?;
        }

        {
            let mut writer = self.writer.lock();
            writer.open = None;
            self.state.lock().lwbs.clear();
        }
        *self.fetcher.write() = None;
        let dropped = self.itxs.drain_all();
        self.engine.unregister_participant(self.dataset);

        info!(dataset = %self.dataset, dropped, "Closed intent log");
        Ok(())
    }

    // -- replay bookkeeping --------------------------------------------------

    /// Called by replay callbacks with the transaction they applied a record
    /// in. Returns `true` if the operation must not be logged again: while
    /// replaying (the record's sequence is then persisted with `tx`'s
    /// generation) and when sync is disabled.
    pub fn replaying(&self, tx: &TxHandle) -> bool {
        self.note_replayed(tx, None)
    }

    /// Record `seq` (or the in-order replay cursor) as replayed in `tx`.
    pub(crate) fn note_replayed(&self, tx: &TxHandle, seq: Option<u64>) -> bool {
        if self.config.sync == SyncMode::Disabled {
            return true;
        }
        if !self.state.lock().replay.active {
            return false;
        }
        self.engine.mark_dirty(self.dataset, tx);
        let mut state = self.state.lock();
        let seq = seq.unwrap_or(state.replay.seq);
        let slot = generation_slot(tx.txg());
        state.replayed_seq[slot] = state.replayed_seq[slot].max(seq);
        true
    }

    /// Persist `seq` as replayed in a transaction of its own. Used once
    /// every parallel write up to `seq` finished.
    pub(crate) fn publish_replayed(&self, seq: u64) -> LogResult<()> {
        let tx = self.engine.begin_transaction()?;
        self.engine.mark_dirty(self.dataset, &tx);
        {
            let mut state = self.state.lock();
            let slot = generation_slot(tx.txg());
            state.replayed_seq[slot] = state.replayed_seq[slot].max(seq);
        }
        self.engine.commit_transaction(tx);
        Ok(())
    }
}

impl SyncParticipant for IntentLog {
    fn sync(&self, ctx: &SyncContext) {
        self.sync_generation(ctx.txg);
    }

    fn clean(&self, synced: u64) {
        let dropped = self.itxs.discard_on_checkpoint(synced);
        if dropped > 0 {
            debug!(dataset = %self.dataset, synced, dropped, "Discarded checkpointed itxs");
        }
    }
}

/// Wait for `txg` unless it already synced, logging a failure.
pub(crate) fn wait_synced_or_warn(engine: &dyn CheckpointEngine, txg: u64) -> Result<(), EngineError> {
    engine.wait_until_generation_synced(txg).inspect_err(|e| {
        warn!(txg, error = %e, "Waiting for a checkpoint failed");
    })
}
