// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Commit coordinator
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// `commit` makes every synchronous itx durable. Committers take a batch
// ticket; one of them becomes the writer for its batch while the others
// sleep on the condition variable of their own ticket and return when that
// batch is done. A writer copies records into log blocks, issues the block
// writes, waits for all of them, flushes the touched device caches and only
// then releases its batch.
//
// Whenever the log cannot be written (suspended, log awaiting replay, no
// space, I/O error, failed flush) the writer waits for the open generation
// to sync instead. The caller is never told about the failure unless that
// checkpoint fails too.

use std::collections::BTreeSet;

use tracing::{debug, trace, warn};

use crate::blkptr::{BlockPtr, ByteOrder, ChainSeed, DeviceId};
use crate::chain::{encode_chain_header, seal_block, ChainLink, CHAIN_LINK_SIZE};
use crate::config::{LogConfig, SyncMode};
use crate::engine::TxHandle;
use crate::error::{FetchError, LogError, LogResult, StoreError};
use crate::itx::{FetchContext, FetchOutcome, FetchTarget, Itx, WriteState};
use crate::log::{wait_synced_or_warn, IntentLog};
use crate::lwb::{BlockSizer, LwbEntry, OpenLwb};
use crate::record::{
    encode_record_in, encode_write_prefix, pad8, ObjectId, RecordBody, RECORD_SEQ_OFFSET,
    WRITE_FIXED_LEN,
};
use crate::store::{PendingWrite, WriteCompletion};

/// Condition variables in the batch-ticket arena.
pub const BATCH_SLOTS: usize = 2;

fn batch_slot(batch: u64) -> usize {
    (batch % BATCH_SLOTS as u64) as usize
}

// ---------------------------------------------------------------------------
// Writer state
// ---------------------------------------------------------------------------

/// A block or data write issued during the current batch.
#[derive(Debug)]
pub(crate) struct InflightWrite {
    /// Log block the write belongs to; `None` for fetcher data writes.
    lwb: Option<u64>,
    pending: PendingWrite,
    /// Allocation transaction, committed once the write completed.
    tx: Option<TxHandle>,
}

/// State owned by whichever committer is currently the writer.
#[derive(Debug)]
pub(crate) struct WriterState {
    /// The block being filled.
    pub(crate) open: Option<OpenLwb>,
    /// Last record sequence assigned.
    pub(crate) lr_seq: u64,
    /// Last record sequence known durable.
    pub(crate) commit_lr_seq: u64,
    /// Bytes appended in the current batch; sizes the next block.
    cur_used: u64,
    /// Bytes the current batch needs.
    batch_bytes: u64,
    sizer: BlockSizer,
    /// Devices whose caches need flushing before the batch is durable.
    devices: BTreeSet<DeviceId>,
    inflight: Vec<InflightWrite>,
    /// Something in the current batch failed; fall back to a checkpoint.
    failed: bool,
    next_lwb_id: u64,
}

impl WriterState {
    pub(crate) fn new(config: &LogConfig) -> Self {
        Self {
            open: None,
            lr_seq: 0,
            commit_lr_seq: 0,
            cur_used: 0,
            batch_bytes: 0,
            sizer: BlockSizer::new(config.block_buckets.clone(), config.max_block_size),
            devices: BTreeSet::new(),
            inflight: Vec::new(),
            failed: false,
            next_lwb_id: 1,
        }
    }
}

/// How an itx's record is laid out in the log block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// The encoded record is complete.
    Inline,
    /// A write prefix followed by `length` bytes fetched in place.
    CopyIn { length: usize },
    /// The data goes to its own block first.
    Indirect,
}

impl Placement {
    fn of(itx: &Itx) -> Self {
        match (&itx.record.body, itx.write_state) {
            (RecordBody::Write(body), WriteState::NeedCopy) if body.data.is_none() => Placement::CopyIn {
                length: usize::try_from(body.length).unwrap_or(usize::MAX),
            },
            (RecordBody::Write(_), WriteState::Indirect) => Placement::Indirect,
            _ => Placement::Inline,
        }
    }
}

// ---------------------------------------------------------------------------
// commit
// ---------------------------------------------------------------------------

impl IntentLog {
    /// Make every synchronous itx queued so far durable, after first
    /// promoting the asynchronous itxs of `object` (of every object with
    /// `None`).
    ///
    /// Returns only once the records are on stable storage, either in the
    /// log or through a checkpoint. An error means the fallback checkpoint
    /// itself failed.
    pub fn commit(&self, object: Option<ObjectId>) -> LogResult<()> {
        if self.config.sync == SyncMode::Disabled {
            return Ok(());
        }
        self.stats.lock().commit_requests += 1;
        self.itxs
            .promote_async_to_sync(object, self.engine.last_synced_generation());

        let mut state = self.state.lock();
        let mybatch = state.next_batch;
        while state.writer_active {
            self.batch_cv[batch_slot(mybatch)].wait(&mut state);
            if mybatch <= state.com_batch {
                let (batch, failure) = &state.failed_batches[batch_slot(mybatch)];
                return match failure {
                    Some(e) if *batch == mybatch => Err(LogError::Engine(e.clone())),
                    _ => Ok(()),
                };
            }
        }
        state.next_batch += 1;
        state.writer_active = true;
        drop(state);

        let result = self.commit_writer();

        let mut state = self.state.lock();
        state.com_batch = mybatch;
        state.writer_active = false;
        state.failed_batches[batch_slot(mybatch)] = (mybatch, result.as_ref().err().cloned());
        drop(state);

        // One sleeper of the next batch becomes its writer.
        self.batch_cv[batch_slot(mybatch + 1)].notify_one();
        self.batch_cv[batch_slot(mybatch)].notify_all();
        result.map_err(LogError::Engine)
    }

    fn commit_writer(&self) -> Result<(), crate::error::EngineError> {
        let batch = self
            .itxs
            .collect_commit_batch(self.engine.last_synced_generation());
        if batch.itxs.is_empty() {
            return Ok(());
        }

        let mut w = self.writer.lock();
        w.failed = false;
        w.batch_bytes = batch.bytes;
        let count = batch.itxs.len();
        self.stats.lock().commit_batches += 1;

        let lwb = self.write_batch(&mut w, batch.itxs);

        w.cur_used = 0;
        self.drain_writes(&mut w);
        let devices = std::mem::take(&mut w.devices);
        if self.config.cache_flush && !devices.is_empty() {
            if let Err(e) = self.store.flush_device_caches(&devices) {
                warn!(dataset = %self.dataset, error = %e, "Log device cache flush failed");
                w.failed = true;
                self.stats.lock().flush_errors += 1;
            }
        }

        let have_block = lwb.is_some();
        w.open = lwb;
        if w.failed || !have_block {
            drop(w);
            self.stats.lock().fallback_syncs += 1;
            warn!(
                dataset = %self.dataset,
                itxs = count,
                "Log commit fell back to a checkpoint"
            );
            return wait_synced_or_warn(self.engine.as_ref(), 0);
        }

        w.commit_lr_seq = w.lr_seq;
        debug!(dataset = %self.dataset, itxs = count, seq = w.commit_lr_seq, "Committed log batch");
        Ok(())
    }

    /// Append every itx of a batch and start the write of the last block.
    fn write_batch(&self, w: &mut WriterState, itxs: Vec<Itx>) -> Option<OpenLwb> {
        let suspended = self.state.lock().suspend > 0;
        let mut lwb = if suspended {
            None
        } else {
            match w.open.take() {
                Some(open) if self.is_open_block(&open) => Some(open),
                Some(_) => None,
                None if self.state.lock().lwbs.is_empty() => self.open_initial_block(w),
                None => None,
            }
        };

        for itx in &itxs {
            let txg = itx.txg();
            if txg > self.engine.last_synced_generation() || self.engine.is_generation_frozen(txg) {
                lwb = self.append(w, lwb, itx);
            } else {
                self.stats.lock().itxs_already_synced += 1;
            }
        }

        match lwb {
            Some(open) if open.touched => self.start_write(w, open),
            other => other,
        }
    }

    fn is_open_block(&self, open: &OpenLwb) -> bool {
        self.state
            .lock()
            .lwbs
            .back()
            .is_some_and(|entry| entry.id == open.id && entry.buffered)
    }

    // -----------------------------------------------------------------------
    // Blocks
    // -----------------------------------------------------------------------

    fn allocate_block(&self, txg: u64, size: u64, prefer_fast: bool, seed: ChainSeed) -> Result<BlockPtr, StoreError> {
        let addr = self.store.alloc_log_block(txg, size, prefer_fast)?;
        Ok(BlockPtr {
            device: addr.device,
            offset: addr.offset,
            size,
            birth: txg,
            seed,
            order: ByteOrder::NATIVE,
            encrypted: self.transform.read().is_some(),
        })
    }

    fn register_lwb(&self, w: &mut WriterState, blk: BlockPtr, txg: u64) -> OpenLwb {
        let id = w.next_lwb_id;
        w.next_lwb_id += 1;
        self.state.lock().lwbs.push_back(LwbEntry {
            id,
            blk,
            max_txg: txg,
            buffered: true,
        });
        OpenLwb::new(id, blk, txg)
    }

    fn release_lwb(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.lwbs.iter_mut().find(|entry| entry.id == id) {
            entry.buffered = false;
        }
    }

    /// Create the first block of a chain, or pick up the head block left by
    /// a previous session, and publish it through a checkpoint.
    fn open_initial_block(&self, w: &mut WriterState) -> Option<OpenLwb> {
        if let Err(e) = self.wait_for_destroy() {
            warn!(dataset = %self.dataset, error = %e, "Pending log destroy did not sync");
            return None;
        }

        let header = *self.header.lock();
        if header.claim_txg != 0 || header.replay_needed() {
            warn!(dataset = %self.dataset, "Log awaits replay; not writing new blocks");
            return None;
        }

        let tx = match self.engine.begin_transaction() {
            Ok(tx) => tx,
            Err(e) => {
                warn!(dataset = %self.dataset, error = %e, "Cannot open a transaction for the first log block");
                return None;
            }
        };
        self.engine.mark_dirty(self.dataset, &tx);
        let txg = tx.txg();

        let mut head = header.log;
        if head.map_or(true, |bp| !bp.order.is_native()) {
            let prefer_fast = self.config.prefer_fast_tier(self.itxs.queued_bytes());
            let seed = ChainSeed::new_chain(self.dataset.0);
            match self.allocate_block(txg, self.config.min_block_size, prefer_fast, seed) {
                Ok(bp) => {
                    if let Some(foreign) = head {
                        self.store.free_block(&foreign, txg);
                    }
                    debug!(dataset = %self.dataset, block = %bp, "Created log chain");
                    head = Some(bp);
                }
                Err(e) => {
                    warn!(dataset = %self.dataset, error = %e, "First log block allocation failed");
                    head = None;
                }
            }
        }

        let lwb = head.map(|bp| self.register_lwb(w, bp, txg));
        self.engine.commit_transaction(tx);
        if wait_synced_or_warn(self.engine.as_ref(), txg).is_err() {
            if let Some(lwb) = &lwb {
                self.release_lwb(lwb.id);
            }
            return None;
        }
        lwb
    }

    /// Copy one itx into the open block. Returns the block to continue with,
    /// which differs from `lwb` when the record did not fit.
    fn append(&self, w: &mut WriterState, lwb: Option<OpenLwb>, itx: &Itx) -> Option<OpenLwb> {
        let mut lwb = lwb?;
        let mut record = itx.record.clone();
        let txg = record.txg;
        let placement = Placement::of(itx);

        let (reclen, dlen) = match placement {
            Placement::CopyIn { length } => (WRITE_FIXED_LEN, pad8(length)),
            Placement::Indirect => {
                if let RecordBody::Write(body) = &mut record.body {
                    body.data = None;
                }
                (WRITE_FIXED_LEN, 0)
            }
            Placement::Inline => (record.encoded_len(), 0),
        };
        let needed = reclen.saturating_add(dlen);

        w.cur_used = w.cur_used.saturating_add(needed as u64);
        lwb.touched = true;
        if !lwb.fits(needed) {
            let mut next = self.start_write(w, lwb)?;
            next.touched = true;
            lwb = next;
            if !lwb.fits(needed) {
                trace!(txg, needed, "Record larger than any log block");
                self.wait_synced_in_batch(w, txg);
                return Some(lwb);
            }
        }

        if matches!(record.body, RecordBody::Write(_)) && self.engine.is_generation_frozen(txg) {
            self.wait_synced_in_batch(w, txg);
        }

        let at = lwb.nused;
        match placement {
            Placement::Inline => {
                let encoded = encode_record_in(&record, ByteOrder::NATIVE);
                lwb.buf[at..at + reclen].copy_from_slice(&encoded);
            }
            Placement::CopyIn { length } => {
                let prefix = match encode_write_prefix(&record, length) {
                    Ok(prefix) => prefix,
                    Err(e) => {
                        warn!(error = %e, "Cannot encode write record");
                        self.wait_synced_in_batch(w, txg);
                        return Some(lwb);
                    }
                };
                lwb.buf[at..at + reclen].copy_from_slice(&prefix);
                let data_at = at + reclen;
                let target = FetchTarget::Buffer(&mut lwb.buf[data_at..data_at + length]);
                if !self.fetch_into(w, &record, target, placement) {
                    return Some(lwb);
                }
                lwb.buf[data_at + length..data_at + dlen].fill(0);
            }
            Placement::Indirect => {
                let Some(bp) = self.fetch_indirect(w, &record) else {
                    return Some(lwb);
                };
                if let RecordBody::Write(body) = &mut record.body {
                    body.blkptr = Some(bp);
                }
                let encoded = encode_record_in(&record, ByteOrder::NATIVE);
                lwb.buf[at..at + reclen].copy_from_slice(&encoded);
            }
        }

        w.lr_seq += 1;
        ByteOrder::NATIVE.write_u64_at(&mut lwb.buf, at + RECORD_SEQ_OFFSET, w.lr_seq);
        lwb.nused += needed;
        lwb.max_txg = lwb.max_txg.max(txg);

        let mut stats = self.stats.lock();
        stats.records_committed += 1;
        if let RecordBody::Write(body) = &itx.record.body {
            stats.count_write(itx.write_state, body.length);
        }
        Some(lwb)
    }

    /// Run the fetcher for a copy-in write. Returns `true` if the data
    /// landed in the buffer and the record should be kept.
    fn fetch_into(
        &self,
        w: &mut WriterState,
        record: &crate::record::LogRecord,
        target: FetchTarget<'_>,
        placement: Placement,
    ) -> bool {
        match self.run_fetch(w, record, target) {
            Ok(FetchOutcome::Copied) => true,
            Ok(FetchOutcome::Indirect(_)) => {
                warn!(seq = record.seq, ?placement, "Fetcher ignored the copy-in target");
                self.wait_synced_in_batch(w, record.txg);
                false
            }
            Err(e) => {
                self.fetch_failed(w, record.txg, &e);
                false
            }
        }
    }

    fn fetch_indirect(&self, w: &mut WriterState, record: &crate::record::LogRecord) -> Option<BlockPtr> {
        match self.run_fetch(w, record, FetchTarget::Indirect) {
            Ok(FetchOutcome::Indirect(bp)) => Some(bp),
            Ok(FetchOutcome::Copied) => {
                warn!("Fetcher returned no block for an indirect write");
                self.wait_synced_in_batch(w, record.txg);
                None
            }
            Err(e) => {
                self.fetch_failed(w, record.txg, &e);
                None
            }
        }
    }

    fn run_fetch(
        &self,
        w: &mut WriterState,
        record: &crate::record::LogRecord,
        target: FetchTarget<'_>,
    ) -> Result<FetchOutcome, FetchError> {
        let fetcher = self.fetcher.read().clone();
        let Some(fetcher) = fetcher else {
            return Err(FetchError::Io("no data fetcher installed".to_string()));
        };
        let mut ctx = FetchContext::default();
        let outcome = fetcher.fetch(record, target, &mut ctx);
        w.devices.extend(ctx.devices);
        w.inflight.extend(ctx.writes.into_iter().map(|pending| InflightWrite {
            lwb: None,
            pending,
            tx: None,
        }));
        outcome
    }

    fn fetch_failed(&self, w: &mut WriterState, txg: u64, error: &FetchError) {
        match error {
            FetchError::Io(_) => {
                warn!(txg, error = %error, "Write data unavailable; waiting for checkpoint");
                self.wait_synced_in_batch(w, txg);
            }
            FetchError::NotFound | FetchError::AlreadySynced | FetchError::InProgress => {
                trace!(txg, error = %error, "Write record no longer needed");
                self.stats.lock().itxs_dropped += 1;
            }
        }
    }

    /// Finish `lwb` and issue its write. The next block is allocated first
    /// so the trailer can point at it; the returned block is that next block,
    /// or `None` if it could not be allocated.
    fn start_write(&self, w: &mut WriterState, mut lwb: OpenLwb) -> Option<OpenLwb> {
        let tx = match self.engine.begin_transaction() {
            Ok(tx) => tx,
            Err(e) => {
                warn!(dataset = %self.dataset, error = %e, "Cannot open a transaction for a log block");
                w.failed = true;
                self.release_lwb(lwb.id);
                return None;
            }
        };
        self.engine.mark_dirty(self.dataset, &tx);
        let txg = tx.txg();

        let size = w.sizer.next_size(w.cur_used.saturating_add(CHAIN_LINK_SIZE as u64));
        let seed = encode_chain_header(lwb.blk.seed.seq + 1, &lwb.blk.seed);
        let prefer_fast = self
            .config
            .prefer_fast_tier(self.itxs.queued_bytes().saturating_add(w.batch_bytes));
        let next = match self.allocate_block(txg, size, prefer_fast, seed) {
            Ok(bp) => Some(bp),
            Err(e) => {
                warn!(dataset = %self.dataset, size, error = %e, "Log block allocation failed");
                None
            }
        };
        let next_lwb = next.map(|bp| self.register_lwb(w, bp, txg));
        w.devices.insert(lwb.blk.device);

        let nused = lwb.nused;
        lwb.buf[nused..].fill(0);
        let mut link = ChainLink {
            next,
            nused: nused as u64,
            mac: 0,
            seed: lwb.blk.seed,
            checksum: 0,
        };
        let transform = if lwb.blk.encrypted {
            self.transform.read().clone()
        } else {
            None
        };
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.lwbs.iter_mut().find(|entry| entry.id == lwb.id) {
                entry.max_txg = entry.max_txg.max(txg).max(lwb.max_txg);
            }
        }
        if let Err(e) = seal_block(&mut lwb.buf, &mut link, transform.as_deref(), lwb.blk.order) {
            warn!(dataset = %self.dataset, seq = lwb.blk.seed.seq, error = %e, "Cannot seal log block");
            w.failed = true;
            self.stats.lock().write_errors += 1;
            self.release_lwb(lwb.id);
            self.engine.commit_transaction(tx);
            return next_lwb;
        }

        let size = lwb.blk.size;
        let seq = lwb.blk.seed.seq;
        let (done, pending) = WriteCompletion::pair();
        self.store
            .write_block_async(&lwb.blk, std::mem::take(&mut lwb.buf), done);
        w.inflight.push(InflightWrite {
            lwb: Some(lwb.id),
            pending,
            tx: Some(tx),
        });

        {
            let mut stats = self.stats.lock();
            stats.blocks_written += 1;
            stats.block_bytes_written += size;
            stats.block_bytes_used += nused as u64;
            if prefer_fast {
                stats.fast_tier_blocks += 1;
            }
        }
        debug!(
            dataset = %self.dataset,
            seq,
            nused,
            size,
            next_size = next.map_or(0, |bp| bp.size),
            "Issued log block write"
        );
        next_lwb
    }

    /// Wait for every write issued in this batch. Completed blocks give up
    /// their buffers, so a later checkpoint may free them.
    fn drain_writes(&self, w: &mut WriterState) {
        for write in std::mem::take(&mut w.inflight) {
            if let Err(e) = write.pending.wait() {
                warn!(dataset = %self.dataset, error = %e, "Log write failed");
                w.failed = true;
                self.stats.lock().write_errors += 1;
            }
            if let Some(id) = write.lwb {
                self.release_lwb(id);
            }
            if let Some(tx) = write.tx {
                self.engine.commit_transaction(tx);
            }
        }
    }

    /// Wait for `txg` in the middle of a batch. Writes issued so far hold
    /// transactions that would keep the generation open, so they are
    /// drained first.
    fn wait_synced_in_batch(&self, w: &mut WriterState, txg: u64) {
        self.drain_writes(w);
        if wait_synced_or_warn(self.engine.as_ref(), txg).is_err() {
            w.failed = true;
        }
    }
}
