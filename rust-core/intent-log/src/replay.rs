// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Replay
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Replay re-executes the claimed records through a `ReplayTarget`.
//
// Namespace records run one at a time in sequence order. Write records run
// on a small worker pool; an index of in-flight byte ranges keeps writes
// that overlap in order by draining the pool first. Before every namespace
// record the pool is drained too, so each record sees everything logged
// before it.
//
// The replay cursor (`LogHeader::replay_seq`) is advanced in the same
// generation as the operations it covers, so a crash during replay resumes
// after the last record whose effects synced.

use std::collections::BTreeMap;

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::blkptr::BlockPtr;
use crate::config::SyncMode;
use crate::engine::TxHandle;
use crate::error::{LogError, LogResult, ReplayError};
use crate::header::LogHeader;
use crate::log::{IntentLog, ReplayState};
use crate::record::{
    AclBody, CreateBody, LinkBody, LogRecord, ObjectId, RecordBody, RecordKind, RemoveBody, RenameBody,
    SetattrBody, TruncateBody, WriteBody,
};
use crate::walker::{walk, ChainVisitor};

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// What a replay callback gets to know about the record it applies.
#[derive(Debug)]
pub struct ReplayContext<'a> {
    log: &'a IntentLog,
    seq: u64,
    txg: u64,
    byteswap: bool,
    case_insensitive: bool,
    parallel: bool,
}

impl<'a> ReplayContext<'a> {
    /// Sequence number of the record.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Generation the operation was originally logged in.
    pub fn txg(&self) -> u64 {
        self.txg
    }

    /// The block holding the record was written in the other byte order.
    /// Records are already decoded to host order; opaque payloads (ACL
    /// entries) are not.
    pub fn byteswap(&self) -> bool {
        self.byteswap
    }

    /// Names in the record compare case-insensitively.
    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    /// Call with the transaction the record is applied in. Returns `true`;
    /// the operation must not be logged again.
    pub fn replaying(&self, tx: &TxHandle) -> bool {
        if !self.parallel {
            return self.log.note_replayed(tx, Some(self.seq));
        }
        // Parallel writes advance the cursor once the pool drained.
        if self.log.config.sync != SyncMode::Disabled {
            self.log.engine.mark_dirty(self.log.dataset, tx);
        }
        true
    }
}

/// The filesystem layer that re-applies logged operations.
///
/// Every operation must be safe to apply twice: a crash during replay
/// repeats records whose effects had not synced yet.
pub trait ReplayTarget: Send + Sync {
    fn create(&self, ctx: &ReplayContext<'_>, body: &CreateBody) -> Result<(), ReplayError>;
    fn mkdir(&self, ctx: &ReplayContext<'_>, body: &CreateBody) -> Result<(), ReplayError>;
    fn mkxattr(&self, ctx: &ReplayContext<'_>, body: &CreateBody) -> Result<(), ReplayError>;
    fn symlink(&self, ctx: &ReplayContext<'_>, body: &CreateBody) -> Result<(), ReplayError>;
    fn remove(&self, ctx: &ReplayContext<'_>, body: &RemoveBody) -> Result<(), ReplayError>;
    fn rmdir(&self, ctx: &ReplayContext<'_>, body: &RemoveBody) -> Result<(), ReplayError>;
    fn link(&self, ctx: &ReplayContext<'_>, body: &LinkBody) -> Result<(), ReplayError>;
    fn rename(&self, ctx: &ReplayContext<'_>, body: &RenameBody) -> Result<(), ReplayError>;
    /// `data` is the write's payload, whether it was logged inline, in its
    /// own block, or not at all (zeroes).
    fn write(&self, ctx: &ReplayContext<'_>, body: &WriteBody, data: &[u8]) -> Result<(), ReplayError>;
    fn truncate(&self, ctx: &ReplayContext<'_>, body: &TruncateBody) -> Result<(), ReplayError>;
    fn setattr(&self, ctx: &ReplayContext<'_>, body: &SetattrBody) -> Result<(), ReplayError>;
    fn acl(&self, ctx: &ReplayContext<'_>, body: &AclBody) -> Result<(), ReplayError>;

    /// Returns `true` if `object` still exists. Records that may be logged
    /// out of order are skipped when their object is gone.
    fn object_exists(&self, object: ObjectId) -> bool;
}

fn dispatch(
    target: &dyn ReplayTarget,
    ctx: &ReplayContext<'_>,
    body: &RecordBody,
    data: &[u8],
) -> Result<(), ReplayError> {
    match body {
        RecordBody::Create(b) => target.create(ctx, b),
        RecordBody::Mkdir(b) => target.mkdir(ctx, b),
        RecordBody::Mkxattr(b) => target.mkxattr(ctx, b),
        RecordBody::Symlink(b) => target.symlink(ctx, b),
        RecordBody::Remove(b) => target.remove(ctx, b),
        RecordBody::Rmdir(b) => target.rmdir(ctx, b),
        RecordBody::Link(b) => target.link(ctx, b),
        RecordBody::Rename(b) => target.rename(ctx, b),
        RecordBody::Write(b) => target.write(ctx, b, data),
        RecordBody::Truncate(b) => target.truncate(ctx, b),
        RecordBody::Setattr(b) => target.setattr(ctx, b),
        RecordBody::Acl(b) => target.acl(ctx, b),
    }
}

/// Apply one record. A failure is retried once after a checkpoint: removes
/// of an earlier record may only become visible once they synced.
fn apply(log: &IntentLog, target: &dyn ReplayTarget, ctx: &ReplayContext<'_>, record: &LogRecord, data: &[u8]) -> LogResult<()> {
    let first = dispatch(target, ctx, &record.body, data);
    let Err(first) = first else {
        return Ok(());
    };
    debug!(seq = record.seq, kind = ?record.kind(), error = %first, "Replay failed; retrying after checkpoint");
    log.engine.wait_until_generation_synced(0)?;
    dispatch(target, ctx, &record.body, data).map_err(|source| LogError::ReplayFailed {
        seq: record.seq,
        kind: record.kind(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Write pool
// ---------------------------------------------------------------------------

struct WriteJob {
    record: LogRecord,
    data: Vec<u8>,
    byteswap: bool,
    range: (u64, u64),
}

#[derive(Default)]
struct PoolState {
    inflight: usize,
    /// In-flight byte ranges keyed by (object, start, seq), valued by end.
    ranges: BTreeMap<(ObjectId, u64, u64), u64>,
    /// Lowest-sequence failure so far.
    failure: Option<(u64, LogError)>,
    max_done_seq: u64,
}

impl PoolState {
    fn overlaps(&self, object: ObjectId, (start, end): (u64, u64)) -> bool {
        self.ranges
            .range((object, 0, 0)..=(object, u64::MAX, u64::MAX))
            .any(|(&(_, s, _), &e)| s < end && start < e)
    }

    fn fail(&mut self, seq: u64, error: LogError) {
        if self.failure.as_ref().map_or(true, |(lowest, _)| seq < *lowest) {
            self.failure = Some((seq, error));
        }
    }
}

#[derive(Default)]
struct WritePool {
    state: Mutex<PoolState>,
    idle: Condvar,
}

impl WritePool {
    fn wait_idle(&self) -> parking_lot::MutexGuard<'_, PoolState> {
        let mut state = self.state.lock();
        while state.inflight > 0 {
            self.idle.wait(&mut state);
        }
        state
    }

    /// Wait for every write and return the first failure, if any.
    fn drain(&self) -> Option<LogError> {
        self.wait_idle().failure.take().map(|(_, e)| e)
    }

    fn run(&self, log: &IntentLog, target: &dyn ReplayTarget, job: WriteJob) {
        let record = &job.record;
        let ctx = ReplayContext {
            log,
            seq: record.seq,
            txg: record.txg,
            byteswap: job.byteswap,
            case_insensitive: record.case_insensitive,
            parallel: true,
        };
        let result = apply(log, target, &ctx, record, &job.data);
        if result.is_ok() {
            log.stats.lock().records_replayed += 1;
        }

        let publish = {
            let mut state = self.state.lock();
            state
                .ranges
                .remove(&(record.body.object(), job.range.0, record.seq));
            state.inflight -= 1;
            match result {
                Ok(()) => state.max_done_seq = state.max_done_seq.max(record.seq),
                Err(e) => state.fail(record.seq, e),
            }
            (state.inflight == 0 && state.failure.is_none()).then_some(state.max_done_seq)
        };
        self.idle.notify_all();

        if let Some(seq) = publish {
            if let Err(e) = log.publish_replayed(seq) {
                warn!(seq, error = %e, "Cannot record replay progress");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Replayer
// ---------------------------------------------------------------------------

struct Replayer<'a> {
    log: &'a IntentLog,
    target: &'a dyn ReplayTarget,
    pool: &'a WritePool,
    jobs: Sender<WriteJob>,
    header: LogHeader,
    replayed: u64,
}

impl Replayer<'_> {
    /// Payload of a write record: inline, read from its data block, or a
    /// hole.
    fn write_data(&self, record: &LogRecord, body: &WriteBody) -> LogResult<Vec<u8>> {
        if let Some(data) = &body.data {
            return Ok(data.clone());
        }
        let failed = |reason: String| LogError::ReplayFailed {
            seq: record.seq,
            kind: RecordKind::Write,
            source: ReplayError::Failed(reason),
        };
        let length = usize::try_from(body.length).map_err(|_| failed("write length overflows".to_string()))?;
        let Some(bp) = body.blkptr else {
            // A hole never spans more than one data block.
            if body.length > self.log.config.max_block_size {
                return Err(failed(format!(
                    "hole of {length} bytes exceeds the {} byte block limit",
                    self.log.config.max_block_size
                )));
            }
            return Ok(vec![0u8; length]);
        };
        let raw = self
            .log
            .store
            .read_block(&bp)
            .map_err(|e| failed(format!("data block {bp}: {e}")))?;
        let start = usize::try_from(body.blkoff).unwrap_or(usize::MAX);
        raw.get(start..start.saturating_add(length))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| failed(format!("{length} bytes at {start} exceed data block {bp}")))
    }

    fn submit_write(&mut self, record: &LogRecord, block: &BlockPtr, body: &WriteBody) -> LogResult<()> {
        let data = self.write_data(record, body)?;
        let range = (body.offset, body.offset.saturating_add(body.length.max(1)));
        let object = body.foid;

        let mut state = self.pool.state.lock();
        if state.failure.is_some() || state.overlaps(object, range) {
            trace!(seq = record.seq, object = %object, "Draining replay writes");
            drop(state);
            state = self.pool.wait_idle();
            if let Some((_, e)) = state.failure.take() {
                return Err(e);
            }
        }
        state.ranges.insert((object, range.0, record.seq), range.1);
        state.inflight += 1;
        drop(state);

        let job = WriteJob {
            record: record.clone(),
            data,
            byteswap: !block.order.is_native(),
            range,
        };
        if let Err(channel::SendError(job)) = self.jobs.send(job) {
            // No workers left; run it here.
            self.pool.run(self.log, self.target, job);
        }
        self.replayed += 1;
        Ok(())
    }

    fn replay_in_order(&mut self, record: &LogRecord, block: &BlockPtr) -> LogResult<()> {
        if let Some(e) = self.pool.drain() {
            return Err(e);
        }
        self.log.state.lock().replay.seq = record.seq;
        let ctx = ReplayContext {
            log: self.log,
            seq: record.seq,
            txg: record.txg,
            byteswap: !block.order.is_native(),
            case_insensitive: record.case_insensitive,
            parallel: false,
        };
        apply(self.log, self.target, &ctx, record, &[])?;
        self.log.stats.lock().records_replayed += 1;
        self.replayed += 1;
        Ok(())
    }
}

impl ChainVisitor for Replayer<'_> {
    fn visit_block(&mut self, _bp: &BlockPtr) -> Result<(), LogError> {
        self.log.stats.lock().replay_blocks += 1;
        Ok(())
    }

    fn visit_record(&mut self, record: &LogRecord, block: &BlockPtr) -> Result<(), LogError> {
        if record.seq <= self.header.replay_seq || record.txg < self.header.claim_txg {
            return Ok(());
        }

        let kind = record.kind();
        if kind.may_be_out_of_order() && !self.target.object_exists(record.body.object()) {
            debug!(seq = record.seq, ?kind, object = %record.body.object(), "Replay target gone; skipping");
            self.log.stats.lock().replay_skipped += 1;
            return Ok(());
        }

        match &record.body {
            RecordBody::Write(body) => self.submit_write(record, block, body),
            _ => self.replay_in_order(record, block),
        }
    }
}

// ---------------------------------------------------------------------------
// IntentLog::replay
// ---------------------------------------------------------------------------

impl IntentLog {
    /// Replay a claimed log through `target`, then destroy it. Returns the
    /// number of records replayed.
    ///
    /// A failed replay leaves the log in place; the records that completed
    /// are not repeated by the next attempt once their generation synced.
    pub fn replay(&self, target: &dyn ReplayTarget) -> LogResult<u64> {
        let header = self.header();

        if self.config.replay_disabled {
            let txg = self.destroy(false)?;
            if txg != 0 {
                self.engine.wait_until_generation_synced(txg)?;
            }
            warn!(dataset = %self.dataset, "Log replay disabled; discarded log");
            return Ok(0);
        }
        if !header.replay_needed() {
            self.destroy(true)?;
            return Ok(0);
        }

        self.engine.wait_until_generation_synced(0)?;
        self.state.lock().replay = ReplayState { active: true, seq: 0 };
        let outcome = self.replay_chain(&header, target);
        self.state.lock().replay.active = false;

        let replayed = match outcome {
            Ok(replayed) => replayed,
            Err(e) => {
                error!(dataset = %self.dataset, error = %e, "Log replay failed");
                return Err(e);
            }
        };

        let txg = self.destroy(false)?;
        if txg != 0 {
            self.engine.wait_until_generation_synced(txg)?;
        }
        info!(
            dataset = %self.dataset,
            records = replayed,
            skipped = self.stats.lock().replay_skipped,
            "Replayed intent log"
        );
        Ok(replayed)
    }

    fn replay_chain(&self, header: &LogHeader, target: &dyn ReplayTarget) -> LogResult<u64> {
        let pool = WritePool::default();
        let transform = self.transform.read().clone();
        let (jobs, queue) = channel::unbounded::<WriteJob>();

        let (summary, replayed) = std::thread::scope(|scope| {
            for _ in 0..self.config.replay_threads {
                let queue = queue.clone();
                let pool = &pool;
                scope.spawn(move || {
                    for job in queue.iter() {
                        pool.run(self, target, job);
                    }
                });
            }
            drop(queue);

            let mut replayer = Replayer {
                log: self,
                target,
                pool: &pool,
                jobs,
                header: *header,
                replayed: 0,
            };
            let summary = walk(header, self.store.as_ref(), transform.as_deref(), &mut replayer);
            let replayed = replayer.replayed;
            // Dropping the sender lets the workers exit once the queue is empty.
            drop(replayer);
            (summary, replayed)
        });

        if let Some(e) = pool.drain() {
            return Err(e);
        }
        match summary.fatal() {
            Some(e) => Err(e),
            None => Ok(replayed),
        }
    }
}
