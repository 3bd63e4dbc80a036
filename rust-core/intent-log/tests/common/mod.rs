// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Integration test support
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A toy filesystem that sits on top of the log the way a real one would:
// every operation updates its in-memory image and queues an itx, the image
// serves write data to the committing writer, and after a crash a fresh
// image built from the last checkpoint is brought up to date by replay.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use intent_log::chain::decode_and_validate_block;
use intent_log::record::{
    AclBody, CreateBody, LinkBody, RemoveBody, RenameBody, SetattrBody, TruncateBody, WriteBody,
};
use intent_log::{
    BlockPtr, BlockStore, ByteOrder, ChainSeed, CheckpointEngine, ClaimMode, DataFetcher, DatasetId,
    FetchContext, FetchError, FetchOutcome, FetchTarget, IntentLog, LogConfig, LogHeader, LogRecord,
    MemoryPool, ObjectId, RecordBody, RecordKind, ReplayContext, ReplayError, ReplayTarget,
    WriteCompletion, WriteState,
};

pub const DATASET: DatasetId = DatasetId(1);

/// Root directory of every image.
pub const ROOT: ObjectId = ObjectId(1);

/// Writes of at least this many bytes are logged by reference.
pub const INDIRECT_THRESHOLD: usize = 32 * 1024;

/// Route library logs to the test output once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("intent_log=debug")
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// FsImage
// ---------------------------------------------------------------------------

/// Everything the toy filesystem stores.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FsImage {
    /// Directory entries: (parent, name) -> object.
    pub entries: BTreeMap<(ObjectId, String), ObjectId>,
    /// Object contents. Directories have empty contents.
    pub objects: BTreeMap<ObjectId, Vec<u8>>,
    pub modes: BTreeMap<ObjectId, u64>,
    pub acls: BTreeMap<ObjectId, Vec<u8>>,
}

impl FsImage {
    pub fn with_root() -> Self {
        let mut image = Self::default();
        image.objects.insert(ROOT, Vec::new());
        image
    }

    fn unlink(&mut self, doid: ObjectId, name: &str) {
        let Some(object) = self.entries.remove(&(doid, name.to_string())) else {
            return;
        };
        if !self.entries.values().any(|o| *o == object) {
            self.objects.remove(&object);
            self.modes.remove(&object);
            self.acls.remove(&object);
        }
    }

    fn write_at(&mut self, object: ObjectId, offset: u64, data: &[u8]) -> bool {
        let Some(contents) = self.objects.get_mut(&object) else {
            return false;
        };
        let start = offset as usize;
        let end = start + data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[start..end].copy_from_slice(data);
        true
    }
}

// ---------------------------------------------------------------------------
// ModelFs
// ---------------------------------------------------------------------------

/// The toy filesystem. Replay handlers are idempotent: applying a record
/// whose effect is already present succeeds without changing anything.
pub struct ModelFs {
    pub image: Mutex<FsImage>,
    /// Records applied by replay, in completion order.
    pub applied: Mutex<Vec<(u64, RecordKind)>>,
    /// Replay of this sequence number always fails.
    pub fail_at: Mutex<Option<u64>>,
    pool: Arc<MemoryPool>,
}

impl ModelFs {
    pub fn new(pool: Arc<MemoryPool>, image: FsImage) -> Self {
        Self {
            image: Mutex::new(image),
            applied: Mutex::new(Vec::new()),
            fail_at: Mutex::new(None),
            pool,
        }
    }

    pub fn snapshot(&self) -> FsImage {
        self.image.lock().clone()
    }

    /// Sequence numbers applied by replay, sorted.
    pub fn applied_seqs(&self) -> Vec<u64> {
        let mut seqs: Vec<u64> = self.applied.lock().iter().map(|(seq, _)| *seq).collect();
        seqs.sort_unstable();
        seqs
    }

    /// Apply one replayed record inside a transaction, the way a real
    /// filesystem would.
    fn replayed(
        &self,
        ctx: &ReplayContext<'_>,
        kind: RecordKind,
        apply: impl FnOnce(&mut FsImage) -> Result<(), ReplayError>,
    ) -> Result<(), ReplayError> {
        if *self.fail_at.lock() == Some(ctx.seq()) {
            return Err(ReplayError::Failed(format!("refusing record {}", ctx.seq())));
        }
        let tx = self
            .pool
            .begin_transaction()
            .map_err(|e| ReplayError::Failed(e.to_string()))?;
        let result = apply(&mut *self.image.lock());
        if result.is_ok() {
            ctx.replaying(&tx);
            self.applied.lock().push((ctx.seq(), kind));
        }
        self.pool.commit_transaction(tx);
        result
    }

    fn created(&self, ctx: &ReplayContext<'_>, kind: RecordKind, body: &CreateBody) -> Result<(), ReplayError> {
        self.replayed(ctx, kind, |image| {
            let key = (body.doid, body.name.clone());
            match image.entries.get(&key) {
                Some(existing) if *existing == body.foid => return Ok(()),
                Some(_) => return Err(ReplayError::AlreadyExists(body.name.clone())),
                None => {}
            }
            image.entries.insert(key, body.foid);
            let contents = image.objects.entry(body.foid).or_default();
            if kind == RecordKind::Symlink {
                *contents = body.target.as_bytes().to_vec();
            }
            image.modes.insert(body.foid, body.mode);
            Ok(())
        })
    }
}

impl ReplayTarget for ModelFs {
    fn create(&self, ctx: &ReplayContext<'_>, body: &CreateBody) -> Result<(), ReplayError> {
        self.created(ctx, RecordKind::Create, body)
    }

    fn mkdir(&self, ctx: &ReplayContext<'_>, body: &CreateBody) -> Result<(), ReplayError> {
        self.created(ctx, RecordKind::Mkdir, body)
    }

    fn mkxattr(&self, ctx: &ReplayContext<'_>, body: &CreateBody) -> Result<(), ReplayError> {
        self.created(ctx, RecordKind::Mkxattr, body)
    }

    fn symlink(&self, ctx: &ReplayContext<'_>, body: &CreateBody) -> Result<(), ReplayError> {
        self.created(ctx, RecordKind::Symlink, body)
    }

    fn remove(&self, ctx: &ReplayContext<'_>, body: &RemoveBody) -> Result<(), ReplayError> {
        self.replayed(ctx, RecordKind::Remove, |image| {
            image.unlink(body.doid, &body.name);
            Ok(())
        })
    }

    fn rmdir(&self, ctx: &ReplayContext<'_>, body: &RemoveBody) -> Result<(), ReplayError> {
        self.replayed(ctx, RecordKind::Rmdir, |image| {
            image.unlink(body.doid, &body.name);
            Ok(())
        })
    }

    fn link(&self, ctx: &ReplayContext<'_>, body: &LinkBody) -> Result<(), ReplayError> {
        self.replayed(ctx, RecordKind::Link, |image| {
            if !image.objects.contains_key(&body.link_obj) {
                return Err(ReplayError::ObjectNotFound(body.link_obj.0));
            }
            image.entries.insert((body.doid, body.name.clone()), body.link_obj);
            Ok(())
        })
    }

    fn rename(&self, ctx: &ReplayContext<'_>, body: &RenameBody) -> Result<(), ReplayError> {
        self.replayed(ctx, RecordKind::Rename, |image| {
            let target = (body.tdoid, body.tname.clone());
            match image.entries.remove(&(body.sdoid, body.sname.clone())) {
                Some(object) => {
                    image.entries.insert(target, object);
                    Ok(())
                }
                None if image.entries.get(&target) == Some(&body.foid) => Ok(()),
                None => Err(ReplayError::ObjectNotFound(body.foid.0)),
            }
        })
    }

    fn write(&self, ctx: &ReplayContext<'_>, body: &WriteBody, data: &[u8]) -> Result<(), ReplayError> {
        self.replayed(ctx, RecordKind::Write, |image| {
            if image.write_at(body.foid, body.offset, data) {
                Ok(())
            } else {
                Err(ReplayError::ObjectNotFound(body.foid.0))
            }
        })
    }

    fn truncate(&self, ctx: &ReplayContext<'_>, body: &TruncateBody) -> Result<(), ReplayError> {
        self.replayed(ctx, RecordKind::Truncate, |image| {
            let contents = image
                .objects
                .get_mut(&body.foid)
                .ok_or(ReplayError::ObjectNotFound(body.foid.0))?;
            contents.resize(body.offset as usize, 0);
            Ok(())
        })
    }

    fn setattr(&self, ctx: &ReplayContext<'_>, body: &SetattrBody) -> Result<(), ReplayError> {
        self.replayed(ctx, RecordKind::Setattr, |image| {
            if !image.objects.contains_key(&body.foid) {
                return Err(ReplayError::ObjectNotFound(body.foid.0));
            }
            image.modes.insert(body.foid, body.mode);
            Ok(())
        })
    }

    fn acl(&self, ctx: &ReplayContext<'_>, body: &AclBody) -> Result<(), ReplayError> {
        self.replayed(ctx, RecordKind::Acl, |image| {
            if !image.objects.contains_key(&body.foid) {
                return Err(ReplayError::ObjectNotFound(body.foid.0));
            }
            image.acls.insert(body.foid, body.data.clone());
            Ok(())
        })
    }

    fn object_exists(&self, object: ObjectId) -> bool {
        self.image.lock().objects.contains_key(&object)
    }
}

impl DataFetcher for ModelFs {
    fn fetch(
        &self,
        record: &LogRecord,
        target: FetchTarget<'_>,
        ctx: &mut FetchContext,
    ) -> Result<FetchOutcome, FetchError> {
        let RecordBody::Write(body) = &record.body else {
            return Err(FetchError::Io("not a write record".to_string()));
        };
        let data = {
            let image = self.image.lock();
            let contents = image.objects.get(&body.foid).ok_or(FetchError::NotFound)?;
            let start = (body.offset as usize).min(contents.len());
            let end = (body.offset + body.length).min(contents.len() as u64) as usize;
            let mut data = contents[start..end].to_vec();
            data.resize(body.length as usize, 0);
            data
        };

        match target {
            FetchTarget::Buffer(buf) => {
                buf.copy_from_slice(&data);
                Ok(FetchOutcome::Copied)
            }
            FetchTarget::Indirect => {
                let size = (data.len() as u64).next_multiple_of(4096);
                let addr = self
                    .pool
                    .alloc_log_block(record.txg, size, false)
                    .map_err(|e| FetchError::Io(e.to_string()))?;
                let bp = BlockPtr {
                    device: addr.device,
                    offset: addr.offset,
                    size,
                    birth: record.txg,
                    seed: ChainSeed::default(),
                    order: ByteOrder::NATIVE,
                    encrypted: false,
                };
                let mut block = data;
                block.resize(size as usize, 0);
                let (done, pending) = WriteCompletion::pair();
                self.pool.write_block_async(&bp, block, done);
                ctx.attach_write(pending, bp.device);
                Ok(FetchOutcome::Indirect(bp))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mounted filesystem
// ---------------------------------------------------------------------------

/// A filesystem with its log open for business.
pub struct Mounted {
    pub pool: Arc<MemoryPool>,
    pub log: Arc<IntentLog>,
    pub fs: Arc<ModelFs>,
}

impl Mounted {
    /// Open the log on `pool` with `image` as the checkpointed state. The
    /// log is not claimed or replayed.
    pub fn open(pool: Arc<MemoryPool>, image: FsImage, config: LogConfig) -> Self {
        let log = IntentLog::open(DATASET, pool.clone(), pool.clone(), config).unwrap();
        let fs = Arc::new(ModelFs::new(pool.clone(), image));
        log.set_fetcher(fs.clone());
        Self { pool, log, fs }
    }

    /// A fresh filesystem whose log chain already exists, so commits write
    /// log blocks. Returns it with the image as of its last checkpoint.
    pub fn fresh(pool: Arc<MemoryPool>, config: LogConfig) -> (Self, FsImage) {
        let mounted = Self::open(pool, FsImage::with_root(), config);
        mounted.setattr(ROOT, 0o755);
        mounted.log.commit(None).unwrap();
        assert!(mounted.log.header().log.is_some());
        let checkpointed = mounted.fs.snapshot();
        (mounted, checkpointed)
    }

    /// Simulate a crash and mount the surviving pool: check, claim and
    /// replay the log on top of `checkpointed`.
    pub fn crash_and_recover(&self, checkpointed: FsImage, config: LogConfig) -> (Self, u64) {
        let pool = Arc::new(self.pool.crash());
        Self::recover(pool, checkpointed, config)
    }

    /// Mount `pool` after a crash.
    pub fn recover(pool: Arc<MemoryPool>, checkpointed: FsImage, config: LogConfig) -> (Self, u64) {
        let mounted = Self::open(pool, checkpointed, config);
        mounted.log.check_log_chain().unwrap();
        mounted.log.claim(ClaimMode::Normal).unwrap();
        let replayed = mounted.log.replay(mounted.fs.as_ref()).unwrap();
        (mounted, replayed)
    }

    fn logged(&self, body: RecordBody, sync: bool, state: WriteState, apply: impl FnOnce(&mut FsImage)) {
        let tx = self.pool.begin_transaction().unwrap();
        apply(&mut *self.fs.image.lock());
        let itx = self.log.itx_create(body).with_sync(sync).with_write_state(state);
        self.log.itx_assign(itx, &tx);
        self.pool.commit_transaction(tx);
    }

    pub fn create(&self, doid: ObjectId, name: &str, foid: ObjectId) {
        let body = RecordBody::Create(CreateBody {
            doid,
            foid,
            mode: 0o644,
            name: name.to_string(),
            ..CreateBody::default()
        });
        self.logged(body, true, WriteState::Copied, |image| {
            image.entries.insert((doid, name.to_string()), foid);
            image.objects.insert(foid, Vec::new());
            image.modes.insert(foid, 0o644);
        });
    }

    pub fn mkdir(&self, doid: ObjectId, name: &str, foid: ObjectId) {
        let body = RecordBody::Mkdir(CreateBody {
            doid,
            foid,
            mode: 0o755,
            name: name.to_string(),
            ..CreateBody::default()
        });
        self.logged(body, true, WriteState::Copied, |image| {
            image.entries.insert((doid, name.to_string()), foid);
            image.objects.insert(foid, Vec::new());
            image.modes.insert(foid, 0o755);
        });
    }

    /// Write `data`. Asynchronous writes reach the log only when something
    /// commits their object. Large writes are logged by reference.
    pub fn write(&self, foid: ObjectId, offset: u64, data: &[u8], sync: bool) {
        let state = if data.len() >= INDIRECT_THRESHOLD {
            WriteState::Indirect
        } else {
            WriteState::NeedCopy
        };
        let body = RecordBody::Write(WriteBody {
            foid,
            offset,
            length: data.len() as u64,
            ..WriteBody::default()
        });
        self.logged(body, sync, state, |image| {
            image.write_at(foid, offset, data);
        });
    }

    pub fn rename(&self, sdoid: ObjectId, sname: &str, tdoid: ObjectId, tname: &str) {
        let foid = self.fs.image.lock().entries[&(sdoid, sname.to_string())];
        let body = RecordBody::Rename(RenameBody {
            sdoid,
            tdoid,
            foid,
            sname: sname.to_string(),
            tname: tname.to_string(),
        });
        self.logged(body, true, WriteState::Copied, |image| {
            image.entries.remove(&(sdoid, sname.to_string()));
            image.entries.insert((tdoid, tname.to_string()), foid);
        });
    }

    pub fn remove(&self, doid: ObjectId, name: &str) {
        let body = RecordBody::Remove(RemoveBody {
            doid,
            name: name.to_string(),
        });
        self.logged(body, true, WriteState::Copied, |image| image.unlink(doid, name));
    }

    pub fn truncate(&self, foid: ObjectId, size: u64) {
        let body = RecordBody::Truncate(TruncateBody {
            foid,
            offset: size,
            length: 0,
        });
        self.logged(body, true, WriteState::Copied, |image| {
            if let Some(contents) = image.objects.get_mut(&foid) {
                contents.resize(size as usize, 0);
            }
        });
    }

    pub fn setattr(&self, foid: ObjectId, mode: u64) {
        let body = RecordBody::Setattr(SetattrBody {
            foid,
            mask: 1,
            mode,
            ..SetattrBody::default()
        });
        self.logged(body, true, WriteState::Copied, |image| {
            image.modes.insert(foid, mode);
        });
    }
}

// ---------------------------------------------------------------------------
// Chain inspection
// ---------------------------------------------------------------------------

/// Blocks reachable from `header` that validate, each with its records,
/// followed by the first block that does not.
pub fn chain_blocks(pool: &MemoryPool, header: &LogHeader) -> (Vec<(BlockPtr, Vec<LogRecord>)>, Option<BlockPtr>) {
    let mut valid = Vec::new();
    let mut bp = header.log;
    while let Some(block) = bp {
        let decoded = pool
            .read_block(&block)
            .ok()
            .and_then(|raw| decode_and_validate_block(&raw, &block, None).ok());
        match decoded {
            Some(decoded) => {
                valid.push((block, decoded.records));
                bp = Some(decoded.next);
            }
            None => return (valid, Some(block)),
        }
    }
    (valid, None)
}
