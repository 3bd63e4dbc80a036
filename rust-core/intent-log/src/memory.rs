// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory checkpoint engine and block store for the intent log.
//
// `MemoryPool` plays both collaborators at once: it numbers generations,
// tracks open transactions and dirty datasets, persists log headers, and
// stores blocks on simulated devices with volatile write caches. It is
// meant for tests, benchmarks and fuzzing, so it can also inject faults and
// simulate a crash.
//
// Generations are synced on demand: whoever waits for a generation drives
// the sync in its own thread. A sync quiesces the generation (waits for its
// open transactions), runs the dirty datasets' sync hooks, writes every
// device cache out, applies the generation's frees, and persists headers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::blkptr::{BlockAddr, BlockPtr, DeviceId};
use crate::engine::{CheckpointEngine, DatasetId, SyncContext, SyncParticipant, TxHandle};
use crate::error::{EngineError, StoreError};
use crate::store::{BlockStore, WriteCompletion};

/// Device that holds ordinary allocations.
pub const MAIN_DEVICE: DeviceId = DeviceId(0);

/// Fast-tier log device created by [`MemoryPool::with_log_device`].
pub const LOG_DEVICE: DeviceId = DeviceId(1);

const DEVICE_CAPACITY: u64 = 1 << 40;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct EngineState {
    open_txg: u64,
    last_synced: u64,
    first_txg: u64,
    freeze_txg: Option<u64>,
    next_tx_id: u64,
    open_txs: BTreeMap<u64, usize>,
    dirty: BTreeMap<u64, BTreeSet<DatasetId>>,
    headers: BTreeMap<DatasetId, Vec<u8>>,
    pending_headers: BTreeMap<DatasetId, Vec<u8>>,
    shutdown: bool,
}

impl EngineState {
    fn after_load(last_synced: u64, headers: BTreeMap<DatasetId, Vec<u8>>) -> Self {
        Self {
            open_txg: last_synced + 1,
            last_synced,
            first_txg: last_synced + 1,
            freeze_txg: None,
            next_tx_id: 1,
            open_txs: BTreeMap::new(),
            dirty: BTreeMap::new(),
            headers,
            pending_headers: BTreeMap::new(),
            shutdown: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Device {
    present: bool,
    fast: bool,
    next_offset: u64,
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    size: u64,
    txg: u64,
}

#[derive(Debug, Clone, Default)]
struct Faults {
    writes: usize,
    flushes: usize,
    allocs: usize,
    reads: usize,
}

#[derive(Debug, Clone, Default)]
struct DiskState {
    devices: BTreeMap<DeviceId, Device>,
    durable: HashMap<BlockAddr, Vec<u8>>,
    volatile: HashMap<BlockAddr, Vec<u8>>,
    allocated: HashMap<BlockAddr, Allocation>,
    pending_frees: BTreeMap<u64, Vec<BlockAddr>>,
    free_extents: Vec<(BlockAddr, u64)>,
    faults: Faults,
    write_count: u64,
    flush_count: u64,
}

impl DiskState {
    fn check_present(&self, device: DeviceId) -> Result<(), StoreError> {
        match self.devices.get(&device) {
            Some(dev) if dev.present => Ok(()),
            _ => Err(StoreError::MissingDevice(device.0)),
        }
    }

    fn write_back(&mut self, devices: Option<&BTreeSet<DeviceId>>) {
        let flushed: Vec<BlockAddr> = self
            .volatile
            .keys()
            .filter(|addr| devices.map_or(true, |set| set.contains(&addr.device)))
            .copied()
            .collect();
        for addr in flushed {
            if let Some(data) = self.volatile.remove(&addr) {
                self.durable.insert(addr, data);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryPool
// ---------------------------------------------------------------------------

/// An in-memory engine and block store with fault injection.
///
/// # Example
///
/// ```rust
/// use intent_log::engine::CheckpointEngine;
/// use intent_log::memory::MemoryPool;
///
/// let pool = MemoryPool::new();
/// let tx = pool.begin_transaction().unwrap();
/// assert_eq!(tx.txg(), 1);
/// pool.commit_transaction(tx);
/// pool.wait_until_generation_synced(1).unwrap();
/// assert_eq!(pool.last_synced_generation(), 1);
/// ```
pub struct MemoryPool {
    engine: Mutex<EngineState>,
    engine_cv: Condvar,
    sync_lock: Mutex<()>,
    disk: Mutex<DiskState>,
    participants: Mutex<BTreeMap<DatasetId, Weak<dyn SyncParticipant>>>,
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let engine = self.engine.lock();
        f.debug_struct("MemoryPool")
            .field("open_txg", &engine.open_txg)
            .field("last_synced", &engine.last_synced)
            .finish_non_exhaustive()
    }
}

impl MemoryPool {
    /// A pool with only the main device.
    pub fn new() -> Self {
        let mut disk = DiskState::default();
        disk.devices.insert(
            MAIN_DEVICE,
            Device {
                present: true,
                fast: false,
                next_offset: 0,
            },
        );
        Self::from_parts(EngineState::after_load(0, BTreeMap::new()), disk)
    }

    /// A pool with the main device plus a fast-tier log device.
    pub fn with_log_device() -> Self {
        let pool = Self::new();
        pool.disk.lock().devices.insert(
            LOG_DEVICE,
            Device {
                present: true,
                fast: true,
                next_offset: 0,
            },
        );
        pool
    }

    fn from_parts(engine: EngineState, disk: DiskState) -> Self {
        Self {
            engine: Mutex::new(engine),
            engine_cv: Condvar::new(),
            sync_lock: Mutex::new(()),
            disk: Mutex::new(disk),
            participants: Mutex::new(BTreeMap::new()),
        }
    }

    /// Sync the currently open generation and return its number.
    pub fn sync(&self) -> Result<u64, EngineError> {
        let _syncing = self.sync_lock.lock();

        let (txg, dirty) = {
            let mut engine = self.engine.lock();
            if engine.shutdown {
                return Err(EngineError::Shutdown);
            }
            let txg = engine.open_txg;
            engine.open_txg += 1;
            while engine.open_txs.get(&txg).copied().unwrap_or(0) > 0 {
                self.engine_cv.wait(&mut engine);
            }
            engine.open_txs.remove(&txg);
            (txg, engine.dirty.remove(&txg).unwrap_or_default())
        };

        let ctx = SyncContext { txg };
        for participant in self.participants_for(Some(&dirty)) {
            participant.sync(&ctx);
        }

        let freed = {
            let mut disk = self.disk.lock();
            disk.write_back(None);
            let frees = disk.pending_frees.remove(&txg).unwrap_or_default();
            let mut freed = 0;
            for addr in frees {
                if let Some(allocation) = disk.allocated.remove(&addr) {
                    disk.free_extents.push((addr, allocation.size));
                    freed += 1;
                }
            }
            freed
        };

        {
            let mut engine = self.engine.lock();
            let headers = std::mem::take(&mut engine.pending_headers);
            engine.headers.extend(headers);
            engine.last_synced = txg;
        }
        self.engine_cv.notify_all();

        for participant in self.participants_for(None) {
            participant.clean(txg);
        }
        trace!(txg, datasets = dirty.len(), freed, "Synced generation");
        Ok(txg)
    }

    fn participants_for(&self, only: Option<&BTreeSet<DatasetId>>) -> Vec<Arc<dyn SyncParticipant>> {
        self.participants
            .lock()
            .iter()
            .filter(|(dataset, _)| only.map_or(true, |set| set.contains(dataset)))
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    /// Simulate a crash: return the pool as it would look after a reboot.
    ///
    /// Only flushed block contents, synced allocations and synced headers
    /// survive. Faults are cleared; device presence is kept.
    pub fn crash(&self) -> MemoryPool {
        let engine = self.engine.lock();
        let disk = self.disk.lock();
        let last_synced = engine.last_synced;

        let after = DiskState {
            devices: disk.devices.clone(),
            durable: disk.durable.clone(),
            volatile: HashMap::new(),
            allocated: disk
                .allocated
                .iter()
                .filter(|(_, a)| a.txg <= last_synced)
                .map(|(addr, a)| (*addr, *a))
                .collect(),
            pending_frees: BTreeMap::new(),
            free_extents: disk.free_extents.clone(),
            faults: Faults::default(),
            write_count: 0,
            flush_count: 0,
        };
        debug!(last_synced, "Simulated crash");
        Self::from_parts(EngineState::after_load(last_synced, engine.headers.clone()), after)
    }

    /// Stop syncing; waiters and new transactions fail with `Shutdown`.
    pub fn shutdown(&self) {
        self.engine.lock().shutdown = true;
        self.engine_cv.notify_all();
    }

    /// Generations after `generation` are never written to the main store.
    pub fn freeze(&self, generation: u64) {
        self.engine.lock().freeze_txg = Some(generation);
    }

    // -- fault injection ---------------------------------------------------

    /// Fail the next `count` block writes with an I/O error.
    pub fn fail_writes(&self, count: usize) {
        self.disk.lock().faults.writes = count;
    }

    /// Fail the next `count` cache flushes.
    pub fn fail_flushes(&self, count: usize) {
        self.disk.lock().faults.flushes = count;
    }

    /// Fail the next `count` log block allocations with `NoSpace`.
    pub fn fail_allocs(&self, count: usize) {
        self.disk.lock().faults.allocs = count;
    }

    /// Fail the next `count` block reads with an I/O error.
    pub fn fail_reads(&self, count: usize) {
        self.disk.lock().faults.reads = count;
    }

    /// Attach or detach a device.
    pub fn set_device_present(&self, device: DeviceId, present: bool) {
        if let Some(dev) = self.disk.lock().devices.get_mut(&device) {
            dev.present = present;
        }
    }

    /// Flip a byte in the stored contents of the block at `addr`.
    pub fn corrupt_block(&self, addr: BlockAddr) {
        let mut disk = self.disk.lock();
        let disk = &mut *disk;
        for copy in [disk.volatile.get_mut(&addr), disk.durable.get_mut(&addr)]
            .into_iter()
            .flatten()
        {
            if let Some(byte) = copy.first_mut() {
                *byte ^= 0xff;
            }
        }
    }

    // -- inspection --------------------------------------------------------

    /// Returns `true` if the block at `addr` is allocated.
    pub fn is_allocated(&self, addr: BlockAddr) -> bool {
        self.disk.lock().allocated.contains_key(&addr)
    }

    /// Number of allocated blocks on `device`.
    pub fn allocated_on(&self, device: DeviceId) -> usize {
        self.disk
            .lock()
            .allocated
            .keys()
            .filter(|addr| addr.device == device)
            .count()
    }

    /// Block writes accepted so far.
    pub fn write_count(&self) -> u64 {
        self.disk.lock().write_count
    }

    /// Cache flushes requested so far.
    pub fn flush_count(&self) -> u64 {
        self.disk.lock().flush_count
    }

    /// The header last persisted for `dataset`.
    pub fn persisted_header(&self, dataset: DatasetId) -> Vec<u8> {
        self.engine.lock().headers.get(&dataset).cloned().unwrap_or_default()
    }

    /// Write `data` to `bp` and make it durable immediately. Used to set up
    /// on-media state directly.
    pub fn write_durable(&self, bp: &BlockPtr, data: Vec<u8>) {
        self.disk.lock().durable.insert(bp.addr(), data);
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// CheckpointEngine
// ---------------------------------------------------------------------------

impl CheckpointEngine for MemoryPool {
    fn begin_transaction(&self) -> Result<TxHandle, EngineError> {
        let mut engine = self.engine.lock();
        if engine.shutdown {
            return Err(EngineError::Shutdown);
        }
        let txg = engine.open_txg;
        let id = engine.next_tx_id;
        engine.next_tx_id += 1;
        *engine.open_txs.entry(txg).or_insert(0) += 1;
        Ok(TxHandle::new(txg, id))
    }

    fn commit_transaction(&self, tx: TxHandle) {
        let mut engine = self.engine.lock();
        if let Some(count) = engine.open_txs.get_mut(&tx.txg()) {
            *count = count.saturating_sub(1);
        }
        drop(engine);
        self.engine_cv.notify_all();
    }

    fn mark_dirty(&self, dataset: DatasetId, tx: &TxHandle) {
        self.engine
            .lock()
            .dirty
            .entry(tx.txg())
            .or_default()
            .insert(dataset);
    }

    fn current_generation(&self) -> u64 {
        self.engine.lock().open_txg
    }

    fn last_synced_generation(&self) -> u64 {
        self.engine.lock().last_synced
    }

    fn first_usable_generation(&self) -> u64 {
        self.engine.lock().first_txg
    }

    fn wait_until_generation_synced(&self, generation: u64) -> Result<(), EngineError> {
        let target = if generation == 0 {
            self.engine.lock().open_txg
        } else {
            generation
        };
        loop {
            {
                let engine = self.engine.lock();
                if engine.last_synced >= target {
                    return Ok(());
                }
                if engine.shutdown {
                    return Err(EngineError::Shutdown);
                }
            }
            self.sync()?;
        }
    }

    fn is_generation_frozen(&self, generation: u64) -> bool {
        self.engine
            .lock()
            .freeze_txg
            .is_some_and(|freeze| generation > freeze)
    }

    fn load_log_header(&self, dataset: DatasetId) -> Result<Vec<u8>, EngineError> {
        Ok(self.persisted_header(dataset))
    }

    fn store_log_header(&self, dataset: DatasetId, header: &[u8], _txg: u64) {
        self.engine
            .lock()
            .pending_headers
            .insert(dataset, header.to_vec());
    }

    fn register_participant(&self, dataset: DatasetId, participant: Weak<dyn SyncParticipant>) {
        self.participants.lock().insert(dataset, participant);
    }

    fn unregister_participant(&self, dataset: DatasetId) {
        self.participants.lock().remove(&dataset);
    }
}

// ---------------------------------------------------------------------------
// BlockStore
// ---------------------------------------------------------------------------

impl BlockStore for MemoryPool {
    fn alloc_log_block(
        &self,
        generation: u64,
        size: u64,
        prefer_fast_tier: bool,
    ) -> Result<BlockAddr, StoreError> {
        let mut disk = self.disk.lock();
        if disk.faults.allocs > 0 {
            disk.faults.allocs -= 1;
            return Err(StoreError::NoSpace { size });
        }

        let device = disk
            .devices
            .iter()
            .find(|(_, dev)| prefer_fast_tier && dev.fast && dev.present)
            .map_or(MAIN_DEVICE, |(id, _)| *id);
        disk.check_present(device)?;

        let reuse = disk
            .free_extents
            .iter()
            .position(|(addr, extent)| addr.device == device && *extent == size);
        let addr = match reuse {
            Some(index) => disk.free_extents.swap_remove(index).0,
            None => {
                let dev = disk
                    .devices
                    .get_mut(&device)
                    .ok_or(StoreError::MissingDevice(device.0))?;
                if dev.next_offset + size > DEVICE_CAPACITY {
                    return Err(StoreError::NoSpace { size });
                }
                let offset = dev.next_offset;
                dev.next_offset += size;
                BlockAddr { device, offset }
            }
        };
        disk.allocated.insert(addr, Allocation { size, txg: generation });
        Ok(addr)
    }

    fn free_block(&self, bp: &BlockPtr, generation: u64) {
        self.disk
            .lock()
            .pending_frees
            .entry(generation)
            .or_default()
            .push(bp.addr());
    }

    fn claim_block(&self, bp: &BlockPtr, generation: Option<u64>) -> Result<(), StoreError> {
        let mut disk = self.disk.lock();
        disk.check_present(bp.device)?;
        let addr = bp.addr();
        if disk.allocated.contains_key(&addr) {
            return Err(StoreError::AlreadyAllocated {
                device: addr.device.0,
                offset: addr.offset,
            });
        }
        if let Some(txg) = generation {
            disk.free_extents.retain(|(free, _)| *free != addr);
            disk.allocated.insert(addr, Allocation { size: bp.size, txg });
        }
        Ok(())
    }

    fn write_block_async(&self, bp: &BlockPtr, data: Vec<u8>, done: WriteCompletion) {
        let result = {
            let mut disk = self.disk.lock();
            if let Err(e) = disk.check_present(bp.device) {
                Err(e)
            } else if disk.faults.writes > 0 {
                disk.faults.writes -= 1;
                Err(StoreError::Io(format!("injected write failure at {}", bp.device)))
            } else if data.len() as u64 != bp.size {
                Err(StoreError::Io(format!(
                    "{} bytes written to a {}-byte block",
                    data.len(),
                    bp.size
                )))
            } else {
                disk.write_count += 1;
                disk.volatile.insert(bp.addr(), data);
                Ok(())
            }
        };
        done.complete(result);
    }

    fn read_block(&self, bp: &BlockPtr) -> Result<Vec<u8>, StoreError> {
        let mut disk = self.disk.lock();
        disk.check_present(bp.device)?;
        if disk.faults.reads > 0 {
            disk.faults.reads -= 1;
            return Err(StoreError::Io(format!("injected read failure at {}", bp.device)));
        }
        let addr = bp.addr();
        disk.volatile
            .get(&addr)
            .or_else(|| disk.durable.get(&addr))
            .cloned()
            .ok_or(StoreError::NotFound {
                device: addr.device.0,
                offset: addr.offset,
            })
    }

    fn flush_device_caches(&self, devices: &BTreeSet<DeviceId>) -> Result<(), StoreError> {
        let mut disk = self.disk.lock();
        disk.flush_count += 1;
        if disk.faults.flushes > 0 {
            disk.faults.flushes -= 1;
            return Err(StoreError::Io("injected cache flush failure".to_string()));
        }
        disk.write_back(Some(devices));
        Ok(())
    }

    fn device_present(&self, device: DeviceId) -> bool {
        self.disk.lock().check_present(device).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blkptr::{ByteOrder, ChainSeed};

    fn bp(addr: BlockAddr, size: u64) -> BlockPtr {
        BlockPtr {
            device: addr.device,
            offset: addr.offset,
            size,
            birth: 1,
            seed: ChainSeed::default(),
            order: ByteOrder::NATIVE,
            encrypted: false,
        }
    }

    fn write(pool: &MemoryPool, bp: &BlockPtr, byte: u8) -> Result<(), StoreError> {
        let (done, pending) = WriteCompletion::pair();
        pool.write_block_async(bp, vec![byte; bp.size as usize], done);
        pending.wait()
    }

    #[test]
    fn test_generations_advance_on_wait() {
        let pool = MemoryPool::new();
        assert_eq!(pool.current_generation(), 1);
        pool.wait_until_generation_synced(0).unwrap();
        assert_eq!(pool.last_synced_generation(), 1);
        pool.wait_until_generation_synced(3).unwrap();
        assert_eq!(pool.last_synced_generation(), 3);
        assert_eq!(pool.current_generation(), 4);
    }

    #[test]
    fn test_sync_waits_for_open_transactions() {
        let pool = Arc::new(MemoryPool::new());
        let tx = pool.begin_transaction().unwrap();
        let syncer = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.sync().unwrap())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(pool.last_synced_generation(), 0);
        pool.commit_transaction(tx);
        assert_eq!(syncer.join().unwrap(), 1);
    }

    #[test]
    fn test_unflushed_writes_lost_on_crash() {
        let pool = MemoryPool::new();
        let a = bp(pool.alloc_log_block(1, 4096, false).unwrap(), 4096);
        let b = bp(pool.alloc_log_block(1, 4096, false).unwrap(), 4096);
        write(&pool, &a, 1).unwrap();
        write(&pool, &b, 2).unwrap();
        pool.flush_device_caches(&BTreeSet::from([MAIN_DEVICE])).unwrap();
        let c = bp(pool.alloc_log_block(1, 4096, false).unwrap(), 4096);
        write(&pool, &c, 3).unwrap();

        let after = pool.crash();
        assert_eq!(after.read_block(&a).unwrap()[0], 1);
        assert_eq!(after.read_block(&b).unwrap()[0], 2);
        assert!(matches!(after.read_block(&c), Err(StoreError::NotFound { .. })));
        // Generation 1 never synced, so its allocations are gone too.
        assert!(!after.is_allocated(a.addr()));
    }

    #[test]
    fn test_freed_space_reused_only_after_sync() {
        let pool = MemoryPool::new();
        let a = bp(pool.alloc_log_block(1, 4096, false).unwrap(), 4096);
        pool.sync().unwrap();
        pool.free_block(&a, 2);
        let b = pool.alloc_log_block(2, 4096, false).unwrap();
        assert_ne!(b, a.addr());
        pool.sync().unwrap();
        let c = pool.alloc_log_block(3, 4096, false).unwrap();
        assert_eq!(c, a.addr());
    }

    #[test]
    fn test_claim_rejects_allocated_blocks() {
        let pool = MemoryPool::new();
        let a = bp(pool.alloc_log_block(1, 4096, false).unwrap(), 4096);
        assert!(matches!(
            pool.claim_block(&a, None),
            Err(StoreError::AlreadyAllocated { .. })
        ));
        let after = pool.crash();
        after.claim_block(&a, None).unwrap();
        assert!(!after.is_allocated(a.addr()));
        after.claim_block(&a, Some(1)).unwrap();
        assert!(after.is_allocated(a.addr()));
    }

    #[test]
    fn test_fast_tier_preference() {
        let pool = MemoryPool::with_log_device();
        assert_eq!(pool.alloc_log_block(1, 4096, true).unwrap().device, LOG_DEVICE);
        assert_eq!(pool.alloc_log_block(1, 4096, false).unwrap().device, MAIN_DEVICE);
        pool.set_device_present(LOG_DEVICE, false);
        assert_eq!(pool.alloc_log_block(1, 4096, true).unwrap().device, MAIN_DEVICE);
        assert!(!pool.device_present(LOG_DEVICE));
    }

    #[test]
    fn test_injected_faults() {
        let pool = MemoryPool::new();
        let a = bp(pool.alloc_log_block(1, 4096, false).unwrap(), 4096);
        pool.fail_writes(1);
        assert!(write(&pool, &a, 1).is_err());
        write(&pool, &a, 1).unwrap();

        pool.fail_flushes(1);
        assert!(pool.flush_device_caches(&BTreeSet::from([MAIN_DEVICE])).is_err());
        assert_eq!(pool.flush_count(), 1);

        pool.fail_allocs(1);
        assert!(matches!(
            pool.alloc_log_block(1, 4096, false),
            Err(StoreError::NoSpace { .. })
        ));

        pool.fail_reads(1);
        assert!(matches!(pool.read_block(&a), Err(StoreError::Io(_))));
        assert!(pool.read_block(&a).is_ok());
    }

    #[test]
    fn test_headers_persist_at_sync() {
        let pool = MemoryPool::new();
        let ds = DatasetId(4);
        pool.store_log_header(ds, b"header", 1);
        assert!(pool.load_log_header(ds).unwrap().is_empty());
        pool.sync().unwrap();
        assert_eq!(pool.load_log_header(ds).unwrap(), b"header");
        assert_eq!(pool.crash().load_log_header(ds).unwrap(), b"header");
    }

    #[test]
    fn test_shutdown_fails_waiters() {
        let pool = MemoryPool::new();
        pool.shutdown();
        assert_eq!(pool.begin_transaction(), Err(EngineError::Shutdown));
        assert_eq!(pool.wait_until_generation_synced(0), Err(EngineError::Shutdown));
    }

    #[test]
    fn test_freeze() {
        let pool = MemoryPool::new();
        assert!(!pool.is_generation_frozen(10));
        pool.freeze(5);
        assert!(!pool.is_generation_frozen(5));
        assert!(pool.is_generation_frozen(6));
    }
}
