// SPDX-License-Identifier: PMPL-1.0-or-later
//! Crash recovery tests for the intent log
//!
//! Every test runs a toy filesystem on a `MemoryPool`, commits some work,
//! simulates a crash and mounts the surviving pool again.

mod common;

use std::sync::Arc;

use common::{chain_blocks, Mounted, DATASET, ROOT};
use intent_log::memory::LOG_DEVICE;
use intent_log::{
    CheckpointEngine, ClaimMode, LogConfig, LogError, LogHeader, MemoryPool, ObjectId, RecordKind,
};
use proptest::prelude::*;

const FILE: ObjectId = ObjectId(10);
const DIR: ObjectId = ObjectId(20);

#[test]
fn test_committed_operations_survive_crash() {
    common::init_tracing();
    let (live, checkpointed) = Mounted::fresh(Arc::new(MemoryPool::new()), LogConfig::default());

    live.mkdir(ROOT, "docs", DIR);
    live.create(DIR, "notes.txt", FILE);
    live.write(FILE, 0, b"hello intent log", true);
    live.write(FILE, 6, b"INTENT", true);
    live.setattr(FILE, 0o600);
    live.create(ROOT, "scratch", ObjectId(11));
    live.remove(ROOT, "scratch");
    live.log.commit(None).unwrap();

    let (recovered, replayed) = live.crash_and_recover(checkpointed, LogConfig::default());
    assert_eq!(replayed, 7);
    assert_eq!(recovered.fs.snapshot(), live.fs.snapshot());
    assert_eq!(recovered.fs.snapshot().objects[&FILE], b"hello INTENT log".to_vec());

    // The log was destroyed after replay.
    assert_eq!(recovered.log.header(), LogHeader::default());
}

#[test]
fn test_uncommitted_operations_are_lost() {
    let (live, checkpointed) = Mounted::fresh(Arc::new(MemoryPool::new()), LogConfig::default());
    live.create(ROOT, "kept", FILE);
    live.log.commit(None).unwrap();
    let committed = live.fs.snapshot();

    live.create(ROOT, "lost", ObjectId(11));

    let (recovered, replayed) = live.crash_and_recover(checkpointed, LogConfig::default());
    assert_eq!(replayed, 1);
    assert_eq!(recovered.fs.snapshot(), committed);
}

#[test]
fn test_rename_follows_async_writes() {
    let (live, checkpointed) = Mounted::fresh(Arc::new(MemoryPool::new()), LogConfig::default());

    // Nine records first, so the writes below get sequence numbers 10..=12.
    live.create(ROOT, "draft", FILE);
    for mode in 0..8 {
        live.setattr(FILE, 0o600 + mode);
    }
    live.log.commit(None).unwrap();
    assert_eq!(live.log.committed_seq(), 9);

    live.write(FILE, 0, b"aaaa", false);
    live.write(FILE, 4, b"bbbb", false);
    live.write(FILE, 8, b"cccc", false);
    live.rename(ROOT, "draft", ROOT, "final");
    // Committing an unrelated object still carries the promoted writes.
    live.log.commit(Some(ObjectId(99))).unwrap();
    assert_eq!(live.log.committed_seq(), 13);

    let (recovered, _) = live.crash_and_recover(checkpointed, LogConfig::default());
    let applied = recovered.fs.applied.lock().clone();
    let rename_at = applied
        .iter()
        .position(|(_, kind)| *kind == RecordKind::Rename)
        .unwrap();
    assert_eq!(applied[rename_at].0, 13);
    let mut writes: Vec<u64> = applied[..rename_at]
        .iter()
        .filter(|(_, kind)| *kind == RecordKind::Write)
        .map(|(seq, _)| *seq)
        .collect();
    writes.sort_unstable();
    assert_eq!(writes, vec![10, 11, 12]);

    let image = recovered.fs.snapshot();
    assert_eq!(image.entries[&(ROOT, "final".to_string())], FILE);
    assert_eq!(image.objects[&FILE], b"aaaabbbbcccc".to_vec());
}

#[test]
fn test_async_writes_stay_queued_without_commit() {
    let (live, checkpointed) = Mounted::fresh(Arc::new(MemoryPool::new()), LogConfig::default());
    live.create(ROOT, "f", FILE);
    live.write(FILE, 0, b"late", false);
    live.log.commit(Some(ObjectId(99))).unwrap();

    let (recovered, replayed) = live.crash_and_recover(checkpointed, LogConfig::default());
    assert_eq!(replayed, 1);
    assert!(recovered.fs.snapshot().objects[&FILE].is_empty());
}

#[test]
fn test_large_writes_replayed_from_data_blocks() {
    let (live, checkpointed) = Mounted::fresh(Arc::new(MemoryPool::new()), LogConfig::default());
    live.create(ROOT, "big", FILE);
    let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    live.write(FILE, 100, &data, true);
    live.log.commit(Some(FILE)).unwrap();
    assert_eq!(live.log.stats().writes_indirect, 1);

    let (recovered, _) = live.crash_and_recover(checkpointed, LogConfig::default());
    assert_eq!(recovered.fs.snapshot(), live.fs.snapshot());
}

#[test]
fn test_replay_twice_matches_replay_once() {
    let (live, checkpointed) = Mounted::fresh(Arc::new(MemoryPool::new()), LogConfig::default());
    live.mkdir(ROOT, "d", DIR);
    live.create(DIR, "a", FILE);
    live.write(FILE, 0, b"0123456789", true);
    live.truncate(FILE, 4);
    live.write(FILE, 2, b"xyz", true);
    live.rename(DIR, "a", ROOT, "b");
    live.log.commit(None).unwrap();

    // Two copies of the same crashed pool.
    let crashed = live.pool.crash();
    let copy = crashed.crash();

    let (once, _) = Mounted::recover(Arc::new(crashed), checkpointed.clone(), LogConfig::default());
    let (twice, _) = Mounted::recover(Arc::new(copy.crash()), checkpointed, LogConfig::default());
    let image = twice.fs.snapshot();
    let (again, _) = Mounted::recover(Arc::new(copy), image, LogConfig::default());

    assert_eq!(once.fs.snapshot(), live.fs.snapshot());
    assert_eq!(again.fs.snapshot(), once.fs.snapshot());
}

#[test]
fn test_interrupted_replay_resumes_after_last_record() {
    let (live, checkpointed) = Mounted::fresh(Arc::new(MemoryPool::new()), LogConfig::default());
    live.create(ROOT, "one", ObjectId(11));
    live.create(ROOT, "two", ObjectId(12));
    live.create(ROOT, "three", ObjectId(13));
    live.create(ROOT, "four", ObjectId(14));
    live.log.commit(None).unwrap();
    let pool = Arc::new(live.pool.crash());

    let first = Mounted::open(pool.clone(), checkpointed, LogConfig::default());
    first.log.claim(ClaimMode::Normal).unwrap();
    *first.fs.fail_at.lock() = Some(3);
    assert!(matches!(
        first.log.replay(first.fs.as_ref()),
        Err(LogError::ReplayFailed { seq: 3, .. })
    ));
    pool.wait_until_generation_synced(0).unwrap();
    assert_eq!(first.log.header().replay_seq, 2);
    assert!(first.log.header().replay_needed());

    // Crash again, this time with the first two records checkpointed.
    let image = first.fs.snapshot();
    let (second, replayed) = Mounted::recover(Arc::new(pool.crash()), image, LogConfig::default());
    assert_eq!(replayed, 2);
    assert_eq!(second.fs.applied_seqs(), vec![3, 4]);
    assert_eq!(second.fs.snapshot(), live.fs.snapshot());
}

#[test]
fn test_replay_skips_writes_to_removed_objects() {
    let (live, _) = Mounted::fresh(Arc::new(MemoryPool::new()), LogConfig::default());
    live.create(ROOT, "gone", FILE);
    live.log.commit(None).unwrap();
    // The create reached the main store; only the write and the remove
    // are left for replay.
    live.pool.wait_until_generation_synced(0).unwrap();
    let checkpointed = live.fs.snapshot();
    live.write(FILE, 0, b"data", true);
    live.log.commit(Some(FILE)).unwrap();
    live.remove(ROOT, "gone");
    live.log.commit(None).unwrap();

    // A later checkpoint already removed the file.
    let mut removed = checkpointed.clone();
    removed.entries.remove(&(ROOT, "gone".to_string()));
    removed.objects.remove(&FILE);
    removed.modes.remove(&FILE);

    let (recovered, replayed) = live.crash_and_recover(removed, LogConfig::default());
    assert_eq!(replayed, 1);
    assert_eq!(recovered.log.stats().replay_skipped, 1);
    assert!(!recovered.fs.snapshot().objects.contains_key(&FILE));
}

#[test]
fn test_replay_disabled_drops_log() {
    let (live, checkpointed) = Mounted::fresh(Arc::new(MemoryPool::new()), LogConfig::default());
    live.create(ROOT, "f", FILE);
    live.log.commit(None).unwrap();

    let config = LogConfig {
        replay_disabled: true,
        ..LogConfig::default()
    };
    let (recovered, replayed) = live.crash_and_recover(checkpointed.clone(), config);
    assert_eq!(replayed, 0);
    assert_eq!(recovered.fs.snapshot(), checkpointed);
    assert_eq!(recovered.log.header(), LogHeader::default());
}

#[test]
fn test_missing_log_device_without_records() {
    let pool = Arc::new(MemoryPool::with_log_device());
    let (live, checkpointed) = Mounted::fresh(pool, LogConfig::default());
    live.log.close().unwrap();
    let head = LogHeader::decode(&live.pool.persisted_header(DATASET))
        .unwrap()
        .log
        .unwrap();
    assert_eq!(head.device, LOG_DEVICE);

    let crashed = Arc::new(live.pool.crash());
    crashed.set_device_present(LOG_DEVICE, false);
    let (recovered, replayed) = Mounted::recover(crashed, checkpointed, LogConfig::default());
    assert_eq!(replayed, 0);
    assert!(recovered.log.header().log.is_none());

    // New commits start a fresh chain on the remaining device.
    recovered.create(ROOT, "after", FILE);
    recovered.log.commit(None).unwrap();
    recovered.create(ROOT, "later", ObjectId(11));
    recovered.log.commit(None).unwrap();
    assert!(recovered.log.header().log.is_some());
}

#[test]
fn test_check_reports_unreadable_claimed_block() {
    let (live, checkpointed) = Mounted::fresh(Arc::new(MemoryPool::new()), LogConfig::default());
    live.create(ROOT, "a", FILE);
    live.log.commit(None).unwrap();
    live.create(ROOT, "b", ObjectId(11));
    live.log.commit(None).unwrap();

    let pool = Arc::new(live.pool.crash());
    let mounted = Mounted::open(pool.clone(), checkpointed, LogConfig::default());
    mounted.log.claim(ClaimMode::Normal).unwrap();
    let (blocks, _) = chain_blocks(&pool, &mounted.log.header());
    assert_eq!(blocks.len(), 2);

    pool.corrupt_block(blocks[1].0.addr());
    assert!(matches!(
        mounted.log.check_log_chain(),
        Err(LogError::CorruptChain { .. })
    ));
}

// ---------------------------------------------------------------------------
// Chain prefix property
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Corrupting block `n` of a crashed chain leaves exactly the records
    /// of blocks before it for replay, and nothing errors.
    #[test]
    fn test_replay_stops_at_first_bad_block(
        batches in prop::collection::vec(1usize..4, 1..6),
        pick in any::<prop::sample::Index>(),
    ) {
        let (live, checkpointed) = Mounted::fresh(Arc::new(MemoryPool::new()), LogConfig::default());
        let mut next_object = 100;
        for size in &batches {
            for _ in 0..*size {
                live.create(ROOT, &format!("f{next_object}"), ObjectId(next_object));
                next_object += 1;
            }
            live.log.commit(None).unwrap();
        }

        let pool = Arc::new(live.pool.crash());
        let (blocks, _) = chain_blocks(&pool, &LogHeader::decode(&pool.persisted_header(DATASET)).unwrap());
        prop_assert_eq!(blocks.len(), batches.len());
        let bad = pick.index(blocks.len());
        let survivors: u64 = blocks[..bad].iter().map(|(_, records)| records.len() as u64).sum();
        pool.corrupt_block(blocks[bad].0.addr());

        let (recovered, replayed) = Mounted::recover(pool, checkpointed, LogConfig::default());
        prop_assert_eq!(replayed, survivors);
        prop_assert_eq!(recovered.fs.applied_seqs(), (1..=survivors).collect::<Vec<_>>());
        if survivors > 0 {
            prop_assert_eq!(recovered.log.header(), LogHeader::default());
        }
    }
}
