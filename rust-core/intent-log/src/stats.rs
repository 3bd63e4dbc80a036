// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Intent Log - Statistics
//
// Counters collected by an `IntentLog`. All counters are monotonically
// increasing for the lifetime of the log handle; `IntentLog::stats` returns
// a snapshot.

use serde::Serialize;

use crate::itx::WriteState;

/// Accumulated statistics for one intent log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    /// Calls to `commit`.
    pub commit_requests: u64,
    /// Commit batches actually written by a writer.
    pub commit_batches: u64,
    /// Commits that fell back to waiting for a full checkpoint.
    pub fallback_syncs: u64,
    /// Records copied into log blocks.
    pub records_committed: u64,
    /// Write records whose data was already inline.
    pub writes_copied: u64,
    /// Write records whose data was fetched into the log block.
    pub writes_need_copy: u64,
    /// Write records whose data went to its own block.
    pub writes_indirect: u64,
    /// Bytes of write data placed in log blocks or data blocks.
    pub write_bytes: u64,
    /// Itxs skipped because their generation had already synced.
    pub itxs_already_synced: u64,
    /// Itxs dropped because their data vanished or was already durable.
    pub itxs_dropped: u64,
    /// Log blocks written.
    pub blocks_written: u64,
    /// Bytes of log blocks written (full block size).
    pub block_bytes_written: u64,
    /// Bytes of records inside written log blocks.
    pub block_bytes_used: u64,
    /// Log blocks whose allocation asked for the fast tier.
    pub fast_tier_blocks: u64,
    /// Log block writes that failed.
    pub write_errors: u64,
    /// Device cache flushes that failed.
    pub flush_errors: u64,
    /// Records replayed.
    pub records_replayed: u64,
    /// Out-of-order records skipped during replay because their object is gone.
    pub replay_skipped: u64,
    /// Log blocks visited during replay.
    pub replay_blocks: u64,
}

impl LogStats {
    /// Count one committed write record by how its data was handled.
    pub(crate) fn count_write(&mut self, state: WriteState, bytes: u64) {
        match state {
            WriteState::Copied => self.writes_copied += 1,
            WriteState::NeedCopy => self.writes_need_copy += 1,
            WriteState::Indirect => self.writes_indirect += 1,
        }
        self.write_bytes += bytes;
    }

    /// Fraction of written log block bytes occupied by records.
    pub fn block_utilization(&self) -> f64 {
        if self.block_bytes_written == 0 {
            return 0.0;
        }
        self.block_bytes_used as f64 / self.block_bytes_written as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_write_by_state() {
        let mut stats = LogStats::default();
        stats.count_write(WriteState::Copied, 10);
        stats.count_write(WriteState::Indirect, 4096);
        stats.count_write(WriteState::Indirect, 4096);
        assert_eq!(stats.writes_copied, 1);
        assert_eq!(stats.writes_need_copy, 0);
        assert_eq!(stats.writes_indirect, 2);
        assert_eq!(stats.write_bytes, 8202);
    }

    #[test]
    fn test_utilization() {
        let mut stats = LogStats::default();
        assert_eq!(stats.block_utilization(), 0.0);
        stats.block_bytes_written = 4096;
        stats.block_bytes_used = 1024;
        assert!((stats.block_utilization() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_serializes_to_json() {
        let stats = LogStats {
            commit_requests: 3,
            ..LogStats::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"commit_requests\":3"));
    }
}
