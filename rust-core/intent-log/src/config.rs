// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Configuration
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-dataset tunables for the intent log. The configuration is plain data
// (serde) so the embedding engine can keep it alongside its own dataset
// properties and load it from JSON.

use serde::{Deserialize, Serialize};

use crate::error::{LogError, LogResult};

/// Block-size buckets used when sizing the next log block. The first three
/// are chosen so that 1, 2 and 3 typical 4 KiB writes plus their records
/// fill a block; the last is the largest log block.
pub const DEFAULT_BLOCK_BUCKETS: [u64; 5] = [4096, 8192 + 4096, 32768 + 4096, 131072 + 4096, u64::MAX];

/// Smallest block allocated for a fresh chain.
pub const DEFAULT_MIN_BLOCK_SIZE: u64 = 4096;

/// Largest log block.
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 128 * 1024;

/// Above this much queued synchronous data the writer stops preferring the
/// fast log tier.
pub const DEFAULT_SLOG_LIMIT: u64 = 1024 * 1024;

/// Default size of the replay write pool.
pub const DEFAULT_REPLAY_THREADS: usize = 8;

// ---------------------------------------------------------------------------
// Property enums
// ---------------------------------------------------------------------------

/// How commit requests are honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Synchronous operations commit the log before returning.
    #[default]
    Standard,
    /// Every assigned itx is treated as synchronous.
    Always,
    /// Commits are no-ops; durability waits for the next checkpoint.
    Disabled,
}

/// Where log blocks should preferably be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBias {
    /// Prefer the fast log tier while the queued data is small.
    #[default]
    Latency,
    /// Always allocate from the main pool.
    Throughput,
}

/// How [`crate::log::IntentLog::claim`] treats an existing chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimMode {
    /// Claim the chain's blocks so they survive until replay.
    #[default]
    Normal,
    /// Throw the chain away (the administrator cleared the log).
    Discard,
}

// ---------------------------------------------------------------------------
// LogConfig
// ---------------------------------------------------------------------------

/// Configuration for one intent log instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Commit behaviour.
    pub sync: SyncMode,

    /// Allocation bias for log blocks.
    pub logbias: LogBias,

    /// Ascending block-size buckets; the last entry should be `u64::MAX`.
    pub block_buckets: Vec<u64>,

    /// Size of the first block of a new chain.
    pub min_block_size: u64,

    /// Largest block the writer will allocate.
    pub max_block_size: u64,

    /// Queued-bytes threshold for preferring the fast tier.
    pub slog_limit: u64,

    /// Number of workers used to replay write records.
    pub replay_threads: usize,

    /// Flush device write caches after each batch.
    pub cache_flush: bool,

    /// Skip replay entirely (debugging aid; the log is destroyed instead).
    pub replay_disabled: bool,

    /// Treat a missing log device as an empty log when nothing needs replay.
    pub tolerate_missing_log_device: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            sync: SyncMode::Standard,
            logbias: LogBias::Latency,
            block_buckets: DEFAULT_BLOCK_BUCKETS.to_vec(),
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            slog_limit: DEFAULT_SLOG_LIMIT,
            replay_threads: DEFAULT_REPLAY_THREADS,
            cache_flush: true,
            replay_disabled: false,
            tolerate_missing_log_device: true,
        }
    }
}

impl LogConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults,
    /// and validate it.
    pub fn from_json(json: &str) -> LogResult<Self> {
        let config: LogConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to pretty JSON.
    pub fn to_json(&self) -> LogResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Largest write whose data is copied into a log block. Bigger writes
    /// are logged by reference to their own data block.
    pub fn max_copied_data(&self) -> u64 {
        let capacity = crate::chain::block_capacity(self.max_block_size);
        capacity.saturating_sub(crate::record::WRITE_FIXED_LEN) as u64
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> LogResult<()> {
        let min_useful = (crate::chain::CHAIN_LINK_SIZE + crate::record::MAX_FIXED_RECORD_LEN) as u64;
        if self.min_block_size < min_useful {
            return Err(LogError::InvalidConfig(format!(
                "min_block_size {} is below {min_useful}",
                self.min_block_size
            )));
        }
        if self.max_block_size < self.min_block_size {
            return Err(LogError::InvalidConfig(format!(
                "max_block_size {} is below min_block_size {}",
                self.max_block_size, self.min_block_size
            )));
        }
        if self.max_block_size % 512 != 0 || self.min_block_size % 512 != 0 {
            return Err(LogError::InvalidConfig(
                "block sizes must be multiples of 512".to_string(),
            ));
        }
        if self.block_buckets.is_empty() {
            return Err(LogError::InvalidConfig("block_buckets is empty".to_string()));
        }
        if self.block_buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(LogError::InvalidConfig(
                "block_buckets must be strictly ascending".to_string(),
            ));
        }
        if self.replay_threads == 0 {
            return Err(LogError::InvalidConfig("replay_threads must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Returns `true` if log blocks should prefer the fast tier for a commit
    /// carrying `queued` bytes.
    pub fn prefer_fast_tier(&self, queued: u64) -> bool {
        self.logbias == LogBias::Latency && queued < self.slog_limit
    }
}
