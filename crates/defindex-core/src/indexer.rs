//! Indexer configuration and controller state types.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name for this indexer.
    pub id: String,
    /// Chain to index (e.g. `"ethereum"`).
    pub chain: String,
    /// First block to index.
    pub from_block: u64,
    /// Optional end block (for bounded backfill). `None` = run forever.
    pub to_block: Option<u64>,
    /// Number of blocks to wait before considering a block confirmed.
    /// Typical values: 12 (Ethereum PoS), 64 (Ethereum safe), 1 (fast chains).
    pub confirmation_depth: u64,
    /// How many blocks make up one decoded batch.
    pub batch_size: u64,
    /// Largest block range sent to the log source in one request.
    pub max_log_range: u64,
    /// Block polling interval while following the tip (milliseconds).
    pub poll_interval_ms: u64,
    /// Depth of the decoded-batch channel between decoders and aggregator.
    pub channel_capacity: usize,
    /// Take a state snapshot every N blocks.
    pub snapshot_interval: u64,
    /// Keep at most this many snapshots (oldest pruned first).
    pub snapshot_retention: usize,
    /// Number of recent block headers kept for reorg detection.
    pub tracker_window: usize,
    /// Event ids are remembered for this many blocks for duplicate detection.
    pub dedup_horizon_blocks: u64,
    /// Retry attempts for a failed log-source call (not counting the first).
    pub retry_max_attempts: u32,
    /// Initial backoff between log-source retries (milliseconds).
    pub retry_initial_backoff_ms: u64,
    /// Cap on the backoff between log-source retries (milliseconds).
    pub retry_max_backoff_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            chain: "ethereum".into(),
            from_block: 0,
            to_block: None,
            confirmation_depth: 12,
            batch_size: 100,
            max_log_range: 1000,
            poll_interval_ms: 2000,
            channel_capacity: 4,
            snapshot_interval: 100,
            snapshot_retention: 48,
            tracker_window: 128,
            dedup_horizon_blocks: 256,
            retry_max_attempts: 5,
            retry_initial_backoff_ms: 200,
            retry_max_backoff_ms: 10_000,
        }
    }
}

impl IndexerConfig {
    /// Reject settings the index loop cannot run with.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.batch_size == 0 {
            return Err(IndexerError::Config("batch_size must be > 0".into()));
        }
        if self.max_log_range == 0 {
            return Err(IndexerError::Config("max_log_range must be > 0".into()));
        }
        if self.channel_capacity == 0 {
            return Err(IndexerError::Config("channel_capacity must be > 0".into()));
        }
        if self.snapshot_interval == 0 {
            return Err(IndexerError::Config("snapshot_interval must be > 0".into()));
        }
        if self.tracker_window < 2 {
            return Err(IndexerError::Config("tracker_window must be >= 2".into()));
        }
        if let Some(to) = self.to_block {
            if to < self.from_block {
                return Err(IndexerError::Config(format!(
                    "to_block {to} is below from_block {}",
                    self.from_block
                )));
            }
        }
        Ok(())
    }
}

/// Runtime state of the reorg/replay controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Applying new confirmed blocks as they appear.
    Following,
    /// A hash mismatch was seen; in-flight work is being cancelled.
    ReorgDetected,
    /// Restoring aggregate state from the nearest snapshot below the fork.
    Rewinding,
    /// Re-fetching and re-applying blocks from the fork height to the tip.
    Replaying,
    /// Terminated (bounded run finished or shutdown requested).
    Stopped,
    /// Encountered an unrecoverable error.
    Error,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Following => write!(f, "following"),
            Self::ReorgDetected => write!(f, "reorg-detected"),
            Self::Rewinding => write!(f, "rewinding"),
            Self::Replaying => write!(f, "replaying"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}
