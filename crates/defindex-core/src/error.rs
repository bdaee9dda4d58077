//! Error types for the defindex pipeline.

use thiserror::Error;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Log source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Requested block {requested} is beyond the chain tip {head}")]
    ChainTip { requested: u64, head: u64 },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Reorg detected at block {block_number}: expected hash {expected}, got {actual}")]
    ReorgDetected {
        block_number: u64,
        expected: String,
        actual: String,
    },

    #[error("Event {tx_hash}:{log_index} was already applied")]
    AggregationConflict { tx_hash: String, log_index: u32 },

    #[error("Event at {block_number}:{log_index} arrived after position {last_block}:{last_log_index}")]
    OutOfOrder {
        block_number: u64,
        log_index: u32,
        last_block: u64,
        last_log_index: u32,
    },

    #[error("Snapshot write failed at block {block_number}: {reason}")]
    SnapshotWrite { block_number: u64, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error is a reorg (recoverable).
    pub fn is_reorg(&self) -> bool {
        matches!(self, Self::ReorgDetected { .. })
    }

    /// Returns `true` for errors worth retrying against the log source.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_))
    }

    /// Returns `true` if applying the event was rejected without touching state.
    pub fn is_rejected_event(&self) -> bool {
        matches!(self, Self::AggregationConflict { .. } | Self::OutOfOrder { .. })
    }
}

/// Errors raised while turning a raw log into a domain event.
///
/// Always scoped to a single log: the decode stage records a warning and
/// moves on to the next log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Malformed log: {reason}")]
    MalformedLog { reason: String },

    #[error("Missing topic {index}")]
    MissingTopic { index: usize },

    #[error("Unknown token {address}")]
    UnknownToken { address: String },

    #[error("Unknown pool {id}")]
    UnknownPool { id: String },

    #[error("Amount in field '{field}' does not fit a decimal")]
    AmountOverflow { field: String },
}

/// Errors raised while folding one event into one protocol's stats row.
///
/// These never escape the aggregation engine: the affected protocol is
/// marked stale and the batch continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    #[error("No USD price for token {token}")]
    MissingPrice { token: String },

    #[error("Arithmetic overflow in {field}")]
    Overflow { field: String },
}
