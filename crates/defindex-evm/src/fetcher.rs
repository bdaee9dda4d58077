//! EVM log source adapter.
//!
//! [`LogSource`] is the raw `eth_getLogs` / `eth_getBlockByNumber` surface.
//! [`LogFetcher`] wraps a source with range splitting, retries and log
//! normalization so that fetching the same range twice always yields the
//! same sequence of logs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use defindex_core::error::{DecodeError, IndexerError};
use defindex_core::types::{BlockSummary, EventFilter, EventPosition};

use crate::retry::RetryPolicy;

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    /// Not part of every node's response; filled from the block header
    /// before decoding when missing.
    #[serde(rename = "blockTimestamp", default, skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<String>,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Result<u64, DecodeError> {
        parse_hex_u64(&self.block_number).ok_or_else(|| DecodeError::MalformedLog {
            reason: format!("bad blockNumber '{}'", self.block_number),
        })
    }

    pub fn log_index_u32(&self) -> Result<u32, DecodeError> {
        parse_hex_u64(&self.log_index)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| DecodeError::MalformedLog {
                reason: format!("bad logIndex '{}'", self.log_index),
            })
    }

    pub fn timestamp(&self) -> Result<i64, DecodeError> {
        self.block_timestamp
            .as_deref()
            .and_then(parse_hex_u64)
            .and_then(|t| i64::try_from(t).ok())
            .ok_or_else(|| DecodeError::MalformedLog {
                reason: "missing blockTimestamp".into(),
            })
    }

    /// Chain position, if both position fields parse.
    pub fn position(&self) -> Option<EventPosition> {
        Some(EventPosition::new(
            self.block_number_u64().ok()?,
            self.log_index_u32().ok()?,
        ))
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    fn identity(&self) -> (String, String) {
        (self.tx_hash.to_ascii_lowercase(), self.log_index.to_ascii_lowercase())
    }
}

// ─── LogSource ────────────────────────────────────────────────────────────────

/// Raw access to an EVM chain.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn head_block_number(&self) -> Result<u64, IndexerError>;

    /// Header of block `number`, `None` if the source does not have it.
    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError>;

    /// All logs in `[from, to]` matching `filter`. No ordering guarantee.
    async fn fetch_logs(
        &self,
        filter: &EventFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError>;
}

// ─── LogFetcher ───────────────────────────────────────────────────────────────

/// Range-splitting, retrying wrapper around a [`LogSource`].
#[derive(Clone)]
pub struct LogFetcher {
    source: Arc<dyn LogSource>,
    max_range: u64,
    retry: RetryPolicy,
}

impl LogFetcher {
    pub fn new(source: Arc<dyn LogSource>, max_range: u64, retry: RetryPolicy) -> Self {
        Self {
            source,
            max_range: max_range.max(1),
            retry,
        }
    }

    pub fn source(&self) -> &Arc<dyn LogSource> {
        &self.source
    }

    pub async fn head_block_number(&self) -> Result<u64, IndexerError> {
        let source = &self.source;
        self.retry
            .run("head_block_number", || source.head_block_number())
            .await
    }

    pub async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
        let source = &self.source;
        self.retry.run("block", || source.block(number)).await
    }

    /// Fetch all logs in `[from, to]` matching `filter`.
    ///
    /// Ranges wider than `max_range` blocks are split. Removed logs are
    /// dropped; the result is sorted by `(block, logIndex)` and contains
    /// each `(txHash, logIndex)` once.
    pub async fn fetch_logs(
        &self,
        filter: &EventFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError> {
        if to < from {
            return Ok(vec![]);
        }
        let head = self.head_block_number().await?;
        if to > head {
            return Err(IndexerError::ChainTip { requested: to, head });
        }

        let mut logs = Vec::new();
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(self.max_range - 1).min(to);
            let source = &self.source;
            let chunk = self
                .retry
                .run("fetch_logs", || source.fetch_logs(filter, start, end))
                .await?;
            tracing::debug!(from = start, to = end, logs = chunk.len(), "Fetched log chunk");
            logs.extend(chunk);
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        Ok(normalize(logs))
    }
}

/// Drop removed logs, sort by chain position and collapse duplicates.
pub fn normalize(mut logs: Vec<RawLog>) -> Vec<RawLog> {
    logs.retain(|l| !l.is_removed());
    logs.sort_by(|a, b| {
        a.position()
            .cmp(&b.position())
            .then_with(|| a.identity().cmp(&b.identity()))
    });
    logs.dedup_by(|a, b| a.identity() == b.identity());
    logs
}

/// Parse a hex-encoded string (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Convert an `eth_getBlockByNumber` JSON response to a [`BlockSummary`].
pub fn block_from_json(v: &Value) -> Option<BlockSummary> {
    Some(BlockSummary {
        number: parse_hex_u64(v["number"].as_str()?)?,
        hash: v["hash"].as_str()?.to_ascii_lowercase(),
        parent_hash: v["parentHash"].as_str()?.to_ascii_lowercase(),
        timestamp: i64::try_from(parse_hex_u64(v["timestamp"].as_str()?)?).ok()?,
        tx_count: v["transactions"]
            .as_array()
            .map(|a| a.len() as u32)
            .unwrap_or(0),
        base_fee_per_gas: v["baseFeePerGas"].as_str().and_then(parse_hex_u64),
    })
}
