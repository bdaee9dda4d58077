//! In-process [`LogSource`] backed by a block map.
//!
//! Used for chain fixtures, tests and `defindex replay`. The chain can be
//! reorganized from any height while an indexer is reading from it.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use defindex_core::error::IndexerError;
use defindex_core::types::{BlockSummary, EventFilter};

use crate::fetcher::{LogSource, RawLog};

const BLOCK_TIME_SECS: i64 = 12;
const DEFAULT_BASE_FEE: u64 = 10_000_000_000;

// ─── Fixture format ───────────────────────────────────────────────────────────

/// A JSON chain fixture: an ordered list of blocks with their logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainFixture {
    pub blocks: Vec<FixtureBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureBlock {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
    #[serde(default)]
    pub tx_count: u32,
    #[serde(default)]
    pub base_fee_per_gas: Option<u64>,
    #[serde(default)]
    pub logs: Vec<FixtureLog>,
}

/// A log inside a fixture block; position fields come from the block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub transaction_hash: String,
    pub log_index: u32,
}

impl FixtureBlock {
    fn summary(&self) -> BlockSummary {
        BlockSummary {
            number: self.number,
            hash: self.hash.to_ascii_lowercase(),
            parent_hash: self.parent_hash.to_ascii_lowercase(),
            timestamp: self.timestamp,
            tx_count: self.tx_count,
            base_fee_per_gas: self.base_fee_per_gas,
        }
    }
}

// ─── MemoryChain ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Chain {
    blocks: BTreeMap<u64, BlockSummary>,
    logs: BTreeMap<u64, Vec<RawLog>>,
    fail_next: u32,
    log_requests: u64,
}

impl Chain {
    fn take_failure(&mut self) -> Result<(), IndexerError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(IndexerError::SourceUnavailable("injected failure".into()));
        }
        Ok(())
    }

    fn insert_log(&mut self, number: u64, mut log: RawLog) -> Result<(), IndexerError> {
        let block = self
            .blocks
            .get(&number)
            .ok_or_else(|| IndexerError::Other(format!("no block {number} in chain")))?;
        log.block_number = format!("0x{number:x}");
        log.block_hash = block.hash.clone();
        log.address = log.address.to_ascii_lowercase();
        self.logs.entry(number).or_default().push(log);
        Ok(())
    }
}

/// An in-memory EVM chain.
#[derive(Default)]
pub struct MemoryChain {
    chain: Mutex<Chain>,
}

/// Deterministic block hash for generated chains; `fork` distinguishes
/// competing blocks at the same height.
pub fn synthetic_hash(number: u64, fork: u32) -> String {
    format!("0x{number:056x}{fork:08x}")
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` generated blocks starting at `start`, 12 s apart.
    pub fn linear(start: u64, count: u64, start_timestamp: i64) -> Self {
        let chain = Self::new();
        chain.extend(start, count, start_timestamp, 0);
        chain
    }

    pub fn from_fixture(fixture: &ChainFixture) -> Result<Self, IndexerError> {
        let chain = Self::new();
        for block in &fixture.blocks {
            chain.push_block(block.summary());
            for log in &block.logs {
                chain.add_log(block.number, fixture_log(log))?;
            }
        }
        Ok(chain)
    }

    pub fn from_json(json: &str) -> Result<Self, IndexerError> {
        let fixture: ChainFixture = serde_json::from_str(json)
            .map_err(|e| IndexerError::Other(format!("invalid chain fixture: {e}")))?;
        Self::from_fixture(&fixture)
    }

    fn inner(&self) -> MutexGuard<'_, Chain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a block header.
    pub fn push_block(&self, block: BlockSummary) {
        let mut chain = self.inner();
        chain.logs.remove(&block.number);
        chain.blocks.insert(block.number, block);
    }

    /// Append `count` generated blocks starting at `start`, chained onto the
    /// block at `start - 1` when present.
    pub fn extend(&self, start: u64, count: u64, start_timestamp: i64, fork: u32) {
        let mut chain = self.inner();
        let mut parent = start
            .checked_sub(1)
            .and_then(|p| chain.blocks.get(&p))
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| synthetic_hash(start.saturating_sub(1), fork));
        for i in 0..count {
            let number = start + i;
            let hash = synthetic_hash(number, fork);
            chain.logs.remove(&number);
            chain.blocks.insert(
                number,
                BlockSummary {
                    number,
                    hash: hash.clone(),
                    parent_hash: parent,
                    timestamp: start_timestamp + i as i64 * BLOCK_TIME_SECS,
                    tx_count: 1,
                    base_fee_per_gas: Some(DEFAULT_BASE_FEE),
                },
            );
            parent = hash;
        }
    }

    /// Attach a log to block `number`; its position fields are overwritten.
    pub fn add_log(&self, number: u64, log: RawLog) -> Result<(), IndexerError> {
        self.inner().insert_log(number, log)
    }

    /// Replace every block at or above `height` with `count` new blocks on
    /// fork `fork`. Logs on the dropped blocks are discarded.
    pub fn reorg_from(&self, height: u64, count: u64, fork: u32) {
        let start_timestamp = {
            let mut chain = self.inner();
            let ts = chain
                .blocks
                .get(&height)
                .map(|b| b.timestamp)
                .or_else(|| {
                    height
                        .checked_sub(1)
                        .and_then(|p| chain.blocks.get(&p))
                        .map(|b| b.timestamp + BLOCK_TIME_SECS)
                })
                .unwrap_or_default();
            let _dropped = chain.blocks.split_off(&height);
            let _ = chain.logs.split_off(&height);
            ts
        };
        tracing::debug!(height, count, fork, "Reorganized memory chain");
        self.extend(height, count, start_timestamp, fork);
    }

    /// Replace blocks at and above the first fixture block with the fixture.
    pub fn reorg_with(&self, fixture: &ChainFixture) -> Result<(), IndexerError> {
        if let Some(first) = fixture.blocks.first() {
            let mut chain = self.inner();
            let _ = chain.blocks.split_off(&first.number);
            let _ = chain.logs.split_off(&first.number);
        }
        for block in &fixture.blocks {
            self.push_block(block.summary());
            for log in &block.logs {
                self.add_log(block.number, fixture_log(log))?;
            }
        }
        Ok(())
    }

    /// The next `n` calls fail with `SourceUnavailable`.
    pub fn fail_next(&self, n: u32) {
        self.inner().fail_next = n;
    }

    /// Number of `fetch_logs` calls served so far.
    pub fn log_requests(&self) -> u64 {
        self.inner().log_requests
    }

    pub fn head(&self) -> Option<BlockSummary> {
        self.inner().blocks.values().next_back().cloned()
    }

    pub fn block_at(&self, number: u64) -> Option<BlockSummary> {
        self.inner().blocks.get(&number).cloned()
    }
}

fn fixture_log(log: &FixtureLog) -> RawLog {
    RawLog {
        address: log.address.clone(),
        topics: log.topics.iter().map(|t| t.to_ascii_lowercase()).collect(),
        data: log.data.clone(),
        block_number: String::new(),
        block_hash: String::new(),
        block_timestamp: None,
        tx_hash: log.transaction_hash.to_ascii_lowercase(),
        log_index: format!("0x{:x}", log.log_index),
        removed: None,
    }
}

#[async_trait]
impl LogSource for MemoryChain {
    async fn head_block_number(&self) -> Result<u64, IndexerError> {
        let mut chain = self.inner();
        chain.take_failure()?;
        chain
            .blocks
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| IndexerError::Other("memory chain is empty".into()))
    }

    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
        let mut chain = self.inner();
        chain.take_failure()?;
        Ok(chain.blocks.get(&number).cloned())
    }

    async fn fetch_logs(
        &self,
        filter: &EventFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError> {
        let mut chain = self.inner();
        chain.take_failure()?;
        chain.log_requests += 1;
        if from > to {
            return Ok(vec![]);
        }
        Ok(chain
            .logs
            .range(from..=to)
            .flat_map(|(_, logs)| logs.iter())
            .filter(|l| filter.matches_address(&l.address))
            .filter(|l| {
                l.topics
                    .first()
                    .map_or(filter.topic0_values.is_empty(), |t| filter.matches_topic0(t))
            })
            .cloned()
            .collect())
    }
}
