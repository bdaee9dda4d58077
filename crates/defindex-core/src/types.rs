//! Shared types for the indexing pipeline.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::IndexerError;

// ─── BlockSummary ─────────────────────────────────────────────────────────────

/// A minimal summary of a block: enough to track progress, detect reorgs,
/// and feed the gas tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
    /// Number of transactions in the block.
    pub tx_count: u32,
    /// EIP-1559 base fee in wei, when the chain reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<u64>,
}

impl BlockSummary {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockSummary) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── EventFilter ─────────────────────────────────────────────────────────────

/// Filter for which logs a protocol decoder wants to see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Only index logs from these contract addresses (empty = all addresses).
    pub addresses: Vec<String>,
    /// Only index logs with this topic[0] value (empty = all events).
    pub topic0_values: Vec<String>,
}

impl EventFilter {
    /// Create a filter for a single contract address.
    pub fn address(addr: impl Into<String>) -> Self {
        Self {
            addresses: vec![addr.into()],
            ..Default::default()
        }
    }

    /// Add another contract address.
    pub fn with_address(mut self, addr: impl Into<String>) -> Self {
        self.addresses.push(addr.into());
        self
    }

    /// Add a topic0 filter (event signature hash).
    pub fn topic0(mut self, topic: impl Into<String>) -> Self {
        self.topic0_values.push(topic.into());
        self
    }

    /// Returns `true` if `address` matches this filter.
    pub fn matches_address(&self, address: &str) -> bool {
        self.addresses.is_empty()
            || self.addresses.iter().any(|a| a.eq_ignore_ascii_case(address))
    }

    /// Returns `true` if `topic0` matches this filter.
    pub fn matches_topic0(&self, topic0: &str) -> bool {
        self.topic0_values.is_empty()
            || self.topic0_values.iter().any(|t| t.eq_ignore_ascii_case(topic0))
    }
}

// ─── ProtocolId ───────────────────────────────────────────────────────────────

/// The DeFi protocols tracked by the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolId {
    /// Concentrated-liquidity DEX pool manager.
    Dex,
    /// Lending market.
    Lending,
    /// Liquid-staking contract.
    Staking,
    /// Stableswap AMM pools.
    Stableswap,
    /// CDP / vault system.
    Cdp,
}

impl ProtocolId {
    pub const ALL: [ProtocolId; 5] = [
        ProtocolId::Dex,
        ProtocolId::Lending,
        ProtocolId::Staking,
        ProtocolId::Stableswap,
        ProtocolId::Cdp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dex => "dex",
            Self::Lending => "lending",
            Self::Staking => "staking",
            Self::Stableswap => "stableswap",
            Self::Cdp => "cdp",
        }
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolId {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| IndexerError::Config(format!("unknown protocol '{s}'")))
    }
}

// ─── Event identity & ordering ───────────────────────────────────────────────

/// Unique identity of a domain event: the log that produced it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub tx_hash: String,
    pub log_index: u32,
}

impl EventId {
    pub fn new(tx_hash: impl Into<String>, log_index: u32) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            log_index,
        }
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

/// Global chain order of an event: `(block_number, log_index)`.
///
/// Log indices are block-scoped, so this is a total order over all logs of
/// a canonical chain regardless of which contract emitted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventPosition {
    pub block_number: u64,
    pub log_index: u32,
}

impl EventPosition {
    pub fn new(block_number: u64, log_index: u32) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
