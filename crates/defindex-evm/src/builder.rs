//! Fluent builder API for assembling an index loop.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use defindex_evm::{IndexerBuilder, MemoryChain, ProtocolsConfig};
//!
//! # async fn run() -> Result<(), defindex_core::IndexerError> {
//! let mut indexer = IndexerBuilder::new()
//!     .chain("ethereum")
//!     .from_block(19_000_000)
//!     .confirmation_depth(12)
//!     .batch_size(500)
//!     .source(Arc::new(MemoryChain::new()))
//!     .protocols(ProtocolsConfig::default())
//!     .build()?;
//! indexer.catch_up().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use defindex_core::aggregator::AggregationEngine;
use defindex_core::config::AggregatorConfig;
use defindex_core::error::IndexerError;
use defindex_core::indexer::IndexerConfig;
use defindex_core::price::{PriceOracle, StaticPriceOracle};
use defindex_core::query::ViewHandle;
use defindex_core::store::IndexStore;
use defindex_storage::InMemoryStorage;

use crate::decoder::{DecoderSet, ProtocolsConfig};
use crate::fetcher::{LogFetcher, LogSource};
use crate::index_loop::IndexLoop;
use crate::pipeline::DecodePipeline;
use crate::retry::RetryPolicy;

/// Fluent builder for [`IndexerConfig`] and [`IndexLoop`].
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
    aggregator: AggregatorConfig,
    protocols: ProtocolsConfig,
    source: Option<Arc<dyn LogSource>>,
    store: Option<Arc<dyn IndexStore>>,
    oracle: Option<Arc<dyn PriceOracle>>,
    view: Option<ViewHandle>,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a complete indexer configuration.
    pub fn config(mut self, config: IndexerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the indexer ID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the chain to index.
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Set the start block.
    pub fn from_block(mut self, block: u64) -> Self {
        self.config.from_block = block;
        self
    }

    /// Set the end block (for bounded runs).
    pub fn to_block(mut self, block: u64) -> Self {
        self.config.to_block = Some(block);
        self
    }

    /// Set confirmation depth (blocks behind head before processing).
    pub fn confirmation_depth(mut self, depth: u64) -> Self {
        self.config.confirmation_depth = depth;
        self
    }

    /// Set the number of blocks per decoded batch.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the widest block range per `eth_getLogs` request.
    pub fn max_log_range(mut self, blocks: u64) -> Self {
        self.config.max_log_range = blocks;
        self
    }

    /// Snapshot every `n` blocks.
    pub fn snapshot_interval(mut self, n: u64) -> Self {
        self.config.snapshot_interval = n;
        self
    }

    /// Set live mode polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn aggregator(mut self, config: AggregatorConfig) -> Self {
        self.aggregator = config;
        self
    }

    pub fn protocols(mut self, config: ProtocolsConfig) -> Self {
        self.protocols = config;
        self
    }

    pub fn source(mut self, source: Arc<dyn LogSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Storage backend; defaults to [`InMemoryStorage`].
    pub fn store(mut self, store: Arc<dyn IndexStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Price oracle; defaults to the aggregator's static price table.
    pub fn oracle(mut self, oracle: Arc<dyn PriceOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Share a view handle with readers created before the loop.
    pub fn view(mut self, view: ViewHandle) -> Self {
        self.view = Some(view);
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Assemble the index loop.
    pub fn build(self) -> Result<IndexLoop, IndexerError> {
        let source = self
            .source
            .ok_or_else(|| IndexerError::Config("no log source configured".into()))?;
        self.config.validate()?;
        self.aggregator.validate()?;

        let fetcher = LogFetcher::new(
            source,
            self.config.max_log_range,
            RetryPolicy::from_config(&self.config),
        );
        let decoders = DecoderSet::from_config(&self.protocols)?;
        if decoders.is_empty() {
            tracing::warn!("No protocols configured, only block headers will be indexed");
        }
        let oracle = self
            .oracle
            .unwrap_or_else(|| Arc::new(StaticPriceOracle::new(self.aggregator.prices.clone())));
        let engine = AggregationEngine::new(self.aggregator, oracle);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()));

        IndexLoop::new(
            self.config,
            DecodePipeline::new(fetcher, decoders),
            engine,
            store,
            self.view.unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryChain;

    #[test]
    fn builder_defaults() {
        let cfg = IndexerBuilder::new().build_config();
        assert_eq!(cfg.chain, "ethereum");
        assert_eq!(cfg.confirmation_depth, 12);
        assert_eq!(cfg.batch_size, 100);
    }

    #[test]
    fn builder_custom() {
        let cfg = IndexerBuilder::new()
            .id("defi-mainnet")
            .chain("base")
            .from_block(50_000_000)
            .to_block(50_001_000)
            .confirmation_depth(3)
            .batch_size(250)
            .max_log_range(2_000)
            .snapshot_interval(50)
            .build_config();

        assert_eq!(cfg.id, "defi-mainnet");
        assert_eq!(cfg.chain, "base");
        assert_eq!(cfg.from_block, 50_000_000);
        assert_eq!(cfg.to_block, Some(50_001_000));
        assert_eq!(cfg.confirmation_depth, 3);
        assert_eq!(cfg.batch_size, 250);
        assert_eq!(cfg.max_log_range, 2_000);
        assert_eq!(cfg.snapshot_interval, 50);
    }

    #[test]
    fn build_requires_a_source() {
        assert!(matches!(
            IndexerBuilder::new().build(),
            Err(IndexerError::Config(_))
        ));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let result = IndexerBuilder::new()
            .source(Arc::new(MemoryChain::new()))
            .batch_size(0)
            .build();
        assert!(matches!(result, Err(IndexerError::Config(_))));
    }
}
