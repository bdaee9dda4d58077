//! Read side: immutable state views and the query operations served from
//! them.
//!
//! The aggregator builds a fresh [`StateView`] after each applied range and
//! publishes it through a [`ViewHandle`]. Readers only ever clone the
//! current `Arc<StateView>`; they never observe a half-applied batch.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

use crate::aggregator::{AggregateState, RecentTransaction};
use crate::config::AggregatorConfig;
use crate::error::IndexerError;
use crate::flow::CapitalFlow;
use crate::health::ProtocolHealthSnapshot;
use crate::price::PriceOracle;
use crate::types::ProtocolId;
use crate::whale::WhaleActivity;

// ─── Rows ─────────────────────────────────────────────────────────────────────

/// Freshness of a stats row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Fresh,
    Stale,
}

/// One protocol's stats as served to readers. Rolling figures are evaluated
/// at the view's chain time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStatsRow {
    pub protocol: ProtocolId,
    pub tvl_usd: Decimal,
    pub utilization: Decimal,
    pub cumulative_volume_usd: Decimal,
    pub volume_24h_usd: Decimal,
    pub cumulative_tx_count: u64,
    pub tx_count_24h: u64,
    pub tps: Decimal,
    pub last_updated_block: u64,
    pub last_updated_at: i64,
    pub stale_since: Option<i64>,
    pub last_error: Option<String>,
    pub status: RowStatus,
}

/// A wallet's activity plus the whale predicate at the configured threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhaleRow {
    #[serde(flatten)]
    pub activity: WhaleActivity,
    pub is_whale: bool,
}

// ─── StateView ────────────────────────────────────────────────────────────────

/// Immutable, versioned snapshot of everything readers can query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateView {
    /// Monotonic publication counter.
    pub version: u64,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub chain_time: Option<i64>,
    /// Wall-clock publication time (Unix seconds).
    pub published_at: i64,
    pub stats: Vec<ProtocolStatsRow>,
    /// Sorted by total volume, largest first.
    pub whales: Vec<WhaleRow>,
    /// Newest first.
    pub recent: Vec<RecentTransaction>,
    /// Newest first.
    pub flows: Vec<CapitalFlow>,
    /// Latest snapshot per protocol.
    pub health: Vec<ProtocolHealthSnapshot>,
}

impl StateView {
    pub fn build(
        state: &AggregateState,
        config: &AggregatorConfig,
        oracle: &dyn PriceOracle,
        version: u64,
    ) -> Self {
        let latest_update = state
            .stats
            .values()
            .map(|s| s.last_update_timestamp)
            .max()
            .unwrap_or(0);
        let now = state.chain_time().unwrap_or(latest_update).max(latest_update);

        let stats = state
            .stats
            .values()
            .map(|s| ProtocolStatsRow {
                protocol: s.protocol,
                tvl_usd: s.tvl_usd(oracle),
                utilization: s.utilization(oracle),
                cumulative_volume_usd: s.cumulative_volume_usd,
                volume_24h_usd: s.volume_24h(now),
                cumulative_tx_count: s.cumulative_tx_count,
                tx_count_24h: s.tx_count_24h(now),
                tps: s.tps(now),
                last_updated_block: s.last_update_block,
                last_updated_at: s.last_update_timestamp,
                stale_since: s.stale_since,
                last_error: s.last_error.clone(),
                status: if s.is_stale() {
                    RowStatus::Stale
                } else {
                    RowStatus::Fresh
                },
            })
            .collect();

        let mut whales: Vec<WhaleRow> = state
            .whales
            .values()
            .map(|w| WhaleRow {
                activity: w.clone(),
                is_whale: w.is_whale(config.whale_threshold_usd),
            })
            .collect();
        whales.sort_by(|a, b| {
            b.activity
                .total_volume_usd
                .cmp(&a.activity.total_volume_usd)
                .then_with(|| a.activity.wallet.cmp(&b.activity.wallet))
        });

        Self {
            version,
            block_number: state.block_number(),
            block_hash: state.head.as_ref().map(|h| h.hash.clone()),
            chain_time: Some(now).filter(|t| *t > 0),
            published_at: chrono::Utc::now().timestamp(),
            stats,
            whales,
            recent: state.recent.iter().cloned().collect(),
            flows: state.flows.iter().rev().cloned().collect(),
            health: state.health.latest.values().cloned().collect(),
        }
    }
}

// ─── Query operations ────────────────────────────────────────────────────────

/// Read operations served from the current published view.
///
/// Every operation is a pure read of one view, so results within a single
/// call are always mutually consistent.
#[async_trait]
pub trait QueryStore: Send + Sync {
    /// The most recently published view.
    async fn current_view(&self) -> Result<Arc<StateView>, IndexerError>;

    async fn all_protocol_stats(&self) -> Result<Vec<ProtocolStatsRow>, IndexerError> {
        Ok(self.current_view().await?.stats.clone())
    }

    /// Latest health snapshot for one protocol, or for all when `None`.
    async fn protocol_health(
        &self,
        protocol: Option<ProtocolId>,
    ) -> Result<Vec<ProtocolHealthSnapshot>, IndexerError> {
        let view = self.current_view().await?;
        Ok(view
            .health
            .iter()
            .filter(|h| protocol.map_or(true, |p| h.protocol == p))
            .cloned()
            .collect())
    }

    async fn recent_transactions(
        &self,
        limit: usize,
    ) -> Result<Vec<RecentTransaction>, IndexerError> {
        let view = self.current_view().await?;
        Ok(view.recent.iter().take(limit).cloned().collect())
    }

    /// Wallets with at least `min_volume_usd` total volume, largest first.
    async fn whale_activity(
        &self,
        limit: usize,
        min_volume_usd: Decimal,
    ) -> Result<Vec<WhaleRow>, IndexerError> {
        let view = self.current_view().await?;
        Ok(view
            .whales
            .iter()
            .filter(|w| w.activity.total_volume_usd >= min_volume_usd)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn capital_flows(&self, limit: usize) -> Result<Vec<CapitalFlow>, IndexerError> {
        let view = self.current_view().await?;
        Ok(view.flows.iter().take(limit).cloned().collect())
    }
}

// ─── ViewHandle ───────────────────────────────────────────────────────────────

/// Shared pointer to the current view. Publishing swaps the pointer;
/// readers holding an older `Arc` keep a consistent picture.
#[derive(Debug, Clone, Default)]
pub struct ViewHandle {
    inner: Arc<RwLock<Arc<StateView>>>,
}

impl ViewHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone the current view pointer.
    pub fn load(&self) -> Arc<StateView> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current view.
    pub fn publish(&self, view: StateView) {
        let view = Arc::new(view);
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = view;
    }

    /// Version of the current view.
    pub fn version(&self) -> u64 {
        self.load().version
    }
}

#[async_trait]
impl QueryStore for ViewHandle {
    async fn current_view(&self) -> Result<Arc<StateView>, IndexerError> {
        Ok(self.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregationEngine;
    use crate::event::{DomainEvent, EventPayload, TokenAmount};
    use crate::price::StaticPriceOracle;
    use crate::types::EventId;
    use rust_decimal_macros::dec;

    fn engine_with_activity() -> AggregationEngine {
        let oracle = StaticPriceOracle::default().with_price("USDC", dec!(1));
        let mut engine = AggregationEngine::new(AggregatorConfig::default(), Arc::new(oracle));
        let wallets = [("0xa", dec!(250000)), ("0xb", dec!(10)), ("0xc", dec!(120000))];
        for (i, (wallet, amount)) in wallets.into_iter().enumerate() {
            engine
                .apply(&DomainEvent {
                    id: EventId::new(format!("0x{i}"), i as u32),
                    protocol: ProtocolId::Lending,
                    contract: "0xpool".into(),
                    block_number: 1,
                    block_hash: "0xb1".into(),
                    timestamp: 1000,
                    wallet: wallet.into(),
                    payload: EventPayload::Deposit {
                        asset: TokenAmount::new("USDC", amount),
                    },
                })
                .unwrap();
        }
        engine
    }

    #[tokio::test]
    async fn whale_query_filters_and_sorts() {
        let handle = ViewHandle::new();
        handle.publish(engine_with_activity().view(1));

        let whales = handle.whale_activity(10, dec!(100000)).await.unwrap();
        let wallets: Vec<_> = whales.iter().map(|w| w.activity.wallet.as_str()).collect();
        assert_eq!(wallets, vec!["0xa", "0xc"]);
        assert!(whales.iter().all(|w| w.is_whale));

        let top = handle.whale_activity(1, Decimal::ZERO).await.unwrap();
        assert_eq!(top.len(), 1);
    }

    #[tokio::test]
    async fn recent_transactions_newest_first() {
        let handle = ViewHandle::new();
        handle.publish(engine_with_activity().view(1));
        let recent = handle.recent_transactions(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].wallet, "0xc");
        assert_eq!(recent[1].wallet, "0xb");
    }

    #[tokio::test]
    async fn stats_rows_carry_staleness() {
        let handle = ViewHandle::new();
        handle.publish(engine_with_activity().view(3));
        let stats = handle.all_protocol_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].status, RowStatus::Fresh);
        assert_eq!(stats[0].last_updated_at, 1000);
        assert_eq!(stats[0].tx_count_24h, 3);
        assert_eq!(stats[0].tvl_usd, dec!(370010));
    }

    #[tokio::test]
    async fn readers_keep_old_view_across_publish() {
        let handle = ViewHandle::new();
        let before = handle.load();
        assert_eq!(before.version, 0);
        handle.publish(engine_with_activity().view(7));
        assert_eq!(before.version, 0);
        assert_eq!(handle.version(), 7);
        assert!(handle.protocol_health(None).await.unwrap().is_empty());
    }
}
