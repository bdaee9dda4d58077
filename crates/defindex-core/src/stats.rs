//! Per-protocol rolling statistics.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::AggregatorConfig;
use crate::error::AggregationError;
use crate::event::{BalanceSide, DomainEvent};
use crate::price::PriceOracle;
use crate::types::ProtocolId;
use crate::window::RollingWindow;

/// Aggregate statistics for one protocol.
///
/// Only the aggregation engine mutates this, and only through
/// [`ProtocolStats::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStats {
    pub protocol: ProtocolId,
    pub cumulative_volume_usd: Decimal,
    pub cumulative_tx_count: u64,
    /// Events counted without a USD valuation (missing price or valuation overflow).
    #[serde(default)]
    pub unpriced_tx_count: u64,
    /// 24h (by default) volume and count.
    pub rolling: RollingWindow,
    /// Short window used for transactions-per-second.
    pub tps: RollingWindow,
    /// Exits (withdraw/unstake/remove liquidity) by whales.
    pub whale_exits: RollingWindow,
    /// Net supplied balance per token (deposits, stake, pool reserves, collateral).
    pub supplied: BTreeMap<String, Decimal>,
    /// Net borrowed balance per token (loans, vault debt).
    pub borrowed: BTreeMap<String, Decimal>,
    pub last_update_block: u64,
    pub last_update_timestamp: i64,
    /// Chain time of the first failed update since the last good one.
    pub stale_since: Option<i64>,
    pub last_error: Option<String>,
    tps_window_secs: i64,
}

impl ProtocolStats {
    pub fn new(protocol: ProtocolId, config: &AggregatorConfig) -> Self {
        let tps_bucket = (config.tps_window_secs / 60).max(1);
        let tps_buckets = (config.tps_window_secs + tps_bucket - 1) / tps_bucket;
        let exit_window = config.health.whale_exit_window_secs;
        let exit_bucket = (exit_window / 12).max(1);
        let exit_buckets = (exit_window + exit_bucket - 1) / exit_bucket;

        Self {
            protocol,
            cumulative_volume_usd: Decimal::ZERO,
            cumulative_tx_count: 0,
            unpriced_tx_count: 0,
            rolling: RollingWindow::new(config.rolling_bucket_secs, config.rolling_bucket_count),
            tps: RollingWindow::new(tps_bucket, tps_buckets as usize),
            whale_exits: RollingWindow::new(exit_bucket, exit_buckets as usize),
            supplied: BTreeMap::new(),
            borrowed: BTreeMap::new(),
            last_update_block: 0,
            last_update_timestamp: 0,
            stale_since: None,
            last_error: None,
            tps_window_secs: config.tps_window_secs,
        }
    }

    /// Fold one event into the row.
    ///
    /// Counts, TPS and token balances never depend on a price and are
    /// always updated. When `volume_usd` is an error the event adds no USD
    /// volume, `unpriced_tx_count` grows and the row is marked stale; the
    /// error is returned. An arithmetic overflow leaves the row as it was,
    /// apart from the staleness marker.
    pub fn apply(
        &mut self,
        event: &DomainEvent,
        volume_usd: Result<Decimal, AggregationError>,
        whale_exit: bool,
    ) -> Result<(), AggregationError> {
        let mut next = self.clone();
        match next.apply_inner(event, volume_usd, whale_exit) {
            Ok(None) => {
                next.stale_since = None;
                next.last_error = None;
                *self = next;
                Ok(())
            }
            Ok(Some(unpriced)) => {
                next.unpriced_tx_count += 1;
                next.stale_since.get_or_insert(event.timestamp);
                next.last_error = Some(unpriced.to_string());
                *self = next;
                Err(unpriced)
            }
            Err(err) => {
                self.stale_since.get_or_insert(event.timestamp);
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Returns the valuation error when the event could not be priced.
    fn apply_inner(
        &mut self,
        event: &DomainEvent,
        volume_usd: Result<Decimal, AggregationError>,
        whale_exit: bool,
    ) -> Result<Option<AggregationError>, AggregationError> {
        let (volume, unpriced) = match volume_usd {
            Ok(volume) => (volume, None),
            Err(err) => (Decimal::ZERO, Some(err)),
        };

        self.cumulative_volume_usd = self
            .cumulative_volume_usd
            .checked_add(volume)
            .ok_or_else(|| overflow("cumulative volume"))?;
        self.cumulative_tx_count += 1;

        self.rolling.record(event.timestamp, volume)?;
        self.tps.record(event.timestamp, Decimal::ZERO)?;
        if whale_exit {
            self.whale_exits.record(event.timestamp, volume)?;
        }

        for effect in event.balance_effects() {
            let book = match effect.side {
                BalanceSide::Supplied => &mut self.supplied,
                BalanceSide::Borrowed => &mut self.borrowed,
            };
            let entry = book.entry(effect.amount.token.clone()).or_insert(Decimal::ZERO);
            *entry = entry
                .checked_add(effect.amount.amount)
                .ok_or_else(|| overflow("token balance"))?
                .normalize();
        }

        self.last_update_block = event.block_number;
        self.last_update_timestamp = event.timestamp;
        Ok(unpriced)
    }

    pub fn is_stale(&self) -> bool {
        self.stale_since.is_some()
    }

    /// Rolling-window volume ending at `now`.
    pub fn volume_24h(&self, now: i64) -> Decimal {
        self.rolling.volume(now)
    }

    /// Rolling-window transaction count ending at `now`.
    pub fn tx_count_24h(&self, now: i64) -> u64 {
        self.rolling.count(now)
    }

    /// Transactions per second over the trailing TPS window.
    pub fn tps(&self, now: i64) -> Decimal {
        let count = Decimal::from(self.tps.count(now));
        (count / Decimal::from(self.tps_window_secs.max(1))).round_dp(6)
    }

    /// Whale exits in the trailing whale-exit window.
    pub fn whale_exit_count(&self, now: i64) -> u64 {
        self.whale_exits.count(now)
    }

    /// Total value locked: positive supplied balances valued in USD.
    /// Tokens without a price are left out.
    pub fn tvl_usd(&self, oracle: &dyn PriceOracle) -> Decimal {
        book_value(&self.supplied, oracle)
    }

    pub fn borrowed_usd(&self, oracle: &dyn PriceOracle) -> Decimal {
        book_value(&self.borrowed, oracle)
    }

    /// Borrowed / supplied in USD, 0 when nothing is supplied.
    pub fn utilization(&self, oracle: &dyn PriceOracle) -> Decimal {
        let supplied = self.tvl_usd(oracle);
        if supplied.is_zero() {
            return Decimal::ZERO;
        }
        self.borrowed_usd(oracle)
            .checked_div(supplied)
            .map_or(Decimal::ZERO, |u| u.round_dp(6))
    }
}

fn book_value(book: &BTreeMap<String, Decimal>, oracle: &dyn PriceOracle) -> Decimal {
    book.iter()
        .filter(|(_, amount)| amount.is_sign_positive())
        .filter_map(|(token, amount)| {
            oracle
                .price_usd(token)
                .and_then(|price| amount.checked_mul(price))
        })
        .fold(Decimal::ZERO, |acc, v| acc.saturating_add(v))
}

fn overflow(field: &str) -> AggregationError {
    AggregationError::Overflow {
        field: field.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, TokenAmount};
    use crate::price::StaticPriceOracle;
    use crate::types::EventId;
    use rust_decimal_macros::dec;

    fn event(log_index: u32, ts: i64, payload: EventPayload) -> DomainEvent {
        DomainEvent {
            id: EventId::new("0xtx", log_index),
            protocol: ProtocolId::Lending,
            contract: "0xpool".into(),
            block_number: 10 + log_index as u64,
            block_hash: "0xb".into(),
            timestamp: ts,
            wallet: "0xw".into(),
            payload,
        }
    }

    fn oracle() -> StaticPriceOracle {
        StaticPriceOracle::default()
            .with_price("USDC", dec!(1))
            .with_price("WETH", dec!(2000))
    }

    #[test]
    fn apply_updates_counters_and_books() {
        let cfg = AggregatorConfig::default();
        let mut stats = ProtocolStats::new(ProtocolId::Lending, &cfg);

        let deposit = event(0, 1000, EventPayload::Deposit {
            asset: TokenAmount::new("WETH", dec!(10)),
        });
        let borrow = event(1, 1010, EventPayload::Borrow {
            asset: TokenAmount::new("USDC", dec!(5000)),
        });
        stats.apply(&deposit, Ok(dec!(20000)), false).unwrap();
        stats.apply(&borrow, Ok(dec!(5000)), false).unwrap();

        assert_eq!(stats.cumulative_tx_count, 2);
        assert_eq!(stats.cumulative_volume_usd, dec!(25000));
        assert_eq!(stats.tx_count_24h(1010), 2);
        assert_eq!(stats.tvl_usd(&oracle()), dec!(20000));
        assert_eq!(stats.utilization(&oracle()), dec!(0.25));
        assert_eq!(stats.last_update_block, 11);
    }

    #[test]
    fn unpriced_event_still_counts_and_moves_balances() {
        let cfg = AggregatorConfig::default();
        let mut stats = ProtocolStats::new(ProtocolId::Lending, &cfg);
        let e = event(0, 500, EventPayload::Deposit {
            asset: TokenAmount::new("PEPE", dec!(1)),
        });

        let err = stats.apply(
            &e,
            Err(AggregationError::MissingPrice { token: "PEPE".into() }),
            false,
        );
        assert!(err.is_err());
        assert!(stats.is_stale());
        assert_eq!(stats.stale_since, Some(500));
        assert_eq!(stats.cumulative_tx_count, 1);
        assert_eq!(stats.unpriced_tx_count, 1);
        assert_eq!(stats.tx_count_24h(500), 1);
        assert_eq!(stats.cumulative_volume_usd, dec!(0));
        assert_eq!(stats.supplied["PEPE"], dec!(1));
        assert_eq!(stats.last_update_block, 10);

        let ok = event(1, 600, EventPayload::Deposit {
            asset: TokenAmount::new("USDC", dec!(1)),
        });
        stats.apply(&ok, Ok(dec!(1)), false).unwrap();
        assert!(!stats.is_stale());
        assert!(stats.last_error.is_none());
        assert_eq!(stats.tx_count_24h(600), 2);
        assert_eq!(stats.volume_24h(600), dec!(1));
        assert_eq!(stats.unpriced_tx_count, 1);
    }

    #[test]
    fn balance_overflow_leaves_row_untouched() {
        let cfg = AggregatorConfig::default();
        let mut stats = ProtocolStats::new(ProtocolId::Lending, &cfg);
        let big = event(0, 100, EventPayload::Deposit {
            asset: TokenAmount::new("USDC", Decimal::MAX),
        });
        stats.apply(&big, Ok(dec!(0)), false).unwrap();
        let before = stats.clone();

        let err = stats.apply(&event(1, 200, big.payload.clone()), Ok(dec!(0)), false);
        assert!(matches!(err, Err(AggregationError::Overflow { .. })));
        assert_eq!(stats.cumulative_tx_count, before.cumulative_tx_count);
        assert_eq!(stats.supplied, before.supplied);
        assert_eq!(stats.stale_since, Some(200));
    }

    #[test]
    fn utilization_survives_extreme_books() {
        let cfg = AggregatorConfig::default();
        let mut stats = ProtocolStats::new(ProtocolId::Lending, &cfg);
        stats.supplied.insert("USDC".into(), dec!(0.0000000000000000000000000001));
        stats.borrowed.insert("USDC".into(), Decimal::MAX);
        let oracle = oracle();
        assert_eq!(stats.utilization(&oracle), Decimal::ZERO);
    }

    #[test]
    fn tps_is_derived_from_trailing_window() {
        let cfg = AggregatorConfig::default(); // 60s window
        let mut stats = ProtocolStats::new(ProtocolId::Lending, &cfg);
        for i in 0..30 {
            let e = event(i, 1_000 + i as i64, EventPayload::Repay {
                asset: TokenAmount::new("USDC", dec!(1)),
            });
            stats.apply(&e, Ok(dec!(1)), false).unwrap();
        }
        assert_eq!(stats.tps(1_029), dec!(0.5));
        assert_eq!(stats.tps(10_000), dec!(0));
    }

    #[test]
    fn whale_exits_are_counted_separately() {
        let cfg = AggregatorConfig::default();
        let mut stats = ProtocolStats::new(ProtocolId::Lending, &cfg);
        let e = event(0, 100, EventPayload::Withdraw {
            asset: TokenAmount::new("USDC", dec!(1)),
        });
        stats.apply(&e, Ok(dec!(1)), true).unwrap();
        assert_eq!(stats.whale_exit_count(100), 1);
        assert_eq!(stats.whale_exit_count(100 + 7200), 0);
    }
}
