//! Aggregation-engine configuration.
//!
//! The whale threshold, flow classification heuristic, and health-score
//! formula are all parameters here; nothing in the engine hardcodes them.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::IndexerError;

/// Settings for the aggregation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// A wallet is a whale once its total volume reaches this many USD.
    pub whale_threshold_usd: Decimal,
    /// Width of one rolling-window bucket (seconds).
    pub rolling_bucket_secs: i64,
    /// Number of buckets in the rolling window (24 × 1h = 24h).
    pub rolling_bucket_count: usize,
    /// Trailing window used for transactions-per-second (seconds).
    pub tps_window_secs: i64,
    /// Max events kept in each wallet's flow-detection buffer.
    pub wallet_buffer_len: usize,
    /// Size of the recent-transactions ring served to readers.
    pub recent_tx_capacity: usize,
    /// Number of capital flows kept in aggregate state.
    pub flow_retention: usize,
    /// USD price per token symbol.
    pub prices: BTreeMap<String, Decimal>,
    pub flow: FlowConfig,
    pub health: HealthConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            whale_threshold_usd: Decimal::from(100_000),
            rolling_bucket_secs: 3600,
            rolling_bucket_count: 24,
            tps_window_secs: 60,
            wallet_buffer_len: 32,
            recent_tx_capacity: 500,
            flow_retention: 10_000,
            prices: BTreeMap::new(),
            flow: FlowConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl AggregatorConfig {
    /// Length of the rolling window in seconds.
    pub fn rolling_window_secs(&self) -> i64 {
        self.rolling_bucket_secs * self.rolling_bucket_count as i64
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.rolling_bucket_secs <= 0 || self.rolling_bucket_count == 0 {
            return Err(IndexerError::Config(
                "rolling window needs a positive bucket size and count".into(),
            ));
        }
        if self.tps_window_secs <= 0 {
            return Err(IndexerError::Config("tps_window_secs must be > 0".into()));
        }
        if self.wallet_buffer_len == 0 {
            return Err(IndexerError::Config("wallet_buffer_len must be > 0".into()));
        }
        if self.whale_threshold_usd.is_sign_negative() {
            return Err(IndexerError::Config("whale_threshold_usd must be >= 0".into()));
        }
        if let Some((token, _)) = self.prices.iter().find(|(_, p)| p.is_sign_negative()) {
            return Err(IndexerError::Config(format!("negative price for {token}")));
        }
        self.flow.validate()?;
        self.health.validate()
    }
}

/// Capital-flow detection and classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Two events by one wallet farther apart than this are never paired.
    pub window_secs: i64,
    /// Swap → swap pairs at most this far apart are classified as arbitrage.
    pub arbitrage_max_secs: i64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            window_secs: 600,
            arbitrage_max_secs: 60,
        }
    }
}

impl FlowConfig {
    fn validate(&self) -> Result<(), IndexerError> {
        if self.window_secs <= 0 {
            return Err(IndexerError::Config("flow.window_secs must be > 0".into()));
        }
        if self.arbitrage_max_secs < 0 {
            return Err(IndexerError::Config(
                "flow.arbitrage_max_secs must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// Health-score derivation: thresholds raise warnings, weights size the
/// penalty subtracted from 100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Chain-time interval between health snapshots (seconds).
    pub interval_secs: i64,
    /// Trailing window for counting whale exits (seconds).
    pub whale_exit_window_secs: i64,
    /// Utilization (0–1) above which a protocol is flagged.
    pub utilization_warn: Decimal,
    /// 24h TVL drop (percent, positive number) that raises a warning.
    pub tvl_drop_warn_pct: Decimal,
    /// Whale exits in the trailing window that raise a warning.
    pub whale_exit_warn: u64,
    /// Gas multiplier vs baseline that raises a warning.
    pub gas_multiplier_warn: Decimal,
    /// Blocks averaged for the gas baseline.
    pub gas_baseline_blocks: usize,
    /// Blocks averaged for the current gas level.
    pub gas_recent_blocks: usize,
    /// Number of snapshots retained in aggregate state.
    pub history_len: usize,
    pub weight_utilization: Decimal,
    pub weight_tvl_drop: Decimal,
    pub weight_whale_exits: Decimal,
    pub weight_gas: Decimal,
    pub weight_stale: Decimal,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            whale_exit_window_secs: 3600,
            utilization_warn: Decimal::new(85, 2),
            tvl_drop_warn_pct: Decimal::from(10),
            whale_exit_warn: 3,
            gas_multiplier_warn: Decimal::from(2),
            gas_baseline_blocks: 300,
            gas_recent_blocks: 10,
            history_len: 24 * 7,
            weight_utilization: Decimal::from(30),
            weight_tvl_drop: Decimal::from(25),
            weight_whale_exits: Decimal::from(20),
            weight_gas: Decimal::from(10),
            weight_stale: Decimal::from(15),
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<(), IndexerError> {
        if self.interval_secs <= 0 || self.whale_exit_window_secs <= 0 {
            return Err(IndexerError::Config(
                "health intervals must be positive".into(),
            ));
        }
        if self.utilization_warn <= Decimal::ZERO || self.utilization_warn >= Decimal::ONE {
            return Err(IndexerError::Config(
                "health.utilization_warn must be between 0 and 1".into(),
            ));
        }
        if self.gas_multiplier_warn <= Decimal::ZERO {
            return Err(IndexerError::Config(
                "health.gas_multiplier_warn must be > 0".into(),
            ));
        }
        if self.tvl_drop_warn_pct <= Decimal::ZERO {
            return Err(IndexerError::Config(
                "health.tvl_drop_warn_pct must be > 0".into(),
            ));
        }
        if self.gas_baseline_blocks == 0 || self.gas_recent_blocks == 0 {
            return Err(IndexerError::Config(
                "health gas windows must be non-empty".into(),
            ));
        }
        Ok(())
    }
}
