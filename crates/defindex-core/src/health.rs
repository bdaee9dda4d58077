//! Protocol health scoring.
//!
//! A [`ProtocolHealthSnapshot`] is taken for every protocol with a stats row
//! on each chain-time health tick. The score starts at 100 and each factor
//! subtracts `weight × severity`, where severity is the factor's distance
//! from neutral relative to its warning threshold, capped at 1.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::HealthConfig;
use crate::types::ProtocolId;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Warning raised by a health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    HighUtilization,
    TvlDrop,
    WhaleExodus,
    GasSpike,
    StaleData,
}

/// Immutable periodic health record for one protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolHealthSnapshot {
    pub protocol: ProtocolId,
    /// Chain time of the tick that produced this snapshot.
    pub timestamp: i64,
    /// Last block observed before the tick.
    pub block_number: u64,
    /// 0–100, two decimal places.
    pub score: Decimal,
    pub utilization: Decimal,
    pub tvl_usd: Decimal,
    /// Percent change of TVL against the value one rolling window ago.
    pub tvl_change_24h_pct: Decimal,
    pub whale_exits: u64,
    pub gas_multiplier: Decimal,
    pub warnings: Vec<WarningCode>,
}

/// Measured inputs for one protocol at one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthInputs {
    pub utilization: Decimal,
    pub tvl_usd: Decimal,
    pub tvl_change_pct: Decimal,
    pub whale_exits: u64,
    pub gas_multiplier: Decimal,
    pub stale: bool,
}

/// Score `inputs` against `config`. Returns the score and raised warnings.
pub fn score(inputs: &HealthInputs, config: &HealthConfig) -> (Decimal, Vec<WarningCode>) {
    let mut warnings = Vec::new();
    let mut penalty = Decimal::ZERO;

    let mut factor = |severity: Decimal, weight: Decimal, code: WarningCode| {
        if severity >= Decimal::ONE {
            warnings.push(code);
        }
        penalty = penalty.saturating_add(weight.saturating_mul(severity.clamp(Decimal::ZERO, Decimal::ONE)));
    };

    factor(
        ratio(inputs.utilization, config.utilization_warn),
        config.weight_utilization,
        WarningCode::HighUtilization,
    );
    factor(
        ratio(-inputs.tvl_change_pct, config.tvl_drop_warn_pct),
        config.weight_tvl_drop,
        WarningCode::TvlDrop,
    );
    factor(
        ratio(
            Decimal::from(inputs.whale_exits),
            Decimal::from(config.whale_exit_warn.max(1)),
        ),
        config.weight_whale_exits,
        WarningCode::WhaleExodus,
    );
    let gas_severity = if config.gas_multiplier_warn > Decimal::ONE {
        ratio(
            inputs.gas_multiplier.saturating_sub(Decimal::ONE),
            config.gas_multiplier_warn.saturating_sub(Decimal::ONE),
        )
    } else if inputs.gas_multiplier >= config.gas_multiplier_warn {
        Decimal::ONE
    } else {
        Decimal::ZERO
    };
    factor(gas_severity, config.weight_gas, WarningCode::GasSpike);
    factor(
        if inputs.stale { Decimal::ONE } else { Decimal::ZERO },
        config.weight_stale,
        WarningCode::StaleData,
    );

    let score = HUNDRED.saturating_sub(penalty).clamp(Decimal::ZERO, HUNDRED).round_dp(2);
    (score, warnings)
}

fn ratio(value: Decimal, threshold: Decimal) -> Decimal {
    if value <= Decimal::ZERO || threshold <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    value.checked_div(threshold).unwrap_or(Decimal::ONE)
}

/// Percent change from `past` to `current`, 0 when there is no baseline.
/// Changes too large for a decimal saturate at `Decimal::MAX` / `MIN`.
pub fn percent_change(past: Decimal, current: Decimal) -> Decimal {
    if past.is_zero() {
        return Decimal::ZERO;
    }
    let diff = current.saturating_sub(past);
    let saturated = if diff.is_sign_negative() == past.is_sign_negative() {
        Decimal::MAX
    } else {
        Decimal::MIN
    };
    diff.checked_mul(HUNDRED)
        .and_then(|d| d.checked_div(past))
        .or_else(|| diff.checked_div(past).and_then(|r| r.checked_mul(HUNDRED)))
        .map_or(saturated, |v| v.round_dp(2))
}

// ─── Gas tracker ─────────────────────────────────────────────────────────────

/// Tracks block base fees: a short "recent" window against a longer baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasTracker {
    recent: VecDeque<u64>,
    baseline: VecDeque<u64>,
    recent_len: usize,
    baseline_len: usize,
}

impl GasTracker {
    pub fn new(recent_len: usize, baseline_len: usize) -> Self {
        Self {
            recent: VecDeque::new(),
            baseline: VecDeque::new(),
            recent_len: recent_len.max(1),
            baseline_len: baseline_len.max(1),
        }
    }

    /// Record one block's base fee. Blocks fall from the recent window into
    /// the baseline.
    pub fn observe(&mut self, base_fee: u64) {
        self.recent.push_back(base_fee);
        while self.recent.len() > self.recent_len {
            if let Some(old) = self.recent.pop_front() {
                self.baseline.push_back(old);
            }
        }
        while self.baseline.len() > self.baseline_len {
            self.baseline.pop_front();
        }
    }

    /// Recent average over baseline average; 1 until both are populated.
    pub fn multiplier(&self) -> Decimal {
        match (average(&self.recent), average(&self.baseline)) {
            (Some(recent), Some(base)) if !base.is_zero() => recent
                .checked_div(base)
                .map(|m| m.round_dp(4))
                .unwrap_or(Decimal::ONE),
            _ => Decimal::ONE,
        }
    }
}

fn average(values: &VecDeque<u64>) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum: u128 = values.iter().map(|&v| v as u128).sum();
    Decimal::from_u128(sum)?.checked_div(Decimal::from(values.len() as u64))
}
