//! Canonical domain events produced by the protocol decoders.
//!
//! A [`DomainEvent`] is immutable once built and is identified by the log
//! that produced it ([`EventId`]). All amounts are `Decimal`s with token
//! decimals already applied, so the aggregation engine never needs to know
//! which protocol an amount came from.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{EventId, EventPosition, ProtocolId};

/// An amount of a single token, in whole-token units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAmount {
    /// Token symbol as configured for the protocol (e.g. `"WETH"`).
    pub token: String,
    /// Decimal amount; negative only for signed deltas (vault updates).
    pub amount: Decimal,
}

impl TokenAmount {
    pub fn new(token: impl Into<String>, amount: Decimal) -> Self {
        Self {
            token: token.into(),
            amount: amount.normalize(),
        }
    }

    /// The same token with the absolute value of the amount.
    pub fn abs(&self) -> Self {
        Self {
            token: self.token.clone(),
            amount: self.amount.abs(),
        }
    }

    /// The same token with the amount negated.
    pub fn negated(&self) -> Self {
        Self {
            token: self.token.clone(),
            amount: -self.amount,
        }
    }
}

/// Discriminant of [`EventPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Swap,
    Deposit,
    Withdraw,
    Borrow,
    Repay,
    Stake,
    Unstake,
    LiquidityAdd,
    LiquidityRemove,
    Liquidation,
    VaultUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Swap => "swap",
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
            Self::Borrow => "borrow",
            Self::Repay => "repay",
            Self::Stake => "stake",
            Self::Unstake => "unstake",
            Self::LiquidityAdd => "liquidity_add",
            Self::LiquidityRemove => "liquidity_remove",
            Self::Liquidation => "liquidation",
            Self::VaultUpdate => "vault_update",
        }
    }

    /// Value leaving a protocol on behalf of the wallet.
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Withdraw | Self::Unstake | Self::LiquidityRemove)
    }

    /// Value entering a yield-bearing position.
    pub fn is_yield_entry(&self) -> bool {
        matches!(self, Self::Deposit | Self::Stake | Self::LiquidityAdd)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific data carried by a domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    Swap {
        token_in: TokenAmount,
        token_out: TokenAmount,
    },
    Deposit {
        asset: TokenAmount,
    },
    Withdraw {
        asset: TokenAmount,
    },
    Borrow {
        asset: TokenAmount,
    },
    Repay {
        asset: TokenAmount,
    },
    Stake {
        asset: TokenAmount,
        shares: Decimal,
    },
    Unstake {
        asset: TokenAmount,
        shares: Decimal,
    },
    LiquidityAdd {
        amounts: Vec<TokenAmount>,
    },
    LiquidityRemove {
        amounts: Vec<TokenAmount>,
    },
    Liquidation {
        collateral: TokenAmount,
        debt: TokenAmount,
        liquidator: String,
    },
    /// Signed changes to a vault's collateral and normalized debt.
    VaultUpdate {
        collateral_delta: TokenAmount,
        debt_delta: TokenAmount,
    },
}

/// Which side of a protocol's book a balance change lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceSide {
    Supplied,
    Borrowed,
}

/// A signed change to one token balance held by a protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceEffect {
    pub side: BalanceSide,
    pub amount: TokenAmount,
}

impl BalanceEffect {
    fn supplied(amount: TokenAmount) -> Self {
        Self {
            side: BalanceSide::Supplied,
            amount,
        }
    }

    fn borrowed(amount: TokenAmount) -> Self {
        Self {
            side: BalanceSide::Borrowed,
            amount,
        }
    }
}

/// A decoded, canonicalized on-chain log relevant to a tracked protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: EventId,
    pub protocol: ProtocolId,
    /// Contract that emitted the log (lowercase `0x…`).
    pub contract: String,
    pub block_number: u64,
    pub block_hash: String,
    /// Block timestamp (Unix seconds).
    pub timestamp: i64,
    /// The wallet the activity is attributed to (lowercase `0x…`).
    pub wallet: String,
    pub payload: EventPayload,
}

impl DomainEvent {
    /// Global ordering key.
    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.block_number, self.id.log_index)
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::Swap { .. } => EventKind::Swap,
            EventPayload::Deposit { .. } => EventKind::Deposit,
            EventPayload::Withdraw { .. } => EventKind::Withdraw,
            EventPayload::Borrow { .. } => EventKind::Borrow,
            EventPayload::Repay { .. } => EventKind::Repay,
            EventPayload::Stake { .. } => EventKind::Stake,
            EventPayload::Unstake { .. } => EventKind::Unstake,
            EventPayload::LiquidityAdd { .. } => EventKind::LiquidityAdd,
            EventPayload::LiquidityRemove { .. } => EventKind::LiquidityRemove,
            EventPayload::Liquidation { .. } => EventKind::Liquidation,
            EventPayload::VaultUpdate { .. } => EventKind::VaultUpdate,
        }
    }

    /// The amount that best represents the value moved by this event.
    pub fn primary_amount(&self) -> Option<&TokenAmount> {
        match &self.payload {
            EventPayload::Swap { token_in, .. } => Some(token_in),
            EventPayload::Deposit { asset }
            | EventPayload::Withdraw { asset }
            | EventPayload::Borrow { asset }
            | EventPayload::Repay { asset }
            | EventPayload::Stake { asset, .. }
            | EventPayload::Unstake { asset, .. } => Some(asset),
            EventPayload::LiquidityAdd { amounts } | EventPayload::LiquidityRemove { amounts } => {
                amounts.iter().find(|a| !a.amount.is_zero()).or(amounts.first())
            }
            EventPayload::Liquidation { debt, .. } => Some(debt),
            EventPayload::VaultUpdate {
                collateral_delta, ..
            } => Some(collateral_delta),
        }
    }

    /// Token legs counted towards volume, as absolute amounts.
    pub fn volume_legs(&self) -> Vec<TokenAmount> {
        match &self.payload {
            EventPayload::LiquidityAdd { amounts } | EventPayload::LiquidityRemove { amounts } => {
                amounts.iter().map(TokenAmount::abs).collect()
            }
            _ => self.primary_amount().map(TokenAmount::abs).into_iter().collect(),
        }
    }

    /// Signed balance changes this event causes inside its protocol.
    pub fn balance_effects(&self) -> Vec<BalanceEffect> {
        match &self.payload {
            EventPayload::Swap {
                token_in,
                token_out,
            } => vec![
                BalanceEffect::supplied(token_in.abs()),
                BalanceEffect::supplied(token_out.abs().negated()),
            ],
            EventPayload::Deposit { asset } | EventPayload::Stake { asset, .. } => {
                vec![BalanceEffect::supplied(asset.abs())]
            }
            EventPayload::Withdraw { asset } | EventPayload::Unstake { asset, .. } => {
                vec![BalanceEffect::supplied(asset.abs().negated())]
            }
            EventPayload::Borrow { asset } => vec![BalanceEffect::borrowed(asset.abs())],
            EventPayload::Repay { asset } => vec![BalanceEffect::borrowed(asset.abs().negated())],
            EventPayload::LiquidityAdd { amounts } => amounts
                .iter()
                .map(|a| BalanceEffect::supplied(a.abs()))
                .collect(),
            EventPayload::LiquidityRemove { amounts } => amounts
                .iter()
                .map(|a| BalanceEffect::supplied(a.abs().negated()))
                .collect(),
            EventPayload::Liquidation {
                collateral, debt, ..
            } => vec![
                BalanceEffect::supplied(collateral.abs().negated()),
                BalanceEffect::borrowed(debt.abs().negated()),
            ],
            EventPayload::VaultUpdate {
                collateral_delta,
                debt_delta,
            } => vec![
                BalanceEffect::supplied(collateral_delta.clone()),
                BalanceEffect::borrowed(debt_delta.clone()),
            ],
        }
    }
}
