//! Liquid-staking contract (share-based accounting).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use defindex_core::error::DecodeError;
use defindex_core::event::{DomainEvent, EventPayload};
use defindex_core::types::{EventFilter, ProtocolId};

use super::{amount, build_event, ProtocolDecoder, TokenInfo};
use crate::abi::{self, decode_log, staking as ev, topic_of};
use crate::fetcher::RawLog;

/// Share precision.
const SHARE_DECIMALS: u32 = 18;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingConfig {
    /// Contract emitting both `Submitted` and `WithdrawalRequested`.
    pub contract: String,
    /// The staked asset.
    pub token: TokenInfo,
    /// Exchange rate: assets backing one share.
    pub assets_per_share: Decimal,
}

pub struct StakingDecoder {
    config: StakingConfig,
    submitted: String,
    withdrawal_requested: String,
}

impl StakingDecoder {
    pub fn new(mut config: StakingConfig) -> Self {
        config.contract = config.contract.to_ascii_lowercase();
        Self {
            config,
            submitted: topic_of::<ev::Submitted>(),
            withdrawal_requested: topic_of::<ev::WithdrawalRequested>(),
        }
    }

    fn decode_submitted(&self, log: &RawLog) -> Result<DomainEvent, DecodeError> {
        let e: ev::Submitted = decode_log(log)?;
        let assets = abi::u256_to_decimal(e.amount, self.config.token.decimals, "amount")?;
        let shares = assets
            .checked_div(self.config.assets_per_share)
            .ok_or_else(|| DecodeError::AmountOverflow {
                field: "shares".into(),
            })?
            .round_dp(SHARE_DECIMALS)
            .normalize();
        build_event(
            ProtocolId::Staking,
            log,
            abi::address(&e.sender),
            EventPayload::Stake {
                asset: amount(&self.config.token, assets),
                shares,
            },
        )
    }

    fn decode_withdrawal(&self, log: &RawLog) -> Result<DomainEvent, DecodeError> {
        let e: ev::WithdrawalRequested = decode_log(log)?;
        let shares = abi::u256_to_decimal(e.amount_of_shares, SHARE_DECIMALS, "amountOfShares")?;
        let assets = shares
            .checked_mul(self.config.assets_per_share)
            .ok_or_else(|| DecodeError::AmountOverflow {
                field: "amountOfStETH".into(),
            })?
            .round_dp(self.config.token.decimals);
        build_event(
            ProtocolId::Staking,
            log,
            abi::address(&e.owner),
            EventPayload::Unstake {
                asset: amount(&self.config.token, assets),
                shares,
            },
        )
    }
}

impl ProtocolDecoder for StakingDecoder {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Staking
    }

    fn filter(&self) -> EventFilter {
        EventFilter::address(self.config.contract.clone())
            .topic0(self.submitted.clone())
            .topic0(self.withdrawal_requested.clone())
    }

    fn decode(&self, log: &RawLog) -> Result<Option<DomainEvent>, DecodeError> {
        if !log.address.eq_ignore_ascii_case(&self.config.contract) {
            return Ok(None);
        }
        match abi::topic0(log) {
            Some(t) if t == self.submitted => self.decode_submitted(log).map(Some),
            Some(t) if t == self.withdrawal_requested => self.decode_withdrawal(log).map(Some),
            _ => Ok(None),
        }
    }
}
