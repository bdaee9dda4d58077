//! CDP / vault system (vault core `frob` and liquidation module `bark`).

use std::collections::BTreeMap;

use alloy_primitives::B256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use defindex_core::error::DecodeError;
use defindex_core::event::{DomainEvent, EventPayload};
use defindex_core::types::{EventFilter, ProtocolId};

use super::{amount, build_event, ProtocolDecoder, TokenInfo};
use crate::abi::{self, cdp as ev, decode_log, topic_of};
use crate::fetcher::RawLog;

/// Vault quantities (`ink`, `art`) are always 18-decimal fixed point.
const WAD: u32 = 18;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IlkConfig {
    pub collateral: TokenInfo,
    /// Accumulated stability-fee rate: debt = normalized debt × rate.
    pub rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdpConfig {
    /// Vault core emitting `Frob`.
    pub vat: String,
    /// Liquidation module emitting `Bark`.
    pub dog: String,
    /// The stablecoin debt is denominated in.
    pub debt_token: TokenInfo,
    /// Collateral type name (e.g. `"ETH-A"`) → collateral metadata.
    pub ilks: BTreeMap<String, IlkConfig>,
}

pub struct CdpDecoder {
    config: CdpConfig,
    frob: String,
    bark: String,
}

impl CdpDecoder {
    pub fn new(mut config: CdpConfig) -> Self {
        config.vat = config.vat.to_ascii_lowercase();
        config.dog = config.dog.to_ascii_lowercase();
        Self {
            config,
            frob: topic_of::<ev::Frob>(),
            bark: topic_of::<ev::Bark>(),
        }
    }

    fn ilk(&self, ilk: &B256) -> Result<&IlkConfig, DecodeError> {
        let name = abi::short_string(ilk)?;
        self.config
            .ilks
            .get(&name)
            .ok_or(DecodeError::UnknownPool { id: name })
    }

    fn debt(&self, ilk: &IlkConfig, normalized: Decimal, field: &str) -> Result<Decimal, DecodeError> {
        normalized
            .checked_mul(ilk.rate)
            .map(|d| d.round_dp(self.config.debt_token.decimals))
            .ok_or_else(|| DecodeError::AmountOverflow {
                field: field.to_string(),
            })
    }

    fn decode_frob(&self, log: &RawLog) -> Result<DomainEvent, DecodeError> {
        let e: ev::Frob = decode_log(log)?;
        let ilk = self.ilk(&e.ilk)?;
        let dink = abi::i256_to_decimal(e.dink, WAD, "dink")?;
        let dart = abi::i256_to_decimal(e.dart, WAD, "dart")?;
        let debt_delta = self.debt(ilk, dart, "dart")?;
        build_event(
            ProtocolId::Cdp,
            log,
            abi::address(&e.urn),
            EventPayload::VaultUpdate {
                collateral_delta: amount(&ilk.collateral, dink),
                debt_delta: amount(&self.config.debt_token, debt_delta),
            },
        )
    }

    fn decode_bark(&self, log: &RawLog) -> Result<DomainEvent, DecodeError> {
        let e: ev::Bark = decode_log(log)?;
        let ilk = self.ilk(&e.ilk)?;
        let ink = abi::u256_to_decimal(e.ink, WAD, "ink")?;
        let art = abi::u256_to_decimal(e.art, WAD, "art")?;
        let debt = self.debt(ilk, art, "art")?;
        build_event(
            ProtocolId::Cdp,
            log,
            abi::address(&e.urn),
            EventPayload::Liquidation {
                collateral: amount(&ilk.collateral, ink),
                debt: amount(&self.config.debt_token, debt),
                liquidator: abi::address(&e.clip),
            },
        )
    }
}

impl ProtocolDecoder for CdpDecoder {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Cdp
    }

    fn filter(&self) -> EventFilter {
        EventFilter::address(self.config.vat.clone())
            .with_address(self.config.dog.clone())
            .topic0(self.frob.clone())
            .topic0(self.bark.clone())
    }

    fn decode(&self, log: &RawLog) -> Result<Option<DomainEvent>, DecodeError> {
        let Some(t0) = abi::topic0(log) else {
            return Ok(None);
        };
        if t0 == self.frob && log.address.eq_ignore_ascii_case(&self.config.vat) {
            self.decode_frob(log).map(Some)
        } else if t0 == self.bark && log.address.eq_ignore_ascii_case(&self.config.dog) {
            self.decode_bark(log).map(Some)
        } else {
            Ok(None)
        }
    }
}
