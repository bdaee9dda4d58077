//! Pooled lending market (Aave-v3-style pool events).

use std::collections::BTreeMap;

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use defindex_core::error::DecodeError;
use defindex_core::event::{DomainEvent, EventPayload, TokenAmount};
use defindex_core::types::{EventFilter, ProtocolId};

use super::{amount, build_event, lowercase_keys, ProtocolDecoder, TokenInfo};
use crate::abi::{self, decode_log, lending as ev, topic_of};
use crate::fetcher::RawLog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LendingConfig {
    /// The pool contract.
    pub pool: String,
    /// Reserve (underlying asset) address → token.
    pub reserves: BTreeMap<String, TokenInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Supply,
    Withdraw,
    Borrow,
    Repay,
    Liquidation,
}

pub struct LendingDecoder {
    pool: String,
    reserves: BTreeMap<String, TokenInfo>,
    topics: Vec<(String, Kind)>,
}

impl LendingDecoder {
    pub fn new(config: LendingConfig) -> Self {
        Self {
            pool: config.pool.to_ascii_lowercase(),
            reserves: lowercase_keys(&config.reserves),
            topics: vec![
                (topic_of::<ev::Supply>(), Kind::Supply),
                (topic_of::<ev::Withdraw>(), Kind::Withdraw),
                (topic_of::<ev::Borrow>(), Kind::Borrow),
                (topic_of::<ev::Repay>(), Kind::Repay),
                (topic_of::<ev::LiquidationCall>(), Kind::Liquidation),
            ],
        }
    }

    fn reserve(&self, reserve: &Address) -> Result<&TokenInfo, DecodeError> {
        let address = abi::address(reserve);
        self.reserves
            .get(&address)
            .ok_or(DecodeError::UnknownToken { address })
    }

    fn token_amount(&self, reserve: &Address, value: U256, field: &str) -> Result<TokenAmount, DecodeError> {
        let token = self.reserve(reserve)?;
        let value = abi::u256_to_decimal(value, token.decimals, field)?;
        Ok(amount(token, value))
    }

    fn decode_kind(&self, log: &RawLog, kind: Kind) -> Result<DomainEvent, DecodeError> {
        let (wallet, payload) = match kind {
            // Supplies and borrows are attributed to `on_behalf_of`, the position owner.
            Kind::Supply => {
                let e: ev::Supply = decode_log(log)?;
                let asset = self.token_amount(&e.reserve, e.amount, "amount")?;
                (e.on_behalf_of, EventPayload::Deposit { asset })
            }
            Kind::Withdraw => {
                let e: ev::Withdraw = decode_log(log)?;
                let asset = self.token_amount(&e.reserve, e.amount, "amount")?;
                (e.user, EventPayload::Withdraw { asset })
            }
            Kind::Borrow => {
                let e: ev::Borrow = decode_log(log)?;
                let asset = self.token_amount(&e.reserve, e.amount, "amount")?;
                (e.on_behalf_of, EventPayload::Borrow { asset })
            }
            Kind::Repay => {
                let e: ev::Repay = decode_log(log)?;
                let asset = self.token_amount(&e.reserve, e.amount, "amount")?;
                (e.user, EventPayload::Repay { asset })
            }
            Kind::Liquidation => {
                let e: ev::LiquidationCall = decode_log(log)?;
                let collateral = self.token_amount(
                    &e.collateral_asset,
                    e.liquidated_collateral_amount,
                    "liquidatedCollateralAmount",
                )?;
                let debt = self.token_amount(&e.debt_asset, e.debt_to_cover, "debtToCover")?;
                (
                    e.user,
                    EventPayload::Liquidation {
                        collateral,
                        debt,
                        liquidator: abi::address(&e.liquidator),
                    },
                )
            }
        };
        build_event(ProtocolId::Lending, log, abi::address(&wallet), payload)
    }
}

impl ProtocolDecoder for LendingDecoder {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Lending
    }

    fn filter(&self) -> EventFilter {
        self.topics
            .iter()
            .fold(EventFilter::address(self.pool.clone()), |f, (t, _)| {
                f.topic0(t.clone())
            })
    }

    fn decode(&self, log: &RawLog) -> Result<Option<DomainEvent>, DecodeError> {
        if !log.address.eq_ignore_ascii_case(&self.pool) {
            return Ok(None);
        }
        let Some(t0) = abi::topic0(log) else {
            return Ok(None);
        };
        match self.topics.iter().find(|(t, _)| *t == t0) {
            Some((_, kind)) => self.decode_kind(log, *kind).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::encode_log;
    use crate::decoder::test_support::raw_log;
    use alloy_primitives::address;
    use rust_decimal_macros::dec;

    const POOL: &str = "0x87870bca3f3fd6335c3f4ce8392d69350b4fa4e2";
    const USDC: Address = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
    const WETH: Address = address!("c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2");
    const USER: Address = address!("2222222222222222222222222222222222222222");
    const LIQUIDATOR: Address = address!("3333333333333333333333333333333333333333");

    fn decoder() -> LendingDecoder {
        LendingDecoder::new(LendingConfig {
            pool: POOL.to_ascii_uppercase().replace("0X", "0x"),
            reserves: BTreeMap::from([
                (abi::address(&USDC), TokenInfo::new("USDC", 6)),
                (abi::address(&WETH), TokenInfo::new("WETH", 18)),
            ]),
        })
    }

    fn log_of<E: alloy_sol_types::SolEvent>(event: &E) -> RawLog {
        let (topics, data) = encode_log(event);
        raw_log(POOL, topics, data)
    }

    #[test]
    fn supply_is_attributed_to_on_behalf_of() {
        let log = log_of(&ev::Supply {
            reserve: USDC,
            user: LIQUIDATOR,
            on_behalf_of: USER,
            amount: U256::from(250_000_000u64),
            referral_code: 0,
        });
        let event = decoder().decode(&log).unwrap().unwrap();
        assert_eq!(event.protocol, ProtocolId::Lending);
        assert_eq!(event.wallet, abi::address(&USER));
        assert_eq!(
            event.payload,
            EventPayload::Deposit {
                asset: TokenAmount::new("USDC", dec!(250))
            }
        );
    }

    #[test]
    fn withdraw_and_repay() {
        let withdraw = log_of(&ev::Withdraw {
            reserve: WETH,
            user: USER,
            to: USER,
            amount: U256::from(500_000_000_000_000_000u64),
        });
        let event = decoder().decode(&withdraw).unwrap().unwrap();
        assert_eq!(
            event.payload,
            EventPayload::Withdraw {
                asset: TokenAmount::new("WETH", dec!(0.5))
            }
        );

        let repay = log_of(&ev::Repay {
            reserve: USDC,
            user: USER,
            repayer: LIQUIDATOR,
            amount: U256::from(1_000_000u64),
            use_a_tokens: false,
        });
        let event = decoder().decode(&repay).unwrap().unwrap();
        assert_eq!(event.wallet, abi::address(&USER));
        assert_eq!(event.kind(), defindex_core::event::EventKind::Repay);
    }

    #[test]
    fn liquidation_call() {
        let log = log_of(&ev::LiquidationCall {
            collateral_asset: WETH,
            debt_asset: USDC,
            user: USER,
            debt_to_cover: U256::from(1_500_000_000u64),
            liquidated_collateral_amount: U256::from(1_000_000_000_000_000_000u64),
            liquidator: LIQUIDATOR,
            receive_a_token: false,
        });
        let event = decoder().decode(&log).unwrap().unwrap();
        assert_eq!(event.wallet, abi::address(&USER));
        assert_eq!(
            event.payload,
            EventPayload::Liquidation {
                collateral: TokenAmount::new("WETH", dec!(1)),
                debt: TokenAmount::new("USDC", dec!(1500)),
                liquidator: abi::address(&LIQUIDATOR),
            }
        );
    }

    #[test]
    fn unknown_reserve() {
        let log = log_of(&ev::Borrow {
            reserve: LIQUIDATOR,
            user: USER,
            on_behalf_of: USER,
            amount: U256::from(1u64),
            interest_rate_mode: 2,
            borrow_rate: U256::ZERO,
            referral_code: 0,
        });
        assert!(matches!(
            decoder().decode(&log),
            Err(DecodeError::UnknownToken { .. })
        ));
    }

    #[test]
    fn short_data_is_malformed() {
        let mut log = log_of(&ev::Supply {
            reserve: USDC,
            user: USER,
            on_behalf_of: USER,
            amount: U256::from(1u64),
            referral_code: 0,
        });
        log.data.truncate(66);
        assert!(matches!(
            decoder().decode(&log),
            Err(DecodeError::MalformedLog { .. })
        ));
    }
}
