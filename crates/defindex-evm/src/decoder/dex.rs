//! Concentrated-liquidity pool manager (singleton contract, pools by id).

use std::collections::BTreeMap;

use alloy_primitives::B256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use defindex_core::error::DecodeError;
use defindex_core::event::{DomainEvent, EventPayload};
use defindex_core::types::{EventFilter, ProtocolId};

use super::{amount, build_event, lowercase_keys, ProtocolDecoder, TokenInfo};
use crate::abi::{self, decode_log, dex as ev, topic_of};
use crate::fetcher::RawLog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexPoolConfig {
    pub currency0: TokenInfo,
    pub currency1: TokenInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexConfig {
    /// The pool manager contract that emits every pool's events.
    pub pool_manager: String,
    /// Pool id (`0x…` bytes32) → currencies.
    pub pools: BTreeMap<String, DexPoolConfig>,
}

pub struct DexDecoder {
    pool_manager: String,
    pools: BTreeMap<String, DexPoolConfig>,
    swap: String,
    added: String,
    removed: String,
}

impl DexDecoder {
    pub fn new(config: DexConfig) -> Self {
        Self {
            pool_manager: config.pool_manager.to_ascii_lowercase(),
            pools: lowercase_keys(&config.pools),
            swap: topic_of::<ev::Swap>(),
            added: topic_of::<ev::LiquidityAdded>(),
            removed: topic_of::<ev::LiquidityRemoved>(),
        }
    }

    fn pool(&self, id: &B256) -> Result<&DexPoolConfig, DecodeError> {
        let id = abi::hex_string(id);
        self.pools
            .get(&id)
            .ok_or(DecodeError::UnknownPool { id })
    }

    fn decode_swap(&self, log: &RawLog) -> Result<DomainEvent, DecodeError> {
        let e: ev::Swap = decode_log(log)?;
        let pool = self.pool(&e.id)?;
        let amount0 = abi::i128_to_decimal(e.amount0, pool.currency0.decimals, "amount0")?;
        let amount1 = abi::i128_to_decimal(e.amount1, pool.currency1.decimals, "amount1")?;

        // Deltas are from the pool's perspective of the caller: negative is paid in.
        let (token_in, token_out) = if amount0 < Decimal::ZERO && amount1 >= Decimal::ZERO {
            (amount(&pool.currency0, -amount0), amount(&pool.currency1, amount1))
        } else if amount1 < Decimal::ZERO && amount0 >= Decimal::ZERO {
            (amount(&pool.currency1, -amount1), amount(&pool.currency0, amount0))
        } else {
            return Err(DecodeError::MalformedLog {
                reason: format!("swap deltas {amount0}/{amount1} have no single input leg"),
            });
        };
        build_event(
            ProtocolId::Dex,
            log,
            abi::address(&e.sender),
            EventPayload::Swap {
                token_in,
                token_out,
            },
        )
    }

    fn decode_liquidity(&self, log: &RawLog, added: bool) -> Result<DomainEvent, DecodeError> {
        let (id, provider, amount0, amount1) = if added {
            let e: ev::LiquidityAdded = decode_log(log)?;
            (e.id, e.provider, e.amount0, e.amount1)
        } else {
            let e: ev::LiquidityRemoved = decode_log(log)?;
            (e.id, e.provider, e.amount0, e.amount1)
        };
        let pool = self.pool(&id)?;
        let amounts = vec![
            amount(
                &pool.currency0,
                abi::u256_to_decimal(amount0, pool.currency0.decimals, "amount0")?,
            ),
            amount(
                &pool.currency1,
                abi::u256_to_decimal(amount1, pool.currency1.decimals, "amount1")?,
            ),
        ];
        let payload = if added {
            EventPayload::LiquidityAdd { amounts }
        } else {
            EventPayload::LiquidityRemove { amounts }
        };
        build_event(ProtocolId::Dex, log, abi::address(&provider), payload)
    }
}

impl ProtocolDecoder for DexDecoder {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Dex
    }

    fn filter(&self) -> EventFilter {
        EventFilter::address(self.pool_manager.clone())
            .topic0(self.swap.clone())
            .topic0(self.added.clone())
            .topic0(self.removed.clone())
    }

    fn decode(&self, log: &RawLog) -> Result<Option<DomainEvent>, DecodeError> {
        if !log.address.eq_ignore_ascii_case(&self.pool_manager) {
            return Ok(None);
        }
        let Some(t0) = abi::topic0(log) else {
            return Ok(None);
        };
        if t0 == self.swap {
            self.decode_swap(log).map(Some)
        } else if t0 == self.added {
            self.decode_liquidity(log, true).map(Some)
        } else if t0 == self.removed {
            self.decode_liquidity(log, false).map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{encode_log, event_topic};
    use crate::decoder::test_support::raw_log;
    use alloy_primitives::aliases::{I24, U160, U24};
    use alloy_primitives::{address, Address, U256};
    use defindex_core::event::TokenAmount;
    use rust_decimal_macros::dec;

    const MANAGER: &str = "0x000000000004444c5dc75cb358380d2e3de08a90";
    const SENDER: Address = address!("1111111111111111111111111111111111111111");

    fn pool_id() -> B256 {
        B256::repeat_byte(0xab)
    }

    fn decoder() -> DexDecoder {
        DexDecoder::new(DexConfig {
            pool_manager: MANAGER.into(),
            pools: BTreeMap::from([(
                abi::hex_string(pool_id()),
                DexPoolConfig {
                    currency0: TokenInfo::new("USDC", 6),
                    currency1: TokenInfo::new("WETH", 18),
                },
            )]),
        })
    }

    fn swap_log(amount0: i128, amount1: i128) -> RawLog {
        let (topics, data) = encode_log(&ev::Swap {
            id: pool_id(),
            sender: SENDER,
            amount0,
            amount1,
            sqrt_price_x96: U160::from(1u64),
            liquidity: 1,
            tick: I24::ZERO,
            fee: U24::from(500u64),
        });
        raw_log(MANAGER, topics, data)
    }

    #[test]
    fn swap_negative_delta_is_input() {
        let event = decoder()
            .decode(&swap_log(-3_000_000_000, 1_000_000_000_000_000_000))
            .unwrap()
            .unwrap();
        assert_eq!(event.wallet, abi::address(&SENDER));
        assert_eq!(event.id.tx_hash, "0xaaa1");
        assert_eq!(event.block_number, 100);
        assert_eq!(event.timestamp, 1_700_000_000);
        assert_eq!(
            event.payload,
            EventPayload::Swap {
                token_in: TokenAmount::new("USDC", dec!(3000)),
                token_out: TokenAmount::new("WETH", dec!(1)),
            }
        );
    }

    #[test]
    fn swap_with_two_inputs_is_malformed() {
        let err = decoder().decode(&swap_log(-1, -1)).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedLog { .. }));
    }

    #[test]
    fn unknown_pool_is_reported() {
        let mut log = swap_log(-1, 1);
        log.topics[1] = format!("0x{}", "cd".repeat(32));
        assert!(matches!(
            decoder().decode(&log),
            Err(DecodeError::UnknownPool { .. })
        ));
    }

    #[test]
    fn liquidity_removed() {
        let (topics, data) = encode_log(&ev::LiquidityRemoved {
            id: pool_id(),
            provider: SENDER,
            amount0: U256::from(5_000_000u64),
            amount1: U256::ZERO,
        });
        let event = decoder().decode(&raw_log(MANAGER, topics, data)).unwrap().unwrap();
        assert_eq!(
            event.payload,
            EventPayload::LiquidityRemove {
                amounts: vec![
                    TokenAmount::new("USDC", dec!(5)),
                    TokenAmount::new("WETH", dec!(0)),
                ]
            }
        );
    }

    #[test]
    fn ignores_other_contracts_and_topics() {
        let d = decoder();
        let mut log = swap_log(-1, 1);
        log.address = "0xother".into();
        assert_eq!(d.decode(&log).unwrap(), None);

        let mut log = swap_log(-1, 1);
        log.topics[0] = event_topic("Transfer(address,address,uint256)");
        assert_eq!(d.decode(&log).unwrap(), None);
    }
}
