//! Stableswap AMM pools (one contract per pool, N coins).

use std::collections::BTreeMap;

use alloy_dyn_abi::{DynSolEvent, DynSolType, DynSolValue};
use alloy_primitives::keccak256;
use serde::{Deserialize, Serialize};

use defindex_core::error::DecodeError;
use defindex_core::event::{DomainEvent, EventPayload, TokenAmount};
use defindex_core::types::{EventFilter, ProtocolId};

use super::{amount, build_event, lowercase_keys, ProtocolDecoder, TokenInfo};
use crate::abi::{self, decode_dyn, decode_log, event_topic, stableswap as ev, topic_of};
use crate::fetcher::RawLog;

/// `AddLiquidity(address,uint256[N],uint256[N],uint256,uint256)`
pub fn add_liquidity_signature(n: usize) -> String {
    format!("AddLiquidity(address,uint256[{n}],uint256[{n}],uint256,uint256)")
}

/// `RemoveLiquidity(address,uint256[N],uint256[N],uint256)`
pub fn remove_liquidity_signature(n: usize) -> String {
    format!("RemoveLiquidity(address,uint256[{n}],uint256[{n}],uint256)")
}

/// Runtime shape of the liquidity events of an `n`-coin pool: the provider
/// is indexed, the body starts with `token_amounts` and `fees`.
fn liquidity_event(signature: &str, n: usize, trailing_words: usize) -> DynSolEvent {
    let amounts = DynSolType::FixedArray(Box::new(DynSolType::Uint(256)), n);
    let mut body = vec![amounts.clone(), amounts];
    body.extend(std::iter::repeat(DynSolType::Uint(256)).take(trailing_words));
    DynSolEvent::new_unchecked(
        Some(keccak256(signature.as_bytes())),
        vec![DynSolType::Address],
        DynSolType::Tuple(body),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StablePoolConfig {
    /// Coins in pool index order.
    pub coins: Vec<TokenInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableswapConfig {
    /// Pool address → coins.
    pub pools: BTreeMap<String, StablePoolConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Kind {
    Exchange,
    Add(usize),
    Remove(usize),
}

struct LiquidityAbi {
    signature: String,
    event: DynSolEvent,
}

pub struct StableswapDecoder {
    pools: BTreeMap<String, StablePoolConfig>,
    topics: BTreeMap<String, Kind>,
    liquidity: BTreeMap<Kind, LiquidityAbi>,
}

impl StableswapDecoder {
    pub fn new(config: StableswapConfig) -> Self {
        let pools = lowercase_keys(&config.pools);
        let mut topics = BTreeMap::from([(topic_of::<ev::TokenExchange>(), Kind::Exchange)]);
        let mut liquidity = BTreeMap::new();
        for pool in pools.values() {
            let n = pool.coins.len();
            for (kind, signature, trailing) in [
                (Kind::Add(n), add_liquidity_signature(n), 2),
                (Kind::Remove(n), remove_liquidity_signature(n), 1),
            ] {
                topics.insert(event_topic(&signature), kind);
                let event = liquidity_event(&signature, n, trailing);
                liquidity.insert(kind, LiquidityAbi { signature, event });
            }
        }
        Self {
            pools,
            topics,
            liquidity,
        }
    }

    fn coin<'a>(pool_address: &str, pool: &'a StablePoolConfig, id: i128) -> Result<&'a TokenInfo, DecodeError> {
        usize::try_from(id)
            .ok()
            .and_then(|index| pool.coins.get(index))
            .ok_or_else(|| DecodeError::UnknownToken {
                address: format!("{pool_address}[{id}]"),
            })
    }

    fn decode_exchange(&self, log: &RawLog, address: &str, pool: &StablePoolConfig) -> Result<DomainEvent, DecodeError> {
        let e: ev::TokenExchange = decode_log(log)?;
        let sold = Self::coin(address, pool, e.sold_id)?;
        let bought = Self::coin(address, pool, e.bought_id)?;
        let payload = EventPayload::Swap {
            token_in: amount(sold, abi::u256_to_decimal(e.tokens_sold, sold.decimals, "tokens_sold")?),
            token_out: amount(
                bought,
                abi::u256_to_decimal(e.tokens_bought, bought.decimals, "tokens_bought")?,
            ),
        };
        build_event(ProtocolId::Stableswap, log, abi::address(&e.buyer), payload)
    }

    fn decode_liquidity(&self, log: &RawLog, pool: &StablePoolConfig, kind: Kind) -> Result<DomainEvent, DecodeError> {
        let abi_def = self.liquidity.get(&kind).ok_or_else(|| DecodeError::MalformedLog {
            reason: format!("no liquidity event shape for {kind:?}"),
        })?;
        let decoded = decode_dyn(&abi_def.event, &abi_def.signature, log)?;
        let malformed = |what: &str| DecodeError::MalformedLog {
            reason: format!("{}: {what}", abi_def.signature),
        };

        let provider = decoded
            .indexed
            .first()
            .and_then(DynSolValue::as_address)
            .ok_or_else(|| malformed("provider is not an address"))?;
        let values = decoded
            .body
            .first()
            .and_then(DynSolValue::as_fixed_seq)
            .ok_or_else(|| malformed("token_amounts is not a fixed array"))?;
        let amounts = pool
            .coins
            .iter()
            .zip(values)
            .map(|(coin, value)| {
                let (raw, _) = value.as_uint().ok_or_else(|| malformed("token amount is not a uint"))?;
                Ok(amount(coin, abi::u256_to_decimal(raw, coin.decimals, "token_amounts")?))
            })
            .collect::<Result<Vec<TokenAmount>, DecodeError>>()?;

        let payload = match kind {
            Kind::Remove(_) => EventPayload::LiquidityRemove { amounts },
            _ => EventPayload::LiquidityAdd { amounts },
        };
        build_event(ProtocolId::Stableswap, log, abi::address(&provider), payload)
    }
}

impl ProtocolDecoder for StableswapDecoder {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Stableswap
    }

    fn filter(&self) -> EventFilter {
        let filter = EventFilter {
            addresses: self.pools.keys().cloned().collect(),
            topic0_values: Vec::new(),
        };
        self.topics.keys().fold(filter, |f, t| f.topic0(t.clone()))
    }

    fn decode(&self, log: &RawLog) -> Result<Option<DomainEvent>, DecodeError> {
        let address = log.address.to_ascii_lowercase();
        let Some(pool) = self.pools.get(&address) else {
            return Ok(None);
        };
        let Some(kind) = abi::topic0(log).and_then(|t| self.topics.get(&t).copied()) else {
            return Ok(None);
        };
        match kind {
            Kind::Exchange => self.decode_exchange(log, &address, pool).map(Some),
            Kind::Add(n) | Kind::Remove(n) if n != pool.coins.len() => Ok(None),
            _ => self.decode_liquidity(log, pool, kind).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{address_topic, encode_log, hex_string};
    use crate::decoder::test_support::raw_log;
    use alloy_primitives::{address, Address, U256};
    use rust_decimal_macros::dec;

    const TRIPOOL: &str = "0xbebc44782c7db0a1a60cb6fe97d0b483032ff1c7";
    const BOB: Address = address!("5555555555555555555555555555555555555555");

    fn decoder() -> StableswapDecoder {
        StableswapDecoder::new(StableswapConfig {
            pools: BTreeMap::from([(
                TRIPOOL.to_string(),
                StablePoolConfig {
                    coins: vec![
                        TokenInfo::new("DAI", 18),
                        TokenInfo::new("USDC", 6),
                        TokenInfo::new("USDT", 6),
                    ],
                },
            )]),
        })
    }

    fn exchange(sold_id: i128, tokens_sold: u128, bought_id: i128, tokens_bought: u128) -> RawLog {
        let (topics, data) = encode_log(&ev::TokenExchange {
            buyer: BOB,
            sold_id,
            tokens_sold: U256::from(tokens_sold),
            bought_id,
            tokens_bought: U256::from(tokens_bought),
        });
        raw_log(TRIPOOL, topics, data)
    }

    /// A liquidity log for a pool with `amounts.len()` coins.
    fn liquidity_log(signature: &str, amounts: &[u128], trailing_words: usize) -> RawLog {
        let uints = |values: &[u128]| {
            DynSolValue::FixedArray(values.iter().map(|v| DynSolValue::Uint(U256::from(*v), 256)).collect())
        };
        let mut body = vec![uints(amounts), uints(&vec![1; amounts.len()])];
        body.extend(std::iter::repeat(DynSolValue::Uint(U256::from(1u64), 256)).take(trailing_words));
        let data = DynSolValue::Tuple(body).abi_encode_params();
        raw_log(
            TRIPOOL,
            vec![event_topic(signature), address_topic(BOB)],
            hex_string(data),
        )
    }

    #[test]
    fn token_exchange_maps_coin_indices() {
        let event = decoder()
            .decode(&exchange(1, 1_000_000_000, 0, 999_500_000_000_000_000_000))
            .unwrap()
            .unwrap();
        assert_eq!(event.wallet, abi::address(&BOB));
        assert_eq!(
            event.payload,
            EventPayload::Swap {
                token_in: TokenAmount::new("USDC", dec!(1000)),
                token_out: TokenAmount::new("DAI", dec!(999.5)),
            }
        );
    }

    #[test]
    fn add_liquidity_uses_pool_coin_count() {
        let log = liquidity_log(
            &add_liquidity_signature(3),
            &[100_000_000_000_000_000_000, 200_000_000, 0],
            2,
        );
        let event = decoder().decode(&log).unwrap().unwrap();
        assert_eq!(event.wallet, abi::address(&BOB));
        assert_eq!(
            event.payload,
            EventPayload::LiquidityAdd {
                amounts: vec![
                    TokenAmount::new("DAI", dec!(100)),
                    TokenAmount::new("USDC", dec!(200)),
                    TokenAmount::new("USDT", dec!(0)),
                ]
            }
        );
    }

    #[test]
    fn remove_liquidity() {
        let log = liquidity_log(&remove_liquidity_signature(3), &[0, 5_000_000, 7_000_000], 1);
        let event = decoder().decode(&log).unwrap().unwrap();
        assert_eq!(
            event.payload,
            EventPayload::LiquidityRemove {
                amounts: vec![
                    TokenAmount::new("DAI", dec!(0)),
                    TokenAmount::new("USDC", dec!(5)),
                    TokenAmount::new("USDT", dec!(7)),
                ]
            }
        );
    }

    #[test]
    fn other_arity_is_ignored() {
        let log = liquidity_log(&remove_liquidity_signature(2), &[1, 1], 1);
        assert_eq!(decoder().decode(&log).unwrap(), None);
    }

    #[test]
    fn truncated_liquidity_body_is_malformed() {
        let mut log = liquidity_log(&add_liquidity_signature(3), &[1, 1, 1], 2);
        log.data.truncate(2 + 64 * 3);
        assert!(matches!(
            decoder().decode(&log),
            Err(DecodeError::MalformedLog { .. })
        ));
    }

    #[test]
    fn coin_index_out_of_range() {
        assert!(matches!(
            decoder().decode(&exchange(5, 1, 0, 1)),
            Err(DecodeError::UnknownToken { .. })
        ));
        assert!(matches!(
            decoder().decode(&exchange(-1, 1, 0, 1)),
            Err(DecodeError::UnknownToken { .. })
        ));
    }
}
