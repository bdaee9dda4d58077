//! Event ABIs of the tracked protocols and conversions from ABI values.
//!
//! Fixed-shape events are declared with `sol!` and decoded through
//! [`SolEvent`]. Events whose shape depends on configuration (stableswap
//! liquidity events are sized by the pool's coin count) go through
//! [`DynSolEvent`].

use alloy_dyn_abi::{DecodedEvent, DynSolEvent};
use alloy_primitives::{keccak256, Address, B256, I256, U256};
use alloy_sol_types::{SolEvent, TopicList};
use rust_decimal::Decimal;

use defindex_core::error::DecodeError;

use crate::fetcher::RawLog;

/// Concentrated-liquidity pool manager.
pub mod dex {
    alloy_sol_types::sol! {
        #[derive(Debug, PartialEq, Eq)]
        event Swap(
            bytes32 indexed id,
            address indexed sender,
            int128 amount0,
            int128 amount1,
            uint160 sqrt_price_x96,
            uint128 liquidity,
            int24 tick,
            uint24 fee
        );

        #[derive(Debug, PartialEq, Eq)]
        event LiquidityAdded(bytes32 indexed id, address indexed provider, uint256 amount0, uint256 amount1);

        #[derive(Debug, PartialEq, Eq)]
        event LiquidityRemoved(bytes32 indexed id, address indexed provider, uint256 amount0, uint256 amount1);
    }
}

/// Pooled lending market.
pub mod lending {
    alloy_sol_types::sol! {
        #[derive(Debug, PartialEq, Eq)]
        event Supply(
            address indexed reserve,
            address user,
            address indexed on_behalf_of,
            uint256 amount,
            uint16 indexed referral_code
        );

        #[derive(Debug, PartialEq, Eq)]
        event Withdraw(address indexed reserve, address indexed user, address indexed to, uint256 amount);

        #[derive(Debug, PartialEq, Eq)]
        event Borrow(
            address indexed reserve,
            address user,
            address indexed on_behalf_of,
            uint256 amount,
            uint8 interest_rate_mode,
            uint256 borrow_rate,
            uint16 indexed referral_code
        );

        #[derive(Debug, PartialEq, Eq)]
        event Repay(
            address indexed reserve,
            address indexed user,
            address indexed repayer,
            uint256 amount,
            bool use_a_tokens
        );

        #[derive(Debug, PartialEq, Eq)]
        event LiquidationCall(
            address indexed collateral_asset,
            address indexed debt_asset,
            address indexed user,
            uint256 debt_to_cover,
            uint256 liquidated_collateral_amount,
            address liquidator,
            bool receive_a_token
        );
    }
}

/// Liquid staking.
pub mod staking {
    alloy_sol_types::sol! {
        #[derive(Debug, PartialEq, Eq)]
        event Submitted(address indexed sender, uint256 amount, address referral);

        #[derive(Debug, PartialEq, Eq)]
        event WithdrawalRequested(
            uint256 indexed request_id,
            address indexed requestor,
            address indexed owner,
            uint256 amount_of_steth,
            uint256 amount_of_shares
        );
    }
}

/// Stableswap pools. Liquidity events are sized per pool, see
/// [`crate::decoder::stableswap`].
pub mod stableswap {
    alloy_sol_types::sol! {
        #[derive(Debug, PartialEq, Eq)]
        event TokenExchange(
            address indexed buyer,
            int128 sold_id,
            uint256 tokens_sold,
            int128 bought_id,
            uint256 tokens_bought
        );
    }
}

/// Vault core and liquidation module.
pub mod cdp {
    alloy_sol_types::sol! {
        #[derive(Debug, PartialEq, Eq)]
        event Frob(bytes32 indexed ilk, address indexed urn, int256 dink, int256 dart);

        #[derive(Debug, PartialEq, Eq)]
        event Bark(
            bytes32 indexed ilk,
            address indexed urn,
            uint256 ink,
            uint256 art,
            uint256 due,
            address clip,
            uint256 indexed id
        );
    }
}

// ─── Topics ───────────────────────────────────────────────────────────────────

/// Lowercase `0x…` hex of any 20- or 32-byte value.
pub fn hex_string(bytes: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// `topic0` for an event signature such as `"Transfer(address,address,uint256)"`.
pub fn event_topic(signature: &str) -> String {
    hex_string(keccak256(signature.as_bytes()))
}

/// `topic0` of a `sol!` event.
pub fn topic_of<E: SolEvent>() -> String {
    hex_string(E::SIGNATURE_HASH)
}

pub fn topic0(log: &RawLog) -> Option<String> {
    log.topics.first().map(|t| t.to_ascii_lowercase())
}

// ─── Decoding ─────────────────────────────────────────────────────────────────

fn parse_topics(log: &RawLog) -> Result<Vec<B256>, DecodeError> {
    log.topics
        .iter()
        .enumerate()
        .map(|(index, t)| {
            t.parse::<B256>().map_err(|_| DecodeError::MalformedLog {
                reason: format!("topic {index} is not a 32-byte word"),
            })
        })
        .collect()
}

fn parse_data(log: &RawLog) -> Result<Vec<u8>, DecodeError> {
    let raw = log.data.strip_prefix("0x").unwrap_or(&log.data);
    hex::decode(raw).map_err(|e| DecodeError::MalformedLog {
        reason: format!("data is not hex: {e}"),
    })
}

/// Decode a log as the typed event `E`.
pub fn decode_log<E: SolEvent>(log: &RawLog) -> Result<E, DecodeError> {
    let topics = parse_topics(log)?;
    let expected = <E::TopicList as TopicList>::COUNT;
    if topics.len() < expected {
        return Err(DecodeError::MissingTopic {
            index: topics.len(),
        });
    }
    let data = parse_data(log)?;
    E::decode_raw_log(topics, &data, true).map_err(|e| DecodeError::MalformedLog {
        reason: format!("{}: {e}", E::SIGNATURE),
    })
}

/// Decode a log against a runtime event shape.
pub fn decode_dyn(event: &DynSolEvent, signature: &str, log: &RawLog) -> Result<DecodedEvent, DecodeError> {
    let topics = parse_topics(log)?;
    let data = parse_data(log)?;
    event
        .decode_log_parts(topics, &data, true)
        .map_err(|e| DecodeError::MalformedLog {
            reason: format!("{signature}: {e}"),
        })
}

// ─── Value conversions ────────────────────────────────────────────────────────

pub fn address(a: &Address) -> String {
    hex_string(a)
}

/// Left-aligned, zero-padded ASCII identifier such as a CDP ilk (`"ETH-A"`).
pub fn short_string(word: &B256) -> Result<String, DecodeError> {
    let end = word.iter().position(|b| *b == 0).unwrap_or(32);
    std::str::from_utf8(&word[..end])
        .map(str::to_owned)
        .map_err(|_| DecodeError::MalformedLog {
            reason: "identifier is not utf-8".into(),
        })
}

/// Unsigned integer scaled down by `decimals`.
pub fn u256_to_decimal(value: U256, decimals: u32, field: &str) -> Result<Decimal, DecodeError> {
    let raw = u128::try_from(value).map_err(|_| overflow(field))?;
    let raw = i128::try_from(raw).map_err(|_| overflow(field))?;
    scaled(raw, decimals, field)
}

/// Signed integer scaled down by `decimals`.
pub fn i256_to_decimal(value: I256, decimals: u32, field: &str) -> Result<Decimal, DecodeError> {
    let raw = i128::try_from(value).map_err(|_| overflow(field))?;
    scaled(raw, decimals, field)
}

pub fn i128_to_decimal(value: i128, decimals: u32, field: &str) -> Result<Decimal, DecodeError> {
    scaled(value, decimals, field)
}

fn scaled(raw: i128, decimals: u32, field: &str) -> Result<Decimal, DecodeError> {
    Decimal::try_from_i128_with_scale(raw, decimals)
        .map(|d| d.normalize())
        .map_err(|_| overflow(field))
}

fn overflow(field: &str) -> DecodeError {
    DecodeError::AmountOverflow {
        field: field.to_string(),
    }
}

// ─── Encoding ─────────────────────────────────────────────────────────────────

/// Hex `topics` and `data` of an event, as they appear in a JSON-RPC log.
pub fn encode_log<E: SolEvent>(event: &E) -> (Vec<String>, String) {
    let log = event.encode_log_data();
    let topics = log.topics().iter().map(hex_string).collect();
    (topics, hex_string(&log.data))
}

/// A 32-byte topic holding an address.
pub fn address_topic(a: Address) -> String {
    hex_string(a.into_word())
}
