//! Protocol decoders: raw EVM logs → [`DomainEvent`]s.
//!
//! Every decoder is a pure function of its configuration and one log. A
//! decoder returns `Ok(None)` for logs it does not care about and a
//! [`DecodeError`] for logs it recognizes but cannot decode.

pub mod cdp;
pub mod dex;
pub mod lending;
pub mod stableswap;
pub mod staking;

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use defindex_core::error::{DecodeError, IndexerError};
use defindex_core::event::{DomainEvent, EventPayload, TokenAmount};
use defindex_core::types::{EventFilter, EventId, ProtocolId};

use crate::fetcher::RawLog;

pub use cdp::{CdpConfig, CdpDecoder, IlkConfig};
pub use dex::{DexConfig, DexDecoder, DexPoolConfig};
pub use lending::{LendingConfig, LendingDecoder};
pub use stableswap::{StablePoolConfig, StableswapConfig, StableswapDecoder};
pub use staking::{StakingConfig, StakingDecoder};

/// Turns raw logs of one protocol into domain events.
pub trait ProtocolDecoder: Send + Sync {
    fn protocol(&self) -> ProtocolId;

    /// Contract addresses and topic0 values this decoder understands.
    fn filter(&self) -> EventFilter;

    fn decode(&self, log: &RawLog) -> Result<Option<DomainEvent>, DecodeError>;
}

// ─── Configuration ────────────────────────────────────────────────────────────

/// Token metadata used for unit conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u32,
}

impl TokenInfo {
    pub fn new(symbol: impl Into<String>, decimals: u32) -> Self {
        Self {
            symbol: symbol.into(),
            decimals,
        }
    }

    fn validate(&self, context: &str) -> Result<(), IndexerError> {
        if self.symbol.is_empty() {
            return Err(IndexerError::Config(format!("{context}: empty token symbol")));
        }
        if self.decimals > 28 {
            return Err(IndexerError::Config(format!(
                "{context}: {} has {} decimals, at most 28 supported",
                self.symbol, self.decimals
            )));
        }
        Ok(())
    }
}

/// Contract addresses and token metadata for every tracked protocol.
/// Protocols left out are not indexed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolsConfig {
    pub dex: Option<DexConfig>,
    pub lending: Option<LendingConfig>,
    pub staking: Option<StakingConfig>,
    pub stableswap: Option<StableswapConfig>,
    pub cdp: Option<CdpConfig>,
}

impl ProtocolsConfig {
    pub fn validate(&self) -> Result<(), IndexerError> {
        if let Some(dex) = &self.dex {
            for (id, pool) in &dex.pools {
                pool.currency0.validate(&format!("dex pool {id}"))?;
                pool.currency1.validate(&format!("dex pool {id}"))?;
            }
        }
        if let Some(lending) = &self.lending {
            for (reserve, token) in &lending.reserves {
                token.validate(&format!("lending reserve {reserve}"))?;
            }
        }
        if let Some(staking) = &self.staking {
            staking.token.validate("staking")?;
            if staking.assets_per_share <= Decimal::ZERO {
                return Err(IndexerError::Config(
                    "staking.assets_per_share must be > 0".into(),
                ));
            }
        }
        if let Some(stableswap) = &self.stableswap {
            for (address, pool) in &stableswap.pools {
                if pool.coins.len() < 2 {
                    return Err(IndexerError::Config(format!(
                        "stableswap pool {address} needs at least 2 coins"
                    )));
                }
                for coin in &pool.coins {
                    coin.validate(&format!("stableswap pool {address}"))?;
                }
            }
        }
        if let Some(cdp) = &self.cdp {
            cdp.debt_token.validate("cdp debt token")?;
            for (ilk, cfg) in &cdp.ilks {
                cfg.collateral.validate(&format!("cdp ilk {ilk}"))?;
                if cfg.rate <= Decimal::ZERO {
                    return Err(IndexerError::Config(format!("cdp ilk {ilk}: rate must be > 0")));
                }
            }
        }
        Ok(())
    }
}

// ─── DecoderSet ───────────────────────────────────────────────────────────────

/// The decoders enabled by a [`ProtocolsConfig`].
#[derive(Clone, Default)]
pub struct DecoderSet {
    decoders: Vec<Arc<dyn ProtocolDecoder>>,
}

impl DecoderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ProtocolsConfig) -> Result<Self, IndexerError> {
        config.validate()?;
        let mut set = Self::new();
        if let Some(c) = &config.dex {
            set = set.with(DexDecoder::new(c.clone()));
        }
        if let Some(c) = &config.lending {
            set = set.with(LendingDecoder::new(c.clone()));
        }
        if let Some(c) = &config.staking {
            set = set.with(StakingDecoder::new(c.clone()));
        }
        if let Some(c) = &config.stableswap {
            set = set.with(StableswapDecoder::new(c.clone()));
        }
        if let Some(c) = &config.cdp {
            set = set.with(CdpDecoder::new(c.clone()));
        }
        Ok(set)
    }

    pub fn with(mut self, decoder: impl ProtocolDecoder + 'static) -> Self {
        self.decoders.push(Arc::new(decoder));
        self
    }

    pub fn decoders(&self) -> &[Arc<dyn ProtocolDecoder>] {
        &self.decoders
    }

    pub fn protocols(&self) -> Vec<ProtocolId> {
        self.decoders.iter().map(|d| d.protocol()).collect()
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

// ─── Shared helpers ───────────────────────────────────────────────────────────

/// Build a domain event from the log's position fields.
pub(crate) fn build_event(
    protocol: ProtocolId,
    log: &RawLog,
    wallet: String,
    payload: EventPayload,
) -> Result<DomainEvent, DecodeError> {
    Ok(DomainEvent {
        id: EventId::new(log.tx_hash.to_ascii_lowercase(), log.log_index_u32()?),
        protocol,
        contract: log.address.to_ascii_lowercase(),
        block_number: log.block_number_u64()?,
        block_hash: log.block_hash.to_ascii_lowercase(),
        timestamp: log.timestamp()?,
        wallet,
        payload,
    })
}

pub(crate) fn amount(token: &TokenInfo, value: Decimal) -> TokenAmount {
    TokenAmount::new(token.symbol.clone(), value)
}

/// Lookup table keyed by lowercase address or id.
pub(crate) fn lowercase_keys<V: Clone>(map: &BTreeMap<String, V>) -> BTreeMap<String, V> {
    map.iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect()
}
