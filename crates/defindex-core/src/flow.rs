//! Cross-protocol capital-flow detection.
//!
//! Each wallet keeps a short, time-bounded buffer of its latest events. When
//! a new event arrives, the most recent buffered event from a *different*
//! protocol inside the flow window is its only pairing candidate
//! (nearest-neighbour, pairwise). A buffered event can be the source of at
//! most one flow.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::FlowConfig;
use crate::event::{DomainEvent, EventKind};
use crate::types::{EventId, ProtocolId};

/// Inferred intent behind a capital flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Arbitrage,
    YieldSeeking,
    Rebalancing,
}

impl std::fmt::Display for FlowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Arbitrage => write!(f, "arbitrage"),
            Self::YieldSeeking => write!(f, "yield-seeking"),
            Self::Rebalancing => write!(f, "rebalancing"),
        }
    }
}

/// A detected movement of value by one wallet from one protocol to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapitalFlow {
    pub wallet: String,
    pub from_protocol: ProtocolId,
    pub to_protocol: ProtocolId,
    pub from_event: EventId,
    pub to_event: EventId,
    /// Token and amount of the destination event's primary leg.
    pub token: String,
    pub amount: Decimal,
    pub amount_usd: Option<Decimal>,
    pub time_delta_secs: i64,
    pub flow_type: FlowType,
    pub block_number: u64,
    pub timestamp: i64,
}

impl CapitalFlow {
    /// Dedup key: one flow per (source, destination) event pair.
    pub fn key(&self) -> (EventId, EventId) {
        (self.from_event.clone(), self.to_event.clone())
    }
}

/// Classify a flow from the kinds of its two events and their distance.
pub fn classify(from: EventKind, to: EventKind, delta_secs: i64, config: &FlowConfig) -> FlowType {
    if from == EventKind::Swap && to == EventKind::Swap && delta_secs <= config.arbitrage_max_secs {
        FlowType::Arbitrage
    } else if to.is_yield_entry() {
        FlowType::YieldSeeking
    } else {
        FlowType::Rebalancing
    }
}

/// What the buffer remembers about a past event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedEvent {
    pub id: EventId,
    pub protocol: ProtocolId,
    pub kind: EventKind,
    pub timestamp: i64,
    /// Already used as the source of a flow.
    pub paired: bool,
}

/// Bounded recent-event buffer for one wallet (oldest first).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBuffer {
    events: VecDeque<BufferedEvent>,
}

impl WalletBuffer {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Timestamp of the newest buffered event.
    pub fn last_timestamp(&self) -> Option<i64> {
        self.events.back().map(|e| e.timestamp)
    }

    /// Push `event` and return the flow it completes, if any.
    pub fn observe(
        &mut self,
        event: &DomainEvent,
        usd: Option<Decimal>,
        config: &FlowConfig,
        max_len: usize,
    ) -> Option<CapitalFlow> {
        let cutoff = event.timestamp - config.window_secs;
        while self.events.front().is_some_and(|e| e.timestamp < cutoff) {
            self.events.pop_front();
        }

        let flow = self
            .events
            .iter_mut()
            .rev()
            .find(|b| b.protocol != event.protocol)
            .filter(|b| !b.paired)
            .and_then(|source| {
                let primary = event.primary_amount()?;
                source.paired = true;
                let delta = event.timestamp - source.timestamp;
                Some(CapitalFlow {
                    wallet: event.wallet.clone(),
                    from_protocol: source.protocol,
                    to_protocol: event.protocol,
                    from_event: source.id.clone(),
                    to_event: event.id.clone(),
                    token: primary.token.clone(),
                    amount: primary.amount.abs(),
                    amount_usd: usd,
                    time_delta_secs: delta,
                    flow_type: classify(source.kind, event.kind(), delta, config),
                    block_number: event.block_number,
                    timestamp: event.timestamp,
                })
            });

        self.events.push_back(BufferedEvent {
            id: event.id.clone(),
            protocol: event.protocol,
            kind: event.kind(),
            timestamp: event.timestamp,
            paired: false,
        });
        while self.events.len() > max_len {
            self.events.pop_front();
        }

        flow
    }
}
