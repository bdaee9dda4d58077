//! Per-wallet activity used for whale classification.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::event::DomainEvent;
use crate::types::{EventId, ProtocolId};

/// Aggregate activity of one wallet across all protocols.
///
/// Whether the wallet is a whale is not stored; see [`WhaleActivity::is_whale`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhaleActivity {
    pub wallet: String,
    pub protocols: BTreeSet<ProtocolId>,
    pub tx_count: u64,
    pub total_volume_usd: Decimal,
    pub largest_tx_usd: Decimal,
    pub largest_tx: Option<EventId>,
    pub first_active: i64,
    pub last_active: i64,
    pub cross_protocol_moves: u64,
}

impl WhaleActivity {
    pub fn new(wallet: impl Into<String>, first_active: i64) -> Self {
        Self {
            wallet: wallet.into(),
            protocols: BTreeSet::new(),
            tx_count: 0,
            total_volume_usd: Decimal::ZERO,
            largest_tx_usd: Decimal::ZERO,
            largest_tx: None,
            first_active,
            last_active: first_active,
            cross_protocol_moves: 0,
        }
    }

    /// Fold one event. `volume_usd` is `None` when the event could not be valued.
    pub fn record(&mut self, event: &DomainEvent, volume_usd: Option<Decimal>) {
        self.protocols.insert(event.protocol);
        self.tx_count += 1;
        self.last_active = self.last_active.max(event.timestamp);

        if let Some(volume) = volume_usd {
            self.total_volume_usd = self.total_volume_usd.saturating_add(volume);
            if volume > self.largest_tx_usd {
                self.largest_tx_usd = volume;
                self.largest_tx = Some(event.id.clone());
            }
        }
    }

    /// Whale predicate, evaluated at read time against the configured threshold.
    pub fn is_whale(&self, threshold_usd: Decimal) -> bool {
        self.total_volume_usd >= threshold_usd
    }
}
