//! In-memory storage backend.
//!
//! Stores the event log, block headers, snapshots and the latest published
//! view in RAM. Useful for testing and short-lived indexers that don't need
//! persistence.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use defindex_core::error::IndexerError;
use defindex_core::event::DomainEvent;
use defindex_core::query::StateView;
use defindex_core::snapshot::StateSnapshot;
use defindex_core::store::{EventLog, SnapshotStore, StateSink};
use defindex_core::types::{BlockSummary, EventId};

/// A log entry plus its canonical/orphaned flag.
#[derive(Debug, Clone)]
struct Logged<T> {
    item: T,
    orphaned: bool,
}

/// In-memory indexer storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    events: Mutex<BTreeMap<EventId, Logged<DomainEvent>>>,
    blocks: Mutex<BTreeMap<u64, Logged<BlockSummary>>>,
    snapshots: Mutex<BTreeMap<u64, StateSnapshot>>,
    current: Mutex<Option<StateView>>,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, IndexerError> {
    m.lock()
        .map_err(|e| IndexerError::Storage(format!("memory store lock poisoned: {e}")))
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of logged events, orphaned ones included.
    pub fn event_count(&self) -> usize {
        lock(&self.events).map(|e| e.len()).unwrap_or(0)
    }

    /// Number of orphaned events.
    pub fn orphaned_count(&self) -> usize {
        lock(&self.events)
            .map(|e| e.values().filter(|l| l.orphaned).count())
            .unwrap_or(0)
    }

    /// Number of stored snapshots.
    pub fn snapshot_count(&self) -> usize {
        lock(&self.snapshots).map(|s| s.len()).unwrap_or(0)
    }

    /// The view last written through [`StateSink`].
    pub fn current_state(&self) -> Option<StateView> {
        lock(&self.current).ok().and_then(|c| c.clone())
    }
}

#[async_trait]
impl EventLog for InMemoryStorage {
    async fn append_blocks(&self, blocks: &[BlockSummary]) -> Result<(), IndexerError> {
        let mut stored = lock(&self.blocks)?;
        for block in blocks {
            match stored.get(&block.number) {
                Some(existing) if !existing.orphaned => {}
                _ => {
                    stored.insert(
                        block.number,
                        Logged {
                            item: block.clone(),
                            orphaned: false,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn append_events(&self, events: &[DomainEvent]) -> Result<(), IndexerError> {
        let mut stored = lock(&self.events)?;
        for event in events {
            match stored.get(&event.id) {
                Some(existing) if !existing.orphaned => {}
                _ => {
                    stored.insert(
                        event.id.clone(),
                        Logged {
                            item: event.clone(),
                            orphaned: false,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn events_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<DomainEvent>, IndexerError> {
        let stored = lock(&self.events)?;
        let mut events: Vec<DomainEvent> = stored
            .values()
            .filter(|l| !l.orphaned && (from..=to).contains(&l.item.block_number))
            .map(|l| l.item.clone())
            .collect();
        events.sort_by_key(|e| e.position());
        Ok(events)
    }

    async fn blocks_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<BlockSummary>, IndexerError> {
        if from > to {
            return Ok(vec![]);
        }
        let stored = lock(&self.blocks)?;
        Ok(stored
            .range(from..=to)
            .filter(|(_, l)| !l.orphaned)
            .map(|(_, l)| l.item.clone())
            .collect())
    }

    async fn orphan_from(&self, height: u64) -> Result<u64, IndexerError> {
        let mut orphaned = 0;
        for logged in lock(&self.events)?.values_mut() {
            if !logged.orphaned && logged.item.block_number >= height {
                logged.orphaned = true;
                orphaned += 1;
            }
        }
        for (_, logged) in lock(&self.blocks)?.range_mut(height..) {
            logged.orphaned = true;
        }
        tracing::debug!(height, orphaned, "Orphaned log entries");
        Ok(orphaned)
    }
}

#[async_trait]
impl SnapshotStore for InMemoryStorage {
    async fn save_snapshot(&self, snapshot: &StateSnapshot) -> Result<(), IndexerError> {
        lock(&self.snapshots)?.insert(snapshot.block_number, snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot_below(
        &self,
        height: u64,
    ) -> Result<Option<StateSnapshot>, IndexerError> {
        Ok(lock(&self.snapshots)?
            .range(..height)
            .next_back()
            .map(|(_, s)| s.clone()))
    }

    async fn prune_snapshots_from(&self, height: u64) -> Result<u64, IndexerError> {
        let mut snapshots = lock(&self.snapshots)?;
        let removed = snapshots.split_off(&height);
        Ok(removed.len() as u64)
    }

    async fn retain_snapshots(&self, keep: usize) -> Result<(), IndexerError> {
        let mut snapshots = lock(&self.snapshots)?;
        while snapshots.len() > keep {
            snapshots.pop_first();
        }
        Ok(())
    }
}

#[async_trait]
impl StateSink for InMemoryStorage {
    async fn write_current_state(&self, view: &StateView) -> Result<(), IndexerError> {
        *lock(&self.current)? = Some(view.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use defindex_core::aggregator::AggregateState;
    use defindex_core::config::AggregatorConfig;
    use defindex_core::event::{EventPayload, TokenAmount};
    use defindex_core::types::ProtocolId;
    use rust_decimal_macros::dec;

    fn ev(block: u64, log_index: u32) -> DomainEvent {
        DomainEvent {
            id: EventId::new(format!("0x{block:x}"), log_index),
            protocol: ProtocolId::Dex,
            contract: "0xpool".into(),
            block_number: block,
            block_hash: format!("0xb{block}"),
            timestamp: block as i64 * 12,
            wallet: "0xw".into(),
            payload: EventPayload::Deposit {
                asset: TokenAmount::new("USDC", dec!(1)),
            },
        }
    }

    fn block(number: u64, hash: &str) -> BlockSummary {
        BlockSummary {
            number,
            hash: hash.into(),
            parent_hash: format!("0x{}", number.saturating_sub(1)),
            timestamp: number as i64 * 12,
            tx_count: 1,
            base_fee_per_gas: None,
        }
    }

    fn snapshot(block_number: u64) -> StateSnapshot {
        StateSnapshot {
            block_number,
            block_hash: format!("0x{block_number}"),
            taken_at: 0,
            state: AggregateState::new(&AggregatorConfig::default()),
        }
    }

    #[tokio::test]
    async fn events_come_back_in_chain_order() {
        let store = InMemoryStorage::new();
        store
            .append_events(&[ev(101, 0), ev(100, 5), ev(100, 2)])
            .await
            .unwrap();
        let events = store.events_in_range(100, 101).await.unwrap();
        let positions: Vec<_> = events.iter().map(|e| (e.block_number, e.id.log_index)).collect();
        assert_eq!(positions, vec![(100, 2), (100, 5), (101, 0)]);
    }

    #[tokio::test]
    async fn appending_twice_is_a_noop() {
        let store = InMemoryStorage::new();
        store.append_events(&[ev(100, 0)]).await.unwrap();
        store.append_events(&[ev(100, 0)]).await.unwrap();
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn orphaned_entries_are_kept_but_hidden() {
        let store = InMemoryStorage::new();
        for i in 100..=105 {
            store.append_events(&[ev(i, 0)]).await.unwrap();
            store.append_blocks(&[block(i, &format!("0x{i}"))]).await.unwrap();
        }
        assert_eq!(store.orphan_from(103).await.unwrap(), 3);

        assert_eq!(store.event_count(), 6);
        assert_eq!(store.orphaned_count(), 3);
        assert_eq!(store.events_in_range(0, 200).await.unwrap().len(), 3);
        assert_eq!(store.blocks_in_range(100, 110).await.unwrap().len(), 3);

        // A replacement block at 103 becomes canonical.
        store.append_blocks(&[block(103, "0x103b")]).await.unwrap();
        let blocks = store.blocks_in_range(103, 103).await.unwrap();
        assert_eq!(blocks[0].hash, "0x103b");
    }

    #[tokio::test]
    async fn snapshot_lookup_and_pruning() {
        let store = InMemoryStorage::new();
        for h in [100, 200, 300] {
            store.save_snapshot(&snapshot(h)).await.unwrap();
        }
        let below = store.latest_snapshot_below(250).await.unwrap().unwrap();
        assert_eq!(below.block_number, 200);
        assert!(store.latest_snapshot_below(100).await.unwrap().is_none());

        assert_eq!(store.prune_snapshots_from(200).await.unwrap(), 2);
        assert_eq!(store.latest_snapshot().await.unwrap().unwrap().block_number, 100);

        store.save_snapshot(&snapshot(400)).await.unwrap();
        store.retain_snapshots(1).await.unwrap();
        assert_eq!(store.snapshot_count(), 1);
    }
}
