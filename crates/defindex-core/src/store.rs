//! Storage traits for the canonical event log, snapshots and current state.
//!
//! Implementations live in `defindex-storage` (`InMemoryStorage`, and
//! `SqliteStorage` behind the `sqlite` feature).

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::event::DomainEvent;
use crate::query::StateView;
use crate::snapshot::StateSnapshot;
use crate::types::BlockSummary;

/// Durable canonical log of blocks and decoded events.
///
/// Entries are never deleted: a reorg marks everything at or above the fork
/// height as orphaned. Re-appending an id whose entry is orphaned makes it
/// canonical again with the new content; re-appending a canonical id is a
/// no-op.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append_blocks(&self, blocks: &[BlockSummary]) -> Result<(), IndexerError>;

    async fn append_events(&self, events: &[DomainEvent]) -> Result<(), IndexerError>;

    /// Canonical events with `from <= block_number <= to`, in chain order.
    async fn events_in_range(&self, from: u64, to: u64)
        -> Result<Vec<DomainEvent>, IndexerError>;

    /// Canonical block headers with `from <= number <= to`, ascending.
    async fn blocks_in_range(&self, from: u64, to: u64)
        -> Result<Vec<BlockSummary>, IndexerError>;

    /// Mark every canonical block and event with `block_number >= height`
    /// as orphaned. Returns the number of events orphaned.
    async fn orphan_from(&self, height: u64) -> Result<u64, IndexerError>;
}

/// Aggregate-state snapshots keyed by block height.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Upsert a snapshot at `snapshot.block_number`.
    async fn save_snapshot(&self, snapshot: &StateSnapshot) -> Result<(), IndexerError>;

    /// Newest snapshot with `block_number < height`.
    async fn latest_snapshot_below(
        &self,
        height: u64,
    ) -> Result<Option<StateSnapshot>, IndexerError>;

    /// Newest snapshot overall.
    async fn latest_snapshot(&self) -> Result<Option<StateSnapshot>, IndexerError> {
        self.latest_snapshot_below(u64::MAX).await
    }

    /// Delete snapshots with `block_number >= height`.
    async fn prune_snapshots_from(&self, height: u64) -> Result<u64, IndexerError>;

    /// Keep only the newest `keep` snapshots.
    async fn retain_snapshots(&self, keep: usize) -> Result<(), IndexerError>;
}

/// Current-state tables mirrored from each published view.
#[async_trait]
pub trait StateSink: Send + Sync {
    async fn write_current_state(&self, view: &StateView) -> Result<(), IndexerError>;
}

/// Everything the index loop needs from a storage backend.
pub trait IndexStore: EventLog + SnapshotStore + StateSink {}

impl<T: EventLog + SnapshotStore + StateSink> IndexStore for T {}
