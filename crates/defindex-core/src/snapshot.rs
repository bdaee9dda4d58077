//! Snapshot manager: persists aggregate state for rewinds and crash
//! recovery.
//!
//! A snapshot stores the full [`AggregateState`] as of the end of a block.
//! On restart, or when a reorg forks at height H, the index loop restores
//! the newest snapshot below H and replays the event log from there.
//!
//! A failed write never replaces the last good snapshot; the manager keeps
//! the snapshot due and tries again on the next block.

use serde::{Deserialize, Serialize};

use crate::aggregator::AggregateState;
use crate::error::IndexerError;
use crate::store::SnapshotStore;

/// Aggregate state as of the end of `block_number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub block_number: u64,
    pub block_hash: String,
    /// Wall-clock time the snapshot was taken (Unix seconds).
    pub taken_at: i64,
    pub state: AggregateState,
}

/// Decides when to snapshot and writes snapshots through a [`SnapshotStore`].
pub struct SnapshotManager {
    /// Snapshot every N blocks.
    interval: u64,
    /// Snapshots kept after each successful write.
    retention: usize,
    /// Block of the last successful snapshot.
    last_block: Option<u64>,
    /// A write failed and should be retried.
    pending: bool,
}

impl SnapshotManager {
    pub fn new(interval: u64, retention: usize) -> Self {
        Self {
            interval: interval.max(1),
            retention: retention.max(1),
            last_block: None,
            pending: false,
        }
    }

    /// Reset the schedule after a restore or rewind.
    pub fn reset_to(&mut self, block_number: Option<u64>) {
        self.last_block = block_number;
        self.pending = false;
    }

    pub fn last_block(&self) -> Option<u64> {
        self.last_block
    }

    /// Returns `true` if a snapshot should be taken at `block_number`.
    pub fn is_due(&self, block_number: u64) -> bool {
        self.pending
            || match self.last_block {
                Some(last) => block_number >= last + self.interval,
                None => true,
            }
    }

    /// Snapshot `state` at the end of `block_number` if one is due.
    ///
    /// Returns `Ok(true)` when a snapshot was written. A failed write is
    /// reported as `SnapshotWrite` and retried at the next call.
    pub async fn maybe_snapshot<S: SnapshotStore + ?Sized>(
        &mut self,
        store: &S,
        block_number: u64,
        block_hash: &str,
        state: &AggregateState,
    ) -> Result<bool, IndexerError> {
        if !self.is_due(block_number) {
            return Ok(false);
        }
        self.force_snapshot(store, block_number, block_hash, state)
            .await
            .map(|()| true)
    }

    /// Write a snapshot now.
    pub async fn force_snapshot<S: SnapshotStore + ?Sized>(
        &mut self,
        store: &S,
        block_number: u64,
        block_hash: &str,
        state: &AggregateState,
    ) -> Result<(), IndexerError> {
        let snapshot = StateSnapshot {
            block_number,
            block_hash: block_hash.to_string(),
            taken_at: chrono::Utc::now().timestamp(),
            state: state.clone(),
        };
        if let Err(e) = store.save_snapshot(&snapshot).await {
            self.pending = true;
            return Err(IndexerError::SnapshotWrite {
                block_number,
                reason: e.to_string(),
            });
        }
        self.last_block = Some(block_number);
        self.pending = false;
        tracing::debug!(block = block_number, "Snapshot saved");

        if let Err(e) = store.retain_snapshots(self.retention).await {
            tracing::warn!(error = %e, "Snapshot pruning failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggregatorConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct VecStore {
        snapshots: Mutex<Vec<StateSnapshot>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl SnapshotStore for VecStore {
        async fn save_snapshot(&self, snapshot: &StateSnapshot) -> Result<(), IndexerError> {
            if *self.fail.lock().unwrap() {
                return Err(IndexerError::Storage("disk full".into()));
            }
            self.snapshots.lock().unwrap().push(snapshot.clone());
            Ok(())
        }

        async fn latest_snapshot_below(
            &self,
            height: u64,
        ) -> Result<Option<StateSnapshot>, IndexerError> {
            Ok(self
                .snapshots
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.block_number < height)
                .max_by_key(|s| s.block_number)
                .cloned())
        }

        async fn prune_snapshots_from(&self, height: u64) -> Result<u64, IndexerError> {
            let mut snaps = self.snapshots.lock().unwrap();
            let before = snaps.len();
            snaps.retain(|s| s.block_number < height);
            Ok((before - snaps.len()) as u64)
        }

        async fn retain_snapshots(&self, keep: usize) -> Result<(), IndexerError> {
            let mut snaps = self.snapshots.lock().unwrap();
            let excess = snaps.len().saturating_sub(keep);
            snaps.drain(..excess);
            Ok(())
        }
    }

    fn state() -> AggregateState {
        AggregateState::new(&AggregatorConfig::default())
    }

    #[tokio::test]
    async fn snapshots_on_interval() {
        let store = VecStore::default();
        let mut mgr = SnapshotManager::new(5, 10);
        mgr.reset_to(Some(100));

        for block in 101..=104 {
            assert!(!mgr.maybe_snapshot(&store, block, "0xh", &state()).await.unwrap());
        }
        assert!(mgr.maybe_snapshot(&store, 105, "0xh105", &state()).await.unwrap());

        let latest = store.latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.block_number, 105);
        assert_eq!(latest.block_hash, "0xh105");
    }

    #[tokio::test]
    async fn failed_write_keeps_last_good_and_retries() {
        let store = VecStore::default();
        let mut mgr = SnapshotManager::new(1, 10);
        mgr.maybe_snapshot(&store, 1, "0x1", &state()).await.unwrap();

        *store.fail.lock().unwrap() = true;
        let err = mgr.maybe_snapshot(&store, 2, "0x2", &state()).await.unwrap_err();
        assert!(matches!(err, IndexerError::SnapshotWrite { block_number: 2, .. }));
        assert_eq!(store.latest_snapshot().await.unwrap().unwrap().block_number, 1);
        assert!(mgr.is_due(2));

        *store.fail.lock().unwrap() = false;
        assert!(mgr.maybe_snapshot(&store, 3, "0x3", &state()).await.unwrap());
        assert_eq!(mgr.last_block(), Some(3));
    }

    #[tokio::test]
    async fn retention_drops_oldest() {
        let store = VecStore::default();
        let mut mgr = SnapshotManager::new(1, 2);
        for block in 1..=4 {
            mgr.maybe_snapshot(&store, block, "0xh", &state()).await.unwrap();
        }
        assert_eq!(store.snapshots.lock().unwrap().len(), 2);
        assert!(store.latest_snapshot_below(3).await.unwrap().is_none());
    }
}
