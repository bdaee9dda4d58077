//! The index loop: drives the decode pipeline into the aggregation engine
//! and handles chain reorganizations.
//!
//! # Following
//! Each cycle reads the source head, checks the recorded head block is
//! still canonical, then streams decoded batches for
//! `[cursor, head - confirmation_depth]` through the engine. Per block:
//! verify parent hash → observe header → apply events → advance cursor →
//! snapshot if due. Each batch is appended to the event log before it is
//! applied and ends with a new published view.
//!
//! # ReorgDetected → Rewinding → Replaying
//! In-flight fetches are cancelled and the fork height H is confirmed by
//! walking the tracked window back against the source. The engine is
//! restored from the newest snapshot below H (or reset), the logged blocks
//! and events between that snapshot and H are re-applied, and log entries
//! and snapshots at or above H are discarded. Blocks from H onwards are then
//! refetched through the normal path until the loop is caught up again.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use defindex_core::aggregator::AggregationEngine;
use defindex_core::cursor::Cursor;
use defindex_core::error::IndexerError;
use defindex_core::event::DomainEvent;
use defindex_core::indexer::{IndexerConfig, IndexerState};
use defindex_core::query::ViewHandle;
use defindex_core::reorg::{ReorgDetector, ReorgEvent, ReorgType};
use defindex_core::snapshot::SnapshotManager;
use defindex_core::store::IndexStore;
use defindex_core::tracker::BlockTracker;
use defindex_core::types::BlockSummary;

use crate::pipeline::{split_range, DecodePipeline, DecodedBatch};

/// Consecutive inconsistent fetches tolerated before giving up a cycle.
const MAX_REFETCHES: u32 = 3;

/// Status emitted by the index loop for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexLoopEvent {
    Resumed { from_block: u64, snapshot: Option<u64> },
    BatchApplied { from: u64, to: u64, events: usize, flows: usize },
    ReorgDetected { fork_height: u64, depth: u64, reorg_type: ReorgType },
    Rewound { fork_height: u64, snapshot: Option<u64>, replayed_events: usize },
    CaughtUp { at_block: Option<u64> },
    SnapshotFailed { block_number: u64 },
}

/// Counters accumulated over the loop's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub batches: u64,
    pub blocks: u64,
    pub events_applied: u64,
    pub conflicts: u64,
    pub out_of_order: u64,
    pub decode_warnings: u64,
    pub reorgs: u64,
    pub snapshot_failures: u64,
}

enum Cycle {
    CaughtUp,
    Reorg(ReorgEvent),
    Refetch,
    Cancelled,
}

enum Step {
    Applied,
    Reorg(ReorgEvent),
    Refetch,
}

/// The reorg-aware index loop.
pub struct IndexLoop {
    config: IndexerConfig,
    pipeline: DecodePipeline,
    engine: AggregationEngine,
    store: Arc<dyn IndexStore>,
    view: ViewHandle,
    tracker: BlockTracker,
    detector: ReorgDetector,
    snapshots: SnapshotManager,
    cursor: Cursor,
    state: IndexerState,
    stats: LoopStats,
    version: u64,
    resumed: bool,
    events: Option<mpsc::UnboundedSender<IndexLoopEvent>>,
}

impl IndexLoop {
    pub fn new(
        config: IndexerConfig,
        pipeline: DecodePipeline,
        engine: AggregationEngine,
        store: Arc<dyn IndexStore>,
        view: ViewHandle,
    ) -> Result<Self, IndexerError> {
        config.validate()?;
        engine.config().validate()?;
        let engine = engine.with_dedup_horizon(config.dedup_horizon_blocks);
        Ok(Self {
            tracker: BlockTracker::new(config.tracker_window),
            detector: ReorgDetector::new(),
            snapshots: SnapshotManager::new(config.snapshot_interval, config.snapshot_retention),
            cursor: Cursor::new(config.from_block, config.confirmation_depth),
            state: IndexerState::Idle,
            stats: LoopStats::default(),
            version: view.version(),
            resumed: false,
            events: None,
            config,
            pipeline,
            engine,
            store,
            view,
        })
    }

    /// Receive [`IndexLoopEvent`]s as the loop runs.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<IndexLoopEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    pub fn view_handle(&self) -> &ViewHandle {
        &self.view
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn reorgs_detected(&self) -> u64 {
        self.detector.detected()
    }

    fn notify(&self, event: IndexLoopEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn finished(&self) -> bool {
        self.config
            .to_block
            .is_some_and(|to| self.cursor.next_block > to)
    }

    // ─── Entry points ────────────────────────────────────────────────────────

    /// Run until the bounded range is done, `shutdown` fires, or a
    /// non-recoverable error occurs. Source outages only pause progress.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), IndexerError> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        if let Err(e) = self.resume().await {
            self.state = IndexerState::Error;
            return Err(e);
        }
        loop {
            match self.sync(&shutdown).await {
                Ok(()) => {}
                Err(e) if e.is_transient() || matches!(e, IndexerError::ChainTip { .. }) => {
                    tracing::warn!(error = %e, next_block = self.cursor.next_block, "Source not ready, will retry");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Index loop failed");
                    self.state = IndexerState::Error;
                    return Err(e);
                }
            }
            if self.finished() || shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        self.state = IndexerState::Stopped;
        tracing::info!(
            next_block = self.cursor.next_block,
            events = self.stats.events_applied,
            reorgs = self.stats.reorgs,
            "Index loop stopped"
        );
        Ok(())
    }

    /// Resume (once) and process every confirmed block available now.
    pub async fn catch_up(&mut self) -> Result<(), IndexerError> {
        self.resume().await?;
        self.sync(&CancellationToken::new()).await
    }

    /// Restore from the latest snapshot and discard log entries above it.
    pub async fn resume(&mut self) -> Result<(), IndexerError> {
        if self.resumed {
            return Ok(());
        }
        let snapshot = self
            .store
            .latest_snapshot()
            .await?
            .filter(|s| s.block_number >= self.config.from_block);
        let snapshot_block = snapshot.as_ref().map(|s| s.block_number);
        let next_block = match snapshot {
            Some(s) => {
                tracing::info!(block = s.block_number, hash = %s.block_hash, "Resuming from snapshot");
                self.engine.restore(s.state);
                self.cursor = Cursor::new(s.block_number + 1, self.config.confirmation_depth);
                self.cursor.last_hash = Some(s.block_hash);
                s.block_number + 1
            }
            None => {
                self.engine.reset();
                self.cursor = Cursor::new(self.config.from_block, self.config.confirmation_depth);
                self.config.from_block
            }
        };
        let orphaned = self.store.orphan_from(next_block).await?;
        self.store.prune_snapshots_from(next_block).await?;
        if orphaned > 0 {
            tracing::info!(orphaned, from = next_block, "Discarded log entries above snapshot");
        }
        self.snapshots.reset_to(snapshot_block);
        self.reload_tracker(next_block).await?;
        self.publish().await;
        self.resumed = true;
        self.state = IndexerState::Following;
        self.notify(IndexLoopEvent::Resumed {
            from_block: next_block,
            snapshot: snapshot_block,
        });
        Ok(())
    }

    // ─── Sync cycle ──────────────────────────────────────────────────────────

    async fn sync(&mut self, shutdown: &CancellationToken) -> Result<(), IndexerError> {
        let mut refetches = 0;
        loop {
            match self.cycle(shutdown).await? {
                Cycle::CaughtUp => {
                    if self.state == IndexerState::Replaying {
                        tracing::info!(next_block = self.cursor.next_block, "Replay complete");
                    }
                    self.state = IndexerState::Following;
                    self.notify(IndexLoopEvent::CaughtUp {
                        at_block: self.cursor.last_block(),
                    });
                    return Ok(());
                }
                Cycle::Reorg(reorg) => {
                    refetches = 0;
                    self.handle_reorg(reorg).await?;
                }
                Cycle::Refetch => {
                    refetches += 1;
                    if refetches >= MAX_REFETCHES {
                        return Err(IndexerError::SourceUnavailable(
                            "chain kept changing during fetch".into(),
                        ));
                    }
                }
                Cycle::Cancelled => return Ok(()),
            }
        }
    }

    async fn cycle(&mut self, shutdown: &CancellationToken) -> Result<Cycle, IndexerError> {
        let fetcher = self.pipeline.fetcher().clone();
        let head = fetcher.head_block_number().await?;
        let window = self.tracker.blocks();
        if let Some(reorg) = self.detector.check_head(head, &window) {
            return Ok(Cycle::Reorg(reorg));
        }
        if let Some(recorded) = self.tracker.head().cloned() {
            match fetcher.block(recorded.number).await? {
                Some(fetched) => {
                    if let Some(reorg) = self.detector.check_recorded(&recorded, &fetched, &window) {
                        return Ok(Cycle::Reorg(reorg));
                    }
                }
                None => {
                    let reorg = ReorgEvent {
                        detected_at: recorded.number,
                        fork_height: head + 1,
                        dropped_blocks: Vec::new(),
                        depth: 0,
                        reorg_type: ReorgType::HeadRegression,
                    };
                    return Ok(Cycle::Reorg(reorg.with_fork_height(head + 1, &window)));
                }
            }
        }

        let Some(mut target) = self.cursor.confirmed_tip(head) else {
            return Ok(Cycle::CaughtUp);
        };
        if let Some(to) = self.config.to_block {
            target = target.min(to);
        }
        if self.cursor.next_block > target {
            return Ok(Cycle::CaughtUp);
        }

        let ranges = split_range(self.cursor.next_block, target, self.config.batch_size);
        tracing::debug!(
            from = self.cursor.next_block,
            to = target,
            batches = ranges.len(),
            "Fetching confirmed range"
        );
        let token = shutdown.child_token();
        let (mut rx, handle) = self
            .pipeline
            .spawn(ranges, self.config.channel_capacity, token.clone());

        let mut outcome = Ok(Cycle::CaughtUp);
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    outcome = Ok(Cycle::Cancelled);
                    break;
                }
                next = rx.recv() => next,
            };
            let Some(result) = next else { break };
            let step = match result {
                Ok(batch) => self.apply_batch(batch).await,
                // Logs disagree with the headers fetched alongside them.
                Err(IndexerError::ReorgDetected { block_number, .. }) => {
                    tracing::warn!(block = block_number, "Log block hash changed during fetch");
                    Ok(Step::Refetch)
                }
                Err(e) => Err(e),
            };
            match step {
                Ok(Step::Applied) => {}
                Ok(Step::Reorg(reorg)) => {
                    outcome = Ok(Cycle::Reorg(reorg));
                    break;
                }
                Ok(Step::Refetch) => {
                    outcome = Ok(Cycle::Refetch);
                    break;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        token.cancel();
        drop(rx);
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Pipeline task ended abnormally");
        }
        outcome
    }

    // ─── Batch application ───────────────────────────────────────────────────

    async fn apply_batch(&mut self, batch: DecodedBatch) -> Result<Step, IndexerError> {
        if batch.from != self.cursor.next_block {
            tracing::debug!(from = batch.from, expected = self.cursor.next_block, "Stale batch");
            return Ok(Step::Refetch);
        }
        let Some(first) = batch.blocks.first() else {
            return Ok(Step::Applied);
        };
        if let Some(prev) = self.tracker.head() {
            let window = self.tracker.blocks();
            if let Some(reorg) = self.detector.check(first, prev, &window) {
                return Ok(Step::Reorg(reorg));
            }
        }
        if batch.blocks.windows(2).any(|w| !w[1].extends(&w[0])) {
            tracing::warn!(from = batch.from, to = batch.to, "Batch headers do not chain, refetching");
            return Ok(Step::Refetch);
        }

        self.store.append_blocks(&batch.blocks).await?;
        self.store.append_events(&batch.events).await?;

        let mut events = batch.events.iter().peekable();
        let mut applied = 0usize;
        let mut flows = 0usize;
        for block in &batch.blocks {
            if self.tracker.push(block.clone()).is_err() {
                // Verified above; only reachable if the tracker was reset mid-batch.
                return Ok(Step::Refetch);
            }
            self.engine.observe_block(block);
            while let Some(event) = events.next_if(|e| e.block_number == block.number) {
                match self.engine.apply(event) {
                    Ok(outcome) => {
                        applied += 1;
                        flows += usize::from(outcome.flow.is_some());
                    }
                    Err(e) if e.is_rejected_event() => {
                        if matches!(e, IndexerError::AggregationConflict { .. }) {
                            self.stats.conflicts += 1;
                        } else {
                            self.stats.out_of_order += 1;
                        }
                        tracing::debug!(event = %event.id, error = %e, "Event skipped");
                    }
                    Err(e) => return Err(e),
                }
            }
            self.cursor.advance(block.number, block.hash.clone());
            self.stats.blocks += 1;
            self.snapshot(block).await;
        }

        self.stats.batches += 1;
        self.stats.events_applied += applied as u64;
        self.stats.decode_warnings += batch.decode_warnings.len() as u64;
        tracing::info!(
            from = batch.from,
            to = batch.to,
            events = applied,
            flows,
            warnings = batch.decode_warnings.len(),
            "Batch applied"
        );
        self.publish().await;
        self.notify(IndexLoopEvent::BatchApplied {
            from: batch.from,
            to: batch.to,
            events: applied,
            flows,
        });
        Ok(Step::Applied)
    }

    async fn snapshot(&mut self, block: &BlockSummary) {
        let result = self
            .snapshots
            .maybe_snapshot(self.store.as_ref(), block.number, &block.hash, self.engine.state())
            .await;
        if let Err(e) = result {
            self.stats.snapshot_failures += 1;
            tracing::warn!(block = block.number, error = %e, "Snapshot write failed, keeping last good");
            self.notify(IndexLoopEvent::SnapshotFailed {
                block_number: block.number,
            });
        }
    }

    /// Write current-state tables, then swap the published view.
    async fn publish(&mut self) {
        let view = self.engine.view(self.version + 1);
        match self.store.write_current_state(&view).await {
            Ok(()) => {
                self.version = view.version;
                self.view.publish(view);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Current-state write failed, view not published");
            }
        }
    }

    // ─── Reorg handling ──────────────────────────────────────────────────────

    async fn handle_reorg(&mut self, reorg: ReorgEvent) -> Result<(), IndexerError> {
        self.state = IndexerState::ReorgDetected;
        let fork_height = self.locate_fork(reorg.fork_height).await?;
        let reorg = reorg.with_fork_height(fork_height, &self.tracker.blocks());
        self.stats.reorgs += 1;
        tracing::warn!(
            detected_at = reorg.detected_at,
            fork_height,
            depth = reorg.depth,
            reorg_type = %reorg.reorg_type,
            "Reorg detected"
        );
        self.notify(IndexLoopEvent::ReorgDetected {
            fork_height,
            depth: reorg.depth,
            reorg_type: reorg.reorg_type,
        });

        self.state = IndexerState::Rewinding;
        self.rewind(fork_height).await?;
        self.state = IndexerState::Replaying;
        Ok(())
    }

    /// Lowest block whose recorded hash the source no longer reports.
    async fn locate_fork(&self, estimate: u64) -> Result<u64, IndexerError> {
        let window = self.tracker.blocks();
        let Some(oldest) = window.first() else {
            return Ok(estimate.min(self.cursor.next_block));
        };
        let fetcher = self.pipeline.fetcher();
        for recorded in window.iter().rev() {
            let fetched = fetcher.block(recorded.number).await?;
            if fetched.is_some_and(|b| b.hash == recorded.hash) {
                return Ok(recorded.number + 1);
            }
        }
        tracing::warn!(
            oldest = oldest.number,
            "Reorg deeper than the tracked window, rewinding to its start"
        );
        Ok(oldest.number)
    }

    /// Rebuild state as of the end of block `fork_height - 1`.
    async fn rewind(&mut self, fork_height: u64) -> Result<(), IndexerError> {
        let fork_height = fork_height.max(self.config.from_block);
        let snapshot = self
            .store
            .latest_snapshot_below(fork_height)
            .await?
            .filter(|s| s.block_number >= self.config.from_block);

        let orphaned = self.store.orphan_from(fork_height).await?;
        let pruned = self.store.prune_snapshots_from(fork_height).await?;

        let snapshot_block = snapshot.as_ref().map(|s| s.block_number);
        let replay_from = match snapshot {
            Some(s) => {
                let next = s.block_number + 1;
                self.engine.restore(s.state);
                next
            }
            None => {
                self.engine.reset();
                self.config.from_block
            }
        };
        self.snapshots.reset_to(snapshot_block);

        let mut replayed = 0;
        if replay_from < fork_height {
            let blocks = self.store.blocks_in_range(replay_from, fork_height - 1).await?;
            let events = self.store.events_in_range(replay_from, fork_height - 1).await?;
            replayed = self.replay(&blocks, &events)?;
        }

        self.reload_tracker(fork_height).await?;
        let parent_hash = self.tracker.head().map(|b| b.hash.clone());
        self.cursor.rewind_to(fork_height, parent_hash);
        self.publish().await;

        tracing::info!(
            fork_height,
            snapshot = ?snapshot_block,
            replayed,
            orphaned,
            pruned,
            "Rewound aggregate state"
        );
        self.notify(IndexLoopEvent::Rewound {
            fork_height,
            snapshot: snapshot_block,
            replayed_events: replayed,
        });
        Ok(())
    }

    /// Re-apply logged canonical blocks and events in chain order.
    fn replay(&mut self, blocks: &[BlockSummary], events: &[DomainEvent]) -> Result<usize, IndexerError> {
        let mut events = events.iter().peekable();
        let mut replayed = 0;
        for block in blocks {
            while let Some(event) = events.next_if(|e| e.block_number < block.number) {
                replayed += self.replay_event(event)?;
            }
            self.engine.observe_block(block);
            while let Some(event) = events.next_if(|e| e.block_number == block.number) {
                replayed += self.replay_event(event)?;
            }
        }
        for event in events {
            replayed += self.replay_event(event)?;
        }
        Ok(replayed)
    }

    fn replay_event(&mut self, event: &DomainEvent) -> Result<usize, IndexerError> {
        match self.engine.apply(event) {
            Ok(_) => Ok(1),
            Err(e) if e.is_rejected_event() => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Refill the tracker with logged blocks just below `next_block`.
    async fn reload_tracker(&mut self, next_block: u64) -> Result<(), IndexerError> {
        let Some(last) = next_block.checked_sub(1) else {
            self.tracker.reset(Vec::new());
            return Ok(());
        };
        let first = next_block
            .saturating_sub(self.config.tracker_window as u64)
            .max(self.config.from_block);
        let blocks = if first <= last {
            self.store.blocks_in_range(first, last).await?
        } else {
            Vec::new()
        };
        self.tracker.reset(blocks);
        Ok(())
    }
}
