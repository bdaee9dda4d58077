//! The aggregation engine: a deterministic fold of domain events into
//! derived state.
//!
//! Events must be applied in global `(block_number, log_index)` order. The
//! engine owns all mutable aggregate state; everything it exposes to readers
//! goes through [`AggregationEngine::view`], which produces an immutable
//! [`StateView`].
//!
//! Per event the engine runs, in order: the idempotence gate, the wallet
//! (whale) update, the protocol stats update, flow detection, and finally
//! the recent-transactions ring. A failure in the stats update only marks
//! that protocol's row stale; the event still counts as applied.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::config::AggregatorConfig;
use crate::error::IndexerError;
use crate::event::{DomainEvent, EventKind};
use crate::flow::{CapitalFlow, WalletBuffer};
use crate::health::{self, GasTracker, HealthInputs, ProtocolHealthSnapshot};
use crate::price::PriceOracle;
use crate::query::StateView;
use crate::stats::ProtocolStats;
use crate::types::{BlockSummary, EventId, EventPosition, ProtocolId};
use crate::whale::WhaleActivity;

const DEFAULT_DEDUP_HORIZON: u64 = 256;

// ─── State ────────────────────────────────────────────────────────────────────

/// One entry of the recent-transactions ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentTransaction {
    pub id: EventId,
    pub protocol: ProtocolId,
    pub kind: EventKind,
    pub wallet: String,
    pub block_number: u64,
    pub timestamp: i64,
    pub token: Option<String>,
    pub amount: Option<Decimal>,
    /// `None` when the event could not be valued.
    pub volume_usd: Option<Decimal>,
}

/// The last block the engine has seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadMarker {
    pub number: u64,
    pub hash: String,
    pub timestamp: i64,
}

/// Health-related state: snapshots, TVL history and the gas tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    pub latest: BTreeMap<ProtocolId, ProtocolHealthSnapshot>,
    pub history: VecDeque<ProtocolHealthSnapshot>,
    pub tvl_history: BTreeMap<ProtocolId, VecDeque<(i64, Decimal)>>,
    pub gas: GasTracker,
    /// Chain time of the next health tick.
    pub next_tick: Option<i64>,
}

/// Everything the engine derives from the event log.
///
/// Only ordered collections are used so that serializing the same state
/// always yields the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateState {
    pub stats: BTreeMap<ProtocolId, ProtocolStats>,
    pub whales: BTreeMap<String, WhaleActivity>,
    pub buffers: BTreeMap<String, WalletBuffer>,
    /// Retained flows, oldest first.
    pub flows: VecDeque<CapitalFlow>,
    pub flow_keys: BTreeSet<(EventId, EventId)>,
    /// Newest first.
    pub recent: VecDeque<RecentTransaction>,
    pub health: HealthState,
    /// Applied event ids per block, kept for the dedup horizon.
    pub seen: BTreeMap<u64, BTreeSet<EventId>>,
    pub last_position: Option<EventPosition>,
    pub head: Option<HeadMarker>,
    pub events_applied: u64,
}

impl AggregateState {
    pub fn new(config: &AggregatorConfig) -> Self {
        Self {
            stats: BTreeMap::new(),
            whales: BTreeMap::new(),
            buffers: BTreeMap::new(),
            flows: VecDeque::new(),
            flow_keys: BTreeSet::new(),
            recent: VecDeque::new(),
            health: HealthState {
                latest: BTreeMap::new(),
                history: VecDeque::new(),
                tvl_history: BTreeMap::new(),
                gas: GasTracker::new(
                    config.health.gas_recent_blocks,
                    config.health.gas_baseline_blocks,
                ),
                next_tick: None,
            },
            seen: BTreeMap::new(),
            last_position: None,
            head: None,
            events_applied: 0,
        }
    }

    /// Highest block the state covers, from events or observed headers.
    pub fn block_number(&self) -> Option<u64> {
        let from_events = self.last_position.map(|p| p.block_number);
        let from_head = self.head.as_ref().map(|h| h.number);
        from_events.max(from_head)
    }

    /// Chain time the state is current as of.
    pub fn chain_time(&self) -> Option<i64> {
        self.head.as_ref().map(|h| h.timestamp)
    }

    fn is_known(&self, event: &DomainEvent) -> bool {
        self.seen
            .get(&event.block_number)
            .is_some_and(|ids| ids.contains(&event.id))
    }
}

// ─── Outcomes ─────────────────────────────────────────────────────────────────

/// What applying a single event produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub flow: Option<CapitalFlow>,
    /// Set when the protocol's stats row could not be updated.
    pub stale: Option<ProtocolId>,
}

/// Summary of [`AggregationEngine::apply_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub conflicts: usize,
    pub out_of_order: usize,
    pub flows: usize,
    pub stale_protocols: BTreeSet<ProtocolId>,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

/// Single-writer fold over the canonical event sequence.
pub struct AggregationEngine {
    config: AggregatorConfig,
    oracle: Arc<dyn PriceOracle>,
    state: AggregateState,
    dedup_horizon_blocks: u64,
}

impl AggregationEngine {
    pub fn new(config: AggregatorConfig, oracle: Arc<dyn PriceOracle>) -> Self {
        let state = AggregateState::new(&config);
        Self {
            config,
            oracle,
            state,
            dedup_horizon_blocks: DEFAULT_DEDUP_HORIZON,
        }
    }

    /// How many blocks back applied event ids are remembered.
    pub fn with_dedup_horizon(mut self, blocks: u64) -> Self {
        self.dedup_horizon_blocks = blocks;
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn oracle(&self) -> &dyn PriceOracle {
        self.oracle.as_ref()
    }

    pub fn state(&self) -> &AggregateState {
        &self.state
    }

    /// Replace the whole state (rewind to a snapshot).
    pub fn restore(&mut self, state: AggregateState) {
        self.state = state;
    }

    /// Drop all state and start from empty.
    pub fn reset(&mut self) {
        self.state = AggregateState::new(&self.config);
    }

    /// Record a block header: advances chain time and feeds the gas tracker.
    ///
    /// Headers at or below the current head are ignored, so observing the
    /// same block twice has no effect.
    pub fn observe_block(&mut self, block: &BlockSummary) -> bool {
        if self
            .state
            .head
            .as_ref()
            .is_some_and(|h| h.number >= block.number)
        {
            return false;
        }
        self.advance_clock(block.timestamp);
        if let Some(fee) = block.base_fee_per_gas {
            self.state.health.gas.observe(fee);
        }
        self.state.head = Some(HeadMarker {
            number: block.number,
            hash: block.hash.clone(),
            timestamp: block.timestamp,
        });
        true
    }

    /// Apply one event.
    ///
    /// Returns `AggregationConflict` for an already-applied event and
    /// `OutOfOrder` for an event behind the last applied position; in both
    /// cases state is untouched.
    pub fn apply(&mut self, event: &DomainEvent) -> Result<ApplyOutcome, IndexerError> {
        self.gate(event)?;
        self.advance_clock(event.timestamp);

        let mut outcome = ApplyOutcome::default();
        let volume = self.oracle.total_usd(&event.volume_legs());
        let usd = volume.as_ref().ok().copied();

        // Wallet activity.
        let whale = self
            .state
            .whales
            .entry(event.wallet.clone())
            .or_insert_with(|| WhaleActivity::new(event.wallet.clone(), event.timestamp));
        whale.record(event, usd);
        let whale_exit =
            event.kind().is_exit() && whale.is_whale(self.config.whale_threshold_usd);

        // Protocol stats, isolated per protocol.
        let config = &self.config;
        let stats = self
            .state
            .stats
            .entry(event.protocol)
            .or_insert_with(|| ProtocolStats::new(event.protocol, config));
        if let Err(err) = stats.apply(event, volume, whale_exit) {
            tracing::warn!(
                protocol = %event.protocol,
                event = %event.id,
                block = event.block_number,
                error = %err,
                "Protocol stats marked stale"
            );
            outcome.stale = Some(event.protocol);
        }

        // Cross-protocol flows.
        let flow_usd = event
            .primary_amount()
            .and_then(|amount| self.oracle.value_usd(amount).ok());
        let buffer = self.state.buffers.entry(event.wallet.clone()).or_default();
        if let Some(flow) = buffer.observe(
            event,
            flow_usd,
            &self.config.flow,
            self.config.wallet_buffer_len,
        ) {
            if self.state.flow_keys.insert(flow.key()) {
                if let Some(w) = self.state.whales.get_mut(&event.wallet) {
                    w.cross_protocol_moves += 1;
                }
                tracing::debug!(
                    wallet = %flow.wallet,
                    from = %flow.from_protocol,
                    to = %flow.to_protocol,
                    flow_type = %flow.flow_type,
                    "Capital flow detected"
                );
                self.state.flows.push_back(flow.clone());
                while self.state.flows.len() > self.config.flow_retention {
                    if let Some(old) = self.state.flows.pop_front() {
                        self.state.flow_keys.remove(&old.key());
                    }
                }
                outcome.flow = Some(flow);
            }
        }

        // Recent transactions.
        let primary = event.primary_amount();
        self.state.recent.push_front(RecentTransaction {
            id: event.id.clone(),
            protocol: event.protocol,
            kind: event.kind(),
            wallet: event.wallet.clone(),
            block_number: event.block_number,
            timestamp: event.timestamp,
            token: primary.map(|a| a.token.clone()),
            amount: primary.map(|a| a.amount),
            volume_usd: usd,
        });
        self.state.recent.truncate(self.config.recent_tx_capacity);

        self.remember(event);
        Ok(outcome)
    }

    /// Apply a sorted batch, counting rejected events instead of failing.
    pub fn apply_batch(&mut self, events: &[DomainEvent]) -> BatchReport {
        let mut report = BatchReport::default();
        for event in events {
            match self.apply(event) {
                Ok(outcome) => {
                    report.applied += 1;
                    if outcome.flow.is_some() {
                        report.flows += 1;
                    }
                    if let Some(p) = outcome.stale {
                        report.stale_protocols.insert(p);
                    }
                }
                Err(IndexerError::AggregationConflict { .. }) => report.conflicts += 1,
                Err(err) => {
                    tracing::debug!(event = %event.id, error = %err, "Event rejected");
                    report.out_of_order += 1;
                }
            }
        }
        report
    }

    /// Build an immutable view of the current state.
    pub fn view(&self, version: u64) -> StateView {
        StateView::build(&self.state, &self.config, self.oracle.as_ref(), version)
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn gate(&self, event: &DomainEvent) -> Result<(), IndexerError> {
        if self.state.is_known(event) {
            return Err(IndexerError::AggregationConflict {
                tx_hash: event.id.tx_hash.clone(),
                log_index: event.id.log_index,
            });
        }
        if let Some(last) = self.state.last_position {
            if event.position() <= last {
                return Err(IndexerError::OutOfOrder {
                    block_number: event.block_number,
                    log_index: event.id.log_index,
                    last_block: last.block_number,
                    last_log_index: last.log_index,
                });
            }
        }
        Ok(())
    }

    fn remember(&mut self, event: &DomainEvent) {
        self.state
            .seen
            .entry(event.block_number)
            .or_default()
            .insert(event.id.clone());
        let horizon = event.block_number.saturating_sub(self.dedup_horizon_blocks);
        self.state.seen = self.state.seen.split_off(&horizon);
        self.state.last_position = Some(event.position());
        self.state.events_applied += 1;
    }

    /// Take health snapshots when `ts` crosses the next tick.
    fn advance_clock(&mut self, ts: i64) {
        let interval = self.config.health.interval_secs;
        let tick = ts.div_euclid(interval) * interval;
        match self.state.health.next_tick {
            None => self.state.health.next_tick = Some(tick + interval),
            Some(next) if ts >= next => {
                self.take_health_snapshots(tick);
                self.prune_idle_buffers(ts);
                self.state.health.next_tick = Some(tick + interval);
            }
            Some(_) => {}
        }
    }

    /// Drop flow buffers of wallets idle for longer than the flow window.
    /// None of their events can pair with an event at or after `now`.
    fn prune_idle_buffers(&mut self, now: i64) {
        let cutoff = now - self.config.flow.window_secs;
        let before = self.state.buffers.len();
        self.state
            .buffers
            .retain(|_, buffer| buffer.last_timestamp().is_some_and(|ts| ts >= cutoff));
        let dropped = before - self.state.buffers.len();
        if dropped > 0 {
            tracing::debug!(
                dropped,
                remaining = self.state.buffers.len(),
                "Pruned idle flow buffers"
            );
        }
    }

    fn take_health_snapshots(&mut self, at: i64) {
        let block_number = self.state.block_number().unwrap_or(0);
        let window = self.config.rolling_window_secs();
        let interval = self.config.health.interval_secs;
        let oracle = self.oracle.as_ref();
        let hc = &self.config.health;
        let AggregateState { stats, health, .. } = &mut self.state;
        let gas_multiplier = health.gas.multiplier();

        for (protocol, row) in stats.iter() {
            let tvl = row.tvl_usd(oracle);
            let history = health.tvl_history.entry(*protocol).or_default();
            history.push_back((at, tvl));
            while history
                .front()
                .is_some_and(|(ts, _)| *ts < at - window - interval)
            {
                history.pop_front();
            }
            let baseline = history
                .iter()
                .rev()
                .find(|(ts, _)| *ts <= at - window)
                .or(history.front())
                .map(|(_, v)| *v)
                .unwrap_or(tvl);

            let inputs = HealthInputs {
                utilization: row.utilization(oracle),
                tvl_usd: tvl,
                tvl_change_pct: health::percent_change(baseline, tvl),
                whale_exits: row.whale_exit_count(at),
                gas_multiplier,
                stale: row.is_stale(),
            };
            let (score, warnings) = health::score(&inputs, hc);
            if !warnings.is_empty() {
                tracing::warn!(
                    protocol = %protocol,
                    score = %score,
                    warnings = ?warnings,
                    "Protocol health degraded"
                );
            }
            let snapshot = ProtocolHealthSnapshot {
                protocol: *protocol,
                timestamp: at,
                block_number,
                score,
                utilization: inputs.utilization,
                tvl_usd: tvl,
                tvl_change_24h_pct: inputs.tvl_change_pct,
                whale_exits: inputs.whale_exits,
                gas_multiplier,
                warnings,
            };
            health.latest.insert(*protocol, snapshot.clone());
            health.history.push_back(snapshot);
        }
        while health.history.len() > hc.history_len {
            health.history.pop_front();
        }
    }
}
