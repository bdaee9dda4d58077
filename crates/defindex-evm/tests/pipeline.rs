//! End-to-end tests: memory chain → decoders → pipeline → index loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use alloy_primitives::aliases::{I24, U160, U24};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use defindex_core::aggregator::AggregationEngine;
use defindex_core::config::AggregatorConfig;
use defindex_core::error::IndexerError;
use defindex_core::event::DomainEvent;
use defindex_core::flow::FlowType;
use defindex_core::indexer::{IndexerConfig, IndexerState};
use defindex_core::price::StaticPriceOracle;
use defindex_core::query::{QueryStore, StateView};
use defindex_core::snapshot::StateSnapshot;
use defindex_core::store::{EventLog, IndexStore, SnapshotStore, StateSink};
use defindex_core::types::{BlockSummary, EventFilter, ProtocolId};
use defindex_evm::abi::{dex, encode_log, lending};
use defindex_evm::decoder::{DexConfig, DexPoolConfig, LendingConfig};
use defindex_evm::{
    DecodePipeline, DecoderSet, IndexLoop, IndexLoopEvent, IndexerBuilder, LogFetcher, LogSource,
    MemoryChain, ProtocolsConfig, RawLog, RetryPolicy, TokenInfo,
};
use defindex_storage::InMemoryStorage;

const GENESIS_TS: i64 = 1_700_000_000;
const LENDING_POOL: &str = "0x87870bca3f3fd6335c3f4ce8392d69350b4fa4e2";
const POOL_MANAGER: &str = "0x000000000004444c5dc75cb358380d2e3de08a90";
const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";
const ALICE: &str = "0x1111111111111111111111111111111111111111";
const BOB: &str = "0x2222222222222222222222222222222222222222";

// ─── Fixtures ─────────────────────────────────────────────────────────────────

fn pool_id() -> String {
    format!("0x{}", "ab".repeat(32))
}

fn protocols() -> ProtocolsConfig {
    ProtocolsConfig {
        dex: Some(DexConfig {
            pool_manager: POOL_MANAGER.into(),
            pools: BTreeMap::from([(
                pool_id(),
                DexPoolConfig {
                    currency0: TokenInfo::new("USDC", 6),
                    currency1: TokenInfo::new("WETH", 18),
                },
            )]),
        }),
        lending: Some(LendingConfig {
            pool: LENDING_POOL.into(),
            reserves: BTreeMap::from([
                (USDC.to_string(), TokenInfo::new("USDC", 6)),
                (WETH.to_string(), TokenInfo::new("WETH", 18)),
            ]),
        }),
        ..Default::default()
    }
}

fn aggregator() -> AggregatorConfig {
    AggregatorConfig {
        prices: BTreeMap::from([("USDC".to_string(), dec!(1)), ("WETH".to_string(), dec!(3000))]),
        ..Default::default()
    }
}

fn indexer_config() -> IndexerConfig {
    IndexerConfig {
        id: "test".into(),
        from_block: 100,
        confirmation_depth: 0,
        batch_size: 2,
        max_log_range: 3,
        poll_interval_ms: 1,
        snapshot_interval: 3,
        tracker_window: 32,
        retry_initial_backoff_ms: 1,
        retry_max_backoff_ms: 2,
        ..Default::default()
    }
}

fn indexer(chain: &Arc<MemoryChain>, store: &Arc<InMemoryStorage>) -> IndexLoop {
    indexer_with(chain.clone(), store.clone())
}

fn indexer_with(source: Arc<dyn LogSource>, store: Arc<dyn IndexStore>) -> IndexLoop {
    IndexerBuilder::new()
        .config(indexer_config())
        .aggregator(aggregator())
        .protocols(protocols())
        .source(source)
        .store(store)
        .build()
        .unwrap()
}

fn addr(a: &str) -> Address {
    a.parse().unwrap()
}

fn log(address: &str, (topics, data): (Vec<String>, String), tx: &str, log_index: u32) -> RawLog {
    RawLog {
        address: address.into(),
        topics,
        data,
        block_number: String::new(),
        block_hash: String::new(),
        block_timestamp: None,
        tx_hash: tx.into(),
        log_index: format!("0x{log_index:x}"),
        removed: None,
    }
}

/// Lending `Supply` of `usdc` whole USDC on behalf of `wallet`.
fn supply(wallet: &str, usdc: u128, tx: &str, log_index: u32) -> RawLog {
    let event = lending::Supply {
        reserve: addr(USDC),
        user: addr(wallet),
        on_behalf_of: addr(wallet),
        amount: U256::from(usdc * 1_000_000),
        referral_code: 0,
    };
    log(LENDING_POOL, encode_log(&event), tx, log_index)
}

/// Lending `Withdraw` of `usdc` whole USDC by `wallet`.
fn withdraw(wallet: &str, usdc: u128, tx: &str, log_index: u32) -> RawLog {
    let event = lending::Withdraw {
        reserve: addr(USDC),
        user: addr(wallet),
        to: addr(wallet),
        amount: U256::from(usdc * 1_000_000),
    };
    log(LENDING_POOL, encode_log(&event), tx, log_index)
}

/// DEX swap paying `usdc` whole USDC for `usdc / 3000` WETH.
fn swap(wallet: &str, usdc: u128, tx: &str, log_index: u32) -> RawLog {
    let event = dex::Swap {
        id: B256::repeat_byte(0xab),
        sender: addr(wallet),
        amount0: -((usdc * 1_000_000) as i128),
        amount1: (usdc * 1_000_000_000_000_000_000 / 3000) as i128,
        sqrt_price_x96: U160::from(1u64),
        liquidity: 1,
        tick: I24::ZERO,
        fee: U24::from(500u64),
    };
    log(POOL_MANAGER, encode_log(&event), tx, log_index)
}

/// Blocks 100..=109 with activity spread across both protocols.
fn busy_chain() -> Arc<MemoryChain> {
    let chain = MemoryChain::linear(100, 10, GENESIS_TS);
    chain.add_log(100, supply(ALICE, 1_000, "0xa100", 0)).unwrap();
    chain.add_log(101, withdraw(ALICE, 1_000, "0xa101", 0)).unwrap();
    chain.add_log(101, swap(ALICE, 1_000, "0xa101", 1)).unwrap();
    chain.add_log(103, supply(BOB, 50_000, "0xb103", 4)).unwrap();
    chain.add_log(104, swap(BOB, 9_000, "0xb104", 0)).unwrap();
    chain.add_log(106, supply(ALICE, 2_000, "0xa106", 2)).unwrap();
    chain.add_log(108, withdraw(BOB, 10_000, "0xb108", 1)).unwrap();
    Arc::new(chain)
}

fn state_json(indexer: &IndexLoop) -> String {
    serde_json::to_string(indexer.engine().state()).unwrap()
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn deposit_withdraw_swap_yields_one_flow() {
    let chain = MemoryChain::linear(100, 2, GENESIS_TS);
    chain.add_log(100, supply(ALICE, 1_000, "0xt1", 0)).unwrap();
    chain.add_log(101, withdraw(ALICE, 1_000, "0xt2", 0)).unwrap();
    chain.add_log(101, swap(ALICE, 1_000, "0xt2", 1)).unwrap();
    let chain = Arc::new(chain);
    let store = Arc::new(InMemoryStorage::new());

    let mut indexer = indexer(&chain, &store);
    indexer.catch_up().await.unwrap();

    let view = indexer.view_handle().clone();
    let flows = view.capital_flows(10).await.unwrap();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].wallet, ALICE);
    assert_eq!(flows[0].from_protocol, ProtocolId::Lending);
    assert_eq!(flows[0].to_protocol, ProtocolId::Dex);
    assert_eq!(flows[0].flow_type, FlowType::Rebalancing);
    assert_eq!(flows[0].time_delta_secs, 0);

    let whales = view.whale_activity(10, dec!(0)).await.unwrap();
    let alice = whales.iter().find(|w| w.activity.wallet == ALICE).unwrap();
    assert_eq!(alice.activity.cross_protocol_moves, 1);

    assert_eq!(view.recent_transactions(10).await.unwrap().len(), 3);
    assert_eq!(indexer.state(), IndexerState::Following);
    assert_eq!(indexer.cursor().next_block, 102);
    assert!(store.current_state().is_some());
}

#[tokio::test]
async fn overlapping_ranges_count_each_event_once() {
    let chain = busy_chain();
    let pipeline = DecodePipeline::new(
        LogFetcher::new(chain, 3, RetryPolicy::none()),
        DecoderSet::from_config(&protocols()).unwrap(),
    );
    let cancel = CancellationToken::new();
    let first = pipeline.fetch_range(100, 103, &cancel).await.unwrap();
    let second = pipeline.fetch_range(101, 104, &cancel).await.unwrap();

    let config = aggregator();
    let oracle = Arc::new(StaticPriceOracle::new(config.prices.clone()));
    let mut engine = AggregationEngine::new(config, oracle);
    let a = engine.apply_batch(&first.events);
    let b = engine.apply_batch(&second.events);

    assert_eq!(a.applied, 4);
    assert_eq!(b.applied, 1);
    assert_eq!(b.conflicts, 3);

    let counted: u64 = engine
        .state()
        .stats
        .values()
        .map(|s| s.cumulative_tx_count)
        .sum();
    assert_eq!(counted, 5);
}

#[tokio::test]
async fn merged_events_follow_chain_order_across_protocols() {
    let chain = MemoryChain::linear(100, 1, GENESIS_TS);
    chain.add_log(100, swap(ALICE, 10, "0xt1", 7)).unwrap();
    chain.add_log(100, supply(BOB, 10, "0xt2", 5)).unwrap();
    chain.add_log(100, swap(BOB, 10, "0xt3", 2)).unwrap();
    let pipeline = DecodePipeline::new(
        LogFetcher::new(Arc::new(chain), 10, RetryPolicy::none()),
        DecoderSet::from_config(&protocols()).unwrap(),
    );
    let batch = pipeline
        .fetch_range(100, 100, &CancellationToken::new())
        .await
        .unwrap();
    let order: Vec<_> = batch
        .events
        .iter()
        .map(|e| (e.id.log_index, e.protocol))
        .collect();
    assert_eq!(
        order,
        vec![
            (2, ProtocolId::Dex),
            (5, ProtocolId::Lending),
            (7, ProtocolId::Dex)
        ]
    );
    assert_eq!(batch.blocks.len(), 1);
    assert_eq!(batch.events[0].timestamp, GENESIS_TS);
}

#[tokio::test]
async fn undecodable_logs_are_skipped_not_fatal() {
    let chain = MemoryChain::linear(100, 2, GENESIS_TS);
    let mut bad = swap(ALICE, 10, "0xbad", 0);
    bad.topics[1] = format!("0x{}", "cd".repeat(32)); // unknown pool
    chain.add_log(100, bad).unwrap();
    chain.add_log(101, supply(ALICE, 10, "0xgood", 0)).unwrap();
    let chain = Arc::new(chain);
    let store = Arc::new(InMemoryStorage::new());

    let mut indexer = indexer(&chain, &store);
    indexer.catch_up().await.unwrap();

    assert_eq!(indexer.stats().decode_warnings, 1);
    assert_eq!(indexer.stats().events_applied, 1);
    assert_eq!(store.event_count(), 1);
}

// ─── Determinism & idempotence ───────────────────────────────────────────────

#[tokio::test]
async fn replaying_the_same_chain_is_byte_identical() {
    let chain = busy_chain();
    let mut a = indexer(&chain, &Arc::new(InMemoryStorage::new()));
    let mut b = indexer(&chain, &Arc::new(InMemoryStorage::new()));
    a.catch_up().await.unwrap();
    b.catch_up().await.unwrap();
    assert_eq!(state_json(&a), state_json(&b));
    assert_eq!(a.stats().events_applied, 7);
}

#[tokio::test]
async fn catching_up_twice_changes_nothing() {
    let chain = busy_chain();
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&chain, &store);
    indexer.catch_up().await.unwrap();
    let before = state_json(&indexer);
    let version = indexer.view_handle().version();

    indexer.catch_up().await.unwrap();
    assert_eq!(state_json(&indexer), before);
    assert_eq!(indexer.view_handle().version(), version);
    assert_eq!(store.event_count(), 7);
}

#[tokio::test]
async fn transient_source_failures_are_retried() {
    let chain = busy_chain();
    chain.fail_next(2);
    let mut indexer = indexer(&chain, &Arc::new(InMemoryStorage::new()));
    indexer.catch_up().await.unwrap();
    assert_eq!(indexer.stats().events_applied, 7);
}

// ─── Reorgs ───────────────────────────────────────────────────────────────────

/// The chain after a reorg at 105: blocks 105..=109 replaced, different logs.
fn reorganize(chain: &MemoryChain) {
    chain.reorg_from(105, 5, 1);
    chain.add_log(105, swap(BOB, 1_500, "0xc105", 0)).unwrap();
    chain.add_log(107, supply(ALICE, 3_000, "0xc107", 3)).unwrap();
    chain.add_log(109, withdraw(ALICE, 500, "0xc109", 1)).unwrap();
}

#[tokio::test]
async fn reorg_matches_a_fresh_fold_of_the_new_chain() {
    let chain = busy_chain();
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&chain, &store);
    let mut events = indexer.subscribe();
    indexer.catch_up().await.unwrap();

    reorganize(&chain);
    indexer.catch_up().await.unwrap();

    let mut fresh = crate::indexer(&chain, &Arc::new(InMemoryStorage::new()));
    fresh.catch_up().await.unwrap();
    assert_eq!(state_json(&indexer), state_json(&fresh));

    assert_eq!(indexer.stats().reorgs, 1);
    assert_eq!(indexer.state(), IndexerState::Following);
    assert_eq!(indexer.cursor().next_block, 110);
    // Blocks 106 and 108 carried the orphaned events.
    assert_eq!(store.orphaned_count(), 2);

    let mut saw_reorg = false;
    let mut saw_rewind = false;
    while let Ok(event) = events.try_recv() {
        match event {
            IndexLoopEvent::ReorgDetected { fork_height, depth, .. } => {
                assert_eq!(fork_height, 105);
                assert_eq!(depth, 5);
                saw_reorg = true;
            }
            IndexLoopEvent::Rewound { fork_height, snapshot, .. } => {
                assert_eq!(fork_height, 105);
                assert_eq!(snapshot, Some(103));
                saw_rewind = true;
            }
            _ => {}
        }
    }
    assert!(saw_reorg && saw_rewind);

    let flows = indexer.view_handle().capital_flows(100).await.unwrap();
    assert!(flows.iter().all(|f| f.block_number < 105 || f.to_event.tx_hash.starts_with("0xc")));
}

#[tokio::test]
async fn reorg_to_a_longer_chain_is_picked_up_by_parent_hash() {
    let chain = busy_chain();
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&chain, &store);
    indexer.catch_up().await.unwrap();

    // Replace 108..=109 and extend to 112.
    chain.reorg_from(108, 5, 2);
    chain.add_log(111, swap(ALICE, 700, "0xd111", 0)).unwrap();
    indexer.catch_up().await.unwrap();

    let mut fresh = crate::indexer(&chain, &Arc::new(InMemoryStorage::new()));
    fresh.catch_up().await.unwrap();
    assert_eq!(state_json(&indexer), state_json(&fresh));
    assert_eq!(indexer.cursor().next_block, 113);
}

// ─── Recovery & bounded runs ─────────────────────────────────────────────────

#[tokio::test]
async fn restart_resumes_from_latest_snapshot() {
    let chain = busy_chain();
    let store = Arc::new(InMemoryStorage::new());
    let mut first = indexer(&chain, &store);
    first.catch_up().await.unwrap();
    let expected = state_json(&first);
    drop(first);

    let mut second = indexer(&chain, &store);
    let mut events = second.subscribe();
    second.catch_up().await.unwrap();
    assert_eq!(state_json(&second), expected);

    match events.try_recv().unwrap() {
        IndexLoopEvent::Resumed { from_block, snapshot } => {
            // Snapshots every 3 blocks from 100: the newest is 109.
            assert_eq!(snapshot, Some(109));
            assert_eq!(from_block, 110);
        }
        other => panic!("unexpected first event {other:?}"),
    }
}

#[tokio::test]
async fn bounded_run_stops_at_to_block() {
    let chain = busy_chain();
    let mut indexer = IndexerBuilder::new()
        .config(IndexerConfig {
            to_block: Some(104),
            ..indexer_config()
        })
        .aggregator(aggregator())
        .protocols(protocols())
        .source(chain)
        .build()
        .unwrap();

    indexer.run(CancellationToken::new()).await.unwrap();
    assert_eq!(indexer.state(), IndexerState::Stopped);
    assert_eq!(indexer.cursor().next_block, 105);
    assert_eq!(indexer.stats().events_applied, 5);
}

// ─── Storage failures ────────────────────────────────────────────────────────

/// [`InMemoryStorage`] that can be told to fail snapshot or current-state writes.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStorage,
    failing_snapshots: AtomicU32,
    failing_state_writes: AtomicBool,
}

impl FlakyStore {
    /// The next `n` snapshot writes fail.
    fn fail_snapshots(&self, n: u32) {
        self.failing_snapshots.store(n, Ordering::SeqCst);
    }

    fn fail_state_writes(&self, on: bool) {
        self.failing_state_writes.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventLog for FlakyStore {
    async fn append_blocks(&self, blocks: &[BlockSummary]) -> Result<(), IndexerError> {
        self.inner.append_blocks(blocks).await
    }

    async fn append_events(&self, events: &[DomainEvent]) -> Result<(), IndexerError> {
        self.inner.append_events(events).await
    }

    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<DomainEvent>, IndexerError> {
        self.inner.events_in_range(from, to).await
    }

    async fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<BlockSummary>, IndexerError> {
        self.inner.blocks_in_range(from, to).await
    }

    async fn orphan_from(&self, height: u64) -> Result<u64, IndexerError> {
        self.inner.orphan_from(height).await
    }
}

#[async_trait]
impl SnapshotStore for FlakyStore {
    async fn save_snapshot(&self, snapshot: &StateSnapshot) -> Result<(), IndexerError> {
        let failing = self
            .failing_snapshots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(IndexerError::Storage("disk full".into()));
        }
        self.inner.save_snapshot(snapshot).await
    }

    async fn latest_snapshot_below(&self, height: u64) -> Result<Option<StateSnapshot>, IndexerError> {
        self.inner.latest_snapshot_below(height).await
    }

    async fn prune_snapshots_from(&self, height: u64) -> Result<u64, IndexerError> {
        self.inner.prune_snapshots_from(height).await
    }

    async fn retain_snapshots(&self, keep: usize) -> Result<(), IndexerError> {
        self.inner.retain_snapshots(keep).await
    }
}

#[async_trait]
impl StateSink for FlakyStore {
    async fn write_current_state(&self, view: &StateView) -> Result<(), IndexerError> {
        if self.failing_state_writes.load(Ordering::SeqCst) {
            return Err(IndexerError::Storage("connection reset".into()));
        }
        self.inner.write_current_state(view).await
    }
}

async fn latest_snapshot_block(store: &FlakyStore) -> Option<u64> {
    store.latest_snapshot().await.unwrap().map(|s| s.block_number)
}

#[tokio::test]
async fn failed_snapshot_keeps_last_good_and_retries_next_block() {
    let chain = MemoryChain::linear(100, 5, GENESIS_TS);
    chain.add_log(101, supply(ALICE, 1_000, "0xa101", 0)).unwrap();
    let chain = Arc::new(chain);
    let store = Arc::new(FlakyStore::default());
    let mut indexer = indexer_with(chain.clone(), store.clone());
    let mut events = indexer.subscribe();

    // Snapshots every 3 blocks: 100, 103.
    indexer.catch_up().await.unwrap();
    assert_eq!(latest_snapshot_block(&store).await, Some(103));

    // 106 is due and fails, the retry at 107 fails too.
    store.fail_snapshots(2);
    chain.extend(105, 3, GENESIS_TS + 60, 0);
    chain.add_log(106, supply(BOB, 5_000, "0xb106", 0)).unwrap();
    indexer.catch_up().await.unwrap();

    assert_eq!(indexer.stats().snapshot_failures, 2);
    assert_eq!(latest_snapshot_block(&store).await, Some(103));
    assert_eq!(indexer.cursor().next_block, 108);
    assert_eq!(indexer.stats().events_applied, 2);

    let failed: Vec<u64> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|e| match e {
            IndexLoopEvent::SnapshotFailed { block_number } => Some(block_number),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![106, 107]);

    // The pending snapshot is taken at the very next block.
    chain.extend(108, 1, GENESIS_TS + 96, 0);
    indexer.catch_up().await.unwrap();
    let latest = store.latest_snapshot().await.unwrap().unwrap();
    assert_eq!(latest.block_number, 108);
    assert_eq!(serde_json::to_string(&latest.state).unwrap(), state_json(&indexer));
    assert_eq!(indexer.stats().snapshot_failures, 2);
}

#[tokio::test]
async fn failed_state_write_keeps_previous_view_published() {
    let chain = MemoryChain::linear(100, 3, GENESIS_TS);
    chain.add_log(101, supply(ALICE, 1_000, "0xa101", 0)).unwrap();
    let chain = Arc::new(chain);
    let store = Arc::new(FlakyStore::default());
    let mut indexer = indexer_with(chain.clone(), store.clone());
    indexer.catch_up().await.unwrap();

    let view = indexer.view_handle().clone();
    let published = view.load();
    assert_eq!(published.block_number, Some(102));
    assert_eq!(store.inner.current_state().as_ref(), Some(published.as_ref()));

    store.fail_state_writes(true);
    chain.extend(103, 2, GENESIS_TS + 36, 0);
    chain.add_log(103, supply(BOB, 2_000, "0xb103", 0)).unwrap();
    indexer.catch_up().await.unwrap();

    // The engine moved on; readers and the state tables did not.
    assert_eq!(indexer.stats().events_applied, 2);
    assert_eq!(indexer.cursor().next_block, 105);
    assert_eq!(view.version(), published.version);
    assert_eq!(view.load(), published);
    assert_eq!(view.recent_transactions(10).await.unwrap().len(), 1);
    assert_eq!(store.inner.current_state().map(|v| v.version), Some(published.version));

    store.fail_state_writes(false);
    chain.extend(105, 1, GENESIS_TS + 60, 0);
    indexer.catch_up().await.unwrap();

    let current = view.load();
    assert_eq!(current.version, published.version + 1);
    assert_eq!(current.block_number, Some(105));
    assert_eq!(view.recent_transactions(10).await.unwrap().len(), 2);
    assert_eq!(store.inner.current_state().as_ref(), Some(current.as_ref()));
}

/// [`MemoryChain`] that reorganizes itself the first time a header at or
/// above `at` is requested, i.e. while the pipeline is fetching ahead.
struct ForkingSource {
    chain: Arc<MemoryChain>,
    at: u64,
    forked: AtomicBool,
}

#[async_trait]
impl LogSource for ForkingSource {
    async fn head_block_number(&self) -> Result<u64, IndexerError> {
        self.chain.head_block_number().await
    }

    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
        if number >= self.at && !self.forked.swap(true, Ordering::SeqCst) {
            fork_at_103(&self.chain);
        }
        self.chain.block(number).await
    }

    async fn fetch_logs(
        &self,
        filter: &EventFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError> {
        self.chain.fetch_logs(filter, from, to).await
    }
}

/// Replace 103..=109 with a branch carrying different activity.
fn fork_at_103(chain: &MemoryChain) {
    chain.reorg_from(103, 7, 1);
    chain.add_log(104, swap(ALICE, 500, "0xe104", 0)).unwrap();
    chain.add_log(107, supply(BOB, 7_000, "0xe107", 0)).unwrap();
}

#[tokio::test]
async fn reorg_during_fetch_drops_batches_from_the_old_branch() {
    let chain = busy_chain();
    let source = Arc::new(ForkingSource {
        chain: chain.clone(),
        at: 104,
        forked: AtomicBool::new(false),
    });
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer_with(source, store.clone());
    let mut events = indexer.subscribe();
    indexer.catch_up().await.unwrap();

    let seen: Vec<IndexLoopEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    let reorg_at = seen
        .iter()
        .position(|e| matches!(e, IndexLoopEvent::ReorgDetected { fork_height: 103, .. }))
        .expect("reorg reported at 103");
    // Nothing at or above the fork height was applied from the old branch.
    assert!(seen[..reorg_at]
        .iter()
        .all(|e| !matches!(e, IndexLoopEvent::BatchApplied { to, .. } if *to >= 104)));
    assert_eq!(indexer.stats().reorgs, 1);
    assert_eq!(indexer.cursor().next_block, 110);

    let fresh_store = Arc::new(InMemoryStorage::new());
    let mut fresh = crate::indexer(&chain, &fresh_store);
    fresh.catch_up().await.unwrap();
    assert_eq!(state_json(&indexer), state_json(&fresh));

    // Only block 103 of the old branch was written; its one event is orphaned.
    assert_eq!(store.orphaned_count(), 1);
    assert_eq!(store.event_count() - store.orphaned_count(), fresh_store.event_count());
    let recent = indexer.view_handle().recent_transactions(100).await.unwrap();
    assert!(recent.iter().all(|t| t.block_number < 103 || t.id.tx_hash.starts_with("0xe")));
}

// ─── Demo fixtures ───────────────────────────────────────────────────────────

#[tokio::test]
async fn demo_fixtures_decode_every_protocol() {
    let settings: serde_json::Value =
        serde_json::from_str(include_str!("../../../demos/settings.json")).unwrap();
    let section = |name: &str| settings[name].clone();
    let config: IndexerConfig = serde_json::from_value(section("indexer")).unwrap();
    let aggregator: AggregatorConfig = serde_json::from_value(section("aggregator")).unwrap();
    let protocols: ProtocolsConfig = serde_json::from_value(section("protocols")).unwrap();
    assert_eq!(DecoderSet::from_config(&protocols).unwrap().len(), 5);

    let chain = Arc::new(MemoryChain::from_json(include_str!("../../../demos/chain.json")).unwrap());
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = IndexerBuilder::new()
        .config(config)
        .aggregator(aggregator)
        .protocols(protocols)
        .source(chain.clone())
        .store(store.clone())
        .build()
        .unwrap();
    indexer.catch_up().await.unwrap();
    assert_eq!(indexer.stats().decode_warnings, 0);
    assert_eq!(indexer.stats().events_applied, 9);

    let seen: std::collections::BTreeSet<_> = indexer.engine().state().stats.keys().copied().collect();
    assert_eq!(seen.len(), 5);

    let fork: defindex_evm::ChainFixture =
        serde_json::from_str(include_str!("../../../demos/reorg.json")).unwrap();
    chain.reorg_with(&fork).unwrap();
    indexer.catch_up().await.unwrap();
    assert_eq!(indexer.stats().reorgs, 1);
    assert_eq!(indexer.cursor().next_block, 19_000_013);
    assert_eq!(store.orphaned_count(), 1);
}
