//! `defindex replay`: index a JSON chain fixture and print the query surface.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Serialize;

use defindex_core::aggregator::RecentTransaction;
use defindex_core::flow::CapitalFlow;
use defindex_core::health::ProtocolHealthSnapshot;
use defindex_core::query::{ProtocolStatsRow, QueryStore, WhaleRow};
use defindex_core::store::IndexStore;
use defindex_evm::{ChainFixture, IndexLoop, IndexLoopEvent, IndexerBuilder, LoopStats, MemoryChain};
use defindex_storage::InMemoryStorage;

use crate::settings::Settings;

pub struct ReplayArgs<'a> {
    pub fixture: &'a Path,
    pub reorg: Option<&'a Path>,
    pub db: Option<&'a str>,
    pub limit: usize,
    pub json: bool,
}

#[derive(Serialize)]
struct Report {
    version: u64,
    block_number: Option<u64>,
    block_hash: Option<String>,
    loop_stats: LoopStats,
    stats: Vec<ProtocolStatsRow>,
    health: Vec<ProtocolHealthSnapshot>,
    whales: Vec<WhaleRow>,
    flows: Vec<CapitalFlow>,
    recent: Vec<RecentTransaction>,
}

fn read_fixture(path: &Path) -> Result<ChainFixture> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing fixture {}", path.display()))
}

async fn open_store(db: Option<&str>) -> Result<Arc<dyn IndexStore>> {
    match db {
        None => Ok(Arc::new(InMemoryStorage::new())),
        #[cfg(feature = "sqlite")]
        Some(path) => {
            let store = defindex_storage::SqliteStorage::open(path)
                .await
                .with_context(|| format!("opening SQLite database {path}"))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        Some(_) => anyhow::bail!("--db requires the `sqlite` feature"),
    }
}

pub async fn run(settings: Settings, args: ReplayArgs<'_>) -> Result<()> {
    let fixture = read_fixture(args.fixture)?;
    let chain = Arc::new(MemoryChain::from_fixture(&fixture)?);

    let mut config = settings.indexer.clone();
    if let Some(first) = fixture.blocks.iter().map(|b| b.number).min() {
        if config.from_block < first {
            tracing::info!(from_block = first, "Starting at the first fixture block");
            config.from_block = first;
        }
    }

    let store = open_store(args.db).await?;
    let mut indexer = IndexerBuilder::new()
        .config(config)
        .aggregator(settings.aggregator.clone())
        .protocols(settings.protocols.clone())
        .source(chain.clone())
        .store(store)
        .build()
        .context("assembling indexer")?;
    let mut events = indexer.subscribe();

    indexer.catch_up().await.context("indexing fixture")?;

    if let Some(path) = args.reorg {
        let replacement = read_fixture(path)?;
        chain
            .reorg_with(&replacement)
            .with_context(|| format!("applying reorg fixture {}", path.display()))?;
        indexer.catch_up().await.context("indexing reorganized fixture")?;
    }

    while let Ok(event) = events.try_recv() {
        log_event(&event);
    }

    let report = report(&indexer, args.limit).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn log_event(event: &IndexLoopEvent) {
    match event {
        IndexLoopEvent::ReorgDetected {
            fork_height,
            depth,
            reorg_type,
        } => tracing::info!(fork_height, depth, %reorg_type, "Replay saw reorg"),
        IndexLoopEvent::SnapshotFailed { block_number } => {
            tracing::warn!(block = block_number, "Replay saw snapshot failure")
        }
        other => tracing::debug!(?other, "Index loop event"),
    }
}

async fn report(indexer: &IndexLoop, limit: usize) -> Result<Report> {
    let view = indexer.view_handle();
    let current = view.current_view().await?;
    Ok(Report {
        version: current.version,
        block_number: current.block_number,
        block_hash: current.block_hash.clone(),
        loop_stats: indexer.stats().clone(),
        stats: view.all_protocol_stats().await?,
        health: view.protocol_health(None).await?,
        whales: view.whale_activity(limit, Decimal::ZERO).await?,
        flows: view.capital_flows(limit).await?,
        recent: view.recent_transactions(limit).await?,
    })
}

// ─── Text output ─────────────────────────────────────────────────────────────

fn print_report(r: &Report) {
    println!(
        "Indexed to block {} (view v{})",
        r.block_number.map_or("-".to_string(), |b| b.to_string()),
        r.version
    );
    let s = &r.loop_stats;
    println!(
        "  {} blocks, {} events, {} decode warnings, {} conflicts, {} reorgs",
        s.blocks, s.events_applied, s.decode_warnings, s.conflicts, s.reorgs
    );

    println!("\nProtocols:");
    println!(
        "  {:<11} {:>16} {:>8} {:>16} {:>8} {:>7}  {}",
        "protocol", "tvl_usd", "util", "volume_24h_usd", "tx_24h", "tps", "status"
    );
    for row in &r.stats {
        println!(
            "  {:<11} {:>16} {:>8} {:>16} {:>8} {:>7}  {:?}",
            row.protocol.to_string(),
            row.tvl_usd.round_dp(2),
            row.utilization.round_dp(4),
            row.volume_24h_usd.round_dp(2),
            row.tx_count_24h,
            row.tps.round_dp(3),
            row.status
        );
    }

    if !r.health.is_empty() {
        println!("\nHealth:");
        for h in &r.health {
            let warnings: Vec<String> = h.warnings.iter().map(|w| format!("{w:?}")).collect();
            println!(
                "  {:<11} score {:>6}  at block {}  {}",
                h.protocol.to_string(),
                h.score,
                h.block_number,
                warnings.join(", ")
            );
        }
    }

    println!("\nWallets:");
    for w in &r.whales {
        println!(
            "  {} {:>16} USD  {} tx  {} moves{}",
            w.activity.wallet,
            w.activity.total_volume_usd.round_dp(2),
            w.activity.tx_count,
            w.activity.cross_protocol_moves,
            if w.is_whale { "  [whale]" } else { "" }
        );
    }

    println!("\nCapital flows:");
    if r.flows.is_empty() {
        println!("  (none)");
    }
    for f in &r.flows {
        println!(
            "  block {:<10} {} {} -> {} {} {} ({}, {}s)",
            f.block_number,
            f.wallet,
            f.from_protocol,
            f.to_protocol,
            f.amount,
            f.token,
            f.flow_type,
            f.time_delta_secs
        );
    }

    println!("\nRecent transactions:");
    for tx in &r.recent {
        println!(
            "  block {:<10} {:<11} {:<16} {} {}",
            tx.block_number,
            tx.protocol.to_string(),
            tx.kind.to_string(),
            tx.wallet,
            tx.volume_usd
                .map_or("unpriced".to_string(), |v| format!("{} USD", v.round_dp(2)))
        );
    }
}
