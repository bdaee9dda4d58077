//! DefIndex CLI: validate settings and replay chain fixtures through the indexer.
//!
//! # Commands
//! ```bash
//! defindex info
//! defindex check-config --settings settings.json
//! defindex replay --settings settings.json --fixture chain.json [--reorg fork.json] [--json]
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use defindex_core::indexer::IndexerConfig;
use defindex_evm::DecoderSet;

mod cmd_replay;
mod settings;

use settings::Settings;

#[derive(Parser)]
#[command(
    name = "defindex",
    about = "Multi-protocol DeFi event indexer",
    long_about = "
DefIndex: decode DEX, lending, liquid staking, stableswap and CDP events,
aggregate them into protocol stats, whale activity, capital flows and
health scores, and survive chain reorganizations.

ENVIRONMENT VARIABLES:
  RUST_LOG    Overrides the log filter from the settings file
",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show build and capability info
    Info,

    /// Parse and validate a settings file
    #[command(name = "check-config")]
    CheckConfig {
        /// Path to the JSON settings file
        #[arg(short, long)]
        settings: PathBuf,
    },

    /// Index a JSON chain fixture and print the resulting state
    Replay {
        /// Path to the JSON settings file
        #[arg(short, long)]
        settings: PathBuf,
        /// Chain fixture to index
        #[arg(short, long)]
        fixture: PathBuf,
        /// Replacement blocks applied as a reorg after the first pass
        #[arg(long)]
        reorg: Option<PathBuf>,
        /// SQLite database path (requires the `sqlite` feature)
        #[arg(long)]
        db: Option<String>,
        /// Rows per listing
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Info => cmd_info(),

        Commands::CheckConfig { settings } => cmd_check_config(&settings),

        Commands::Replay {
            settings,
            fixture,
            reorg,
            db,
            limit,
            json,
        } => {
            let settings = load_settings(&settings)?;
            settings.log.init()?;
            cmd_replay::run(
                settings,
                cmd_replay::ReplayArgs {
                    fixture: &fixture,
                    reorg: reorg.as_deref(),
                    db: db.as_deref(),
                    limit,
                    json,
                },
            )
            .await
        }
    }
}

fn load_settings(path: &std::path::Path) -> Result<Settings> {
    let settings = Settings::load(path)?;
    settings
        .validate()
        .with_context(|| format!("invalid settings in {}", path.display()))?;
    Ok(settings)
}

// ─── Command implementations ─────────────────────────────────────────────────

fn cmd_info() -> Result<()> {
    let defaults = IndexerConfig::default();
    println!("DefIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Protocols: dex (pool manager), lending, staking, stableswap, cdp");
    println!("  Default confirmation depth: {} blocks", defaults.confirmation_depth);
    println!("  Default batch size: {} blocks", defaults.batch_size);
    println!("  Default snapshot interval: every {} blocks", defaults.snapshot_interval);
    println!("  Reorg window: {} blocks", defaults.tracker_window);
    if cfg!(feature = "sqlite") {
        println!("  Storage backends: memory, SQLite");
    } else {
        println!("  Storage backends: memory (SQLite: build with --features sqlite)");
    }
    Ok(())
}

fn cmd_check_config(path: &std::path::Path) -> Result<()> {
    let settings = load_settings(path)?;
    let decoders = DecoderSet::from_config(&settings.protocols).context("building decoders")?;

    let ix = &settings.indexer;
    println!("✓ {} is valid", path.display());
    println!("  Indexer: {} on {}", ix.id, ix.chain);
    println!(
        "  Range: {} → {}",
        ix.from_block,
        ix.to_block.map_or("head".to_string(), |b| b.to_string())
    );
    println!(
        "  Confirmation depth: {}, batch size: {}, snapshot every {} blocks",
        ix.confirmation_depth, ix.batch_size, ix.snapshot_interval
    );
    if decoders.is_empty() {
        println!("  Protocols: none configured");
    } else {
        let names: Vec<String> = decoders.protocols().iter().map(|p| p.to_string()).collect();
        println!("  Protocols: {}", names.join(", "));
    }
    println!(
        "  Whale threshold: {} USD, {} priced tokens",
        settings.aggregator.whale_threshold_usd,
        settings.aggregator.prices.len()
    );
    Ok(())
}
