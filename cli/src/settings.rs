//! Settings file for the `defindex` binary.
//!
//! A single JSON document:
//! ```json
//! {
//!   "indexer":    { "id": "mainnet", "from_block": 19000000, ... },
//!   "aggregator": { "whale_threshold_usd": "100000", "prices": { ... } },
//!   "protocols":  { "lending": { ... }, "dex": { ... } },
//!   "log":        { "level": "info", "components": { "defindex_evm": "debug" } }
//! }
//! ```
//! Every section is optional and falls back to its defaults.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use defindex_core::config::AggregatorConfig;
use defindex_core::error::IndexerError;
use defindex_core::indexer::IndexerConfig;
use defindex_evm::ProtocolsConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub indexer: IndexerConfig,
    pub aggregator: AggregatorConfig,
    pub protocols: ProtocolsConfig,
    pub log: LogConfig,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&text)
            .with_context(|| format!("parsing settings file {}", path.display()))?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        self.indexer.validate()?;
        self.aggregator.validate()?;
        self.protocols.validate()
    }
}

/// Logging setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level for every target.
    pub level: String,
    /// Per-target overrides, e.g. `"defindex_storage" → "debug"`.
    pub components: BTreeMap<String, String>,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directives: the default level, then per-target overrides.
    pub fn directives(&self) -> String {
        std::iter::once(self.level.clone())
            .chain(
                self.components
                    .iter()
                    .map(|(target, level)| format!("{target}={level}")),
            )
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Install the global subscriber. `RUST_LOG` wins over the settings.
    /// Logs go to stderr so `--json` output on stdout stays parseable.
    pub fn init(&self) -> Result<()> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(self.directives())
                .with_context(|| format!("invalid log filter '{}'", self.directives()))?,
        };
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        let installed = if self.json {
            builder.json().try_init()
        } else {
            builder.with_target(true).try_init()
        };
        installed.map_err(|e| anyhow::anyhow!("installing log subscriber: {e}"))
    }
}
