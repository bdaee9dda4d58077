//! SQLite storage backend for DefIndex.
//!
//! Persists the canonical event/block log, aggregate-state snapshots, and
//! the current-state tables mirrored from each published view, all in a
//! single SQLite file. Uses `sqlx` with WAL mode for concurrent read
//! performance.
//!
//! # Usage
//! ```rust,no_run
//! use defindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./defindex.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use defindex_core::error::IndexerError;
use defindex_core::event::DomainEvent;
use defindex_core::query::StateView;
use defindex_core::snapshot::StateSnapshot;
use defindex_core::store::{EventLog, SnapshotStore, StateSink};
use defindex_core::types::BlockSummary;

fn storage_err(e: impl std::fmt::Display) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        tx_hash      TEXT    NOT NULL,
        log_index    INTEGER NOT NULL,
        block_number INTEGER NOT NULL,
        block_hash   TEXT    NOT NULL,
        protocol     TEXT    NOT NULL,
        kind         TEXT    NOT NULL,
        wallet       TEXT    NOT NULL,
        timestamp    INTEGER NOT NULL,
        event_json   TEXT    NOT NULL,
        orphaned     INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (tx_hash, log_index)
    );",
    "CREATE INDEX IF NOT EXISTS idx_events_position ON events (block_number, log_index);",
    "CREATE INDEX IF NOT EXISTS idx_events_wallet ON events (wallet);",
    "CREATE TABLE IF NOT EXISTS blocks (
        block_number INTEGER PRIMARY KEY,
        block_hash   TEXT    NOT NULL,
        parent_hash  TEXT    NOT NULL,
        timestamp    INTEGER NOT NULL,
        tx_count     INTEGER NOT NULL,
        base_fee     INTEGER,
        orphaned     INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE TABLE IF NOT EXISTS snapshots (
        block_number INTEGER PRIMARY KEY,
        block_hash   TEXT    NOT NULL,
        taken_at     INTEGER NOT NULL,
        state_json   TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS protocol_stats (
        protocol              TEXT PRIMARY KEY,
        tvl_usd               TEXT NOT NULL,
        volume_24h_usd        TEXT NOT NULL,
        cumulative_volume_usd TEXT NOT NULL,
        tx_count_24h          INTEGER NOT NULL,
        cumulative_tx_count   INTEGER NOT NULL,
        tps                   TEXT NOT NULL,
        last_updated_block    INTEGER NOT NULL,
        last_updated_at       INTEGER NOT NULL,
        stale_since           INTEGER,
        row_json              TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS whale_activity (
        wallet           TEXT PRIMARY KEY,
        total_volume_usd TEXT    NOT NULL,
        tx_count         INTEGER NOT NULL,
        is_whale         INTEGER NOT NULL,
        row_json         TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS capital_flows (
        from_tx_hash   TEXT    NOT NULL,
        from_log_index INTEGER NOT NULL,
        to_tx_hash     TEXT    NOT NULL,
        to_log_index   INTEGER NOT NULL,
        wallet         TEXT    NOT NULL,
        flow_type      TEXT    NOT NULL,
        block_number   INTEGER NOT NULL,
        row_json       TEXT    NOT NULL,
        PRIMARY KEY (from_tx_hash, from_log_index, to_tx_hash, to_log_index)
    );",
    "CREATE TABLE IF NOT EXISTS protocol_health (
        protocol  TEXT PRIMARY KEY,
        timestamp INTEGER NOT NULL,
        score     TEXT    NOT NULL,
        row_json  TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS state_meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );",
];

/// SQLite-backed event log, snapshot store and current-state tables.
pub struct SqliteStorage {
    pool: SqlitePool,
    written: Mutex<WrittenRows>,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./defindex.db"`) or a full
    /// SQLite URL (`"sqlite:./defindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let storage = Self {
            pool,
            written: Mutex::default(),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// The pool is pinned to a single connection so every query sees the
    /// same database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self {
            pool,
            written: Mutex::default(),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    /// Total number of logged events, orphaned ones included.
    pub async fn event_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }

    /// Number of orphaned events.
    pub async fn orphaned_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM events WHERE orphaned = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }

    /// Version of the view last written to the current-state tables.
    pub async fn current_version(&self) -> Result<Option<u64>, IndexerError> {
        let row = sqlx::query("SELECT value FROM state_meta WHERE key = 'version'")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.and_then(|r| r.get::<String, _>("value").parse().ok()))
    }

    /// Wallets currently flagged as whales, largest volume first.
    pub async fn whale_wallets(&self, limit: usize) -> Result<Vec<String>, IndexerError> {
        let rows = sqlx::query(
            "SELECT wallet FROM whale_activity WHERE is_whale = 1
             ORDER BY CAST(total_volume_usd AS REAL) DESC, wallet LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.into_iter().map(|r| r.get("wallet")).collect())
    }
}

// ─── EventLog impl ───────────────────────────────────────────────────────────

#[async_trait]
impl EventLog for SqliteStorage {
    async fn append_blocks(&self, blocks: &[BlockSummary]) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for block in blocks {
            sqlx::query(
                "INSERT INTO blocks
                 (block_number, block_hash, parent_hash, timestamp, tx_count, base_fee, orphaned)
                 VALUES (?, ?, ?, ?, ?, ?, 0)
                 ON CONFLICT(block_number) DO UPDATE SET
                    block_hash = excluded.block_hash,
                    parent_hash = excluded.parent_hash,
                    timestamp = excluded.timestamp,
                    tx_count = excluded.tx_count,
                    base_fee = excluded.base_fee,
                    orphaned = 0
                 WHERE blocks.orphaned = 1",
            )
            .bind(block.number as i64)
            .bind(&block.hash)
            .bind(&block.parent_hash)
            .bind(block.timestamp)
            .bind(block.tx_count as i64)
            .bind(block.base_fee_per_gas.map(|f| f as i64))
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn append_events(&self, events: &[DomainEvent]) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for event in events {
            let json = serde_json::to_string(event).map_err(storage_err)?;
            sqlx::query(
                "INSERT INTO events
                 (tx_hash, log_index, block_number, block_hash, protocol, kind, wallet,
                  timestamp, event_json, orphaned)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
                 ON CONFLICT(tx_hash, log_index) DO UPDATE SET
                    block_number = excluded.block_number,
                    block_hash = excluded.block_hash,
                    protocol = excluded.protocol,
                    kind = excluded.kind,
                    wallet = excluded.wallet,
                    timestamp = excluded.timestamp,
                    event_json = excluded.event_json,
                    orphaned = 0
                 WHERE events.orphaned = 1",
            )
            .bind(&event.id.tx_hash)
            .bind(event.id.log_index as i64)
            .bind(event.block_number as i64)
            .bind(&event.block_hash)
            .bind(event.protocol.as_str())
            .bind(event.kind().as_str())
            .bind(&event.wallet)
            .bind(event.timestamp)
            .bind(&json)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        debug!(count = events.len(), "events stored");
        Ok(())
    }

    async fn events_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<DomainEvent>, IndexerError> {
        let rows = sqlx::query(
            "SELECT event_json FROM events
             WHERE orphaned = 0 AND block_number >= ? AND block_number <= ?
             ORDER BY block_number, log_index",
        )
        .bind(from as i64)
        .bind(to.min(i64::MAX as u64) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.into_iter()
            .map(|row| {
                let json: String = row.get("event_json");
                serde_json::from_str(&json).map_err(storage_err)
            })
            .collect()
    }

    async fn blocks_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<BlockSummary>, IndexerError> {
        let rows = sqlx::query(
            "SELECT block_number, block_hash, parent_hash, timestamp, tx_count, base_fee
             FROM blocks
             WHERE orphaned = 0 AND block_number >= ? AND block_number <= ?
             ORDER BY block_number",
        )
        .bind(from as i64)
        .bind(to.min(i64::MAX as u64) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|r| BlockSummary {
                number: r.get::<i64, _>("block_number") as u64,
                hash: r.get("block_hash"),
                parent_hash: r.get("parent_hash"),
                timestamp: r.get("timestamp"),
                tx_count: r.get::<i64, _>("tx_count") as u32,
                base_fee_per_gas: r.get::<Option<i64>, _>("base_fee").map(|f| f as u64),
            })
            .collect())
    }

    async fn orphan_from(&self, height: u64) -> Result<u64, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let events = sqlx::query(
            "UPDATE events SET orphaned = 1 WHERE orphaned = 0 AND block_number >= ?",
        )
        .bind(height as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        sqlx::query("UPDATE blocks SET orphaned = 1 WHERE block_number >= ?")
            .bind(height as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        let orphaned = events.rows_affected();
        debug!(height, orphaned, "orphaned log entries");
        Ok(orphaned)
    }
}

// ─── SnapshotStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl SnapshotStore for SqliteStorage {
    async fn save_snapshot(&self, snapshot: &StateSnapshot) -> Result<(), IndexerError> {
        let state = serde_json::to_string(&snapshot.state).map_err(storage_err)?;
        sqlx::query(
            "INSERT OR REPLACE INTO snapshots (block_number, block_hash, taken_at, state_json)
             VALUES (?, ?, ?, ?)",
        )
        .bind(snapshot.block_number as i64)
        .bind(&snapshot.block_hash)
        .bind(snapshot.taken_at)
        .bind(&state)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(block = snapshot.block_number, "snapshot saved");
        Ok(())
    }

    async fn latest_snapshot_below(
        &self,
        height: u64,
    ) -> Result<Option<StateSnapshot>, IndexerError> {
        let row = sqlx::query(
            "SELECT block_number, block_hash, taken_at, state_json FROM snapshots
             WHERE block_number < ? ORDER BY block_number DESC LIMIT 1",
        )
        .bind(height.min(i64::MAX as u64) as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(|r| -> Result<StateSnapshot, IndexerError> {
            let json: String = r.get("state_json");
            Ok(StateSnapshot {
                block_number: r.get::<i64, _>("block_number") as u64,
                block_hash: r.get("block_hash"),
                taken_at: r.get("taken_at"),
                state: serde_json::from_str(&json).map_err(storage_err)?,
            })
        })
        .transpose()
    }

    async fn prune_snapshots_from(&self, height: u64) -> Result<u64, IndexerError> {
        let result = sqlx::query("DELETE FROM snapshots WHERE block_number >= ?")
            .bind(height as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn retain_snapshots(&self, keep: usize) -> Result<(), IndexerError> {
        sqlx::query(
            "DELETE FROM snapshots WHERE block_number NOT IN (
                SELECT block_number FROM snapshots ORDER BY block_number DESC LIMIT ?
             )",
        )
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

// ─── StateSink impl ──────────────────────────────────────────────────────────

type FlowKey = (String, i64, String, i64);

/// `row_json` of every current-state row as last committed, by primary key.
#[derive(Default)]
struct WrittenRows {
    loaded: bool,
    stats: BTreeMap<String, String>,
    whales: BTreeMap<String, String>,
    flows: BTreeMap<FlowKey, String>,
    health: BTreeMap<String, String>,
}

impl WrittenRows {
    async fn load(conn: &mut SqliteConnection) -> Result<Self, IndexerError> {
        let mut rows = Self {
            loaded: true,
            ..Self::default()
        };
        for r in sqlx::query("SELECT protocol, row_json FROM protocol_stats")
            .fetch_all(&mut *conn)
            .await
            .map_err(storage_err)?
        {
            rows.stats.insert(r.get("protocol"), r.get("row_json"));
        }
        for r in sqlx::query("SELECT wallet, row_json FROM whale_activity")
            .fetch_all(&mut *conn)
            .await
            .map_err(storage_err)?
        {
            rows.whales.insert(r.get("wallet"), r.get("row_json"));
        }
        for r in sqlx::query(
            "SELECT from_tx_hash, from_log_index, to_tx_hash, to_log_index, row_json
             FROM capital_flows",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_err)?
        {
            let key: FlowKey = (
                r.get("from_tx_hash"),
                r.get("from_log_index"),
                r.get("to_tx_hash"),
                r.get("to_log_index"),
            );
            rows.flows.insert(key, r.get("row_json"));
        }
        for r in sqlx::query("SELECT protocol, row_json FROM protocol_health")
            .fetch_all(&mut *conn)
            .await
            .map_err(storage_err)?
        {
            rows.health.insert(r.get("protocol"), r.get("row_json"));
        }
        Ok(rows)
    }
}

/// Rows of `next` whose JSON differs from `prev`, and keys of `prev` that
/// `next` no longer has.
fn diff<'a, K: Ord + Clone, R>(
    prev: &BTreeMap<K, String>,
    next: &'a BTreeMap<K, (R, String)>,
) -> (Vec<(&'a K, &'a R, &'a str)>, Vec<K>) {
    let changed = next
        .iter()
        .filter(|(key, (_, json))| prev.get(*key) != Some(json))
        .map(|(key, (row, json))| (key, row, json.as_str()))
        .collect();
    let removed = prev.keys().filter(|k| !next.contains_key(*k)).cloned().collect();
    (changed, removed)
}

fn keyed_json<K: Ord, R>(
    rows: impl IntoIterator<Item = R>,
    key: impl Fn(&R) -> K,
    json: impl Fn(&R) -> serde_json::Result<String>,
) -> Result<BTreeMap<K, (R, String)>, IndexerError> {
    rows.into_iter()
        .map(|row| {
            let json = json(&row).map_err(storage_err)?;
            Ok((key(&row), (row, json)))
        })
        .collect()
}

fn committed<K: Ord, R>(next: BTreeMap<K, (R, String)>) -> BTreeMap<K, String> {
    next.into_iter().map(|(k, (_, json))| (k, json)).collect()
}

#[async_trait]
impl StateSink for SqliteStorage {
    /// Upsert the rows that changed since the last committed view and delete
    /// the ones it no longer contains. Unchanged rows are not touched.
    async fn write_current_state(&self, view: &StateView) -> Result<(), IndexerError> {
        let mut written = self.written.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        if !written.loaded {
            *written = WrittenRows::load(&mut *tx).await?;
        }

        let stats = keyed_json(
            &view.stats,
            |r| r.protocol.as_str().to_string(),
            |r| serde_json::to_string(r),
        )?;
        let whales = keyed_json(
            &view.whales,
            |r| r.activity.wallet.clone(),
            |r| serde_json::to_string(r),
        )?;
        let flows = keyed_json(
            &view.flows,
            |f| {
                (
                    f.from_event.tx_hash.clone(),
                    i64::from(f.from_event.log_index),
                    f.to_event.tx_hash.clone(),
                    i64::from(f.to_event.log_index),
                )
            },
            |f| serde_json::to_string(f),
        )?;
        let health = keyed_json(
            &view.health,
            |h| h.protocol.as_str().to_string(),
            |h| serde_json::to_string(h),
        )?;
        let mut upserted = 0usize;
        let mut deleted = 0usize;

        let (changed, removed) = diff(&written.stats, &stats);
        upserted += changed.len();
        for (_, row, json) in changed {
            sqlx::query(
                "INSERT INTO protocol_stats
                 (protocol, tvl_usd, volume_24h_usd, cumulative_volume_usd, tx_count_24h,
                  cumulative_tx_count, tps, last_updated_block, last_updated_at, stale_since,
                  row_json)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(protocol) DO UPDATE SET
                    tvl_usd = excluded.tvl_usd,
                    volume_24h_usd = excluded.volume_24h_usd,
                    cumulative_volume_usd = excluded.cumulative_volume_usd,
                    tx_count_24h = excluded.tx_count_24h,
                    cumulative_tx_count = excluded.cumulative_tx_count,
                    tps = excluded.tps,
                    last_updated_block = excluded.last_updated_block,
                    last_updated_at = excluded.last_updated_at,
                    stale_since = excluded.stale_since,
                    row_json = excluded.row_json",
            )
            .bind(row.protocol.as_str())
            .bind(row.tvl_usd.to_string())
            .bind(row.volume_24h_usd.to_string())
            .bind(row.cumulative_volume_usd.to_string())
            .bind(row.tx_count_24h as i64)
            .bind(row.cumulative_tx_count as i64)
            .bind(row.tps.to_string())
            .bind(row.last_updated_block as i64)
            .bind(row.last_updated_at)
            .bind(row.stale_since)
            .bind(json)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        deleted += removed.len();
        for protocol in removed {
            sqlx::query("DELETE FROM protocol_stats WHERE protocol = ?")
                .bind(protocol)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }

        let (changed, removed) = diff(&written.whales, &whales);
        upserted += changed.len();
        for (_, row, json) in changed {
            sqlx::query(
                "INSERT INTO whale_activity (wallet, total_volume_usd, tx_count, is_whale, row_json)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(wallet) DO UPDATE SET
                    total_volume_usd = excluded.total_volume_usd,
                    tx_count = excluded.tx_count,
                    is_whale = excluded.is_whale,
                    row_json = excluded.row_json",
            )
            .bind(&row.activity.wallet)
            .bind(row.activity.total_volume_usd.to_string())
            .bind(row.activity.tx_count as i64)
            .bind(row.is_whale)
            .bind(json)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        deleted += removed.len();
        for wallet in removed {
            sqlx::query("DELETE FROM whale_activity WHERE wallet = ?")
                .bind(wallet)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }

        let (changed, removed) = diff(&written.flows, &flows);
        upserted += changed.len();
        for ((from_tx, from_index, to_tx, to_index), flow, json) in changed {
            sqlx::query(
                "INSERT INTO capital_flows
                 (from_tx_hash, from_log_index, to_tx_hash, to_log_index, wallet, flow_type,
                  block_number, row_json)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(from_tx_hash, from_log_index, to_tx_hash, to_log_index)
                 DO UPDATE SET
                    wallet = excluded.wallet,
                    flow_type = excluded.flow_type,
                    block_number = excluded.block_number,
                    row_json = excluded.row_json",
            )
            .bind(from_tx)
            .bind(*from_index)
            .bind(to_tx)
            .bind(*to_index)
            .bind(&flow.wallet)
            .bind(flow.flow_type.to_string())
            .bind(flow.block_number as i64)
            .bind(json)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        deleted += removed.len();
        for (from_tx, from_index, to_tx, to_index) in removed {
            sqlx::query(
                "DELETE FROM capital_flows WHERE from_tx_hash = ? AND from_log_index = ?
                 AND to_tx_hash = ? AND to_log_index = ?",
            )
            .bind(from_tx)
            .bind(from_index)
            .bind(to_tx)
            .bind(to_index)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        let (changed, removed) = diff(&written.health, &health);
        upserted += changed.len();
        for (_, snapshot, json) in changed {
            sqlx::query(
                "INSERT INTO protocol_health (protocol, timestamp, score, row_json)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(protocol) DO UPDATE SET
                    timestamp = excluded.timestamp,
                    score = excluded.score,
                    row_json = excluded.row_json",
            )
            .bind(snapshot.protocol.as_str())
            .bind(snapshot.timestamp)
            .bind(snapshot.score.to_string())
            .bind(json)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        deleted += removed.len();
        for protocol in removed {
            sqlx::query("DELETE FROM protocol_health WHERE protocol = ?")
                .bind(protocol)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }

        sqlx::query(
            "INSERT INTO state_meta (key, value) VALUES ('version', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(view.version.to_string())
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        written.stats = committed(stats);
        written.whales = committed(whales);
        written.flows = committed(flows);
        written.health = committed(health);
        debug!(version = view.version, upserted, deleted, "current state written");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
