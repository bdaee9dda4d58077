//! defindex-core: domain model and aggregation engine for the multi-protocol
//! DeFi indexer.
//!
//! # Architecture
//!
//! ```text
//! IndexLoop (defindex-evm)
//!     ├── BlockTracker      (recent headers, parent hash chain)
//!     ├── ReorgDetector     (parent / hash mismatch, head regression)
//!     ├── AggregationEngine (stats, whales, flows, health)
//!     ├── SnapshotManager   (rewind points, crash recovery)
//!     └── IndexStore        (event log, snapshots, current state)
//!                 │
//!                 ▼
//!           ViewHandle ──► QueryStore (readers)
//! ```

pub mod aggregator;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod flow;
pub mod health;
pub mod indexer;
pub mod price;
pub mod query;
pub mod reorg;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod tracker;
pub mod types;
pub mod whale;
pub mod window;

pub use aggregator::{AggregateState, AggregationEngine, ApplyOutcome, BatchReport, RecentTransaction};
pub use config::{AggregatorConfig, FlowConfig, HealthConfig};
pub use cursor::Cursor;
pub use error::{AggregationError, DecodeError, IndexerError};
pub use event::{DomainEvent, EventKind, EventPayload, TokenAmount};
pub use flow::{CapitalFlow, FlowType};
pub use health::{ProtocolHealthSnapshot, WarningCode};
pub use indexer::{IndexerConfig, IndexerState};
pub use price::{PriceOracle, StaticPriceOracle};
pub use query::{ProtocolStatsRow, QueryStore, StateView, ViewHandle, WhaleRow};
pub use reorg::{ReorgDetector, ReorgEvent, ReorgType};
pub use snapshot::{SnapshotManager, StateSnapshot};
pub use stats::ProtocolStats;
pub use store::{EventLog, IndexStore, SnapshotStore, StateSink};
pub use tracker::BlockTracker;
pub use types::{BlockSummary, EventFilter, EventId, EventPosition, ProtocolId};
pub use whale::WhaleActivity;
