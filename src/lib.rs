// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # CDC Router
//!
//! A change-data-capture routing engine: reads captured database changes,
//! decides which nodes should receive each one, and groups the routed
//! changes into outgoing batches for transmission.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            RouterEngine                              │
//! │                                                                      │
//! │  ┌────────────┐   ┌──────────────┐   ┌───────────────────────────┐   │
//! │  │ GapTracker │──►│ ChangeReader │──►│ ChannelPass               │   │
//! │  │ (what's    │   │ (peek-ahead  │   │ (rules -> strategies ->   │   │
//! │  │  unrouted) │   │  producer)   │   │  batches + data events)   │   │
//! │  └────────────┘   └──────────────┘   └───────────────────────────┘   │
//! │        ▲                 │                        │                  │
//! │        │                 ▼                        ▼                  │
//! │        │          ┌─────────────────────────────────────────┐        │
//! │        └──────────│            ChangeStore (SQLite)         │        │
//! │                   │ change_data · data_gap · outgoing_batch │        │
//! │                   └─────────────────────────────────────────┘        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Change identifiers are assigned at capture time, so the sequence routing
//! sees has holes (rolled-back and still-open transactions). The gap
//! tracker keeps the set of unseen identifier ranges; the reader scans only
//! those ranges, regrouping rows by source transaction; the channel pass
//! dispatches pluggable [`RouteStrategy`] implementations per routing rule
//! and fills per-node batches. Batches, data events and gap updates commit
//! in one transaction per channel pass.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cdc_router::{RouterConfig, RouterEngine, RouteRule, StaticRuleSource};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let rules = Arc::new(
//!         StaticRuleSource::new()
//!             .add_rule(RouteRule::new("item-to-stores", "default", "item", "stores"))
//!             .add_group("stores", &["store-1", "store-2"]),
//!     );
//!     let mut engine = RouterEngine::new(RouterConfig::default(), rules)
//!         .await
//!         .expect("failed to open the change store");
//!
//!     let routed = engine.route(false).await.expect("routing run failed");
//!     println!("routed {routed} rows");
//! }
//! ```

pub mod batching;
pub mod config;
pub mod context;
pub mod error;
pub mod gaps;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod reader;
pub mod router;
pub mod store;
pub mod strategy;

// Re-exports for convenience
pub use batching::{BatchPolicy, PolicyRegistry};
pub use config::{ChannelConfig, GapConfig, ReaderConfig, RouterConfig, RoutingConfig, StoreConfig};
pub use context::{PassCache, RoutingContext};
pub use error::{Result, RouterError};
pub use gaps::{GapTracker, NoTransactionView, TransactionMonitor};
pub use lock::{ClusterLock, ProcessLock};
pub use model::{ChangeRow, DataEvent, EventKind, Gap, OutgoingBatch};
pub use reader::{ChangeReader, ReaderHandle, ReaderSummary};
pub use router::{RouterEngine, StopHandle};
pub use store::{ChangeStore, GapPredicate, Projection};
pub use strategy::{
    ColumnMatchStrategy, DefaultStrategy, RouteRule, RouteStrategy, RowMetadata, RuleSource,
    StaticRuleSource, StrategyRegistry, TableDef,
};
