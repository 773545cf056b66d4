// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the CDC router.
//!
//! Configuration is passed to [`RouterEngine::new()`](crate::RouterEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Configuration Structure
//!
//! ```text
//! RouterConfig
//! ├── node_id: String              # This node's unique ID (routing source)
//! ├── node_group_id: String        # Group the node belongs to
//! ├── channels: Vec<ChannelConfig> # Independent routing lanes
//! ├── gaps: GapConfig              # Gap tracker tuning
//! ├── reader: ReaderConfig         # Change reader tuning
//! ├── routing: RoutingConfig       # Orchestrator tuning
//! └── store: StoreConfig           # SQLite change store
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "corp-0"
//! node_group_id: "corp"
//!
//! channels:
//!   - channel_id: "default"
//!     max_batch_size: 10000
//!   - channel_id: "config"
//!     batch_algorithm: "nontransactional"
//!
//! gaps:
//!   stale_gap_timeout: "2h"
//!   max_gap_size: 50000000
//!
//! reader:
//!   peek_ahead_window: 1000
//!   queue_timeout: "330s"
//!
//! store:
//!   sqlite_path: "/var/lib/app/changes.db"
//! ```

use crate::error::{Result, RouterError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from daemon to RouterEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `RouterEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// The identity of the local node running this engine.
    /// Changes are never routed back to this id.
    pub node_id: String,

    /// Node group this node belongs to. Rules target groups; candidate
    /// nodes are resolved per group.
    #[serde(default = "default_node_group")]
    pub node_group_id: String,

    /// Routing channels. Each channel is routed independently, in order.
    pub channels: Vec<ChannelConfig>,

    #[serde(default)]
    pub gaps: GapConfig,

    #[serde(default)]
    pub reader: ReaderConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_node_group() -> String {
    "default".to_string()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            node_id: "local-0".to_string(),
            node_group_id: "default".to_string(),
            channels: vec![ChannelConfig::named("default")],
            gaps: GapConfig::default(),
            reader: ReaderConfig::default(),
            routing: RoutingConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Create a minimal config for testing, against an in-memory database.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_group_id: "test-group".to_string(),
            channels: vec![ChannelConfig::named("default")],
            gaps: GapConfig::default(),
            reader: ReaderConfig::default(),
            routing: RoutingConfig::default(),
            store: StoreConfig::in_memory(),
        }
    }

    /// Validate cross-field constraints before the engine starts.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(RouterError::Config("node_id must not be empty".into()));
        }
        if self.channels.is_empty() {
            return Err(RouterError::Config(
                "at least one channel is required".into(),
            ));
        }
        for channel in &self.channels {
            if channel.max_batch_size == 0 {
                return Err(RouterError::Config(format!(
                    "channel {}: max_batch_size must be > 0",
                    channel.channel_id
                )));
            }
            crate::batching::validate_algorithm(&channel.batch_algorithm)?;
        }
        if self.gaps.id_increment <= 0 {
            return Err(RouterError::Config("id_increment must be > 0".into()));
        }
        if self.gaps.max_gap_size <= 0 {
            return Err(RouterError::Config("max_gap_size must be > 0".into()));
        }
        if self.reader.peek_ahead_window == 0 {
            return Err(RouterError::Config(
                "peek_ahead_window must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChannelConfig: one entry per routing lane
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a single routing channel.
///
/// Channels partition the change log into independently routed lanes;
/// transaction grouping is only guaranteed within a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel's unique id, matching the `channel_id` stamped on captures.
    pub channel_id: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Suspended channels are skipped by every pass until resumed.
    #[serde(default)]
    pub suspended: bool,

    /// Target number of events per outgoing batch. The batch-completion
    /// policy decides where the cut actually lands.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: i64,

    /// Row budget per channel pass. The reader stops accepting new
    /// transactions past this, but always drains the in-flight one.
    #[serde(default = "default_max_data_to_route")]
    pub max_data_to_route: u64,

    /// Batch-completion policy: "default", "transactional" or
    /// "nontransactional".
    #[serde(default = "default_batch_algorithm")]
    pub batch_algorithm: String,

    /// Share one batch id across all target nodes, with a single data
    /// event per row. For channels whose rows fan out identically.
    #[serde(default)]
    pub common_batch_mode: bool,

    /// Select new-value payloads when reading changes. When off, the
    /// column comes back as an empty string.
    #[serde(default = "default_true")]
    pub use_row_data: bool,

    /// Select old-value payloads when reading changes.
    #[serde(default = "default_true")]
    pub use_old_data: bool,

    /// Select primary-key payloads when reading changes.
    #[serde(default = "default_true")]
    pub use_pk_data: bool,
}

fn default_max_batch_size() -> i64 {
    10_000
}

fn default_max_data_to_route() -> u64 {
    100_000
}

fn default_batch_algorithm() -> String {
    "default".to_string()
}

impl ChannelConfig {
    /// A channel with defaults, given just its id.
    pub fn named(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            enabled: true,
            suspended: false,
            max_batch_size: default_max_batch_size(),
            max_data_to_route: default_max_data_to_route(),
            batch_algorithm: default_batch_algorithm(),
            common_batch_mode: false,
            use_row_data: true,
            use_old_data: true,
            use_pk_data: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GapConfig: gap tracker tuning
// ═══════════════════════════════════════════════════════════════════════════════

/// Gap tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapConfig {
    /// Step between consecutively assigned change identifiers.
    #[serde(default = "default_id_increment")]
    pub id_increment: i64,

    /// Fallback gap expiry when no transaction-view is available: a gap
    /// older than this whose range holds no change rows is abandoned.
    /// Duration string (e.g., "2h").
    #[serde(default = "default_stale_gap_timeout")]
    pub stale_gap_timeout: String,

    /// Allowance subtracted from the earliest in-flight transaction time
    /// to absorb clock skew between capture and routing.
    #[serde(default = "default_clock_skew_allowance")]
    pub clock_skew_allowance: String,

    /// Maximum identifiers one gap may span; also sizes the trailing gap.
    #[serde(default = "default_max_gap_size")]
    pub max_gap_size: i64,

    /// When a pass did not read all data, expiry checks only run once per
    /// this interval rather than on every pass.
    #[serde(default = "default_busy_expire_interval")]
    pub busy_expire_interval: String,

    /// Above this many gap inserts+deletes in one reconcile, collapse the
    /// whole persisted set into a single covering gap instead.
    #[serde(default = "default_max_gap_changes")]
    pub max_gap_changes: usize,

    /// Validate the persisted gap list (overlaps, inverted ranges) during
    /// full reconciliation and repair it.
    #[serde(default = "default_true")]
    pub detect_invalid_gaps: bool,
}

fn default_id_increment() -> i64 {
    1
}

fn default_stale_gap_timeout() -> String {
    "2h".to_string()
}

fn default_clock_skew_allowance() -> String {
    "60s".to_string()
}

fn default_max_gap_size() -> i64 {
    50_000_000
}

fn default_busy_expire_interval() -> String {
    "10m".to_string()
}

fn default_max_gap_changes() -> usize {
    1000
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            id_increment: 1,
            stale_gap_timeout: "2h".to_string(),
            clock_skew_allowance: "60s".to_string(),
            max_gap_size: 50_000_000,
            busy_expire_interval: "10m".to_string(),
            max_gap_changes: 1000,
            detect_invalid_gaps: true,
        }
    }
}

impl GapConfig {
    /// Parse the stale_gap_timeout string to a Duration.
    pub fn stale_gap_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.stale_gap_timeout)
            .unwrap_or(Duration::from_secs(2 * 60 * 60))
    }

    /// Parse the clock_skew_allowance string to a Duration.
    pub fn clock_skew_allowance_duration(&self) -> Duration {
        humantime::parse_duration(&self.clock_skew_allowance).unwrap_or(Duration::from_secs(60))
    }

    /// Parse the busy_expire_interval string to a Duration.
    pub fn busy_expire_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.busy_expire_interval)
            .unwrap_or(Duration::from_secs(10 * 60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReaderConfig: change reader tuning
// ═══════════════════════════════════════════════════════════════════════════════

/// Change reader (producer task) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Lookahead window: capacity of both the peek-ahead buffer and the
    /// producer/consumer queue.
    #[serde(default = "default_peek_ahead_window")]
    pub peek_ahead_window: usize,

    /// Byte ceiling on buffered rows. Once crossed, the reader drains only
    /// the in-flight transaction and leaves the rest for the next pass.
    #[serde(default = "default_peek_ahead_max_bytes")]
    pub peek_ahead_max_bytes: usize,

    /// With at most this many gaps, the reader queries gap ranges
    /// explicitly; above it, it falls back to one open-ended scan.
    #[serde(default = "default_gap_threshold")]
    pub gap_threshold: usize,

    /// Gap ranges folded into a single query (multi-query strategy and
    /// range-predicate sizing).
    #[serde(default = "default_gaps_per_query")]
    pub gaps_per_query: usize,

    /// Issue one query per `gaps_per_query` chunk of gaps instead of one
    /// query overall.
    #[serde(default)]
    pub use_multi_query: bool,

    /// Buffer the whole result and sort by data id before delivery, for
    /// sources that cannot return changes in identifier order.
    #[serde(default)]
    pub buffer_and_sort: bool,

    /// How long the consumer waits on the queue before declaring the pass
    /// dead. Duration string (e.g., "330s").
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout: String,

    /// Rows fetched per page when scanning the change log.
    #[serde(default = "default_fetch_page_size")]
    pub fetch_page_size: usize,

    /// Byte ceiling on a single row's stored payload under a projected
    /// (partial) read. A row over the ceiling fails the pass with a
    /// row-too-large error; the engine reruns the channel once with the
    /// full projection, which reads rows of any size.
    #[serde(default = "default_max_projected_row_bytes")]
    pub max_projected_row_bytes: usize,
}

fn default_peek_ahead_window() -> usize {
    1000
}

fn default_peek_ahead_max_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_gap_threshold() -> usize {
    100
}

fn default_gaps_per_query() -> usize {
    100
}

fn default_queue_timeout() -> String {
    "330s".to_string()
}

fn default_max_projected_row_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_fetch_page_size() -> usize {
    1000
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            peek_ahead_window: 1000,
            peek_ahead_max_bytes: 32 * 1024 * 1024,
            gap_threshold: 100,
            gaps_per_query: 100,
            use_multi_query: false,
            buffer_and_sort: false,
            queue_timeout: "330s".to_string(),
            fetch_page_size: 1000,
            max_projected_row_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ReaderConfig {
    /// Parse the queue_timeout string to a Duration.
    pub fn queue_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.queue_timeout).unwrap_or(Duration::from_secs(330))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RoutingConfig: orchestrator tuning
// ═══════════════════════════════════════════════════════════════════════════════

/// Routing orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Buffered data events are flushed to the store once this many
    /// accumulate, independent of batch completion.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Name of the cluster lock guarding routing.
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
}

fn default_flush_threshold() -> usize {
    50_000
}

fn default_lock_name() -> String {
    "route".to_string()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 50_000,
            lock_name: "route".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite change store
// ═══════════════════════════════════════════════════════════════════════════════

/// Change store (SQLite) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file, or ":memory:" for tests.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_sqlite_path() -> String {
    "changes.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "changes.db".to_string(),
            max_connections: 4,
        }
    }
}

impl StoreConfig {
    /// In-memory database for tests.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            max_connections: 1,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

fn default_true() -> bool {
    true
}
