// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-pass routing state.
//!
//! A [`RoutingContext`] lives for exactly one channel pass. It carries the
//! immutable gap snapshot the reader was given, the open batches keyed by
//! target node, the buffered data events awaiting flush, and a scratch
//! cache strategies may use to memoize lookups for the duration of the
//! pass. Nothing in here survives a commit or a rollback.

use crate::model::{DataEvent, Gap, OutgoingBatch};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Typed scratch space scoped to one channel pass.
///
/// Strategies use this to avoid repeating work across the rows of a pass
/// (resolved subscriber lists, parsed metadata, and the like). Entries are
/// type-erased; readers get them back through a typed downcast.
#[derive(Default)]
pub struct PassCache {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl PassCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under a key, replacing any previous entry.
    pub fn put<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Arc::new(value));
    }

    /// Fetch a previously stored value, if the key exists and the type
    /// matches what was stored.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries
            .get(key)
            .cloned()
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Counters accumulated over one channel pass, logged when it ends.
#[derive(Debug, Default, Clone)]
pub struct PassStats {
    pub rows_routed: u64,
    pub rows_unrouted: u64,
    pub data_events_inserted: u64,
    pub batches_created: u64,
    pub transactions_seen: u64,
    pub flushes: u64,
}

/// State for one pass over one channel.
pub struct RoutingContext {
    /// Channel being routed.
    pub channel_id: String,

    /// The gap snapshot this pass reads through. Immutable for the whole
    /// pass; reconciliation builds the next snapshot at commit time.
    pub gap_snapshot: Arc<[Gap]>,

    /// Open batches keyed by target node id.
    batches_by_node: HashMap<String, OutgoingBatch>,

    /// Batches completed mid-pass, held until commit.
    completed_batches: Vec<OutgoingBatch>,

    /// Data events buffered since the last flush.
    pending_events: Vec<DataEvent>,

    /// Router ids whose strategy participated in this pass. Their
    /// lifecycle hooks fire at batch completion and after commit.
    used_router_ids: HashSet<String>,

    /// Scratch space shared by all strategies for the pass duration.
    pub cache: PassCache,

    /// Set when a batch-completion policy asks for the pass to be
    /// committed before more rows are routed.
    needs_committed: bool,

    pub stats: PassStats,
    started: Instant,
}

impl RoutingContext {
    pub fn new(channel_id: &str, gap_snapshot: Arc<[Gap]>) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            gap_snapshot,
            batches_by_node: HashMap::new(),
            completed_batches: Vec::new(),
            pending_events: Vec::new(),
            used_router_ids: HashSet::new(),
            cache: PassCache::new(),
            needs_committed: false,
            stats: PassStats::default(),
            started: Instant::now(),
        }
    }

    /// Milliseconds since the pass started; stamped on batches at commit.
    pub fn elapsed_millis(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    pub fn open_batch(&mut self, node_id: &str) -> Option<&mut OutgoingBatch> {
        self.batches_by_node.get_mut(node_id)
    }

    pub fn put_open_batch(&mut self, node_id: &str, batch: OutgoingBatch) {
        self.batches_by_node.insert(node_id.to_string(), batch);
        self.stats.batches_created += 1;
    }

    /// Move a node's open batch to the completed list.
    pub fn complete_batch(&mut self, node_id: &str) {
        if let Some(batch) = self.batches_by_node.remove(node_id) {
            self.completed_batches.push(batch);
        }
    }

    /// Close every remaining open batch; called at end of pass.
    pub fn complete_all_batches(&mut self) {
        let nodes: Vec<String> = self.batches_by_node.keys().cloned().collect();
        for node_id in nodes {
            self.complete_batch(&node_id);
        }
    }

    pub fn open_batches(&self) -> impl Iterator<Item = &OutgoingBatch> {
        self.batches_by_node.values()
    }

    pub fn completed_batches(&self) -> &[OutgoingBatch] {
        &self.completed_batches
    }

    pub fn completed_batches_mut(&mut self) -> &mut [OutgoingBatch] {
        &mut self.completed_batches
    }

    pub fn push_event(&mut self, event: DataEvent) {
        self.pending_events.push(event);
        self.stats.data_events_inserted += 1;
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_events.len()
    }

    /// Hand over the buffered events for a flush.
    pub fn take_pending_events(&mut self) -> Vec<DataEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn mark_router_used(&mut self, router_id: &str) {
        self.used_router_ids.insert(router_id.to_string());
    }

    pub fn used_router_ids(&self) -> &HashSet<String> {
        &self.used_router_ids
    }

    pub fn request_commit(&mut self) {
        self.needs_committed = true;
    }

    pub fn needs_committed(&self) -> bool {
        self.needs_committed
    }

    /// Reset commit-cycle state after an intermediate commit. Batches and
    /// events already written stay written; only the request flag and the
    /// buffers are cleared.
    pub fn committed(&mut self) {
        self.needs_committed = false;
        self.completed_batches.clear();
    }

    /// Log the pass ledger.
    pub fn log_summary(&self) {
        info!(
            channel_id = %self.channel_id,
            rows_routed = self.stats.rows_routed,
            rows_unrouted = self.stats.rows_unrouted,
            data_events = self.stats.data_events_inserted,
            batches = self.stats.batches_created,
            transactions = self.stats.transactions_seen,
            elapsed_ms = self.elapsed_millis(),
            "Channel pass complete"
        );
    }
}
