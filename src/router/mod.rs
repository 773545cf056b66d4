// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Routing engine: the orchestrator that turns captured changes into
//! outgoing batches.
//!
//! One routing run ([`RouterEngine::route`]) takes the cluster lock, fixes
//! the gap set, then drives one pass per enabled channel:
//!
//! ```text
//! route()
//!   ├── try_lock("route")          skip the run if another engine holds it
//!   ├── tracker.before_routing     load/repair gaps, full analysis if pending
//!   └── per channel:
//!         ├── spawn ChangeReader   gap snapshot + projection
//!         ├── ChannelPass::drive   rules -> strategies -> batches
//!         ├── tracker.after_routing  reconcile gaps in the pass tx
//!         └── commit               batches, events and gaps land together
//! ```
//!
//! A failed channel pass rolls back completely and does not stop the other
//! channels; the gap tracker re-derives its state before the next pass so a
//! half-applied reconciliation can never leak.

mod pass;

use crate::batching::PolicyRegistry;
use crate::config::{ChannelConfig, RouterConfig};
use crate::context::RoutingContext;
use crate::error::{Result, RouterError};
use crate::gaps::{GapTracker, NoTransactionView, TransactionMonitor};
use crate::lock::{ClusterLock, ProcessLock};
use crate::metrics;
use crate::reader::ChangeReader;
use crate::store::{ChangeStore, Projection};
use crate::strategy::{RouteStrategy, RuleSource, StrategyRegistry};
use pass::ChannelPass;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Cloneable handle that asks a running engine to stop between rows.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// The change-data-capture routing engine.
///
/// Owns the change store, the gap tracker and the strategy/policy
/// registries. `route` runs are strictly sequential per engine; the cluster
/// lock serializes engines sharing a store.
pub struct RouterEngine {
    config: RouterConfig,
    store: ChangeStore,
    tracker: GapTracker,
    strategies: StrategyRegistry,
    policies: PolicyRegistry,
    rules: Arc<dyn RuleSource>,
    lock: Arc<dyn ClusterLock>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl RouterEngine {
    /// Open the change store and build an engine with the built-in
    /// strategies and policies.
    pub async fn new(config: RouterConfig, rules: Arc<dyn RuleSource>) -> Result<Self> {
        config.validate()?;
        let store = ChangeStore::new(&config.store).await?;
        let tracker = GapTracker::new(config.gaps.clone(), Arc::new(NoTransactionView));
        let (stop_tx, stop_rx) = watch::channel(false);
        info!(node_id = %config.node_id, channels = config.channels.len(), "Router engine ready");
        Ok(Self {
            config,
            store,
            tracker,
            strategies: StrategyRegistry::new(),
            policies: PolicyRegistry::new(),
            rules,
            lock: Arc::new(ProcessLock::new()),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        })
    }

    /// Register a routing strategy under a tag rules can reference.
    pub fn with_strategy(mut self, tag: &str, strategy: Arc<dyn RouteStrategy>) -> Self {
        self.strategies.register(tag, strategy);
        self
    }

    /// Register a batch-completion policy under an algorithm tag.
    pub fn with_policy(mut self, tag: &str, policy: Arc<dyn crate::batching::BatchPolicy>) -> Self {
        self.policies.register(tag, policy);
        self
    }

    /// Replace the in-process cluster lock, for multi-process deployments.
    pub fn with_lock(mut self, lock: Arc<dyn ClusterLock>) -> Self {
        self.lock = lock;
        self
    }

    /// Supply a transaction view of the capturing database, enabling the
    /// preferred gap expiry policy.
    pub fn with_transaction_monitor(mut self, monitor: Arc<dyn TransactionMonitor>) -> Self {
        self.tracker = GapTracker::new(self.config.gaps.clone(), monitor);
        self
    }

    pub fn store(&self) -> &ChangeStore {
        &self.store
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Force the next run to re-derive gap state from the store.
    pub fn request_full_gap_analysis(&mut self) {
        self.tracker.request_full_analysis();
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    /// One routing run over every enabled channel.
    ///
    /// Returns the number of rows routed. A run that loses the cluster lock
    /// race returns `Ok(0)` without touching anything. `force` additionally
    /// schedules a full gap analysis before the run.
    pub async fn route(&mut self, force: bool) -> Result<u64> {
        if force {
            self.tracker.request_full_analysis();
        }
        let lock_name = self.config.routing.lock_name.clone();
        if !self.lock.try_lock(&lock_name) {
            metrics::record_lock_attempt(false);
            info!(lock = %lock_name, "Routing lock is held elsewhere, skipping run");
            return Ok(0);
        }
        metrics::record_lock_attempt(true);

        let result = self.route_locked().await;
        self.lock.unlock(&lock_name);
        result
    }

    async fn route_locked(&mut self) -> Result<u64> {
        self.tracker.before_routing(&self.store).await?;

        let channels = self.config.channels.clone();
        let mut total = 0u64;
        for channel in &channels {
            if *self.stop_rx.borrow() {
                return Err(RouterError::Interrupted);
            }
            if !channel.enabled || channel.suspended {
                debug!(channel_id = %channel.channel_id, "Channel disabled or suspended, skipping");
                continue;
            }

            let started = Instant::now();
            let mut projection = Projection::for_channel(channel);
            if !projection.is_full() {
                // Partial reads are the fast path; cap them so an oversized
                // row falls back to the full projection instead of flowing
                // through half-blanked.
                projection =
                    projection.with_byte_cap(self.config.reader.max_projected_row_bytes);
            }
            let result = match self.run_pass(channel, projection).await {
                Err(RouterError::RowTooLarge { .. }) if !projection.is_full() => {
                    // A projected-out payload failed to decode; route the
                    // channel again reading every payload column.
                    warn!(
                        channel_id = %channel.channel_id,
                        "Change row too large under the channel projection, retrying with the full projection"
                    );
                    metrics::record_full_projection_retry(&channel.channel_id);
                    self.run_pass(channel, Projection::full()).await
                }
                other => other,
            };

            match result {
                Ok(rows) => {
                    total += rows;
                    metrics::record_pass(&channel.channel_id, rows, started.elapsed());
                    self.record_unrouted_depth(channel).await;
                }
                Err(RouterError::Interrupted) => {
                    // An administrative stop, not a fault. The pass already
                    // rolled back; abandon the remaining channels too.
                    info!(channel_id = %channel.channel_id, "Stop requested mid-pass, abandoning the run");
                    return Err(RouterError::Interrupted);
                }
                Err(e) => {
                    error!(channel_id = %channel.channel_id, error = %e, "Channel pass failed");
                    metrics::record_pass_error(&channel.channel_id);
                    // The pass rolled back; re-derive gap state so the
                    // remaining channels see a consistent set.
                    self.tracker.before_routing(&self.store).await?;
                }
            }
        }
        Ok(total)
    }

    /// One channel pass under the given projection. Everything the pass
    /// writes commits atomically with the gap reconciliation, or rolls back
    /// together.
    async fn run_pass(&mut self, channel: &ChannelConfig, projection: Projection) -> Result<u64> {
        let policy = self.policies.resolve(&channel.batch_algorithm)?;
        let snapshot = self.tracker.snapshot();
        let handle = ChangeReader::spawn(
            self.store.clone(),
            channel.clone(),
            self.config.reader.clone(),
            snapshot.clone(),
            projection,
        );
        let mut ctx = RoutingContext::new(&channel.channel_id, snapshot);
        let mut tx = self.store.begin().await?;

        let channel_pass = ChannelPass {
            channel,
            node_id: &self.config.node_id,
            rules: self.rules.as_ref(),
            strategies: &self.strategies,
            policy,
            flush_threshold: self.config.routing.flush_threshold,
            stop_rx: self.stop_rx.clone(),
        };
        let outcome = channel_pass.drive(handle, &mut ctx, &mut tx).await;

        match outcome {
            Ok(out) => {
                self.tracker.add_data_ids(&out.delivered_ids);
                self.tracker.set_all_data_read(out.all_data_read);
                if let Err(e) = self.tracker.after_routing(&self.store, &mut tx).await {
                    let _ = tx.rollback().await;
                    self.tracker.invalidate();
                    return Err(e);
                }
                if let Err(e) = tx.commit().await {
                    self.tracker.invalidate();
                    return Err(e);
                }
                for strategy in out.used.values() {
                    strategy.on_context_committed(&mut ctx.cache)?;
                }
                ctx.log_summary();
                Ok(out.rows_routed)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                self.tracker.invalidate();
                Err(e)
            }
        }
    }

    /// Best-effort gauge of rows captured beyond the routing frontier.
    async fn record_unrouted_depth(&self, channel: &ChannelConfig) {
        if let Ok(frontier) = self.store.max_routed_id().await {
            if let Ok(depth) = self
                .store
                .unrouted_count(&channel.channel_id, frontier.unwrap_or(0))
                .await
            {
                metrics::set_unrouted_depth(&channel.channel_id, depth);
            }
        }
    }
}
