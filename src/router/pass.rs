// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One channel pass: consume the reader, dispatch strategies, fill batches.
//!
//! The pass is the consumer side of the reader queue. For each row it
//! evaluates the table's rules in order, unions the nodes the strategies
//! claim (first claiming rule wins per node), and appends the row to each
//! target node's open batch. Rows no rule claims go to the unrouted
//! pseudo-node so their gaps still close.
//!
//! Transaction boundaries are detected by looking one row ahead: a row is at
//! a boundary when the next row belongs to a different source transaction,
//! or there is no next row. The batch-completion policy sees that flag and
//! decides where batches get cut.
//!
//! All writes go through the pass's [`StoreTx`]. Completed batches are
//! finalized (counters, status, router millis) inside the transaction before
//! it commits, so a transmitter can never observe a ready batch whose events
//! are not yet visible.

use crate::batching::BatchPolicy;
use crate::config::ChannelConfig;
use crate::context::RoutingContext;
use crate::error::{Result, RouterError};
use crate::metrics;
use crate::model::{
    BatchStatus, ChangeRow, DataEvent, EventKind, OutgoingBatch, UNKNOWN_ROUTER_ID,
    UNROUTED_NODE_ID,
};
use crate::reader::ReaderHandle;
use crate::store::StoreTx;
use crate::strategy::{RouteRule, RouteStrategy, RowMetadata, RuleSource, StrategyRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// What a driven pass hands back to the engine.
pub(crate) struct PassOutcome {
    pub rows_routed: u64,
    /// Ids delivered by the reader, for gap reconciliation.
    pub delivered_ids: Vec<i64>,
    pub all_data_read: bool,
    /// Strategies that participated, keyed by router id. Their
    /// post-commit hooks fire once the transaction lands.
    pub used: HashMap<String, Arc<dyn RouteStrategy>>,
}

/// Borrowed view of everything one channel pass needs.
pub(crate) struct ChannelPass<'a> {
    pub channel: &'a ChannelConfig,
    /// Local node id; changes are never routed back to it.
    pub node_id: &'a str,
    pub rules: &'a dyn RuleSource,
    pub strategies: &'a StrategyRegistry,
    pub policy: Arc<dyn BatchPolicy>,
    pub flush_threshold: usize,
    /// Engine stop flag, observed between rows.
    pub stop_rx: tokio::sync::watch::Receiver<bool>,
}

impl ChannelPass<'_> {
    /// Drive the reader to completion, routing every delivered row.
    ///
    /// On success all batch and event writes sit in `tx`, finalized and
    /// ready to commit. On error the reader is wound down and the caller
    /// rolls the transaction back.
    pub async fn drive(
        &self,
        mut handle: ReaderHandle,
        ctx: &mut RoutingContext,
        tx: &mut StoreTx,
    ) -> Result<PassOutcome> {
        let mut used: HashMap<String, Arc<dyn RouteStrategy>> = HashMap::new();

        match self.drive_inner(&mut handle, ctx, tx, &mut used).await {
            Ok(delivered_ids) => {
                // The producer surfaces its own failures here, before
                // anything can commit.
                let summary = handle.finish().await?;
                ctx.complete_all_batches();
                self.flush_events(ctx, tx).await?;
                self.finalize_completed(ctx, tx, &used).await?;
                Ok(PassOutcome {
                    rows_routed: ctx.stats.rows_routed,
                    delivered_ids,
                    all_data_read: summary.all_data_read,
                    used,
                })
            }
            Err(e) => {
                handle.stop();
                let _ = handle.finish().await;
                Err(e)
            }
        }
    }

    async fn drive_inner(
        &self,
        handle: &mut ReaderHandle,
        ctx: &mut RoutingContext,
        tx: &mut StoreTx,
        used: &mut HashMap<String, Arc<dyn RouteStrategy>>,
    ) -> Result<Vec<i64>> {
        let mut delivered_ids = Vec::new();
        let mut next = handle.take().await?;

        loop {
            let Some(row) = next else { break };
            if *self.stop_rx.borrow() {
                return Err(RouterError::Interrupted);
            }
            next = handle.take().await?;
            // One row of lookahead marks transaction boundaries.
            let at_boundary = match next.as_ref() {
                Some(peeked) => !row.same_transaction(peeked),
                None => true,
            };
            if at_boundary {
                ctx.stats.transactions_seen += 1;
            }

            delivered_ids.push(row.data_id);
            self.route_row(ctx, tx, used, &row, at_boundary).await?;
            ctx.stats.rows_routed += 1;

            if ctx.pending_event_count() >= self.flush_threshold {
                self.flush_events(ctx, tx).await?;
                ctx.stats.flushes += 1;
            }
            if ctx.needs_committed() {
                // A policy sealed a batch: make it visible without ending
                // the pass.
                self.flush_events(ctx, tx).await?;
                self.finalize_completed(ctx, tx, used).await?;
                tx.commit_and_continue().await?;
                ctx.committed();
            }
        }

        Ok(delivered_ids)
    }

    /// Evaluate every applicable rule for the row and union the targets.
    async fn route_row(
        &self,
        ctx: &mut RoutingContext,
        tx: &mut StoreTx,
        used: &mut HashMap<String, Arc<dyn RouteStrategy>>,
        row: &ChangeRow,
        at_boundary: bool,
    ) -> Result<()> {
        let rules = self.rules.rules_for_table(&row.table_name);
        let mut targets: Vec<(String, String)> = Vec::new();
        let mut claimed: HashSet<String> = HashSet::new();

        if !rules.is_empty() {
            let meta = RowMetadata::decode(row, self.rules.table_def(&row.table_name));
            let initial_load = row.event_kind == EventKind::Reload;

            for rule in &rules {
                if !rule.applies_to(row.event_kind) {
                    continue;
                }
                let strategy = self.strategies.resolve(&rule.router_id, &rule.strategy)?;
                used.entry(rule.router_id.clone())
                    .or_insert_with(|| strategy.clone());
                ctx.mark_router_used(&rule.router_id);

                let candidates = self.candidates(ctx, rule);
                let Some(nodes) =
                    strategy.route_to_nodes(&mut ctx.cache, &meta, &candidates, initial_load)?
                else {
                    // This rule abstains; others may still claim the row.
                    continue;
                };
                for node in nodes {
                    if !candidates.contains(&node) {
                        continue;
                    }
                    if !rule.ping_back_enabled
                        && row.source_node_id.as_deref() == Some(node.as_str())
                    {
                        continue;
                    }
                    // First claiming rule wins per node.
                    if claimed.insert(node.clone()) {
                        targets.push((node, rule.router_id.clone()));
                    }
                }
            }
        }

        if targets.is_empty() {
            debug!(
                data_id = row.data_id,
                table = %row.table_name,
                "No rule claimed the row, routing to the unrouted node"
            );
            ctx.stats.rows_unrouted += 1;
            metrics::record_unrouted_rows(&self.channel.channel_id, 1);
            let unrouted = [(UNROUTED_NODE_ID.to_string(), UNKNOWN_ROUTER_ID.to_string())];
            return self.assign(ctx, tx, row, &unrouted, at_boundary).await;
        }

        // Deterministic batch creation order
        targets.sort();
        self.assign(ctx, tx, row, &targets, at_boundary).await
    }

    /// Candidate nodes for a rule: the target group's members minus the
    /// local node. Memoized per router id for the pass.
    fn candidates(&self, ctx: &mut RoutingContext, rule: &RouteRule) -> Arc<HashSet<String>> {
        let key = format!("candidate-nodes:{}", rule.router_id);
        if let Some(cached) = ctx.cache.get::<HashSet<String>>(&key) {
            return cached;
        }
        let mut nodes: HashSet<String> = self
            .rules
            .nodes_in_group(&rule.target_group_id)
            .into_iter()
            .collect();
        nodes.remove(self.node_id);
        ctx.cache.put(key.clone(), nodes);
        ctx.cache
            .get::<HashSet<String>>(&key)
            .expect("entry just inserted")
    }

    /// Append the row to each target node's open batch, creating batches as
    /// needed, and apply the batch-completion policy.
    async fn assign(
        &self,
        ctx: &mut RoutingContext,
        tx: &mut StoreTx,
        row: &ChangeRow,
        targets: &[(String, String)],
        at_boundary: bool,
    ) -> Result<()> {
        let common = self.channel.common_batch_mode && targets.len() > 1;
        let mut shared_id = if common {
            ctx.open_batches()
                .find(|b| b.common)
                .map(|b| b.batch_id)
                .unwrap_or(0)
        } else {
            0
        };
        let mut event_pushed = false;
        let mut completed: Vec<String> = Vec::new();

        for (node_id, router_id) in targets {
            if ctx.open_batch(node_id).is_none() {
                let mut batch = OutgoingBatch::new(node_id.clone(), self.channel.channel_id.clone());
                if common {
                    batch.common = true;
                    batch.batch_id = shared_id;
                }
                tx.insert_batch(&mut batch).await?;
                if common {
                    shared_id = batch.batch_id;
                }
                ctx.put_open_batch(node_id, batch);
            }

            let batch = ctx.open_batch(node_id).expect("batch just opened");
            batch.increment_event_count(row.event_kind);
            let batch_id = batch.batch_id;
            let complete = self.policy.is_complete(batch, row, at_boundary, self.channel);

            // Common batches carry a single event per row.
            if !common || !event_pushed {
                ctx.push_event(DataEvent::new(row.data_id, batch_id, router_id.clone()));
                event_pushed = true;
            }
            if complete {
                completed.push(node_id.clone());
            }
        }

        if !completed.is_empty() {
            if common {
                // A shared batch id is sealed for every node at once.
                ctx.complete_all_batches();
            } else {
                for node_id in &completed {
                    ctx.complete_batch(node_id);
                }
            }
            ctx.request_commit();
        }
        Ok(())
    }

    async fn flush_events(&self, ctx: &mut RoutingContext, tx: &mut StoreTx) -> Result<()> {
        let events = ctx.take_pending_events();
        if events.is_empty() {
            return Ok(());
        }
        metrics::record_data_events(&self.channel.channel_id, events.len());
        tx.insert_data_events(&events).await
    }

    /// Finalize completed batches inside the pass transaction: stamp the
    /// routing time, settle the terminal status, write the counters back,
    /// and fire the per-batch strategy hooks.
    async fn finalize_completed(
        &self,
        ctx: &mut RoutingContext,
        tx: &mut StoreTx,
        used: &HashMap<String, Arc<dyn RouteStrategy>>,
    ) -> Result<()> {
        if ctx.completed_batches().is_empty() {
            return Ok(());
        }
        let millis = ctx.elapsed_millis();
        for batch in ctx.completed_batches_mut() {
            batch.router_millis = millis;
            batch.status = if batch.is_unrouted() {
                BatchStatus::Ok
            } else {
                BatchStatus::ReadyToSend
            };
        }
        let mut finalized = 0;
        for batch in ctx.completed_batches() {
            tx.update_batch(batch).await?;
            for strategy in used.values() {
                strategy.on_batch_complete(batch.batch_id, &batch.node_id)?;
            }
            finalized += 1;
        }
        metrics::record_batches_created(&self.channel.channel_id, finalized);
        Ok(())
    }
}
