// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gap tracking and reconciliation.
//!
//! Change identifiers are assigned by the capturing database at insert time,
//! not commit time, so the sequence routing observes has holes: ids held by
//! still-open transactions, and ids burned by transactions that rolled back.
//! The tracker keeps the persisted `data_gap` table as a sorted, disjoint set
//! of ranges routing has not yet seen, so every change is routed exactly once
//! without rescanning the whole change log.
//!
//! # Reconciliation
//!
//! `before_routing` runs once per routing invocation. On the first run (or
//! when explicitly requested) it performs a *full analysis*: load the gap
//! table, repair any overlap damage, re-derive found ids from the persisted
//! data events, and reconcile. Every later run is the *fast path*: the
//! in-memory gap list stays authoritative and only the ids actually seen by
//! the pass feed `after_routing`.
//!
//! `after_routing` walks the sorted found ids through the sorted gaps:
//!
//! ```text
//! gap [100,150], found {100,105,110}, increment 1
//!   -> delete [100,150]
//!   -> insert [101,104] [106,109] [111,150]
//! ```
//!
//! A gap with no found ids is left alone unless one of the expiry policies
//! says the ids can no longer appear:
//!
//! - transaction-view: the gap predates the earliest in-flight transaction
//!   (minus a clock-skew allowance)
//! - timeout fallback: the gap is older than `stale_gap_timeout`
//!
//! Either way a zero-count check against the change log guards the delete; a
//! gap whose range holds captured rows is never abandoned. When the last
//! pass did not read all data, expiry checks additionally only run once per
//! `busy_expire_interval`.
//!
//! Gap mutations are persisted through the caller's [`StoreTx`], so they
//! commit or roll back atomically with the routing pass that observed the
//! ids.

use crate::config::GapConfig;
use crate::error::{Result, RouterError};
use crate::metrics;
use crate::model::Gap;
use crate::store::{ChangeStore, StoreTx};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// View of in-flight capture transactions, used by the preferred gap expiry
/// policy.
///
/// When the capturing database can report the start time of its oldest open
/// transaction, a gap older than that point can never be filled and is safe
/// to abandon immediately. Implementations that cannot provide the view
/// return `None`, and the tracker falls back to the timeout policy.
pub trait TransactionMonitor: Send + Sync {
    fn earliest_transaction_time(&self) -> Option<DateTime<Utc>>;
}

/// Monitor for sources without a transaction view; always falls back to the
/// timeout expiry policy.
pub struct NoTransactionView;

impl TransactionMonitor for NoTransactionView {
    fn earliest_transaction_time(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Tracks and reconciles data gaps across routing passes.
pub struct GapTracker {
    config: GapConfig,
    monitor: Arc<dyn TransactionMonitor>,
    /// Sorted, disjoint. Authoritative between passes once loaded.
    gaps: Vec<Gap>,
    /// Ids observed by the current pass, in arrival order.
    data_ids: Vec<i64>,
    all_data_read: bool,
    full_analysis_pending: bool,
    loaded: bool,
    /// Persisted set is collapsed to one covering gap while true.
    use_in_memory_gaps: bool,
    last_busy_expire: Option<Instant>,
    routing_start: DateTime<Utc>,
    /// Earliest in-flight transaction time minus the skew allowance.
    earliest_tx_time: Option<DateTime<Utc>>,
}

impl GapTracker {
    pub fn new(config: GapConfig, monitor: Arc<dyn TransactionMonitor>) -> Self {
        Self {
            config,
            monitor,
            gaps: Vec::new(),
            data_ids: Vec::new(),
            all_data_read: true,
            // First run re-derives state from the persisted data events.
            full_analysis_pending: true,
            loaded: false,
            use_in_memory_gaps: false,
            last_busy_expire: None,
            routing_start: Utc::now(),
            earliest_tx_time: None,
        }
    }

    /// Current gap list, sorted by start id.
    pub fn gaps(&self) -> &[Gap] {
        &self.gaps
    }

    /// Immutable snapshot handed to the change reader.
    pub fn snapshot(&self) -> Arc<[Gap]> {
        Arc::from(self.gaps.as_slice())
    }

    /// Force a full analysis on the next `before_routing`.
    pub fn request_full_analysis(&mut self) {
        self.full_analysis_pending = true;
    }

    /// Discard in-memory state after a failed commit; the next run reloads
    /// from the store.
    pub fn invalidate(&mut self) {
        self.loaded = false;
        self.full_analysis_pending = true;
        self.use_in_memory_gaps = false;
    }

    /// Record ids a pass delivered to routing.
    pub fn add_data_ids(&mut self, ids: &[i64]) {
        self.data_ids.extend_from_slice(ids);
    }

    /// Sticky within a pass: once any reader reports an incomplete read the
    /// pass counts as incomplete.
    pub fn set_all_data_read(&mut self, all_data_read: bool) {
        self.all_data_read &= all_data_read;
    }

    /// Fix the gap set before routing starts.
    ///
    /// Runs the full analysis when pending, otherwise makes sure the gap
    /// list is loaded (and seeded, on an empty store).
    pub async fn before_routing(&mut self, store: &ChangeStore) -> Result<()> {
        self.reset();

        if self.full_analysis_pending {
            info!("Full gap analysis is running");
            let started = Instant::now();
            self.load_gaps(store).await?;
            let mut found = Vec::new();
            for gap in &self.gaps {
                found.extend(store.routed_ids_in_range(gap.start_id, gap.end_id).await?);
            }
            self.data_ids = found;
            self.all_data_read = false;
            let mut tx = store.begin().await?;
            self.reconcile(store, &mut tx).await?;
            tx.commit().await?;
            self.reset();
            self.full_analysis_pending = false;
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                gaps = self.gaps.len(),
                "Full gap analysis is done"
            );
        } else if !self.loaded {
            self.load_gaps(store).await?;
        }

        metrics::set_open_gaps(self.gaps.len());
        Ok(())
    }

    /// Reconcile the gap set against the ids the pass observed, persisting
    /// through the pass's unit of work.
    ///
    /// Clears the observed ids afterwards so the next channel pass starts
    /// clean.
    pub async fn after_routing(&mut self, store: &ChangeStore, tx: &mut StoreTx) -> Result<()> {
        self.reconcile(store, tx).await?;
        self.data_ids.clear();
        self.all_data_read = true;
        metrics::set_open_gaps(self.gaps.len());
        Ok(())
    }

    fn reset(&mut self) {
        self.all_data_read = true;
        self.data_ids.clear();
        self.routing_start = Utc::now();
        let skew = ChronoDuration::from_std(self.config.clock_skew_allowance_duration())
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        self.earliest_tx_time = self
            .monitor
            .earliest_transaction_time()
            .map(|t| t - skew);
    }

    async fn load_gaps(&mut self, store: &ChangeStore) -> Result<()> {
        let mut gaps = store.find_gaps().await?;
        if gaps.is_empty() {
            // Fresh store: open one trailing gap past the highest routed id.
            let max_routed = store.max_routed_id().await?.unwrap_or(0);
            let seed = Gap::new(
                max_routed + self.config.id_increment,
                max_routed + self.config.max_gap_size,
                Utc::now(),
            );
            let mut tx = store.begin().await?;
            tx.insert_gap(&seed).await?;
            tx.commit().await?;
            info!(start_id = seed.start_id, end_id = seed.end_id, "Seeded initial data gap");
            gaps = vec![seed];
        }
        self.gaps = gaps;
        if self.config.detect_invalid_gaps {
            self.repair_overlaps(store).await?;
        }
        self.loaded = true;
        Ok(())
    }

    /// Repair a damaged persisted gap list: drop gaps found after the
    /// trailing gap and merge overlapping neighbors.
    async fn repair_overlaps(&mut self, store: &ChangeStore) -> Result<()> {
        let max_gap = self.config.max_gap_size;
        let now = Utc::now();
        let mut tx = store.begin().await?;
        let mut repaired: Vec<Gap> = Vec::new();
        let mut trailing: Option<Gap> = None;
        let mut changed = false;

        for gap in self.gaps.clone() {
            if trailing.is_some() {
                warn!(start_id = gap.start_id, end_id = gap.end_id, "Removing gap found after trailing gap");
                tx.delete_gap(&gap).await?;
                changed = true;
                continue;
            }
            let mut current = gap;
            if current.size() >= max_gap - 1 {
                trailing = Some(current);
            }
            if let Some(prev) = repaired.last().copied() {
                if prev.overlaps(&current) {
                    warn!(
                        prev_start = prev.start_id,
                        prev_end = prev.end_id,
                        cur_start = current.start_id,
                        cur_end = current.end_id,
                        "Merging overlapping gaps"
                    );
                    tx.delete_gap(&prev).await?;
                    tx.delete_gap(&current).await?;
                    let merged = if trailing == Some(current) {
                        Gap::new(prev.start_id, prev.start_id + max_gap - 1, now)
                    } else {
                        Gap::new(prev.start_id, prev.end_id.max(current.end_id), now)
                    };
                    tx.insert_gap(&merged).await?;
                    if trailing == Some(current) {
                        trailing = Some(merged);
                    }
                    repaired.pop();
                    current = merged;
                    changed = true;
                }
            }
            repaired.push(current);
        }

        if changed {
            tx.commit().await?;
            info!(gaps = repaired.len(), "Repaired invalid gap list");
            self.gaps = repaired;
        } else {
            tx.rollback().await?;
        }
        Ok(())
    }

    async fn reconcile(&mut self, store: &ChangeStore, tx: &mut StoreTx) -> Result<()> {
        if self.gaps.is_empty() {
            return Err(RouterError::GapReconcile(
                "gap list is empty; the trailing gap is missing".to_string(),
            ));
        }

        let now = self.routing_start;
        let increment = self.config.id_increment;
        let stale_timeout = ChronoDuration::from_std(self.config.stale_gap_timeout_duration())
            .unwrap_or_else(|_| ChronoDuration::hours(2));

        // Busy-expire cadence: when the pass did not read everything, only
        // check expiry once per interval.
        let busy_expire = if !self.all_data_read {
            match self.last_busy_expire {
                None => {
                    self.last_busy_expire = Some(Instant::now());
                    false
                }
                Some(t) => t.elapsed() >= self.config.busy_expire_interval_duration(),
            }
        } else {
            self.last_busy_expire = None;
            false
        };

        self.data_ids.sort_unstable();
        self.data_ids.dedup();

        let mut gaps_all: HashSet<Gap> = self.gaps.iter().copied().collect();
        let mut added: Vec<Gap> = Vec::new();
        let mut deleted: Vec<Gap> = Vec::new();
        let mut expired_count = 0usize;

        let mut id_idx = 0usize;
        let mut trailing_last_id: i64 = -1;
        let gap_count = self.gaps.len();

        for (gap_idx, gap) in self.gaps.clone().into_iter().enumerate() {
            let last_gap = gap_idx == gap_count - 1;

            // Ids below the gap were already routed; skip them.
            while id_idx < self.data_ids.len() && self.data_ids[id_idx] < gap.start_id {
                id_idx += 1;
            }
            let ids_start = id_idx;
            while id_idx < self.data_ids.len() && self.data_ids[id_idx] <= gap.end_id {
                id_idx += 1;
            }
            let ids = &self.data_ids[ids_start..id_idx];

            if !ids.is_empty() {
                deleted.push(gap);
                gaps_all.remove(&gap);
            } else if !last_gap && (self.all_data_read || busy_expire) {
                let expired = match self.earliest_tx_time {
                    Some(earliest) => gap.create_time < earliest,
                    None => now - gap.create_time > stale_timeout,
                };
                if expired {
                    // A gap holding captured rows is never abandoned.
                    let count = store
                        .count_changes_in_range(gap.start_id - 1, gap.end_id + 1)
                        .await?;
                    if count == 0 {
                        debug!(
                            start_id = gap.start_id,
                            end_id = gap.end_id,
                            age_secs = (now - gap.create_time).num_seconds(),
                            "Expiring stale gap"
                        );
                        expired_count += 1;
                        deleted.push(gap);
                        gaps_all.remove(&gap);
                    }
                }
            }

            let mut last_id: i64 = -1;
            for &id in ids {
                if last_id == -1 && gap.start_id + increment <= id {
                    // hole at the start of the gap
                    self.add_gap(
                        Gap::new(gap.start_id, id - 1, now),
                        &mut gaps_all,
                        &mut added,
                    );
                } else if last_id != -1 && last_id + increment != id {
                    // hole inside the gap
                    self.add_gap(Gap::new(last_id + 1, id - 1, now), &mut gaps_all, &mut added);
                }
                last_id = id;
            }

            if last_id != -1 && !last_gap && last_id + increment <= gap.end_id {
                // hole left at the end of the gap
                self.add_gap(
                    Gap::new(last_id + increment, gap.end_id, now),
                    &mut gaps_all,
                    &mut added,
                );
            }
            trailing_last_id = last_id;
        }

        // Data was found in the trailing gap: extend coverage past it.
        if trailing_last_id != -1 {
            let next = Gap::new(
                trailing_last_id + increment,
                trailing_last_id + self.config.max_gap_size,
                now,
            );
            if self.add_gap(next, &mut gaps_all, &mut added) {
                debug!(start_id = next.start_id, end_id = next.end_id, "Inserting new trailing gap");
            }
        }

        self.save_gaps(tx, gaps_all, added, deleted, expired_count)
            .await
    }

    /// Guarded insert into the working set. Duplicates, inverted ranges and
    /// suspiciously large ranges are rejected and logged.
    fn add_gap(&self, gap: Gap, gaps_all: &mut HashSet<Gap>, added: &mut Vec<Gap>) -> bool {
        if self.config.detect_invalid_gaps {
            let max = self.config.max_gap_size;
            let rejected = if gaps_all.contains(&gap) {
                warn!(start_id = gap.start_id, end_id = gap.end_id, "Detected a duplicate data gap");
                true
            } else if gap.start_id > gap.end_id {
                warn!(start_id = gap.start_id, end_id = gap.end_id, "Detected an inverted gap range");
                true
            } else if gap.size() < max - 1 && gap.size() >= (max as f64 * 0.75) as i64 {
                warn!(start_id = gap.start_id, end_id = gap.end_id, "Detected a very large gap range");
                true
            } else {
                false
            };
            if rejected {
                debug!(gaps = ?self.gaps, data_ids = ?self.data_ids, "Gap state at rejection");
                return false;
            }
        }
        added.push(gap);
        gaps_all.insert(gap);
        true
    }

    async fn save_gaps(
        &mut self,
        tx: &mut StoreTx,
        gaps_all: HashSet<Gap>,
        added: Vec<Gap>,
        deleted: Vec<Gap>,
        expired_count: usize,
    ) -> Result<()> {
        let total_changes = added.len() + deleted.len();
        if total_changes == 0 {
            return Ok(());
        }

        let mut new_gaps: Vec<Gap> = gaps_all.into_iter().collect();
        new_gaps.sort_by_key(|g| g.start_id);

        if total_changes > self.config.max_gap_changes || self.use_in_memory_gaps {
            tx.delete_all_gaps().await?;
            if self.use_in_memory_gaps && total_changes <= self.config.max_gap_changes {
                info!(
                    changes = total_changes,
                    max = self.config.max_gap_changes,
                    "Gap changes back within the max, switching to database gaps"
                );
                self.use_in_memory_gaps = false;
                for gap in &new_gaps {
                    tx.insert_gap(gap).await?;
                }
            } else if let (Some(first), Some(last)) = (new_gaps.first(), new_gaps.last()) {
                if !self.use_in_memory_gaps {
                    info!(
                        changes = total_changes,
                        max = self.config.max_gap_changes,
                        "Gap changes exceed the max, switching to in-memory gaps"
                    );
                    self.use_in_memory_gaps = true;
                }
                let covering = Gap::new(first.start_id, last.end_id, self.routing_start);
                tx.insert_gap(&covering).await?;
            }
        } else {
            for gap in &deleted {
                tx.delete_gap(gap).await?;
            }
            for gap in &added {
                tx.insert_gap(gap).await?;
            }
        }

        metrics::record_gap_changes(added.len(), deleted.len());
        if expired_count > 0 {
            metrics::record_gaps_expired(expired_count);
        }
        self.gaps = new_gaps;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    struct FixedMonitor(Option<DateTime<Utc>>);

    impl TransactionMonitor for FixedMonitor {
        fn earliest_transaction_time(&self) -> Option<DateTime<Utc>> {
            self.0
        }
    }

    async fn memory_store() -> ChangeStore {
        ChangeStore::new(&StoreConfig::in_memory()).await.unwrap()
    }

    fn config(max_gap_size: i64) -> GapConfig {
        GapConfig {
            max_gap_size,
            ..GapConfig::default()
        }
    }

    async fn seed_gaps(store: &ChangeStore, gaps: &[Gap]) {
        let mut tx = store.begin().await.unwrap();
        for gap in gaps {
            tx.insert_gap(gap).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    fn tracker(config: GapConfig) -> GapTracker {
        GapTracker::new(config, Arc::new(NoTransactionView))
    }

    async fn run_after_routing(
        tracker: &mut GapTracker,
        store: &ChangeStore,
        ids: &[i64],
        all_data_read: bool,
    ) {
        tracker.add_data_ids(ids);
        tracker.set_all_data_read(all_data_read);
        let mut tx = store.begin().await.unwrap();
        tracker.after_routing(store, &mut tx).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_seed_gap_on_empty_store() {
        let store = memory_store().await;
        let mut tracker = tracker(config(1000));
        tracker.before_routing(&store).await.unwrap();
        let gaps = store.find_gaps().await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_id, 1);
        assert_eq!(gaps[0].end_id, 1000);
        assert_eq!(tracker.gaps(), &gaps[..]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_reconcile_splits_gap_at_found_ids() {
        let store = memory_store().await;
        let now = Utc::now();
        seed_gaps(
            &store,
            &[Gap::new(100, 150, now), Gap::new(151, 151 + 1000, now)],
        )
        .await;
        let mut tracker = tracker(config(1000));
        tracker.before_routing(&store).await.unwrap();

        run_after_routing(&mut tracker, &store, &[100, 105, 110], true).await;

        let gaps = store.find_gaps().await.unwrap();
        let ranges: Vec<(i64, i64)> = gaps.iter().map(|g| (g.start_id, g.end_id)).collect();
        assert_eq!(
            ranges,
            vec![(101, 104), (106, 109), (111, 150), (151, 151 + 1000)]
        );
        assert_eq!(tracker.gaps().len(), 4);
        store.close().await;
    }

    #[tokio::test]
    async fn test_found_ids_in_trailing_gap_extend_coverage() {
        let store = memory_store().await;
        let mut tracker = tracker(config(1000));
        tracker.before_routing(&store).await.unwrap();
        // Seeded trailing gap is [1, 1000]; finding 1,2,3 moves the frontier.
        run_after_routing(&mut tracker, &store, &[1, 2, 3], true).await;

        let gaps = store.find_gaps().await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_id, 4);
        assert_eq!(gaps[0].end_id, 3 + 1000);
        store.close().await;
    }

    #[tokio::test]
    async fn test_hole_between_found_ids_stays_open() {
        let store = memory_store().await;
        let mut tracker = tracker(config(1000));
        tracker.before_routing(&store).await.unwrap();
        run_after_routing(&mut tracker, &store, &[1, 2, 5], true).await;

        let gaps = store.find_gaps().await.unwrap();
        let ranges: Vec<(i64, i64)> = gaps.iter().map(|g| (g.start_id, g.end_id)).collect();
        assert_eq!(ranges, vec![(3, 4), (6, 5 + 1000)]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_timeout_expiry_deletes_empty_stale_gap() {
        let store = memory_store().await;
        let stale = Utc::now() - ChronoDuration::hours(3);
        seed_gaps(
            &store,
            &[Gap::new(10, 20, stale), Gap::new(21, 21 + 1000, Utc::now())],
        )
        .await;
        let mut tracker = tracker(config(1000));
        tracker.before_routing(&store).await.unwrap();
        run_after_routing(&mut tracker, &store, &[], true).await;

        let gaps = store.find_gaps().await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_id, 21);
        store.close().await;
    }

    #[tokio::test]
    async fn test_expiry_never_abandons_gap_with_data() {
        let store = memory_store().await;
        // A change row sits inside the stale gap but was never delivered.
        let mut change = crate::model::ChangeRow {
            data_id: 15,
            table_name: "item".to_string(),
            event_kind: crate::model::EventKind::Insert,
            row_data: Some("15".to_string()),
            old_data: None,
            pk_data: None,
            transaction_id: None,
            channel_id: "default".to_string(),
            source_node_id: None,
            create_time: Utc::now(),
        };
        store.insert_change_with_id(&change).await.unwrap();
        change.data_id = 2000;
        store.insert_change_with_id(&change).await.unwrap();

        let stale = Utc::now() - ChronoDuration::hours(3);
        seed_gaps(
            &store,
            &[Gap::new(10, 20, stale), Gap::new(21, 21 + 1000, Utc::now())],
        )
        .await;
        let mut tracker = tracker(config(1000));
        tracker.before_routing(&store).await.unwrap();
        run_after_routing(&mut tracker, &store, &[], true).await;

        // The stale gap survives because its range holds a captured row.
        let gaps = store.find_gaps().await.unwrap();
        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].start_id, 10);
        store.close().await;
    }

    #[tokio::test]
    async fn test_fresh_gap_not_expired() {
        let store = memory_store().await;
        seed_gaps(
            &store,
            &[
                Gap::new(10, 20, Utc::now()),
                Gap::new(21, 21 + 1000, Utc::now()),
            ],
        )
        .await;
        let mut tracker = tracker(config(1000));
        tracker.before_routing(&store).await.unwrap();
        run_after_routing(&mut tracker, &store, &[], true).await;

        assert_eq!(store.find_gaps().await.unwrap().len(), 2);
        store.close().await;
    }

    #[tokio::test]
    async fn test_transaction_view_expiry() {
        let store = memory_store().await;
        let gap_time = Utc::now() - ChronoDuration::minutes(10);
        seed_gaps(
            &store,
            &[
                Gap::new(10, 20, gap_time),
                Gap::new(21, 21 + 1000, Utc::now()),
            ],
        )
        .await;

        // Earliest in-flight transaction started well after the gap was
        // created, so the gap's ids can never be filled.
        let monitor = Arc::new(FixedMonitor(Some(Utc::now())));
        let mut tracker = GapTracker::new(config(1000), monitor);
        tracker.before_routing(&store).await.unwrap();
        run_after_routing(&mut tracker, &store, &[], true).await;
        assert_eq!(store.find_gaps().await.unwrap().len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_transaction_view_keeps_gap_newer_than_oldest_transaction() {
        let store = memory_store().await;
        seed_gaps(
            &store,
            &[
                Gap::new(10, 20, Utc::now() - ChronoDuration::hours(5)),
                Gap::new(21, 21 + 1000, Utc::now()),
            ],
        )
        .await;

        // An in-flight transaction predates the gap: the stale timeout is
        // irrelevant and the gap must stay open.
        let monitor = Arc::new(FixedMonitor(Some(Utc::now() - ChronoDuration::hours(6))));
        let mut tracker = GapTracker::new(config(1000), monitor);
        tracker.before_routing(&store).await.unwrap();
        run_after_routing(&mut tracker, &store, &[], true).await;
        assert_eq!(store.find_gaps().await.unwrap().len(), 2);
        store.close().await;
    }

    #[tokio::test]
    async fn test_busy_expire_cadence() {
        let store = memory_store().await;
        let stale = Utc::now() - ChronoDuration::hours(3);
        seed_gaps(
            &store,
            &[Gap::new(10, 20, stale), Gap::new(21, 21 + 1000, Utc::now())],
        )
        .await;
        let mut cfg = config(1000);
        cfg.busy_expire_interval = "0s".to_string();
        let mut tracker = tracker(cfg);
        tracker.before_routing(&store).await.unwrap();

        // First incomplete pass only arms the cadence timer.
        run_after_routing(&mut tracker, &store, &[], false).await;
        assert_eq!(store.find_gaps().await.unwrap().len(), 2);

        // Second incomplete pass is past the (zero) interval and expires.
        run_after_routing(&mut tracker, &store, &[], false).await;
        assert_eq!(store.find_gaps().await.unwrap().len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_repair_overlapping_gaps() {
        let store = memory_store().await;
        let now = Utc::now();
        seed_gaps(
            &store,
            &[
                Gap::new(10, 30, now),
                Gap::new(25, 40, now),
                Gap::new(50, 50 + 1000, now),
            ],
        )
        .await;
        let mut tracker = tracker(config(1000));
        tracker.before_routing(&store).await.unwrap();

        let ranges: Vec<(i64, i64)> = store
            .find_gaps()
            .await
            .unwrap()
            .iter()
            .map(|g| (g.start_id, g.end_id))
            .collect();
        assert_eq!(ranges, vec![(10, 40), (50, 50 + 1000)]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_repair_drops_gaps_after_trailing_gap() {
        let store = memory_store().await;
        let now = Utc::now();
        seed_gaps(
            &store,
            &[
                Gap::new(10, 20, now),
                Gap::new(30, 30 + 1000, now),
                Gap::new(5000, 5100, now),
            ],
        )
        .await;
        let mut tracker = tracker(config(1000));
        tracker.before_routing(&store).await.unwrap();

        let ranges: Vec<(i64, i64)> = store
            .find_gaps()
            .await
            .unwrap()
            .iter()
            .map(|g| (g.start_id, g.end_id))
            .collect();
        assert_eq!(ranges, vec![(10, 20), (30, 30 + 1000)]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_collapse_to_covering_gap_and_back() {
        let store = memory_store().await;
        let mut cfg = config(100_000);
        cfg.max_gap_changes = 3;
        let mut tracker = tracker(cfg);
        tracker.before_routing(&store).await.unwrap();

        // Sparse ids split the trailing gap into many pieces: more than
        // three changes, so the persisted set collapses.
        run_after_routing(&mut tracker, &store, &[10, 20, 30, 40, 50], true).await;
        let persisted = store.find_gaps().await.unwrap();
        assert_eq!(persisted.len(), 1);
        // In-memory list keeps the real resolution.
        assert!(tracker.gaps().len() > 1);
        let covering = persisted[0];
        assert_eq!(covering.start_id, tracker.gaps()[0].start_id);
        assert_eq!(covering.end_id, tracker.gaps().last().unwrap().end_id);

        // A quiet pass with one found id produces few changes and switches
        // back to per-gap persistence.
        run_after_routing(&mut tracker, &store, &[11], true).await;
        let persisted = store.find_gaps().await.unwrap();
        assert_eq!(persisted.len(), tracker.gaps().len());
        assert!(persisted.len() > 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_full_analysis_uses_persisted_events() {
        let store = memory_store().await;
        let now = Utc::now();
        seed_gaps(&store, &[Gap::new(1, 1000, now)]).await;

        // Ids 1..=3 were routed by a previous process whose gap save was lost.
        let mut tx = store.begin().await.unwrap();
        let mut batch = crate::model::OutgoingBatch::new("node-2", "default");
        tx.insert_batch(&mut batch).await.unwrap();
        tx.insert_data_events(&[
            crate::model::DataEvent::new(1, batch.batch_id, "r1"),
            crate::model::DataEvent::new(2, batch.batch_id, "r1"),
            crate::model::DataEvent::new(3, batch.batch_id, "r1"),
        ])
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut tracker = tracker(config(1000));
        tracker.before_routing(&store).await.unwrap();

        let gaps = store.find_gaps().await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_id, 4);
        store.close().await;
    }

    #[tokio::test]
    async fn test_after_routing_resets_pass_state() {
        let store = memory_store().await;
        let mut tracker = tracker(config(1000));
        tracker.before_routing(&store).await.unwrap();
        run_after_routing(&mut tracker, &store, &[1], false).await;
        // Next channel starts clean.
        assert!(tracker.data_ids.is_empty());
        assert!(tracker.all_data_read);
        store.close().await;
    }
}
