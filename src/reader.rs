// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change reading: cursor strategies and the peek-ahead producer task.
//!
//! The reader is spawned per channel pass. It scans the change log through
//! one of three cursor strategies, filters rows through the pass's immutable
//! gap snapshot, regroups them by source transaction in a bounded peek-ahead
//! buffer, and hands them to the routing loop over a bounded mpsc queue:
//!
//! ```text
//!  cursor ──> gap filter ──> peek-ahead buffer ──> mpsc ──> routing loop
//!             (rereads         (transaction          (backpressure,
//!              dropped)         regrouping)           close = end of data)
//! ```
//!
//! # Cursor strategies
//!
//! - *gap ranges*: with few gaps, the WHERE clause enumerates them. If there
//!   are more gaps than fit one query, the last qualified range is extended
//!   to the final gap's end and the gap filter drops the holes.
//! - *open-ended*: with many gaps, one scan from the first gap's start.
//!   Everything already routed comes back too; the gap filter drops it and
//!   counts a re-read.
//! - *multi-query*: one query per chunk of gaps, walked in order.
//!
//! All strategies page with a keyset (`data_id > last`), ascending. Sources
//! that cannot honor the ordering can opt into `buffer_and_sort`, which
//! drains the cursor fully and sorts before delivery.
//!
//! # Peek-ahead
//!
//! Delivery keeps the rows of one source transaction contiguous: while a
//! transaction is in flight, only its rows leave the buffer; everything else
//! waits until the transaction has no more rows buffered. A channel pass
//! stops accepting *new* transactions once `max_data_to_route` rows have
//! been delivered, but always finishes the in-flight one. Crossing the
//! buffered-byte ceiling flips the reader into finish-transaction mode:
//! unrelated rows are dropped (left in their gaps for the next pass) and
//! only the in-flight transaction drains.
//!
//! # Cancellation
//!
//! One path: the watch stop flag ends production, and the producer closing
//! the queue is the end-of-data signal. There is no sentinel row.

use crate::config::{ChannelConfig, ReaderConfig};
use crate::error::{Result, RouterError};
use crate::metrics;
use crate::model::{ChangeRow, Gap};
use crate::store::{ChangeStore, GapPredicate, Projection};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the producer task reports when it finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderSummary {
    pub rows_delivered: u64,
    /// Rows the open-ended cursor returned outside every gap.
    pub rows_reread: u64,
    /// Rows discarded in finish-transaction mode.
    pub rows_dropped: u64,
    /// True only when the cursor was fully drained and nothing was dropped.
    pub all_data_read: bool,
}

/// Consumer half of a spawned reader.
pub struct ReaderHandle {
    rx: mpsc::Receiver<ChangeRow>,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<Result<ReaderSummary>>,
    queue_timeout: std::time::Duration,
    channel_id: String,
}

impl ReaderHandle {
    /// Next row, or `None` at end of data.
    ///
    /// Waiting longer than the queue timeout fails the pass: a reader that
    /// is alive but produces nothing means the source database stalled.
    pub async fn take(&mut self) -> Result<Option<ChangeRow>> {
        let started = Instant::now();
        match tokio::time::timeout(self.queue_timeout, self.rx.recv()).await {
            Ok(row) => {
                metrics::record_queue_wait(&self.channel_id, started.elapsed());
                Ok(row)
            }
            Err(_) => Err(RouterError::QueueTimeout {
                channel_id: self.channel_id.clone(),
                waited_ms: self.queue_timeout.as_millis() as u64,
            }),
        }
    }

    /// Ask the producer to stop at the next opportunity.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for the producer and collect its summary.
    ///
    /// Drops the consumer side first, so a producer blocked on a full queue
    /// unblocks and winds down.
    pub async fn finish(self) -> Result<ReaderSummary> {
        drop(self.rx);
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(RouterError::Internal(format!("reader task panicked: {e}"))),
        }
    }
}

/// Monotonic membership check against the sorted gap snapshot.
///
/// Row ids arrive ascending, so a single index cursor over the immutable
/// snapshot answers each check in amortized constant time.
struct GapFilter {
    gaps: Arc<[Gap]>,
    idx: usize,
}

impl GapFilter {
    fn new(gaps: Arc<[Gap]>) -> Self {
        Self { gaps, idx: 0 }
    }

    fn contains(&mut self, data_id: i64) -> bool {
        while let Some(gap) = self.gaps.get(self.idx) {
            if data_id < gap.start_id {
                return false;
            }
            if data_id <= gap.end_id {
                return true;
            }
            self.idx += 1;
        }
        false
    }
}

/// Which query shape the cursor uses.
#[derive(Debug)]
enum CursorMode {
    /// Gap ranges enumerated in one query.
    Ranges(Vec<Gap>),
    /// Open-ended scan from the first gap's start.
    OpenEnded(i64),
    /// One query per chunk of gaps, in order.
    MultiQuery(Vec<Vec<Gap>>),
}

/// Keyset-paging cursor over the change log.
struct GapCursor {
    store: ChangeStore,
    channel_id: String,
    projection: Projection,
    mode: CursorMode,
    batch_idx: usize,
    after_id: i64,
    page: VecDeque<ChangeRow>,
    page_size: usize,
    exhausted: bool,
}

impl GapCursor {
    /// Pick the cursor strategy for this snapshot.
    fn prepare(
        store: ChangeStore,
        channel_id: String,
        projection: Projection,
        config: &ReaderConfig,
        gaps: &[Gap],
    ) -> Self {
        let mode = if gaps.is_empty() {
            // Defensive; the tracker always keeps a trailing gap open.
            CursorMode::Ranges(Vec::new())
        } else if config.use_multi_query {
            let batches = gaps
                .chunks(config.gaps_per_query.max(1))
                .map(<[Gap]>::to_vec)
                .collect();
            CursorMode::MultiQuery(batches)
        } else if gaps.len() > config.gap_threshold {
            info!(
                channel_id = %channel_id,
                gaps = gaps.len(),
                threshold = config.gap_threshold,
                "Switching to open-ended change scan"
            );
            CursorMode::OpenEnded(gaps[0].start_id)
        } else {
            let qualify = config.gaps_per_query.max(1);
            let mut ranges: Vec<Gap> = gaps.iter().take(qualify).copied().collect();
            if gaps.len() > qualify {
                // More gaps than the query qualifies: stretch the last range
                // to the final gap's end and let the gap filter do the rest.
                if let (Some(last_range), Some(last_gap)) = (ranges.last_mut(), gaps.last()) {
                    last_range.end_id = last_gap.end_id;
                }
            }
            CursorMode::Ranges(ranges)
        };

        Self {
            store,
            channel_id,
            projection,
            mode,
            batch_idx: 0,
            after_id: 0,
            page: VecDeque::new(),
            page_size: config.fetch_page_size.max(1),
            exhausted: false,
        }
    }

    async fn next(&mut self) -> Result<Option<ChangeRow>> {
        loop {
            if let Some(row) = self.page.pop_front() {
                self.after_id = row.data_id;
                return Ok(Some(row));
            }
            if self.exhausted {
                return Ok(None);
            }

            let predicate = match &self.mode {
                CursorMode::Ranges(ranges) => {
                    if ranges.is_empty() {
                        self.exhausted = true;
                        continue;
                    }
                    GapPredicate::Ranges(ranges.clone())
                }
                CursorMode::OpenEnded(start_id) => GapPredicate::From(*start_id),
                CursorMode::MultiQuery(batches) => {
                    GapPredicate::Ranges(batches[self.batch_idx].clone())
                }
            };
            let rows = self
                .store
                .select_changes(
                    &self.channel_id,
                    &predicate,
                    self.after_id,
                    self.page_size,
                    self.projection,
                )
                .await?;
            if rows.len() < self.page_size {
                // Gap chunks are sorted, so ids stay ascending across
                // batches and the keyset carries over.
                match &self.mode {
                    CursorMode::MultiQuery(batches) if self.batch_idx + 1 < batches.len() => {
                        self.batch_idx += 1;
                    }
                    _ => self.exhausted = true,
                }
            }
            self.page.extend(rows);
        }
    }

    /// Drain everything and return it sorted by data id, for sources that
    /// cannot return changes in identifier order.
    async fn drain_sorted(&mut self) -> Result<Vec<ChangeRow>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        rows.sort_by_key(|r| r.data_id);
        Ok(rows)
    }
}

enum Source {
    Cursor(GapCursor),
    Sorted(std::vec::IntoIter<ChangeRow>),
}

impl Source {
    async fn next(&mut self) -> Result<Option<ChangeRow>> {
        match self {
            Self::Cursor(cursor) => cursor.next().await,
            Self::Sorted(iter) => Ok(iter.next()),
        }
    }
}

/// Producer half: owns the cursor and the peek-ahead buffer.
pub struct ChangeReader {
    store: ChangeStore,
    channel: ChannelConfig,
    config: ReaderConfig,
    snapshot: Arc<[Gap]>,
    projection: Projection,
}

impl ChangeReader {
    /// Spawn the producer task for one channel pass.
    pub fn spawn(
        store: ChangeStore,
        channel: ChannelConfig,
        config: ReaderConfig,
        snapshot: Arc<[Gap]>,
        projection: Projection,
    ) -> ReaderHandle {
        let (tx, rx) = mpsc::channel(config.peek_ahead_window.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let queue_timeout = config.queue_timeout_duration();
        let channel_id = channel.channel_id.clone();

        let reader = Self {
            store,
            channel,
            config,
            snapshot,
            projection,
        };
        let join = tokio::spawn(reader.run(tx, stop_rx));

        ReaderHandle {
            rx,
            stop_tx,
            join,
            queue_timeout,
            channel_id,
        }
    }

    async fn run(
        self,
        tx: mpsc::Sender<ChangeRow>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<ReaderSummary> {
        let cursor = GapCursor::prepare(
            self.store.clone(),
            self.channel.channel_id.clone(),
            self.projection,
            &self.config,
            &self.snapshot,
        );
        let mut source = if self.config.buffer_and_sort {
            let mut cursor = cursor;
            Source::Sorted(cursor.drain_sorted().await?.into_iter())
        } else {
            Source::Cursor(cursor)
        };

        let mut filter = GapFilter::new(self.snapshot.clone());
        let mut peek: VecDeque<ChangeRow> = VecDeque::with_capacity(self.config.peek_ahead_window);
        let mut summary = ReaderSummary {
            rows_delivered: 0,
            rows_reread: 0,
            rows_dropped: 0,
            all_data_read: false,
        };

        let nontransactional = self.channel.batch_algorithm == "nontransactional";
        let max_data = self.channel.max_data_to_route;
        let mut last_tx: Option<String> = None;
        let mut more = true;
        let mut stopped = false;
        let mut peek_bytes = 0usize;
        let mut finish_tx_mode = false;

        while summary.rows_delivered <= max_data || last_tx.is_some() {
            if *stop_rx.borrow() {
                stopped = true;
                break;
            }

            if more {
                more = self
                    .fill_peek_ahead(
                        &mut peek,
                        &mut source,
                        &mut filter,
                        last_tx.as_deref(),
                        &mut peek_bytes,
                        &mut finish_tx_mode,
                        &mut summary,
                    )
                    .await?;
            }

            if (last_tx.is_none() || nontransactional) && !peek.is_empty() {
                let row = peek.pop_front().expect("peek not empty");
                peek_bytes = peek_bytes.saturating_sub(row.size_bytes());
                last_tx = row.transaction_id.clone();
                if !send_row(&tx, &mut stop_rx, row).await {
                    stopped = true;
                    break;
                }
                summary.rows_delivered += 1;
            } else if last_tx.is_some() && !peek.is_empty() {
                // Release every buffered row of the in-flight transaction.
                let tx_id = last_tx.clone().expect("in-flight transaction");
                let mut released = 0u64;
                let mut i = 0;
                while i < peek.len() {
                    if peek[i].transaction_id.as_deref() == Some(tx_id.as_str()) {
                        let row = peek.remove(i).expect("index in bounds");
                        peek_bytes = peek_bytes.saturating_sub(row.size_bytes());
                        if !send_row(&tx, &mut stop_rx, row).await {
                            stopped = true;
                            break;
                        }
                        summary.rows_delivered += 1;
                        released += 1;
                    } else {
                        i += 1;
                    }
                }
                if stopped {
                    break;
                }
                if released == 0 {
                    // Transaction boundary confirmed.
                    last_tx = None;
                }
            } else if peek.is_empty() {
                break;
            }
        }

        summary.all_data_read = !more && peek.is_empty() && !stopped && !finish_tx_mode;
        if summary.rows_reread > 0 {
            metrics::record_reader_rereads(&self.channel.channel_id, summary.rows_reread);
        }
        debug!(
            channel_id = %self.channel.channel_id,
            delivered = summary.rows_delivered,
            reread = summary.rows_reread,
            dropped = summary.rows_dropped,
            all_data_read = summary.all_data_read,
            "Reader finished"
        );
        // Dropping `tx` closes the queue: that is the end-of-data signal.
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fill_peek_ahead(
        &self,
        peek: &mut VecDeque<ChangeRow>,
        source: &mut Source,
        filter: &mut GapFilter,
        last_tx: Option<&str>,
        peek_bytes: &mut usize,
        finish_tx_mode: &mut bool,
        summary: &mut ReaderSummary,
    ) -> Result<bool> {
        let to_read = self.config.peek_ahead_window.saturating_sub(peek.len());
        let mut read = 0;
        while read < to_read {
            match source.next().await? {
                Some(row) => {
                    if !filter.contains(row.data_id) {
                        // Already routed (or outside the snapshot); the
                        // open-ended scan re-reads these.
                        summary.rows_reread += 1;
                        continue;
                    }
                    if *finish_tx_mode
                        && (last_tx.is_none() || row.transaction_id.as_deref() != last_tx)
                    {
                        summary.rows_dropped += 1;
                        continue;
                    }
                    *peek_bytes += row.size_bytes();
                    if !*finish_tx_mode && *peek_bytes > self.config.peek_ahead_max_bytes {
                        warn!(
                            channel_id = %self.channel.channel_id,
                            buffered_bytes = *peek_bytes,
                            limit = self.config.peek_ahead_max_bytes,
                            "Peek-ahead memory limit reached, draining in-flight transaction only"
                        );
                        *finish_tx_mode = true;
                    }
                    peek.push_back(row);
                    read += 1;
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }
}

/// Send one row, giving up if stop is requested while the queue is full or
/// the consumer has gone away.
async fn send_row(
    tx: &mpsc::Sender<ChangeRow>,
    stop_rx: &mut watch::Receiver<bool>,
    row: ChangeRow,
) -> bool {
    tokio::select! {
        result = tx.send(row) => result.is_ok(),
        _ = stop_rx.changed() => !*stop_rx.borrow(),
    }
}
