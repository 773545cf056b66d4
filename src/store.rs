// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed change store.
//!
//! Holds the four routing tables:
//!
//! - `change_data`: the captured change log, keyed by `data_id`
//! - `data_gap`: identifier ranges routing has not yet seen
//! - `outgoing_batch`: routed batches per node and channel
//! - `data_event`: link rows joining changes to batches
//!
//! # Unit of Work
//!
//! A channel pass mutates `outgoing_batch`, `data_event` and `data_gap` only
//! through a [`StoreTx`]. Everything a pass writes commits atomically with
//! the gap updates, or rolls back together. Mid-pass commits
//! ([`StoreTx::commit_and_continue`]) are used when a batch-completion policy
//! asks for sealed batches to become visible before the pass ends.
//!
//! Reads used by the Change Reader go through the pool, outside the pass
//! transaction. WAL mode keeps those reads from blocking the writer.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Pool-side statements retry with exponential backoff
//! (default 5 attempts).

use crate::config::{ChannelConfig, StoreConfig};
use crate::error::{Result, RouterError};
use crate::model::{BatchStatus, ChangeRow, DataEvent, EventKind, Gap, GapStatus, OutgoingBatch};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Distinguishes in-memory databases opened by separate stores in one process.
static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Which payload columns a change read selects.
///
/// Columns a channel projects out come back as empty strings, which keeps
/// very large payloads the channel does not route off the wire entirely.
/// A projected read may also carry a byte ceiling: a row whose stored
/// payload exceeds it fails the read with [`RouterError::RowTooLarge`],
/// and the caller falls back to the uncapped full projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projection {
    pub row_data: bool,
    pub old_data: bool,
    pub pk_data: bool,
    /// Reject rows whose total stored payload exceeds this many bytes.
    pub byte_cap: Option<i64>,
}

impl Projection {
    /// Every payload column selected, no size ceiling.
    pub fn full() -> Self {
        Self {
            row_data: true,
            old_data: true,
            pk_data: true,
            byte_cap: None,
        }
    }

    /// The projection a channel's flags ask for.
    pub fn for_channel(channel: &ChannelConfig) -> Self {
        Self {
            row_data: channel.use_row_data,
            old_data: channel.use_old_data,
            pk_data: channel.use_pk_data,
            byte_cap: None,
        }
    }

    pub fn with_byte_cap(mut self, cap: usize) -> Self {
        self.byte_cap = Some(cap as i64);
        self
    }

    pub fn is_full(&self) -> bool {
        self.row_data && self.old_data && self.pk_data
    }
}

/// Predicate the reader scans the change log with.
#[derive(Debug, Clone)]
pub enum GapPredicate {
    /// Enumerate the given gap ranges explicitly in the WHERE clause.
    Ranges(Vec<Gap>),
    /// Single open-ended scan from the first gap's start.
    From(i64),
}

/// Persistent change store backed by SQLite.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct ChangeStore {
    pool: SqlitePool,
    path: String,
}

impl ChangeStore {
    /// Open (and create, if missing) the change store.
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        let path = if config.is_in_memory() {
            // Named shared-cache database, so pool connections and pass
            // transactions see the same data within one process.
            let seq = MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed);
            format!("file:cdc_router_mem_{seq}?mode=memory&cache=shared")
        } else {
            config.sqlite_path.clone()
        };
        info!(path = %path, "Initializing change store");

        let mut options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))
            .map_err(|e| RouterError::Config(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .foreign_keys(false);
        if config.is_in_memory() {
            options = options.shared_cache(true);
        } else {
            options = options
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(2))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| RouterError::store("connect", e))?;

        let store = Self { pool, path };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS change_data (
                data_id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                event_kind TEXT NOT NULL,
                row_data TEXT,
                old_data TEXT,
                pk_data TEXT,
                transaction_id TEXT,
                channel_id TEXT NOT NULL,
                source_node_id TEXT,
                create_time TEXT NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_change_data_channel
                ON change_data (channel_id, data_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS data_gap (
                start_id INTEGER NOT NULL,
                end_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                create_time TEXT NOT NULL,
                PRIMARY KEY (start_id, end_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS outgoing_batch (
                batch_id INTEGER NOT NULL,
                node_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                status TEXT NOT NULL,
                common_flag INTEGER NOT NULL DEFAULT 0,
                data_event_count INTEGER NOT NULL DEFAULT 0,
                insert_event_count INTEGER NOT NULL DEFAULT 0,
                update_event_count INTEGER NOT NULL DEFAULT 0,
                delete_event_count INTEGER NOT NULL DEFAULT 0,
                reload_event_count INTEGER NOT NULL DEFAULT 0,
                other_event_count INTEGER NOT NULL DEFAULT 0,
                router_millis INTEGER NOT NULL DEFAULT 0,
                create_time TEXT NOT NULL,
                PRIMARY KEY (batch_id, node_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS data_event (
                data_id INTEGER NOT NULL,
                batch_id INTEGER NOT NULL,
                router_id TEXT NOT NULL,
                create_time TEXT NOT NULL,
                PRIMARY KEY (data_id, batch_id)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_data_event_data_id
                ON data_event (data_id)
            "#,
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| RouterError::store("create_schema", e))?;
        }
        Ok(())
    }

    /// Begin a routing unit of work.
    pub async fn begin(&self) -> Result<StoreTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RouterError::store("begin", e))?;
        Ok(StoreTx {
            tx: Some(tx),
            pool: self.pool.clone(),
        })
    }

    /// Capture a change, letting the store assign the next data id.
    ///
    /// This is the trigger-side API; tests use it to seed the change log.
    pub async fn insert_change(&self, change: &ChangeRow) -> Result<i64> {
        let result = execute_with_retry("insert_change", || async {
            sqlx::query(
                r#"
                INSERT INTO change_data
                    (table_name, event_kind, row_data, old_data, pk_data,
                     transaction_id, channel_id, source_node_id, create_time)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&change.table_name)
            .bind(change.event_kind.code())
            .bind(&change.row_data)
            .bind(&change.old_data)
            .bind(&change.pk_data)
            .bind(&change.transaction_id)
            .bind(&change.channel_id)
            .bind(&change.source_node_id)
            .bind(change.create_time)
            .execute(&self.pool)
            .await
        })
        .await
        .map_err(|e| RouterError::store("insert_change", e))?;
        Ok(result.last_insert_rowid())
    }

    /// Capture a change under an explicit data id.
    ///
    /// Used when the id sequence is managed externally; leaves holes when
    /// ids are skipped, which is exactly what the gap tracker reconciles.
    pub async fn insert_change_with_id(&self, change: &ChangeRow) -> Result<()> {
        execute_with_retry("insert_change_with_id", || async {
            sqlx::query(
                r#"
                INSERT INTO change_data
                    (data_id, table_name, event_kind, row_data, old_data, pk_data,
                     transaction_id, channel_id, source_node_id, create_time)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(change.data_id)
            .bind(&change.table_name)
            .bind(change.event_kind.code())
            .bind(&change.row_data)
            .bind(&change.old_data)
            .bind(&change.pk_data)
            .bind(&change.transaction_id)
            .bind(&change.channel_id)
            .bind(&change.source_node_id)
            .bind(change.create_time)
            .execute(&self.pool)
            .await
        })
        .await
        .map_err(|e| RouterError::store("insert_change_with_id", e))?;
        Ok(())
    }

    /// All open gaps, sorted by start id.
    pub async fn find_gaps(&self) -> Result<Vec<Gap>> {
        let rows = sqlx::query(
            "SELECT start_id, end_id, create_time FROM data_gap WHERE status = ? ORDER BY start_id",
        )
        .bind(GapStatus::Open.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RouterError::store("find_gaps", e))?;
        rows.iter()
            .map(|row| {
                Ok(Gap::new(
                    row.try_get("start_id")
                        .map_err(|e| RouterError::store("find_gaps", e))?,
                    row.try_get("end_id")
                        .map_err(|e| RouterError::store("find_gaps", e))?,
                    row.try_get("create_time")
                        .map_err(|e| RouterError::store("find_gaps", e))?,
                ))
            })
            .collect()
    }

    /// Highest captured data id, if any changes exist.
    pub async fn max_change_id(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(data_id) AS max_id FROM change_data")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RouterError::store("max_change_id", e))?;
        row.try_get("max_id")
            .map_err(|e| RouterError::store("max_change_id", e))
    }

    /// Count change rows with ids inside `[start_id, end_id]`, any channel.
    pub async fn count_changes_in_range(&self, start_id: i64, end_id: i64) -> Result<i64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM change_data WHERE data_id BETWEEN ? AND ?")
                .bind(start_id)
                .bind(end_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| RouterError::store("count_changes_in_range", e))?;
        row.try_get("n")
            .map_err(|e| RouterError::store("count_changes_in_range", e))
    }

    /// Distinct already-routed data ids inside `[start_id, end_id]`, ascending.
    pub async fn routed_ids_in_range(&self, start_id: i64, end_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT data_id FROM data_event
            WHERE data_id BETWEEN ? AND ?
            ORDER BY data_id
            "#,
        )
        .bind(start_id)
        .bind(end_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RouterError::store("routed_ids_in_range", e))?;
        rows.iter()
            .map(|row| {
                row.try_get("data_id")
                    .map_err(|e| RouterError::store("routed_ids_in_range", e))
            })
            .collect()
    }

    /// Highest routed data id, if any data events exist.
    pub async fn max_routed_id(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(data_id) AS max_id FROM data_event")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RouterError::store("max_routed_id", e))?;
        row.try_get("max_id")
            .map_err(|e| RouterError::store("max_routed_id", e))
    }

    /// Count change rows on a channel with ids beyond `after_data_id`.
    ///
    /// Reported as the channel's unrouted depth after a pass.
    pub async fn unrouted_count(&self, channel_id: &str, after_data_id: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM change_data WHERE channel_id = ? AND data_id > ?",
        )
        .bind(channel_id)
        .bind(after_data_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RouterError::store("unrouted_count", e))?;
        row.try_get("n")
            .map_err(|e| RouterError::store("unrouted_count", e))
    }

    /// One page of changes on a channel matching the gap predicate.
    ///
    /// Keyset pagination: rows with `data_id > after_id`, ascending, at most
    /// `limit` rows. Payload columns outside the projection come back empty.
    pub async fn select_changes(
        &self,
        channel_id: &str,
        predicate: &GapPredicate,
        after_id: i64,
        limit: usize,
        projection: Projection,
    ) -> Result<Vec<ChangeRow>> {
        let mut builder = sqlx::QueryBuilder::<Sqlite>::new("SELECT data_id, table_name, event_kind, ");
        builder.push(if projection.row_data {
            "row_data"
        } else {
            "'' AS row_data"
        });
        builder.push(", ");
        builder.push(if projection.old_data {
            "old_data"
        } else {
            "'' AS old_data"
        });
        builder.push(", ");
        builder.push(if projection.pk_data {
            "pk_data"
        } else {
            "'' AS pk_data"
        });
        if projection.byte_cap.is_some() {
            // Size the stored payload without shipping the blanked columns.
            builder.push(
                ", LENGTH(CAST(COALESCE(row_data, '') AS BLOB)) \
                 + LENGTH(CAST(COALESCE(old_data, '') AS BLOB)) \
                 + LENGTH(CAST(COALESCE(pk_data, '') AS BLOB)) AS payload_bytes",
            );
        }
        builder.push(
            ", transaction_id, channel_id, source_node_id, create_time \
             FROM change_data WHERE channel_id = ",
        );
        builder.push_bind(channel_id);
        builder.push(" AND data_id > ");
        builder.push_bind(after_id);

        match predicate {
            GapPredicate::Ranges(gaps) => {
                builder.push(" AND (");
                for (i, gap) in gaps.iter().enumerate() {
                    if i > 0 {
                        builder.push(" OR ");
                    }
                    builder.push("(data_id BETWEEN ");
                    builder.push_bind(gap.start_id);
                    builder.push(" AND ");
                    builder.push_bind(gap.end_id);
                    builder.push(")");
                }
                builder.push(")");
            }
            GapPredicate::From(start_id) => {
                builder.push(" AND data_id >= ");
                builder.push_bind(*start_id);
            }
        }

        builder.push(" ORDER BY data_id LIMIT ");
        builder.push_bind(limit as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RouterError::store("select_changes", e))?;
        rows.iter()
            .map(|row| map_change_row(row, channel_id, projection.byte_cap))
            .collect()
    }

    /// Batches on a channel, ordered by batch then node (test/ops queries).
    pub async fn find_batches(&self, channel_id: &str) -> Result<Vec<OutgoingBatch>> {
        let rows = sqlx::query(
            r#"
            SELECT batch_id, node_id, channel_id, status, common_flag,
                   data_event_count, insert_event_count, update_event_count,
                   delete_event_count, reload_event_count, other_event_count,
                   router_millis, create_time
            FROM outgoing_batch WHERE channel_id = ?
            ORDER BY batch_id, node_id
            "#,
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RouterError::store("find_batches", e))?;
        rows.iter().map(map_batch_row).collect()
    }

    /// Data events linked to a batch, ordered by data id.
    pub async fn find_data_events(&self, batch_id: i64) -> Result<Vec<DataEvent>> {
        let rows = sqlx::query(
            "SELECT data_id, batch_id, router_id FROM data_event WHERE batch_id = ? ORDER BY data_id",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RouterError::store("find_data_events", e))?;
        rows.iter()
            .map(|row| {
                Ok(DataEvent {
                    data_id: row
                        .try_get("data_id")
                        .map_err(|e| RouterError::store("find_data_events", e))?,
                    batch_id: row
                        .try_get("batch_id")
                        .map_err(|e| RouterError::store("find_data_events", e))?,
                    router_id: row
                        .try_get("router_id")
                        .map_err(|e| RouterError::store("find_data_events", e))?,
                })
            })
            .collect()
    }

    /// Total data-event rows in the store.
    pub async fn count_data_events(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM data_event")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RouterError::store("count_data_events", e))?;
        row.try_get("n")
            .map_err(|e| RouterError::store("count_data_events", e))
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Change store closed");
    }
}

fn map_change_row(row: &SqliteRow, channel_id: &str, byte_cap: Option<i64>) -> Result<ChangeRow> {
    if let Some(cap) = byte_cap {
        let payload_bytes: i64 = row
            .try_get("payload_bytes")
            .map_err(|e| RouterError::store("select_changes", e))?;
        if payload_bytes > cap {
            // The row exceeds the projected read; the pass is retried once
            // with the uncapped full projection.
            return Err(RouterError::RowTooLarge {
                channel_id: channel_id.to_string(),
            });
        }
    }

    let kind_code: String = row
        .try_get("event_kind")
        .map_err(|e| RouterError::store("select_changes", e))?;
    let event_kind = EventKind::from_code(&kind_code)
        .ok_or_else(|| RouterError::Internal(format!("unknown event kind code {kind_code:?}")))?;

    let payload = |name: &str| -> Result<Option<String>> {
        row.try_get(name)
            .map_err(|e| RouterError::store("select_changes", e))
    };

    Ok(ChangeRow {
        data_id: row
            .try_get("data_id")
            .map_err(|e| RouterError::store("select_changes", e))?,
        table_name: row
            .try_get("table_name")
            .map_err(|e| RouterError::store("select_changes", e))?,
        event_kind,
        row_data: payload("row_data")?,
        old_data: payload("old_data")?,
        pk_data: payload("pk_data")?,
        transaction_id: row
            .try_get("transaction_id")
            .map_err(|e| RouterError::store("select_changes", e))?,
        channel_id: row
            .try_get("channel_id")
            .map_err(|e| RouterError::store("select_changes", e))?,
        source_node_id: row
            .try_get("source_node_id")
            .map_err(|e| RouterError::store("select_changes", e))?,
        create_time: row
            .try_get("create_time")
            .map_err(|e| RouterError::store("select_changes", e))?,
    })
}

fn map_batch_row(row: &SqliteRow) -> Result<OutgoingBatch> {
    let status_code: String = row
        .try_get("status")
        .map_err(|e| RouterError::store("find_batches", e))?;
    let status = BatchStatus::from_str(&status_code)
        .ok_or_else(|| RouterError::Internal(format!("unknown batch status {status_code:?}")))?;
    let get_i64 = |name: &str| -> Result<i64> {
        row.try_get(name)
            .map_err(|e| RouterError::store("find_batches", e))
    };
    Ok(OutgoingBatch {
        batch_id: get_i64("batch_id")?,
        node_id: row
            .try_get("node_id")
            .map_err(|e| RouterError::store("find_batches", e))?,
        channel_id: row
            .try_get("channel_id")
            .map_err(|e| RouterError::store("find_batches", e))?,
        status,
        common: get_i64("common_flag")? != 0,
        data_event_count: get_i64("data_event_count")?,
        insert_event_count: get_i64("insert_event_count")?,
        update_event_count: get_i64("update_event_count")?,
        delete_event_count: get_i64("delete_event_count")?,
        reload_event_count: get_i64("reload_event_count")?,
        other_event_count: get_i64("other_event_count")?,
        router_millis: get_i64("router_millis")?,
        create_time: row
            .try_get("create_time")
            .map_err(|e| RouterError::store("find_batches", e))?,
    })
}

/// One routing unit of work.
///
/// Wraps a SQLite transaction. [`commit_and_continue`](Self::commit_and_continue)
/// commits what has accumulated and immediately opens a fresh transaction, so
/// a long pass can make sealed batches visible without ending the pass.
pub struct StoreTx {
    tx: Option<Transaction<'static, Sqlite>>,
    pool: SqlitePool,
}

impl StoreTx {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Sqlite>> {
        self.tx.as_mut().ok_or_else(|| RouterError::InvalidState {
            expected: "open transaction".to_string(),
            actual: "already committed or rolled back".to_string(),
        })
    }

    pub async fn insert_gap(&mut self, gap: &Gap) -> Result<()> {
        let tx = self.tx()?;
        sqlx::query(
            "INSERT INTO data_gap (start_id, end_id, status, create_time) VALUES (?, ?, ?, ?)",
        )
        .bind(gap.start_id)
        .bind(gap.end_id)
        .bind(GapStatus::Open.as_str())
        .bind(gap.create_time)
        .execute(&mut **tx)
        .await
        .map_err(|e| RouterError::store("insert_gap", e))?;
        Ok(())
    }

    pub async fn delete_gap(&mut self, gap: &Gap) -> Result<()> {
        let tx = self.tx()?;
        sqlx::query("DELETE FROM data_gap WHERE start_id = ? AND end_id = ?")
            .bind(gap.start_id)
            .bind(gap.end_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| RouterError::store("delete_gap", e))?;
        Ok(())
    }

    pub async fn delete_all_gaps(&mut self) -> Result<()> {
        let tx = self.tx()?;
        sqlx::query("DELETE FROM data_gap")
            .execute(&mut **tx)
            .await
            .map_err(|e| RouterError::store("delete_all_gaps", e))?;
        Ok(())
    }

    /// Insert buffered data events in one multi-row statement per chunk.
    pub async fn insert_data_events(&mut self, events: &[DataEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        // SQLite's bind limit is 32766 parameters; 4 binds per row.
        for chunk in events.chunks(8000) {
            let tx = self.tx()?;
            let mut builder = sqlx::QueryBuilder::<Sqlite>::new(
                "INSERT INTO data_event (data_id, batch_id, router_id, create_time) ",
            );
            builder.push_values(chunk, |mut b, event| {
                b.push_bind(event.data_id)
                    .push_bind(event.batch_id)
                    .push_bind(&event.router_id)
                    .push_bind(now);
            });
            builder
                .build()
                .execute(&mut **tx)
                .await
                .map_err(|e| RouterError::store("insert_data_events", e))?;
        }
        Ok(())
    }

    /// Next free batch id, under the single-writer transaction.
    pub async fn next_batch_id(&mut self) -> Result<i64> {
        let tx = self.tx()?;
        let row = sqlx::query("SELECT COALESCE(MAX(batch_id), 0) + 1 AS next_id FROM outgoing_batch")
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| RouterError::store("next_batch_id", e))?;
        row.try_get("next_id")
            .map_err(|e| RouterError::store("next_batch_id", e))
    }

    /// Insert a batch, assigning its id unless one is already set
    /// (common-batch mode re-uses one id across nodes).
    pub async fn insert_batch(&mut self, batch: &mut OutgoingBatch) -> Result<()> {
        if batch.batch_id == 0 {
            batch.batch_id = self.next_batch_id().await?;
        }
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO outgoing_batch
                (batch_id, node_id, channel_id, status, common_flag,
                 data_event_count, insert_event_count, update_event_count,
                 delete_event_count, reload_event_count, other_event_count,
                 router_millis, create_time)
            VALUES (?, ?, ?, ?, ?, 0, 0, 0, 0, 0, 0, 0, ?)
            "#,
        )
        .bind(batch.batch_id)
        .bind(&batch.node_id)
        .bind(&batch.channel_id)
        .bind(batch.status.as_str())
        .bind(batch.common as i64)
        .bind(batch.create_time)
        .execute(&mut **tx)
        .await
        .map_err(|e| RouterError::store("insert_batch", e))?;
        Ok(())
    }

    /// Write back a batch's status and counters.
    pub async fn update_batch(&mut self, batch: &OutgoingBatch) -> Result<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            UPDATE outgoing_batch SET
                status = ?, data_event_count = ?, insert_event_count = ?,
                update_event_count = ?, delete_event_count = ?,
                reload_event_count = ?, other_event_count = ?, router_millis = ?
            WHERE batch_id = ? AND node_id = ?
            "#,
        )
        .bind(batch.status.as_str())
        .bind(batch.data_event_count)
        .bind(batch.insert_event_count)
        .bind(batch.update_event_count)
        .bind(batch.delete_event_count)
        .bind(batch.reload_event_count)
        .bind(batch.other_event_count)
        .bind(batch.router_millis)
        .bind(batch.batch_id)
        .bind(&batch.node_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| RouterError::store("update_batch", e))?;
        Ok(())
    }

    /// Commit the unit of work.
    pub async fn commit(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit()
                .await
                .map_err(|e| RouterError::store("commit", e))?;
        }
        Ok(())
    }

    /// Commit what has accumulated and open a fresh transaction in place.
    pub async fn commit_and_continue(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit()
                .await
                .map_err(|e| RouterError::store("commit", e))?;
        }
        let fresh = self
            .pool
            .begin()
            .await
            .map_err(|e| RouterError::store("begin", e))?;
        self.tx = Some(fresh);
        Ok(())
    }

    /// Abandon the unit of work.
    pub async fn rollback(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback()
                .await
                .map_err(|e| RouterError::store("rollback", e))?;
        }
        Ok(())
    }
}
