// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core data model: captured change rows, gaps, batches and data events.
//!
//! A `ChangeRow` is one captured database change, identified by a
//! monotonically increasing `data_id`. Routing does not assume the sequence
//! is dense: identifiers assigned to transactions that later rolled back (or
//! that are still uncommitted) leave holes, tracked as [`Gap`]s.
//!
//! Routing output is a set of [`OutgoingBatch`] rows (one per target node per
//! channel pass, at minimum) joined to the change log through [`DataEvent`]
//! link rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node id used for changes no strategy claimed.
///
/// Batches addressed to this pseudo-node are created already in the terminal
/// state so the change rows count as routed and their gaps close, but nothing
/// is ever transmitted.
pub const UNROUTED_NODE_ID: &str = "-1";

/// Router id recorded on data events that fell through to the unrouted node.
pub const UNKNOWN_ROUTER_ID: &str = "?";

/// Kind of captured change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    /// Full-table reload request.
    Reload,
    /// Arbitrary SQL to replay on the target.
    Sql,
}

impl EventKind {
    /// Single-character storage code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
            Self::Reload => "R",
            Self::Sql => "S",
        }
    }

    /// Parse the storage code back into a kind.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(Self::Insert),
            "U" => Some(Self::Update),
            "D" => Some(Self::Delete),
            "R" => Some(Self::Reload),
            "S" => Some(Self::Sql),
            _ => None,
        }
    }
}

/// One captured change, as read from the change log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    /// Monotonically increasing change identifier (may have holes).
    pub data_id: i64,
    /// Source table the change was captured from.
    pub table_name: String,
    pub event_kind: EventKind,
    /// New column values, CSV-encoded. Empty when the channel projects it out.
    pub row_data: Option<String>,
    /// Previous column values, CSV-encoded (updates/deletes).
    pub old_data: Option<String>,
    /// Primary-key values, CSV-encoded.
    pub pk_data: Option<String>,
    /// Source transaction id; `None` for autocommit captures.
    pub transaction_id: Option<String>,
    /// Channel the capturing trigger assigned.
    pub channel_id: String,
    /// Node the change originally came from, if it was itself replicated in.
    pub source_node_id: Option<String>,
    pub create_time: DateTime<Utc>,
}

impl ChangeRow {
    /// Approximate in-memory payload size, used for the peek-ahead memory bound.
    pub fn size_bytes(&self) -> usize {
        self.table_name.len()
            + self.row_data.as_deref().map_or(0, str::len)
            + self.old_data.as_deref().map_or(0, str::len)
            + self.pk_data.as_deref().map_or(0, str::len)
            + self.transaction_id.as_deref().map_or(0, str::len)
            + 64 // fixed fields
    }

    /// Whether this row belongs to the same source transaction as `other`.
    ///
    /// Autocommit rows (no transaction id) never group with anything.
    pub fn same_transaction(&self, other: &ChangeRow) -> bool {
        match (&self.transaction_id, &other.transaction_id) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// Status of a persisted gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapStatus {
    /// Still waiting for data in the range.
    Open,
    /// Expired or filled; kept only until the delete commits.
    Closed,
}

impl GapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "GP",
            Self::Closed => "OK",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GP" => Some(Self::Open),
            "OK" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// An inclusive range `[start_id, end_id]` of change identifiers that were
/// never seen by routing.
///
/// The persisted gap list is kept disjoint and sorted; the union of all gaps
/// plus the already-routed ids covers the whole identifier space up to the
/// trailing gap's end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gap {
    pub start_id: i64,
    pub end_id: i64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_time: DateTime<Utc>,
}

impl Gap {
    pub fn new(start_id: i64, end_id: i64, create_time: DateTime<Utc>) -> Self {
        Self {
            start_id,
            end_id,
            create_time,
        }
    }

    /// Number of identifiers the gap spans.
    pub fn size(&self) -> i64 {
        self.end_id - self.start_id
    }

    pub fn contains(&self, data_id: i64) -> bool {
        data_id >= self.start_id && data_id <= self.end_id
    }

    pub fn overlaps(&self, other: &Gap) -> bool {
        self.start_id <= other.end_id && other.start_id <= self.end_id
    }
}

/// Status of an outgoing batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Being filled by an in-flight routing pass.
    Routing,
    /// Routed and committed; visible to transmitters.
    ReadyToSend,
    /// Terminal; used for unrouted pseudo-batches which never transmit.
    Ok,
    /// Marked in error by an operator or transmitter.
    Error,
    /// Ignored by operator request.
    Ignored,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routing => "RT",
            Self::ReadyToSend => "NE",
            Self::Ok => "OK",
            Self::Error => "ER",
            Self::Ignored => "IG",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RT" => Some(Self::Routing),
            "NE" => Some(Self::ReadyToSend),
            "OK" => Some(Self::Ok),
            "ER" => Some(Self::Error),
            "IG" => Some(Self::Ignored),
            _ => None,
        }
    }
}

/// A batch of routed changes addressed to one node on one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingBatch {
    /// Assigned by the store on insert (0 until then).
    pub batch_id: i64,
    pub node_id: String,
    pub channel_id: String,
    pub status: BatchStatus,
    /// Shared batch id across nodes (common-batch mode).
    pub common: bool,
    pub data_event_count: i64,
    pub insert_event_count: i64,
    pub update_event_count: i64,
    pub delete_event_count: i64,
    pub reload_event_count: i64,
    pub other_event_count: i64,
    /// Time spent routing into this batch, filled at completion.
    pub router_millis: i64,
    pub create_time: DateTime<Utc>,
}

impl OutgoingBatch {
    pub fn new(node_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            batch_id: 0,
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            status: BatchStatus::Routing,
            common: false,
            data_event_count: 0,
            insert_event_count: 0,
            update_event_count: 0,
            delete_event_count: 0,
            reload_event_count: 0,
            other_event_count: 0,
            router_millis: 0,
            create_time: Utc::now(),
        }
    }

    /// Count one routed event of the given kind into the batch totals.
    pub fn increment_event_count(&mut self, kind: EventKind) {
        self.data_event_count += 1;
        match kind {
            EventKind::Insert => self.insert_event_count += 1,
            EventKind::Update => self.update_event_count += 1,
            EventKind::Delete => self.delete_event_count += 1,
            EventKind::Reload => self.reload_event_count += 1,
            EventKind::Sql => self.other_event_count += 1,
        }
    }

    pub fn is_unrouted(&self) -> bool {
        self.node_id == UNROUTED_NODE_ID
    }
}

/// Link row joining one change to one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEvent {
    pub data_id: i64,
    pub batch_id: i64,
    /// Rule that claimed the row (first writer wins per node).
    pub router_id: String,
}

impl DataEvent {
    pub fn new(data_id: i64, batch_id: i64, router_id: impl Into<String>) -> Self {
        Self {
            data_id,
            batch_id,
            router_id: router_id.into(),
        }
    }
}

/// Parse one CSV-encoded capture payload into column values.
///
/// The capture format quotes values containing commas or quotes and doubles
/// embedded quotes. An empty unquoted value is a SQL NULL (`None`); an empty
/// quoted value is an empty string.
pub fn parse_csv_values(line: &str) -> Vec<Option<String>> {
    let mut values = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        let mut field = String::new();
        let mut quoted = false;

        if chars.peek() == Some(&'"') {
            quoted = true;
            chars.next();
            while let Some(c) = chars.next() {
                if c == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        break;
                    }
                } else {
                    field.push(c);
                }
            }
            // Consume up to the separator
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                chars.next();
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                field.push(c);
                chars.next();
            }
        }

        if !quoted && field.is_empty() {
            values.push(None);
        } else {
            values.push(Some(field));
        }

        match chars.next() {
            Some(',') => continue,
            _ => break,
        }
    }

    values
}
