// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the change-data-capture router.
//!
//! Errors are categorized by their source (storage, strategy code, gap
//! reconciliation, etc.) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Yes | SQLite errors (busy, locked, transient I/O) |
//! | `RowTooLarge` | Yes | A change row exceeded the projected read's byte ceiling; re-run with full projection |
//! | `Strategy` | No | A routing strategy raised; aborts the channel pass |
//! | `GapReconcile` | No | Gap table reached an inconsistent state |
//! | `QueueTimeout` | No | Reader produced no row within the queue-wait timeout |
//! | `Config` | No | Configuration invalid |
//! | `Interrupted` | No | Stop was requested mid-pass |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`RouterError::is_retryable()`] to determine if an operation should be
//! retried. A failed channel pass rolls back as a unit either way; retryable
//! errors mean the *next* pass is expected to succeed without operator action.
//! `RowTooLarge` is special: the engine re-runs the same channel pass once
//! with every payload column selected before giving up.

use thiserror::Error;

/// Result type alias for routing operations.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors that can occur while routing captured changes.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum RouterError {
    /// SQLite error against the change store.
    ///
    /// Busy/locked errors are already retried at the statement level;
    /// an error surfacing here failed those retries or is a harder fault.
    /// Treated as retryable at the pass level: the pass rolls back and the
    /// next scheduled pass picks the same gaps up again.
    #[error("Store error ({operation}): {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// A change row was too large for the projected (partial) read.
    ///
    /// Raised when a row's stored payload exceeds the byte ceiling of a
    /// partial projection. The engine retries the channel pass once with
    /// the full (uncapped) projection forced.
    #[error("Change row too large for projected read on channel {channel_id}")]
    RowTooLarge { channel_id: String },

    /// A routing strategy implementation failed.
    ///
    /// Strategy code is user-supplied; a failure here aborts the channel
    /// pass (full rollback) so no partial batch from the failing row's
    /// transaction can leak out.
    #[error("Strategy error (router {router_id}): {message}")]
    Strategy { router_id: String, message: String },

    /// Gap reconciliation detected an inconsistent gap table.
    ///
    /// Not retryable - the gap list violates its own invariants and a full
    /// reconciliation is forced on the next pass.
    #[error("Gap reconcile error: {0}")]
    GapReconcile(String),

    /// The reader produced no row within the queue-wait timeout.
    ///
    /// The pass is abandoned and rolled back. Usually means the source
    /// database stalled under the reader.
    #[error("Reader queue timeout on channel {channel_id} after {waited_ms}ms")]
    QueueTimeout { channel_id: String, waited_ms: u64 },

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stop was requested while a pass was in flight.
    ///
    /// The pass rolls back like any other failure; nothing partial commits.
    #[error("Routing interrupted by stop request")]
    Interrupted,

    /// Engine state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., routing before the store schema exists).
    /// Not retryable - indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Create a store error tagged with the operation that failed
    pub fn store(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Store { operation, source }
    }

    /// Create a strategy error
    pub fn strategy(router_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Strategy {
            router_id: router_id.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable on a later pass
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { .. } => true,
            Self::RowTooLarge { .. } => true, // Retried once with full projection
            Self::Strategy { .. } => false,
            Self::GapReconcile(_) => false,
            Self::QueueTimeout { .. } => false,
            Self::Config(_) => false,
            Self::Interrupted => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<sqlx::Error> for RouterError {
    fn from(e: sqlx::Error) -> Self {
        Self::store("unknown", e)
    }
}
