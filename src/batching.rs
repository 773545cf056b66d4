// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch-completion policies.
//!
//! A policy decides, after each row lands in a batch, whether that batch is
//! complete. The built-in algorithms:
//!
//! | Tag                | Cut condition                                        |
//! |--------------------|------------------------------------------------------|
//! | `default`          | size reached, but only at a transaction boundary     |
//! | `transactional`    | every transaction boundary, regardless of size       |
//! | `nontransactional` | size reached, boundaries ignored                     |
//!
//! The `default` policy therefore lets a batch grow past `max_batch_size`
//! while a transaction is in flight; transactions are never split across
//! batches by any built-in policy.

use crate::config::ChannelConfig;
use crate::error::{Result, RouterError};
use crate::model::{ChangeRow, OutgoingBatch};
use std::collections::HashMap;
use std::sync::Arc;

/// Decides where outgoing batches get cut.
pub trait BatchPolicy: Send + Sync {
    /// Whether `batch` is complete after `row` was routed into it.
    /// `at_boundary` is true when the next row starts a different source
    /// transaction (or there is no next row).
    fn is_complete(
        &self,
        batch: &OutgoingBatch,
        row: &ChangeRow,
        at_boundary: bool,
        channel: &ChannelConfig,
    ) -> bool;
}

/// Cut at size, deferred to the next transaction boundary.
pub struct DefaultPolicy;

impl BatchPolicy for DefaultPolicy {
    fn is_complete(
        &self,
        batch: &OutgoingBatch,
        _row: &ChangeRow,
        at_boundary: bool,
        channel: &ChannelConfig,
    ) -> bool {
        at_boundary && batch.data_event_count >= channel.max_batch_size
    }
}

/// Cut at every transaction boundary.
pub struct TransactionalPolicy;

impl BatchPolicy for TransactionalPolicy {
    fn is_complete(
        &self,
        _batch: &OutgoingBatch,
        _row: &ChangeRow,
        at_boundary: bool,
        _channel: &ChannelConfig,
    ) -> bool {
        at_boundary
    }
}

/// Cut at size, ignoring transaction boundaries.
pub struct NontransactionalPolicy;

impl BatchPolicy for NontransactionalPolicy {
    fn is_complete(
        &self,
        batch: &OutgoingBatch,
        _row: &ChangeRow,
        _at_boundary: bool,
        channel: &ChannelConfig,
    ) -> bool {
        batch.data_event_count >= channel.max_batch_size
    }
}

/// Registry mapping algorithm tags to policies.
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<dyn BatchPolicy>>,
}

impl PolicyRegistry {
    /// Registry with the three built-in algorithms installed.
    pub fn new() -> Self {
        let mut registry = Self {
            policies: HashMap::new(),
        };
        registry.register("default", Arc::new(DefaultPolicy));
        registry.register("transactional", Arc::new(TransactionalPolicy));
        registry.register("nontransactional", Arc::new(NontransactionalPolicy));
        registry
    }

    pub fn register(&mut self, tag: &str, policy: Arc<dyn BatchPolicy>) {
        self.policies.insert(tag.to_string(), policy);
    }

    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn BatchPolicy>> {
        self.policies
            .get(tag)
            .cloned()
            .ok_or_else(|| RouterError::Config(format!("unknown batch algorithm '{tag}'")))
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a configured algorithm tag against the built-in set.
///
/// Config validation runs before custom policies can be registered, so
/// custom tags are validated at engine construction instead.
pub fn validate_algorithm(tag: &str) -> Result<()> {
    match tag {
        "default" | "transactional" | "nontransactional" => Ok(()),
        other => Err(RouterError::Config(format!(
            "unknown batch algorithm '{other}'"
        ))),
    }
}
