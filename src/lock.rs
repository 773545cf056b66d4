// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster lock guarding routing.
//!
//! At most one engine routes a given change store at a time. The engine
//! takes the named lock before a routing run and releases it afterwards; a
//! run that fails to acquire simply skips, it never blocks.
//!
//! [`ProcessLock`] covers engines sharing one process. Multi-process
//! deployments supply their own [`ClusterLock`] over whatever coordination
//! substrate they already run.

use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

/// Named, non-blocking mutual exclusion.
pub trait ClusterLock: Send + Sync {
    /// Try to take the named lock. `false` means another holder has it.
    fn try_lock(&self, name: &str) -> bool;

    /// Release a lock taken by [`try_lock`](Self::try_lock).
    fn unlock(&self, name: &str);
}

/// In-process lock over a set of held names.
#[derive(Default)]
pub struct ProcessLock {
    held: Mutex<HashSet<String>>,
}

impl ProcessLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClusterLock for ProcessLock {
    fn try_lock(&self, name: &str) -> bool {
        let mut held = self.held.lock().expect("lock set poisoned");
        let acquired = held.insert(name.to_string());
        debug!(lock = name, acquired, "Cluster lock attempt");
        acquired
    }

    fn unlock(&self, name: &str) {
        let mut held = self.held.lock().expect("lock set poisoned");
        held.remove(name);
    }
}
