//! Worker registry
//!
//! Bookkeeping only: connection verification, resource discovery, and tunnel
//! lifecycle are driven by the coordinator context, which updates records
//! here. The registry owns the `localhost` invariant: the local worker is
//! created in the constructor, is always `Connected`, and cannot be removed.

use crate::types::{ComputeResource, ConnectionState, Credentials, WorkerRecord};
use crate::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the permanent local worker
pub const LOCALHOST: &str = "localhost";

/// Thread-safe worker registry
pub struct WorkerRegistry {
    workers: DashMap<String, WorkerRecord>,
}

impl WorkerRegistry {
    /// Create a registry holding the permanent `localhost` entry
    pub fn new() -> Self {
        let workers = DashMap::new();
        workers.insert(
            LOCALHOST.to_string(),
            WorkerRecord::new(LOCALHOST, Credentials::local()),
        );
        Self { workers }
    }

    /// Add a worker record, initially unverified.
    ///
    /// Re-adding an existing name replaces the record (last-write-wins) and
    /// returns true; the previous tunnel, if any, is the caller's to release.
    pub fn insert(&self, name: &str, credentials: Credentials) -> bool {
        let replaced = self
            .workers
            .insert(name.to_string(), WorkerRecord::new(name, credentials))
            .is_some();

        if replaced {
            warn!(worker = name, "Replacing existing worker record");
        } else {
            info!(worker = name, "Worker added to registry");
        }
        replaced
    }

    /// Remove a worker record; a no-op for `localhost`.
    ///
    /// Returns the removed record so the caller can release its tunnel.
    pub fn remove(&self, name: &str) -> Option<WorkerRecord> {
        if name == LOCALHOST {
            warn!("Refusing to remove the localhost worker");
            return None;
        }

        let removed = self.workers.remove(name).map(|(_, record)| record);
        if removed.is_some() {
            info!(worker = name, "Worker removed from registry");
        }
        removed
    }

    /// Worker names in deterministic partition order: `localhost` first,
    /// remaining workers sorted ascending by name.
    ///
    /// Batch partitioning iterates this order; changing it changes every
    /// shard assignment.
    pub fn list(&self) -> Vec<String> {
        let names = self.workers.iter().map(|e| e.key().clone()).collect();
        ordered(names)
    }

    /// Names of `Connected` workers, in the same order as `list`
    pub fn connected(&self) -> Vec<String> {
        let names = self
            .workers
            .iter()
            .filter(|e| e.value().state.is_connected())
            .map(|e| e.key().clone())
            .collect();
        ordered(names)
    }

    /// Fetch a worker record by name
    pub fn get(&self, name: &str) -> Option<WorkerRecord> {
        self.workers.get(name).map(|r| r.clone())
    }

    /// True if a worker with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// Number of registered workers, including `localhost`
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Always false: `localhost` is permanent
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Update a worker's connection state
    pub fn set_state(&self, name: &str, state: ConnectionState) -> Result<()> {
        let mut record = self.workers.get_mut(name).ok_or_else(|| Error::WorkerNotFound {
            name: name.to_string(),
        })?;

        record.state = state;
        if state == ConnectionState::Connected {
            record.last_verified = Some(Utc::now());
        }
        Ok(())
    }

    /// Replace a worker's resource list wholesale
    pub fn set_resources(&self, name: &str, resources: Vec<ComputeResource>) -> Result<()> {
        let mut record = self.workers.get_mut(name).ok_or_else(|| Error::WorkerNotFound {
            name: name.to_string(),
        })?;

        info!(
            worker = name,
            resource_count = resources.len(),
            "Worker resources updated"
        );
        record.resources = resources;
        Ok(())
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Partition order: `localhost` leads, everything else sorted by name
fn ordered(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    if let Some(pos) = names.iter().position(|n| n == LOCALHOST) {
        let local = names.remove(pos);
        names.insert(0, local);
    }
    names
}

/// Thread-safe handle to the worker registry
pub type WorkerRegistryHandle = Arc<WorkerRegistry>;
