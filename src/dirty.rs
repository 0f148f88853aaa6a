// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable per-backend dirty-state tracking.
//!
//! A backend is dirty when some local mutation may have invalidated its
//! replica set. The flag is written through to the state store before the
//! in-memory view is updated, so a crash between mutation and sync cannot
//! lose the obligation.
//!
//! Clearing is a compare-and-set against the record's mark timestamp: a
//! sync pass passes its own start time, and a `mark_dirty` that landed
//! after that start time makes the clear a no-op. The SQL row is the
//! authority; the in-memory map mirrors it for cheap reads.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use pinsync::store::StateStore;
//! # use pinsync::dirty::DirtyTracker;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let state = Arc::new(StateStore::in_memory().await?);
//! let tracker = DirtyTracker::new(state);
//!
//! tracker.mark_dirty("fast", "put docs:/a.txt").await?;
//! assert!(tracker.is_dirty("fast"));
//! # Ok(())
//! # }
//! ```

use crate::pin::now_millis;
use crate::store::{StateStore, StoreError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// One backend's persisted dirty record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirtyRecord {
    pub backend: String,
    pub dirty: bool,
    /// Human-readable cause of the most recent mark.
    pub reason: String,
    /// Epoch millis of the most recent mark.
    pub marked_at: i64,
}

/// Durable per-backend dirty flags with CAS-style clearing.
pub struct DirtyTracker {
    records: DashMap<String, DirtyRecord>,
    state: Arc<StateStore>,
}

impl DirtyTracker {
    #[must_use]
    pub fn new(state: Arc<StateStore>) -> Self {
        Self {
            records: DashMap::new(),
            state,
        }
    }

    /// Load persisted dirty records. Called once at startup; returns the
    /// number of backends that are dirty and need a sync pass.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let records = self.state.load_dirty().await?;
        let mut pending = 0;
        for record in records {
            if record.dirty {
                pending += 1;
            }
            self.records.insert(record.backend.clone(), record);
        }
        if pending > 0 {
            info!(pending, "Restored dirty backends from state store");
        }
        Ok(pending)
    }

    /// Mark a backend dirty. Persists before updating the in-memory view.
    pub async fn mark_dirty(&self, backend: &str, reason: &str) -> Result<(), StoreError> {
        let record = DirtyRecord {
            backend: backend.to_string(),
            dirty: true,
            reason: reason.to_string(),
            marked_at: now_millis(),
        };
        self.state.write_dirty(&record).await?;
        debug!(backend, reason, "Backend marked dirty");
        self.records.insert(backend.to_string(), record);
        Ok(())
    }

    /// Conditionally clear a backend's dirty flag.
    ///
    /// `since` is the sync pass's start time. Returns `false` (and leaves
    /// the backend dirty) when a newer mark exists, so a mutation that
    /// raced the in-flight pass keeps its sync obligation.
    pub async fn clear(&self, backend: &str, since: i64) -> Result<bool, StoreError> {
        let cleared = self.state.clear_dirty_if(backend, since).await?;
        if cleared {
            if let Some(mut record) = self.records.get_mut(backend) {
                // Mirror the SQL guard: only flip records the CAS covered.
                if record.marked_at <= since {
                    record.dirty = false;
                }
            }
            debug!(backend, "Dirty flag cleared");
        } else {
            debug!(backend, since, "Dirty clear rejected");
        }
        Ok(cleared)
    }

    #[must_use]
    pub fn is_dirty(&self, backend: &str) -> bool {
        self.records
            .get(backend)
            .map(|r| r.dirty)
            .unwrap_or(false)
    }

    /// Names of all currently dirty backends.
    #[must_use]
    pub fn list_dirty(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.value().dirty)
            .map(|r| r.key().clone())
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn record(&self, backend: &str) -> Option<DirtyRecord> {
        self.records.get(backend).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.records.iter().filter(|r| r.value().dirty).count()
    }
}
