// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Authoritative pin table and the single mutation entry point.
//!
//! Every local mutation flows through [`ContentStore::put`] or
//! [`ContentStore::remove`]; both write through to the durable state
//! layer and then mark every backend configured for the affected bucket
//! dirty. Replica-set membership is mutated through CAS-style entry
//! updates so concurrent sync passes for different backends cannot lose
//! each other's updates.

use super::bucket::BucketRegistry;
use super::state::StateStore;
use super::vfs::{VfsEntry, VfsIndex};
use super::StoreError;
use crate::dirty::DirtyTracker;
use crate::hash::ContentHash;
use crate::pin::{Pin, PinStatus};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Authoritative table of pins plus the VFS index derived from it.
pub struct ContentStore {
    pins: DashMap<ContentHash, Pin>,
    vfs: VfsIndex,
    buckets: Arc<BucketRegistry>,
    dirty: Arc<DirtyTracker>,
    state: Arc<StateStore>,
}

impl ContentStore {
    #[must_use]
    pub fn new(
        state: Arc<StateStore>,
        buckets: Arc<BucketRegistry>,
        dirty: Arc<DirtyTracker>,
    ) -> Self {
        Self {
            pins: DashMap::new(),
            vfs: VfsIndex::new(),
            buckets,
            dirty,
            state,
        }
    }

    /// Load persisted pins and path bindings. Called once at startup.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let pins = self.state.load_pins().await?;
        let count = pins.len();
        for pin in pins {
            self.pins.insert(pin.hash, pin);
        }
        for (bucket, path, hash, size) in self.state.load_paths().await? {
            self.vfs.bind(&bucket, &path, hash, size);
        }
        info!(pins = count, "Content store loaded");
        Ok(count)
    }

    /// Ingest or re-bind content. The digest is computed by the ingest
    /// layer; this records the pin, binds the VFS path, and marks every
    /// backend configured for the bucket dirty.
    ///
    /// Idempotent: a second put with identical bucket, path, and hash
    /// returns the existing pin without mutating anything.
    pub async fn put(
        &self,
        bucket: &str,
        path: &str,
        hash: ContentHash,
        size: u64,
        metadata: Value,
    ) -> Result<Pin, StoreError> {
        let bucket_config = self
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;

        if let Some(existing) = self.vfs.resolve(bucket, path) {
            if existing.hash == hash {
                if let Some(pin) = self.pins.get(&hash).map(|r| r.value().clone()) {
                    if pin.is_active() {
                        debug!(bucket, path, hash = %hash, "Idempotent put");
                        return Ok(pin);
                    }
                }
            }
        }

        let previous = self.vfs.bind(bucket, path, hash, size);
        self.state.bind_path(bucket, path, &hash, size).await?;

        // An overwritten binding can leave the old content with no paths;
        // such pins stay active and show up in `orphans()`.
        if let Some(old) = previous {
            if old.hash != hash && self.vfs.ref_count(&old.hash) == 0 {
                warn!(bucket, path, old = %old.hash, "Binding overwrite orphaned content");
            }
        }

        let pin = match self.pins.get(&hash).map(|r| r.value().clone()) {
            // Deduplicating put: the content already has a pin, the new
            // path lives only in the VFS index. A tombstoned pin is
            // resurrected: the binding makes it wanted again.
            Some(existing) => {
                if !existing.is_active() {
                    self.set_status(&hash, PinStatus::Active).await?;
                    debug!(hash = %hash, "Tombstoned pin resurrected by put");
                    self.get(&hash).ok_or(StoreError::PinNotFound(hash.to_string()))?
                } else {
                    existing
                }
            }
            None => {
                let pin = Pin::new(
                    hash,
                    bucket.to_string(),
                    path.to_string(),
                    size,
                    metadata,
                );
                self.state.upsert_pin(&pin).await?;
                self.pins.insert(hash, pin.clone());
                pin
            }
        };

        let reason = format!("put {}:{}", bucket, path);
        for backend in &bucket_config.backends {
            self.dirty.mark_dirty(backend, &reason).await?;
        }
        debug!(bucket, path, hash = %hash, "Pin recorded");
        Ok(pin)
    }

    /// Unbind a path. When this was the content's last path, the pin is
    /// tombstoned so the next sync pass deletes backend replicas before
    /// garbage collection.
    pub async fn remove(&self, bucket: &str, path: &str) -> Result<(), StoreError> {
        let bucket_config = self
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;

        let entry = self
            .vfs
            .unbind(bucket, path)
            .ok_or_else(|| StoreError::PathNotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            })?;
        self.state.unbind_path(bucket, path).await?;

        if self.vfs.ref_count(&entry.hash) == 0 {
            self.set_status(&entry.hash, PinStatus::Removed).await?;
            debug!(hash = %entry.hash, "Pin tombstoned");
        }

        let reason = format!("remove {}:{}", bucket, path);
        for backend in &bucket_config.backends {
            self.dirty.mark_dirty(backend, &reason).await?;
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, hash: &ContentHash) -> Option<Pin> {
        self.pins.get(hash).map(|r| r.value().clone())
    }

    /// All pins referenced from a bucket's VFS, deduplicated by hash.
    #[must_use]
    pub fn list_by_bucket(&self, bucket: &str) -> Vec<Pin> {
        let mut seen = BTreeSet::new();
        self.vfs
            .list(bucket)
            .into_iter()
            .filter(|(_, entry)| seen.insert(entry.hash))
            .filter_map(|(_, entry)| self.get(&entry.hash))
            .collect()
    }

    /// Reverse lookup: every (bucket, path) bound to a hash.
    #[must_use]
    pub fn find_by_hash(&self, hash: &ContentHash) -> Vec<(String, String)> {
        self.vfs.paths_for(hash)
    }

    /// Active pins with no remaining path bindings (overwritten content
    /// that was never explicitly removed).
    #[must_use]
    pub fn orphans(&self) -> Vec<Pin> {
        self.pins
            .iter()
            .filter(|r| r.value().is_active() && self.vfs.ref_count(r.key()) == 0)
            .map(|r| r.value().clone())
            .collect()
    }

    #[must_use]
    pub fn resolve(&self, bucket: &str, path: &str) -> Option<VfsEntry> {
        self.vfs.resolve(bucket, path)
    }

    #[must_use]
    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    /// Snapshot of the full pin table, tombstoned pins included. Sync
    /// passes diff against this instead of holding table locks.
    #[must_use]
    pub fn index_snapshot(&self) -> std::collections::HashMap<ContentHash, Pin> {
        self.pins
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect()
    }

    /// Active pins currently holding a replica on the given backend.
    #[must_use]
    pub fn pins_on_backend(&self, backend: &str) -> Vec<Pin> {
        self.pins
            .iter()
            .filter(|r| r.value().is_active() && r.value().has_replica_on(backend))
            .map(|r| r.value().clone())
            .collect()
    }

    /// Record a verified replica. Entry-level update so concurrent passes
    /// for different backends cannot lose each other's membership writes.
    pub async fn add_replica(&self, hash: &ContentHash, backend: &str) -> Result<(), StoreError> {
        let pin = {
            let mut entry = self
                .pins
                .get_mut(hash)
                .ok_or_else(|| StoreError::PinNotFound(hash.to_string()))?;
            entry.backend_set.insert(backend.to_string());
            entry.clone()
        };
        self.state.upsert_pin(&pin).await?;
        Ok(())
    }

    /// Drop a backend from a pin's replica set (delete confirmed, or the
    /// replica failed digest verification).
    pub async fn remove_replica(
        &self,
        hash: &ContentHash,
        backend: &str,
    ) -> Result<(), StoreError> {
        let pin = {
            let mut entry = self
                .pins
                .get_mut(hash)
                .ok_or_else(|| StoreError::PinNotFound(hash.to_string()))?;
            entry.backend_set.remove(backend);
            entry.clone()
        };
        self.state.upsert_pin(&pin).await?;
        Ok(())
    }

    pub async fn set_status(
        &self,
        hash: &ContentHash,
        status: PinStatus,
    ) -> Result<(), StoreError> {
        let pin = {
            let mut entry = self
                .pins
                .get_mut(hash)
                .ok_or_else(|| StoreError::PinNotFound(hash.to_string()))?;
            entry.status = status;
            entry.clone()
        };
        self.state.upsert_pin(&pin).await?;
        Ok(())
    }

    /// Garbage-collect tombstoned pins whose replica set is empty, i.e.
    /// every backend has confirmed the delete. Returns the collected
    /// hashes so callers can drop ancillary state (access statistics).
    pub async fn collect_garbage(&self) -> Result<Vec<ContentHash>, StoreError> {
        let collectable: Vec<ContentHash> = self
            .pins
            .iter()
            .filter(|r| r.value().is_tombstoned() && r.value().backend_set.is_empty())
            .map(|r| *r.key())
            .collect();

        for hash in &collectable {
            self.state.delete_pin(hash).await?;
            self.pins.remove(hash);
        }
        if !collectable.is_empty() {
            info!(collected = collectable.len(), "Garbage collected tombstoned pins");
        }
        Ok(collectable)
    }

    /// Delete a bucket. Without `cascade`, a non-empty bucket is an
    /// error; with it, every path is removed (tombstoning content whose
    /// last binding goes away) before the bucket record is dropped.
    pub async fn delete_bucket(&self, name: &str, cascade: bool) -> Result<(), StoreError> {
        if !self.buckets.contains(name) {
            return Err(StoreError::BucketNotFound(name.to_string()));
        }
        let bound = self.vfs.bucket_len(name);
        if bound > 0 {
            if !cascade {
                return Err(StoreError::BucketNotEmpty(name.to_string()));
            }
            let paths: Vec<String> = self.vfs.list(name).into_iter().map(|(p, _)| p).collect();
            for path in paths {
                self.remove(name, &path).await?;
            }
        }
        self.buckets.remove(name).await?;
        self.state.clear_bucket_paths(name).await?;
        Ok(())
    }
}
