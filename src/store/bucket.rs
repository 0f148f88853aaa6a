//! Bucket registry.
//!
//! A bucket is a named collection of pins forming one virtual filesystem.
//! Buckets declare which backends replicate them and may carry a policy
//! override layer sitting between the global default and any per-backend
//! override.

use super::state::StateStore;
use super::StoreError;
use crate::policy::PolicyLayer;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Structural mode of a bucket's virtual filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketLayout {
    /// Paths are opaque keys.
    Flat,
    /// Paths form a directory tree.
    Hierarchical,
    /// Paths may alias shared content (dedup links).
    Graph,
}

/// Named collection of pins forming one virtual filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    /// Free-form type tag (e.g. "documents", "artifacts").
    pub kind: String,
    pub layout: BucketLayout,
    #[serde(default)]
    pub metadata: Value,
    /// Bucket-level policy override layer.
    #[serde(default)]
    pub policy: PolicyLayer,
    /// Backends configured to replicate this bucket.
    #[serde(default)]
    pub backends: Vec<String>,
}

impl Bucket {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>, layout: BucketLayout) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            layout,
            metadata: Value::Null,
            policy: PolicyLayer::default(),
            backends: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_backends(mut self, backends: Vec<String>) -> Self {
        self.backends = backends;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: PolicyLayer) -> Self {
        self.policy = policy;
        self
    }
}

/// Concurrent registry of configured buckets, persisted through the
/// state store.
pub struct BucketRegistry {
    buckets: DashMap<String, Bucket>,
    state: Arc<StateStore>,
}

impl BucketRegistry {
    #[must_use]
    pub fn new(state: Arc<StateStore>) -> Self {
        Self {
            buckets: DashMap::new(),
            state,
        }
    }

    /// Load persisted buckets. Called once at startup.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let buckets = self.state.load_buckets().await?;
        let count = buckets.len();
        for bucket in buckets {
            self.buckets.insert(bucket.name.clone(), bucket);
        }
        Ok(count)
    }

    /// Register a new bucket. Fails if the name is taken.
    pub async fn create(&self, bucket: Bucket) -> Result<(), StoreError> {
        if self.buckets.contains_key(&bucket.name) {
            return Err(StoreError::BucketExists(bucket.name));
        }
        self.state.upsert_bucket(&bucket).await?;
        info!(bucket = %bucket.name, backends = ?bucket.backends, "Bucket created");
        self.buckets.insert(bucket.name.clone(), bucket);
        Ok(())
    }

    /// Replace an existing bucket's configuration (policy, backends).
    pub async fn update(&self, bucket: Bucket) -> Result<(), StoreError> {
        if !self.buckets.contains_key(&bucket.name) {
            return Err(StoreError::BucketNotFound(bucket.name));
        }
        self.state.upsert_bucket(&bucket).await?;
        self.buckets.insert(bucket.name.clone(), bucket);
        Ok(())
    }

    /// Remove a bucket record. Emptiness is the content store's concern;
    /// see `ContentStore::delete_bucket`.
    pub(crate) async fn remove(&self, name: &str) -> Result<(), StoreError> {
        self.state.delete_bucket(name).await?;
        self.buckets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::BucketNotFound(name.to_string()))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Bucket> {
        self.buckets.get(name).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    #[must_use]
    pub fn list(&self) -> Vec<Bucket> {
        self.buckets.iter().map(|r| r.value().clone()).collect()
    }

    /// Names of buckets that replicate to the given backend.
    #[must_use]
    pub fn buckets_for_backend(&self, backend: &str) -> Vec<String> {
        self.buckets
            .iter()
            .filter(|r| r.value().backends.iter().any(|b| b == backend))
            .map(|r| r.key().clone())
            .collect()
    }

    /// All backend names referenced by any bucket.
    #[must_use]
    pub fn referenced_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .buckets
            .iter()
            .flat_map(|r| r.value().backends.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
