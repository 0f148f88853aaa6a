//! In-memory backend adapter.
//!
//! Reference implementation of the adapter contract, used by unit and
//! integration tests and as the template for writing real adapters.
//! Objects are namespaced by key prefix: the engine pushes with keys of
//! the form `bucket/path`, and `list_pins` filters on that prefix.

use super::{BackendAdapter, BackendConfig, BackendError, HealthStatus, UsageReport};
use crate::hash::ContentHash;
use crate::pin::RemotePin;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    path: String,
    #[allow(dead_code)]
    metadata: Value,
}

/// Adapter holding all objects in process memory.
pub struct InMemoryBackend {
    name: String,
    objects: DashMap<ContentHash, StoredObject>,
    quota_bytes: Option<u64>,
    /// `Some(reason)` makes health checks report unhealthy.
    unhealthy: Mutex<Option<String>>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: DashMap::new(),
            quota_bytes: None,
            unhealthy: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// Build from a backend configuration. Recognizes an optional
    /// `quota_bytes` connection setting.
    #[must_use]
    pub fn from_config(config: &BackendConfig) -> Self {
        let quota = config
            .connection
            .get("quota_bytes")
            .and_then(Value::as_u64);
        Self {
            name: config.name.clone(),
            objects: DashMap::new(),
            quota_bytes: quota,
            unhealthy: Mutex::new(None),
        }
    }

    /// Force subsequent health checks to fail (test hook).
    pub fn set_unhealthy(&self, reason: impl Into<String>) {
        *self.unhealthy.lock() = Some(reason.into());
    }

    /// Restore healthy status.
    pub fn set_healthy(&self) {
        *self.unhealthy.lock() = None;
    }

    #[must_use]
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.objects.contains_key(hash)
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.objects.iter().map(|r| r.value().bytes.len() as u64).sum()
    }

    fn ensure_healthy(&self) -> Result<(), BackendError> {
        match self.unhealthy.lock().as_ref() {
            Some(reason) => Err(BackendError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackendAdapter for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> HealthStatus {
        match self.unhealthy.lock().as_ref() {
            Some(reason) => HealthStatus::unhealthy(reason.clone()),
            None => HealthStatus::Healthy,
        }
    }

    async fn list_pins(&self, bucket: &str) -> Result<Vec<RemotePin>, BackendError> {
        self.ensure_healthy()?;
        let prefix = format!("{}/", bucket);
        Ok(self
            .objects
            .iter()
            .filter(|r| r.value().path.starts_with(&prefix))
            .map(|r| RemotePin {
                hash: *r.key(),
                path: r.value().path.clone(),
                size: r.value().bytes.len() as u64,
            })
            .collect())
    }

    async fn push(
        &self,
        hash: &ContentHash,
        bytes: &[u8],
        path: &str,
        metadata: &Value,
    ) -> Result<(), BackendError> {
        self.ensure_healthy()?;
        // Idempotent: same hash already stored is a no-op success.
        if self.objects.contains_key(hash) {
            return Ok(());
        }
        if let Some(quota) = self.quota_bytes {
            let used = self.used_bytes();
            if used + bytes.len() as u64 > quota {
                return Err(BackendError::QuotaExceeded { used, quota });
            }
        }
        self.objects.insert(
            *hash,
            StoredObject {
                bytes: bytes.to_vec(),
                path: path.to_string(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn pull(&self, hash: &ContentHash) -> Result<Vec<u8>, BackendError> {
        self.ensure_healthy()?;
        self.objects
            .get(hash)
            .map(|r| r.value().bytes.clone())
            .ok_or_else(|| BackendError::NotFound(hash.to_string()))
    }

    async fn delete(&self, hash: &ContentHash) -> Result<(), BackendError> {
        self.ensure_healthy()?;
        // Idempotent: deleting an absent hash succeeds.
        self.objects.remove(hash);
        Ok(())
    }

    async fn usage(&self) -> Result<UsageReport, BackendError> {
        self.ensure_healthy()?;
        Ok(UsageReport {
            used_bytes: self.used_bytes(),
            quota_bytes: self.quota_bytes,
        })
    }
}
