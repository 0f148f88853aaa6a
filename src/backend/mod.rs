// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend adapter contract.
//!
//! Every storage target (object store, remote filesystem, repository
//! host, archival network) is driven through the same six operations.
//! Concrete network clients live outside this crate; the engine only
//! assumes the semantics stated on each method. Push and delete are
//! idempotent: repeating either with the same arguments is a no-op
//! success.
//!
//! Adapters are constructed through [`AdapterRegistry`], keyed on the
//! backend's `kind` string, so configuration alone selects the
//! implementation.

pub mod memory;

pub use memory::InMemoryBackend;

use crate::hash::ContentHash;
use crate::pin::RemotePin;
use crate::policy::{PerformanceTier, PolicyLayer};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by a backend adapter.
///
/// The variant determines how the sync engine reacts: transient errors
/// are retried with backoff, per-object errors are recorded and the pass
/// continues, unavailability aborts the whole pass for that backend.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    /// The backend cannot be reached at all. Aborts the pass.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// Timeout, rate limit, or another condition worth retrying.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// The object does not exist on the backend.
    #[error("object {0} not found on backend")]
    NotFound(String),
    /// Non-retryable per-object failure (malformed metadata, rejected
    /// write, protocol error).
    #[error("permanent backend error: {0}")]
    Permanent(String),
    /// The write would exceed the backend's quota. Not a hard error;
    /// the engine applies the configured quota action.
    #[error("quota exceeded: used {used} of {quota} bytes")]
    QuotaExceeded { used: u64, quota: u64 },
    /// No factory registered for the configured backend kind.
    #[error("unknown backend kind '{0}'")]
    UnknownKind(String),
}

impl BackendError {
    /// Whether a retry within the same pass could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Outcome of a health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    #[must_use]
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self::Unhealthy {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy { reason } => write!(f, "unhealthy: {}", reason),
        }
    }
}

/// Usage and quota as reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageReport {
    pub used_bytes: u64,
    /// `None` means the backend reports no quota.
    pub quota_bytes: Option<u64>,
}

impl UsageReport {
    /// Fraction of quota in use, when a quota is declared.
    #[must_use]
    pub fn utilization(&self) -> Option<f64> {
        self.quota_bytes
            .filter(|q| *q > 0)
            .map(|q| self.used_bytes as f64 / q as f64)
    }

    #[must_use]
    pub fn over_quota(&self) -> bool {
        self.quota_bytes
            .map(|q| self.used_bytes > q)
            .unwrap_or(false)
    }
}

/// Operator-supplied configuration for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name referenced by buckets and dirty records.
    pub name: String,
    /// Adapter kind; selects the factory in the [`AdapterRegistry`].
    pub kind: String,
    /// Declared region, used by geographic distribution modes.
    #[serde(default)]
    pub region: Option<String>,
    /// Performance-tier label used by auto-tiering.
    #[serde(default = "default_tier")]
    pub tier: PerformanceTier,
    /// Backend-level policy override layer (highest precedence).
    #[serde(default)]
    pub policy: PolicyLayer,
    /// Opaque connection settings passed through to the adapter factory.
    #[serde(default)]
    pub connection: Value,
}

fn default_tier() -> PerformanceTier {
    PerformanceTier::Balanced
}

impl BackendConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            region: None,
            tier: PerformanceTier::Balanced,
            policy: PolicyLayer::default(),
            connection: Value::Null,
        }
    }

    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    #[must_use]
    pub fn with_tier(mut self, tier: PerformanceTier) -> Self {
        self.tier = tier;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: PolicyLayer) -> Self {
        self.policy = policy;
        self
    }
}

/// The six-operation contract every storage backend satisfies.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Configured backend name.
    fn name(&self) -> &str;

    /// Probe reachability. Never fabricates success: an unreachable
    /// backend reports `Unhealthy` and its sync pass is aborted.
    async fn health_check(&self) -> HealthStatus;

    /// List the objects the backend holds for a bucket.
    async fn list_pins(&self, bucket: &str) -> Result<Vec<RemotePin>, BackendError>;

    /// Upload an object. Idempotent: pushing bytes already present under
    /// the same hash succeeds without rewriting.
    async fn push(
        &self,
        hash: &ContentHash,
        bytes: &[u8],
        path: &str,
        metadata: &Value,
    ) -> Result<(), BackendError>;

    /// Download an object's bytes.
    async fn pull(&self, hash: &ContentHash) -> Result<Vec<u8>, BackendError>;

    /// Remove an object. Idempotent: deleting an absent hash succeeds.
    async fn delete(&self, hash: &ContentHash) -> Result<(), BackendError>;

    /// Current usage and quota.
    async fn usage(&self) -> Result<UsageReport, BackendError>;
}

/// Factory constructing an adapter from its configuration.
pub type AdapterFactory =
    Arc<dyn Fn(&BackendConfig) -> Result<Arc<dyn BackendAdapter>, BackendError> + Send + Sync>;

/// Registry mapping backend kind names to adapter factories.
///
/// Implementation selection happens here, at configuration time; nothing
/// downstream ever probes an adapter for its concrete type.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: DashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `memory` kind, used by tests and as a
    /// reference implementation.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("memory", |config: &BackendConfig| {
            Ok(Arc::new(InMemoryBackend::from_config(config)) as Arc<dyn BackendAdapter>)
        });
        registry
    }

    pub fn register<F>(&self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&BackendConfig) -> Result<Arc<dyn BackendAdapter>, BackendError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    /// Construct an adapter for the given configuration.
    pub fn create(&self, config: &BackendConfig) -> Result<Arc<dyn BackendAdapter>, BackendError> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| BackendError::UnknownKind(config.kind.clone()))?;
        factory(config)
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.iter().map(|r| r.key().clone()).collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_utilization() {
        let usage = UsageReport {
            used_bytes: 50,
            quota_bytes: Some(200),
        };
        assert_eq!(usage.utilization(), Some(0.25));
        assert!(!usage.over_quota());

        let over = UsageReport {
            used_bytes: 300,
            quota_bytes: Some(200),
        };
        assert!(over.over_quota());

        let unlimited = UsageReport {
            used_bytes: 300,
            quota_bytes: None,
        };
        assert_eq!(unlimited.utilization(), None);
        assert!(!unlimited.over_quota());
    }

    #[test]
    fn test_error_transience() {
        assert!(BackendError::Transient("timeout".into()).is_transient());
        assert!(!BackendError::Permanent("rejected".into()).is_transient());
        assert!(!BackendError::Unavailable("down".into()).is_transient());
    }

    #[test]
    fn test_registry_creates_builtin_memory_adapter() {
        let registry = AdapterRegistry::with_builtins();
        let adapter = registry
            .create(&BackendConfig::new("fast", "memory"))
            .unwrap();
        assert_eq!(adapter.name(), "fast");
        assert_eq!(registry.kinds(), vec!["memory"]);
    }

    #[test]
    fn test_registry_unknown_kind() {
        let registry = AdapterRegistry::new();
        let result = registry.create(&BackendConfig::new("x", "s3"));
        assert!(matches!(result, Err(BackendError::UnknownKind(_))));
    }

    #[test]
    fn test_backend_config_builders() {
        let config = BackendConfig::new("fast", "memory")
            .with_region("eu-west")
            .with_tier(PerformanceTier::SpeedOptimized);
        assert_eq!(config.region.as_deref(), Some("eu-west"));
        assert_eq!(config.tier, PerformanceTier::SpeedOptimized);
    }

    #[test]
    fn test_backend_config_serde_defaults() {
        let config: BackendConfig =
            serde_json::from_str(r#"{"name": "fast", "kind": "memory"}"#).unwrap();
        assert_eq!(config.tier, PerformanceTier::Balanced);
        assert!(config.region.is_none());
    }
}
