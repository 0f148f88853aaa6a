// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Policy layers and the effective-policy resolver.
//!
//! Configuration arrives in three layers: a global default, an optional
//! per-bucket override, and an optional per-backend override. The resolver
//! merges them field-by-field with strict precedence
//! (backend > bucket > global) and is a pure function: no I/O, cheap
//! enough to re-run on every sync pass.
//!
//! # Example
//!
//! ```
//! use pinsync::policy::{PolicyLayer, resolve};
//!
//! let global = PolicyLayer { min_replicas: Some(2), ..Default::default() };
//! let bucket = PolicyLayer { min_replicas: Some(3), ..Default::default() };
//!
//! let effective = resolve(&global, Some(&bucket), None).unwrap();
//! assert_eq!(effective.min_replicas, 3); // bucket wins over global
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// How replicas are spread across configured backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStrategy {
    /// Place replicas on preferred backends until `min_replicas` is met.
    Spread,
    /// Replicate to every configured backend for the bucket.
    Mirror,
}

/// Cache eviction policy for a backend under quota pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    Lru,
    Lfu,
    Fifo,
    Mru,
    /// Hybrid recency + frequency score; evicts the lowest-scored pins.
    Adaptive,
    /// Defer to per-tier assignment (hot/warm/cold) instead of scoring.
    Tiered,
}

/// Performance-tier label for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTier {
    SpeedOptimized,
    Balanced,
    PersistenceOptimized,
}

impl std::fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpeedOptimized => write!(f, "speed_optimized"),
            Self::Balanced => write!(f, "balanced"),
            Self::PersistenceOptimized => write!(f, "persistence_optimized"),
        }
    }
}

/// Geographic distribution mode. Filters which backends are eligible
/// replica targets by their declared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoMode {
    /// Only backends whose declared region matches the engine's local region.
    Local,
    /// Only backends that declare a region at all.
    Regional,
    /// All configured backends.
    Global,
}

/// Reaction to a backend failing during a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum FailoverStrategy {
    /// Recompute target sets excluding the failed backend and mark a
    /// substitute dirty now.
    Immediate,
    /// Wait `cycles` consecutive failed passes before failing over.
    Delayed { cycles: u32 },
    /// Only report; take no automatic action.
    Manual,
}

/// What to do when a backend exceeds its quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaAction {
    /// Surface a warning in the sync result, take no action.
    Warn,
    /// Evict per the cache policy, respecting the replica floor.
    Evict,
    /// Stop planning new pushes to the backend until usage drops.
    RejectWrites,
}

/// One layer of policy configuration. Every field is optional; unset
/// fields fall through to the next layer down.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_policy: Option<CachePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_max_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_tier: Option<PerformanceTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_tier: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_backends: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_weights: Option<BTreeMap<String, u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_mode: Option<GeoMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover: Option<FailoverStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_action: Option<QuotaAction>,
}

/// Fully merged configuration for one (bucket, backend) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub replication: ReplicationStrategy,
    pub min_replicas: u32,
    /// `None` means unbounded.
    pub max_replicas: Option<u32>,
    pub cache_policy: CachePolicy,
    pub cache_max_bytes: Option<u64>,
    pub performance_tier: PerformanceTier,
    pub auto_tier: bool,
    pub preferred_backends: Vec<String>,
    pub backend_weights: BTreeMap<String, u32>,
    pub geo_mode: GeoMode,
    pub failover: FailoverStrategy,
    pub quota_action: QuotaAction,
}

impl Default for EffectivePolicy {
    fn default() -> Self {
        Self {
            replication: ReplicationStrategy::Spread,
            min_replicas: 1,
            max_replicas: None,
            cache_policy: CachePolicy::Adaptive,
            cache_max_bytes: None,
            performance_tier: PerformanceTier::Balanced,
            auto_tier: false,
            preferred_backends: Vec::new(),
            backend_weights: BTreeMap::new(),
            geo_mode: GeoMode::Global,
            failover: FailoverStrategy::Immediate,
            quota_action: QuotaAction::Warn,
        }
    }
}

impl EffectivePolicy {
    /// Weight of a backend for tie-breaking. Unlisted backends weigh 1.
    #[must_use]
    pub fn weight_of(&self, backend: &str) -> u32 {
        self.backend_weights.get(backend).copied().unwrap_or(1)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    /// Merged bounds conflict. Raised to the caller, never silently clamped.
    #[error("conflicting replica bounds after merge: min_replicas={min} > max_replicas={max}")]
    ReplicaBounds { min: u32, max: u32 },
}

/// Merge the three policy layers with strict precedence:
/// backend-level > bucket-level > global default > built-in default.
///
/// Pure function. Returns [`PolicyError::ReplicaBounds`] when the merged
/// `min_replicas` exceeds the merged `max_replicas`.
pub fn resolve(
    global: &PolicyLayer,
    bucket: Option<&PolicyLayer>,
    backend: Option<&PolicyLayer>,
) -> Result<EffectivePolicy, PolicyError> {
    fn pick<T: Clone>(
        backend: Option<&Option<T>>,
        bucket: Option<&Option<T>>,
        global: &Option<T>,
    ) -> Option<T> {
        backend
            .and_then(|o| o.clone())
            .or_else(|| bucket.and_then(|o| o.clone()))
            .or_else(|| global.clone())
    }

    macro_rules! merged {
        ($field:ident) => {
            pick(
                backend.map(|l| &l.$field),
                bucket.map(|l| &l.$field),
                &global.$field,
            )
        };
    }

    let defaults = EffectivePolicy::default();

    let min_replicas = merged!(min_replicas).unwrap_or(defaults.min_replicas);
    let max_replicas = merged!(max_replicas);

    if let Some(max) = max_replicas {
        if min_replicas > max {
            return Err(PolicyError::ReplicaBounds {
                min: min_replicas,
                max,
            });
        }
    }

    Ok(EffectivePolicy {
        replication: merged!(replication).unwrap_or(defaults.replication),
        min_replicas,
        max_replicas,
        cache_policy: merged!(cache_policy).unwrap_or(defaults.cache_policy),
        cache_max_bytes: merged!(cache_max_bytes),
        performance_tier: merged!(performance_tier).unwrap_or(defaults.performance_tier),
        auto_tier: merged!(auto_tier).unwrap_or(defaults.auto_tier),
        preferred_backends: merged!(preferred_backends).unwrap_or_default(),
        backend_weights: merged!(backend_weights).unwrap_or_default(),
        geo_mode: merged!(geo_mode).unwrap_or(defaults.geo_mode),
        failover: merged!(failover).unwrap_or(defaults.failover),
        quota_action: merged!(quota_action).unwrap_or(defaults.quota_action),
    })
}
