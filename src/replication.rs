// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica placement and failover.
//!
//! Computes the target backend set for a bucket from effective policy:
//! preferred backends first, remaining candidates ordered by weight with
//! round-robin rotation between equal weights, filtered by geographic
//! mode. Tracks consecutive pass failures per backend to drive the
//! configured failover strategy.

use crate::backend::BackendConfig;
use crate::hash::ContentHash;
use crate::pin::Pin;
use crate::policy::{EffectivePolicy, FailoverStrategy, GeoMode, ReplicationStrategy};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Plans replica targets and reacts to backend failures.
#[derive(Default)]
pub struct ReplicationManager {
    /// Consecutive failed sync passes per backend.
    failures: DashMap<String, u32>,
    /// Rotation counter for round-robin between equal-weight backends.
    rotation: AtomicUsize,
}

impl ReplicationManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a backend is an eligible replica target under the policy's
    /// geographic mode.
    #[must_use]
    pub fn eligible(
        policy: &EffectivePolicy,
        backend: &BackendConfig,
        local_region: Option<&str>,
    ) -> bool {
        match policy.geo_mode {
            GeoMode::Global => true,
            GeoMode::Regional => backend.region.is_some(),
            // Region-less backends are treated as local.
            GeoMode::Local => match (&backend.region, local_region) {
                (None, _) => true,
                (Some(region), Some(local)) => region == local,
                (Some(_), None) => false,
            },
        }
    }

    /// Compute the target backend set for a bucket.
    ///
    /// `Mirror` targets every eligible backend. `Spread` selects from
    /// `preferred_backends` in order, then the remaining eligible
    /// backends by descending weight, until `min_replicas` is satisfied.
    #[must_use]
    pub fn plan_targets(
        &self,
        policy: &EffectivePolicy,
        backends: &[BackendConfig],
        local_region: Option<&str>,
    ) -> Vec<String> {
        let eligible: Vec<&BackendConfig> = backends
            .iter()
            .filter(|b| Self::eligible(policy, b, local_region))
            .collect();

        if policy.replication == ReplicationStrategy::Mirror {
            return eligible.iter().map(|b| b.name.clone()).collect();
        }

        let mut ordered: Vec<String> = policy
            .preferred_backends
            .iter()
            .filter(|name| eligible.iter().any(|b| &b.name == *name))
            .cloned()
            .collect();

        let mut remaining: Vec<&BackendConfig> = eligible
            .iter()
            .filter(|b| !ordered.contains(&b.name))
            .copied()
            .collect();
        remaining.sort_by(|a, b| {
            policy
                .weight_of(&b.name)
                .cmp(&policy.weight_of(&a.name))
                .then_with(|| a.name.cmp(&b.name))
        });
        self.rotate_equal_weights(policy, &mut remaining);
        ordered.extend(remaining.into_iter().map(|b| b.name.clone()));

        let mut want = policy.min_replicas as usize;
        if let Some(max) = policy.max_replicas {
            want = want.min(max as usize);
        }
        ordered.truncate(want);
        debug!(targets = ?ordered, "Planned replica targets");
        ordered
    }

    /// Rotate runs of equal-weight backends so ties spread load instead
    /// of always favoring the lexicographically first name.
    fn rotate_equal_weights(&self, policy: &EffectivePolicy, backends: &mut [&BackendConfig]) {
        let shift = self.rotation.fetch_add(1, Ordering::Relaxed);
        let mut start = 0;
        while start < backends.len() {
            let weight = policy.weight_of(&backends[start].name);
            let mut end = start + 1;
            while end < backends.len() && policy.weight_of(&backends[end].name) == weight {
                end += 1;
            }
            let run = &mut backends[start..end];
            if run.len() > 1 {
                run.rotate_left(shift % run.len());
            }
            start = end;
        }
    }

    /// Pick a substitute target after a backend failed: the first
    /// eligible backend not already targeted and not the failed one.
    #[must_use]
    pub fn substitute(
        &self,
        policy: &EffectivePolicy,
        backends: &[BackendConfig],
        failed: &str,
        current_targets: &[String],
        local_region: Option<&str>,
    ) -> Option<String> {
        let mut widened = policy.clone();
        // Widen the plan by one slot so an unused backend surfaces.
        widened.min_replicas = widened.min_replicas.saturating_add(1);
        widened.max_replicas = widened.max_replicas.map(|m| m.saturating_add(1));
        self.plan_targets(&widened, backends, local_region)
            .into_iter()
            .find(|name| name != failed && !current_targets.contains(name))
    }

    /// Record a failed pass; returns the consecutive failure count.
    pub fn record_failure(&self, backend: &str) -> u32 {
        let mut entry = self.failures.entry(backend.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Reset a backend's consecutive failure count after a healthy pass.
    pub fn record_success(&self, backend: &str) {
        self.failures.remove(backend);
    }

    #[must_use]
    pub fn consecutive_failures(&self, backend: &str) -> u32 {
        self.failures.get(backend).map(|r| *r).unwrap_or(0)
    }

    /// Whether the configured strategy calls for automatic failover now.
    #[must_use]
    pub fn should_failover(&self, strategy: FailoverStrategy, backend: &str) -> bool {
        let count = self.consecutive_failures(backend);
        match strategy {
            FailoverStrategy::Immediate => count >= 1,
            FailoverStrategy::Delayed { cycles } => count >= cycles,
            FailoverStrategy::Manual => false,
        }
    }
}

/// Hashes of pins currently holding fewer replicas than the floor. A
/// transient deficit is a monitored condition, not an index error.
#[must_use]
pub fn deficits<'a>(pins: impl IntoIterator<Item = &'a Pin>, min_replicas: u32) -> Vec<ContentHash> {
    pins.into_iter()
        .filter(|p| p.is_active() && p.replica_count() < min_replicas as usize)
        .map(|p| p.hash)
        .collect()
}
