// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Access tracking, eviction planning, and auto-tiering.
//!
//! Access statistics are kept independently of the content store. The
//! planner never mutates anything itself: it produces eviction lists and
//! tier-move plans the sync engine executes through backend adapters.
//!
//! Replica floor: a pin is only ever an eviction or demotion candidate
//! when at least one other replica exists and removing this one keeps
//! the pin at or above its `min_replicas`. Under quota pressure with no
//! candidates, the quota violation is surfaced as a warning instead.

use crate::backend::{BackendConfig, UsageReport};
use crate::hash::ContentHash;
use crate::pin::{now_millis, Pin};
use crate::policy::{CachePolicy, EffectivePolicy, PerformanceTier};
use dashmap::DashMap;
use tracing::debug;

/// Per-pin access statistics.
#[derive(Debug, Clone, Copy)]
pub struct AccessStats {
    /// Epoch millis of the most recent access.
    pub last_access: i64,
    pub access_count: u64,
}

/// Scoring parameters for the adaptive eviction policy.
///
/// The score combines recency (exponential decay), frequency
/// (log-normalized access count), and size; quota pressure scales the
/// result down along a tan curve so scores collapse toward zero as a
/// backend approaches its quota.
#[derive(Debug, Clone)]
pub struct AdaptiveScorer {
    /// Half-life for recency decay, in seconds.
    pub recency_half_life: f64,
    /// Access count at which frequency saturates.
    pub max_access_count: u64,
    /// Baseline object size for size scoring, in bytes.
    pub baseline_size_bytes: u64,
    /// Component weights: (recency, frequency, size).
    pub weights: (f64, f64, f64),
    /// Utilization where pressure starts biting.
    pub pressure_center: f64,
    /// Utilization where every score collapses to zero.
    pub pressure_critical: f64,
}

impl Default for AdaptiveScorer {
    fn default() -> Self {
        Self {
            recency_half_life: 3600.0,
            max_access_count: 1000,
            baseline_size_bytes: 1024 * 1024,
            weights: (0.4, 0.4, 0.2),
            pressure_center: 0.75,
            pressure_critical: 0.95,
        }
    }
}

impl AdaptiveScorer {
    /// Score a pin: 0.0 = evict first, 1.0 = keep.
    #[must_use]
    pub fn score(&self, pin: &Pin, stats: &AccessStats, utilization: f64, now: i64) -> f64 {
        let idle_secs = ((now - stats.last_access).max(0) as f64) / 1000.0;
        let recency = (-idle_secs / self.recency_half_life).exp();

        let frequency = if stats.access_count == 0 {
            0.0
        } else {
            let count = stats.access_count.min(self.max_access_count) as f64;
            (1.0 + count).ln() / (1.0 + self.max_access_count as f64).ln()
        };

        let relative_size = pin.size as f64 / self.baseline_size_bytes as f64;
        let size_score = 1.0 / (1.0 + relative_size);

        let base = recency * self.weights.0 + frequency * self.weights.1 + size_score * self.weights.2;
        (base * self.pressure_multiplier(utilization)).clamp(0.0, 1.0)
    }

    /// Smooth multiplier: 1.0 below the pressure center, falling along a
    /// tan curve to 0.0 at the critical point.
    #[must_use]
    pub fn pressure_multiplier(&self, utilization: f64) -> f64 {
        if utilization <= self.pressure_center {
            return 1.0;
        }
        if utilization >= self.pressure_critical {
            return 0.0;
        }
        let range = self.pressure_critical - self.pressure_center;
        let normalized = (utilization - self.pressure_center) / range;
        let angle = (normalized - 0.5) * std::f64::consts::PI / 1.2;
        (1.0 - (angle.tan() + 2.0) / 4.0).clamp(0.0, 1.0)
    }
}

/// Planned promotions and demotions for one evaluation round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TierPlan {
    /// (pin, destination backend) pairs to copy to a faster tier.
    pub promotions: Vec<(ContentHash, String)>,
    /// (pin, source backend) pairs to drop from a faster tier.
    pub demotions: Vec<(ContentHash, String)>,
}

impl TierPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.promotions.is_empty() && self.demotions.is_empty()
    }
}

/// Tracks access statistics and plans evictions and tier moves.
pub struct TierManager {
    stats: DashMap<ContentHash, AccessStats>,
    scorer: AdaptiveScorer,
}

impl Default for TierManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TierManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stats: DashMap::new(),
            scorer: AdaptiveScorer::default(),
        }
    }

    #[must_use]
    pub fn with_scorer(scorer: AdaptiveScorer) -> Self {
        Self {
            stats: DashMap::new(),
            scorer,
        }
    }

    /// Record one access to a pin.
    pub fn record_access(&self, hash: &ContentHash) {
        self.record_access_at(hash, now_millis());
    }

    pub(crate) fn record_access_at(&self, hash: &ContentHash, at: i64) {
        let mut entry = self.stats.entry(*hash).or_insert(AccessStats {
            last_access: at,
            access_count: 0,
        });
        entry.last_access = at;
        entry.access_count = entry.access_count.saturating_add(1);
    }

    #[must_use]
    pub fn stats(&self, hash: &ContentHash) -> Option<AccessStats> {
        self.stats.get(hash).map(|r| *r.value())
    }

    /// Forget statistics for a pin (after garbage collection).
    pub fn forget(&self, hash: &ContentHash) {
        self.stats.remove(hash);
    }

    fn stats_or_cold(&self, pin: &Pin) -> AccessStats {
        self.stats(&pin.hash).unwrap_or(AccessStats {
            last_access: pin.created_at,
            access_count: 0,
        })
    }

    /// Pins eligible to leave `backend` without violating the replica
    /// floor: another replica exists and the count stays >= `min_replicas`.
    fn floor_allows_removal(pin: &Pin, backend: &str, min_replicas: u32) -> bool {
        pin.is_active()
            && pin.has_replica_on(backend)
            && pin.replica_count() >= 2
            && pin.replica_count() - 1 >= min_replicas.max(1) as usize
    }

    /// Plan evictions for one backend under quota pressure.
    ///
    /// Returns hashes to delete from the backend, lowest-value first,
    /// until enough bytes are freed. An empty plan with usage over quota
    /// means no candidate satisfied the replica floor; the caller
    /// surfaces a warning instead.
    #[must_use]
    pub fn plan_evictions(
        &self,
        policy: &EffectivePolicy,
        backend: &str,
        pins: &[Pin],
        usage: &UsageReport,
    ) -> Vec<ContentHash> {
        let limit = match policy.cache_max_bytes.or(usage.quota_bytes) {
            Some(limit) if usage.used_bytes > limit => limit,
            _ => return Vec::new(),
        };
        let mut to_free = usage.used_bytes - limit;

        let mut candidates: Vec<&Pin> = pins
            .iter()
            .filter(|p| Self::floor_allows_removal(p, backend, policy.min_replicas))
            .collect();

        let now = now_millis();
        let utilization = usage.utilization().unwrap_or(1.0);
        match policy.cache_policy {
            CachePolicy::Lru | CachePolicy::Tiered => {
                candidates.sort_by_key(|p| self.stats_or_cold(p).last_access);
            }
            CachePolicy::Mru => {
                candidates.sort_by_key(|p| std::cmp::Reverse(self.stats_or_cold(p).last_access));
            }
            CachePolicy::Lfu => {
                candidates.sort_by_key(|p| self.stats_or_cold(p).access_count);
            }
            CachePolicy::Fifo => {
                candidates.sort_by_key(|p| p.created_at);
            }
            CachePolicy::Adaptive => {
                candidates.sort_by(|a, b| {
                    let sa = self.scorer.score(a, &self.stats_or_cold(a), utilization, now);
                    let sb = self.scorer.score(b, &self.stats_or_cold(b), utilization, now);
                    sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }

        let mut evictions = Vec::new();
        for pin in candidates {
            if to_free == 0 {
                break;
            }
            evictions.push(pin.hash);
            to_free = to_free.saturating_sub(pin.size);
        }
        debug!(backend, count = evictions.len(), "Planned evictions");
        evictions
    }

    /// Plan promotions and demotions for auto-tiered buckets.
    ///
    /// Promotion: access count crossed `promote_access_threshold` and the
    /// pin holds no replica on a speed-optimized backend yet. Demotion:
    /// idle longer than `demote_idle_secs` on a speed-optimized backend,
    /// with a durable copy elsewhere and the replica floor respected.
    #[must_use]
    pub fn plan_moves(
        &self,
        policy: &EffectivePolicy,
        pins: &[Pin],
        backends: &[BackendConfig],
        promote_access_threshold: u64,
        demote_idle_secs: u64,
    ) -> TierPlan {
        if !policy.auto_tier {
            return TierPlan::default();
        }

        let fast: Vec<&BackendConfig> = backends
            .iter()
            .filter(|b| b.tier == PerformanceTier::SpeedOptimized)
            .collect();
        if fast.is_empty() {
            return TierPlan::default();
        }
        let is_fast = |name: &str| fast.iter().any(|b| b.name == name);

        let now = now_millis();
        let mut plan = TierPlan::default();

        for pin in pins.iter().filter(|p| p.is_active()) {
            let stats = self.stats_or_cold(pin);
            let on_fast: Vec<&String> =
                pin.backend_set.iter().filter(|b| is_fast(b)).collect();

            if stats.access_count >= promote_access_threshold && on_fast.is_empty() {
                // Highest-weight fast backend wins the promotion slot.
                if let Some(dest) = fast
                    .iter()
                    .max_by_key(|b| (policy.weight_of(&b.name), std::cmp::Reverse(b.name.clone())))
                {
                    plan.promotions.push((pin.hash, dest.name.clone()));
                }
                continue;
            }

            let idle_ms = now - stats.last_access;
            if idle_ms >= (demote_idle_secs as i64).saturating_mul(1000) {
                for source in on_fast {
                    let durable_elsewhere = pin
                        .backend_set
                        .iter()
                        .any(|b| b != source && !is_fast(b));
                    if durable_elsewhere
                        && Self::floor_allows_removal(pin, source, policy.min_replicas)
                    {
                        plan.demotions.push((pin.hash, source.clone()));
                        break;
                    }
                }
            }
        }
        plan
    }
}
