// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The sync engine: per-backend passes, the upward API surface, and
//! engine lifecycle.
//!
//! One pass per backend: health check, policy resolution, diff against
//! the remote listing, retried transfers with digest verification, then
//! a conditional dirty-clear ordered strictly after every transfer
//! outcome is known. Passes for different backends run concurrently up
//! to `max_sync_parallelism`; the same backend is never double-synced
//! thanks to a per-backend mutex.
//!
//! The "local" adapter is the deployment's own content-addressed object
//! node, driven through the same six-operation contract as any remote:
//! it is the byte source for pushes and the destination for pulls.

pub mod diff;
pub mod result;

pub use diff::SyncDiff;
pub use result::{PinFailure, SyncHistory, SyncResult, SyncStatus};

use crate::backend::{AdapterRegistry, BackendAdapter, BackendConfig, BackendError, HealthStatus};
use crate::config::PinSyncConfig;
use crate::dirty::DirtyTracker;
use crate::hash::ContentHash;
use crate::metrics;
use crate::pin::{now_millis, Pin, PinStatus, RemotePin};
use crate::policy::{resolve, EffectivePolicy, PolicyError, QuotaAction};
use crate::replication::{self, ReplicationManager};
use crate::resilience::{retry_if, RetryConfig};
use crate::store::{BucketRegistry, ContentStore, StateStore, StoreError};
use crate::tier::TierManager;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Engine lifecycle state, broadcast over a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, persisted state not yet loaded.
    Created,
    /// Loaded and idle; passes can be started.
    Ready,
    /// At least one sync pass in flight.
    Running,
    /// Shutdown requested; new passes are rejected.
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
    #[error("engine is shutting down")]
    ShuttingDown,
}

struct EngineInner {
    config: watch::Sender<PinSyncConfig>,
    state_tx: watch::Sender<EngineState>,

    state: Arc<StateStore>,
    buckets: Arc<BucketRegistry>,
    dirty: Arc<DirtyTracker>,
    store: Arc<ContentStore>,

    /// The deployment's own object node.
    local: Arc<dyn BackendAdapter>,
    adapters: dashmap::DashMap<String, Arc<dyn BackendAdapter>>,
    backend_configs: dashmap::DashMap<String, BackendConfig>,

    replication: ReplicationManager,
    tiers: TierManager,

    /// Per-backend pass mutexes; cross-backend parallelism is bounded
    /// by the semaphore.
    pass_locks: dashmap::DashMap<String, Arc<Mutex<()>>>,
    semaphore: Arc<Semaphore>,
    history: SyncHistory,
}

/// Replication/sync engine over a set of configured backends.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Build an engine, opening (or creating) the durable state store
    /// and restoring buckets, pins, and dirty flags.
    pub async fn new(
        config: PinSyncConfig,
        local: Arc<dyn BackendAdapter>,
    ) -> Result<Self, SyncError> {
        let state = Arc::new(match &config.state_path {
            Some(path) => StateStore::open(path).await?,
            None => StateStore::in_memory().await?,
        });
        let buckets = Arc::new(BucketRegistry::new(state.clone()));
        let dirty = Arc::new(DirtyTracker::new(state.clone()));
        let store = Arc::new(ContentStore::new(
            state.clone(),
            buckets.clone(),
            dirty.clone(),
        ));

        let (state_tx, _) = watch::channel(EngineState::Created);
        let parallelism = config.max_sync_parallelism.max(1);
        let history_capacity = config.history_capacity;
        let (config_tx, _) = watch::channel(config);

        let inner = Arc::new(EngineInner {
            config: config_tx,
            state_tx,
            state,
            buckets,
            dirty,
            store,
            local,
            adapters: dashmap::DashMap::new(),
            backend_configs: dashmap::DashMap::new(),
            replication: ReplicationManager::new(),
            tiers: TierManager::new(),
            pass_locks: dashmap::DashMap::new(),
            semaphore: Arc::new(Semaphore::new(parallelism)),
            history: SyncHistory::new(history_capacity),
        });

        let buckets_loaded = inner.buckets.load().await?;
        let pins_loaded = inner.store.load().await?;
        let dirty_pending = inner.dirty.load().await?;
        inner.set_state(EngineState::Ready);
        info!(
            buckets = buckets_loaded,
            pins = pins_loaded,
            dirty = dirty_pending,
            "Sync engine ready"
        );
        Ok(Self { inner })
    }

    // --- Lifecycle ---

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.inner.state_tx.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.inner.state_tx.subscribe()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    /// Stop accepting new passes. In-flight passes run to completion.
    pub fn shutdown(&self) {
        self.inner.set_state(EngineState::ShuttingDown);
        info!("Sync engine shutting down");
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> PinSyncConfig {
        self.inner.config.borrow().clone()
    }

    /// Replace the runtime configuration. Takes effect on the next pass;
    /// the parallelism bound is fixed at construction.
    pub fn update_config(&self, config: PinSyncConfig) {
        self.inner.config.send_replace(config);
    }

    // --- Component access ---

    #[must_use]
    pub fn store(&self) -> Arc<ContentStore> {
        self.inner.store.clone()
    }

    #[must_use]
    pub fn buckets(&self) -> Arc<BucketRegistry> {
        self.inner.buckets.clone()
    }

    // --- Backend management ---

    /// Register a backend with an already-constructed adapter.
    pub fn add_backend(&self, config: BackendConfig, adapter: Arc<dyn BackendAdapter>) {
        info!(backend = %config.name, kind = %config.kind, "Backend registered");
        self.inner.adapters.insert(config.name.clone(), adapter);
        self.inner.backend_configs.insert(config.name.clone(), config);
    }

    /// Register a backend, constructing its adapter from the registry.
    pub fn add_backend_from(
        &self,
        registry: &AdapterRegistry,
        config: BackendConfig,
    ) -> Result<(), SyncError> {
        let adapter = registry.create(&config)?;
        self.add_backend(config, adapter);
        Ok(())
    }

    #[must_use]
    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .adapters
            .iter()
            .map(|r| r.key().clone())
            .collect();
        names.sort();
        names
    }

    // --- Content convenience surface ---

    /// Ingest content: record the pin and mark the bucket's backends
    /// dirty. Digest computation belongs to the ingest layer.
    pub async fn put(
        &self,
        bucket: &str,
        path: &str,
        hash: ContentHash,
        size: u64,
        metadata: Value,
    ) -> Result<Pin, SyncError> {
        Ok(self.inner.store.put(bucket, path, hash, size, metadata).await?)
    }

    /// Unbind a path (tombstoning content whose last binding goes away).
    pub async fn remove(&self, bucket: &str, path: &str) -> Result<(), SyncError> {
        Ok(self.inner.store.remove(bucket, path).await?)
    }

    /// Look up a pin and record the access for tiering decisions.
    #[must_use]
    pub fn get(&self, hash: &ContentHash) -> Option<Pin> {
        let pin = self.inner.store.get(hash);
        if pin.is_some() {
            self.inner.tiers.record_access(hash);
        }
        pin
    }

    /// Record an access without a lookup (read served elsewhere).
    pub fn record_access(&self, hash: &ContentHash) {
        self.inner.tiers.record_access(hash);
    }

    // --- Upward API surface ---

    /// Flag one backend for the next selective sync.
    pub async fn mark_backend_dirty(&self, name: &str, reason: &str) -> Result<(), SyncError> {
        if !self.inner.adapters.contains_key(name) {
            return Err(SyncError::UnknownBackend(name.to_string()));
        }
        Ok(self.inner.dirty.mark_dirty(name, reason).await?)
    }

    /// Flag every configured backend. Returns how many were marked.
    pub async fn mark_all_dirty(&self, reason: &str) -> Result<usize, SyncError> {
        let names = self.backend_names();
        for name in &names {
            self.inner.dirty.mark_dirty(name, reason).await?;
        }
        Ok(names.len())
    }

    /// Sync every currently dirty backend. Always returns a per-backend
    /// outcome map; one failed backend never aborts the others.
    #[instrument(skip(self))]
    pub async fn sync_dirty(&self) -> HashMap<String, SyncResult> {
        let dirty: Vec<String> = self
            .inner
            .dirty
            .list_dirty()
            .into_iter()
            .filter(|name| self.inner.adapters.contains_key(name))
            .collect();
        self.run_passes(dirty).await
    }

    /// Sync every configured backend regardless of dirty state. Used for
    /// periodic verification and after configuration changes.
    #[instrument(skip(self))]
    pub async fn force_sync_all(&self) -> HashMap<String, SyncResult> {
        self.run_passes(self.backend_names()).await
    }

    /// Run one backend's pass now, regardless of dirty state.
    pub async fn sync_backend(&self, name: &str) -> Result<SyncResult, SyncError> {
        if !self.inner.adapters.contains_key(name) {
            return Err(SyncError::UnknownBackend(name.to_string()));
        }
        if self.state() == EngineState::ShuttingDown {
            return Err(SyncError::ShuttingDown);
        }
        Ok(self.inner.clone().run_pass(name.to_string()).await)
    }

    /// Per-backend dirty flag, last pass time, and last result.
    #[must_use]
    pub fn sync_status(&self) -> HashMap<String, SyncStatus> {
        self.backend_names()
            .into_iter()
            .map(|name| {
                let record = self.inner.dirty.record(&name);
                let last = self.inner.history.latest(&name);
                let status = SyncStatus {
                    dirty: record.as_ref().map(|r| r.dirty).unwrap_or(false),
                    dirty_reason: record.filter(|r| r.dirty).map(|r| r.reason),
                    last_sync: last.as_ref().map(|r| r.ended_at),
                    last_result: last,
                };
                (name, status)
            })
            .collect()
    }

    /// Probe every configured backend.
    pub async fn health_check_all(&self) -> HashMap<String, HealthStatus> {
        let adapters: Vec<(String, Arc<dyn BackendAdapter>)> = self
            .inner
            .adapters
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        let mut statuses = HashMap::new();
        for (name, adapter) in adapters {
            statuses.insert(name, adapter.health_check().await);
        }
        statuses
    }

    /// Recent sync results for one backend, newest first.
    #[must_use]
    pub fn history(&self, backend: &str) -> Vec<SyncResult> {
        self.inner.history.recent(backend)
    }

    /// Like [`history`](Self::history), but read from the durable store,
    /// so results from before a restart are included. Newest first.
    pub async fn persisted_history(
        &self,
        backend: &str,
        limit: usize,
    ) -> Result<Vec<SyncResult>, SyncError> {
        let rows = self.inner.state.load_history(backend, limit).await?;
        let mut results = Vec::with_capacity(rows.len());
        for json in rows {
            match serde_json::from_str(&json) {
                Ok(result) => results.push(result),
                Err(e) => warn!(backend, error = %e, "Skipping unreadable history record"),
            }
        }
        Ok(results)
    }

    /// Active pins currently below their bucket's replica floor. A
    /// non-empty result is a monitored condition, not an index error.
    pub fn replica_deficits(&self) -> Result<Vec<ContentHash>, SyncError> {
        let global = self.config().global_policy;
        let mut lacking = Vec::new();
        for bucket in self.inner.buckets.list() {
            let policy = resolve(&global, Some(&bucket.policy), None)?;
            let pins = self.inner.store.list_by_bucket(&bucket.name);
            lacking.extend(replication::deficits(pins.iter(), policy.min_replicas));
        }
        Ok(lacking)
    }

    /// Refresh gauge metrics. Intended for embedders that scrape on an
    /// interval.
    pub fn update_gauge_metrics(&self) {
        metrics::set_dirty_backends(self.inner.dirty.dirty_count());
        if let Ok(deficits) = self.replica_deficits() {
            metrics::set_replica_deficit(deficits.len());
        }
    }

    async fn run_passes(&self, names: Vec<String>) -> HashMap<String, SyncResult> {
        if names.is_empty() || self.state() == EngineState::ShuttingDown {
            return HashMap::new();
        }
        self.inner.set_state(EngineState::Running);

        let mut tasks = JoinSet::new();
        for name in names {
            let inner = self.inner.clone();
            tasks.spawn(async move {
                // Bound cross-backend parallelism.
                let _permit = inner.semaphore.clone().acquire_owned().await.ok();
                let result = inner.clone().run_pass(name.clone()).await;
                (name, result)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((name, result)) = joined {
                results.insert(name, result);
            }
        }

        self.inner.set_state(EngineState::Ready);
        self.update_gauge_metrics();
        results
    }
}

/// Pass-internal flow signals that survive a successful run.
#[derive(Default)]
struct PassFlow {
    /// When set, the pass succeeded but must not clear the dirty flag
    /// (writes were deferred, e.g. backend over quota).
    defer_clear: Option<String>,
}

impl EngineInner {
    fn set_state(&self, state: EngineState) {
        // send_replace stores the value even with no subscribers.
        self.state_tx.send_replace(state);
    }

    fn config(&self) -> PinSyncConfig {
        self.config.borrow().clone()
    }

    fn pass_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.pass_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn transfer_retry(&self) -> RetryConfig {
        let config = self.config();
        RetryConfig::bounded(
            config.transfer_retry_max,
            config.transfer_retry_initial_ms,
            config.transfer_retry_max_ms,
        )
    }

    /// One full sync pass for one backend. Never fails outright: every
    /// outcome lands in the returned [`SyncResult`].
    #[instrument(skip(self), fields(backend = %name))]
    async fn run_pass(self: Arc<Self>, name: String) -> SyncResult {
        let mut result = SyncResult::begin(&name);

        let Some(adapter) = self.adapters.get(&name).map(|r| r.value().clone()) else {
            result.error = Some(format!("unknown backend '{}'", name));
            result.finish();
            return result;
        };

        // Per-backend mutual exclusion: at most one pass per backend.
        let lock = self.pass_lock(&name);
        let _guard = lock.lock().await;

        // Reference point for the conditional dirty-clear: mutations that
        // land after this survive the clear.
        let pass_start = now_millis();
        let deadline = Duration::from_secs(self.config().sync_deadline_secs);

        let flow = match timeout(
            deadline,
            self.execute_pass(&name, &adapter, &mut result),
        )
        .await
        {
            Ok(Ok(flow)) => flow,
            Ok(Err(error)) => {
                result.error = Some(error);
                PassFlow::default()
            }
            Err(_) => {
                // Partial successes already verified are kept; the pass
                // still counts as failed for dirty-clear purposes.
                result.error = Some(format!("pass deadline of {:?} expired", deadline));
                PassFlow::default()
            }
        };

        // Dirty-clear is ordered strictly after all transfer outcomes.
        if result.succeeded() {
            self.replication.record_success(&name);
            match flow.defer_clear {
                None => match self.dirty.clear(&name, pass_start).await {
                    Ok(cleared) => result.dirty_cleared = cleared,
                    Err(e) => result.error = Some(format!("dirty clear failed: {}", e)),
                },
                Some(reason) => {
                    result.warnings.push(reason.clone());
                    if let Err(e) = self.dirty.mark_dirty(&name, &reason).await {
                        result.error = Some(format!("dirty re-mark failed: {}", e));
                    }
                }
            }
        } else {
            let reason = match &result.error {
                Some(error) => format!("sync pass failed: {}", error),
                None => format!("sync pass had {} transfer failures", result.failures.len()),
            };
            if let Err(e) = self.dirty.mark_dirty(&name, &reason).await {
                warn!(backend = %name, error = %e, "Failed to persist dirty reason");
            }
            if result.error.is_some() {
                self.apply_failover(&name, &mut result).await;
            }
        }

        result.finish();
        let outcome = if result.succeeded() { "success" } else { "failure" };
        metrics::record_sync_pass(
            &name,
            outcome,
            Duration::from_millis(result.duration_ms() as u64),
        );
        info!(
            backend = %name,
            pushed = result.pushed.len(),
            pulled = result.pulled.len(),
            deleted = result.deleted.len(),
            failures = result.failures.len(),
            outcome,
            "Sync pass finished"
        );

        self.history.record(result.clone());
        if let Ok(json) = serde_json::to_string(&result) {
            let capacity = self.config().history_capacity;
            if let Err(e) = self
                .state
                .append_history(&name, &json, result.ended_at, capacity)
                .await
            {
                warn!(backend = %name, error = %e, "Failed to persist sync history");
            }
        }
        result
    }

    /// Pass body: health, quota, diff, transfers, tier moves, GC.
    /// Pass-level failures come back as `Err(reason)`.
    async fn execute_pass(
        &self,
        name: &str,
        adapter: &Arc<dyn BackendAdapter>,
        result: &mut SyncResult,
    ) -> Result<PassFlow, String> {
        let health = adapter.health_check().await;
        if let HealthStatus::Unhealthy { reason } = health {
            // No partial mutation of this backend's replica memberships.
            return Err(format!("health check failed: {}", reason));
        }

        let config = self.config();
        let backend_config = self
            .backend_configs
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| format!("no configuration for backend '{}'", name))?;
        let local_region = config.local_region.as_deref();

        let mut flow = PassFlow::default();
        let skip_pushes = self
            .enforce_quota(name, adapter, &config, &backend_config, result)
            .await?;
        if skip_pushes {
            flow.defer_clear = Some(format!("backend '{}' over quota; pushes deferred", name));
        }

        let index = self.store.index_snapshot();
        let retry = self.transfer_retry();
        let probe = RetryConfig::probe();

        for bucket_name in self.buckets.buckets_for_backend(name) {
            let Some(bucket) = self.buckets.get(&bucket_name) else {
                continue;
            };
            let policy = resolve(
                &config.global_policy,
                Some(&bucket.policy),
                Some(&backend_config.policy),
            )
            .map_err(|e| e.to_string())?;

            let bucket_backends: Vec<BackendConfig> = bucket
                .backends
                .iter()
                .filter_map(|b| self.backend_configs.get(b).map(|r| r.value().clone()))
                .collect();
            let targets = self
                .replication
                .plan_targets(&policy, &bucket_backends, local_region);

            let wanted: Vec<Pin> = if targets.iter().any(|t| t == name) {
                self.store.list_by_bucket(&bucket_name)
            } else {
                Vec::new()
            };

            let remote = retry_if(
                "list_pins",
                &probe,
                BackendError::is_transient,
                || adapter.list_pins(&bucket_name),
            )
            .await
            .map_err(|e| format!("remote listing failed: {}", e))?;

            let local_objects: HashSet<ContentHash> = retry_if(
                "local list_pins",
                &probe,
                BackendError::is_transient,
                || self.local.list_pins(&bucket_name),
            )
            .await
            .map_err(|e| format!("local object listing failed: {}", e))?
            .into_iter()
            .map(|p| p.hash)
            .collect();

            let plan = diff::compute(&wanted, &index, &remote, &local_objects);
            if !plan.is_empty() {
                debug!(
                    backend = name,
                    bucket = %bucket_name,
                    push = plan.to_push.len(),
                    pull = plan.to_pull.len(),
                    delete = plan.to_delete.len(),
                    "Computed transfer plan"
                );
            }

            self.run_deletes(name, adapter, &retry, &plan.to_delete, result)
                .await;
            if !skip_pushes {
                let deferred = self
                    .run_pushes(name, adapter, &retry, &bucket_name, &plan.to_push, result)
                    .await;
                if deferred && flow.defer_clear.is_none() {
                    flow.defer_clear =
                        Some(format!("backend '{}' rejected pushes over quota", name));
                }
            }
            self.run_pulls(name, adapter, &retry, &bucket_name, &index, &plan.to_pull, result)
                .await;

            if policy.auto_tier {
                self.run_tier_moves(
                    name,
                    adapter,
                    &retry,
                    &bucket_name,
                    &policy,
                    &bucket_backends,
                    &config,
                    result,
                )
                .await;
            }
        }

        match self.store.collect_garbage().await {
            Ok(collected) => {
                for hash in &collected {
                    self.tiers.forget(hash);
                }
            }
            Err(e) => return Err(format!("garbage collection failed: {}", e)),
        }

        Ok(flow)
    }

    /// Poll usage; on quota pressure apply the configured action.
    /// Returns whether pushes must be skipped this pass.
    async fn enforce_quota(
        &self,
        name: &str,
        adapter: &Arc<dyn BackendAdapter>,
        config: &PinSyncConfig,
        backend_config: &BackendConfig,
        result: &mut SyncResult,
    ) -> Result<bool, String> {
        let usage = match retry_if(
            "usage",
            &RetryConfig::probe(),
            BackendError::is_transient,
            || adapter.usage(),
        )
        .await
        {
            Ok(usage) => usage,
            Err(e) => {
                result
                    .warnings
                    .push(format!("usage report unavailable: {}", e));
                return Ok(false);
            }
        };

        if let Some(utilization) = usage.utilization() {
            metrics::set_quota_utilization(name, utilization);
        }

        // Backend-wide policy: quota enforcement has no bucket context.
        let policy = resolve(&config.global_policy, None, Some(&backend_config.policy))
            .map_err(|e| e.to_string())?;
        let over_soft_limit = policy
            .cache_max_bytes
            .map(|limit| usage.used_bytes > limit)
            .unwrap_or(false);
        if !usage.over_quota() && !over_soft_limit {
            return Ok(false);
        }

        metrics::record_quota_warning(name);
        match policy.quota_action {
            QuotaAction::Warn => {
                result.warnings.push(format!(
                    "backend '{}' over quota ({} bytes used)",
                    name, usage.used_bytes
                ));
                Ok(false)
            }
            QuotaAction::RejectWrites => Ok(true),
            QuotaAction::Evict => {
                let pins = self.store.pins_on_backend(name);
                let evictions = self.tiers.plan_evictions(&policy, name, &pins, &usage);
                if evictions.is_empty() {
                    result.warnings.push(format!(
                        "backend '{}' over quota but no eviction candidate satisfies the replica floor",
                        name
                    ));
                    return Ok(false);
                }

                let retry = self.transfer_retry();
                let mut freed: u64 = 0;
                let mut count = 0usize;
                for hash in evictions {
                    match retry_if("evict", &retry, BackendError::is_transient, || {
                        adapter.delete(&hash)
                    })
                    .await
                    {
                        Ok(()) => {
                            if let Err(e) = self.store.remove_replica(&hash, name).await {
                                return Err(format!("replica update failed: {}", e));
                            }
                            freed += pins
                                .iter()
                                .find(|p| p.hash == hash)
                                .map(|p| p.size)
                                .unwrap_or(0);
                            count += 1;
                            result.deleted.push(hash);
                        }
                        Err(e) => result.record_failure(hash, "evict", e.to_string()),
                    }
                }
                metrics::record_eviction(name, count, freed);
                result.warnings.push(format!(
                    "evicted {} pins ({} bytes) from '{}' under quota pressure",
                    count, freed, name
                ));
                Ok(false)
            }
        }
    }

    async fn run_deletes(
        &self,
        name: &str,
        adapter: &Arc<dyn BackendAdapter>,
        retry: &RetryConfig,
        to_delete: &[RemotePin],
        result: &mut SyncResult,
    ) {
        for remote in to_delete {
            let started = std::time::Instant::now();
            match retry_if("delete", retry, BackendError::is_transient, || {
                adapter.delete(&remote.hash)
            })
            .await
            {
                Ok(()) => {
                    metrics::record_transfer(name, "delete", "success");
                    metrics::record_transfer_latency(name, "delete", started.elapsed());
                    if let Err(e) = self.store.remove_replica(&remote.hash, name).await {
                        result.record_failure(remote.hash, "delete", e.to_string());
                        continue;
                    }
                    result.deleted.push(remote.hash);
                }
                Err(e) => {
                    metrics::record_transfer(name, "delete", "error");
                    result.record_failure(remote.hash, "delete", e.to_string());
                }
            }
        }
    }

    /// Returns whether any push was deferred by quota backpressure; a
    /// deferred push must keep the backend dirty.
    async fn run_pushes(
        &self,
        name: &str,
        adapter: &Arc<dyn BackendAdapter>,
        retry: &RetryConfig,
        bucket: &str,
        to_push: &[Pin],
        result: &mut SyncResult,
    ) -> bool {
        let mut deferred = false;
        for pin in to_push {
            if let Err(failure) = self
                .push_one(name, adapter, retry, bucket, pin)
                .await
            {
                match failure {
                    BackendError::QuotaExceeded { used, quota } => {
                        // Quota is backpressure, not a transfer failure.
                        result.warnings.push(format!(
                            "push of {} rejected: backend '{}' at {}/{} bytes",
                            pin.hash, name, used, quota
                        ));
                        metrics::record_quota_warning(name);
                        deferred = true;
                    }
                    other => {
                        metrics::record_transfer(name, "push", "error");
                        result.record_failure(pin.hash, "push", other.to_string());
                    }
                }
            } else {
                result.pushed.push(pin.hash);
            }
        }
        deferred
    }

    async fn push_one(
        &self,
        name: &str,
        adapter: &Arc<dyn BackendAdapter>,
        retry: &RetryConfig,
        bucket: &str,
        pin: &Pin,
    ) -> Result<(), BackendError> {
        let started = std::time::Instant::now();

        let bytes = retry_if("local pull", retry, BackendError::is_transient, || {
            self.local.pull(&pin.hash)
        })
        .await?;

        // Verify before sending: a corrupt local object must never
        // propagate to a backend.
        if !pin.hash.verify(&bytes) {
            metrics::record_corruption(self.local.name());
            return Err(BackendError::Permanent(format!(
                "local object for {} fails digest verification",
                pin.hash
            )));
        }

        let remote_path = object_key(bucket, &pin.path);
        retry_if("push", retry, BackendError::is_transient, || {
            adapter.push(&pin.hash, &bytes, &remote_path, &pin.metadata)
        })
        .await?;

        self.store
            .add_replica(&pin.hash, name)
            .await
            .map_err(|e| BackendError::Permanent(e.to_string()))?;
        metrics::record_transfer(name, "push", "success");
        metrics::record_transfer_latency(name, "push", started.elapsed());
        Ok(())
    }

    async fn run_pulls(
        &self,
        name: &str,
        adapter: &Arc<dyn BackendAdapter>,
        retry: &RetryConfig,
        bucket: &str,
        index: &HashMap<ContentHash, Pin>,
        to_pull: &[RemotePin],
        result: &mut SyncResult,
    ) {
        for remote in to_pull {
            let Some(pin) = index.get(&remote.hash) else {
                continue;
            };
            let started = std::time::Instant::now();

            let bytes = match retry_if("pull", retry, BackendError::is_transient, || {
                adapter.pull(&remote.hash)
            })
            .await
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    metrics::record_transfer(name, "pull", "error");
                    result.record_failure(remote.hash, "pull", e.to_string());
                    continue;
                }
            };

            // A mismatched replica is corrupt: drop it from the replica
            // set instead of accepting the bytes.
            if !pin.hash.verify(&bytes) {
                metrics::record_corruption(name);
                if let Err(e) = self.store.remove_replica(&remote.hash, name).await {
                    result.record_failure(remote.hash, "verify", e.to_string());
                    continue;
                }
                if self
                    .store
                    .get(&remote.hash)
                    .map(|p| p.backend_set.is_empty())
                    .unwrap_or(false)
                {
                    // Every known replica is gone; flag the pin itself.
                    let _ = self.store.set_status(&remote.hash, PinStatus::Corrupted).await;
                }
                result.record_failure(
                    remote.hash,
                    "verify",
                    format!("replica on '{}' fails digest verification", name),
                );
                continue;
            }

            let local_path = object_key(bucket, &pin.path);
            match retry_if("local push", retry, BackendError::is_transient, || {
                self.local.push(&remote.hash, &bytes, &local_path, &pin.metadata)
            })
            .await
            {
                Ok(()) => {
                    metrics::record_transfer(name, "pull", "success");
                    metrics::record_transfer_latency(name, "pull", started.elapsed());
                    result.pulled.push(remote.hash);
                }
                Err(e) => {
                    result.record_failure(remote.hash, "pull", format!("local store: {}", e));
                }
            }
        }
    }

    /// Execute the tier plan's moves that concern this backend; moves
    /// owned by other backends just mark them dirty so their own pass
    /// picks the move up.
    #[allow(clippy::too_many_arguments)]
    async fn run_tier_moves(
        &self,
        name: &str,
        adapter: &Arc<dyn BackendAdapter>,
        retry: &RetryConfig,
        bucket: &str,
        policy: &EffectivePolicy,
        bucket_backends: &[BackendConfig],
        config: &PinSyncConfig,
        result: &mut SyncResult,
    ) {
        let pins = self.store.list_by_bucket(bucket);
        let plan = self.tiers.plan_moves(
            policy,
            &pins,
            bucket_backends,
            config.promote_access_threshold,
            config.demote_idle_secs,
        );
        if plan.is_empty() {
            return;
        }

        let mut promoted = 0usize;
        for (hash, dest) in &plan.promotions {
            if dest != name {
                if let Err(e) = self.dirty.mark_dirty(dest, "tier promotion pending").await {
                    warn!(backend = %dest, error = %e, "Failed to flag promotion target");
                }
                continue;
            }
            let Some(pin) = self.store.get(hash) else { continue };
            match self.push_one(name, adapter, retry, bucket, &pin).await {
                Ok(()) => {
                    promoted += 1;
                    result.pushed.push(*hash);
                }
                Err(e) => result.record_failure(*hash, "push", e.to_string()),
            }
        }
        if promoted > 0 {
            metrics::record_tier_moves(name, "promote", promoted);
        }

        let mut demoted = 0usize;
        for (hash, source) in &plan.demotions {
            if source != name {
                if let Err(e) = self.dirty.mark_dirty(source, "tier demotion pending").await {
                    warn!(backend = %source, error = %e, "Failed to flag demotion source");
                }
                continue;
            }
            match retry_if("demote", retry, BackendError::is_transient, || {
                adapter.delete(hash)
            })
            .await
            {
                Ok(()) => {
                    if let Err(e) = self.store.remove_replica(hash, name).await {
                        result.record_failure(*hash, "delete", e.to_string());
                        continue;
                    }
                    demoted += 1;
                    result.deleted.push(*hash);
                }
                Err(e) => result.record_failure(*hash, "delete", e.to_string()),
            }
        }
        if demoted > 0 {
            metrics::record_tier_moves(name, "demote", demoted);
        }
    }

    /// After a pass-level failure, apply the failover strategy for each
    /// bucket replicating to the failed backend.
    async fn apply_failover(&self, name: &str, result: &mut SyncResult) {
        let failures = self.replication.record_failure(name);
        let config = self.config();
        let local_region = config.local_region.as_deref();

        for bucket_name in self.buckets.buckets_for_backend(name) {
            let Some(bucket) = self.buckets.get(&bucket_name) else {
                continue;
            };
            let backend_policy = self
                .backend_configs
                .get(name)
                .map(|r| r.value().policy.clone());
            let Ok(policy) = resolve(
                &config.global_policy,
                Some(&bucket.policy),
                backend_policy.as_ref(),
            ) else {
                continue;
            };

            if !self.replication.should_failover(policy.failover, name) {
                result.warnings.push(format!(
                    "backend '{}' failing ({} consecutive passes); no automatic failover",
                    name, failures
                ));
                continue;
            }

            let bucket_backends: Vec<BackendConfig> = bucket
                .backends
                .iter()
                .filter_map(|b| self.backend_configs.get(b).map(|r| r.value().clone()))
                .collect();
            let targets = self
                .replication
                .plan_targets(&policy, &bucket_backends, local_region);

            match self.replication.substitute(
                &policy,
                &bucket_backends,
                name,
                &targets,
                local_region,
            ) {
                Some(substitute) => {
                    let reason = format!("failover from '{}'", name);
                    if self.dirty.mark_dirty(&substitute, &reason).await.is_ok() {
                        result.warnings.push(format!(
                            "failing over bucket '{}' from '{}' to '{}'",
                            bucket_name, name, substitute
                        ));
                    }
                }
                None => {
                    result.warnings.push(format!(
                        "backend '{}' failing and no substitute is available for bucket '{}'",
                        name, bucket_name
                    ));
                }
            }
        }
    }
}

/// Object key on a backend: bucket-prefixed virtual path.
fn object_key(bucket: &str, path: &str) -> String {
    format!("{}/{}", bucket, path.trim_start_matches('/'))
}
