// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure-injection tests: transient faults, unreachable backends,
//! pass deadlines, and mutations racing an in-flight pass.

use async_trait::async_trait;
use pinsync::backend::{
    BackendAdapter, BackendConfig, BackendError, HealthStatus, InMemoryBackend, UsageReport,
};
use pinsync::store::{Bucket, BucketLayout};
use pinsync::{ContentHash, PinSyncConfig, RemotePin, SyncEngine};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Fails the first `failures` pushes with a transient error, then
/// delegates to the wrapped backend.
struct FlakyBackend {
    inner: InMemoryBackend,
    failures: AtomicUsize,
}

impl FlakyBackend {
    fn new(name: &str, failures: usize) -> Self {
        Self {
            inner: InMemoryBackend::new(name),
            failures: AtomicUsize::new(failures),
        }
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BackendAdapter for FlakyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn health_check(&self) -> HealthStatus {
        self.inner.health_check().await
    }

    async fn list_pins(&self, bucket: &str) -> Result<Vec<RemotePin>, BackendError> {
        self.inner.list_pins(bucket).await
    }

    async fn push(
        &self,
        hash: &ContentHash,
        bytes: &[u8],
        path: &str,
        metadata: &Value,
    ) -> Result<(), BackendError> {
        if self.take_failure() {
            return Err(BackendError::Transient("injected fault".into()));
        }
        self.inner.push(hash, bytes, path, metadata).await
    }

    async fn pull(&self, hash: &ContentHash) -> Result<Vec<u8>, BackendError> {
        self.inner.pull(hash).await
    }

    async fn delete(&self, hash: &ContentHash) -> Result<(), BackendError> {
        self.inner.delete(hash).await
    }

    async fn usage(&self) -> Result<UsageReport, BackendError> {
        self.inner.usage().await
    }
}

/// Push blocks until the test releases it, so a mutation can be
/// injected while the pass is provably in flight.
struct GatedBackend {
    inner: InMemoryBackend,
    entered: Notify,
    release: Notify,
}

impl GatedBackend {
    fn new(name: &str) -> Self {
        Self {
            inner: InMemoryBackend::new(name),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl BackendAdapter for GatedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn health_check(&self) -> HealthStatus {
        self.inner.health_check().await
    }

    async fn list_pins(&self, bucket: &str) -> Result<Vec<RemotePin>, BackendError> {
        self.inner.list_pins(bucket).await
    }

    async fn push(
        &self,
        hash: &ContentHash,
        bytes: &[u8],
        path: &str,
        metadata: &Value,
    ) -> Result<(), BackendError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.push(hash, bytes, path, metadata).await
    }

    async fn pull(&self, hash: &ContentHash) -> Result<Vec<u8>, BackendError> {
        self.inner.pull(hash).await
    }

    async fn delete(&self, hash: &ContentHash) -> Result<(), BackendError> {
        self.inner.delete(hash).await
    }

    async fn usage(&self) -> Result<UsageReport, BackendError> {
        self.inner.usage().await
    }
}

fn fast_retry_config() -> PinSyncConfig {
    PinSyncConfig {
        transfer_retry_initial_ms: 1,
        transfer_retry_max_ms: 5,
        ..Default::default()
    }
}

async fn engine_with_config(config: PinSyncConfig) -> (SyncEngine, Arc<InMemoryBackend>) {
    let local = Arc::new(InMemoryBackend::new("local"));
    let engine = SyncEngine::new(config, local.clone()).await.unwrap();
    (engine, local)
}

async fn pin_one(
    engine: &SyncEngine,
    local: &InMemoryBackend,
    bucket: &str,
    path: &str,
    bytes: &[u8],
) -> ContentHash {
    let hash = ContentHash::of(bytes);
    let key = format!("{}/{}", bucket, path.trim_start_matches('/'));
    local.push(&hash, bytes, &key, &Value::Null).await.unwrap();
    engine
        .put(bucket, path, hash, bytes.len() as u64, Value::Null)
        .await
        .unwrap();
    hash
}

async fn docs_bucket(engine: &SyncEngine, backend: &str) {
    engine
        .buckets()
        .create(
            Bucket::new("docs", "documents", BucketLayout::Flat)
                .with_backends(vec![backend.to_string()]),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_transient_push_failures_are_retried() {
    let (engine, local) = engine_with_config(fast_retry_config()).await;
    let flaky = Arc::new(FlakyBackend::new("flaky", 2));
    engine.add_backend(BackendConfig::new("flaky", "memory"), flaky.clone());
    docs_bucket(&engine, "flaky").await;
    let hash = pin_one(&engine, &local, "docs", "/a.txt", b"persistence pays").await;

    let results = engine.sync_dirty().await;
    let result = &results["flaky"];
    assert!(result.succeeded(), "{:?}", result);
    assert_eq!(result.pushed, vec![hash]);
    assert!(result.dirty_cleared);
    assert!(flaky.inner.contains(&hash));
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_transfer() {
    let (engine, local) = engine_with_config(fast_retry_config()).await;
    // More injected faults than retry attempts
    let flaky = Arc::new(FlakyBackend::new("flaky", 50));
    engine.add_backend(BackendConfig::new("flaky", "memory"), flaky.clone());
    docs_bucket(&engine, "flaky").await;
    let hash = pin_one(&engine, &local, "docs", "/a.txt", b"doomed").await;

    let results = engine.sync_dirty().await;
    let result = &results["flaky"];
    assert!(!result.succeeded());
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].hash, hash);
    assert_eq!(result.failures[0].op, "push");
    assert!(!flaky.inner.contains(&hash));

    let status = engine.sync_status();
    assert!(status["flaky"].dirty);
}

#[tokio::test]
async fn test_failed_transfer_recovers_on_next_pass() {
    let (engine, local) = engine_with_config(fast_retry_config()).await;
    let flaky = Arc::new(FlakyBackend::new("flaky", 50));
    engine.add_backend(BackendConfig::new("flaky", "memory"), flaky.clone());
    docs_bucket(&engine, "flaky").await;
    let hash = pin_one(&engine, &local, "docs", "/a.txt", b"second chance").await;

    engine.sync_dirty().await;
    // Fault budget exhausted; the backend behaves again
    flaky.failures.store(0, Ordering::SeqCst);

    let results = engine.sync_dirty().await;
    assert!(results["flaky"].succeeded());
    assert!(flaky.inner.contains(&hash));
    assert!(!engine.sync_status()["flaky"].dirty);
}

#[tokio::test]
async fn test_mutation_during_pass_survives_dirty_clear() {
    let (engine, local) = engine_with_config(PinSyncConfig::default()).await;
    let gated = Arc::new(GatedBackend::new("gated"));
    engine.add_backend(BackendConfig::new("gated", "memory"), gated.clone());
    docs_bucket(&engine, "gated").await;
    pin_one(&engine, &local, "docs", "/a.txt", b"first write").await;

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync_backend("gated").await.unwrap() })
    };

    // The pass is now inside its push. Land a newer mutation, with the
    // clock strictly past the pass start.
    gated.entered.notified().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine
        .mark_backend_dirty("gated", "write during pass")
        .await
        .unwrap();
    gated.release.notify_one();

    let result = runner.await.unwrap();
    assert!(result.succeeded(), "{:?}", result);
    assert!(
        !result.dirty_cleared,
        "a mutation newer than the pass start must survive the clear"
    );

    let status = engine.sync_status();
    assert!(status["gated"].dirty);
    assert_eq!(status["gated"].dirty_reason.as_deref(), Some("write during pass"));
}

#[tokio::test]
async fn test_pass_deadline_expires() {
    let config = PinSyncConfig {
        sync_deadline_secs: 1,
        ..Default::default()
    };
    let (engine, local) = engine_with_config(config).await;
    let gated = Arc::new(GatedBackend::new("stuck"));
    engine.add_backend(BackendConfig::new("stuck", "memory"), gated.clone());
    docs_bucket(&engine, "stuck").await;
    pin_one(&engine, &local, "docs", "/a.txt", b"never arrives").await;

    // Nothing ever releases the gate; the deadline has to fire.
    let result = engine.sync_backend("stuck").await.unwrap();
    assert!(!result.succeeded());
    assert!(result.error.as_ref().unwrap().contains("deadline"));
    assert!(engine.sync_status()["stuck"].dirty);
}

/// Healthy at the probe, but every listing fails.
struct UnlistableBackend {
    inner: InMemoryBackend,
}

#[async_trait]
impl BackendAdapter for UnlistableBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn health_check(&self) -> HealthStatus {
        self.inner.health_check().await
    }

    async fn list_pins(&self, _bucket: &str) -> Result<Vec<RemotePin>, BackendError> {
        Err(BackendError::Unavailable("listing service down".into()))
    }

    async fn push(
        &self,
        hash: &ContentHash,
        bytes: &[u8],
        path: &str,
        metadata: &Value,
    ) -> Result<(), BackendError> {
        self.inner.push(hash, bytes, path, metadata).await
    }

    async fn pull(&self, hash: &ContentHash) -> Result<Vec<u8>, BackendError> {
        self.inner.pull(hash).await
    }

    async fn delete(&self, hash: &ContentHash) -> Result<(), BackendError> {
        self.inner.delete(hash).await
    }

    async fn usage(&self) -> Result<UsageReport, BackendError> {
        self.inner.usage().await
    }
}

#[tokio::test]
async fn test_unreachable_listing_aborts_pass() {
    let (engine, local) = engine_with_config(fast_retry_config()).await;
    let blind = Arc::new(UnlistableBackend {
        inner: InMemoryBackend::new("blind"),
    });
    engine.add_backend(BackendConfig::new("blind", "memory"), blind.clone());
    docs_bucket(&engine, "blind").await;
    let hash = pin_one(&engine, &local, "docs", "/a.txt", b"unlisted").await;

    // Without a trustworthy listing no transfer plan exists; the pass
    // fails instead of guessing.
    let results = engine.sync_dirty().await;
    let result = &results["blind"];
    assert!(!result.succeeded());
    assert!(result.error.as_ref().unwrap().contains("listing"));
    assert!(!blind.inner.contains(&hash));
    assert!(engine.sync_status()["blind"].dirty);
}

#[tokio::test]
async fn test_concurrent_passes_are_serialized_per_backend() {
    let (engine, local) = engine_with_config(PinSyncConfig::default()).await;
    let gated = Arc::new(GatedBackend::new("gated"));
    engine.add_backend(BackendConfig::new("gated", "memory"), gated.clone());
    docs_bucket(&engine, "gated").await;
    pin_one(&engine, &local, "docs", "/a.txt", b"once only").await;

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync_backend("gated").await.unwrap() })
    };
    gated.entered.notified().await;

    // Second pass queues behind the per-backend lock
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync_backend("gated").await.unwrap() })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    gated.release.notify_one();

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert!(first.succeeded(), "{:?}", first);
    assert!(second.succeeded(), "{:?}", second);
    // The object moved exactly once across both passes
    assert_eq!(first.transfer_count() + second.transfer_count(), 1);
}
