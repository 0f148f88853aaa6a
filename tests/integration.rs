// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end engine tests against in-memory backends.

use pinsync::backend::{BackendAdapter, BackendConfig, InMemoryBackend};
use pinsync::policy::{PolicyLayer, QuotaAction, ReplicationStrategy};
use pinsync::store::{Bucket, BucketLayout};
use pinsync::{ContentHash, PinSyncConfig, SyncEngine};
use serde_json::Value;
use std::sync::Arc;

async fn engine() -> (SyncEngine, Arc<InMemoryBackend>) {
    let local = Arc::new(InMemoryBackend::new("local"));
    let engine = SyncEngine::new(PinSyncConfig::default(), local.clone())
        .await
        .unwrap();
    (engine, local)
}

fn memory_backend(engine: &SyncEngine, name: &str) -> Arc<InMemoryBackend> {
    let adapter = Arc::new(InMemoryBackend::new(name));
    engine.add_backend(BackendConfig::new(name, "memory"), adapter.clone());
    adapter
}

async fn create_bucket(engine: &SyncEngine, name: &str, backends: &[&str]) {
    engine
        .buckets()
        .create(
            Bucket::new(name, "documents", BucketLayout::Flat)
                .with_backends(backends.iter().map(|b| b.to_string()).collect()),
        )
        .await
        .unwrap();
}

/// Put bytes into the local object store and pin them.
async fn ingest(
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

#[tokio::test]
async fn test_mirror_replicates_to_every_backend() {
    let (engine, local) = engine().await;
    let fast = memory_backend(&engine, "fast");
    let cold = memory_backend(&engine, "cold");

    let mut config = PinSyncConfig::default();
    config.global_policy.replication = Some(ReplicationStrategy::Mirror);
    engine.update_config(config);

    create_bucket(&engine, "docs", &["fast", "cold"]).await;
    let hash = ingest(&engine, &local, "docs", "/report.pdf", b"quarterly numbers").await;

    let results = engine.sync_dirty().await;
    assert!(results["fast"].succeeded());
    assert!(results["cold"].succeeded());
    assert!(fast.contains(&hash));
    assert!(cold.contains(&hash));

    let pin = engine.store().get(&hash).unwrap();
    assert!(pin.has_replica_on("fast"));
    assert!(pin.has_replica_on("cold"));
    assert_eq!(pin.replica_count(), 2);
}

#[tokio::test]
async fn test_spread_targets_only_the_planned_backends() {
    let (engine, local) = engine().await;
    let fast = memory_backend(&engine, "fast");
    let cold = memory_backend(&engine, "cold");

    create_bucket(&engine, "docs", &["fast", "cold"]).await;
    engine
        .buckets()
        .update(
            Bucket::new("docs", "documents", BucketLayout::Flat)
                .with_backends(vec!["fast".into(), "cold".into()])
                .with_policy(PolicyLayer {
                    min_replicas: Some(1),
                    preferred_backends: Some(vec!["cold".into()]),
                    ..Default::default()
                }),
        )
        .await
        .unwrap();

    let hash = ingest(&engine, &local, "docs", "/a.txt", b"spread me").await;
    engine.force_sync_all().await;

    assert!(cold.contains(&hash));
    assert!(!fast.contains(&hash));
}

#[tokio::test]
async fn test_second_pass_transfers_nothing() {
    let (engine, local) = engine().await;
    memory_backend(&engine, "fast");
    create_bucket(&engine, "docs", &["fast"]).await;
    ingest(&engine, &local, "docs", "/a.txt", b"idempotent").await;

    let first = engine.force_sync_all().await;
    assert_eq!(first["fast"].transfer_count(), 1);

    let second = engine.force_sync_all().await;
    assert!(second["fast"].succeeded());
    assert_eq!(second["fast"].transfer_count(), 0);
}

#[tokio::test]
async fn test_remove_tombstones_then_collects() {
    let (engine, local) = engine().await;
    let fast = memory_backend(&engine, "fast");
    create_bucket(&engine, "docs", &["fast"]).await;
    let hash = ingest(&engine, &local, "docs", "/a.txt", b"ephemeral").await;
    engine.sync_dirty().await;
    assert!(fast.contains(&hash));

    engine.remove("docs", "/a.txt").await.unwrap();
    // Tombstone remains visible until the backend replica is gone
    assert!(engine.store().get(&hash).unwrap().is_tombstoned());

    let results = engine.sync_dirty().await;
    assert_eq!(results["fast"].deleted, vec![hash]);
    assert!(!fast.contains(&hash));
    assert!(engine.store().get(&hash).is_none());
}

#[tokio::test]
async fn test_pull_restores_missing_local_bytes() {
    let (engine, local) = engine().await;
    let fast = memory_backend(&engine, "fast");
    create_bucket(&engine, "docs", &["fast"]).await;

    // The backend already holds the object but the local node does not.
    let bytes = b"recovered from fast";
    let hash = ContentHash::of(bytes);
    fast.push(&hash, bytes, "docs/r.txt", &Value::Null)
        .await
        .unwrap();
    engine
        .put("docs", "/r.txt", hash, bytes.len() as u64, Value::Null)
        .await
        .unwrap();

    let results = engine.sync_dirty().await;
    assert!(results["fast"].succeeded(), "{:?}", results["fast"]);
    assert_eq!(results["fast"].pulled, vec![hash]);
    assert!(local.contains(&hash));
}

#[tokio::test]
async fn test_corrupt_replica_is_dropped_not_pulled() {
    let (engine, local) = engine().await;
    let fast = memory_backend(&engine, "fast");
    create_bucket(&engine, "docs", &["fast"]).await;

    // Store bytes under a hash they do not match.
    let hash = ContentHash::of(b"the real content");
    fast.push(&hash, b"bit-rotted bytes", "docs/c.txt", &Value::Null)
        .await
        .unwrap();
    engine
        .put("docs", "/c.txt", hash, 16, Value::Null)
        .await
        .unwrap();

    let results = engine.sync_dirty().await;
    let result = &results["fast"];
    assert!(!result.succeeded());
    assert!(result.failures.iter().any(|f| f.op == "verify"));
    assert!(!local.contains(&hash));
    assert!(!engine
        .store()
        .get(&hash)
        .map(|p| p.has_replica_on("fast"))
        .unwrap_or(true));
}

#[tokio::test]
async fn test_quota_rejected_push_keeps_backend_dirty() {
    let (engine, local) = engine().await;
    let tiny = Arc::new(InMemoryBackend::new("tiny").with_quota(4));
    engine.add_backend(BackendConfig::new("tiny", "memory"), tiny.clone());
    create_bucket(&engine, "docs", &["tiny"]).await;
    let hash = ingest(&engine, &local, "docs", "/big.bin", b"way too large").await;

    let results = engine.sync_dirty().await;
    let result = &results["tiny"];
    assert!(result.succeeded(), "quota backpressure is not a failure");
    assert!(result.pushed.is_empty());
    assert!(!result.dirty_cleared);
    assert!(!tiny.contains(&hash));

    let status = engine.sync_status();
    assert!(status["tiny"].dirty, "deferred pushes must stay dirty");
}

#[tokio::test]
async fn test_quota_evict_frees_cache_backend() {
    let (engine, local) = engine().await;
    let fast = memory_backend(&engine, "fast");
    let cold = memory_backend(&engine, "cold");

    // Phase 1: both pins land on both backends.
    let mut config = PinSyncConfig::default();
    config.global_policy.replication = Some(ReplicationStrategy::Mirror);
    engine.update_config(config);
    create_bucket(&engine, "docs", &["fast", "cold"]).await;
    let a = ingest(&engine, &local, "docs", "/a.bin", b"aaa").await;
    let b = ingest(&engine, &local, "docs", "/b.bin", b"bbb").await;
    engine.force_sync_all().await;
    assert_eq!(fast.object_count(), 2);

    // Phase 2: shrink the fast cache and stop targeting it, so evicted
    // objects are not immediately re-pushed.
    engine
        .buckets()
        .update(
            Bucket::new("docs", "documents", BucketLayout::Flat)
                .with_backends(vec!["fast".into(), "cold".into()])
                .with_policy(PolicyLayer {
                    replication: Some(ReplicationStrategy::Spread),
                    min_replicas: Some(1),
                    preferred_backends: Some(vec!["cold".into()]),
                    ..Default::default()
                }),
        )
        .await
        .unwrap();
    engine.add_backend(
        BackendConfig::new("fast", "memory").with_policy(PolicyLayer {
            cache_max_bytes: Some(4),
            quota_action: Some(QuotaAction::Evict),
            ..Default::default()
        }),
        fast.clone(),
    );

    let result = engine.sync_backend("fast").await.unwrap();
    assert!(result.succeeded(), "{:?}", result);
    assert!(result.warnings.iter().any(|w| w.contains("evicted")));
    assert_eq!(fast.object_count(), 1);
    // Durable copies survive on the other backend
    assert!(cold.contains(&a) && cold.contains(&b));
}

#[tokio::test]
async fn test_dedup_one_object_two_paths() {
    let (engine, local) = engine().await;
    let fast = memory_backend(&engine, "fast");
    create_bucket(&engine, "docs", &["fast"]).await;

    let bytes = b"shared bytes";
    let hash = ingest(&engine, &local, "docs", "/one.txt", bytes).await;
    engine
        .put("docs", "/two.txt", hash, bytes.len() as u64, Value::Null)
        .await
        .unwrap();

    let results = engine.force_sync_all().await;
    // One object on the wire, two path bindings in the index
    assert_eq!(results["fast"].pushed, vec![hash]);
    assert_eq!(fast.object_count(), 1);
    assert_eq!(
        engine.store().resolve("docs", "/one.txt").unwrap().hash,
        engine.store().resolve("docs", "/two.txt").unwrap().hash
    );

    // Removing one path keeps the pin alive
    engine.remove("docs", "/one.txt").await.unwrap();
    assert!(engine.store().get(&hash).unwrap().is_active());
    engine.remove("docs", "/two.txt").await.unwrap();
    assert!(engine.store().get(&hash).unwrap().is_tombstoned());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir
        .path()
        .join("state.db")
        .to_string_lossy()
        .into_owned();
    let config = PinSyncConfig {
        state_path: Some(state_path.clone()),
        ..Default::default()
    };

    let hash;
    {
        let local = Arc::new(InMemoryBackend::new("local"));
        let engine = SyncEngine::new(config.clone(), local.clone()).await.unwrap();
        memory_backend(&engine, "fast");
        create_bucket(&engine, "docs", &["fast"]).await;
        hash = ingest(&engine, &local, "docs", "/keep.txt", b"durable").await;
        let results = engine.sync_dirty().await;
        assert!(results["fast"].succeeded());
        // A second mutation lands after the pass and never syncs
        ingest(&engine, &local, "docs", "/late.txt", b"unsynced").await;
        engine.shutdown();
    }

    let local = Arc::new(InMemoryBackend::new("local"));
    let engine = SyncEngine::new(config, local).await.unwrap();
    memory_backend(&engine, "fast");

    assert!(engine.buckets().contains("docs"));
    let pin = engine.store().get(&hash).unwrap();
    assert_eq!(pin.path, "/keep.txt");
    assert_eq!(
        engine.store().resolve("docs", "/keep.txt").unwrap().hash,
        hash
    );
    // The unsynced mutation is still flagged after the restart
    let status = engine.sync_status();
    assert!(status["fast"].dirty);

    // History written before the restart is still readable
    let persisted = engine.persisted_history("fast", 10).await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].pushed, vec![hash]);
    assert!(engine.history("fast").is_empty(), "in-memory ring starts cold");
}

#[tokio::test]
async fn test_failed_backend_does_not_block_others() {
    let (engine, local) = engine().await;
    let fast = memory_backend(&engine, "fast");
    let cold = memory_backend(&engine, "cold");
    cold.set_unhealthy("disk controller offline");

    let mut config = PinSyncConfig::default();
    config.global_policy.replication = Some(ReplicationStrategy::Mirror);
    engine.update_config(config);
    create_bucket(&engine, "docs", &["fast", "cold"]).await;
    let hash = ingest(&engine, &local, "docs", "/a.txt", b"partial").await;

    let results = engine.sync_dirty().await;
    assert!(results["fast"].succeeded());
    assert!(!results["cold"].succeeded());
    assert!(fast.contains(&hash));

    let status = engine.sync_status();
    assert!(!status["fast"].dirty);
    assert!(status["cold"].dirty);

    // The backend recovers and the next selective sync converges it
    cold.set_healthy();
    let results = engine.sync_dirty().await;
    assert_eq!(results.len(), 1, "only the dirty backend is synced");
    assert!(results["cold"].succeeded());
    assert!(cold.contains(&hash));
}

#[tokio::test]
async fn test_replica_deficit_clears_after_sync() {
    let (engine, local) = engine().await;
    memory_backend(&engine, "fast");
    memory_backend(&engine, "cold");

    let mut config = PinSyncConfig::default();
    config.global_policy.replication = Some(ReplicationStrategy::Mirror);
    config.global_policy.min_replicas = Some(2);
    engine.update_config(config);
    create_bucket(&engine, "docs", &["fast", "cold"]).await;
    let hash = ingest(&engine, &local, "docs", "/a.txt", b"floor").await;

    assert_eq!(engine.replica_deficits().unwrap(), vec![hash]);
    engine.sync_dirty().await;
    assert!(engine.replica_deficits().unwrap().is_empty());
}

#[tokio::test]
async fn test_two_backend_replication_end_to_end() {
    let (engine, local) = engine().await;
    let fast = memory_backend(&engine, "fast");
    let cold = memory_backend(&engine, "cold");

    engine
        .buckets()
        .create(
            Bucket::new("docs", "documents", BucketLayout::Flat)
                .with_backends(vec!["fast".into(), "cold".into()])
                .with_policy(PolicyLayer {
                    min_replicas: Some(2),
                    preferred_backends: Some(vec!["fast".into(), "cold".into()]),
                    ..Default::default()
                }),
        )
        .await
        .unwrap();

    let hash = ingest(&engine, &local, "docs", "/a.txt", b"one hundred bytes, more or less").await;
    let status = engine.sync_status();
    assert!(status["fast"].dirty && status["cold"].dirty);

    let results = engine.sync_dirty().await;
    assert!(results["fast"].succeeded() && results["cold"].succeeded());
    assert_eq!(results["fast"].pushed, vec![hash]);
    assert_eq!(results["cold"].pushed, vec![hash]);
    assert!(fast.contains(&hash) && cold.contains(&hash));

    let status = engine.sync_status();
    assert!(!status["fast"].dirty && !status["cold"].dirty);
    let pin = engine.store().get(&hash).unwrap();
    assert!(pin.has_replica_on("fast") && pin.has_replica_on("cold"));
}

#[tokio::test]
async fn test_history_records_passes() {
    let (engine, local) = engine().await;
    memory_backend(&engine, "fast");
    create_bucket(&engine, "docs", &["fast"]).await;
    ingest(&engine, &local, "docs", "/a.txt", b"hist").await;

    engine.force_sync_all().await;
    engine.force_sync_all().await;

    let history = engine.history("fast");
    assert_eq!(history.len(), 2);
    // Newest first: the second pass moved nothing
    assert_eq!(history[0].transfer_count(), 0);
    assert_eq!(history[1].transfer_count(), 1);
}
