// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # pinsync
//!
//! Content-addressed pin replication engine. The local node keeps the
//! authoritative index of pinned content; heterogeneous storage backends
//! hold replicas. Synchronization is selective: mutations mark the
//! affected backends dirty, and a sync pass per dirty backend diffs the
//! local index against the backend's listing and transfers only the
//! difference.
//!
//! The main pieces:
//!
//! - [`SyncEngine`] — lifecycle, the upward API, and per-backend sync
//!   passes with bounded parallelism.
//! - [`store::ContentStore`] — pins, the per-bucket VFS index, and
//!   tombstone-based removal, persisted through [`store::StateStore`].
//! - [`policy`] — three-layer policy resolution (backend over bucket
//!   over global).
//! - [`backend::BackendAdapter`] — the six-operation contract every
//!   storage backend implements.
//! - [`replication`] and [`tier`] — target planning, failover, cache
//!   eviction, and tier moves.
//!
//! ## Example
//!
//! ```no_run
//! use pinsync::backend::{BackendConfig, InMemoryBackend};
//! use pinsync::store::{Bucket, BucketLayout};
//! use pinsync::{ContentHash, PinSyncConfig, SyncEngine};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let local = Arc::new(InMemoryBackend::new("local"));
//! let engine = SyncEngine::new(PinSyncConfig::default(), local).await?;
//! engine.add_backend(
//!     BackendConfig::new("fast", "memory"),
//!     Arc::new(InMemoryBackend::new("fast")),
//! );
//! engine
//!     .buckets()
//!     .create(Bucket::new("docs", "documents", BucketLayout::Flat)
//!         .with_backends(vec!["fast".into()]))
//!     .await?;
//!
//! let bytes = b"hello";
//! let hash = ContentHash::of(bytes);
//! engine.put("docs", "/hello.txt", hash, bytes.len() as u64, serde_json::Value::Null).await?;
//! engine.sync_dirty().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod dirty;
pub mod hash;
pub mod metrics;
pub mod pin;
pub mod policy;
pub mod replication;
pub mod resilience;
pub mod store;
pub mod sync;
pub mod tier;

pub use backend::{AdapterRegistry, BackendAdapter, BackendConfig, BackendError, HealthStatus};
pub use config::PinSyncConfig;
pub use dirty::{DirtyRecord, DirtyTracker};
pub use hash::ContentHash;
pub use pin::{Pin, PinStatus, RemotePin};
pub use policy::{EffectivePolicy, PolicyLayer};
pub use store::{Bucket, ContentStore, StoreError};
pub use sync::{EngineState, SyncEngine, SyncError, SyncResult, SyncStatus};
