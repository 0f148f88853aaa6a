// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable state layer backed by SQLite.
//!
//! Holds everything that must survive a restart: the bucket registry,
//! pin metadata, VFS path bindings, the dirty-state journal, and a ring
//! buffer of recent sync results. Every mutation is a single SQL
//! statement or transaction, so a crash between two writes can never
//! leave the dirty-state table claiming "clean" while mutations are
//! un-synced.
//!
//! ```sql
//! CREATE TABLE dirty_state (
//!     backend   TEXT PRIMARY KEY,
//!     is_dirty  INTEGER NOT NULL,
//!     reason    TEXT NOT NULL,
//!     marked_at INTEGER NOT NULL   -- epoch millis of the last mark
//! );
//! ```
//!
//! The conditional dirty-clear (`clear_dirty_if`) is a compare-and-set
//! against `marked_at`: a mark that lands after a sync pass started
//! makes the clear a no-op.

use super::bucket::Bucket;
use super::StoreError;
use crate::dirty::DirtyRecord;
use crate::hash::ContentHash;
use crate::pin::{Pin, PinStatus};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};

/// Durable store for index and journal records.
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (or create) the state database at the given path.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = format!("sqlite://{}?mode=rwc", path);
        info!(path, "Opening state store");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&url)
            .await?;

        // WAL keeps concurrent readers cheap; NORMAL is durable enough
        // with WAL since the journal is replayed on crash recovery.
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory state store. A single connection, because every SQLite
    /// `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS buckets (
                name     TEXT PRIMARY KEY,
                config   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pins (
                hash        TEXT PRIMARY KEY,
                bucket      TEXT NOT NULL,
                path        TEXT NOT NULL,
                size        INTEGER NOT NULL,
                status      TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                metadata    TEXT NOT NULL,
                backend_set TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vfs (
                bucket TEXT NOT NULL,
                path   TEXT NOT NULL,
                hash   TEXT NOT NULL,
                size   INTEGER NOT NULL,
                PRIMARY KEY (bucket, path)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dirty_state (
                backend   TEXT PRIMARY KEY,
                is_dirty  INTEGER NOT NULL,
                reason    TEXT NOT NULL,
                marked_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_history (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                backend  TEXT NOT NULL,
                result   TEXT NOT NULL,
                ended_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // --- Buckets ---

    pub async fn upsert_bucket(&self, bucket: &Bucket) -> Result<(), StoreError> {
        let config = serde_json::to_string(bucket)
            .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO buckets (name, config) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET config = excluded.config
            "#,
        )
        .bind(&bucket.name)
        .bind(&config)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_bucket(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_buckets(&self) -> Result<Vec<Bucket>, StoreError> {
        let rows = sqlx::query("SELECT config FROM buckets")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let config: String = row.try_get("config")?;
                serde_json::from_str(&config).map_err(|e| StoreError::CorruptRecord(e.to_string()))
            })
            .collect()
    }

    // --- Pins ---

    pub async fn upsert_pin(&self, pin: &Pin) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&pin.metadata)
            .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;
        let backend_set = serde_json::to_string(&pin.backend_set)
            .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;
        let status = serde_json::to_string(&pin.status)
            .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO pins (hash, bucket, path, size, status, created_at, metadata, backend_set)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(hash) DO UPDATE SET
                bucket = excluded.bucket,
                path = excluded.path,
                size = excluded.size,
                status = excluded.status,
                metadata = excluded.metadata,
                backend_set = excluded.backend_set
            "#,
        )
        .bind(pin.hash.to_string())
        .bind(&pin.bucket)
        .bind(&pin.path)
        .bind(pin.size as i64)
        .bind(&status)
        .bind(pin.created_at)
        .bind(&metadata)
        .bind(&backend_set)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_pin(&self, hash: &ContentHash) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pins WHERE hash = ?")
            .bind(hash.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_pins(&self) -> Result<Vec<Pin>, StoreError> {
        let rows = sqlx::query(
            "SELECT hash, bucket, path, size, status, created_at, metadata, backend_set FROM pins",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let hash_str: String = row.try_get("hash")?;
                let hash: ContentHash = hash_str
                    .parse()
                    .map_err(|e| StoreError::CorruptRecord(format!("pin hash: {}", e)))?;
                let status_str: String = row.try_get("status")?;
                let status: PinStatus = serde_json::from_str(&status_str)
                    .map_err(|e| StoreError::CorruptRecord(format!("pin status: {}", e)))?;
                let metadata_str: String = row.try_get("metadata")?;
                let backend_set_str: String = row.try_get("backend_set")?;
                let size: i64 = row.try_get("size")?;

                Ok(Pin {
                    hash,
                    bucket: row.try_get("bucket")?,
                    path: row.try_get("path")?,
                    size: size as u64,
                    status,
                    created_at: row.try_get("created_at")?,
                    metadata: serde_json::from_str(&metadata_str)
                        .map_err(|e| StoreError::CorruptRecord(format!("pin metadata: {}", e)))?,
                    backend_set: serde_json::from_str(&backend_set_str)
                        .map_err(|e| StoreError::CorruptRecord(format!("backend_set: {}", e)))?,
                })
            })
            .collect()
    }

    // --- VFS bindings ---

    pub async fn bind_path(
        &self,
        bucket: &str,
        path: &str,
        hash: &ContentHash,
        size: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO vfs (bucket, path, hash, size) VALUES (?, ?, ?, ?)
            ON CONFLICT(bucket, path) DO UPDATE SET
                hash = excluded.hash,
                size = excluded.size
            "#,
        )
        .bind(bucket)
        .bind(path)
        .bind(hash.to_string())
        .bind(size as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unbind_path(&self, bucket: &str, path: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM vfs WHERE bucket = ? AND path = ?")
            .bind(bucket)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_bucket_paths(&self, bucket: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM vfs WHERE bucket = ?")
            .bind(bucket)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All persisted path bindings: (bucket, path, hash, size).
    pub async fn load_paths(&self) -> Result<Vec<(String, String, ContentHash, u64)>, StoreError> {
        let rows = sqlx::query("SELECT bucket, path, hash, size FROM vfs")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let hash_str: String = row.try_get("hash")?;
                let hash: ContentHash = hash_str
                    .parse()
                    .map_err(|e| StoreError::CorruptRecord(format!("vfs hash: {}", e)))?;
                let size: i64 = row.try_get("size")?;
                Ok((
                    row.try_get("bucket")?,
                    row.try_get("path")?,
                    hash,
                    size as u64,
                ))
            })
            .collect()
    }

    // --- Dirty journal ---

    /// Persist a dirty record (mark or explicit clear result).
    pub async fn write_dirty(&self, record: &DirtyRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO dirty_state (backend, is_dirty, reason, marked_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(backend) DO UPDATE SET
                is_dirty = excluded.is_dirty,
                reason = excluded.reason,
                marked_at = excluded.marked_at
            "#,
        )
        .bind(&record.backend)
        .bind(i64::from(record.dirty))
        .bind(&record.reason)
        .bind(record.marked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Conditionally clear a backend's dirty flag: only rows whose
    /// `marked_at` is at or before `since` are cleared. Returns whether
    /// the clear took effect.
    pub async fn clear_dirty_if(&self, backend: &str, since: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dirty_state SET is_dirty = 0
            WHERE backend = ? AND is_dirty = 1 AND marked_at <= ?
            "#,
        )
        .bind(backend)
        .bind(since)
        .execute(&self.pool)
        .await?;

        let cleared = result.rows_affected() > 0;
        debug!(backend, since, cleared, "Conditional dirty clear");
        Ok(cleared)
    }

    pub async fn load_dirty(&self) -> Result<Vec<DirtyRecord>, StoreError> {
        let rows = sqlx::query("SELECT backend, is_dirty, reason, marked_at FROM dirty_state")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let is_dirty: i64 = row.try_get("is_dirty")?;
                Ok(DirtyRecord {
                    backend: row.try_get("backend")?,
                    dirty: is_dirty != 0,
                    reason: row.try_get("reason")?,
                    marked_at: row.try_get("marked_at")?,
                })
            })
            .collect()
    }

    // --- Sync history ---

    /// Append a serialized sync result, trimming the ring to `capacity`
    /// entries per backend.
    pub async fn append_history(
        &self,
        backend: &str,
        result_json: &str,
        ended_at: i64,
        capacity: usize,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO sync_history (backend, result, ended_at) VALUES (?, ?, ?)")
            .bind(backend)
            .bind(result_json)
            .bind(ended_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            DELETE FROM sync_history
            WHERE backend = ? AND id NOT IN (
                SELECT id FROM sync_history WHERE backend = ?
                ORDER BY id DESC LIMIT ?
            )
            "#,
        )
        .bind(backend)
        .bind(backend)
        .bind(capacity as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Most recent serialized sync results for a backend, newest first.
    pub async fn load_history(&self, backend: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT result FROM sync_history WHERE backend = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(backend)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get("result").map_err(StoreError::from))
            .collect()
    }
}
