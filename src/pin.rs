//! Pin metadata.
//!
//! A [`Pin`] is one logical, content-addressed object tracked by the local
//! index, with zero or more backend replicas. Pins are created on ingest,
//! have their replica membership mutated by the sync engine, and are
//! tombstoned (never hard-deleted in place) on removal so backends can be
//! told to delete their copies first.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Lifecycle status of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinStatus {
    /// Live object, replicated per policy.
    Active,
    /// Tombstoned; backends still holding a replica get a delete on the
    /// next sync pass, after which the pin is garbage collected.
    Removed,
    /// Digest verification failed on every known replica.
    Corrupted,
}

impl std::fmt::Display for PinStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Removed => write!(f, "removed"),
            Self::Corrupted => write!(f, "corrupted"),
        }
    }
}

/// One logical object in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pin {
    /// Content digest; immutable, equals the digest of the referenced bytes.
    pub hash: ContentHash,
    /// Owning bucket.
    pub bucket: String,
    /// Primary virtual path within the bucket. Additional paths created by
    /// deduplicating puts live only in the VFS index.
    pub path: String,
    /// Object size in bytes as reported at ingest.
    pub size: u64,
    pub status: PinStatus,
    /// Creation time, epoch millis.
    pub created_at: i64,
    /// Free-form metadata supplied at ingest.
    #[serde(default)]
    pub metadata: Value,
    /// Names of backends currently holding a verified replica.
    #[serde(default)]
    pub backend_set: BTreeSet<String>,
}

impl Pin {
    /// Create a new active pin with no replicas yet.
    #[must_use]
    pub fn new(hash: ContentHash, bucket: String, path: String, size: u64, metadata: Value) -> Self {
        Self {
            hash,
            bucket,
            path,
            size,
            status: PinStatus::Active,
            created_at: now_millis(),
            metadata,
            backend_set: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == PinStatus::Active
    }

    #[must_use]
    pub fn is_tombstoned(&self) -> bool {
        self.status == PinStatus::Removed
    }

    /// Number of backends currently holding a replica.
    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.backend_set.len()
    }

    #[must_use]
    pub fn has_replica_on(&self, backend: &str) -> bool {
        self.backend_set.contains(backend)
    }
}

/// One object as reported by a backend's listing.
///
/// This is the unit returned by `BackendAdapter::list_pins`; it carries
/// only what the diff needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePin {
    pub hash: ContentHash,
    pub path: String,
    pub size: u64,
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
