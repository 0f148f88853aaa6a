//! Sync pass outcomes and the per-backend history ring.

use crate::hash::ContentHash;
use crate::pin::now_millis;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// One transfer that permanently failed within a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinFailure {
    pub hash: ContentHash,
    /// Which operation failed: push, pull, delete, or verify.
    pub op: String,
    pub error: String,
}

/// Outcome of one sync pass for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub pass_id: Uuid,
    pub backend: String,
    pub started_at: i64,
    pub ended_at: i64,
    pub pushed: Vec<ContentHash>,
    pub pulled: Vec<ContentHash>,
    pub deleted: Vec<ContentHash>,
    pub failures: Vec<PinFailure>,
    /// Quota and failover notices; never fail a pass on their own.
    pub warnings: Vec<String>,
    /// Pass-level error: backend unavailable or deadline expired.
    pub error: Option<String>,
    /// Whether this pass cleared the backend's dirty flag. `false` after
    /// a successful pass means a newer mutation raced it.
    pub dirty_cleared: bool,
}

impl SyncResult {
    #[must_use]
    pub fn begin(backend: impl Into<String>) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            backend: backend.into(),
            started_at: now_millis(),
            ended_at: 0,
            pushed: Vec::new(),
            pulled: Vec::new(),
            deleted: Vec::new(),
            failures: Vec::new(),
            warnings: Vec::new(),
            error: None,
            dirty_cleared: false,
        }
    }

    pub fn finish(&mut self) {
        self.ended_at = now_millis();
    }

    /// Zero failures and no pass-level error.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty() && self.error.is_none()
    }

    #[must_use]
    pub fn transfer_count(&self) -> usize {
        self.pushed.len() + self.pulled.len() + self.deleted.len()
    }

    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).max(0)
    }

    pub fn record_failure(&mut self, hash: ContentHash, op: &str, error: impl Into<String>) {
        self.failures.push(PinFailure {
            hash,
            op: op.to_string(),
            error: error.into(),
        });
    }
}

/// Aggregated per-backend status returned by `sync_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub dirty: bool,
    pub dirty_reason: Option<String>,
    /// End time of the most recent pass, epoch millis.
    pub last_sync: Option<i64>,
    pub last_result: Option<SyncResult>,
}

/// In-memory ring of recent sync results per backend.
pub struct SyncHistory {
    rings: RwLock<HashMap<String, VecDeque<SyncResult>>>,
    capacity: usize,
}

impl SyncHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, result: SyncResult) {
        let mut rings = self.rings.write();
        let ring = rings.entry(result.backend.clone()).or_default();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(result);
    }

    /// Recent results for a backend, newest first.
    #[must_use]
    pub fn recent(&self, backend: &str) -> Vec<SyncResult> {
        self.rings
            .read()
            .get(backend)
            .map(|ring| ring.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn latest(&self, backend: &str) -> Option<SyncResult> {
        self.rings
            .read()
            .get(backend)
            .and_then(|ring| ring.back().cloned())
    }
}
