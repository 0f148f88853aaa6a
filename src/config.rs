//! Configuration for the pin sync engine.
//!
//! # Example
//!
//! ```
//! use pinsync::PinSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = PinSyncConfig::default();
//! assert_eq!(config.max_sync_parallelism, 4);
//!
//! // Full config
//! let config = PinSyncConfig {
//!     state_path: Some("/var/lib/pinsync/state.db".into()),
//!     max_sync_parallelism: 8,
//!     sync_deadline_secs: 120,
//!     ..Default::default()
//! };
//! ```

use crate::policy::PolicyLayer;
use serde::Deserialize;

/// Configuration for the sync engine.
///
/// All fields have sensible defaults. For production use, configure
/// `state_path` so the index and dirty journal survive restarts.
#[derive(Debug, Clone, Deserialize)]
pub struct PinSyncConfig {
    /// SQLite file holding the durable index, dirty journal, and sync
    /// history. `None` uses an in-memory database (tests only - dirty
    /// state will not survive a restart).
    #[serde(default)]
    pub state_path: Option<String>,

    /// Maximum number of backend sync passes running concurrently.
    #[serde(default = "default_max_sync_parallelism")]
    pub max_sync_parallelism: usize,

    /// Overall deadline for one backend's sync pass, in seconds.
    /// An expired pass counts as a failure for dirty-clear purposes.
    #[serde(default = "default_sync_deadline_secs")]
    pub sync_deadline_secs: u64,

    /// Sync results retained per backend for observability.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Transfer retry settings (bounded exponential backoff).
    #[serde(default = "default_transfer_retry_max")]
    pub transfer_retry_max: usize,
    #[serde(default = "default_transfer_retry_initial_ms")]
    pub transfer_retry_initial_ms: u64,
    #[serde(default = "default_transfer_retry_max_ms")]
    pub transfer_retry_max_ms: u64,

    /// Access count at which a pin becomes a promotion candidate.
    #[serde(default = "default_promote_access_threshold")]
    pub promote_access_threshold: u64,

    /// Idle seconds after which a pin becomes a demotion candidate.
    #[serde(default = "default_demote_idle_secs")]
    pub demote_idle_secs: u64,

    /// Region this deployment runs in; used by `GeoMode::Local`.
    #[serde(default)]
    pub local_region: Option<String>,

    /// Global policy layer (lowest precedence).
    #[serde(default)]
    pub global_policy: PolicyLayer,
}

fn default_max_sync_parallelism() -> usize {
    4
}
fn default_sync_deadline_secs() -> u64 {
    300
}
fn default_history_capacity() -> usize {
    32
}
fn default_transfer_retry_max() -> usize {
    3
}
fn default_transfer_retry_initial_ms() -> u64 {
    100
}
fn default_transfer_retry_max_ms() -> u64 {
    5_000
}
fn default_promote_access_threshold() -> u64 {
    10
}
fn default_demote_idle_secs() -> u64 {
    86_400
}

impl Default for PinSyncConfig {
    fn default() -> Self {
        Self {
            state_path: None,
            max_sync_parallelism: default_max_sync_parallelism(),
            sync_deadline_secs: default_sync_deadline_secs(),
            history_capacity: default_history_capacity(),
            transfer_retry_max: default_transfer_retry_max(),
            transfer_retry_initial_ms: default_transfer_retry_initial_ms(),
            transfer_retry_max_ms: default_transfer_retry_max_ms(),
            promote_access_threshold: default_promote_access_threshold(),
            demote_idle_secs: default_demote_idle_secs(),
            local_region: None,
            global_policy: PolicyLayer::default(),
        }
    }
}
