// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pure diff between the local index and one backend's remote listing.
//!
//! No I/O happens here: the engine snapshots its inputs (wanted pins,
//! full pin index, remote listing, locally held objects) and the diff is
//! a deterministic function of those snapshots.

use crate::hash::ContentHash;
use crate::pin::{Pin, RemotePin};
use std::collections::{HashMap, HashSet};

/// Transfer plan for one backend's sync pass.
#[derive(Debug, Default, Clone)]
pub struct SyncDiff {
    /// Active pins that belong on the backend but are absent or stale.
    pub to_push: Vec<Pin>,
    /// Remote objects whose pin is active locally but whose bytes are
    /// missing from the local object store.
    pub to_pull: Vec<RemotePin>,
    /// Remote objects whose local pin is tombstoned.
    pub to_delete: Vec<RemotePin>,
}

impl SyncDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_push.is_empty() && self.to_pull.is_empty() && self.to_delete.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.to_push.len() + self.to_pull.len() + self.to_delete.len()
    }
}

/// Compute the transfer plan for one backend.
///
/// `wanted` is the set of pins the replication plan places on this
/// backend. `index` is the full local pin table (tombstoned pins
/// included). `local_objects` is the set of hashes whose bytes the local
/// object store holds. Remote objects unknown to the index are left
/// alone: content this deployment never pinned is not ours to manage.
#[must_use]
pub fn compute(
    wanted: &[Pin],
    index: &HashMap<ContentHash, Pin>,
    remote: &[RemotePin],
    local_objects: &HashSet<ContentHash>,
) -> SyncDiff {
    let remote_by_hash: HashMap<ContentHash, &RemotePin> =
        remote.iter().map(|r| (r.hash, r)).collect();

    let mut diff = SyncDiff::default();

    for pin in wanted.iter().filter(|p| p.is_active()) {
        match remote_by_hash.get(&pin.hash) {
            // Size disagreement means the remote copy is stale or
            // truncated; re-push and let digest verification decide.
            Some(existing) if existing.size == pin.size => {}
            _ => diff.to_push.push(pin.clone()),
        }
    }

    for remote_pin in remote {
        match index.get(&remote_pin.hash) {
            Some(pin) if pin.is_tombstoned() => diff.to_delete.push(remote_pin.clone()),
            Some(pin) if pin.is_active() && !local_objects.contains(&remote_pin.hash) => {
                diff.to_pull.push(remote_pin.clone());
            }
            _ => {}
        }
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::PinStatus;
    use serde_json::Value;

    fn pin(path: &str, size: u64) -> Pin {
        Pin::new(
            ContentHash::of(path.as_bytes()),
            "docs".into(),
            path.into(),
            size,
            Value::Null,
        )
    }

    fn remote(pin: &Pin) -> RemotePin {
        RemotePin {
            hash: pin.hash,
            path: format!("docs{}", pin.path),
            size: pin.size,
        }
    }

    fn index_of(pins: &[Pin]) -> HashMap<ContentHash, Pin> {
        pins.iter().map(|p| (p.hash, p.clone())).collect()
    }

    #[test]
    fn test_missing_remote_is_pushed() {
        let a = pin("/a", 10);
        let diff = compute(
            std::slice::from_ref(&a),
            &index_of(std::slice::from_ref(&a)),
            &[],
            &HashSet::from([a.hash]),
        );

        assert_eq!(diff.to_push.len(), 1);
        assert_eq!(diff.to_push[0].hash, a.hash);
        assert!(diff.to_pull.is_empty());
        assert!(diff.to_delete.is_empty());
    }

    #[test]
    fn test_matching_remote_is_no_op() {
        let a = pin("/a", 10);
        let diff = compute(
            std::slice::from_ref(&a),
            &index_of(std::slice::from_ref(&a)),
            &[remote(&a)],
            &HashSet::from([a.hash]),
        );
        assert!(diff.is_empty());
    }

    #[test]
    fn test_stale_size_is_repushed() {
        let a = pin("/a", 10);
        let mut truncated = remote(&a);
        truncated.size = 4;

        let diff = compute(
            std::slice::from_ref(&a),
            &index_of(std::slice::from_ref(&a)),
            &[truncated],
            &HashSet::from([a.hash]),
        );
        assert_eq!(diff.to_push.len(), 1);
    }

    #[test]
    fn test_tombstoned_pin_is_deleted_remotely() {
        let mut a = pin("/a", 10);
        a.status = PinStatus::Removed;
        let listing = remote(&a);

        let diff = compute(
            &[],
            &index_of(std::slice::from_ref(&a)),
            &[listing],
            &HashSet::new(),
        );
        assert_eq!(diff.to_delete.len(), 1);
        assert_eq!(diff.to_delete[0].hash, a.hash);
        assert!(diff.to_push.is_empty());
    }

    #[test]
    fn test_locally_missing_bytes_are_pulled() {
        let a = pin("/a", 10);
        let listing = remote(&a);

        // Pin is active in the index, bytes absent locally.
        let diff = compute(
            &[],
            &index_of(std::slice::from_ref(&a)),
            &[listing],
            &HashSet::new(),
        );
        assert_eq!(diff.to_pull.len(), 1);
        assert_eq!(diff.to_pull[0].hash, a.hash);
    }

    #[test]
    fn test_foreign_remote_objects_are_ignored() {
        let foreign = RemotePin {
            hash: ContentHash::of(b"someone elses data"),
            path: "other/x".to_string(),
            size: 3,
        };

        let diff = compute(&[], &HashMap::new(), &[foreign], &HashSet::new());
        assert!(diff.is_empty());
    }

    #[test]
    fn test_tombstoned_wanted_pin_is_not_pushed() {
        let mut a = pin("/a", 10);
        a.status = PinStatus::Removed;

        let diff = compute(
            std::slice::from_ref(&a),
            &index_of(std::slice::from_ref(&a)),
            &[],
            &HashSet::new(),
        );
        assert!(diff.to_push.is_empty());
    }

    #[test]
    fn test_mixed_plan() {
        let keep = pin("/keep", 5);
        let push = pin("/push", 6);
        let mut gone = pin("/gone", 7);
        gone.status = PinStatus::Removed;

        let index = index_of(&[keep.clone(), push.clone(), gone.clone()]);
        let remote_listing = vec![remote(&keep), remote(&gone)];
        let local_objects = HashSet::from([keep.hash, push.hash]);

        let diff = compute(
            &[keep.clone(), push.clone()],
            &index,
            &remote_listing,
            &local_objects,
        );

        assert_eq!(diff.to_push.len(), 1);
        assert_eq!(diff.to_push[0].hash, push.hash);
        assert_eq!(diff.to_delete.len(), 1);
        assert_eq!(diff.to_delete[0].hash, gone.hash);
        assert!(diff.to_pull.is_empty());
        assert_eq!(diff.len(), 2);
    }
}
