//! Per-bucket virtual filesystem index.
//!
//! Maps human-readable virtual paths to content hashes, with a reverse
//! index (hash -> paths) used for dedup and orphan detection. Derived
//! from the content store; a path is unique within its bucket at any
//! point in time, and renames are delete+create at this level.

use crate::hash::ContentHash;
use dashmap::DashMap;
use std::collections::BTreeSet;

/// One path binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsEntry {
    pub hash: ContentHash,
    pub size: u64,
}

/// In-memory VFS index. Durability is handled by the content store
/// writing through to the state layer; this structure only answers
/// lookups.
#[derive(Default)]
pub struct VfsIndex {
    /// bucket -> (path -> entry)
    paths: DashMap<String, DashMap<String, VfsEntry>>,
    /// hash -> set of (bucket, path)
    reverse: DashMap<ContentHash, BTreeSet<(String, String)>>,
}

impl VfsIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a path to a hash, returning the previous entry if the path
    /// was already bound (rename-over semantics: the old binding is gone).
    pub fn bind(&self, bucket: &str, path: &str, hash: ContentHash, size: u64) -> Option<VfsEntry> {
        let bucket_paths = self
            .paths
            .entry(bucket.to_string())
            .or_default();
        let previous = bucket_paths.insert(path.to_string(), VfsEntry { hash, size });
        drop(bucket_paths);

        if let Some(ref old) = previous {
            if old.hash != hash {
                self.drop_reverse(&old.hash, bucket, path);
            }
        }
        self.reverse
            .entry(hash)
            .or_default()
            .insert((bucket.to_string(), path.to_string()));
        previous
    }

    /// Remove a path binding.
    pub fn unbind(&self, bucket: &str, path: &str) -> Option<VfsEntry> {
        let removed = self
            .paths
            .get(bucket)
            .and_then(|bucket_paths| bucket_paths.remove(path).map(|(_, e)| e));
        if let Some(ref entry) = removed {
            self.drop_reverse(&entry.hash, bucket, path);
        }
        removed
    }

    fn drop_reverse(&self, hash: &ContentHash, bucket: &str, path: &str) {
        if let Some(mut set) = self.reverse.get_mut(hash) {
            set.remove(&(bucket.to_string(), path.to_string()));
            let empty = set.is_empty();
            drop(set);
            if empty {
                self.reverse.remove_if(hash, |_, s| s.is_empty());
            }
        }
    }

    #[must_use]
    pub fn resolve(&self, bucket: &str, path: &str) -> Option<VfsEntry> {
        self.paths
            .get(bucket)?
            .get(path)
            .map(|r| r.value().clone())
    }

    /// All path bindings in a bucket.
    #[must_use]
    pub fn list(&self, bucket: &str) -> Vec<(String, VfsEntry)> {
        self.paths
            .get(bucket)
            .map(|bucket_paths| {
                bucket_paths
                    .iter()
                    .map(|r| (r.key().clone(), r.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All (bucket, path) pairs referencing a hash. Backs dedup and
    /// orphan detection.
    #[must_use]
    pub fn paths_for(&self, hash: &ContentHash) -> Vec<(String, String)> {
        self.reverse
            .get(hash)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of path bindings referencing a hash.
    #[must_use]
    pub fn ref_count(&self, hash: &ContentHash) -> usize {
        self.reverse.get(hash).map(|set| set.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn bucket_len(&self, bucket: &str) -> usize {
        self.paths.get(bucket).map(|p| p.len()).unwrap_or(0)
    }

    /// Drop every binding for a bucket (cascade delete).
    pub fn clear_bucket(&self, bucket: &str) {
        if let Some((_, bucket_paths)) = self.paths.remove(bucket) {
            for entry in bucket_paths.iter() {
                self.drop_reverse(&entry.value().hash, bucket, entry.key());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> ContentHash {
        ContentHash::of(s.as_bytes())
    }

    #[test]
    fn test_bind_and_resolve() {
        let vfs = VfsIndex::new();
        assert!(vfs.bind("docs", "/a.txt", h("a"), 100).is_none());

        let entry = vfs.resolve("docs", "/a.txt").unwrap();
        assert_eq!(entry.hash, h("a"));
        assert_eq!(entry.size, 100);
    }

    #[test]
    fn test_path_unique_within_bucket() {
        let vfs = VfsIndex::new();
        vfs.bind("docs", "/a.txt", h("v1"), 10);
        let previous = vfs.bind("docs", "/a.txt", h("v2"), 20).unwrap();

        assert_eq!(previous.hash, h("v1"));
        assert_eq!(vfs.resolve("docs", "/a.txt").unwrap().hash, h("v2"));
        assert_eq!(vfs.bucket_len("docs"), 1);
        // Old hash no longer referenced by this path
        assert_eq!(vfs.ref_count(&h("v1")), 0);
    }

    #[test]
    fn test_same_path_different_buckets() {
        let vfs = VfsIndex::new();
        vfs.bind("a", "/file", h("one"), 1);
        vfs.bind("b", "/file", h("two"), 2);

        assert_eq!(vfs.resolve("a", "/file").unwrap().hash, h("one"));
        assert_eq!(vfs.resolve("b", "/file").unwrap().hash, h("two"));
    }

    #[test]
    fn test_reverse_index_tracks_dedup() {
        let vfs = VfsIndex::new();
        vfs.bind("docs", "/a.txt", h("shared"), 5);
        vfs.bind("docs", "/copy.txt", h("shared"), 5);
        vfs.bind("backup", "/a.txt", h("shared"), 5);

        let mut paths = vfs.paths_for(&h("shared"));
        paths.sort();
        assert_eq!(paths.len(), 3);
        assert_eq!(vfs.ref_count(&h("shared")), 3);

        vfs.unbind("docs", "/copy.txt");
        assert_eq!(vfs.ref_count(&h("shared")), 2);
    }

    #[test]
    fn test_unbind_missing_returns_none() {
        let vfs = VfsIndex::new();
        assert!(vfs.unbind("docs", "/ghost").is_none());
    }

    #[test]
    fn test_unbind_last_reference_clears_reverse() {
        let vfs = VfsIndex::new();
        vfs.bind("docs", "/only.txt", h("solo"), 1);
        vfs.unbind("docs", "/only.txt");

        assert_eq!(vfs.ref_count(&h("solo")), 0);
        assert!(vfs.paths_for(&h("solo")).is_empty());
    }

    #[test]
    fn test_list_bucket() {
        let vfs = VfsIndex::new();
        vfs.bind("docs", "/a", h("a"), 1);
        vfs.bind("docs", "/b", h("b"), 2);

        let mut listing = vfs.list("docs");
        listing.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].0, "/a");
        assert!(vfs.list("empty").is_empty());
    }

    #[test]
    fn test_clear_bucket() {
        let vfs = VfsIndex::new();
        vfs.bind("docs", "/a", h("a"), 1);
        vfs.bind("docs", "/b", h("b"), 2);
        vfs.bind("other", "/c", h("a"), 1);

        vfs.clear_bucket("docs");

        assert_eq!(vfs.bucket_len("docs"), 0);
        // Hash still referenced from the other bucket
        assert_eq!(vfs.ref_count(&h("a")), 1);
        assert_eq!(vfs.ref_count(&h("b")), 0);
    }
}
