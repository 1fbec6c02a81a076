//! In-memory MVCC implementation of the sorted byte-map.
//!
//! [`MemoryByteMap`] keeps its contents in an immutable `BTreeMap` behind an
//! `Arc`. A commit clones the current version, applies the batch, and swaps
//! the new version in under a brief exclusive lock (append-and-swap). A
//! snapshot is a clone of the `Arc`: taking one is cheap, and the view it
//! pins can never change underneath a reader.
//!
//! Writer/writer coordination is the caller's job; concurrent commits would
//! lose updates. Readers never block and are never blocked.

use crate::bytemap::{BatchOp, MapSnapshot, SortedByteMap, WriteBatch};
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Arc;

type Version = Arc<BTreeMap<Vec<u8>, Vec<u8>>>;

/// An in-memory sorted byte-map with copy-on-write versioning.
#[derive(Debug, Default)]
pub struct MemoryByteMap {
    current: RwLock<Version>,
}

impl MemoryByteMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SortedByteMap for MemoryByteMap {
    type Snapshot = MemorySnapshot;

    fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            view: Arc::clone(&self.current.read()),
        }
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut next = (**self.current.read()).clone();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    next.insert(key, value);
                }
                BatchOp::Remove { key } => {
                    next.remove(&key);
                }
                BatchOp::RemoveRange { from, to } => {
                    // BTreeMap has no drain-by-range; collect the doomed keys first.
                    let doomed: Vec<Vec<u8>> = next
                        .range::<[u8], _>((Included(from.as_slice()), Excluded(to.as_slice())))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        next.remove(&key);
                    }
                }
            }
        }
        *self.current.write() = Arc::new(next);
        Ok(())
    }
}

/// A pinned, immutable view of a [`MemoryByteMap`] version.
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    view: Version,
}

impl MapSnapshot for MemorySnapshot {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.view.get(key).cloned()
    }

    fn seek_floor(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.view
            .range::<[u8], _>((Unbounded, Included(key)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn seek_ceiling(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.view
            .range::<[u8], _>((Included(key), Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn seek_higher(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.view
            .range::<[u8], _>((Excluded(key), Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn seek_lower(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.view
            .range::<[u8], _>((Unbounded, Excluded(key)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn len(&self) -> usize {
        self.view.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(k: &str, v: &str) -> (Vec<u8>, Vec<u8>) {
        (k.as_bytes().to_vec(), v.as_bytes().to_vec())
    }

    fn populated() -> MemoryByteMap {
        let map = MemoryByteMap::new();
        let mut batch = WriteBatch::new();
        for (k, v) in [kv("b", "1"), kv("d", "2"), kv("f", "3")] {
            batch.put(k, v);
        }
        map.commit(batch).unwrap();
        map
    }

    #[test]
    fn test_get_and_seeks() {
        let snap = populated().snapshot();

        assert_eq!(snap.get(b"d"), Some(b"2".to_vec()));
        assert_eq!(snap.get(b"c"), None);

        assert_eq!(snap.seek_floor(b"c").unwrap().0, b"b".to_vec());
        assert_eq!(snap.seek_floor(b"d").unwrap().0, b"d".to_vec());
        assert_eq!(snap.seek_floor(b"a"), None);

        assert_eq!(snap.seek_ceiling(b"c").unwrap().0, b"d".to_vec());
        assert_eq!(snap.seek_ceiling(b"d").unwrap().0, b"d".to_vec());
        assert_eq!(snap.seek_ceiling(b"g"), None);

        assert_eq!(snap.seek_higher(b"d").unwrap().0, b"f".to_vec());
        assert_eq!(snap.seek_lower(b"d").unwrap().0, b"b".to_vec());
    }

    #[test]
    fn test_snapshot_isolation() {
        let map = populated();
        let before = map.snapshot();

        let mut batch = WriteBatch::new();
        batch.put(b"z".to_vec(), b"9".to_vec());
        batch.remove(b"b".to_vec());
        map.commit(batch).unwrap();

        // The old snapshot is pinned to the version it was taken from.
        assert_eq!(before.get(b"b"), Some(b"1".to_vec()));
        assert_eq!(before.get(b"z"), None);
        assert_eq!(before.len(), 3);

        let after = map.snapshot();
        assert_eq!(after.get(b"b"), None);
        assert_eq!(after.get(b"z"), Some(b"9".to_vec()));
    }

    #[test]
    fn test_batch_is_atomic_and_ordered() {
        let map = MemoryByteMap::new();
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"first".to_vec());
        batch.put(b"k".to_vec(), b"second".to_vec());
        batch.remove(b"missing".to_vec());
        map.commit(batch).unwrap();

        // Later operations on the same key win.
        assert_eq!(map.snapshot().get(b"k"), Some(b"second".to_vec()));
    }

    #[test]
    fn test_remove_range_half_open() {
        let map = populated();
        let mut batch = WriteBatch::new();
        batch.remove_range(b"b".to_vec(), b"f".to_vec());
        map.commit(batch).unwrap();

        let snap = map.snapshot();
        assert_eq!(snap.get(b"b"), None);
        assert_eq!(snap.get(b"d"), None);
        // Upper bound is exclusive.
        assert_eq!(snap.get(b"f"), Some(b"3".to_vec()));
    }

    #[test]
    fn test_empty_commit_keeps_version() {
        let map = populated();
        let before = map.snapshot();
        map.commit(WriteBatch::new()).unwrap();
        let after = map.snapshot();
        assert!(Arc::ptr_eq(&before.view, &after.view));
    }
}
