//! Sorted byte-map abstraction backing the temporal index.
//!
//! A temporal matrix never touches storage directly: it speaks to a
//! [`SortedByteMap`], an ordered mapping from byte keys to byte values with
//! snapshot reads and atomic batch writes. Concrete backends (embedded
//! B-trees, flat files, SQL tables) live outside this crate; the bundled
//! [`MemoryByteMap`] is the in-memory reference backend used in tests and
//! benchmarks.
//!
//! # Contract
//!
//! - [`SortedByteMap::snapshot`] returns a consistent point-in-time view.
//!   Snapshots are immutable and unaffected by later commits.
//! - [`SortedByteMap::commit`] applies a [`WriteBatch`] atomically: a
//!   snapshot taken before the commit sees none of its operations, a
//!   snapshot taken after sees all of them.
//! - Writers are serialized by the caller. Readers never block writers.

pub mod memory;

pub use memory::{MemoryByteMap, MemorySnapshot};

use crate::error::Result;

/// A single operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite one key.
    Put {
        /// The key to write.
        key: Vec<u8>,
        /// The value to associate with the key.
        value: Vec<u8>,
    },
    /// Remove one key. Removing an absent key is a no-op.
    Remove {
        /// The key to remove.
        key: Vec<u8>,
    },
    /// Remove every key in the half-open range `[from, to)`.
    RemoveRange {
        /// Inclusive lower bound.
        from: Vec<u8>,
        /// Exclusive upper bound.
        to: Vec<u8>,
    },
}

/// An ordered set of map operations applied atomically by
/// [`SortedByteMap::commit`].
///
/// Operations are applied in insertion order, so a later operation on the
/// same key wins.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages an insert or overwrite.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { key, value });
    }

    /// Stages a single-key removal.
    pub fn remove(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Remove { key });
    }

    /// Stages a range removal over `[from, to)`.
    pub fn remove_range(&mut self, from: Vec<u8>, to: Vec<u8>) {
        self.ops.push(BatchOp::RemoveRange { from, to });
    }

    /// Returns true if no operations are staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns the number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Consumes the batch and returns its operations in staging order.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// A consistent point-in-time view of a sorted byte-map.
///
/// All seeks are `O(log n)` point probes. Stepping cursors are built from
/// [`seek_higher`](MapSnapshot::seek_higher) /
/// [`seek_lower`](MapSnapshot::seek_lower), which keeps every iterator in
/// the layers above restartable from a plain byte-key position.
pub trait MapSnapshot: Clone + Send + Sync + 'static {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Returns the greatest entry with key `<=` the probe.
    fn seek_floor(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)>;

    /// Returns the least entry with key `>=` the probe.
    fn seek_ceiling(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)>;

    /// Returns the least entry with key strictly greater than the probe.
    fn seek_higher(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)>;

    /// Returns the greatest entry with key strictly less than the probe.
    fn seek_lower(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)>;

    /// Returns the number of entries in this snapshot.
    fn len(&self) -> usize;

    /// Returns true if this snapshot holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A sorted byte-map with snapshot reads and atomic batch writes.
pub trait SortedByteMap: Send + Sync + 'static {
    /// The snapshot type handed to readers.
    type Snapshot: MapSnapshot;

    /// Returns a consistent view of the current map contents.
    fn snapshot(&self) -> Self::Snapshot;

    /// Applies `batch` atomically.
    ///
    /// On error, no operation from the batch is visible to any snapshot.
    fn commit(&self, batch: WriteBatch) -> Result<()>;
}

impl<T: SortedByteMap> SortedByteMap for std::sync::Arc<T> {
    type Snapshot = T::Snapshot;

    fn snapshot(&self) -> T::Snapshot {
        (**self).snapshot()
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        (**self).commit(batch)
    }
}
