//! Temporal data matrices: full-history storage for one keyspace.
//!
//! A matrix holds every version of every key in a single keyspace. It can
//! be pictured as a plane spanned by user keys and timestamps:
//!
//! ```text
//!    K
//!    ^
//!    |
//!    +----+----+----+----+----+
//!  c |    | V2 |    |    |    |
//!    +----+----+----+----+----+
//!  b |    |    | V4 |    |  X |
//!    +----+----+----+----+----+
//!  a | V1 |    | V3 |    |    |
//!    +----+----+----+----+----+---> T
//!       1    2    3    4    5
//! ```
//!
//! Each entry is valid from the timestamp it was written at (inclusive) up
//! to the next entry on the same key (exclusive); the latest entry of a key
//! is valid forever. Deletions are explicit tombstone entries (`X` above),
//! never the absence of an entry, so reads at any timestamp reduce to a
//! floor seek: the effective value of `a` at `T = 4` is `V3`.
//!
//! [`TemporalMatrix`] implements this model over any [`SortedByteMap`]
//! backend, with the record layout documented in [`encoding`].

pub mod encoding;
mod index;
pub mod iter;

use crate::bytemap::{MapSnapshot, SortedByteMap, WriteBatch};
use crate::error::{MatrixError, Result};
use crate::matrix::encoding::{
    commit_index_floor, commit_index_key, commit_index_region_end, record_key, record_value,
    MatrixMeta, META_KEY, TAG_TOMBSTONE, TAG_VALUE,
};
use crate::matrix::index::TemporalIndex;
use crate::matrix::iter::{AllEntries, AllKeys, CommitTimestamps, History, KeysAt, Modifications};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Logical commit timestamp. Non-negative for every stored entry.
pub type Timestamp = i64;

/// Sentinel returned by [`TemporalMatrix::last_commit_timestamp`] for keys
/// that were never written.
pub const NO_COMMITS: Timestamp = -1;

/// The payload of one entry: a value or an explicit deletion marker.
///
/// A tombstone is distinct from an empty byte-string value; the two are
/// encoded with different tags and compare unequal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Payload {
    /// A live value.
    Value(Vec<u8>),
    /// A deletion marker.
    Tombstone,
}

impl Payload {
    /// Returns true for deletion markers.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Payload::Tombstone)
    }

    /// Returns the value bytes, or `None` for a tombstone.
    pub fn as_value(&self) -> Option<&[u8]> {
        match self {
            Payload::Value(bytes) => Some(bytes),
            Payload::Tombstone => None,
        }
    }

    /// Consumes the payload and returns the value bytes, or `None` for a
    /// tombstone.
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Payload::Value(bytes) => Some(bytes),
            Payload::Tombstone => None,
        }
    }
}

/// One stored `(user_key, timestamp, payload)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemporalEntry {
    /// The user key. Never empty.
    pub key: String,
    /// The commit timestamp. Never negative.
    pub timestamp: Timestamp,
    /// The stored payload.
    pub payload: Payload,
}

impl TemporalEntry {
    /// Creates an entry.
    pub fn new(key: impl Into<String>, timestamp: Timestamp, payload: Payload) -> Self {
        Self {
            key: key.into(),
            timestamp,
            payload,
        }
    }
}

/// A `(user_key, timestamp)` coordinate in the matrix.
///
/// Ordered by `(timestamp, user_key)`, the order in which modification
/// scans enumerate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemporalKey {
    /// The user key.
    pub key: String,
    /// The commit timestamp.
    pub timestamp: Timestamp,
}

impl Ord for TemporalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.timestamp, &self.key).cmp(&(other.timestamp, &other.key))
    }
}

impl PartialOrd for TemporalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The half-open timestamp interval `[lower, upper)` during which one
/// entry is the floor entry of its key.
///
/// An upper bound of `i64::MAX` means the entry is the latest one and the
/// period is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValidityPeriod {
    lower: Timestamp,
    upper: Timestamp,
}

impl ValidityPeriod {
    /// Creates the period `[lower, upper)`.
    pub fn new(lower: Timestamp, upper: Timestamp) -> Self {
        Self { lower, upper }
    }

    /// Creates the open-ended period `[lower, +inf)`.
    pub fn open_ended(lower: Timestamp) -> Self {
        Self {
            lower,
            upper: i64::MAX,
        }
    }

    /// The inclusive lower bound.
    pub fn lower(&self) -> Timestamp {
        self.lower
    }

    /// The exclusive upper bound.
    pub fn upper(&self) -> Timestamp {
        self.upper
    }

    /// Returns true if `timestamp` falls inside the period.
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.lower <= timestamp && timestamp < self.upper
    }

    /// Returns true if the period extends to infinity.
    pub fn is_open_ended(&self) -> bool {
        self.upper == i64::MAX
    }
}

/// The result of a ranged get: the effective value (if any) plus the
/// validity period of the floor entry that produced it.
///
/// When the floor entry is a tombstone, or when the key has no entry at
/// all, the value is `None` but the period is still meaningful: it tells
/// the caller for how long that negative answer stays correct, which makes
/// negative lookups cacheable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangedGetResult {
    payload: Option<Vec<u8>>,
    period: ValidityPeriod,
}

impl RangedGetResult {
    pub(crate) fn new(payload: Option<Vec<u8>>, period: ValidityPeriod) -> Self {
        Self { payload, period }
    }

    /// The effective value, or `None` if the key is absent.
    pub fn value(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Consumes the result and returns the effective value.
    pub fn into_value(self) -> Option<Vec<u8>> {
        self.payload
    }

    /// The validity period of the answer.
    pub fn period(&self) -> ValidityPeriod {
        self.period
    }

    /// Returns true if the key is present with a live value.
    pub fn is_hit(&self) -> bool {
        self.payload.is_some()
    }
}

/// Configuration for a temporal matrix.
///
/// Both flags must stay consistent across every open of the same keyspace;
/// flipping them on a populated byte-map leaves the derived structures out
/// of sync with the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixConfig {
    /// Maintain the timestamp-ordered commit index incrementally.
    ///
    /// With the index, modification scans over a narrow window are bounded
    /// seeks; without it they fall back to a full keyspace scan.
    pub commit_index: bool,
    /// Keep the in-memory last-commit cache.
    pub last_commit_cache: bool,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            commit_index: true,
            last_commit_cache: true,
        }
    }
}

/// Lifecycle state of a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixState {
    /// Accepting reads and writes.
    Open,
    /// Close requested; draining outstanding iterator leases, rejecting
    /// new operations.
    Closing,
    /// All leases released. A fresh matrix must be constructed to touch
    /// the keyspace again.
    Closed,
}

#[derive(Debug)]
struct LifecycleInner {
    state: MatrixState,
    leases: usize,
    degraded: bool,
}

/// Shared lifecycle tracker: state transitions plus the outstanding read
/// lease count.
#[derive(Debug)]
struct Lifecycle {
    inner: Mutex<LifecycleInner>,
}

impl Lifecycle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LifecycleInner {
                state: MatrixState::Open,
                leases: 0,
                degraded: false,
            }),
        })
    }

    fn check_open(&self) -> Result<()> {
        let inner = self.inner.lock();
        if inner.degraded {
            return Err(MatrixError::Degraded);
        }
        match inner.state {
            MatrixState::Open => Ok(()),
            _ => Err(MatrixError::Closed),
        }
    }

    fn acquire(this: &Arc<Self>) -> Result<LeaseGuard> {
        let mut inner = this.inner.lock();
        if inner.degraded {
            return Err(MatrixError::Degraded);
        }
        if inner.state != MatrixState::Open {
            return Err(MatrixError::Closed);
        }
        inner.leases += 1;
        Ok(LeaseGuard {
            lifecycle: Arc::clone(this),
        })
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        inner.leases = inner.leases.saturating_sub(1);
        if inner.leases == 0 && inner.state == MatrixState::Closing {
            inner.state = MatrixState::Closed;
        }
    }

    fn begin_close(&self) -> MatrixState {
        let mut inner = self.inner.lock();
        if inner.state == MatrixState::Open {
            inner.state = if inner.leases == 0 {
                MatrixState::Closed
            } else {
                MatrixState::Closing
            };
        }
        inner.state
    }

    fn mark_degraded(&self) {
        self.inner.lock().degraded = true;
    }

    fn state(&self) -> MatrixState {
        self.inner.lock().state
    }
}

/// A read lease on the matrix, held by every live iterator.
#[derive(Debug)]
pub(crate) struct LeaseGuard {
    lifecycle: Arc<Lifecycle>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.lifecycle.release();
    }
}

/// Full-history storage for one keyspace over a sorted byte-map.
///
/// # Concurrency
///
/// Any number of reader threads may query concurrently; a single logical
/// writer at a time may call [`put`](Self::put),
/// [`insert_entries`](Self::insert_entries) or
/// [`rollback`](Self::rollback) (writer exclusivity is coordinated by the
/// caller). Every write lands as one atomic batch on the byte-map, so a
/// reader observes either all of a commit or none of it, and iterators are
/// pinned to the snapshot current at their construction.
///
/// # Errors
///
/// Argument validation happens before any mutation; a storage failure
/// aborts the operation with no visible partial state. A failed rollback
/// marks the matrix degraded, after which every operation fails until the
/// matrix is reopened.
#[derive(Debug)]
pub struct TemporalMatrix<B: SortedByteMap> {
    backend: B,
    meta: MatrixMeta,
    config: MatrixConfig,
    /// Highest timestamp accepted so far; `creation - 1` when empty.
    last_global: AtomicI64,
    last_commit_cache: RwLock<HashMap<String, Timestamp>>,
    lifecycle: Arc<Lifecycle>,
}

impl<B: SortedByteMap> TemporalMatrix<B> {
    /// Creates a fresh matrix on `backend`, writing its metadata record.
    ///
    /// # Errors
    ///
    /// Fails with [`MatrixError::KeyspaceExists`] if the byte-map already
    /// carries a metadata record, [`MatrixError::EmptyKeyspace`] /
    /// [`MatrixError::NegativeTimestamp`] on invalid arguments.
    pub fn create(
        backend: B,
        keyspace: impl Into<String>,
        creation_timestamp: Timestamp,
        config: MatrixConfig,
    ) -> Result<Self> {
        let keyspace = keyspace.into();
        if keyspace.is_empty() {
            return Err(MatrixError::EmptyKeyspace);
        }
        if creation_timestamp < 0 {
            return Err(MatrixError::NegativeTimestamp(creation_timestamp));
        }
        if backend.snapshot().get(META_KEY).is_some() {
            return Err(MatrixError::KeyspaceExists(keyspace));
        }
        let meta = MatrixMeta {
            keyspace,
            creation_timestamp,
        };
        let mut batch = WriteBatch::new();
        batch.put(META_KEY.to_vec(), meta.to_bytes());
        backend.commit(batch)?;
        debug!(
            "Created keyspace {:?} at timestamp {}",
            meta.keyspace, meta.creation_timestamp
        );
        Ok(Self {
            backend,
            last_global: AtomicI64::new(creation_timestamp - 1),
            meta,
            config,
            last_commit_cache: RwLock::new(HashMap::new()),
            lifecycle: Lifecycle::new(),
        })
    }

    /// Opens an existing matrix, verifying its metadata record and
    /// rebuilding the high water mark from the index.
    ///
    /// # Errors
    ///
    /// Fails with [`MatrixError::MissingMetadata`] when the byte-map holds
    /// no metadata record, and with checksum or corruption errors when the
    /// record cannot be verified.
    pub fn open(backend: B, config: MatrixConfig) -> Result<Self> {
        let index = TemporalIndex::new(backend.snapshot());
        let meta_bytes = index.meta().ok_or(MatrixError::MissingMetadata)?;
        let meta = MatrixMeta::from_bytes(&meta_bytes)?;
        let last_global = index
            .max_timestamp()?
            .unwrap_or(meta.creation_timestamp - 1);
        debug!(
            "Opened keyspace {:?}: creation timestamp {}, high water mark {}",
            meta.keyspace, meta.creation_timestamp, last_global
        );
        Ok(Self {
            backend,
            meta,
            config,
            last_global: AtomicI64::new(last_global),
            last_commit_cache: RwLock::new(HashMap::new()),
            lifecycle: Lifecycle::new(),
        })
    }

    /// The name of the keyspace represented by this matrix.
    pub fn keyspace(&self) -> &str {
        &self.meta.keyspace
    }

    /// The timestamp at which this matrix was created.
    pub fn creation_timestamp(&self) -> Timestamp {
        self.meta.creation_timestamp
    }

    /// The current lifecycle state.
    pub fn state(&self) -> MatrixState {
        self.lifecycle.state()
    }

    /// Requests a close. Further operations are rejected; the matrix
    /// reaches [`MatrixState::Closed`] once every outstanding iterator
    /// lease is released. Returns the state after the transition.
    pub fn close(&self) -> MatrixState {
        let state = self.lifecycle.begin_close();
        debug!("Keyspace {:?} now {:?}", self.meta.keyspace, state);
        state
    }

    fn read_index(&self) -> Result<TemporalIndex<B::Snapshot>> {
        self.lifecycle.check_open()?;
        Ok(TemporalIndex::new(self.backend.snapshot()))
    }

    fn validate_read(timestamp: Timestamp, key: &str) -> Result<()> {
        if timestamp < 0 {
            return Err(MatrixError::NegativeTimestamp(timestamp));
        }
        if key.is_empty() {
            return Err(MatrixError::EmptyKey);
        }
        Ok(())
    }

    /// Returns the value of `key` at `timestamp`: the payload of the
    /// greatest entry at or below `timestamp`, or `None` when there is no
    /// such entry or it is a tombstone.
    pub fn get(&self, timestamp: Timestamp, key: &str) -> Result<Option<Vec<u8>>> {
        Self::validate_read(timestamp, key)?;
        let index = self.read_index()?;
        Ok(index
            .floor_entry(key, timestamp)?
            .and_then(|(_, payload)| payload.into_value()))
    }

    /// Like [`get`](Self::get), additionally reporting the validity period
    /// of the answer.
    pub fn get_ranged(&self, timestamp: Timestamp, key: &str) -> Result<RangedGetResult> {
        Self::validate_read(timestamp, key)?;
        let index = self.read_index()?;
        match index.floor_entry(key, timestamp)? {
            Some((entry_ts, payload)) => {
                let period = match index.entry_after(key, entry_ts)? {
                    Some((next_ts, _)) => ValidityPeriod::new(entry_ts, next_ts),
                    None => ValidityPeriod::open_ended(entry_ts),
                };
                Ok(RangedGetResult::new(payload.into_value(), period))
            }
            None => {
                // The key has no entry yet at this timestamp. The negative
                // answer holds from the creation timestamp (clamped for
                // reads below it) until the key's first entry.
                let lower = self.meta.creation_timestamp.min(timestamp);
                let period = match index.ceiling_entry(key, timestamp)? {
                    Some((next_ts, _)) => ValidityPeriod::new(lower, next_ts),
                    None => ValidityPeriod::open_ended(lower),
                };
                Ok(RangedGetResult::new(None, period))
            }
        }
    }

    /// Iterates over the user keys that are live at `timestamp`, in
    /// lexicographic order.
    pub fn keys(&self, timestamp: Timestamp) -> Result<KeysAt<B::Snapshot>> {
        if timestamp < 0 {
            return Err(MatrixError::NegativeTimestamp(timestamp));
        }
        let index = self.read_index()?;
        let lease = Lifecycle::acquire(&self.lifecycle)?;
        Ok(KeysAt::new(index, timestamp, lease))
    }

    /// Iterates over every user key that ever appeared in this matrix,
    /// keys whose entries are all tombstones included, rolled-back keys
    /// excluded. Lexicographic order, deduplicated.
    pub fn all_keys(&self) -> Result<AllKeys<B::Snapshot>> {
        let index = self.read_index()?;
        let lease = Lifecycle::acquire(&self.lifecycle)?;
        Ok(AllKeys::new(index, lease))
    }

    /// Iterates over the timestamps at which `key` was written, values and
    /// tombstones alike, restricted to `<= max_time`, most recent first.
    pub fn history(&self, max_time: Timestamp, key: &str) -> Result<History<B::Snapshot>> {
        Self::validate_read(max_time, key)?;
        let index = self.read_index()?;
        let lease = Lifecycle::acquire(&self.lifecycle)?;
        Ok(History::new(index, key.to_string(), max_time, lease))
    }

    /// Streams the snapshot of the matrix at `timestamp`: one floor entry
    /// per user key with at least one entry at or below `timestamp`,
    /// tombstone floors included.
    pub fn all_entries_iterator(&self, timestamp: Timestamp) -> Result<AllEntries<B::Snapshot>> {
        if timestamp < 0 {
            return Err(MatrixError::NegativeTimestamp(timestamp));
        }
        let index = self.read_index()?;
        let lease = Lifecycle::acquire(&self.lifecycle)?;
        Ok(AllEntries::new(index, timestamp, lease))
    }

    /// Returns the greatest timestamp ever written for `key`, or
    /// [`NO_COMMITS`] when the key has no entry.
    pub fn last_commit_timestamp(&self, key: &str) -> Result<Timestamp> {
        if key.is_empty() {
            return Err(MatrixError::EmptyKey);
        }
        self.lifecycle.check_open()?;
        if self.config.last_commit_cache {
            if let Some(&ts) = self.last_commit_cache.read().get(key) {
                return Ok(ts);
            }
        }
        let index = self.read_index()?;
        match index.last_entry(key)? {
            Some((ts, _)) => {
                if self.config.last_commit_cache {
                    self.last_commit_cache.write().insert(key.to_string(), ts);
                }
                Ok(ts)
            }
            None => Ok(NO_COMMITS),
        }
    }

    /// Iterates over the `(user_key, timestamp)` pairs modified in the
    /// closed range `[lower, upper]`, in ascending `(timestamp, user_key)`
    /// order.
    pub fn get_modifications_between(
        &self,
        lower: Timestamp,
        upper: Timestamp,
    ) -> Result<Modifications<B::Snapshot>> {
        if lower < 0 {
            return Err(MatrixError::NegativeTimestamp(lower));
        }
        if upper < 0 {
            return Err(MatrixError::NegativeTimestamp(upper));
        }
        if lower > upper {
            return Err(MatrixError::InvalidRange { lower, upper });
        }
        let index = self.read_index()?;
        let lease = Lifecycle::acquire(&self.lifecycle)?;
        if self.config.commit_index {
            return Ok(Modifications::indexed(index, lower, upper, lease));
        }
        // No commit index: one full keyspace scan, sorted up front.
        let mut items = Vec::new();
        let mut cursor = index.first_key();
        while let Some(key) = cursor {
            let mut entry = index.floor_entry(&key, upper)?;
            while let Some((ts, _)) = entry {
                if ts < lower {
                    break;
                }
                items.push(TemporalKey {
                    key: key.clone(),
                    timestamp: ts,
                });
                entry = index.entry_before(&key, ts)?;
            }
            cursor = index.next_key(&key);
        }
        items.sort();
        Ok(Modifications::collected(items, lease))
    }

    /// Iterates over the distinct timestamps at which commits happened in
    /// the closed range `[lower, upper]`, ascending.
    pub fn get_commit_timestamps_between(
        &self,
        lower: Timestamp,
        upper: Timestamp,
    ) -> Result<CommitTimestamps<B::Snapshot>> {
        Ok(CommitTimestamps::new(
            self.get_modifications_between(lower, upper)?,
        ))
    }

    /// Writes `contents` at `timestamp` as one atomic commit. A `None`
    /// value writes a tombstone.
    ///
    /// An empty map is a no-op: nothing is written and the timestamp is
    /// not consumed.
    ///
    /// # Errors
    ///
    /// [`MatrixError::MonotonicityViolation`] unless `timestamp` exceeds
    /// every previously accepted timestamp (and is at least the creation
    /// timestamp); argument errors on a negative timestamp or empty keys.
    pub fn put(
        &self,
        timestamp: Timestamp,
        contents: HashMap<String, Option<Vec<u8>>>,
    ) -> Result<()> {
        self.lifecycle.check_open()?;
        if timestamp < 0 {
            return Err(MatrixError::NegativeTimestamp(timestamp));
        }
        if contents.is_empty() {
            return Ok(());
        }
        if contents.keys().any(|key| key.is_empty()) {
            return Err(MatrixError::EmptyKey);
        }
        let last = self.last_global.load(Ordering::SeqCst);
        if timestamp <= last {
            return Err(MatrixError::MonotonicityViolation {
                attempted: timestamp,
                last,
            });
        }

        let entry_count = contents.len();
        let mut batch = WriteBatch::new();
        let mut cache_keys = Vec::with_capacity(entry_count);
        for (key, value) in contents {
            let payload = match value {
                Some(bytes) => Payload::Value(bytes),
                None => Payload::Tombstone,
            };
            if self.config.commit_index {
                let tag = if payload.is_tombstone() {
                    TAG_TOMBSTONE
                } else {
                    TAG_VALUE
                };
                batch.put(commit_index_key(timestamp, &key), vec![tag]);
            }
            batch.put(record_key(&key, timestamp), record_value(&payload));
            cache_keys.push(key);
        }
        self.backend.commit(batch)?;

        self.last_global.store(timestamp, Ordering::SeqCst);
        if self.config.last_commit_cache {
            let mut cache = self.last_commit_cache.write();
            for key in cache_keys {
                cache.insert(key, timestamp);
            }
        }
        debug!(
            "Committed {} entries to keyspace {:?} at timestamp {}",
            entry_count, self.meta.keyspace, timestamp
        );
        Ok(())
    }

    /// Bulk-loads `entries`, which may span multiple timestamps. Used by
    /// replication and import paths.
    ///
    /// Re-inserting an entry identical to a stored one is a no-op; the
    /// high water mark advances to the greatest inserted timestamp.
    ///
    /// # Errors
    ///
    /// [`MatrixError::Conflict`] when an entry targets a `(key,
    /// timestamp)` slot already holding a different payload, or lies below
    /// the creation timestamp.
    pub fn insert_entries(&self, entries: Vec<TemporalEntry>) -> Result<()> {
        self.lifecycle.check_open()?;
        if entries.is_empty() {
            return Ok(());
        }
        for entry in &entries {
            if entry.key.is_empty() {
                return Err(MatrixError::EmptyKey);
            }
            if entry.timestamp < 0 {
                return Err(MatrixError::NegativeTimestamp(entry.timestamp));
            }
            if entry.timestamp < self.meta.creation_timestamp {
                return Err(MatrixError::Conflict {
                    key: entry.key.clone(),
                    timestamp: entry.timestamp,
                });
            }
        }

        let index = TemporalIndex::new(self.backend.snapshot());
        let mut staged: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        let mut batch = WriteBatch::new();
        let mut max_ts = NO_COMMITS;
        let mut touched: Vec<(String, Timestamp)> = Vec::new();
        for entry in &entries {
            max_ts = max_ts.max(entry.timestamp);
            let map_key = record_key(&entry.key, entry.timestamp);
            let map_value = record_value(&entry.payload);
            if let Some(previous) = staged.get(&map_key) {
                if *previous != map_value {
                    return Err(MatrixError::Conflict {
                        key: entry.key.clone(),
                        timestamp: entry.timestamp,
                    });
                }
                continue;
            }
            if let Some(existing) = index.raw_record(&entry.key, entry.timestamp) {
                if existing != map_value {
                    return Err(MatrixError::Conflict {
                        key: entry.key.clone(),
                        timestamp: entry.timestamp,
                    });
                }
                // Identical entry already stored.
                staged.insert(map_key, map_value);
                continue;
            }
            if self.config.commit_index {
                let tag = if entry.payload.is_tombstone() {
                    TAG_TOMBSTONE
                } else {
                    TAG_VALUE
                };
                batch.put(commit_index_key(entry.timestamp, &entry.key), vec![tag]);
            }
            batch.put(map_key.clone(), map_value.clone());
            staged.insert(map_key, map_value);
            touched.push((entry.key.clone(), entry.timestamp));
        }

        if !batch.is_empty() {
            self.backend.commit(batch)?;
        }
        self.last_global.fetch_max(max_ts, Ordering::SeqCst);
        if self.config.last_commit_cache {
            let mut cache = self.last_commit_cache.write();
            for (key, ts) in touched {
                let slot = cache.entry(key).or_insert(ts);
                if *slot < ts {
                    *slot = ts;
                }
            }
        }
        debug!(
            "Bulk-inserted {} entries into keyspace {:?}",
            entries.len(),
            self.meta.keyspace
        );
        Ok(())
    }

    /// Rolls the matrix back to `timestamp`: every entry above it is
    /// removed atomically, the last-commit cache is invalidated, and the
    /// high water mark becomes `max(timestamp, creation_timestamp)`.
    ///
    /// A target below the creation timestamp is clamped up to it. Only
    /// legal while the matrix is open; a storage failure during the
    /// removal leaves the matrix degraded and every later operation fails
    /// until reopen.
    pub fn rollback(&self, timestamp: Timestamp) -> Result<()> {
        self.lifecycle.check_open()?;
        if timestamp < 0 {
            return Err(MatrixError::NegativeTimestamp(timestamp));
        }
        let target = timestamp.max(self.meta.creation_timestamp);
        let index = TemporalIndex::new(self.backend.snapshot());
        let doomed = index.records_above(target)?;
        if !doomed.is_empty() {
            let mut batch = WriteBatch::new();
            if target < i64::MAX {
                batch.remove_range(commit_index_floor(target + 1), commit_index_region_end());
            }
            let removed = doomed.len();
            for (key, ts) in doomed {
                batch.remove(record_key(&key, ts));
            }
            if let Err(err) = self.backend.commit(batch) {
                self.lifecycle.mark_degraded();
                error!(
                    "Rollback of keyspace {:?} to {} failed, matrix degraded: {err}",
                    self.meta.keyspace, target
                );
                return Err(err);
            }
            debug!(
                "Rolled back keyspace {:?} to {}: {} entries removed",
                self.meta.keyspace, target, removed
            );
        }
        self.last_commit_cache.write().clear();
        self.last_global.store(target, Ordering::SeqCst);
        Ok(())
    }
}
