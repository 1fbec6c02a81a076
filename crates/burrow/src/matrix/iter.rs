//! Lazy iterators over a temporal matrix snapshot.
//!
//! Every iterator pins the byte-map snapshot it was built from and holds a
//! read lease on the matrix; both are released when the iterator is dropped
//! (or explicitly closed, for [`AllEntries`]). Iteration is cursor-driven:
//! each step is a bounded seek on the pinned snapshot, so iterators stay
//! lazy and restartable and are never invalidated by concurrent writes.
//!
//! A corrupt record terminates the walk early; the condition is logged and
//! cannot arise from well-formed writes.

use crate::bytemap::MapSnapshot;
use crate::matrix::index::TemporalIndex;
use crate::matrix::{LeaseGuard, Payload, TemporalEntry, TemporalKey, Timestamp};
use tracing::warn;

/// Cursor over the distinct-user-key walk.
#[derive(Debug, Clone)]
enum KeyCursor {
    Start,
    After(String),
    Done,
}

impl KeyCursor {
    fn advance<S: MapSnapshot>(&mut self, index: &TemporalIndex<S>) -> Option<String> {
        let next = match self {
            KeyCursor::Start => index.first_key(),
            KeyCursor::After(prev) => index.next_key(prev),
            KeyCursor::Done => None,
        };
        match next {
            Some(key) => {
                *self = KeyCursor::After(key.clone());
                Some(key)
            }
            None => {
                *self = KeyCursor::Done;
                None
            }
        }
    }

    fn finish(&mut self) {
        *self = KeyCursor::Done;
    }
}

/// Iterator over the user keys that are live (floor entry is a value) at a
/// fixed timestamp, in lexicographic order.
#[derive(Debug)]
pub struct KeysAt<S: MapSnapshot> {
    index: TemporalIndex<S>,
    timestamp: Timestamp,
    cursor: KeyCursor,
    _lease: LeaseGuard,
}

impl<S: MapSnapshot> KeysAt<S> {
    pub(crate) fn new(index: TemporalIndex<S>, timestamp: Timestamp, lease: LeaseGuard) -> Self {
        Self {
            index,
            timestamp,
            cursor: KeyCursor::Start,
            _lease: lease,
        }
    }
}

impl<S: MapSnapshot> Iterator for KeysAt<S> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let key = self.cursor.advance(&self.index)?;
            match self.index.floor_entry(&key, self.timestamp) {
                Ok(Some((_, Payload::Value(_)))) => return Some(key),
                Ok(_) => continue,
                Err(err) => {
                    warn!("Stopping key iteration on corrupt record: {err}");
                    self.cursor.finish();
                    return None;
                }
            }
        }
    }
}

/// Iterator over every user key that ever appeared in the matrix,
/// tombstone-only keys included, in lexicographic order.
#[derive(Debug)]
pub struct AllKeys<S: MapSnapshot> {
    index: TemporalIndex<S>,
    cursor: KeyCursor,
    _lease: LeaseGuard,
}

impl<S: MapSnapshot> AllKeys<S> {
    pub(crate) fn new(index: TemporalIndex<S>, lease: LeaseGuard) -> Self {
        Self {
            index,
            cursor: KeyCursor::Start,
            _lease: lease,
        }
    }
}

impl<S: MapSnapshot> Iterator for AllKeys<S> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.cursor.advance(&self.index)
    }
}

#[derive(Debug, Clone, Copy)]
enum HistoryCursor {
    Start,
    Before(Timestamp),
    Done,
}

/// Iterator over the timestamps at which one user key was written, values
/// and tombstones alike, in descending order.
#[derive(Debug)]
pub struct History<S: MapSnapshot> {
    index: TemporalIndex<S>,
    user_key: String,
    max_time: Timestamp,
    cursor: HistoryCursor,
    _lease: LeaseGuard,
}

impl<S: MapSnapshot> History<S> {
    pub(crate) fn new(
        index: TemporalIndex<S>,
        user_key: String,
        max_time: Timestamp,
        lease: LeaseGuard,
    ) -> Self {
        Self {
            index,
            user_key,
            max_time,
            cursor: HistoryCursor::Start,
            _lease: lease,
        }
    }
}

impl<S: MapSnapshot> Iterator for History<S> {
    type Item = Timestamp;

    fn next(&mut self) -> Option<Timestamp> {
        let probed = match self.cursor {
            HistoryCursor::Start => self.index.floor_entry(&self.user_key, self.max_time),
            HistoryCursor::Before(ts) => self.index.entry_before(&self.user_key, ts),
            HistoryCursor::Done => return None,
        };
        match probed {
            Ok(Some((ts, _))) => {
                self.cursor = HistoryCursor::Before(ts);
                Some(ts)
            }
            Ok(None) => {
                self.cursor = HistoryCursor::Done;
                None
            }
            Err(err) => {
                warn!("Stopping history iteration on corrupt record: {err}");
                self.cursor = HistoryCursor::Done;
                None
            }
        }
    }
}

/// Closeable iterator over the snapshot of the matrix at a fixed
/// timestamp: for each user key with at least one entry at or below the
/// timestamp, exactly its floor entry is yielded.
///
/// Tombstone floors are yielded too; callers decide whether to skip them.
/// Dropping the iterator releases its read lease; [`close`](Self::close)
/// does so explicitly.
#[derive(Debug)]
pub struct AllEntries<S: MapSnapshot> {
    index: TemporalIndex<S>,
    timestamp: Timestamp,
    cursor: KeyCursor,
    _lease: LeaseGuard,
}

impl<S: MapSnapshot> AllEntries<S> {
    pub(crate) fn new(index: TemporalIndex<S>, timestamp: Timestamp, lease: LeaseGuard) -> Self {
        Self {
            index,
            timestamp,
            cursor: KeyCursor::Start,
            _lease: lease,
        }
    }

    /// Releases the read lease without waiting for drop.
    pub fn close(self) {}
}

impl<S: MapSnapshot> Iterator for AllEntries<S> {
    type Item = TemporalEntry;

    fn next(&mut self) -> Option<TemporalEntry> {
        loop {
            let key = self.cursor.advance(&self.index)?;
            match self.index.floor_entry(&key, self.timestamp) {
                Ok(Some((ts, payload))) => {
                    return Some(TemporalEntry {
                        key,
                        timestamp: ts,
                        payload,
                    })
                }
                // No entry at or below the timestamp: key written later only.
                Ok(None) => continue,
                Err(err) => {
                    warn!("Stopping entry iteration on corrupt record: {err}");
                    self.cursor.finish();
                    return None;
                }
            }
        }
    }
}

#[derive(Debug)]
enum ModificationsInner<S: MapSnapshot> {
    /// Lazy walk over the commit index.
    Indexed {
        index: TemporalIndex<S>,
        upper: Timestamp,
        cursor: ModificationCursor,
    },
    /// Pre-collected, pre-sorted fallback when no commit index is
    /// maintained.
    Collected(std::vec::IntoIter<TemporalKey>),
}

#[derive(Debug, Clone)]
enum ModificationCursor {
    Start(Timestamp),
    After(Timestamp, String),
    Done,
}

/// Iterator over the `(user_key, timestamp)` pairs written in a closed
/// timestamp range, in ascending `(timestamp, user_key)` order.
#[derive(Debug)]
pub struct Modifications<S: MapSnapshot> {
    inner: ModificationsInner<S>,
    _lease: LeaseGuard,
}

impl<S: MapSnapshot> Modifications<S> {
    pub(crate) fn indexed(
        index: TemporalIndex<S>,
        lower: Timestamp,
        upper: Timestamp,
        lease: LeaseGuard,
    ) -> Self {
        Self {
            inner: ModificationsInner::Indexed {
                index,
                upper,
                cursor: ModificationCursor::Start(lower),
            },
            _lease: lease,
        }
    }

    pub(crate) fn collected(items: Vec<TemporalKey>, lease: LeaseGuard) -> Self {
        Self {
            inner: ModificationsInner::Collected(items.into_iter()),
            _lease: lease,
        }
    }
}

impl<S: MapSnapshot> Iterator for Modifications<S> {
    type Item = TemporalKey;

    fn next(&mut self) -> Option<TemporalKey> {
        match &mut self.inner {
            ModificationsInner::Indexed {
                index,
                upper,
                cursor,
            } => {
                let probed = match cursor {
                    ModificationCursor::Start(lower) => index.first_commit_at(*lower),
                    ModificationCursor::After(ts, key) => index.commit_after(*ts, key),
                    ModificationCursor::Done => return None,
                };
                match probed {
                    Some((ts, key)) if ts <= *upper => {
                        *cursor = ModificationCursor::After(ts, key.clone());
                        Some(TemporalKey {
                            key,
                            timestamp: ts,
                        })
                    }
                    _ => {
                        *cursor = ModificationCursor::Done;
                        None
                    }
                }
            }
            ModificationsInner::Collected(items) => items.next(),
        }
    }
}

/// Iterator over the distinct timestamps at which commits happened in a
/// closed timestamp range, ascending.
#[derive(Debug)]
pub struct CommitTimestamps<S: MapSnapshot> {
    modifications: Modifications<S>,
    last: Option<Timestamp>,
}

impl<S: MapSnapshot> CommitTimestamps<S> {
    pub(crate) fn new(modifications: Modifications<S>) -> Self {
        Self {
            modifications,
            last: None,
        }
    }
}

impl<S: MapSnapshot> Iterator for CommitTimestamps<S> {
    type Item = Timestamp;

    fn next(&mut self) -> Option<Timestamp> {
        // Modifications arrive in ascending timestamp order, so dropping
        // consecutive duplicates yields the distinct set.
        loop {
            let ts = self.modifications.next()?.timestamp;
            if self.last != Some(ts) {
                self.last = Some(ts);
                return Some(ts);
            }
        }
    }
}
