//! Bounded seeks and scans over one byte-map snapshot.
//!
//! [`TemporalIndex`] is the read-side seam between the matrix operations
//! and the sorted byte-map: every temporal query reduces to a handful of
//! `O(log n)` probes here. An index instance wraps exactly one snapshot, so
//! everything resolved through it observes one consistent version.

use crate::bytemap::MapSnapshot;
use crate::error::Result;
use crate::matrix::encoding::{
    self, commit_index_floor, commit_index_key, commit_index_region_end, decode_commit_index_key,
    decode_record_key, decode_record_value, record_key, record_key_prefix, record_run_end,
    RECORD_REGION_START,
};
use crate::matrix::{Payload, Timestamp};

/// A read view of the temporal index, pinned to one snapshot.
#[derive(Debug, Clone)]
pub(crate) struct TemporalIndex<S: MapSnapshot> {
    snap: S,
}

impl<S: MapSnapshot> TemporalIndex<S> {
    pub(crate) fn new(snap: S) -> Self {
        Self { snap }
    }

    /// Decodes a probed `(key, value)` pair if it is a record of
    /// `user_key`, identified by its exact prefix and suffix length.
    fn decode_for_key(
        prefix: &[u8],
        probed: Option<(Vec<u8>, Vec<u8>)>,
    ) -> Result<Option<(Timestamp, Payload)>> {
        let (key, value) = match probed {
            Some(kv) => kv,
            None => return Ok(None),
        };
        // Records of a key extended with NUL share the prefix but are
        // longer than prefix + timestamp; the length check excludes them.
        if key.len() != prefix.len() + 8 || !key.starts_with(prefix) {
            return Ok(None);
        }
        let ts = u64::from_be_bytes(key[prefix.len()..].try_into().unwrap()) as i64;
        Ok(Some((ts, decode_record_value(&value)?)))
    }

    /// Greatest entry of `user_key` with timestamp `<= timestamp`.
    pub(crate) fn floor_entry(
        &self,
        user_key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<(Timestamp, Payload)>> {
        let prefix = record_key_prefix(user_key);
        let probe = record_key(user_key, timestamp);
        Self::decode_for_key(&prefix, self.snap.seek_floor(&probe))
    }

    /// Least entry of `user_key` with timestamp `>= timestamp`.
    pub(crate) fn ceiling_entry(
        &self,
        user_key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<(Timestamp, Payload)>> {
        let prefix = record_key_prefix(user_key);
        let probe = record_key(user_key, timestamp);
        Self::decode_for_key(&prefix, self.snap.seek_ceiling(&probe))
    }

    /// Least entry of `user_key` with timestamp strictly above `timestamp`.
    pub(crate) fn entry_after(
        &self,
        user_key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<(Timestamp, Payload)>> {
        let prefix = record_key_prefix(user_key);
        let probe = record_key(user_key, timestamp);
        Self::decode_for_key(&prefix, self.snap.seek_higher(&probe))
    }

    /// Greatest entry of `user_key` with timestamp strictly below
    /// `timestamp`.
    pub(crate) fn entry_before(
        &self,
        user_key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<(Timestamp, Payload)>> {
        let prefix = record_key_prefix(user_key);
        let probe = record_key(user_key, timestamp);
        Self::decode_for_key(&prefix, self.snap.seek_lower(&probe))
    }

    /// Latest entry of `user_key` regardless of timestamp.
    pub(crate) fn last_entry(&self, user_key: &str) -> Result<Option<(Timestamp, Payload)>> {
        self.floor_entry(user_key, i64::MAX)
    }

    /// First user key in lexicographic order, if any records exist.
    pub(crate) fn first_key(&self) -> Option<String> {
        let (key, _) = self.snap.seek_ceiling(&RECORD_REGION_START)?;
        decode_record_key(&key).map(|(user_key, _)| user_key)
    }

    /// Next distinct user key after `user_key`, skipping the rest of its
    /// record run in one probe.
    pub(crate) fn next_key(&self, user_key: &str) -> Option<String> {
        let probe = record_run_end(record_key_prefix(user_key));
        let (key, _) = self.snap.seek_ceiling(&probe)?;
        decode_record_key(&key).map(|(next, _)| next)
    }

    /// First commit-index entry with timestamp `>= timestamp`.
    pub(crate) fn first_commit_at(&self, timestamp: Timestamp) -> Option<(Timestamp, String)> {
        let (key, _) = self.snap.seek_ceiling(&commit_index_floor(timestamp))?;
        decode_commit_index_key(&key)
    }

    /// Commit-index entry following `(timestamp, user_key)` in
    /// `(timestamp, user_key)` order.
    pub(crate) fn commit_after(
        &self,
        timestamp: Timestamp,
        user_key: &str,
    ) -> Option<(Timestamp, String)> {
        let probe = commit_index_key(timestamp, user_key);
        let (key, _) = self.snap.seek_higher(&probe)?;
        decode_commit_index_key(&key)
    }

    /// True if the snapshot carries any commit-index entries.
    pub(crate) fn has_commit_index(&self) -> bool {
        self.first_commit_at(0).is_some()
    }

    /// Greatest timestamp present in the matrix, resolved from the
    /// commit-index tail when available and by a full record scan
    /// otherwise. `None` on an empty matrix.
    pub(crate) fn max_timestamp(&self) -> Result<Option<Timestamp>> {
        if let Some((key, _)) = self.snap.seek_lower(&commit_index_region_end()) {
            if let Some((ts, _)) = decode_commit_index_key(&key) {
                return Ok(Some(ts));
            }
        }
        // No commit index: walk every key's record run tail.
        let mut max = None;
        let mut cursor = self.first_key();
        while let Some(user_key) = cursor {
            if let Some((ts, _)) = self.last_entry(&user_key)? {
                max = Some(max.map_or(ts, |m: Timestamp| m.max(ts)));
            }
            cursor = self.next_key(&user_key);
        }
        Ok(max)
    }

    /// Every record with timestamp strictly above `timestamp`, as
    /// `(user_key, ts)` pairs. Used by rollback to enumerate doomed
    /// records.
    pub(crate) fn records_above(&self, timestamp: Timestamp) -> Result<Vec<(String, Timestamp)>> {
        let mut doomed = Vec::new();
        if self.has_commit_index() {
            let mut cursor = if timestamp == i64::MAX {
                None
            } else {
                self.first_commit_at(timestamp + 1)
            };
            while let Some((ts, user_key)) = cursor {
                cursor = self.commit_after(ts, &user_key);
                doomed.push((user_key, ts));
            }
            return Ok(doomed);
        }
        let mut key_cursor = self.first_key();
        while let Some(user_key) = key_cursor {
            // Walk this key's run downward until the cutoff.
            let mut entry = self.last_entry(&user_key)?;
            while let Some((ts, _)) = entry {
                if ts <= timestamp {
                    break;
                }
                doomed.push((user_key.clone(), ts));
                entry = self.entry_before(&user_key, ts)?;
            }
            key_cursor = self.next_key(&user_key);
        }
        Ok(doomed)
    }

    /// Reads the raw byte-map value stored for the record
    /// `(user_key, timestamp)`, if any.
    pub(crate) fn raw_record(&self, user_key: &str, timestamp: Timestamp) -> Option<Vec<u8>> {
        self.snap.get(&record_key(user_key, timestamp))
    }

    /// Reads and decodes the metadata record.
    pub(crate) fn meta(&self) -> Option<Vec<u8>> {
        self.snap.get(encoding::META_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytemap::{MemoryByteMap, SortedByteMap, WriteBatch};
    use crate::matrix::encoding::record_value;

    fn index_with(
        records: &[(&str, Timestamp, Payload)],
        commit_index: bool,
    ) -> TemporalIndex<crate::bytemap::MemorySnapshot> {
        let map = MemoryByteMap::new();
        let mut batch = WriteBatch::new();
        for (key, ts, payload) in records {
            batch.put(record_key(key, *ts), record_value(payload));
            if commit_index {
                batch.put(
                    commit_index_key(*ts, key),
                    vec![match payload {
                        Payload::Value(_) => encoding::TAG_VALUE,
                        Payload::Tombstone => encoding::TAG_TOMBSTONE,
                    }],
                );
            }
        }
        map.commit(batch).unwrap();
        TemporalIndex::new(map.snapshot())
    }

    fn value(bytes: &[u8]) -> Payload {
        Payload::Value(bytes.to_vec())
    }

    #[test]
    fn test_floor_and_ceiling() {
        let index = index_with(
            &[
                ("a", 1, value(b"v1")),
                ("a", 5, value(b"v5")),
                ("b", 3, Payload::Tombstone),
            ],
            false,
        );

        assert_eq!(index.floor_entry("a", 0).unwrap(), None);
        assert_eq!(index.floor_entry("a", 1).unwrap(), Some((1, value(b"v1"))));
        assert_eq!(index.floor_entry("a", 4).unwrap(), Some((1, value(b"v1"))));
        assert_eq!(
            index.floor_entry("a", i64::MAX).unwrap(),
            Some((5, value(b"v5")))
        );
        assert_eq!(
            index.floor_entry("b", 9).unwrap(),
            Some((3, Payload::Tombstone))
        );

        assert_eq!(index.ceiling_entry("a", 2).unwrap(), Some((5, value(b"v5"))));
        assert_eq!(index.ceiling_entry("a", 6).unwrap(), None);
        assert_eq!(index.entry_after("a", 1).unwrap(), Some((5, value(b"v5"))));
        assert_eq!(index.entry_before("a", 5).unwrap(), Some((1, value(b"v1"))));
        assert_eq!(index.entry_before("a", 1).unwrap(), None);
    }

    #[test]
    fn test_floor_does_not_cross_keys() {
        let index = index_with(&[("a", 9, value(b"x"))], false);
        // "b" has no records; the probe must not fall through to "a".
        assert_eq!(index.floor_entry("b", 100).unwrap(), None);
        // A key extending "a" with a NUL must not satisfy "a" probes.
        let index = index_with(&[("a\0b", 1, value(b"y"))], false);
        assert_eq!(index.floor_entry("a", 100).unwrap(), None);
        assert_eq!(index.ceiling_entry("a", 0).unwrap(), None);
    }

    #[test]
    fn test_key_walk() {
        let index = index_with(
            &[
                ("b", 1, value(b"1")),
                ("a", 2, value(b"2")),
                ("a", 7, Payload::Tombstone),
                ("c", 3, value(b"3")),
            ],
            false,
        );
        let mut keys = Vec::new();
        let mut cursor = index.first_key();
        while let Some(key) = cursor {
            cursor = index.next_key(&key);
            keys.push(key);
        }
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_commit_index_walk() {
        let index = index_with(
            &[
                ("a", 1, value(b"1")),
                ("b", 3, value(b"3")),
                ("a", 3, value(b"3")),
                ("c", 8, Payload::Tombstone),
            ],
            true,
        );
        assert!(index.has_commit_index());
        let mut commits = Vec::new();
        let mut cursor = index.first_commit_at(2);
        while let Some((ts, key)) = cursor {
            cursor = index.commit_after(ts, &key);
            commits.push((ts, key));
        }
        assert_eq!(
            commits,
            vec![
                (3, "a".to_string()),
                (3, "b".to_string()),
                (8, "c".to_string()),
            ]
        );
    }

    #[test]
    fn test_max_timestamp_with_and_without_index() {
        let with = index_with(&[("a", 4, value(b"x")), ("b", 11, value(b"y"))], true);
        assert_eq!(with.max_timestamp().unwrap(), Some(11));

        let without = index_with(&[("a", 4, value(b"x")), ("b", 11, value(b"y"))], false);
        assert_eq!(without.max_timestamp().unwrap(), Some(11));

        let empty = index_with(&[], false);
        assert_eq!(empty.max_timestamp().unwrap(), None);
    }

    #[test]
    fn test_records_above() {
        for commit_index in [true, false] {
            let index = index_with(
                &[
                    ("a", 1, value(b"1")),
                    ("a", 5, value(b"5")),
                    ("b", 3, value(b"3")),
                    ("b", 7, Payload::Tombstone),
                ],
                commit_index,
            );
            let mut doomed = index.records_above(3).unwrap();
            doomed.sort();
            assert_eq!(
                doomed,
                vec![("a".to_string(), 5), ("b".to_string(), 7)],
                "commit_index = {commit_index}"
            );
            assert!(index.records_above(7).unwrap().is_empty());
        }
    }
}
