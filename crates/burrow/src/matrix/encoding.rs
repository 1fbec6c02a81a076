//! Byte-level encoding of temporal records, the commit index, and the
//! keyspace metadata record.
//!
//! ## Record keys
//!
//! Each stored record key is `escape(user_key) ‖ SEP ‖ be64(timestamp)`:
//!
//! - `escape` maps the byte `0x00` to the pair `0x00 0xFF` and leaves every
//!   other byte unchanged. The mapping preserves lexicographic order and
//!   guarantees the separator byte never appears unescaped inside a key.
//! - `SEP` is a single `0x00` byte.
//! - `be64` is the big-endian unsigned encoding of the (non-negative)
//!   timestamp, so lexicographic order equals numeric order. Its high byte
//!   is at most `0x7F`, which keeps timestamp suffixes strictly below the
//!   `0xFF` continuation byte of an escaped NUL.
//!
//! All records for one user key therefore form one contiguous run, ordered
//! by timestamp, and distinct user keys enumerate in lexicographic order.
//!
//! ## Record values
//!
//! `tag ‖ payload` with [`TAG_VALUE`] (`0x01`) carrying the payload bytes
//! and [`TAG_TOMBSTONE`] (`0x00`) carrying nothing. The tag space is
//! reserved to these two values; format extensions must take new tags.
//!
//! ## Reserved keys
//!
//! Keys starting with `0x00` followed by anything other than `0xFF` cannot
//! be produced by `escape`, so that prefix is reserved:
//!
//! - `\0META` holds the keyspace metadata record (framed, checksummed).
//! - `\0CI ‖ be64(timestamp) ‖ escape(user_key)` holds the commit index:
//!   one entry per record, valued with the record's tag byte, ordered by
//!   `(timestamp, user_key)`.

use crate::error::{MatrixError, Result};
use crate::matrix::{Payload, Timestamp};

/// Value tag marking a deletion. The payload is empty.
pub const TAG_TOMBSTONE: u8 = 0x00;

/// Value tag marking a live value. The payload follows the tag.
pub const TAG_VALUE: u8 = 0x01;

/// Magic bytes of the metadata record: "BMTX".
pub const META_MAGIC: [u8; 4] = *b"BMTX";

/// Current metadata record format version.
pub const META_VERSION: u16 = 1;

/// Byte-map key of the metadata record.
pub const META_KEY: &[u8] = b"\0META";

/// Key prefix of the commit index.
pub const COMMIT_INDEX_PREFIX: &[u8] = b"\0CI";

/// Separator between the escaped user key and the timestamp suffix.
const SEPARATOR: u8 = 0x00;

/// Continuation byte of an escaped NUL.
const ESCAPE_CONT: u8 = 0xFF;

/// Smallest possible record key: every record sorts at or above
/// `[0x00, 0xFF]`, every reserved key strictly below it.
pub const RECORD_REGION_START: [u8; 2] = [0x00, ESCAPE_CONT];

fn escape_into(key: &[u8], out: &mut Vec<u8>) {
    for &b in key {
        if b == 0x00 {
            out.push(0x00);
            out.push(ESCAPE_CONT);
        } else {
            out.push(b);
        }
    }
}

fn unescape(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x00 {
            if bytes.get(i + 1) != Some(&ESCAPE_CONT) {
                return None;
            }
            out.push(0x00);
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(out)
}

/// Returns the key prefix shared by every record of `user_key`:
/// `escape(user_key) ‖ SEP`.
pub fn record_key_prefix(user_key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(user_key.len() + 1);
    escape_into(user_key.as_bytes(), &mut out);
    out.push(SEPARATOR);
    out
}

/// Encodes the byte-map key of the record `(user_key, timestamp)`.
pub fn record_key(user_key: &str, timestamp: Timestamp) -> Vec<u8> {
    let mut out = record_key_prefix(user_key);
    out.extend_from_slice(&(timestamp as u64).to_be_bytes());
    out
}

/// Appends the probe that sorts after every record of the prefixed user key
/// but before the records of any other user key.
///
/// Timestamp suffixes start with a byte `<= 0x7F`, so `prefix ‖ 0x80` is an
/// exclusive upper bound for the key's record run.
pub fn record_run_end(mut prefix: Vec<u8>) -> Vec<u8> {
    prefix.push(0x80);
    prefix
}

/// Splits a record key back into `(user_key, timestamp)`.
///
/// Returns `None` for byte strings that are not well-formed record keys
/// (reserved keys, truncated suffixes, non-UTF-8 key bytes).
pub fn decode_record_key(bytes: &[u8]) -> Option<(String, Timestamp)> {
    let mut key = Vec::new();
    let mut i = 0;
    loop {
        match *bytes.get(i)? {
            0x00 => {
                if bytes.get(i + 1) == Some(&ESCAPE_CONT) {
                    key.push(0x00);
                    i += 2;
                } else {
                    // Separator: exactly eight timestamp bytes must follow.
                    let suffix = bytes.get(i + 1..)?;
                    let ts_bytes: [u8; 8] = suffix.try_into().ok()?;
                    let ts = u64::from_be_bytes(ts_bytes);
                    if ts > i64::MAX as u64 || key.is_empty() {
                        return None;
                    }
                    return Some((String::from_utf8(key).ok()?, ts as i64));
                }
            }
            b => {
                key.push(b);
                i += 1;
            }
        }
    }
}

/// Encodes a record value as `tag ‖ payload`.
pub fn record_value(payload: &Payload) -> Vec<u8> {
    match payload {
        Payload::Value(bytes) => {
            let mut out = Vec::with_capacity(bytes.len() + 1);
            out.push(TAG_VALUE);
            out.extend_from_slice(bytes);
            out
        }
        Payload::Tombstone => vec![TAG_TOMBSTONE],
    }
}

/// Decodes a record value.
///
/// # Errors
///
/// Returns [`MatrixError::CorruptRecord`] on an empty value, an unknown
/// tag, or a tombstone carrying payload bytes.
pub fn decode_record_value(bytes: &[u8]) -> Result<Payload> {
    match bytes.split_first() {
        Some((&TAG_VALUE, payload)) => Ok(Payload::Value(payload.to_vec())),
        Some((&TAG_TOMBSTONE, payload)) => {
            if payload.is_empty() {
                Ok(Payload::Tombstone)
            } else {
                Err(MatrixError::CorruptRecord(
                    "tombstone with non-empty payload".to_string(),
                ))
            }
        }
        Some((&tag, _)) => Err(MatrixError::CorruptRecord(format!(
            "unknown value tag {tag:#04x}"
        ))),
        None => Err(MatrixError::CorruptRecord("empty record value".to_string())),
    }
}

/// Encodes the commit-index key for the record `(user_key, timestamp)`.
pub fn commit_index_key(timestamp: Timestamp, user_key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMMIT_INDEX_PREFIX.len() + 8 + user_key.len());
    out.extend_from_slice(COMMIT_INDEX_PREFIX);
    out.extend_from_slice(&(timestamp as u64).to_be_bytes());
    escape_into(user_key.as_bytes(), &mut out);
    out
}

/// Returns the commit-index probe for the start of `timestamp`:
/// every index entry at or above `timestamp` sorts at or above it.
pub fn commit_index_floor(timestamp: Timestamp) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMMIT_INDEX_PREFIX.len() + 8);
    out.extend_from_slice(COMMIT_INDEX_PREFIX);
    out.extend_from_slice(&(timestamp as u64).to_be_bytes());
    out
}

/// Returns the exclusive end of the whole commit-index region.
pub fn commit_index_region_end() -> Vec<u8> {
    // Timestamps are non-negative i64, so the big-endian suffix never
    // reaches 0x80 in its first byte.
    let mut out = Vec::with_capacity(COMMIT_INDEX_PREFIX.len() + 1);
    out.extend_from_slice(COMMIT_INDEX_PREFIX);
    out.push(0x80);
    out
}

/// Splits a commit-index key back into `(timestamp, user_key)`.
pub fn decode_commit_index_key(bytes: &[u8]) -> Option<(Timestamp, String)> {
    let rest = bytes.strip_prefix(COMMIT_INDEX_PREFIX)?;
    if rest.len() < 8 {
        return None;
    }
    let (ts_bytes, key_bytes) = rest.split_at(8);
    let ts = u64::from_be_bytes(ts_bytes.try_into().ok()?);
    if ts > i64::MAX as u64 || key_bytes.is_empty() {
        return None;
    }
    let key = unescape(key_bytes)?;
    Some((ts as i64, String::from_utf8(key).ok()?))
}

/// Keyspace metadata persisted under [`META_KEY`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixMeta {
    /// The keyspace name. Never empty.
    pub keyspace: String,
    /// The timestamp at which the matrix was created. Never negative.
    pub creation_timestamp: Timestamp,
}

impl MatrixMeta {
    /// Serializes the metadata record.
    ///
    /// Layout (little-endian): magic (4) ‖ version (2) ‖ creation
    /// timestamp (8) ‖ name length (2) ‖ name bytes ‖ CRC32 of everything
    /// preceding (4).
    pub fn to_bytes(&self) -> Vec<u8> {
        let name = self.keyspace.as_bytes();
        let mut out = Vec::with_capacity(4 + 2 + 8 + 2 + name.len() + 4);
        out.extend_from_slice(&META_MAGIC);
        out.extend_from_slice(&META_VERSION.to_le_bytes());
        out.extend_from_slice(&self.creation_timestamp.to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Deserializes and verifies a metadata record.
    ///
    /// # Errors
    ///
    /// Returns [`MatrixError::CorruptMetadata`] on framing errors and
    /// [`MatrixError::ChecksumMismatch`] when the CRC32 does not match.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        const FIXED: usize = 4 + 2 + 8 + 2;
        if bytes.len() < FIXED + 4 {
            return Err(MatrixError::CorruptMetadata(
                "record too short".to_string(),
            ));
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let expected = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(MatrixError::ChecksumMismatch { expected, actual });
        }

        if body[0..4] != META_MAGIC {
            return Err(MatrixError::CorruptMetadata(format!(
                "bad magic {:?}",
                &body[0..4]
            )));
        }
        let version = u16::from_le_bytes(body[4..6].try_into().unwrap());
        if version != META_VERSION {
            return Err(MatrixError::CorruptMetadata(format!(
                "unsupported version {version}"
            )));
        }
        let creation_timestamp = i64::from_le_bytes(body[6..14].try_into().unwrap());
        if creation_timestamp < 0 {
            return Err(MatrixError::CorruptMetadata(
                "negative creation timestamp".to_string(),
            ));
        }
        let name_len = u16::from_le_bytes(body[14..16].try_into().unwrap()) as usize;
        if body.len() != FIXED + name_len {
            return Err(MatrixError::CorruptMetadata(
                "name length mismatch".to_string(),
            ));
        }
        let keyspace = std::str::from_utf8(&body[FIXED..])
            .map_err(|_| MatrixError::CorruptMetadata("name is not UTF-8".to_string()))?
            .to_string();
        if keyspace.is_empty() {
            return Err(MatrixError::CorruptMetadata(
                "empty keyspace name".to_string(),
            ));
        }
        Ok(Self {
            keyspace,
            creation_timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keys_order_by_key_then_timestamp() {
        let mut keys = vec![
            record_key("b", 5),
            record_key("a", 9),
            record_key("a", 1),
            record_key("ab", 0),
            record_key("b", 0),
        ];
        keys.sort();
        let decoded: Vec<_> = keys
            .iter()
            .map(|k| decode_record_key(k).unwrap())
            .collect();
        assert_eq!(
            decoded,
            vec![
                ("a".to_string(), 1),
                ("a".to_string(), 9),
                ("ab".to_string(), 0),
                ("b".to_string(), 0),
                ("b".to_string(), 5),
            ]
        );
    }

    #[test]
    fn test_embedded_nul_keys_do_not_collide() {
        // "a" at a huge timestamp vs "a\0" at timestamp 0: the escape keeps
        // the runs disjoint and ordered.
        let a_late = record_key("a", i64::MAX);
        let a_nul_early = record_key("a\0", 0);
        assert!(a_late < a_nul_early);

        let (key, ts) = decode_record_key(&a_nul_early).unwrap();
        assert_eq!(key, "a\0");
        assert_eq!(ts, 0);
    }

    #[test]
    fn test_record_run_end_bounds_exactly_one_key() {
        let end = record_run_end(record_key_prefix("a"));
        assert!(record_key("a", i64::MAX) < end);
        // A key that extends "a" with a NUL still sorts after the run end.
        assert!(record_key("a\0", 0) > end);
        assert!(record_key("aa", 0) > end);
    }

    #[test]
    fn test_reserved_keys_sort_below_records() {
        assert!(META_KEY.to_vec() < RECORD_REGION_START.to_vec());
        assert!(commit_index_key(i64::MAX, "zzz") < RECORD_REGION_START.to_vec());
        assert!(record_key("\0", 0) >= RECORD_REGION_START.to_vec());
    }

    #[test]
    fn test_record_value_tags() {
        assert_eq!(record_value(&Payload::Tombstone), vec![TAG_TOMBSTONE]);
        // An empty byte-string value is distinct from a tombstone.
        assert_eq!(record_value(&Payload::Value(vec![])), vec![TAG_VALUE]);
        assert_eq!(
            decode_record_value(&[TAG_VALUE]).unwrap(),
            Payload::Value(vec![])
        );
        assert_eq!(
            decode_record_value(&[TAG_TOMBSTONE]).unwrap(),
            Payload::Tombstone
        );
        assert!(decode_record_value(&[]).is_err());
        assert!(decode_record_value(&[0x02, 1, 2]).is_err());
        assert!(decode_record_value(&[TAG_TOMBSTONE, 1]).is_err());
    }

    #[test]
    fn test_commit_index_orders_by_timestamp_then_key() {
        let mut keys = vec![
            commit_index_key(3, "b"),
            commit_index_key(3, "a"),
            commit_index_key(1, "z"),
            commit_index_key(10, "a"),
        ];
        keys.sort();
        let decoded: Vec<_> = keys
            .iter()
            .map(|k| decode_commit_index_key(k).unwrap())
            .collect();
        assert_eq!(
            decoded,
            vec![
                (1, "z".to_string()),
                (3, "a".to_string()),
                (3, "b".to_string()),
                (10, "a".to_string()),
            ]
        );
    }

    #[test]
    fn test_commit_index_region_bounds() {
        assert!(commit_index_key(i64::MAX, "any") < commit_index_region_end());
        assert!(commit_index_region_end() < META_KEY.to_vec());
        assert!(commit_index_region_end() < RECORD_REGION_START.to_vec());
    }

    #[test]
    fn test_meta_roundtrip() {
        let meta = MatrixMeta {
            keyspace: "default".to_string(),
            creation_timestamp: 42,
        };
        let decoded = MatrixMeta::from_bytes(&meta.to_bytes()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_meta_detects_tampering() {
        let meta = MatrixMeta {
            keyspace: "default".to_string(),
            creation_timestamp: 42,
        };
        let mut bytes = meta.to_bytes();
        bytes[7] ^= 0x01;
        assert!(matches!(
            MatrixMeta::from_bytes(&bytes),
            Err(MatrixError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_meta_rejects_bad_magic() {
        let meta = MatrixMeta {
            keyspace: "k".to_string(),
            creation_timestamp: 0,
        };
        let mut bytes = meta.to_bytes();
        bytes[0] = b'X';
        // Fix up the checksum so the magic check itself is exercised.
        let body_len = bytes.len() - 4;
        let crc = crc32fast::hash(&bytes[..body_len]);
        bytes[body_len..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            MatrixMeta::from_bytes(&bytes),
            Err(MatrixError::CorruptMetadata(_))
        ));
    }

    #[test]
    fn test_decode_rejects_malformed_record_keys() {
        // Reserved key.
        assert_eq!(decode_record_key(META_KEY), None);
        // Truncated timestamp suffix.
        let mut key = record_key("a", 7);
        key.pop();
        assert_eq!(decode_record_key(&key), None);
        // Missing separator entirely.
        assert_eq!(decode_record_key(b"abc"), None);
    }
}
