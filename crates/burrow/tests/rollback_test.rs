//! Rollback and reopen tests: truncation completeness, clamping, cache
//! invalidation, and high-water-mark reconstruction.

use alopex_burrow::{MatrixConfig, MatrixError, MemoryByteMap, TemporalMatrix, NO_COMMITS};
use std::collections::HashMap;
use std::sync::Arc;

fn configs() -> [MatrixConfig; 2] {
    [
        MatrixConfig::default(),
        MatrixConfig {
            commit_index: false,
            last_commit_cache: false,
        },
    ]
}

fn put(matrix: &TemporalMatrix<Arc<MemoryByteMap>>, ts: i64, pairs: &[(&str, Option<&[u8]>)]) {
    let contents: HashMap<String, Option<Vec<u8>>> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.map(<[u8]>::to_vec)))
        .collect();
    matrix.put(ts, contents).unwrap();
}

/// Builds the shared fixture on a shareable byte-map so tests can reopen
/// the same storage after dropping the matrix.
fn seeded(config: MatrixConfig) -> (Arc<MemoryByteMap>, TemporalMatrix<Arc<MemoryByteMap>>) {
    let map = Arc::new(MemoryByteMap::new());
    let matrix = TemporalMatrix::create(Arc::clone(&map), "default", 0, config).unwrap();
    put(&matrix, 1, &[("a", Some(b"V1"))]);
    put(&matrix, 3, &[("a", Some(b"V3")), ("b", Some(b"V4"))]);
    put(&matrix, 5, &[("b", None)]);
    (map, matrix)
}

#[test]
fn test_rollback_restores_previous_state() {
    for config in configs() {
        let (_, matrix) = seeded(config);
        matrix.rollback(3).unwrap();

        // The deletion at 5 is gone; reads above 3 equal reads at 3.
        assert_eq!(matrix.get(5, "b").unwrap(), Some(b"V4".to_vec()));
        for t in 4..9 {
            for key in ["a", "b"] {
                assert_eq!(
                    matrix.get(t, key).unwrap(),
                    matrix.get(3, key).unwrap(),
                    "t={t} key={key}"
                );
            }
        }
        assert_eq!(matrix.last_commit_timestamp("b").unwrap(), 3);
        assert_eq!(matrix.last_commit_timestamp("a").unwrap(), 3);

        let history: Vec<i64> = matrix.history(i64::MAX, "b").unwrap().collect();
        assert_eq!(history, vec![3]);
        assert!(matrix
            .get_modifications_between(4, i64::MAX)
            .unwrap()
            .next()
            .is_none());
    }
}

#[test]
fn test_rollback_removes_whole_keys() {
    for config in configs() {
        let (_, matrix) = seeded(config);
        put(&matrix, 7, &[("late", Some(b"x"))]);
        matrix.rollback(5).unwrap();

        // A key whose every entry was rolled back no longer exists at all.
        let all: Vec<String> = matrix.all_keys().unwrap().collect();
        assert_eq!(all, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(matrix.last_commit_timestamp("late").unwrap(), NO_COMMITS);
        assert_eq!(matrix.get(9, "late").unwrap(), None);
    }
}

#[test]
fn test_rollback_frees_timestamps_for_rewriting() {
    for config in configs() {
        let (_, matrix) = seeded(config);
        matrix.rollback(3).unwrap();

        // Timestamps above the target are writable again.
        put(&matrix, 4, &[("a", Some(b"rewritten"))]);
        assert_eq!(matrix.get(4, "a").unwrap(), Some(b"rewritten".to_vec()));
        let history: Vec<i64> = matrix.history(i64::MAX, "a").unwrap().collect();
        assert_eq!(history, vec![4, 3, 1]);
    }
}

#[test]
fn test_rollback_clamps_below_creation() {
    for config in configs() {
        let map = Arc::new(MemoryByteMap::new());
        let matrix = TemporalMatrix::create(Arc::clone(&map), "k", 10, config).unwrap();
        put(&matrix, 12, &[("a", Some(b"v"))]);

        // Target 3 is clamped up to the creation timestamp 10.
        matrix.rollback(3).unwrap();
        assert_eq!(matrix.get(12, "a").unwrap(), None);
        // The next write may land exactly on the creation timestamp.
        put(&matrix, 10, &[("a", Some(b"w"))]);
        assert_eq!(matrix.get(10, "a").unwrap(), Some(b"w".to_vec()));
    }
}

#[test]
fn test_rollback_above_high_water_raises_it() {
    for config in configs() {
        let (_, matrix) = seeded(config);
        matrix.rollback(100).unwrap();

        // Nothing was removed...
        assert_eq!(matrix.get(5, "b").unwrap(), None);
        assert_eq!(matrix.get(3, "a").unwrap(), Some(b"V3".to_vec()));
        // ...but the high water mark moved to the target.
        assert!(matches!(
            matrix.put(50, HashMap::from([("c".to_string(), None)])),
            Err(MatrixError::MonotonicityViolation { last: 100, .. })
        ));
        put(&matrix, 101, &[("c", Some(b"x"))]);
    }
}

#[test]
fn test_rollback_rejected_after_close() {
    let (_, matrix) = seeded(MatrixConfig::default());
    matrix.close();
    assert!(matches!(matrix.rollback(3), Err(MatrixError::Closed)));
}

// ============================================================================
// Reopen
// ============================================================================

#[test]
fn test_reopen_restores_metadata_and_high_water() {
    for config in configs() {
        let (map, matrix) = seeded(config);
        drop(matrix);

        let reopened = TemporalMatrix::open(Arc::clone(&map), config).unwrap();
        assert_eq!(reopened.keyspace(), "default");
        assert_eq!(reopened.creation_timestamp(), 0);
        assert_eq!(reopened.get(4, "b").unwrap(), Some(b"V4".to_vec()));

        // The rebuilt high water mark still guards monotonicity.
        assert!(matches!(
            reopened.put(5, HashMap::from([("c".to_string(), None)])),
            Err(MatrixError::MonotonicityViolation { last: 5, .. })
        ));
        let contents: HashMap<String, Option<Vec<u8>>> =
            HashMap::from([("c".to_string(), Some(b"x".to_vec()))]);
        reopened.put(6, contents).unwrap();
    }
}

#[test]
fn test_reopen_after_rollback_sees_truncated_history() {
    for config in configs() {
        let (map, matrix) = seeded(config);
        matrix.rollback(3).unwrap();
        drop(matrix);

        let reopened = TemporalMatrix::open(Arc::clone(&map), config).unwrap();
        assert_eq!(reopened.get(9, "b").unwrap(), Some(b"V4".to_vec()));
        assert_eq!(reopened.last_commit_timestamp("b").unwrap(), 3);
        // Timestamp 4 is free again after the reopen.
        let contents: HashMap<String, Option<Vec<u8>>> =
            HashMap::from([("b".to_string(), None)]);
        reopened.put(4, contents).unwrap();
        assert_eq!(reopened.get(4, "b").unwrap(), None);
    }
}

#[test]
fn test_reopen_of_empty_matrix_allows_put_at_creation() {
    for config in configs() {
        let map = Arc::new(MemoryByteMap::new());
        let matrix = TemporalMatrix::create(Arc::clone(&map), "k", 7, config).unwrap();
        drop(matrix);

        let reopened = TemporalMatrix::open(Arc::clone(&map), config).unwrap();
        assert_eq!(reopened.creation_timestamp(), 7);
        let contents: HashMap<String, Option<Vec<u8>>> =
            HashMap::from([("a".to_string(), Some(b"v".to_vec()))]);
        reopened.put(7, contents).unwrap();
    }
}
