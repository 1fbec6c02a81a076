//! Error and Result types for Burrow matrix operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for Burrow operations.
pub type Result<T> = std::result::Result<T, MatrixError>;

/// The error type for temporal matrix operations.
#[derive(Debug, Error)]
pub enum MatrixError {
    /// A timestamp argument was negative.
    #[error("Negative timestamp: {0}")]
    NegativeTimestamp(i64),

    /// A user key argument was empty.
    #[error("User key must not be empty")]
    EmptyKey,

    /// A keyspace name was empty at matrix creation.
    #[error("Keyspace name must not be empty")]
    EmptyKeyspace,

    /// A timestamp range had its bounds out of order.
    #[error("Invalid timestamp range: lower bound {lower} exceeds upper bound {upper}")]
    InvalidRange {
        /// Lower bound of the requested range (inclusive).
        lower: i64,
        /// Upper bound of the requested range (inclusive).
        upper: i64,
    },

    /// A write was attempted at or below the last accepted timestamp.
    #[error("Non-monotonic write at timestamp {attempted}: high water mark is {last}")]
    MonotonicityViolation {
        /// The timestamp the caller attempted to write at.
        attempted: i64,
        /// The highest timestamp already accepted by this matrix.
        last: i64,
    },

    /// A bulk insert collided with an existing incompatible entry.
    #[error("Conflicting entry for key {key:?} at timestamp {timestamp}")]
    Conflict {
        /// The user key of the conflicting entry.
        key: String,
        /// The timestamp of the conflicting entry.
        timestamp: i64,
    },

    /// The keyspace metadata record failed its checksum.
    #[error("Metadata checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// The keyspace metadata record could not be decoded.
    #[error("Corrupt metadata record: {0}")]
    CorruptMetadata(String),

    /// A stored record could not be decoded.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// A matrix already exists on the target byte-map.
    #[error("Keyspace {0:?} already exists on this byte-map")]
    KeyspaceExists(String),

    /// No matrix metadata was found on the byte-map at open.
    #[error("No keyspace metadata found on this byte-map")]
    MissingMetadata,

    /// Operation attempted on a matrix that is closing or closed.
    #[error("Matrix is closed")]
    Closed,

    /// The matrix is degraded after a failed rollback and must be reopened.
    #[error("Matrix is degraded after a failed rollback; reopen required")]
    Degraded,

    /// Underlying byte-map I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
