//! Burrow - Alopex versioned keyspace storage.
//!
//! This crate provides the full-history storage primitive for the Alopex
//! database: a temporal matrix per keyspace, from which any past state can
//! be reconstructed, any key's value trajectory recovered, and any range
//! of commits enumerated.
//!
//! # Components
//!
//! - [`TemporalMatrix`]: the matrix itself - point-in-time reads, history
//!   and snapshot iteration, batched writes, rollback
//! - [`SortedByteMap`] / [`MapSnapshot`]: the ordered storage abstraction
//!   a matrix runs on
//! - [`MemoryByteMap`]: the bundled in-memory MVCC backend
//!
//! # Example
//!
//! ```rust
//! use alopex_burrow::{MatrixConfig, MemoryByteMap, TemporalMatrix};
//! use std::collections::HashMap;
//!
//! # fn main() -> alopex_burrow::Result<()> {
//! let matrix =
//!     TemporalMatrix::create(MemoryByteMap::new(), "default", 0, MatrixConfig::default())?;
//!
//! // Commit two versions of the same key.
//! let mut contents = HashMap::new();
//! contents.insert("greeting".to_string(), Some(b"hello".to_vec()));
//! matrix.put(1, contents)?;
//! let mut contents = HashMap::new();
//! contents.insert("greeting".to_string(), Some(b"goodbye".to_vec()));
//! matrix.put(5, contents)?;
//!
//! // Read the keyspace as of any timestamp.
//! assert_eq!(matrix.get(3, "greeting")?, Some(b"hello".to_vec()));
//! assert_eq!(matrix.get(5, "greeting")?, Some(b"goodbye".to_vec()));
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod bytemap;
pub mod error;
pub mod matrix;

pub use bytemap::{BatchOp, MapSnapshot, MemoryByteMap, MemorySnapshot, SortedByteMap, WriteBatch};
pub use error::{MatrixError, Result};
pub use matrix::{
    MatrixConfig, MatrixState, Payload, RangedGetResult, TemporalEntry, TemporalKey,
    TemporalMatrix, Timestamp, ValidityPeriod, NO_COMMITS,
};
