//! Silo: the in-memory write-side batching layer of a time-series storage
//! engine.
//!
//! Concurrent writers insert measurement documents tagged by
//! `(namespace, metadata)`; the catalog groups them into buckets bounded in
//! count, bytes and time span, tracks running min/max control documents with
//! incremental diffs, and hands committable batches to an external writer.
//! Persistence, flush scheduling and durability live elsewhere.

/// Write batches and commit plumbing.
mod batch;
/// Buckets and their identifiers.
mod bucket;
/// The catalog: container, locking and lifecycle operations.
mod catalog;
/// Value ordering utilities.
mod comparison;
/// Tunable limits.
mod config;
/// Error types.
mod error;
/// Measurement document helpers.
mod measurement;
/// Canonical metadata grouping keys.
mod metadata;
/// Running min/max trackers and their diff format.
mod minmax;
/// Per-namespace execution counters.
mod stats;

pub use batch::{CombinePolicy, CommitInfo, CommitResult, SessionId, WriteBatch};
pub use bucket::BucketId;
pub use catalog::{BucketCatalog, BucketState};
pub use comparison::{BinaryComparator, StringComparator};
pub use config::{CatalogConfig, TimeseriesOptions};
pub use error::{CatalogError, Result};
pub use metadata::BucketMetadata;
pub use minmax::{ARRAY_HEADER_KEY, SUB_DIFF_PREFIX, UPDATE_SECTION_KEY};
pub use stats::ExecutionStats;
