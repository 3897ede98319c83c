use thiserror::Error;

use crate::bucket::BucketId;

/// Catalog-wide error type.
///
/// Errors are either returned synchronously from catalog operations or
/// delivered through a batch's shared result channel, which is why the type
/// is `Clone`.
#[derive(Error, Debug, Clone)]
pub enum CatalogError {
    /// The measurement lacks a valid datetime in the configured time field.
    #[error("'{field}' must be present and contain a valid datetime value")]
    BadTimeField {
        field: String,
    },

    /// The batch's bucket was cleared before or during its commit.
    #[error("time-series bucket {bucket_id} for '{namespace}' was cleared")]
    BucketCleared {
        bucket_id: BucketId,
        namespace: String,
    },

    /// A bucket was cleared while a batch was being committed; the clearer
    /// should yield and retry.
    #[error("conflicting commit in flight for time-series bucket {bucket_id}")]
    WriteConflict {
        bucket_id: BucketId,
    },

    /// The external writer failed to persist a batch.
    #[error("commit failed: {reason}")]
    CommitFailed {
        reason: String,
    },
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CatalogError>;
