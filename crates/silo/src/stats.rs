//! Per-namespace execution counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};

/// Execution counters for one time-series namespace.
///
/// Shared by reference between the catalog, buckets and batches; all fields
/// are relaxed atomics and need no outer lock once the handle is obtained.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    pub(crate) num_bucket_inserts: AtomicU64,
    pub(crate) num_bucket_updates: AtomicU64,
    pub(crate) num_buckets_opened_due_to_metadata: AtomicU64,
    pub(crate) num_buckets_closed_due_to_count: AtomicU64,
    pub(crate) num_buckets_closed_due_to_size: AtomicU64,
    pub(crate) num_buckets_closed_due_to_time_forward: AtomicU64,
    pub(crate) num_buckets_closed_due_to_time_backward: AtomicU64,
    pub(crate) num_buckets_closed_due_to_memory_threshold: AtomicU64,
    pub(crate) num_commits: AtomicU64,
    pub(crate) num_waits: AtomicU64,
    pub(crate) num_measurements_committed: AtomicU64,
}

impl ExecutionStats {
    /// Appends this namespace's counters to `out` in server-status shape.
    pub fn append_to(&self, out: &mut Map<String, Value>) {
        let mut put = |name: &str, value: u64| {
            out.insert(name.to_owned(), Value::from(value));
        };

        put("numBucketInserts", self.num_bucket_inserts.load(Ordering::Relaxed));
        put("numBucketUpdates", self.num_bucket_updates.load(Ordering::Relaxed));
        put(
            "numBucketsOpenedDueToMetadata",
            self.num_buckets_opened_due_to_metadata.load(Ordering::Relaxed),
        );
        put(
            "numBucketsClosedDueToCount",
            self.num_buckets_closed_due_to_count.load(Ordering::Relaxed),
        );
        put(
            "numBucketsClosedDueToSize",
            self.num_buckets_closed_due_to_size.load(Ordering::Relaxed),
        );
        put(
            "numBucketsClosedDueToTimeForward",
            self.num_buckets_closed_due_to_time_forward.load(Ordering::Relaxed),
        );
        put(
            "numBucketsClosedDueToTimeBackward",
            self.num_buckets_closed_due_to_time_backward.load(Ordering::Relaxed),
        );
        put(
            "numBucketsClosedDueToMemoryThreshold",
            self.num_buckets_closed_due_to_memory_threshold.load(Ordering::Relaxed),
        );

        let commits = self.num_commits.load(Ordering::Relaxed);
        put("numCommits", commits);
        put("numWaits", self.num_waits.load(Ordering::Relaxed));
        let measurements = self.num_measurements_committed.load(Ordering::Relaxed);
        put("numMeasurementsCommitted", measurements);
        if commits > 0 {
            put("avgNumMeasurementsPerCommit", measurements / commits);
        }
    }
}
