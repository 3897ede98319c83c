use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde_json::{json, Map, Value};
use tracing::{debug, trace};

use crate::bucket::{Bucket, BucketId, BucketInner};
use crate::config::CatalogConfig;
use crate::metadata::BucketKey;
use crate::stats::ExecutionStats;

/// Lifecycle state of a bucket.
///
/// States are tracked in their own map, keyed by bucket id, so an external
/// clear-by-id never has to locate the bucket first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketState {
    /// Open for inserts.
    Normal,
    /// A batch is being committed externally; inserts are still accepted.
    Prepared,
    /// The bucket must be forgotten; it is deleted on next touch and pending
    /// batches observe an error.
    Cleared,
    /// Cleared while a commit was in flight.
    PreparedAndCleared,
}

/// The write-side batching layer of a time-series storage engine.
///
/// Concurrent writers insert measurements tagged by `(namespace, metadata)`;
/// the catalog groups them into time-aligned buckets bounded in count, bytes
/// and time span, and hands finished batches to an external writer through
/// [`prepare_commit`](Self::prepare_commit) / [`finish`](Self::finish).
/// Nothing is persisted here — the catalog is purely in-memory.
///
/// # Thread safety
///
/// The catalog is safe to share across threads. Bucket maps sit behind a
/// reader/writer lock, each bucket behind its own mutex, and lifecycle
/// states, the idle pool and statistics behind their own leaf locks.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use serde_json::json;
/// use silo::{BinaryComparator, BucketCatalog, CombinePolicy, TimeseriesOptions};
///
/// let catalog = BucketCatalog::default();
/// let options = TimeseriesOptions::new("t").with_meta_field("tag");
/// let batch = catalog
///     .insert(
///         "db.weather",
///         Arc::new(BinaryComparator),
///         &options,
///         json!({ "t": 1_700_000_000_000_i64, "tag": "berlin", "temp": 11.5 }),
///         CombinePolicy::Allow,
///         uuid::Uuid::new_v4(),
///     )
///     .unwrap();
/// assert!(batch.active());
/// ```
pub struct BucketCatalog {
    pub(crate) config: CatalogConfig,
    /// Open and owned bucket maps, under one reader/writer lock.
    pub(crate) buckets: RwLock<BucketMaps>,
    /// Bucket lifecycle states. Leaf mutex, never held across other locks.
    pub(crate) states: Mutex<HashMap<BucketId, BucketState>>,
    /// Buckets with no pending work, most recently used first.
    pub(crate) idle: Mutex<LruCache<u64, ()>>,
    /// Per-namespace execution counters.
    pub(crate) stats: RwLock<HashMap<String, Arc<ExecutionStats>>>,
    /// Catalog-wide memory estimate, updated by delta.
    pub(crate) memory_usage: AtomicU64,
}

#[derive(Default)]
pub(crate) struct BucketMaps {
    /// `(namespace, metadata)` → the currently open bucket.
    pub open: HashMap<BucketKey, Arc<Bucket>>,
    /// Stable id suffix → every live bucket. Owner of last resort.
    pub all:  HashMap<u64, Arc<Bucket>>,
}

impl Default for BucketCatalog {
    fn default() -> Self {
        Self::new(CatalogConfig::default())
    }
}

impl BucketCatalog {
    /// Creates an empty catalog with the given limits.
    pub fn new(config: CatalogConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(BucketMaps::default()),
            states: Mutex::new(HashMap::new()),
            idle: Mutex::new(LruCache::unbounded()),
            stats: RwLock::new(HashMap::new()),
            memory_usage: AtomicU64::new(0),
        }
    }

    /// Best-effort snapshot of the catalog's memory footprint in bytes.
    pub fn memory_usage(&self) -> u64 {
        self.memory_usage.load(AtomicOrdering::Relaxed)
    }

    /// Server-status snapshot, mounted by callers under `bucketCatalog`.
    /// `None` until any statistics have been recorded.
    pub fn server_status(&self) -> Option<Value> {
        if self.stats.read().unwrap().is_empty() {
            return None;
        }

        let maps = self.buckets.read().unwrap();
        Some(json!({
            "numBuckets": maps.all.len(),
            "numOpenBuckets": maps.open.len(),
            "numIdleBuckets": self.num_idle_buckets(),
            "memoryUsage": self.memory_usage(),
        }))
    }

    /// Snapshots the execution counters for `ns` into `out`.
    pub fn append_execution_stats(&self, ns: &str, out: &mut Map<String, Value>) {
        let stats = self
            .stats_if_present(ns)
            .unwrap_or_else(|| Arc::new(ExecutionStats::default()));
        stats.append_to(out);
    }

    // ---- statistics ----

    /// The execution-stats handle for `ns`, created on first use.
    pub(crate) fn stats_for(&self, ns: &str) -> Arc<ExecutionStats> {
        {
            let stats = self.stats.read().unwrap();
            if let Some(entry) = stats.get(ns) {
                return entry.clone();
            }
        }

        let mut stats = self.stats.write().unwrap();
        stats.entry(ns.to_owned()).or_default().clone()
    }

    fn stats_if_present(&self, ns: &str) -> Option<Arc<ExecutionStats>> {
        self.stats.read().unwrap().get(ns).cloned()
    }

    // ---- lifecycle states ----

    pub(crate) fn bucket_state(&self, id: &BucketId) -> Option<BucketState> {
        self.states.lock().unwrap().get(id).copied()
    }

    /// Applies the transition towards `target` and returns the resulting
    /// state, or `None` when the bucket is unknown. Transitions are total:
    /// a target that does not apply to the current state leaves it alone.
    pub(crate) fn set_bucket_state(&self, id: &BucketId, target: BucketState) -> Option<BucketState> {
        let mut states = self.states.lock().unwrap();
        let state = states.get_mut(id)?;
        let next = match (target, *state) {
            (BucketState::Normal, BucketState::Prepared) => BucketState::Normal,
            (BucketState::Normal, BucketState::PreparedAndCleared) => BucketState::Cleared,
            (BucketState::Prepared, BucketState::Normal) => BucketState::Prepared,
            (BucketState::Cleared, BucketState::Normal) => BucketState::Cleared,
            (BucketState::Cleared, BucketState::Prepared) => BucketState::PreparedAndCleared,
            (BucketState::PreparedAndCleared, current) => {
                debug_assert!(false, "prepared-and-cleared is never a transition target");
                current
            },
            (_, current) => current,
        };
        let previous = *state;
        if next != previous {
            trace!(bucket = %id, from = ?previous, to = ?next, "bucket state transition");
            *state = next;
        }
        Some(*state)
    }

    /// Rewrites the id's timestamp half and moves the state-map entry in one
    /// step. Only valid for buckets without committed or in-flight batches.
    pub(crate) fn lower_id_timestamp(&self, inner: &mut BucketInner, time: DateTime<Utc>) {
        let old = inner.id;
        inner.id = old.with_timestamp(time);
        let mut states = self.states.lock().unwrap();
        states.remove(&old);
        states.insert(inner.id, BucketState::Normal);
        debug!(from = %old, to = %inner.id, "lowered bucket nominal time");
    }

    // ---- idle pool ----

    pub(crate) fn mark_idle(&self, suffix: u64) {
        self.idle.lock().unwrap().put(suffix, ());
    }

    pub(crate) fn mark_not_idle(&self, suffix: u64) {
        self.idle.lock().unwrap().pop(&suffix);
    }

    pub(crate) fn num_idle_buckets(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    /// Reaps least-recently-idle buckets while the catalog is over its
    /// memory threshold. Callers hold the maps write guard.
    pub(crate) fn expire_idle_buckets(&self, maps: &mut BucketMaps, stats: &ExecutionStats) {
        while self.memory_usage() > self.config.idle_bucket_expiry_memory_usage_threshold {
            let oldest = self.idle.lock().unwrap().pop_lru();
            let Some((suffix, ())) = oldest else {
                break;
            };
            let Some(bucket) = maps.all.get(&suffix).cloned() else {
                continue;
            };
            if self.remove_bucket(maps, &bucket) {
                stats
                    .num_buckets_closed_due_to_memory_threshold
                    .fetch_add(1, AtomicOrdering::Relaxed);
            }
        }
    }

    // ---- allocation and removal ----

    /// Allocates a fresh bucket for `key` and registers it everywhere.
    /// Callers hold the maps write guard.
    pub(crate) fn allocate_bucket(
        &self,
        maps: &mut BucketMaps,
        key: &BucketKey,
        time: DateTime<Utc>,
        stats: &ExecutionStats,
        opened_due_to_metadata: bool,
    ) -> Arc<Bucket> {
        self.expire_idle_buckets(maps, stats);

        let id = BucketId::generate(time);
        let bucket = Bucket::new(id, key.metadata.comparator().clone());
        maps.all.insert(id.suffix(), bucket.clone());
        maps.open.insert(key.clone(), bucket.clone());
        self.states.lock().unwrap().insert(id, BucketState::Normal);

        if opened_due_to_metadata {
            stats
                .num_buckets_opened_due_to_metadata
                .fetch_add(1, AtomicOrdering::Relaxed);
        }

        debug!(bucket = %id, ns = %key.ns, "opened bucket");
        bucket
    }

    /// Removes an unused bucket from every structure. Callers hold the maps
    /// write guard; the bucket mutex fences out concurrent holders, and the
    /// removal is abandoned when the bucket regained work in the meantime.
    pub(crate) fn remove_bucket(&self, maps: &mut BucketMaps, bucket: &Arc<Bucket>) -> bool {
        let inner = bucket.lock();
        if !inner.batches.is_empty() || inner.prepared_batch.is_some() {
            return false;
        }

        self.memory_usage
            .fetch_sub(inner.memory_usage, AtomicOrdering::Relaxed);
        self.mark_not_idle(bucket.suffix());
        let key = BucketKey {
            ns:       inner.ns.clone(),
            metadata: inner.metadata.clone(),
        };
        if maps.open.get(&key).is_some_and(|open| Arc::ptr_eq(open, bucket)) {
            maps.open.remove(&key);
        }
        self.states.lock().unwrap().remove(&inner.id);
        trace!(bucket = %inner.id, "removed bucket");
        drop(inner);
        maps.all.remove(&bucket.suffix());
        true
    }
}
