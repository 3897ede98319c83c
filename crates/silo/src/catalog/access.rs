//! Bucket acquisition under the catalog's lock hierarchy.
//!
//! Lock order, outermost first: bucket maps rwlock, bucket mutex, state-map
//! mutex, idle-pool mutex. The stats rwlock is an independent sub-hierarchy.
//! A bucket mutex is always released before the maps lock is retaken at a
//! higher mode.
//!
//! Acquisition is optimistic: helpers hand out the `Arc`, the caller locks
//! the bucket and re-validates against the state map, and a lost race is a
//! retry rather than a dangling pointer.

use std::sync::{Arc, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::catalog::{BucketCatalog, BucketState};
use crate::batch::WriteBatch;
use crate::bucket::{Bucket, BucketInner};
use crate::metadata::BucketKey;
use crate::stats::ExecutionStats;

impl BucketCatalog {
    /// Locks `bucket` and validates it against the state map.
    ///
    /// Returns `None` when the bucket was cleared or removed; otherwise the
    /// bucket is pulled off the idle pool and its guard returned.
    pub(crate) fn lock_usable<'b>(&self, bucket: &'b Bucket) -> Option<MutexGuard<'b, BucketInner>> {
        let inner = bucket.lock();
        match self.bucket_state(&inner.id) {
            Some(BucketState::Normal | BucketState::Prepared) => {
                self.mark_not_idle(bucket.suffix());
                Some(inner)
            },
            _ => None,
        }
    }

    /// Looks up the open bucket for `key` under the shared lock.
    pub(crate) fn find_open_bucket(&self, key: &BucketKey) -> Option<Arc<Bucket>> {
        self.buckets.read().unwrap().open.get(key).cloned()
    }

    /// Finds or creates the open bucket for `key` under the exclusive lock.
    /// A cleared leftover found in the open slot is aborted and replaced.
    pub(crate) fn find_or_create_bucket(
        &self,
        key: &BucketKey,
        time: DateTime<Utc>,
        stats: &ExecutionStats,
        opened_due_to_metadata: bool,
    ) -> Arc<Bucket> {
        let mut maps = self.buckets.write().unwrap();
        if let Some(bucket) = maps.open.get(key).cloned() {
            let inner = bucket.lock();
            match self.bucket_state(&inner.id) {
                Some(BucketState::Normal | BucketState::Prepared) => {
                    drop(inner);
                    self.mark_not_idle(bucket.suffix());
                    return bucket;
                },
                _ => {
                    trace!(ns = %key.ns, "open bucket was cleared; replacing it");
                    self.abort_bucket(&mut maps, &bucket, inner, None);
                },
            }
        }
        self.allocate_bucket(&mut maps, key, time, stats, opened_due_to_metadata)
    }

    /// Resolves a batch's back-link to its live bucket.
    pub(crate) fn lookup_bucket(&self, batch: &WriteBatch) -> Option<Arc<Bucket>> {
        let suffix = batch.bucket_suffix()?;
        self.buckets.read().unwrap().all.get(&suffix).cloned()
    }

    /// Closes a full bucket and installs a fresh one for `key`.
    ///
    /// Callers release the bucket mutex first. The open slot is re-read
    /// under the exclusive lock: when another writer already replaced the
    /// bucket, nothing happens and the caller retests fullness against the
    /// replacement. A drained bucket is removed outright; one with pending
    /// batches is latched `full` and left for `finish` to reap.
    pub(crate) fn rollover(
        &self,
        key: &BucketKey,
        old: &Arc<Bucket>,
        time: DateTime<Utc>,
        stats: &ExecutionStats,
    ) {
        let mut maps = self.buckets.write().unwrap();
        let Some(current) = maps.open.get(key).cloned() else {
            self.allocate_bucket(&mut maps, key, time, stats, false);
            return;
        };
        if !Arc::ptr_eq(&current, old) {
            return;
        }

        let mut inner = current.lock();
        match self.bucket_state(&inner.id) {
            Some(BucketState::Normal | BucketState::Prepared) => {},
            _ => {
                self.abort_bucket(&mut maps, &current, inner, None);
                self.allocate_bucket(&mut maps, key, time, stats, false);
                return;
            },
        }

        if inner.all_committed() {
            drop(inner);
            if !self.remove_bucket(&mut maps, &current) {
                // A racing insert slipped a batch in; leave the bucket for
                // finish to reap once it drains.
                current.lock().full = true;
            }
        }
        else {
            inner.full = true;
            drop(inner);
        }

        self.allocate_bucket(&mut maps, key, time, stats, false);
        debug!(ns = %key.ns, "rolled over full bucket");
    }

    /// Aborts every pending batch on `bucket` and removes it. `target` is
    /// the batch driving the abort, when there is one: a prepared batch is
    /// only failed when it is the target, since any other committer delivers
    /// its own outcome. Callers hold the maps write guard.
    pub(crate) fn abort_bucket(
        &self,
        maps: &mut super::catalog::BucketMaps,
        bucket: &Arc<Bucket>,
        mut inner: MutexGuard<'_, BucketInner>,
        target: Option<&Arc<WriteBatch>>,
    ) {
        let id = inner.id;
        for (_, batch) in inner.batches.drain() {
            batch.resolve_cleared();
        }
        if let Some(prepared) = inner.prepared_batch.take() {
            if target.is_some_and(|batch| Arc::ptr_eq(batch, &prepared)) {
                prepared.resolve_cleared();
            }
        }
        // Retire the state entry before the bucket mutex drops, so a racing
        // acquisition re-validates as gone instead of attaching new work.
        self.states.lock().unwrap().remove(&inner.id);
        drop(inner);

        let removed = self.remove_bucket(maps, bucket);
        debug_assert!(removed, "aborted bucket must be removable");
        debug!(bucket = %id, "aborted bucket");
    }
}
