//! Public lifecycle operations of the catalog.

use std::mem;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::catalog::{BucketCatalog, BucketState};
use crate::batch::{CombinePolicy, CommitInfo, SessionId, WriteBatch};
use crate::bucket::{BucketId, BucketInner, MeasurementDelta};
use crate::comparison::StringComparator;
use crate::config::TimeseriesOptions;
use crate::error::{CatalogError, Result};
use crate::measurement::extract_time;
use crate::metadata::{BucketKey, BucketMetadata};
use crate::stats::ExecutionStats;

/// The process-wide session identity shared by writers that allow combining.
fn shared_session_id() -> SessionId {
    static SHARED: OnceLock<SessionId> = OnceLock::new();
    *SHARED.get_or_init(Uuid::new_v4)
}

enum InsertAttempt {
    Done(Arc<WriteBatch>),
    /// Lost a race or rolled the bucket over; try again on the exclusive path.
    Retry,
}

impl BucketCatalog {
    /// Routes a measurement into the open bucket for its namespace and
    /// metadata, creating or rolling buckets over as needed, and returns the
    /// batch the measurement was attached to.
    ///
    /// # Parameters
    ///
    /// * `ns` - Target namespace in `"db.collection"` form.
    /// * `comparator` - String ordering applied to this namespace's values.
    /// * `options` - The collection's time-series options.
    /// * `doc` - The measurement document.
    /// * `combine` - Whether writers may share one batch per bucket.
    /// * `session_id` - The caller's session; ignored under
    ///   [`CombinePolicy::Allow`].
    ///
    /// # Errors
    ///
    /// [`CatalogError::BadTimeField`] when the configured time field is
    /// missing or not a datetime. Nothing changes in that case.
    pub fn insert(
        &self,
        ns: &str,
        comparator: Arc<dyn StringComparator>,
        options: &TimeseriesOptions,
        doc: Value,
        combine: CombinePolicy,
        session_id: SessionId,
    ) -> Result<Arc<WriteBatch>> {
        let time = extract_time(&doc, &options.time_field)?;

        let metadata_value = match &options.meta_field {
            Some(field) => {
                let mut wrapper = Map::new();
                wrapper.insert(field.clone(), doc.get(field).cloned().unwrap_or(Value::Null));
                Value::Object(wrapper)
            },
            None => Value::Object(Map::new()),
        };
        let key = BucketKey {
            ns:       ns.to_owned(),
            metadata: BucketMetadata::new(metadata_value, comparator),
        };

        let stats = self.stats_for(ns);
        let session = match combine {
            CombinePolicy::Allow => shared_session_id(),
            CombinePolicy::Disallow => session_id,
        };
        let max_span =
            i64::from(options.max_span_seconds.unwrap_or(self.config.max_bucket_span_seconds));

        let mut escalate = false;
        loop {
            match self.try_insert(&key, options, &doc, time, max_span, session, &stats, escalate) {
                InsertAttempt::Done(batch) => return Ok(batch),
                InsertAttempt::Retry => escalate = true,
            }
        }
    }

    /// One insert attempt against the current open bucket for `key`.
    #[allow(clippy::too_many_arguments)]
    fn try_insert(
        &self,
        key: &BucketKey,
        options: &TimeseriesOptions,
        doc: &Value,
        time: DateTime<Utc>,
        max_span: i64,
        session: SessionId,
        stats: &Arc<ExecutionStats>,
        escalate: bool,
    ) -> InsertAttempt {
        let bucket = if escalate {
            self.find_or_create_bucket(key, time, stats, true)
        }
        else {
            match self.find_open_bucket(key) {
                Some(bucket) => bucket,
                None => self.find_or_create_bucket(key, time, stats, true),
            }
        };
        let Some(mut inner) = self.lock_usable(&bucket) else {
            return InsertAttempt::Retry;
        };

        let meta_field = options.meta_field.as_deref();
        let mut delta = inner.measurement_delta(doc, meta_field);

        // Only a bucket that already carries measurements can be full.
        if !inner.ns.is_empty() && self.is_bucket_full(&mut inner, &delta, time, max_span, stats) {
            drop(inner);
            self.rollover(key, &bucket, time, stats);
            return InsertAttempt::Retry;
        }

        let batch = inner.active_batch(session, &key.ns, stats);
        batch.add_measurement(doc.clone());
        batch.record_new_fields(mem::take(&mut delta.new_field_names));

        inner.num_measurements += 1;
        inner.size_bytes += delta.size;
        if time > inner.latest_time {
            inner.latest_time = time;
        }
        if inner.ns.is_empty() {
            // First measurement: bind the bucket to its grouping key. The
            // namespace and metadata are each held here and in the open-map
            // key; the container keeps one owning and two non-owning handles.
            inner.ns = key.ns.clone();
            inner.metadata = key.metadata.clone();
            inner.memory_usage += (key.ns.len() as u64) * 2
                + inner.metadata.size() * 2
                + (mem::size_of::<Arc<crate::bucket::Bucket>>() as u64) * 3;
            self.memory_usage
                .fetch_add(inner.memory_usage, AtomicOrdering::Relaxed);
        }

        trace!(
            bucket = %inner.id,
            ns = %key.ns,
            size = delta.size,
            new_field_bytes = delta.new_field_names_size,
            "measurement attached"
        );
        InsertAttempt::Done(batch)
    }

    /// Full conditions, checked in order; the first hit wins. A measurement
    /// older than the bucket's nominal time lowers the nominal time instead,
    /// as long as nothing was committed yet and the span still fits.
    fn is_bucket_full(
        &self,
        inner: &mut BucketInner,
        delta: &MeasurementDelta,
        time: DateTime<Utc>,
        max_span: i64,
        stats: &ExecutionStats,
    ) -> bool {
        if inner.num_measurements >= self.config.max_bucket_count {
            stats
                .num_buckets_closed_due_to_count
                .fetch_add(1, AtomicOrdering::Relaxed);
            return true;
        }
        if inner.size_bytes + delta.size > self.config.max_bucket_size_bytes {
            stats
                .num_buckets_closed_due_to_size
                .fetch_add(1, AtomicOrdering::Relaxed);
            return true;
        }
        let bucket_time = inner.id.time();
        if (time - bucket_time) >= Duration::seconds(max_span) {
            stats
                .num_buckets_closed_due_to_time_forward
                .fetch_add(1, AtomicOrdering::Relaxed);
            return true;
        }
        if time < bucket_time {
            if !inner.has_been_committed() && (inner.latest_time - time) < Duration::seconds(max_span)
            {
                self.lower_id_timestamp(inner, time);
            }
            else {
                stats
                    .num_buckets_closed_due_to_time_backward
                    .fetch_add(1, AtomicOrdering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Readies a batch for its external write.
    ///
    /// Waits until no other batch of the bucket is being committed, then
    /// freezes the batch, transitions the bucket to [`BucketState::Prepared`]
    /// and detaches the batch from the active set. Returns `false` when the
    /// batch was already finished or its bucket is gone; the batch is
    /// aborted in the latter case.
    ///
    /// Callers must have claimed the batch's commit rights.
    pub async fn prepare_commit(&self, batch: &Arc<WriteBatch>) -> bool {
        debug_assert!(batch.has_commit_rights());
        if batch.finished() {
            // Someone else aborted the batch behind our back.
            return false;
        }

        loop {
            let Some(bucket) = self.lookup_bucket(batch) else {
                self.abort(batch);
                return false;
            };

            let current = {
                let Some(mut inner) = self.lock_usable(&bucket) else {
                    self.abort(batch);
                    return false;
                };
                match &inner.prepared_batch {
                    Some(current) => current.clone(),
                    None => {
                        // The slot is ours; freeze the batch while we still
                        // hold the bucket.
                        match self.set_bucket_state(&inner.id, BucketState::Prepared) {
                            Some(BucketState::Prepared) => {},
                            _ => {
                                drop(inner);
                                self.abort(batch);
                                return false;
                            },
                        }
                        inner.prepared_batch = Some(batch.clone());

                        let previous_memory = inner.memory_usage;
                        batch.prepare(&mut inner);
                        let memory = inner.memory_usage;
                        if memory >= previous_memory {
                            self.memory_usage
                                .fetch_add(memory - previous_memory, AtomicOrdering::Relaxed);
                        }
                        else {
                            self.memory_usage
                                .fetch_sub(previous_memory - memory, AtomicOrdering::Relaxed);
                        }

                        inner.batches.remove(&batch.session_id());
                        trace!(bucket = %inner.id, "batch prepared");
                        return true;
                    },
                }
            };

            // Wait for the in-flight commit to resolve, then try again. The
            // outcome is someone else's business.
            let _ = current.wait_result().await;
        }
    }

    /// Concludes a batch with the external writer's outcome.
    ///
    /// Waiters observe `info` — unless a clear raced the commit, in which
    /// case they observe the cleared-bucket error. On success the bucket's
    /// committed count and the namespace statistics advance. A drained
    /// bucket is retired when it was latched full, and parked on the idle
    /// pool otherwise.
    pub fn finish(&self, batch: &Arc<WriteBatch>, info: CommitInfo) {
        debug_assert!(batch.has_commit_rights());
        debug_assert!(!batch.finished());
        debug_assert!(!batch.active());

        let stats = batch.stats().clone();
        let committed_ok = info.result.is_ok();
        let num_docs = batch.num_measurements() as u64;
        let first_commit = batch.num_previously_committed() == 0;

        let bucket = self.lookup_bucket(batch);
        let mut outcome = Ok(info);
        if let Some(bucket) = &bucket {
            let mut inner = bucket.lock();
            match self.set_bucket_state(&inner.id, BucketState::Normal) {
                Some(BucketState::Cleared) => {
                    // A clear raced the commit.
                    outcome = Err(CatalogError::BucketCleared {
                        bucket_id: inner.id,
                        namespace: inner.ns.clone(),
                    });
                },
                _ => {},
            }
            inner.prepared_batch = None;
            if committed_ok {
                inner.num_committed_measurements += num_docs;
            }
        }
        batch.resolve(outcome);

        if committed_ok {
            stats.num_commits.fetch_add(1, AtomicOrdering::Relaxed);
            if first_commit {
                stats.num_bucket_inserts.fetch_add(1, AtomicOrdering::Relaxed);
            }
            else {
                stats.num_bucket_updates.fetch_add(1, AtomicOrdering::Relaxed);
            }
            stats
                .num_measurements_committed
                .fetch_add(num_docs, AtomicOrdering::Relaxed);
        }

        let Some(bucket) = bucket else {
            return;
        };
        let inner = bucket.lock();
        if !inner.all_committed() {
            return;
        }
        if inner.full {
            // Drained and full: rollover already installed a replacement, so
            // only the ownership, idle and state entries go.
            self.memory_usage
                .fetch_sub(inner.memory_usage, AtomicOrdering::Relaxed);
            let id = inner.id;
            drop(inner);
            let mut maps = self.buckets.write().unwrap();
            self.mark_not_idle(bucket.suffix());
            self.states.lock().unwrap().remove(&id);
            maps.all.remove(&bucket.suffix());
            debug!(bucket = %id, "retired drained full bucket");
        }
        else {
            drop(inner);
            self.mark_idle(bucket.suffix());
        }
    }

    /// Abandons a batch. Requires previously-claimed commit rights; a batch
    /// that already resolved is left alone. Aborting a batch clears its
    /// whole bucket: every pending batch observes the cleared-bucket error.
    pub fn abort(&self, batch: &Arc<WriteBatch>) {
        debug_assert!(batch.has_commit_rights());
        if batch.finished() {
            return;
        }

        let Some(bucket) = self.lookup_bucket(batch) else {
            // The bucket is already gone; only this batch is left to fail.
            batch.resolve_cleared();
            return;
        };

        let mut maps = self.buckets.write().unwrap();
        if !maps.all.contains_key(&bucket.suffix()) {
            batch.resolve_cleared();
            return;
        }
        let inner = bucket.lock();
        self.abort_bucket(&mut maps, &bucket, inner, Some(batch));
    }

    /// Marks the bucket with `id` as cleared; it is deleted on next touch.
    ///
    /// # Errors
    ///
    /// [`CatalogError::WriteConflict`] when the bucket is mid-commit. The
    /// bucket is still marked — the committer observes the cleared error on
    /// finish — and the clearer is expected to yield and retry.
    pub fn clear_bucket(&self, id: &BucketId) -> Result<()> {
        if self.set_bucket_state(id, BucketState::Cleared) == Some(BucketState::PreparedAndCleared) {
            warn!(bucket = %id, "cleared bucket has a commit in flight");
            return Err(CatalogError::WriteConflict {
                bucket_id: *id,
            });
        }
        Ok(())
    }

    /// Clears every bucket of `ns` and drops its statistics.
    pub fn clear_namespace(&self, ns: &str) {
        debug!(ns, "clearing namespace");
        self.clear_matching(|bucket_ns| bucket_ns == ns);
    }

    /// Clears every bucket of every namespace in `db`.
    pub fn clear_database(&self, db: &str) {
        debug!(db, "clearing database");
        let prefix = format!("{db}.");
        self.clear_matching(|bucket_ns| bucket_ns.starts_with(&prefix));
    }

    fn clear_matching(&self, should_clear: impl Fn(&str) -> bool) {
        let mut maps = self.buckets.write().unwrap();
        let mut stats = self.stats.write().unwrap();

        let candidates: Vec<_> = maps.all.values().cloned().collect();
        for bucket in candidates {
            let inner = bucket.lock();
            if should_clear(&inner.ns) {
                stats.remove(&inner.ns);
                self.abort_bucket(&mut maps, &bucket, inner, None);
            }
        }
    }

    /// The raw metadata of the batch's bucket; empty when the bucket is gone.
    pub fn get_metadata(&self, batch: &WriteBatch) -> Value {
        let empty = || Value::Object(Map::new());
        let Some(bucket) = self.lookup_bucket(batch) else {
            return empty();
        };
        let inner = bucket.lock();
        match self.bucket_state(&inner.id) {
            None | Some(BucketState::Cleared) => empty(),
            _ => inner.metadata.as_value().clone(),
        }
    }

    /// Live id of the batch's bucket, for targeted clearing.
    pub fn bucket_id_of(&self, batch: &WriteBatch) -> Option<BucketId> {
        let bucket = self.lookup_bucket(batch)?;
        let id = bucket.lock().id;
        Some(id)
    }
}
