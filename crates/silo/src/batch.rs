//! Committable groups of measurements bound to one bucket and one session.

use std::collections::HashSet;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

use crate::bucket::{BucketId, BucketInner};
use crate::error::{CatalogError, Result};
use crate::minmax::Extremum;
use crate::stats::ExecutionStats;

/// Session identity batches are keyed by within their bucket.
pub type SessionId = Uuid;

/// Whether concurrent writers may share one active batch per bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CombinePolicy {
    /// All writers share a fixed process-wide session identity, so inserts
    /// against the same bucket coalesce into one batch.
    Allow,
    /// Every writer commits through its own batch.
    Disallow,
}

/// Outcome of the external write of a batch, relayed through `finish`.
#[derive(Clone, Debug)]
pub struct CommitInfo {
    pub result: Result<()>,
}

impl CommitInfo {
    /// A successful commit.
    pub fn ok() -> Self {
        Self {
            result: Ok(()),
        }
    }

    /// A failed commit, carrying the writer's reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            result: Err(CatalogError::CommitFailed {
                reason: reason.into(),
            }),
        }
    }
}

/// Value delivered to everyone waiting on a batch.
pub type CommitResult = Result<CommitInfo>;

/// Relation from a batch back to its bucket. Kept by value so the batch can
/// still name the bucket in errors after it is gone; resolved through the
/// catalog for live state.
#[derive(Clone, Debug)]
pub(crate) struct BucketLink {
    pub suffix: u64,
    pub id:     BucketId,
    pub ns:     String,
}

/// A committable group of measurements bound to one bucket and one session.
///
/// At most one active batch exists per session per bucket; the first caller
/// to [`claim_commit_rights`](Self::claim_commit_rights) drives the batch
/// through prepare, finish or abort, and every other interested party awaits
/// [`wait_result`](Self::wait_result).
#[derive(Debug)]
pub struct WriteBatch {
    /// Back-link to the owning bucket; detached once the batch resolves.
    bucket:        Mutex<Option<BucketLink>>,
    session_id:    SessionId,
    stats:         Arc<ExecutionStats>,
    commit_rights: AtomicBool,
    inner:         Mutex<BatchInner>,
    result_tx:     watch::Sender<Option<CommitResult>>,
    result_rx:     watch::Receiver<Option<CommitResult>>,
}

#[derive(Debug)]
struct BatchInner {
    measurements:             Vec<Value>,
    new_field_names:          HashSet<String>,
    active:                   bool,
    min_diff:                 Value,
    max_diff:                 Value,
    num_previously_committed: u64,
}

impl WriteBatch {
    pub(crate) fn new(link: BucketLink, session_id: SessionId, stats: Arc<ExecutionStats>) -> Arc<Self> {
        let (result_tx, result_rx) = watch::channel(None);
        Arc::new(Self {
            bucket: Mutex::new(Some(link)),
            session_id,
            stats,
            commit_rights: AtomicBool::new(false),
            inner: Mutex::new(BatchInner {
                measurements:             Vec::new(),
                new_field_names:          HashSet::new(),
                active:                   true,
                min_diff:                 Value::Null,
                max_diff:                 Value::Null,
                num_previously_committed: 0,
            }),
            result_tx,
            result_rx,
        })
    }

    /// Claims the exclusive right to drive this batch's commit.
    ///
    /// Returns `true` exactly once; every later claim observes `false` and
    /// should await the winner's result instead.
    pub fn claim_commit_rights(&self) -> bool {
        !self.commit_rights.swap(true, AtomicOrdering::AcqRel)
    }

    pub(crate) fn has_commit_rights(&self) -> bool {
        self.commit_rights.load(AtomicOrdering::Acquire)
    }

    /// The session this batch belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub(crate) fn stats(&self) -> &Arc<ExecutionStats> {
        &self.stats
    }

    /// Stable handle of the owning bucket, `None` once resolved.
    pub(crate) fn bucket_suffix(&self) -> Option<u64> {
        self.bucket.lock().unwrap().as_ref().map(|link| link.suffix)
    }

    /// Whether the batch still accepts measurements.
    pub fn active(&self) -> bool {
        self.inner.lock().unwrap().active
    }

    /// Whether the batch's outcome has been delivered.
    pub fn finished(&self) -> bool {
        self.result_rx.borrow().is_some()
    }

    /// Waits for the commit outcome.
    ///
    /// Any number of parties may wait; all observe the same result. The
    /// per-namespace wait counter is bumped only when the result was not
    /// already available.
    pub async fn wait_result(&self) -> CommitResult {
        let mut rx = self.result_rx.clone();
        if rx.borrow_and_update().is_none() {
            self.stats.num_waits.fetch_add(1, AtomicOrdering::Relaxed);
        }
        let resolved = rx
            .wait_for(Option::is_some)
            .await
            .expect("batch result channel closed while the batch was alive");
        resolved
            .clone()
            .expect("batch result resolved without a value")
    }

    /// The outcome, if already delivered.
    pub fn result_if_ready(&self) -> Option<CommitResult> {
        self.result_rx.borrow().clone()
    }

    pub(crate) fn add_measurement(&self, doc: Value) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.active);
        inner.measurements.push(doc);
    }

    pub(crate) fn record_new_fields(&self, fields: HashSet<String>) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.active);
        inner.new_field_names.extend(fields);
    }

    /// The buffered measurements, in submission order. Only meaningful once
    /// the batch has been prepared.
    pub fn measurements(&self) -> Vec<Value> {
        let inner = self.inner.lock().unwrap();
        debug_assert!(!inner.active);
        inner.measurements.clone()
    }

    /// Number of measurements buffered so far.
    pub fn num_measurements(&self) -> usize {
        self.inner.lock().unwrap().measurements.len()
    }

    /// Minimum control document for the commit: the full form for a bucket's
    /// first commit, a structural diff afterwards.
    pub fn min_diff(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        debug_assert!(!inner.active);
        inner.min_diff.clone()
    }

    /// Maximum counterpart of [`min_diff`](Self::min_diff).
    pub fn max_diff(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        debug_assert!(!inner.active);
        inner.max_diff.clone()
    }

    /// Field names this commit introduces to the bucket, sorted.
    pub fn new_field_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        debug_assert!(!inner.active);
        let mut names: Vec<String> = inner.new_field_names.iter().cloned().collect();
        names.sort();
        names
    }

    /// Measurement count the bucket had committed when this batch prepared.
    pub fn num_previously_committed(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        debug_assert!(!inner.active);
        inner.num_previously_committed
    }

    /// Freezes the batch for commit. Called with the owning bucket locked,
    /// after commit rights were claimed and the prepared slot was taken.
    pub(crate) fn prepare(&self, bucket: &mut BucketInner) {
        debug_assert!(self.has_commit_rights());
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.active);
        inner.active = false;
        inner.num_previously_committed = bucket.num_committed_measurements;

        // Names that were new at insert time may have been committed by a
        // faster batch since; keep only the survivors.
        let recorded = mem::take(&mut inner.new_field_names);
        for name in recorded {
            if bucket.field_names.insert(name.clone()) {
                inner.new_field_names.insert(name);
            }
        }

        let comparator = bucket.metadata.comparator().clone();
        let meta_field = bucket.metadata.meta_field_name().map(str::to_owned);
        bucket.memory_usage = bucket
            .memory_usage
            .saturating_sub(bucket.min.memory_usage() + bucket.max.memory_usage());
        for doc in &inner.measurements {
            bucket
                .min
                .update(doc, meta_field.as_deref(), comparator.as_ref(), Extremum::Min);
            bucket
                .max
                .update(doc, meta_field.as_deref(), comparator.as_ref(), Extremum::Max);
        }
        bucket.memory_usage += bucket.min.memory_usage() + bucket.max.memory_usage();

        // The first commit writes the full control documents and settles the
        // change flags; later commits send only what moved since.
        let first_commit = inner.num_previously_committed == 0;
        inner.min_diff = if first_commit {
            let full = bucket.min.to_value();
            bucket.min.clear_updated();
            full
        }
        else {
            bucket.min.updates()
        };
        inner.max_diff = if first_commit {
            let full = bucket.max.to_value();
            bucket.max.clear_updated();
            full
        }
        else {
            bucket.max.updates()
        };
    }

    /// Delivers the outcome to every waiter and detaches the bucket link.
    /// Later resolutions of an already-resolved batch are ignored.
    pub(crate) fn resolve(&self, result: CommitResult) {
        self.inner.lock().unwrap().active = false;
        *self.bucket.lock().unwrap() = None;
        self.result_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            }
            else {
                false
            }
        });
    }

    /// Resolves the batch with the cleared-bucket error for its bucket.
    pub(crate) fn resolve_cleared(&self) {
        let link = self.bucket.lock().unwrap().clone();
        let error = match link {
            Some(link) => CatalogError::BucketCleared {
                bucket_id: link.id,
                namespace: link.ns,
            },
            // Already detached; keep the previously-delivered outcome.
            None => return,
        };
        self.resolve(Err(error));
    }

    /// Diagnostic rendition of the batch.
    pub fn to_value(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<&String> = inner.new_field_names.iter().collect();
        names.sort();
        json!({
            "docs": inner.measurements,
            "bucketMin": inner.min_diff,
            "bucketMax": inner.max_diff,
            "numCommittedMeasurements": inner.num_previously_committed,
            "newFieldNamesToBeInserted": names,
        })
    }
}
