//! In-memory aggregates of measurements sharing a namespace and metadata.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::batch::{BucketLink, SessionId, WriteBatch};
use crate::comparison::StringComparator;
use crate::measurement::{element_size, empty_object_entry_size, num_digits};
use crate::metadata::BucketMetadata;
use crate::minmax::MinMax;
use crate::stats::ExecutionStats;

/// 96-bit bucket identifier.
///
/// The top 32 bits encode the bucket's nominal timestamp in seconds since
/// the epoch; the rest is a random suffix generated at creation. The suffix
/// is the bucket's stable identity — lowering the nominal time rewrites only
/// the timestamp half.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BucketId {
    timestamp: u32,
    suffix:    u64,
}

impl BucketId {
    pub(crate) fn generate(time: DateTime<Utc>) -> Self {
        Self {
            timestamp: time.timestamp() as u32,
            suffix:    rand::random(),
        }
    }

    pub(crate) fn with_timestamp(self, time: DateTime<Utc>) -> Self {
        Self {
            timestamp: time.timestamp() as u32,
            suffix:    self.suffix,
        }
    }

    /// The nominal timestamp encoded in the id.
    pub fn time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(i64::from(self.timestamp), 0)
            .expect("second-precision u32 timestamp is always in range")
    }

    /// The random half of the id.
    pub(crate) fn suffix(&self) -> u64 {
        self.suffix
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}{:016x}", self.timestamp, self.suffix)
    }
}

/// One bucket of the catalog. All mutable state sits behind `inner`; the
/// catalog's maps share the bucket by `Arc` and key it by its stable suffix.
pub(crate) struct Bucket {
    suffix: u64,
    inner:  Mutex<BucketInner>,
}

/// Mutable state of a bucket, guarded by the bucket mutex.
pub(crate) struct BucketInner {
    pub id: BucketId,
    /// Empty until the first measurement is assigned.
    pub ns: String,
    pub metadata: BucketMetadata,
    pub num_measurements: u64,
    pub num_committed_measurements: u64,
    pub size_bytes: u64,
    pub latest_time: DateTime<Utc>,
    /// Top-level field names already present in the bucket document.
    pub field_names: HashSet<String>,
    pub min: MinMax,
    pub max: MinMax,
    /// Active batch per session.
    pub batches: HashMap<SessionId, Arc<WriteBatch>>,
    /// Occupied while a batch is being committed externally.
    pub prepared_batch: Option<Arc<WriteBatch>>,
    /// Latched when the bucket rolled over but still has uncommitted batches.
    pub full: bool,
    /// Cached memory estimate mirrored into the catalog-wide counter.
    pub memory_usage: u64,
}

/// Field and size changes one measurement would add to a bucket.
#[derive(Debug, Default)]
pub(crate) struct MeasurementDelta {
    pub new_field_names:      HashSet<String>,
    pub new_field_names_size: u64,
    pub size:                 u64,
}

impl Bucket {
    pub(crate) fn new(id: BucketId, comparator: Arc<dyn StringComparator>) -> Arc<Self> {
        Arc::new(Self {
            suffix: id.suffix(),
            inner:  Mutex::new(BucketInner {
                id,
                ns: String::new(),
                metadata: BucketMetadata::empty(comparator),
                num_measurements: 0,
                num_committed_measurements: 0,
                size_bytes: 0,
                latest_time: DateTime::UNIX_EPOCH,
                field_names: HashSet::new(),
                min: MinMax::default(),
                max: MinMax::default(),
                batches: HashMap::new(),
                prepared_batch: None,
                full: false,
                memory_usage: 0,
            }),
        })
    }

    pub(crate) fn suffix(&self) -> u64 {
        self.suffix
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BucketInner> {
        self.inner.lock().unwrap()
    }
}

impl BucketInner {
    /// Whether any measurement of this bucket has reached, or is reaching,
    /// the external writer.
    pub(crate) fn has_been_committed(&self) -> bool {
        self.num_committed_measurements != 0 || self.prepared_batch.is_some()
    }

    /// Whether no pending work remains.
    pub(crate) fn all_committed(&self) -> bool {
        self.batches.is_empty() && self.prepared_batch.is_none()
    }

    /// The session's active batch, created on first use.
    pub(crate) fn active_batch(
        &mut self,
        session_id: SessionId,
        ns: &str,
        stats: &Arc<ExecutionStats>,
    ) -> Arc<WriteBatch> {
        let link = BucketLink {
            suffix: self.id.suffix(),
            id:     self.id,
            ns:     ns.to_owned(),
        };
        self.batches
            .entry(session_id)
            .or_insert_with(|| WriteBatch::new(link, session_id, stats.clone()))
            .clone()
    }

    /// Computes the field and size changes inserting `doc` would cause.
    ///
    /// Committed bucket documents store measurement fields under their
    /// positional index, so each element is priced with the index width in
    /// place of its name; a first-seen name additionally pays for the empty
    /// column object it introduces.
    pub(crate) fn measurement_delta(&self, doc: &Value, meta_field: Option<&str>) -> MeasurementDelta {
        let mut delta = MeasurementDelta::default();
        let Some(object) = doc.as_object() else {
            return delta;
        };

        let index_width = num_digits(self.num_measurements) as usize;
        for (name, value) in object {
            if meta_field == Some(name.as_str()) {
                continue;
            }
            if !self.field_names.contains(name) {
                delta.new_field_names.insert(name.clone());
                delta.new_field_names_size += name.len() as u64;
                delta.size += empty_object_entry_size(name);
            }
            delta.size += element_size(index_width, value);
        }
        delta
    }
}
