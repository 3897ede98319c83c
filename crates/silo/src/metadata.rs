//! Canonical grouping keys for buckets.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::comparison::StringComparator;

/// The canonicalised metadata grouping key of a bucket.
///
/// Two measurements land in the same bucket exactly when their canonical
/// metadata forms are identical. Object keys are kept sorted by the value
/// representation itself, so the canonical form is simply the value's
/// serialization; arrays preserve their order.
#[derive(Clone)]
pub struct BucketMetadata {
    /// The metadata value, `{}` for collections without a metadata field.
    value:      Value,
    /// Canonical serialized form; the equality and hash key.
    canonical:  String,
    /// String ordering applied to measurements grouped under this key.
    comparator: Arc<dyn StringComparator>,
}

impl BucketMetadata {
    pub(crate) fn new(value: Value, comparator: Arc<dyn StringComparator>) -> Self {
        let canonical = value.to_string();
        Self {
            value,
            canonical,
            comparator,
        }
    }

    /// Placeholder key used before a bucket receives its first measurement.
    pub(crate) fn empty(comparator: Arc<dyn StringComparator>) -> Self {
        Self::new(Value::Object(Map::new()), comparator)
    }

    /// The raw metadata value, wrapped in its field name.
    pub fn as_value(&self) -> &Value {
        &self.value
    }

    /// Name of the metadata field, when the key carries one.
    pub fn meta_field_name(&self) -> Option<&str> {
        self.value
            .as_object()
            .and_then(|map| map.keys().next())
            .map(String::as_str)
    }

    /// Serialized size of the metadata value in bytes.
    pub(crate) fn size(&self) -> u64 {
        self.canonical.len() as u64
    }

    pub(crate) fn comparator(&self) -> &Arc<dyn StringComparator> {
        &self.comparator
    }
}

impl PartialEq for BucketMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for BucketMetadata {}

impl Hash for BucketMetadata {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Debug for BucketMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketMetadata")
            .field("value", &self.value)
            .finish()
    }
}

/// Map key identifying the open bucket for a `(namespace, metadata)` pair.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct BucketKey {
    pub ns:       String,
    pub metadata: BucketMetadata,
}
