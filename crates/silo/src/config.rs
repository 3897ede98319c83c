//! Tunable limits for the catalog.

use serde::{Deserialize, Serialize};

/// Server-parameter-style knobs bounding individual buckets and the
/// catalog's overall footprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Maximum number of measurements per bucket.
    pub max_bucket_count: u64,
    /// Maximum serialized size of a bucket, in bytes.
    pub max_bucket_size_bytes: u64,
    /// Default maximum time span covered by one bucket, in seconds.
    /// Collections can override it through [`TimeseriesOptions`].
    pub max_bucket_span_seconds: u32,
    /// Catalog memory level above which idle buckets are expired before a
    /// new bucket is allocated.
    pub idle_bucket_expiry_memory_usage_threshold: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            max_bucket_count: 1000,
            max_bucket_size_bytes: 125 * 1024,
            max_bucket_span_seconds: 3600,
            idle_bucket_expiry_memory_usage_threshold: 100 * 1024 * 1024,
        }
    }
}

/// Per-collection time-series options supplied with each insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeseriesOptions {
    /// Name of the field holding each measurement's timestamp.
    pub time_field: String,
    /// Optional metadata field measurements are grouped by.
    pub meta_field: Option<String>,
    /// Span override for this collection; the catalog default applies when
    /// absent.
    pub max_span_seconds: Option<u32>,
}

impl TimeseriesOptions {
    /// Options for a collection keyed on `time_field` alone.
    pub fn new(time_field: impl Into<String>) -> Self {
        Self {
            time_field: time_field.into(),
            meta_field: None,
            max_span_seconds: None,
        }
    }

    /// Groups measurements by `meta_field`.
    #[must_use]
    pub fn with_meta_field(mut self, meta_field: impl Into<String>) -> Self {
        self.meta_field = Some(meta_field.into());
        self
    }

    /// Overrides the catalog's default bucket span.
    #[must_use]
    pub fn with_max_span_seconds(mut self, seconds: u32) -> Self {
        self.max_span_seconds = Some(seconds);
        self
    }
}
