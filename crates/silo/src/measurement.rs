//! Helpers for reading measurement documents.
//!
//! Measurements are opaque JSON objects; the catalog only interprets the
//! configured time field, the optional metadata field, and the set of
//! top-level field names. Byte sizes follow the serialized text form, with
//! field names priced as if rewritten to their positional index in the
//! committed bucket document.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{CatalogError, Result};

/// Extracts the measurement timestamp from `doc[field]`.
///
/// The field must hold either an integer count of milliseconds since the
/// Unix epoch or an RFC 3339 string; anything else is rejected.
pub(crate) fn extract_time(doc: &Value, field: &str) -> Result<DateTime<Utc>> {
    let bad = || CatalogError::BadTimeField {
        field: field.to_owned(),
    };

    match doc.get(field) {
        Some(Value::Number(n)) => {
            let millis = n.as_i64().ok_or_else(bad)?;
            Utc.timestamp_millis_opt(millis).single().ok_or_else(bad)
        },
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| bad()),
        _ => Err(bad()),
    }
}

/// Serialized size in bytes of a JSON value.
pub(crate) fn value_size(value: &Value) -> u64 {
    match value {
        Value::Null => 4,
        Value::Bool(b) => {
            if *b {
                4
            }
            else {
                5
            }
        },
        Value::Number(n) => n.to_string().len() as u64,
        Value::String(s) => s.len() as u64 + 2,
        Value::Array(items) => {
            let contents: u64 = items.iter().map(value_size).sum();
            2 + contents + items.len().saturating_sub(1) as u64
        },
        Value::Object(map) => {
            let contents: u64 = map
                .iter()
                .map(|(name, value)| element_size(name.len(), value))
                .sum();
            2 + contents + map.len().saturating_sub(1) as u64
        },
    }
}

/// Size of an object entry `"name":value` whose name is `name_len` bytes.
pub(crate) fn element_size(name_len: usize, value: &Value) -> u64 {
    name_len as u64 + 3 + value_size(value)
}

/// Size of a one-field document holding an empty object, `{"name":{}}`.
pub(crate) fn empty_object_entry_size(name: &str) -> u64 {
    name.len() as u64 + 7
}

/// Number of decimal digits in `n`; zero for zero.
pub(crate) fn num_digits(mut n: u64) -> u64 {
    let mut digits = 0;
    while n > 0 {
        n /= 10;
        digits += 1;
    }
    digits
}
