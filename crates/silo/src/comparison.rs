//! Comparison utilities for ordering measurement values.

use std::cmp::Ordering;

use serde_json::Value;

/// Pluggable string ordering used when comparing measurement values.
///
/// Collation-aware deployments supply their own implementation; everything
/// else uses [`BinaryComparator`].
pub trait StringComparator: Send + Sync {
    /// Compares two strings under this collation.
    fn compare(&self, a: &str, b: &str) -> Ordering;
}

/// Plain byte-wise string ordering.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryComparator;

impl StringComparator for BinaryComparator {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        a.cmp(b)
    }
}

/// Canonical rank of an object shape, for mixed-type comparisons.
pub(crate) const OBJECT_RANK: i32 = 20;
/// Canonical rank of an array shape.
pub(crate) const ARRAY_RANK: i32 = 25;

/// Canonical rank of a value's type. Values of different types order by rank
/// before their contents are considered.
pub(crate) const fn canonical_rank(value: &Value) -> i32 {
    match value {
        Value::Null => 5,
        Value::Number(_) => 10,
        Value::String(_) => 15,
        Value::Object(_) => OBJECT_RANK,
        Value::Array(_) => ARRAY_RANK,
        Value::Bool(_) => 40,
    }
}

/// Total ordering over values: canonical type rank first, then contents.
///
/// Strings order through the supplied comparator. Numbers compare as `f64`.
/// Containers compare element-wise, shorter-is-less on a common prefix.
pub(crate) fn compare_values(a: &Value, b: &Value, comparator: &dyn StringComparator) -> Ordering {
    let by_rank = canonical_rank(a).cmp(&canonical_rank(b));
    if by_rank != Ordering::Equal {
        return by_rank;
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let fx = x.as_f64().unwrap_or(0.0);
            let fy = y.as_f64().unwrap_or(0.0);
            fx.partial_cmp(&fy).unwrap_or(Ordering::Equal)
        },
        (Value::String(x), Value::String(y)) => comparator.compare(x, y),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y) {
                let ord = compare_values(ex, ey, comparator);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        },
        (Value::Object(x), Value::Object(y)) => {
            for ((kx, vx), (ky, vy)) in x.iter().zip(y) {
                let ord = comparator.compare(kx, ky);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = compare_values(vx, vy, comparator);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        },
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use serde_json::json;

    use super::{compare_values, BinaryComparator, StringComparator};

    fn cmp(a: serde_json::Value, b: serde_json::Value) -> Ordering {
        compare_values(&a, &b, &BinaryComparator)
    }

    #[test]
    fn test_rank_orders_mixed_types() {
        assert_eq!(cmp(json!(null), json!(0)), Ordering::Less);
        assert_eq!(cmp(json!(1), json!("a")), Ordering::Less);
        assert_eq!(cmp(json!("z"), json!({})), Ordering::Less);
        assert_eq!(cmp(json!({}), json!([])), Ordering::Less);
        assert_eq!(cmp(json!([]), json!(false)), Ordering::Less);
    }

    #[test]
    fn test_numbers_compare_across_representations() {
        assert_eq!(cmp(json!(1), json!(2)), Ordering::Less);
        assert_eq!(cmp(json!(2.5), json!(2)), Ordering::Greater);
        assert_eq!(cmp(json!(3), json!(3.0)), Ordering::Equal);
        assert_eq!(cmp(json!(-1), json!(1)), Ordering::Less);
    }

    #[test]
    fn test_containers_compare_element_wise() {
        assert_eq!(cmp(json!([1, 2]), json!([1, 3])), Ordering::Less);
        assert_eq!(cmp(json!([1, 2]), json!([1, 2, 0])), Ordering::Less);
        assert_eq!(cmp(json!({"a": 1}), json!({"a": 2})), Ordering::Less);
        assert_eq!(cmp(json!({"a": 1}), json!({"b": 1})), Ordering::Less);
        assert_eq!(cmp(json!({"a": 1}), json!({"a": 1})), Ordering::Equal);
    }

    #[test]
    fn test_custom_comparator_drives_string_order() {
        struct Reversed;
        impl StringComparator for Reversed {
            fn compare(&self, a: &str, b: &str) -> Ordering {
                b.cmp(a)
            }
        }

        let a = json!("apple");
        let b = json!("banana");
        assert_eq!(compare_values(&a, &b, &Reversed), Ordering::Greater);
        assert_eq!(compare_values(&a, &b, &BinaryComparator), Ordering::Less);
    }
}
