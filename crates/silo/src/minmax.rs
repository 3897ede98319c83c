//! Running minimum/maximum trackers over nested measurement values.
//!
//! Each bucket keeps one tracker for its minimum and one for its maximum.
//! Committers persist the control block incrementally: the first commit
//! writes the full min/max documents, later commits only a structural diff.
//! Every node remembers whether it changed since the last diff was taken.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::mem;

use serde_json::{Map, Value};

use crate::comparison::{canonical_rank, compare_values, StringComparator, ARRAY_RANK, OBJECT_RANK};
use crate::measurement::value_size;

/// Key under which a diff carries directly-updated fields.
pub const UPDATE_SECTION_KEY: &str = "u";
/// Prefix for diff keys that carry a nested sub-diff.
pub const SUB_DIFF_PREFIX: &str = "s";
/// Flag field marking a diff as an array diff; updated indices are addressed
/// by position.
pub const ARRAY_HEADER_KEY: &str = "a";

/// Which extreme a tracker keeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Extremum {
    Min,
    Max,
}

impl Extremum {
    /// Whether an incoming item comparing as `ord` against the stored one
    /// should replace it.
    fn prefers(self, ord: Ordering) -> bool {
        match self {
            Extremum::Min => ord == Ordering::Less,
            Extremum::Max => ord == Ordering::Greater,
        }
    }
}

/// One node of a min/max tracker.
#[derive(Debug, Default)]
pub(crate) struct MinMax {
    repr:    Repr,
    updated: bool,
    /// Bytes attributed to values stored in this subtree.
    memory:  u64,
}

#[derive(Debug, Default)]
enum Repr {
    #[default]
    Unset,
    Object(BTreeMap<String, MinMax>),
    Array(Vec<MinMax>),
    Value(Value),
}

/// Updates `child` in place, keeping the parent's memory total consistent.
fn update_with_memory(
    memory: &mut u64,
    child: &mut MinMax,
    value: &Value,
    comparator: &dyn StringComparator,
    extremum: Extremum,
) {
    *memory = memory.saturating_sub(child.memory_usage());
    child.update_node(value, comparator, extremum);
    *memory += child.memory_usage();
}

impl MinMax {
    /// Folds a measurement into the tracker. The root is always an object;
    /// the metadata field, which is not stored in the bucket, is skipped.
    pub(crate) fn update(
        &mut self,
        doc: &Value,
        meta_field: Option<&str>,
        comparator: &dyn StringComparator,
        extremum: Extremum,
    ) {
        debug_assert!(matches!(self.repr, Repr::Unset | Repr::Object(_)));
        if !matches!(self.repr, Repr::Object(_)) {
            self.repr = Repr::Object(BTreeMap::new());
        }

        let Some(object) = doc.as_object() else {
            return;
        };
        let Repr::Object(fields) = &mut self.repr else {
            return;
        };
        for (name, value) in object {
            if meta_field == Some(name.as_str()) {
                continue;
            }
            let child = fields.entry(name.clone()).or_default();
            update_with_memory(&mut self.memory, child, value, comparator, extremum);
        }
    }

    fn update_node(&mut self, value: &Value, comparator: &dyn StringComparator, extremum: Extremum) {
        // When the incoming shape differs from the stored one, the canonical
        // type ordering decides which shape wins.
        let displaces =
            |current_rank: i32| extremum.prefers(canonical_rank(value).cmp(&current_rank));

        match value {
            Value::Object(incoming) => {
                let take = match &self.repr {
                    Repr::Unset | Repr::Object(_) => true,
                    Repr::Array(_) => displaces(ARRAY_RANK),
                    Repr::Value(current) => displaces(canonical_rank(current)),
                };
                if !take {
                    return;
                }
                if !matches!(self.repr, Repr::Object(_)) {
                    self.repr = Repr::Object(BTreeMap::new());
                    self.updated = true;
                    self.memory = 0;
                }
                let Repr::Object(fields) = &mut self.repr else {
                    return;
                };
                for (name, sub) in incoming {
                    let child = fields.entry(name.clone()).or_default();
                    update_with_memory(&mut self.memory, child, sub, comparator, extremum);
                }
            },
            Value::Array(incoming) => {
                let take = match &self.repr {
                    Repr::Unset | Repr::Array(_) => true,
                    Repr::Object(_) => displaces(OBJECT_RANK),
                    Repr::Value(current) => displaces(canonical_rank(current)),
                };
                if !take {
                    return;
                }
                if !matches!(self.repr, Repr::Array(_)) {
                    self.repr = Repr::Array(Vec::new());
                    self.updated = true;
                    self.memory = 0;
                }
                let Repr::Array(items) = &mut self.repr else {
                    return;
                };
                if items.len() < incoming.len() {
                    items.resize_with(incoming.len(), MinMax::default);
                }
                for (index, sub) in incoming.iter().enumerate() {
                    let child = &mut items[index];
                    update_with_memory(&mut self.memory, child, sub, comparator, extremum);
                }
            },
            _ => {
                let take = match &self.repr {
                    Repr::Unset => true,
                    Repr::Object(_) => displaces(OBJECT_RANK),
                    Repr::Array(_) => displaces(ARRAY_RANK),
                    Repr::Value(current) => {
                        extremum.prefers(compare_values(value, current, comparator))
                    },
                };
                if take {
                    self.memory = value_size(value);
                    self.repr = Repr::Value(value.clone());
                    self.updated = true;
                }
            },
        }
    }

    /// Memory attributed to this subtree, including node bookkeeping.
    pub(crate) fn memory_usage(&self) -> u64 {
        let children = match &self.repr {
            Repr::Object(fields) => fields.len(),
            Repr::Array(items) => items.len(),
            _ => 0,
        };
        self.memory + (mem::size_of::<MinMax>() as u64) * children as u64
    }

    /// Emits the full tracked document.
    pub(crate) fn to_value(&self) -> Value {
        debug_assert!(matches!(self.repr, Repr::Object(_)));
        self.render()
    }

    fn render(&self) -> Value {
        match &self.repr {
            Repr::Unset => Value::Null,
            Repr::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, child)| (name.clone(), child.render()))
                    .collect(),
            ),
            Repr::Array(items) => Value::Array(items.iter().map(Self::render).collect()),
            Repr::Value(value) => value.clone(),
        }
    }

    /// Emits a structural diff of everything updated since the last diff,
    /// then clears the change flags on the emitted nodes.
    ///
    /// Object nodes place directly-updated fields under
    /// [`UPDATE_SECTION_KEY`] and nested changes under keys prefixed with
    /// [`SUB_DIFF_PREFIX`]. Array nodes carry [`ARRAY_HEADER_KEY`] and
    /// address entries by index.
    pub(crate) fn updates(&mut self) -> Value {
        debug_assert!(matches!(self.repr, Repr::Object(_)));
        let (diff, _) = self.collect_updates();
        diff
    }

    fn collect_updates(&mut self) -> (Value, bool) {
        let mut out = Map::new();
        let mut appended = false;

        match &mut self.repr {
            Repr::Object(fields) => {
                let mut update_section = Map::new();
                let mut sub_diffs = Vec::new();
                for (name, child) in fields.iter_mut() {
                    debug_assert!(!matches!(child.repr, Repr::Unset));
                    if child.updated {
                        update_section.insert(name.clone(), child.render());
                        child.clear_updated();
                        appended = true;
                    }
                    else if !matches!(child.repr, Repr::Value(_)) {
                        let (sub, sub_appended) = child.collect_updates();
                        if sub_appended {
                            sub_diffs.push((format!("{SUB_DIFF_PREFIX}{name}"), sub));
                            appended = true;
                        }
                    }
                }
                if !update_section.is_empty() {
                    out.insert(UPDATE_SECTION_KEY.to_owned(), Value::Object(update_section));
                }
                for (key, sub) in sub_diffs {
                    out.insert(key, sub);
                }
            },
            Repr::Array(items) => {
                out.insert(ARRAY_HEADER_KEY.to_owned(), Value::Bool(true));
                for (index, child) in items.iter_mut().enumerate() {
                    debug_assert!(!matches!(child.repr, Repr::Unset));
                    if child.updated {
                        out.insert(format!("{UPDATE_SECTION_KEY}{index}"), child.render());
                        child.clear_updated();
                        appended = true;
                    }
                    else if !matches!(child.repr, Repr::Value(_)) {
                        let (sub, sub_appended) = child.collect_updates();
                        if sub_appended {
                            out.insert(format!("{SUB_DIFF_PREFIX}{index}"), sub);
                            appended = true;
                        }
                    }
                }
            },
            _ => {},
        }

        (Value::Object(out), appended)
    }

    /// Clears the change flags of the whole subtree. Used after a full
    /// emission has been handed to the writer, so the next diff only carries
    /// changes made since.
    pub(crate) fn clear_updated(&mut self) {
        self.updated = false;
        match &mut self.repr {
            Repr::Object(fields) => {
                for child in fields.values_mut() {
                    child.clear_updated();
                }
            },
            Repr::Array(items) => {
                for child in items.iter_mut() {
                    child.clear_updated();
                }
            },
            _ => {},
        }
    }
}
