//! Expected vs current classification.
//!
//! Both the employer-level and the employee-level sync run the same diff:
//! ids only in `expected` are created, ids only in `current` are deleted and
//! shared ids are updated or left alone depending on the adapter's equality.
//! Output order is unspecified; callers that persist or log sets sort them.

use indexmap::IndexMap;

use consist_common::Result;

use crate::adapter::Entity;

/// Classification of expected and current items
#[derive(Clone, Debug)]
pub struct Partition<T> {
    /// Expected but not present
    pub to_create: Vec<T>,
    /// Present but different from expected (holds the expected value)
    pub to_update: Vec<T>,
    /// Present but not expected (holds the current value)
    pub to_delete: Vec<T>,
    /// Present and equal to expected (holds the expected value)
    pub unchanged: Vec<T>,
}

impl<T> Default for Partition<T> {
    fn default() -> Self {
        Self {
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

/// Classify `expected` against `current`.
///
/// Duplicate ids within one side collapse to the last occurrence. A failing
/// equality check aborts the diff.
pub fn diff<T: Entity>(expected: Vec<T>, current: Vec<T>) -> Result<Partition<T>> {
    let expected = by_id(expected);
    let mut current = by_id(current);
    let mut partition = Partition::default();

    for item in expected.into_values() {
        match current.shift_remove(item.id()) {
            None => partition.to_create.push(item),
            Some(existing) => {
                if item.equals(&existing)? {
                    partition.unchanged.push(item);
                } else {
                    partition.to_update.push(item);
                }
            }
        }
    }

    partition.to_delete = current.into_values().collect();
    Ok(partition)
}

/// Items keyed by id in first-insertion order; a repeated id keeps the last item
fn by_id<T: Entity>(items: Vec<T>) -> IndexMap<String, T> {
    let mut map = IndexMap::with_capacity(items.len());
    for item in items {
        map.insert(item.id().to_string(), item);
    }
    map
}
