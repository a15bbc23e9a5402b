//! Three-way alignment of a desired resource set against an observed one.
//!
//! Records are matched by a stable identifier. The caller supplies a merge
//! function that writes operator-owned fields from the desired record onto
//! the observed one, leaving every other field as the external service
//! reported it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

/// A record with a stable identifier.
pub trait Identifiable {
    type Id: Ord + Clone + Debug;

    fn identifier(&self) -> Self::Id;
}

/// Changes needed to align the observed set with the desired set.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan<T> {
    /// Desired records whose identifier is not observed.
    pub to_create: Vec<T>,
    /// Observed records with desired operator-owned fields merged on, only
    /// where the merge changes something.
    pub to_update: Vec<T>,
    /// Observed records whose identifier is no longer desired.
    pub to_delete: Vec<T>,
}

impl<T> Default for SyncPlan<T> {
    fn default() -> Self {
        Self {
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
        }
    }
}

impl<T> SyncPlan<T> {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Compute the create/update/delete sets.
///
/// `merge(desired, existing)` returns the record to write back for an
/// identifier present on both sides. Output follows the order of `desired`
/// for creates and updates and the order of `existing` for deletes. A
/// repeated identifier in `desired` is taken once, first occurrence wins.
pub fn sync<T, F>(desired: &[T], existing: &[T], merge: F) -> SyncPlan<T>
where
    T: Identifiable + Clone + PartialEq,
    F: Fn(&T, &T) -> T,
{
    let observed: BTreeMap<T::Id, &T> = existing.iter().map(|r| (r.identifier(), r)).collect();
    let mut wanted: BTreeSet<T::Id> = BTreeSet::new();
    let mut plan = SyncPlan::default();

    for record in desired {
        let id = record.identifier();
        if !wanted.insert(id.clone()) {
            continue;
        }
        match observed.get(&id) {
            None => plan.to_create.push(record.clone()),
            Some(&current) => {
                let merged = merge(record, current);
                if merged != *current {
                    plan.to_update.push(merged);
                }
            }
        }
    }

    plan.to_delete = existing
        .iter()
        .filter(|r| !wanted.contains(&r.identifier()))
        .cloned()
        .collect();

    plan
}
