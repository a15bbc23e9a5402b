//! Stable index allocation for compute clusters.
//!
//! Every compute cluster hosting members of a deployment gets a small integer
//! that is baked into derived object names (workload names, hostnames,
//! replica-set member ids). Indices are never recycled: a retired name keeps
//! its index in the mapping, and a new name always gets one past the highest
//! index the deployment has ever used.
//!
//! The next free index is derived from the mapping itself, so losing the
//! persisted mapping entirely cannot be recovered from the live topology.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Persistent cluster-name to index mapping for one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterMapping(BTreeMap<String, u32>);

impl ClusterMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.0.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(name, index)| (name.as_str(), *index))
    }

    /// One past the highest index ever recorded, or 0 for an empty mapping.
    pub fn next_free_index(&self) -> u32 {
        self.0.values().max().map_or(0, |max| max + 1)
    }

    /// Names in the mapping that are absent from `desired`.
    pub fn retired<'a>(&'a self, desired: &'a [String]) -> impl Iterator<Item = (&'a str, u32)> {
        self.iter()
            .filter(move |(name, _)| !desired.iter().any(|d| d.as_str() == *name))
    }
}

impl FromIterator<(String, u32)> for ClusterMapping {
    fn from_iter<I: IntoIterator<Item = (String, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Result of resolving indices for a desired cluster list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Updated mapping, including retired names.
    pub mapping: ClusterMapping,
    /// True if any name was newly assigned and the mapping must be persisted.
    pub changed: bool,
    /// Indices of the desired names, in declaration order.
    pub indices: Vec<(String, u32)>,
}

/// Resolve indices for `desired` against the persisted `mapping`.
///
/// An empty `desired` list is a no-op and never means "remove all clusters".
pub fn resolve_cluster_indices(mapping: &ClusterMapping, desired: &[String]) -> Resolution {
    let mut updated = mapping.clone();
    let mut next_free = mapping.next_free_index();
    let mut changed = false;
    let mut indices = Vec::with_capacity(desired.len());

    for name in desired {
        let index = match updated.get(name) {
            Some(index) => index,
            None => {
                let index = next_free;
                next_free += 1;
                updated.0.insert(name.clone(), index);
                changed = true;
                info!(cluster = %name, index, "Assigned cluster index");
                index
            }
        };
        if !indices.iter().any(|(n, _)| n == name) {
            indices.push((name.clone(), index));
        }
    }

    if !changed {
        debug!(clusters = desired.len(), "Cluster mapping unchanged");
    }

    Resolution {
        mapping: updated,
        changed,
        indices,
    }
}
