use std::collections::BTreeMap;

use indexmap::IndexMap;
use tracing::{trace, warn};

use super::aggregate::{NodeEntry, flatten_array, flatten_object};
use super::controller::{FormError, FormResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GroupShape {
    Object,
    Array,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreUpdate {
    Unchanged,
    Changed,
}

impl StoreUpdate {
    pub fn changed(self) -> bool {
        self == StoreUpdate::Changed
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Removal {
    /// The requested key was removed.
    Removed,
    /// The requested array index was missing; the highest index went instead.
    FallbackRemoved(usize),
    Missing,
}

/// Entries of a group's direct children, written only by those children.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeStateStore {
    Object(IndexMap<String, NodeEntry>),
    Array(BTreeMap<usize, NodeEntry>),
}

impl NodeStateStore {
    pub fn new(shape: GroupShape) -> Self {
        match shape {
            GroupShape::Object => NodeStateStore::Object(IndexMap::new()),
            GroupShape::Array => NodeStateStore::Array(BTreeMap::new()),
        }
    }

    pub fn shape(&self) -> GroupShape {
        match self {
            NodeStateStore::Object(_) => GroupShape::Object,
            NodeStateStore::Array(_) => GroupShape::Array,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            NodeStateStore::Object(entries) => entries.len(),
            NodeStateStore::Array(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<&NodeEntry> {
        match self {
            NodeStateStore::Object(entries) => entries.get(key),
            NodeStateStore::Array(entries) => entries.get(&key.parse::<usize>().ok()?),
        }
    }

    /// Writes `entry` under `key` unless an equal entry is already stored.
    ///
    /// The equality guard keeps a child that republishes on every pass from
    /// re-triggering its ancestors forever.
    pub fn set_entry(&mut self, key: &str, entry: NodeEntry) -> FormResult<StoreUpdate> {
        let slot = match self {
            NodeStateStore::Object(entries) => {
                if entries.get(key) == Some(&entry) {
                    return Ok(StoreUpdate::Unchanged);
                }
                entries.insert(key.to_string(), entry);
                StoreUpdate::Changed
            }
            NodeStateStore::Array(entries) => {
                let index = parse_index(key)?;
                if entries.get(&index) == Some(&entry) {
                    return Ok(StoreUpdate::Unchanged);
                }
                entries.insert(index, entry);
                StoreUpdate::Changed
            }
        };
        trace!(key, "store entry written");
        Ok(slot)
    }

    /// Deletes `key`. Array stores are compacted back to `0..n-1` afterwards.
    ///
    /// When the requested array index is missing (a bulk reset may have
    /// replaced the store underneath a pending removal) the highest index is
    /// removed instead. This is a best-effort heuristic callers rely on, not a
    /// guarantee of which item disappears.
    pub fn remove_entry(&mut self, key: &str) -> Removal {
        match self {
            NodeStateStore::Object(entries) => {
                if entries.shift_remove(key).is_some() {
                    Removal::Removed
                } else {
                    Removal::Missing
                }
            }
            NodeStateStore::Array(entries) => {
                let requested = key.parse::<usize>().ok();
                let removal = match requested {
                    Some(index) if entries.remove(&index).is_some() => Removal::Removed,
                    _ => match entries.keys().next_back().copied() {
                        Some(highest) => {
                            entries.remove(&highest);
                            warn!(
                                key,
                                highest, "array index missing from store, removed highest index"
                            );
                            Removal::FallbackRemoved(highest)
                        }
                        None => Removal::Missing,
                    },
                };
                let compacted = std::mem::take(entries)
                    .into_values()
                    .enumerate()
                    .collect::<BTreeMap<_, _>>();
                *entries = compacted;
                removal
            }
        }
    }

    /// Swaps the whole store in one step.
    pub fn replace_all(&mut self, next: NodeStateStore) -> StoreUpdate {
        if *self == next {
            return StoreUpdate::Unchanged;
        }
        *self = next;
        StoreUpdate::Changed
    }

    pub fn aggregate(&self) -> NodeEntry {
        match self {
            NodeStateStore::Object(entries) => flatten_object(entries),
            NodeStateStore::Array(entries) => flatten_array(entries),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        match self {
            NodeStateStore::Object(entries) => entries.keys().cloned().collect(),
            NodeStateStore::Array(entries) => entries.keys().map(usize::to_string).collect(),
        }
    }
}

pub(super) fn parse_index(key: &str) -> FormResult<usize> {
    key.parse::<usize>()
        .map_err(|_| FormError::InvalidArrayIndex(key.to_string()))
}
