use std::collections::BTreeMap;

use tracing::debug;

use super::controller::{FormResult, NodeId, NodeKind, TreeState};
use super::errors::rekey_map;
use super::path::FieldPath;
use super::reset::ResetFlag;
use super::scheduler::DeferredTask;
use crate::value::FormValue;

/// Edit flags of one group node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EditState {
    pub is_edit: bool,
    /// Ignore ancestors when computing the effective edit state.
    pub local_edit: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub value: FormValue,
    pub generation: u64,
}

/// Subtree values captured by `edit()`, keyed by subtree path.
#[derive(Clone, Debug, Default)]
pub struct SnapshotRecords {
    records: BTreeMap<FieldPath, Snapshot>,
    next_generation: u64,
}

impl SnapshotRecords {
    /// Stores `value` for `path` and returns the snapshot generation.
    pub fn capture(&mut self, path: &FieldPath, value: FormValue) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.records
            .insert(path.clone(), Snapshot { value, generation });
        generation
    }

    pub fn get(&self, path: &FieldPath) -> Option<&Snapshot> {
        self.records.get(path)
    }

    pub fn discard(&mut self, path: &FieldPath) -> Option<Snapshot> {
        self.records.remove(path)
    }

    /// Discards the record only if it is still the one captured as `generation`.
    pub fn discard_generation(&mut self, path: &FieldPath, generation: u64) -> bool {
        if self
            .records
            .get(path)
            .is_some_and(|snapshot| snapshot.generation == generation)
        {
            self.records.remove(path);
            return true;
        }
        false
    }

    /// Value of `path` inside the nearest snapshot at or above it.
    pub fn value_for(&self, path: &FieldPath) -> Option<FormValue> {
        let (scope, snapshot) = self
            .records
            .iter()
            .filter(|(scope, _)| path.is_within(scope))
            .max_by_key(|(scope, _)| scope.depth())?;
        let segments = path.relative_to(scope)?;
        snapshot.value.lookup(segments).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn rekey(&mut self, old_scope: &FieldPath, new_scope: &FieldPath) {
        rekey_map(&mut self.records, old_scope, new_scope);
    }

    pub fn remove_within(&mut self, scope: &FieldPath) {
        self.records.retain(|path, _| !path.is_within(scope));
    }
}

impl TreeState {
    pub(super) fn begin_edit(&mut self, id: NodeId) -> FormResult<()> {
        let path = self.path_of(id)?;
        let group = self.group_mut(id)?;
        if group.edit.is_edit {
            debug!(path = %path, "edit requested while already editing");
            return Ok(());
        }
        group.edit.is_edit = true;
        let value = self.node_entry(id)?.value;
        self.snapshots.capture(&path, value);
        debug!(path = %path, "edit session started");
        Ok(())
    }

    pub(super) fn save_edit(&mut self, id: NodeId) -> FormResult<()> {
        let path = self.path_of(id)?;
        self.group_mut(id)?.edit.is_edit = false;
        self.snapshots.discard(&path);
        debug!(path = %path, "edit session saved");
        Ok(())
    }

    /// Rolls the subtree back to its snapshot.
    ///
    /// Descendants that are mid-edit are closed without a broadcast of their
    /// own; their snapshots go first so the rollback reads this node's
    /// snapshot. The snapshot itself is discarded on the next tick.
    pub(super) fn cancel_edit(&mut self, id: NodeId) -> FormResult<()> {
        let path = self.path_of(id)?;
        let group = self.group_mut(id)?;
        if !group.edit.is_edit {
            debug!(path = %path, "cancel requested without an edit session");
            return Ok(());
        }
        group.edit.is_edit = false;

        for descendant in self.subtree(id)?.into_iter().skip(1) {
            let descendant_path = self.path_of(descendant)?;
            if let Ok(group) = self.group_mut(descendant) {
                if group.edit.is_edit {
                    group.edit.is_edit = false;
                    self.snapshots.discard(&descendant_path);
                    debug!(path = %descendant_path, "nested edit session closed by ancestor cancel");
                }
            }
        }

        self.unmount_items_beyond_snapshot(id)?;
        let generation = self.snapshots.get(&path).map(|snapshot| snapshot.generation);
        self.broadcast_reset(&ResetFlag::subtree(path.clone()))?;
        if let Some(generation) = generation {
            self.queue
                .defer(DeferredTask::DiscardSnapshot { path: path.clone(), generation });
        }
        debug!(path = %path, "edit session cancelled");
        Ok(())
    }

    /// Drops array items pushed after the snapshot was taken. Items removed
    /// during the session are left to the group's reset hook.
    fn unmount_items_beyond_snapshot(&mut self, id: NodeId) -> FormResult<()> {
        let arrays = self
            .subtree(id)?
            .into_iter()
            .filter(|node| {
                self.nodes
                    .get(node)
                    .is_some_and(|record| record.kind == NodeKind::ArrayGroup)
            })
            .collect::<Vec<_>>();
        for array in arrays {
            if !self.nodes.contains_key(&array) {
                continue;
            }
            let array_path = self.path_of(array)?;
            let Some(FormValue::List(items)) = self.snapshots.value_for(&array_path) else {
                continue;
            };
            let added = self
                .record(array)?
                .children
                .values()
                .skip(items.len())
                .rev()
                .copied()
                .collect::<Vec<_>>();
            for item in added {
                debug!(path = %array_path, "dropping array item added during edit session");
                self.unmount_node(item)?;
            }
        }
        Ok(())
    }

    pub(super) fn effective_edit(&self, id: NodeId) -> FormResult<bool> {
        let mut current = Some(id);
        while let Some(node) = current {
            let record = self.record(node)?;
            if let Some(edit) = record.edit_state() {
                if edit.is_edit {
                    return Ok(true);
                }
                if edit.local_edit {
                    return Ok(false);
                }
            }
            current = record.parent;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_snapshot_wins() {
        let mut records = SnapshotRecords::default();
        records.capture(
            &FieldPath::root(),
            FormValue::from(serde_json::json!({"user": {"name": "outer"}})),
        );
        records.capture(
            &FieldPath::new("user"),
            FormValue::from(serde_json::json!({"name": "inner"})),
        );
        assert_eq!(
            records.value_for(&FieldPath::new("user.name")),
            Some(FormValue::from("inner"))
        );
        records.discard(&FieldPath::new("user"));
        assert_eq!(
            records.value_for(&FieldPath::new("user.name")),
            Some(FormValue::from("outer"))
        );
    }

    #[test]
    fn missing_field_in_snapshot_yields_none() {
        let mut records = SnapshotRecords::default();
        records.capture(
            &FieldPath::new("user"),
            FormValue::from(serde_json::json!({"name": "a"})),
        );
        assert_eq!(records.value_for(&FieldPath::new("user.email")), None);
        assert_eq!(records.value_for(&FieldPath::new("other")), None);
    }

    #[test]
    fn stale_generation_does_not_discard_newer_snapshot() {
        let mut records = SnapshotRecords::default();
        let path = FieldPath::new("user");
        let first = records.capture(&path, FormValue::from("first"));
        let second = records.capture(&path, FormValue::from("second"));
        assert!(!records.discard_generation(&path, first));
        assert!(records.get(&path).is_some());
        assert!(records.discard_generation(&path, second));
        assert!(records.is_empty());
    }
}
