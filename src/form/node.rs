use std::collections::BTreeMap;
use std::sync::Arc;

use super::aggregate::NodeEntry;
use super::binding::FieldBinding;
use super::controller::{FormResult, FormTree, MountRequest, NodeId, NodeKind};
use super::field::{FieldConfig, FieldEvent, FieldState};
use super::path::FieldPath;
use super::reset::{ForceValidateFlag, ResetFlag};
use super::store::{GroupShape, Removal};
use super::validation::ValidationError;
use crate::value::FormValue;

/// Called after a reset broadcast reached the group, with the restored
/// subtree value when a snapshot applied.
pub type ResetHook = Arc<dyn Fn(Option<&FormValue>, &FormTree) + Send + Sync>;
pub type RequestHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct GroupConfig {
    pub(crate) local_edit: bool,
    pub(crate) reset_hook: Option<ResetHook>,
}

impl GroupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Edit state ignores ancestors.
    pub fn local_edit(mut self, local_edit: bool) -> Self {
        self.local_edit = local_edit;
        self
    }

    pub fn on_reset(
        mut self,
        hook: impl Fn(Option<&FormValue>, &FormTree) + Send + Sync + 'static,
    ) -> Self {
        self.reset_hook = Some(Arc::new(hook));
        self
    }
}

/// Command surface of one mounted node.
#[derive(Clone)]
pub struct NodeHandle {
    tree: FormTree,
    id: NodeId,
}

impl NodeHandle {
    pub(super) fn new(tree: FormTree, id: NodeId) -> Self {
        Self { tree, id }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn tree(&self) -> &FormTree {
        &self.tree
    }

    pub fn is_mounted(&self) -> bool {
        self.tree
            .inspect("checking node mount", |state| Ok(state.nodes.contains_key(&self.id)))
            .unwrap_or(false)
    }

    /// Resolved path of this node; descendants derive theirs from it.
    pub fn field_id(&self) -> FormResult<FieldPath> {
        self.tree
            .inspect("reading node path", |state| state.path_of(self.id))
    }

    pub fn kind(&self) -> FormResult<NodeKind> {
        self.tree
            .inspect("reading node kind", |state| Ok(state.record(self.id)?.kind))
    }

    /// Folded `{valid, value}` of this node.
    pub fn entry(&self) -> FormResult<NodeEntry> {
        self.tree
            .inspect("reading node entry", |state| state.node_entry(self.id))
    }

    pub fn children(&self) -> FormResult<Vec<String>> {
        self.tree.inspect("listing node children", |state| {
            Ok(state.record(self.id)?.children.keys().cloned().collect())
        })
    }

    /// Writes `entry` under `key` in this group's store and propagates upward.
    ///
    /// Mounted children keep their own key current; this is for entries a
    /// custom widget manages itself.
    pub fn set_in_form(&self, key: &str, entry: NodeEntry) -> FormResult<()> {
        self.tree.mutate("setting store entry", |state| {
            let update = state.group_mut(self.id)?.store.set_entry(key, entry)?;
            if update.changed() {
                state.publish(self.id)?;
                state.refresh_dependencies()?;
            }
            Ok(())
        })
    }

    /// Removes `key` from this group's store. A key naming a mounted child
    /// unmounts that child; otherwise the store is re-synced from the live
    /// children so array renumbering never shifts them out of place.
    pub fn remove_from_form(&self, key: &str) -> FormResult<Removal> {
        self.tree.mutate("removing store entry", |state| {
            if let Some(child) = state.record(self.id)?.children.get(key).copied() {
                state.unmount_node(child)?;
                return Ok(Removal::Removed);
            }
            let removal = state.group_mut(self.id)?.store.remove_entry(key);
            if removal != Removal::Missing {
                state.resync_store(self.id)?;
                state.publish(self.id)?;
                state.refresh_dependencies()?;
            }
            Ok(removal)
        })
    }

    pub fn mount_object(&self, name: &str, config: GroupConfig) -> FormResult<NodeHandle> {
        self.mount_group(name, GroupShape::Object, config)
    }

    pub fn mount_array(&self, name: &str, config: GroupConfig) -> FormResult<NodeHandle> {
        self.mount_group(name, GroupShape::Array, config)
    }

    pub fn mount_field(&self, name: &str, config: FieldConfig) -> FormResult<FieldHandle> {
        let id = self.tree.mutate("mounting field", |state| {
            state.mount_node(self.id, name, MountRequest::Field(config))
        })?;
        Ok(FieldHandle::new(NodeHandle::new(self.tree.clone(), id)))
    }

    /// Mounts an object item at the next array index.
    pub fn push_object(&self, config: GroupConfig) -> FormResult<NodeHandle> {
        let name = self.next_index()?;
        self.mount_object(&name, config)
    }

    pub fn push_array(&self, config: GroupConfig) -> FormResult<NodeHandle> {
        let name = self.next_index()?;
        self.mount_array(&name, config)
    }

    pub fn push_field(&self, config: FieldConfig) -> FormResult<FieldHandle> {
        let name = self.next_index()?;
        self.mount_field(&name, config)
    }

    /// Marks fields touched. `None` addresses every field under this node.
    pub fn force_validate(&self, targets: Option<BTreeMap<FieldPath, bool>>) -> FormResult<()> {
        self.tree.mutate("forcing validation", |state| {
            let flag = match targets {
                Some(targets) => ForceValidateFlag::Targeted(targets),
                None if self.id == state.root => ForceValidateFlag::All,
                None => ForceValidateFlag::Subtree(state.path_of(self.id)?),
            };
            state.broadcast_force_validate(&flag)
        })
    }

    /// Reloads fields from snapshots or initial values. `None` resets this
    /// node's whole subtree; a list resets exactly the listed paths.
    ///
    /// Only an untargeted reset of the root marks the form pristine again.
    pub fn reset(&self, reset_list: Option<Vec<FieldPath>>) -> FormResult<()> {
        self.tree.mutate("broadcasting reset", |state| {
            let full = reset_list.is_none() && self.id == state.root;
            let flag = match reset_list {
                Some(list) => ResetFlag::listed(list),
                None => ResetFlag::subtree(state.path_of(self.id)?),
            };
            state.broadcast_reset(&flag)?;
            if full {
                state.pristine = true;
            }
            Ok(())
        })
    }

    pub fn edit(&self) -> FormResult<()> {
        self.tree
            .mutate("starting edit session", |state| state.begin_edit(self.id))
    }

    pub fn save(&self) -> FormResult<()> {
        self.tree
            .mutate("saving edit session", |state| state.save_edit(self.id))
    }

    pub fn cancel(&self) -> FormResult<()> {
        self.tree
            .mutate("cancelling edit session", |state| state.cancel_edit(self.id))
    }

    /// Effective edit state, taking ancestors into account unless the group
    /// is configured with `local_edit`.
    pub fn is_edit(&self) -> FormResult<bool> {
        self.tree
            .inspect("reading edit state", |state| state.effective_edit(self.id))
    }

    pub fn unmount(self) -> FormResult<()> {
        self.tree
            .mutate("unmounting node", |state| state.unmount_node(self.id))
    }

    fn mount_group(&self, name: &str, shape: GroupShape, config: GroupConfig) -> FormResult<NodeHandle> {
        let id = self.tree.mutate("mounting group", |state| {
            state.mount_node(self.id, name, MountRequest::Group { shape, config })
        })?;
        Ok(NodeHandle::new(self.tree.clone(), id))
    }

    fn next_index(&self) -> FormResult<String> {
        self.tree.inspect("reading next array index", |state| {
            Ok(state.record(self.id)?.children.len().to_string())
        })
    }
}

/// Consumer view of one field node.
#[derive(Clone)]
pub struct FieldHandle {
    node: NodeHandle,
}

impl FieldHandle {
    pub(super) fn new(node: NodeHandle) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    pub fn path(&self) -> FormResult<FieldPath> {
        self.node.field_id()
    }

    pub fn state(&self) -> FormResult<FieldState> {
        self.node
            .tree
            .inspect("reading field state", |state| Ok(state.field_state(self.node.id)?.clone()))
    }

    pub fn value(&self) -> FormResult<FormValue> {
        Ok(self.state()?.value)
    }

    /// Registered validator errors merged with injected ones.
    pub fn errors(&self) -> FormResult<Vec<ValidationError>> {
        self.node.tree.inspect("reading field errors", |state| {
            Ok(state.errors.errors_for(&state.path_of(self.node.id)?))
        })
    }

    pub fn on_change(&self, value: impl Into<FormValue>) -> FormResult<()> {
        let value = value.into();
        self.node
            .tree
            .mutate("changing field value", |state| state.change_field(self.node.id, value))
    }

    pub fn on_focus(&self) -> FormResult<()> {
        self.node.tree.mutate("focusing field", |state| {
            state.field_event(self.node.id, FieldEvent::Focus)
        })
    }

    pub fn on_blur(&self) -> FormResult<()> {
        self.node.tree.mutate("blurring field", |state| {
            let touch = state.options.touch_on_blur;
            state.field_event(self.node.id, FieldEvent::Blur { touch })
        })
    }

    pub fn binding(&self) -> FormResult<FieldBinding> {
        let state = self.state()?;
        let errors = self.errors()?;
        Ok(FieldBinding::new(self.clone(), state, errors))
    }

    pub fn unmount(self) -> FormResult<()> {
        self.node.unmount()
    }
}
