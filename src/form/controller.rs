use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::aggregate::NodeEntry;
use super::edit::{EditState, SnapshotRecords};
use super::errors::{ErrorRegistry, InjectedErrors, rekey_map};
use super::field::{FieldConfig, FieldController, FieldEffect, FieldEvent, FieldPhase, FieldState};
use super::node::{FieldHandle, GroupConfig, NodeHandle, RequestHandler, ResetHook};
use super::path::{FieldPath, PathResolver};
use super::reset::ForceValidateFlag;
use super::scheduler::{DeferredTask, InlineValidation, Notification, TaskQueue, ValidationJob};
use super::store::{GroupShape, NodeStateStore, parse_index};
use super::validation::{Validation, ValidationError, Validator};
use crate::value::{FormModel, FormValue};

static FORM_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FormId(pub u64);

impl FormId {
    pub fn next() -> Self {
        Self(FORM_ID_ALLOCATOR.fetch_add(1, Ordering::SeqCst))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub(super) u64);

const ROOT_NODE: NodeId = NodeId(0);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValidationTicket(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    Root,
    ObjectGroup,
    ArrayGroup,
    Field,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitState {
    Idle,
    Validating,
    Submitting,
    Succeeded,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FormOptions {
    /// Blurring a field marks it touched.
    pub touch_on_blur: bool,
    /// Delay before a validator runs; a newer run during the delay wins.
    pub validation_debounce: Duration,
    /// Upper bound on dependency/propagation rounds within one pass.
    pub max_propagation_rounds: usize,
}

impl Default for FormOptions {
    fn default() -> Self {
        Self {
            touch_on_blur: true,
            validation_debounce: Duration::ZERO,
            max_propagation_rounds: 32,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FormSnapshot {
    pub value: FormValue,
    pub valid: bool,
    pub validating: bool,
    pub pristine: bool,
    pub submit_state: SubmitState,
    pub submit_count: u32,
    pub errors: BTreeMap<FieldPath, Vec<ValidationError>>,
    pub editing: Vec<FieldPath>,
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum FormError {
    #[error("form state lock poisoned while {0}")]
    StatePoisoned(&'static str),
    #[error("invalid submit state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: SubmitState, to: SubmitState },
    #[error("form submit is already in progress")]
    AlreadySubmitting,
    #[error("node {0:?} is not mounted")]
    NodeNotMounted(NodeId),
    #[error("`{0}` is a field and cannot own children")]
    NotAGroup(FieldPath),
    #[error("`{0}` is not a field")]
    NotAField(FieldPath),
    #[error("`{name}` is already mounted under `{parent}`")]
    DuplicateName { parent: FieldPath, name: String },
    #[error("`{0}` is not a valid array index here")]
    InvalidArrayIndex(String),
    #[error("the root node cannot be unmounted")]
    RootUnmount,
}

pub type FormResult<T> = Result<T, FormError>;

pub(super) enum NodeBody {
    Group(GroupNode),
    Field(FieldController),
}

pub(super) struct GroupNode {
    pub(super) store: NodeStateStore,
    pub(super) edit: EditState,
    pub(super) reset_hook: Option<ResetHook>,
}

pub(super) struct NodeRecord {
    pub(super) kind: NodeKind,
    pub(super) parent: Option<NodeId>,
    pub(super) path: PathResolver,
    pub(super) children: IndexMap<String, NodeId>,
    pub(super) body: NodeBody,
}

impl NodeRecord {
    pub(super) fn is_field(&self) -> bool {
        matches!(self.body, NodeBody::Field(_))
    }

    pub(super) fn edit_state(&self) -> Option<EditState> {
        match &self.body {
            NodeBody::Group(group) => Some(group.edit),
            NodeBody::Field(_) => None,
        }
    }

    pub(super) fn reset_hook(&self) -> Option<ResetHook> {
        match &self.body {
            NodeBody::Group(group) => group.reset_hook.clone(),
            NodeBody::Field(_) => None,
        }
    }

    pub(super) fn field_state(&self) -> Option<&FieldState> {
        match &self.body {
            NodeBody::Field(controller) => Some(controller.state()),
            NodeBody::Group(_) => None,
        }
    }
}

pub(super) enum MountRequest {
    Group {
        shape: GroupShape,
        config: GroupConfig,
    },
    Field(FieldConfig),
}

pub(super) struct TreeState {
    pub(super) id: FormId,
    pub(super) options: FormOptions,
    pub(super) root: NodeId,
    pub(super) nodes: BTreeMap<NodeId, NodeRecord>,
    pub(super) paths: BTreeMap<FieldPath, NodeId>,
    pub(super) errors: ErrorRegistry,
    pub(super) snapshots: SnapshotRecords,
    pub(super) queue: TaskQueue,
    pub(super) pristine: bool,
    pub(super) submit_state: SubmitState,
    pub(super) submit_count: u32,
    pub(super) focus_handlers: BTreeMap<FieldPath, RequestHandler>,
    pub(super) scroll_handlers: BTreeMap<FieldPath, RequestHandler>,
    /// Collects publishing nodes while a broadcast is being applied.
    pub(super) deferred_publish: Option<BTreeSet<NodeId>>,
    dependency_root: FormValue,
    next_node: u64,
    next_ticket: u64,
}

impl TreeState {
    fn new(options: FormOptions, root_config: GroupConfig) -> Self {
        let root = ROOT_NODE;
        let mut nodes = BTreeMap::new();
        nodes.insert(
            root,
            NodeRecord {
                kind: NodeKind::Root,
                parent: None,
                path: PathResolver::root(),
                children: IndexMap::new(),
                body: NodeBody::Group(GroupNode {
                    store: NodeStateStore::new(GroupShape::Object),
                    edit: EditState {
                        is_edit: false,
                        local_edit: root_config.local_edit,
                    },
                    reset_hook: root_config.reset_hook,
                }),
            },
        );
        let mut paths = BTreeMap::new();
        paths.insert(FieldPath::root(), root);
        Self {
            id: FormId::next(),
            options,
            root,
            nodes,
            paths,
            errors: ErrorRegistry::default(),
            snapshots: SnapshotRecords::default(),
            queue: TaskQueue::default(),
            pristine: true,
            submit_state: SubmitState::Idle,
            submit_count: 0,
            focus_handlers: BTreeMap::new(),
            scroll_handlers: BTreeMap::new(),
            deferred_publish: None,
            dependency_root: FormValue::empty_map(),
            next_node: 1,
            next_ticket: 1,
        }
    }

    pub(super) fn record(&self, id: NodeId) -> FormResult<&NodeRecord> {
        self.nodes.get(&id).ok_or(FormError::NodeNotMounted(id))
    }

    pub(super) fn record_mut(&mut self, id: NodeId) -> FormResult<&mut NodeRecord> {
        self.nodes.get_mut(&id).ok_or(FormError::NodeNotMounted(id))
    }

    pub(super) fn path_of(&self, id: NodeId) -> FormResult<FieldPath> {
        Ok(self.record(id)?.path.path().clone())
    }

    pub(super) fn group_mut(&mut self, id: NodeId) -> FormResult<&mut GroupNode> {
        let record = self.record_mut(id)?;
        match &mut record.body {
            NodeBody::Group(group) => Ok(group),
            NodeBody::Field(_) => Err(FormError::NotAGroup(record.path.path().clone())),
        }
    }

    pub(super) fn field_mut(&mut self, id: NodeId) -> FormResult<&mut FieldController> {
        let record = self.record_mut(id)?;
        match &mut record.body {
            NodeBody::Field(controller) => Ok(controller),
            NodeBody::Group(_) => Err(FormError::NotAField(record.path.path().clone())),
        }
    }

    pub(super) fn field_state(&self, id: NodeId) -> FormResult<&FieldState> {
        let record = self.record(id)?;
        record
            .field_state()
            .ok_or_else(|| FormError::NotAField(record.path.path().clone()))
    }

    pub(super) fn field_at(&self, path: &FieldPath) -> Option<NodeId> {
        let id = *self.paths.get(path)?;
        self.nodes.get(&id)?.is_field().then_some(id)
    }

    pub(super) fn allocate_ticket(&mut self) -> ValidationTicket {
        let ticket = ValidationTicket(self.next_ticket);
        self.next_ticket += 1;
        ticket
    }

    pub(super) fn node_entry(&self, id: NodeId) -> FormResult<NodeEntry> {
        Ok(match &self.record(id)?.body {
            NodeBody::Field(controller) => {
                let state = controller.state();
                NodeEntry {
                    valid: state.valid,
                    value: state.value.clone(),
                }
            }
            NodeBody::Group(group) => group.store.aggregate(),
        })
    }

    pub(super) fn root_entry(&self) -> NodeEntry {
        self.node_entry(self.root)
            .unwrap_or_else(|_| NodeEntry::new(true, FormValue::empty_map()))
    }

    /// Node ids of `id` and all its descendants, parents before children.
    pub(super) fn subtree(&self, id: NodeId) -> FormResult<Vec<NodeId>> {
        let mut ordered = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let record = self.record(current)?;
            ordered.push(current);
            stack.extend(record.children.values().rev().copied());
        }
        Ok(ordered)
    }

    pub(super) fn mount_node(
        &mut self,
        parent: NodeId,
        name: &str,
        request: MountRequest,
    ) -> FormResult<NodeId> {
        let parent_record = self.record(parent)?;
        let parent_path = parent_record.path.path().clone();
        let NodeBody::Group(parent_group) = &parent_record.body else {
            return Err(FormError::NotAGroup(parent_path));
        };
        if parent_record.children.contains_key(name) {
            return Err(FormError::DuplicateName {
                parent: parent_path,
                name: name.to_string(),
            });
        }
        if parent_group.store.shape() == GroupShape::Array
            && parse_index(name)? != parent_record.children.len()
        {
            return Err(FormError::InvalidArrayIndex(name.to_string()));
        }

        let path = PathResolver::new(Some(&parent_path), name);
        let id = NodeId(self.next_node);
        self.next_node += 1;
        let (kind, body) = match request {
            MountRequest::Group { shape, config } => (
                match shape {
                    GroupShape::Object => NodeKind::ObjectGroup,
                    GroupShape::Array => NodeKind::ArrayGroup,
                },
                NodeBody::Group(GroupNode {
                    store: NodeStateStore::new(shape),
                    edit: EditState {
                        is_edit: false,
                        local_edit: config.local_edit,
                    },
                    reset_hook: config.reset_hook,
                }),
            ),
            MountRequest::Field(config) => (NodeKind::Field, NodeBody::Field(FieldController::new(config))),
        };
        debug!(path = %path.path(), ?kind, "node mounted");
        self.paths.insert(path.path().clone(), id);
        self.nodes.insert(
            id,
            NodeRecord {
                kind,
                parent: Some(parent),
                path,
                children: IndexMap::new(),
                body,
            },
        );
        self.record_mut(parent)?.children.insert(name.to_string(), id);

        if kind == NodeKind::Field {
            let root_value = self.root_entry().value;
            let ticket = self.allocate_ticket();
            let effects = self.field_mut(id)?.mount(&root_value, ticket);
            self.apply_effects(id, effects)?;
        } else {
            self.publish(id)?;
        }
        self.refresh_dependencies()?;
        Ok(id)
    }

    pub(super) fn unmount_node(&mut self, id: NodeId) -> FormResult<()> {
        if id == self.root {
            return Err(FormError::RootUnmount);
        }
        let record = self.record(id)?;
        let parent = record.parent.ok_or(FormError::RootUnmount)?;
        let name = record.path.name().to_string();
        let path = record.path.path().clone();

        for node in self.subtree(id)? {
            if let Some(removed) = self.nodes.remove(&node) {
                let node_path = removed.path.path();
                self.paths.remove(node_path);
                self.focus_handlers.remove(node_path);
                self.scroll_handlers.remove(node_path);
            }
        }
        self.errors.remove_within(&path);
        self.snapshots.remove_within(&path);

        self.record_mut(parent)?.children.shift_remove(&name);
        let shape = {
            let group = self.group_mut(parent)?;
            group.store.remove_entry(&name);
            group.store.shape()
        };
        if shape == GroupShape::Array {
            self.renumber_children(parent)?;
        }
        debug!(path = %path, "node unmounted");
        self.publish(parent)?;
        self.refresh_dependencies()
    }

    /// Renames array items after a removal so names match positions again,
    /// then writes every live item back into the store.
    fn renumber_children(&mut self, parent: NodeId) -> FormResult<()> {
        let parent_path = self.path_of(parent)?;
        let children = self
            .record(parent)?
            .children
            .values()
            .copied()
            .collect::<Vec<_>>();
        let mut renamed = IndexMap::with_capacity(children.len());
        for (index, child) in children.into_iter().enumerate() {
            let name = index.to_string();
            self.rename_subtree(child, &parent_path, &name)?;
            renamed.insert(name, child);
        }
        self.record_mut(parent)?.children = renamed;
        self.resync_store(parent)
    }

    /// Writes every live child's entry back under its current name.
    pub(super) fn resync_store(&mut self, group: NodeId) -> FormResult<()> {
        let entries = self
            .record(group)?
            .children
            .iter()
            .map(|(name, child)| Ok((name.clone(), self.node_entry(*child)?)))
            .collect::<FormResult<Vec<_>>>()?;
        let group = self.group_mut(group)?;
        for (name, entry) in entries {
            group.store.set_entry(&name, entry)?;
        }
        Ok(())
    }

    fn rename_subtree(&mut self, id: NodeId, parent_path: &FieldPath, name: &str) -> FormResult<()> {
        let old_path = self.path_of(id)?;
        if !self.record_mut(id)?.path.update(Some(parent_path), name) {
            return Ok(());
        }
        let new_path = self.path_of(id)?;
        for node in self.subtree(id)?.into_iter().skip(1) {
            let record = self.record(node)?;
            let parent = record.parent.ok_or(FormError::NodeNotMounted(node))?;
            let parent_path = self.path_of(parent)?;
            let name = self.record(node)?.path.name().to_string();
            self.record_mut(node)?.path.update(Some(&parent_path), &name);
        }
        self.paths.retain(|path, _| !path.is_within(&old_path));
        for node in self.subtree(id)? {
            let path = self.path_of(node)?;
            self.paths.insert(path, node);
        }
        self.errors.rekey(&old_path, &new_path);
        self.snapshots.rekey(&old_path, &new_path);
        rekey_map(&mut self.focus_handlers, &old_path, &new_path);
        rekey_map(&mut self.scroll_handlers, &old_path, &new_path);
        trace!(from = %old_path, to = %new_path, "array item renumbered");
        Ok(())
    }

    pub(super) fn apply_effects(&mut self, id: NodeId, effects: Vec<FieldEffect>) -> FormResult<()> {
        let path = self.path_of(id)?;
        let default_debounce = self.options.validation_debounce;
        for effect in effects {
            match effect {
                FieldEffect::Validate {
                    ticket,
                    value,
                    dependency,
                } => {
                    let config = self.field_mut(id)?.config();
                    let validator = config.validator.clone();
                    let debounce = config.debounce.unwrap_or(default_debounce);
                    match validator {
                        Some(Validator::Sync(validator)) if debounce.is_zero() => {
                            self.queue.push_inline(InlineValidation {
                                node: id,
                                path: path.clone(),
                                ticket,
                                value,
                                dependency,
                                validator,
                            });
                        }
                        Some(validator) => self.queue.push_validation(ValidationJob {
                            node: id,
                            path: path.clone(),
                            ticket,
                            value,
                            dependency,
                            validator,
                            debounce,
                        }),
                        None => {}
                    }
                }
                FieldEffect::Publish => self.publish(id)?,
                FieldEffect::ValueChanged => {
                    let controller = self.field_mut(id)?;
                    if let Some(callback) = controller.config().side_effect.clone() {
                        let state = controller.state();
                        let notification = Notification::SideEffect {
                            callback,
                            value: state.value.clone(),
                            dependency: state.dependency.clone(),
                        };
                        self.queue.notify(notification);
                    }
                }
                FieldEffect::Errors(errors) => self.errors.register(&path, errors),
            }
        }
        Ok(())
    }

    /// Writes the node's entry into its parent and walks up while entries change.
    pub(super) fn publish(&mut self, id: NodeId) -> FormResult<()> {
        if let Some(dirty) = self.deferred_publish.as_mut() {
            dirty.insert(id);
            return Ok(());
        }
        let mut current = id;
        loop {
            let record = self.record(current)?;
            let Some(parent) = record.parent else {
                return Ok(());
            };
            let name = record.path.name().to_string();
            let entry = self.node_entry(current)?;
            if !self.group_mut(parent)?.store.set_entry(&name, entry)?.changed() {
                return Ok(());
            }
            current = parent;
        }
    }

    /// Rebuilds the stores of every ancestor of `dirty`, deepest first, each
    /// with a single `replace_all`.
    pub(super) fn rebuild_stores(&mut self, dirty: &BTreeSet<NodeId>) -> FormResult<()> {
        let mut groups = BTreeSet::new();
        for id in dirty {
            let mut current = self.nodes.get(id).and_then(|record| record.parent);
            while let Some(group) = current {
                if !groups.insert(group) {
                    break;
                }
                current = self.nodes.get(&group).and_then(|record| record.parent);
            }
        }
        let mut ordered = groups
            .into_iter()
            .map(|id| Ok((self.path_of(id)?.depth(), id)))
            .collect::<FormResult<Vec<_>>>()?;
        ordered.sort_by(|left, right| right.0.cmp(&left.0));

        for (_, group_id) in ordered {
            let record = self.record(group_id)?;
            let NodeBody::Group(group) = &record.body else {
                continue;
            };
            let mut next = group.store.clone();
            for (name, child) in &record.children {
                next.set_entry(name, self.node_entry(*child)?)?;
            }
            self.group_mut(group_id)?.store.replace_all(next);
        }
        Ok(())
    }

    /// Re-extracts dependencies until the root value stops changing.
    pub(super) fn refresh_dependencies(&mut self) -> FormResult<()> {
        for round in 0..self.options.max_propagation_rounds {
            let root_value = self.root_entry().value;
            if round > 0 && root_value == self.dependency_root {
                return Ok(());
            }
            self.dependency_root = root_value.clone();
            let tracked = self
                .nodes
                .iter()
                .filter_map(|(id, record)| match &record.body {
                    NodeBody::Field(controller) if controller.tracks_dependency() => Some(*id),
                    _ => None,
                })
                .collect::<Vec<_>>();
            trace!(round, fields = tracked.len(), "refreshing dependencies");

            let mut changed = false;
            for id in tracked {
                let ticket = self.allocate_ticket();
                let controller = self.field_mut(id)?;
                let effects = match controller.extract_dependency(&root_value) {
                    Ok(dependency) if dependency == controller.state().dependency => continue,
                    Ok(dependency) => controller.dependency_changed(dependency, ticket),
                    Err(fault) => {
                        warn!(%fault, "dependency extraction failed");
                        if controller.state().errors == [ValidationError::error_validating()] {
                            continue;
                        }
                        controller.apply(FieldEvent::Fault, ticket)
                    }
                };
                changed = true;
                self.apply_effects(id, effects)?;
            }
            if !changed && self.root_entry().value == self.dependency_root {
                return Ok(());
            }
        }
        warn!(
            rounds = self.options.max_propagation_rounds,
            "dependency propagation did not settle"
        );
        Ok(())
    }

    pub(super) fn change_field(&mut self, id: NodeId, value: FormValue) -> FormResult<()> {
        let path = self.path_of(id)?;
        self.pristine = false;
        self.errors.clear_injected(&path);
        let ticket = self.allocate_ticket();
        let effects = self.field_mut(id)?.change(value, ticket);
        self.apply_effects(id, effects)?;
        self.refresh_dependencies()
    }

    pub(super) fn field_event(&mut self, id: NodeId, event: FieldEvent) -> FormResult<()> {
        let ticket = self.allocate_ticket();
        let effects = self.field_mut(id)?.apply(event, ticket);
        self.apply_effects(id, effects)?;
        self.refresh_dependencies()
    }

    pub(super) fn resolve_validation(
        &mut self,
        id: NodeId,
        ticket: ValidationTicket,
        validation: Validation,
    ) -> FormResult<()> {
        if !self.nodes.contains_key(&id) {
            trace!(node = id.0, "validation resolved for an unmounted field");
            return Ok(());
        }
        self.field_event(id, FieldEvent::Resolved { ticket, validation })
    }

    pub(super) fn is_latest_ticket(&self, id: NodeId, ticket: ValidationTicket) -> bool {
        self.nodes
            .get(&id)
            .and_then(NodeRecord::field_state)
            .is_some_and(|state| state.phase == FieldPhase::Validating(ticket))
    }

    pub(super) fn run_deferred(&mut self) {
        for task in self.queue.take_deferred() {
            match task {
                DeferredTask::DiscardSnapshot { path, generation } => {
                    if self.snapshots.discard_generation(&path, generation) {
                        trace!(path = %path, "snapshot discarded");
                    }
                }
            }
        }
    }

    /// Drops queued jobs a newer run already superseded.
    fn take_current_validations(&mut self) -> Vec<ValidationJob> {
        let jobs = self.queue.take_validations();
        jobs.into_iter()
            .filter(|job| self.is_latest_ticket(job.node, job.ticket))
            .collect()
    }

    fn snapshot(&self) -> FormSnapshot {
        let root = self.root_entry();
        let validating = self
            .nodes
            .values()
            .filter_map(NodeRecord::field_state)
            .any(|state| state.validating);
        let editing = self
            .nodes
            .values()
            .filter(|record| record.edit_state().is_some_and(|edit| edit.is_edit))
            .map(|record| record.path.path().clone())
            .collect();
        FormSnapshot {
            value: root.value,
            valid: root.valid,
            validating,
            pristine: self.pristine,
            submit_state: self.submit_state,
            submit_count: self.submit_count,
            errors: self.errors.aggregate(),
            editing,
        }
    }
}

/// Handle to one form tree. Clones share the same tree.
#[derive(Clone)]
pub struct FormTree {
    pub(super) state: Arc<RwLock<TreeState>>,
}

impl Default for FormTree {
    fn default() -> Self {
        Self::new(FormOptions::default())
    }
}

impl FormTree {
    pub fn new(options: FormOptions) -> Self {
        Self::with_root(options, GroupConfig::default())
    }

    pub fn with_root(options: FormOptions, root: GroupConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(TreeState::new(options, root))),
        }
    }

    pub fn form_id(&self) -> FormResult<FormId> {
        self.inspect("reading form id", |state| Ok(state.id))
    }

    pub fn options(&self) -> FormResult<FormOptions> {
        self.inspect("reading form options", |state| Ok(state.options))
    }

    pub fn root(&self) -> NodeHandle {
        NodeHandle::new(self.clone(), ROOT_NODE)
    }

    pub fn node(&self, path: impl Into<FieldPath>) -> FormResult<Option<NodeHandle>> {
        let path = path.into();
        let id = self.inspect("looking up node", |state| Ok(state.paths.get(&path).copied()))?;
        Ok(id.map(|id| NodeHandle::new(self.clone(), id)))
    }

    pub fn field(&self, path: impl Into<FieldPath>) -> FormResult<Option<FieldHandle>> {
        let path = path.into();
        let id = self.inspect("looking up field", |state| Ok(state.field_at(&path)))?;
        Ok(id.map(|id| FieldHandle::new(NodeHandle::new(self.clone(), id))))
    }

    pub fn snapshot(&self) -> FormResult<FormSnapshot> {
        self.inspect("creating form snapshot", |state| Ok(state.snapshot()))
    }

    pub fn value(&self) -> FormResult<FormValue> {
        self.inspect("reading form value", |state| Ok(state.root_entry().value))
    }

    pub fn is_valid(&self) -> FormResult<bool> {
        self.inspect("reading form validity", |state| Ok(state.root_entry().valid))
    }

    pub fn is_pristine(&self) -> FormResult<bool> {
        self.inspect("reading pristine flag", |state| Ok(state.pristine))
    }

    pub fn value_as<M>(&self) -> FormResult<Option<M>>
    where
        M: FormModel,
    {
        Ok(M::from_form_value(&self.value()?))
    }

    pub fn errors(&self) -> FormResult<BTreeMap<FieldPath, Vec<ValidationError>>> {
        self.inspect("reading form errors", |state| Ok(state.errors.aggregate()))
    }

    /// Snapshot captured by an edit session at `path`, if one is open.
    pub fn edit_snapshot(&self, path: impl Into<FieldPath>) -> FormResult<Option<FormValue>> {
        let path = path.into();
        self.inspect("reading edit snapshot", |state| {
            Ok(state.snapshots.get(&path).map(|snapshot| snapshot.value.clone()))
        })
    }

    /// Resets the whole form, or only the listed paths.
    pub fn reset(&self, reset_list: Option<Vec<FieldPath>>) -> FormResult<()> {
        self.root().reset(reset_list)
    }

    pub fn force_validate(&self, targets: Option<BTreeMap<FieldPath, bool>>) -> FormResult<()> {
        self.root().force_validate(targets)
    }

    pub fn edit(&self) -> FormResult<()> {
        self.root().edit()
    }

    pub fn save(&self) -> FormResult<()> {
        self.root().save()
    }

    pub fn cancel(&self) -> FormResult<()> {
        self.root().cancel()
    }

    pub fn register_focus_handler(
        &self,
        path: impl Into<FieldPath>,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> FormResult<()> {
        let path = path.into();
        self.mutate("registering focus handler", |state| {
            state.focus_handlers.insert(path, Arc::new(handler));
            Ok(())
        })
    }

    pub fn register_scroll_handler(
        &self,
        path: impl Into<FieldPath>,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> FormResult<()> {
        let path = path.into();
        self.mutate("registering scroll handler", |state| {
            state.scroll_handlers.insert(path, Arc::new(handler));
            Ok(())
        })
    }

    /// Asks the widget at `path` to take focus. `false` when nothing handled it.
    pub fn focus_field(&self, path: impl Into<FieldPath>) -> FormResult<bool> {
        let path = path.into();
        self.mutate("requesting field focus", |state| {
            Ok(request(state, &path, RequestKind::Focus))
        })
    }

    pub fn scroll_field_into_view(&self, path: impl Into<FieldPath>) -> FormResult<bool> {
        let path = path.into();
        self.mutate("requesting field scroll", |state| {
            Ok(request(state, &path, RequestKind::Scroll))
        })
    }

    /// Sets field values by path. Unknown paths are skipped.
    pub fn set_fields_value<I, P, V>(&self, values: I) -> FormResult<()>
    where
        I: IntoIterator<Item = (P, V)>,
        P: Into<FieldPath>,
        V: Into<FormValue>,
    {
        let values = values
            .into_iter()
            .map(|(path, value)| (path.into(), value.into()))
            .collect::<Vec<(FieldPath, FormValue)>>();
        self.mutate("setting field values", |state| {
            for (path, value) in values {
                match state.field_at(&path) {
                    Some(id) => state.change_field(id, value)?,
                    None => debug!(path = %path, "set_fields_value skipped unknown field"),
                }
            }
            Ok(())
        })
    }

    pub fn inject_errors<I, P>(&self, errors: I) -> FormResult<()>
    where
        I: IntoIterator<Item = (P, InjectedErrors)>,
        P: Into<FieldPath>,
    {
        let errors = errors
            .into_iter()
            .map(|(path, injected)| (path.into(), injected))
            .collect::<Vec<(FieldPath, InjectedErrors)>>();
        self.mutate("injecting errors", |state| {
            for (path, injected) in errors {
                debug!(path = %path, count = injected.errors.len(), "errors injected");
                state.errors.inject(&path, injected);
            }
            Ok(())
        })
    }

    pub fn has_pending_validations(&self) -> FormResult<bool> {
        self.inspect("reading pending validations", |state| {
            Ok(state.queue.pending_validations() > 0)
        })
    }

    /// Drives queued validations (and the validations they trigger) to
    /// completion, then runs deferred tasks.
    pub async fn settle(&self) -> FormResult<()> {
        loop {
            let jobs = self.mutate("collecting validation jobs", |state| {
                Ok(state.take_current_validations())
            })?;
            if jobs.is_empty() {
                break;
            }
            let mut running = jobs
                .into_iter()
                .map(|job| job.run(self.clone()))
                .collect::<FuturesUnordered<_>>();
            while let Some(outcome) = running.next().await {
                let Some(validation) = outcome.validation else {
                    continue;
                };
                self.mutate("applying validation result", |state| {
                    state.resolve_validation(outcome.node, outcome.ticket, validation)
                })?;
            }
        }
        self.mutate("running deferred tasks", |_| Ok(()))
    }

    pub async fn submit_async<F, Fut>(&self, f: F) -> FormResult<()>
    where
        F: FnOnce(FormValue) -> Fut,
        Fut: Future<Output = FormResult<()>>,
    {
        self.mutate("preparing async submit", |state| {
            if matches!(
                state.submit_state,
                SubmitState::Validating | SubmitState::Submitting
            ) {
                return Err(FormError::AlreadySubmitting);
            }
            transition_submit_state(state, SubmitState::Validating)?;
            state.submit_count = state.submit_count.saturating_add(1);
            state.broadcast_force_validate(&ForceValidateFlag::All)
        })?;

        self.settle().await?;

        let value = self.mutate("moving async submit state to submitting", |state| {
            let root = state.root_entry();
            if !root.valid {
                transition_submit_state(state, SubmitState::Failed)?;
                return Ok(None);
            }
            transition_submit_state(state, SubmitState::Submitting)?;
            Ok(Some(root.value))
        })?;
        let Some(value) = value else {
            return Ok(());
        };

        let submit_result = f(value).await;
        self.mutate("completing async submit", |state| {
            if submit_result.is_ok() {
                transition_submit_state(state, SubmitState::Succeeded)
            } else {
                transition_submit_state(state, SubmitState::Failed)
            }
        })?;
        submit_result
    }

    pub(super) fn is_latest_ticket(&self, id: NodeId, ticket: ValidationTicket) -> bool {
        read_lock(&self.state, "checking latest validation ticket")
            .is_ok_and(|state| state.is_latest_ticket(id, ticket))
    }

    pub(super) fn inspect<R>(
        &self,
        context: &'static str,
        f: impl FnOnce(&TreeState) -> FormResult<R>,
    ) -> FormResult<R> {
        let state = read_lock(&self.state, context)?;
        f(&state)
    }

    /// Runs one pass: deferred tasks of the previous pass first, then `f`.
    /// With the lock released, the notifications `f` queued are dispatched
    /// and its sync validators run, each answer applied in a pass of its own.
    pub(super) fn mutate<R>(
        &self,
        context: &'static str,
        f: impl FnOnce(&mut TreeState) -> FormResult<R>,
    ) -> FormResult<R> {
        let (result, notifications, inline) = {
            let mut state = write_lock(&self.state, context)?;
            if state.queue.has_deferred() {
                state.run_deferred();
            }
            let result = f(&mut state);
            (
                result,
                state.queue.take_notifications(),
                state.queue.take_inline(),
            )
        };
        for notification in notifications {
            notification.dispatch(self);
        }
        let resolved = self.run_inline_validations(inline);
        let value = result?;
        resolved?;
        Ok(value)
    }

    fn run_inline_validations(&self, validations: Vec<InlineValidation>) -> FormResult<()> {
        for job in validations {
            if !self.is_latest_ticket(job.node, job.ticket) {
                trace!(path = %job.path, "sync validation superseded within its pass");
                continue;
            }
            let outcome = job.run();
            let Some(validation) = outcome.validation else {
                continue;
            };
            self.mutate("applying validation result", |state| {
                state.resolve_validation(outcome.node, outcome.ticket, validation)
            })?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum RequestKind {
    Focus,
    Scroll,
}

fn request(state: &mut TreeState, path: &FieldPath, kind: RequestKind) -> bool {
    if state.field_at(path).is_none() {
        debug!(path = %path, ?kind, "request for unknown field ignored");
        return false;
    }
    let handlers = match kind {
        RequestKind::Focus => &state.focus_handlers,
        RequestKind::Scroll => &state.scroll_handlers,
    };
    match handlers.get(path).cloned() {
        Some(handler) => {
            state.queue.notify(Notification::Request(handler));
            true
        }
        None => false,
    }
}

pub(super) fn transition_submit_state(state: &mut TreeState, next: SubmitState) -> FormResult<()> {
    let current = state.submit_state;
    if current == next {
        return Ok(());
    }

    let allowed = matches!(
        (current, next),
        (SubmitState::Idle, SubmitState::Validating)
            | (SubmitState::Validating, SubmitState::Submitting)
            | (SubmitState::Validating, SubmitState::Failed)
            | (SubmitState::Submitting, SubmitState::Succeeded)
            | (SubmitState::Submitting, SubmitState::Failed)
            | (SubmitState::Succeeded, SubmitState::Validating)
            | (SubmitState::Failed, SubmitState::Validating)
            | (_, SubmitState::Idle)
    );
    if !allowed {
        return Err(FormError::InvalidStateTransition {
            from: current,
            to: next,
        });
    }
    state.submit_state = next;
    Ok(())
}

pub(super) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| FormError::StatePoisoned(context))
}

pub(super) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| FormError::StatePoisoned(context))
}
