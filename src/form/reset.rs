use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::controller::{FormResult, NodeId, TreeState};
use super::field::FieldEvent;
use super::path::FieldPath;
use super::scheduler::Notification;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResetKey {
    /// Every node of the tree.
    All,
    /// A subtree root and everything under it.
    Subtree(FieldPath),
    /// Only the exact paths of the flag's list.
    Listed,
}

/// Reset broadcast token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResetFlag {
    pub key: ResetKey,
    pub list: Vec<FieldPath>,
}

impl ResetFlag {
    pub fn all() -> Self {
        Self {
            key: ResetKey::All,
            list: Vec::new(),
        }
    }

    pub fn subtree(path: FieldPath) -> Self {
        if path.is_root() {
            return Self::all();
        }
        Self {
            key: ResetKey::Subtree(path),
            list: Vec::new(),
        }
    }

    pub fn listed(list: Vec<FieldPath>) -> Self {
        Self {
            key: ResetKey::Listed,
            list,
        }
    }

    pub fn applies_to(&self, path: &FieldPath) -> bool {
        let keyed = match &self.key {
            ResetKey::All => true,
            ResetKey::Subtree(scope) => path.is_within(scope),
            ResetKey::Listed => false,
        };
        keyed || self.list.contains(path)
    }
}

/// Force-validate broadcast token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ForceValidateFlag {
    All,
    Subtree(FieldPath),
    Targeted(BTreeMap<FieldPath, bool>),
}

impl ForceValidateFlag {
    /// The `touched` value a field at `path` must take, if it is addressed.
    pub fn touched_for(&self, path: &FieldPath) -> Option<bool> {
        match self {
            ForceValidateFlag::All => Some(true),
            ForceValidateFlag::Subtree(scope) => path.is_within(scope).then_some(true),
            ForceValidateFlag::Targeted(targets) => targets.get(path).copied(),
        }
    }
}

impl TreeState {
    /// Reloads every field the flag addresses within one pass.
    ///
    /// Field stores are rebuilt bottom-up once all fields have been reset and
    /// dependencies refresh only afterwards.
    pub(super) fn broadcast_reset(&mut self, flag: &ResetFlag) -> FormResult<()> {
        let mut fields = Vec::new();
        let mut groups = Vec::new();
        for (id, record) in &self.nodes {
            let path = record.path.path();
            if !flag.applies_to(path) {
                continue;
            }
            if record.is_field() {
                fields.push((*id, path.clone()));
            } else if let Some(hook) = record.reset_hook() {
                groups.push((path.clone(), hook));
            }
        }
        for path in &flag.list {
            if !self.paths.contains_key(path) {
                debug!(path = %path, "reset list names an unmounted path");
            }
        }
        debug!(
            key = ?flag.key,
            fields = fields.len(),
            "broadcasting reset"
        );

        self.deferred_publish = Some(BTreeSet::new());
        let applied = self.reset_fields(&fields);
        let dirty = self.deferred_publish.take().unwrap_or_default();
        applied?;
        self.rebuild_stores(&dirty)?;

        for (path, hook) in groups {
            let restored = self.snapshots.value_for(&path);
            self.queue.notify(Notification::GroupReset { hook, restored });
        }
        self.refresh_dependencies()
    }

    fn reset_fields(&mut self, fields: &[(NodeId, FieldPath)]) -> FormResult<()> {
        for (id, path) in fields {
            let restored = self.snapshots.value_for(path);
            self.errors.clear_injected(path);
            let ticket = self.allocate_ticket();
            let effects = self.field_mut(*id)?.reset(restored, ticket);
            self.apply_effects(*id, effects)?;
        }
        Ok(())
    }

    pub(super) fn broadcast_force_validate(&mut self, flag: &ForceValidateFlag) -> FormResult<()> {
        if let ForceValidateFlag::Targeted(targets) = flag {
            for path in targets.keys() {
                if !self.paths.contains_key(path) {
                    debug!(path = %path, "force-validate target is not mounted");
                }
            }
        }
        let targets = self
            .nodes
            .iter()
            .filter(|(_, record)| record.is_field())
            .filter_map(|(id, record)| {
                flag.touched_for(record.path.path())
                    .map(|touched| (*id, touched))
            })
            .collect::<Vec<_>>();
        debug!(fields = targets.len(), "broadcasting force-validate");
        for (id, touched) in targets {
            let ticket = self.allocate_ticket();
            let effects = self
                .field_mut(id)?
                .apply(FieldEvent::ForceTouch(touched), ticket);
            self.apply_effects(id, effects)?;
        }
        Ok(())
    }
}
