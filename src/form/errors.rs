use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::path::FieldPath;
use super::validation::ValidationError;

/// Errors supplied from outside the validators, e.g. a server response.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct InjectedErrors {
    pub errors: Vec<ValidationError>,
    /// Replace validator errors instead of appending to them.
    #[serde(default, rename = "override")]
    pub override_existing: bool,
}

impl InjectedErrors {
    pub fn merge(errors: Vec<ValidationError>) -> Self {
        Self {
            errors,
            override_existing: false,
        }
    }

    pub fn replace(errors: Vec<ValidationError>) -> Self {
        Self {
            errors,
            override_existing: true,
        }
    }
}

/// Root-level map from field path to its current errors.
#[derive(Clone, Debug, Default)]
pub struct ErrorRegistry {
    registered: BTreeMap<FieldPath, Vec<ValidationError>>,
    injected: BTreeMap<FieldPath, InjectedErrors>,
}

impl ErrorRegistry {
    pub fn register(&mut self, path: &FieldPath, errors: Vec<ValidationError>) {
        if errors.is_empty() {
            self.registered.remove(path);
        } else {
            self.registered.insert(path.clone(), errors);
        }
    }

    pub fn inject(&mut self, path: &FieldPath, injected: InjectedErrors) {
        if injected.errors.is_empty() && !injected.override_existing {
            self.injected.remove(path);
        } else {
            self.injected.insert(path.clone(), injected);
        }
    }

    pub fn clear_injected(&mut self, path: &FieldPath) -> bool {
        self.injected.remove(path).is_some()
    }

    /// Validator errors for `path` merged with, or replaced by, injected ones.
    pub fn errors_for(&self, path: &FieldPath) -> Vec<ValidationError> {
        let registered = self.registered.get(path);
        match self.injected.get(path) {
            Some(injected) if injected.override_existing => injected.errors.clone(),
            Some(injected) => {
                let mut errors = registered.cloned().unwrap_or_default();
                for error in &injected.errors {
                    if !errors.contains(error) {
                        errors.push(error.clone());
                    }
                }
                errors
            }
            None => registered.cloned().unwrap_or_default(),
        }
    }

    /// Live union of every registered and injected path.
    pub fn aggregate(&self) -> BTreeMap<FieldPath, Vec<ValidationError>> {
        self.registered
            .keys()
            .chain(self.injected.keys())
            .filter_map(|path| {
                let errors = self.errors_for(path);
                (!errors.is_empty()).then(|| (path.clone(), errors))
            })
            .collect()
    }

    pub fn contains(&self, path: &FieldPath) -> bool {
        self.registered.contains_key(path) || self.injected.contains_key(path)
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty() && self.injected.is_empty()
    }

    /// Moves every path within `old_scope` under `new_scope`.
    pub fn rekey(&mut self, old_scope: &FieldPath, new_scope: &FieldPath) {
        rekey_map(&mut self.registered, old_scope, new_scope);
        rekey_map(&mut self.injected, old_scope, new_scope);
    }

    pub fn remove_within(&mut self, scope: &FieldPath) {
        self.registered.retain(|path, _| !path.is_within(scope));
        self.injected.retain(|path, _| !path.is_within(scope));
    }
}

pub(super) fn rekey_map<V>(
    map: &mut BTreeMap<FieldPath, V>,
    old_scope: &FieldPath,
    new_scope: &FieldPath,
) {
    let moved = map
        .keys()
        .filter(|path| path.is_within(old_scope))
        .cloned()
        .collect::<Vec<_>>();
    let mut relocated = Vec::with_capacity(moved.len());
    for path in moved {
        if let (Some(value), Some(next)) = (map.remove(&path), path.rebase(old_scope, new_scope)) {
            relocated.push((next, value));
        }
    }
    map.extend(relocated);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(text: &str) -> ValidationError {
        ValidationError::new(text)
    }

    #[test]
    fn empty_registration_deletes_the_path() {
        let mut registry = ErrorRegistry::default();
        let path = FieldPath::new("age");
        registry.register(&path, vec![error("too short")]);
        assert!(registry.contains(&path));
        registry.register(&path, Vec::new());
        assert!(!registry.contains(&path));
        assert!(registry.aggregate().is_empty());
    }

    #[test]
    fn injected_errors_merge_unless_overriding() {
        let mut registry = ErrorRegistry::default();
        let path = FieldPath::new("email");
        registry.register(&path, vec![error("invalid")]);

        registry.inject(&path, InjectedErrors::merge(vec![error("taken")]));
        assert_eq!(registry.errors_for(&path), vec![error("invalid"), error("taken")]);

        registry.inject(&path, InjectedErrors::replace(vec![error("taken")]));
        assert_eq!(registry.errors_for(&path), vec![error("taken")]);

        assert!(registry.clear_injected(&path));
        assert_eq!(registry.errors_for(&path), vec![error("invalid")]);
    }

    #[test]
    fn injected_paths_appear_in_aggregate() {
        let mut registry = ErrorRegistry::default();
        registry.inject(
            &FieldPath::new("server"),
            InjectedErrors::merge(vec![error("down")]),
        );
        let aggregate = registry.aggregate();
        assert_eq!(aggregate.get("server"), Some(&vec![error("down")]));
    }

    #[test]
    fn rekey_moves_only_the_scope() {
        let mut registry = ErrorRegistry::default();
        registry.register(&FieldPath::new("users.2.name"), vec![error("a")]);
        registry.register(&FieldPath::new("users.20.name"), vec![error("b")]);
        registry.rekey(&FieldPath::new("users.2"), &FieldPath::new("users.1"));
        assert!(registry.contains(&FieldPath::new("users.1.name")));
        assert!(registry.contains(&FieldPath::new("users.20.name")));
        assert!(!registry.contains(&FieldPath::new("users.2.name")));
    }

    #[test]
    fn override_flag_deserializes_from_override_key() {
        let injected: InjectedErrors = serde_json::from_value(serde_json::json!({
            "errors": [{"text": "taken"}],
            "override": true,
        }))
        .expect("deserialize injected errors");
        assert!(injected.override_existing);
    }
}
