use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Dotted address of a node inside one form tree. The root path is empty.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldPath(Arc<str>);

impl FieldPath {
    pub fn root() -> Self {
        Self(Arc::from(""))
    }

    pub fn new(path: impl AsRef<str>) -> Self {
        Self(Arc::from(path.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, name: &str) -> Self {
        resolve(Some(self), name)
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.').filter(|segment| !segment.is_empty())
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Segment-aware prefix test: `user.0.name` is within `user.0` and
    /// `user`, but not within `user.01`. Everything is within the root.
    pub fn is_within(&self, scope: &FieldPath) -> bool {
        if scope.is_root() {
            return true;
        }
        match self.0.strip_prefix(scope.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    }

    /// Segments leading from `ancestor` down to this path.
    pub fn relative_to(&self, ancestor: &FieldPath) -> Option<Vec<&str>> {
        if !self.is_within(ancestor) {
            return None;
        }
        let rest = self.0[ancestor.0.len()..].trim_start_matches('.');
        Some(rest.split('.').filter(|segment| !segment.is_empty()).collect())
    }

    /// Moves this path from under `old_scope` to under `new_scope`.
    pub fn rebase(&self, old_scope: &FieldPath, new_scope: &FieldPath) -> Option<FieldPath> {
        let relative = self.relative_to(old_scope)?;
        Some(
            relative
                .into_iter()
                .fold(new_scope.clone(), |path, segment| path.child(segment)),
        )
    }

    /// True when both paths share one allocation.
    pub fn same_identity(&self, other: &FieldPath) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for FieldPath {
    fn default() -> Self {
        Self::root()
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for FieldPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FieldPath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FieldPath {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

pub fn resolve(parent: Option<&FieldPath>, name: &str) -> FieldPath {
    match parent {
        Some(parent) if !parent.is_root() => FieldPath::new(format!("{parent}.{name}")),
        _ => FieldPath::new(name),
    }
}

/// Memoized path of one node.
///
/// Re-resolving with the same parent path and name hands back the same
/// allocation so consumers can compare paths by identity.
#[derive(Clone, Debug)]
pub struct PathResolver {
    parent: Option<FieldPath>,
    name: String,
    resolved: FieldPath,
}

impl PathResolver {
    pub fn root() -> Self {
        Self {
            parent: None,
            name: String::new(),
            resolved: FieldPath::root(),
        }
    }

    pub fn new(parent: Option<&FieldPath>, name: &str) -> Self {
        Self {
            parent: parent.cloned(),
            name: name.to_string(),
            resolved: resolve(parent, name),
        }
    }

    pub fn path(&self) -> &FieldPath {
        &self.resolved
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` when the resolved path changed.
    pub fn update(&mut self, parent: Option<&FieldPath>, name: &str) -> bool {
        if self.parent.as_ref() == parent && self.name == name {
            return false;
        }
        let next = resolve(parent, name);
        self.parent = parent.cloned();
        self.name = name.to_string();
        if next == self.resolved {
            return false;
        }
        self.resolved = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_skips_separator_for_root_parent() {
        assert_eq!(resolve(None, "user").as_str(), "user");
        assert_eq!(resolve(Some(&FieldPath::root()), "user").as_str(), "user");
        assert_eq!(
            resolve(Some(&FieldPath::new("user")), "0").as_str(),
            "user.0"
        );
    }

    #[test]
    fn resolver_is_stable_when_inputs_are_unchanged() {
        let parent = FieldPath::new("users");
        let mut resolver = PathResolver::new(Some(&parent), "1");
        let before = resolver.path().clone();
        assert!(!resolver.update(Some(&parent), "1"));
        assert!(before.same_identity(resolver.path()));

        assert!(resolver.update(Some(&parent), "0"));
        assert_eq!(resolver.path().as_str(), "users.0");
        assert!(!before.same_identity(resolver.path()));
    }

    #[test]
    fn within_is_segment_aware() {
        let scope = FieldPath::new("user.0");
        assert!(FieldPath::new("user.0").is_within(&scope));
        assert!(FieldPath::new("user.0.name").is_within(&scope));
        assert!(!FieldPath::new("user.01").is_within(&scope));
        assert!(!FieldPath::new("user.1.name").is_within(&scope));
        assert!(FieldPath::new("anything").is_within(&FieldPath::root()));
    }

    #[test]
    fn rebase_moves_descendants() {
        let path = FieldPath::new("users.2.address.city");
        let moved = path
            .rebase(&FieldPath::new("users.2"), &FieldPath::new("users.1"))
            .expect("path is within the old scope");
        assert_eq!(moved.as_str(), "users.1.address.city");
        assert_eq!(
            path.relative_to(&FieldPath::root()),
            Some(vec!["users", "2", "address", "city"])
        );
        assert_eq!(path.rebase(&FieldPath::new("users.3"), &FieldPath::root()), None);
    }
}
