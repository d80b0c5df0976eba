//! Object identity and representation.
//!
//! Declared and live resources are identified by [`ObjectId`] and carried as
//! schema-free [`DynamicObject`] field trees, so arbitrary user-defined kinds
//! flow through the engine without compiled-in schemas.

mod dynamic;
pub mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use dynamic::{DynamicObject, ObjectError};

/// A group/version/kind triple identifying a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    /// API group. Empty for the core group.
    pub group: String,
    /// API version within the group.
    pub version: String,
    /// Resource kind.
    pub kind: String,
}

impl Gvk {
    /// Creates a new group/version/kind.
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Creates a core-group (empty group) kind.
    pub fn core(version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::new("", version, kind)
    }

    /// The `apiVersion` string form: `group/version`, or bare `version` for
    /// the core group.
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Splits an `apiVersion` string into (group, version).
    #[must_use]
    pub fn split_api_version(api_version: &str) -> (String, String) {
        match api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), api_version.to_string()),
        }
    }

    /// The version-insensitive group/kind pair, used for dispatch.
    #[must_use]
    pub fn group_kind(&self) -> GroupKind {
        GroupKind {
            group: self.group.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// A group/kind pair, without the version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKind {
    /// API group. Empty for the core group.
    pub group: String,
    /// Resource kind.
    pub kind: String,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// The identity of a declared or live object: (group, kind, namespace, name).
///
/// The namespace is empty for cluster-scoped objects. IDs are unique within a
/// snapshot and are the only way objects reference each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    /// API group. Empty for the core group.
    pub group: String,
    /// Resource kind.
    pub kind: String,
    /// Namespace. Empty for cluster-scoped objects.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ObjectId {
    /// Creates a new object ID.
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The group/kind pair of this ID.
    #[must_use]
    pub fn group_kind(&self) -> GroupKind {
        GroupKind {
            group: self.group.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}, {}/{}", self.kind, self.namespace, self.name)
        } else {
            write!(f, "{}.{}, {}/{}", self.kind, self.group, self.namespace, self.name)
        }
    }
}

/// The scope of a sync: root syncs manage cluster-level objects and any
/// namespace, namespace syncs are restricted to one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "namespace", rename_all = "snake_case")]
pub enum Scope {
    /// Cluster-wide scope. May manage cluster-scoped objects and create
    /// namespaces implicitly.
    Root,
    /// Restricted to a single namespace.
    Namespace(String),
}

impl Scope {
    /// Returns `true` for the root scope.
    #[must_use]
    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }

    /// Returns `true` if this scope may manage an object in `namespace`
    /// (empty string meaning cluster-scoped).
    #[must_use]
    pub fn permits(&self, namespace: &str) -> bool {
        match self {
            Self::Root => true,
            Self::Namespace(ns) => !namespace.is_empty() && ns == namespace,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, ":root"),
            Self::Namespace(ns) => write!(f, "{ns}"),
        }
    }
}

/// One unit of configuration reconciliation: a named sync with a scope.
///
/// The manager string derived from a target is stamped as a label onto every
/// object the sync owns, and designates exactly one owning sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    /// Name of the sync.
    pub name: String,
    /// Scope of the sync.
    pub scope: Scope,
}

impl SyncTarget {
    /// Creates a root-scoped sync target.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Scope::Root,
        }
    }

    /// Creates a namespace-scoped sync target.
    pub fn namespaced(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Scope::Namespace(namespace.into()),
        }
    }

    /// The manager label value identifying this sync on live objects.
    #[must_use]
    pub fn manager(&self) -> String {
        format!("{}_{}", self.scope, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gvk_api_version_round_trip() {
        let gvk = Gvk::new("apps", "v1", "Deployment");
        assert_eq!(gvk.api_version(), "apps/v1");
        assert_eq!(
            Gvk::split_api_version("apps/v1"),
            ("apps".to_string(), "v1".to_string())
        );

        let core = Gvk::core("v1", "ConfigMap");
        assert_eq!(core.api_version(), "v1");
        assert_eq!(Gvk::split_api_version("v1"), (String::new(), "v1".to_string()));
    }

    #[test]
    fn test_object_id_display() {
        let id = ObjectId::new("", "Namespace", "", "foo");
        assert_eq!(id.to_string(), "Namespace, /foo");

        let id = ObjectId::new("rbac.authorization.k8s.io", "Role", "ns", "pods");
        assert_eq!(id.to_string(), "Role.rbac.authorization.k8s.io, ns/pods");
    }

    #[test]
    fn test_scope_permits() {
        assert!(Scope::Root.permits(""));
        assert!(Scope::Root.permits("anything"));

        let ns = Scope::Namespace("shipping".to_string());
        assert!(ns.permits("shipping"));
        assert!(!ns.permits("billing"));
        assert!(!ns.permits(""));
    }

    #[test]
    fn test_manager_string() {
        assert_eq!(SyncTarget::root("root-sync").manager(), ":root_root-sync");
        assert_eq!(
            SyncTarget::namespaced("repo-sync", "shipping").manager(),
            "shipping_repo-sync"
        );
    }
}
