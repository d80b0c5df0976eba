//! Kind capability registry.
//!
//! A small (group, kind) table for the kinds whose semantics differ from the
//! generic apply/diff path. Everything unlisted is treated as a namespaced
//! generic resource.

use super::GroupKind;

/// Capability set for a (group, kind) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether objects of this kind live outside any namespace.
    pub cluster_scoped: bool,
    /// Whether this kind is the Namespace kind itself.
    pub is_namespace: bool,
    /// Whether this kind defines custom resource types.
    pub is_crd: bool,
}

const GENERIC: Capabilities = Capabilities {
    cluster_scoped: false,
    is_namespace: false,
    is_crd: false,
};

const CLUSTER: Capabilities = Capabilities {
    cluster_scoped: true,
    is_namespace: false,
    is_crd: false,
};

/// Looks up the capability set for a group/kind.
#[must_use]
pub fn capabilities(gk: &GroupKind) -> Capabilities {
    match (gk.group.as_str(), gk.kind.as_str()) {
        ("", "Namespace") => Capabilities {
            cluster_scoped: true,
            is_namespace: true,
            is_crd: false,
        },
        ("apiextensions.k8s.io", "CustomResourceDefinition") => Capabilities {
            cluster_scoped: true,
            is_namespace: false,
            is_crd: true,
        },
        ("", "Node" | "PersistentVolume") => CLUSTER,
        ("rbac.authorization.k8s.io", "ClusterRole" | "ClusterRoleBinding") => CLUSTER,
        ("admissionregistration.k8s.io", _) => CLUSTER,
        ("storage.k8s.io", "StorageClass") => CLUSTER,
        _ => GENERIC,
    }
}

/// Whether objects of this group/kind are cluster-scoped.
#[must_use]
pub fn is_cluster_scoped(gk: &GroupKind) -> bool {
    capabilities(gk).cluster_scoped
}
