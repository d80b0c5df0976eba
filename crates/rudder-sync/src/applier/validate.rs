//! Structural validation of the declared object set.
//!
//! Validation runs before any mutation. Under the exit-early policy a single
//! invalid object aborts the cycle; under skip-invalid the invalid IDs are
//! registered with the task context so they remain in the inventory but are
//! excluded from this cycle's mutations.

use std::collections::{HashMap, HashSet};

use rudder_core::inventory;
use rudder_core::object::registry;
use rudder_core::{metadata, DynamicObject, ObjectId, Scope, SyncError, SyncTarget};

/// Collects validation errors and the IDs they invalidate.
#[derive(Debug, Default)]
pub struct ValidationCollector {
    errors: Vec<SyncError>,
    invalid: Vec<ObjectId>,
}

impl ValidationCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one rejection covering the given IDs.
    pub fn record(&mut self, ids: Vec<ObjectId>, message: String) {
        for id in &ids {
            if !self.invalid.contains(id) {
                self.invalid.push(id.clone());
            }
        }
        self.errors.push(SyncError::Validation { ids, message });
    }

    /// Records a rejection produced elsewhere (e.g. a dependency cycle).
    pub fn record_error(&mut self, err: SyncError) {
        if let SyncError::Validation { ids, .. } = &err {
            for id in ids {
                if !self.invalid.contains(id) {
                    self.invalid.push(id.clone());
                }
            }
        }
        self.errors.push(err);
    }

    /// The collected errors, in order.
    #[must_use]
    pub fn errors(&self) -> &[SyncError] {
        &self.errors
    }

    /// The invalidated IDs, in first-rejection order.
    #[must_use]
    pub fn invalid_ids(&self) -> &[ObjectId] {
        &self.invalid
    }

    /// Whether nothing was rejected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validates a declared object set against structural rules and the sync
/// scope, recording every rejection with the collector.
pub fn validate(objects: &[DynamicObject], target: &SyncTarget, collector: &mut ValidationCollector) {
    let declared: HashSet<ObjectId> = objects.iter().map(DynamicObject::id).collect();

    let mut seen: HashMap<ObjectId, usize> = HashMap::new();
    for obj in objects {
        *seen.entry(obj.id()).or_default() += 1;
    }
    for (id, count) in seen {
        if count > 1 {
            collector.record(
                vec![id.clone()],
                format!("ID {id} is declared {count} times; IDs must be unambiguous"),
            );
        }
    }

    for obj in objects {
        let id = obj.id();

        if id.name.is_empty() || id.kind.is_empty() {
            collector.record(vec![id.clone()], "object is missing kind or name".to_string());
            continue;
        }

        if obj.gvk() == inventory::inventory_gvk() {
            collector.record(
                vec![id.clone()],
                "inventory objects may not be declared inline; the inventory is managed by the sync"
                    .to_string(),
            );
            continue;
        }

        let cluster_scoped = registry::is_cluster_scoped(&id.group_kind());
        if cluster_scoped && !id.namespace.is_empty() {
            collector.record(
                vec![id.clone()],
                format!("cluster-scoped kind {} must not set a namespace", id.group_kind()),
            );
        }
        if !cluster_scoped && id.namespace.is_empty() {
            collector.record(
                vec![id.clone()],
                format!("namespaced kind {} must set a namespace", id.group_kind()),
            );
        }

        match &target.scope {
            Scope::Root => {}
            Scope::Namespace(ns) => {
                if cluster_scoped {
                    collector.record(
                        vec![id.clone()],
                        format!(
                            "sync {} is scoped to namespace {ns} and may not declare cluster-scoped objects",
                            target.name
                        ),
                    );
                } else if !target.scope.permits(&id.namespace) {
                    collector.record(
                        vec![id.clone()],
                        format!(
                            "sync {} is scoped to namespace {ns} and may not declare objects in {}",
                            target.name, id.namespace
                        ),
                    );
                }
            }
        }

        match metadata::depends_on(obj) {
            Ok(deps) => {
                for dep in deps {
                    if !declared.contains(&dep) {
                        collector.record(
                            vec![id.clone()],
                            format!("depends-on references {dep}, which is not in the declared set"),
                        );
                    }
                }
            }
            Err(err) => {
                collector.record(vec![id.clone()], err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rudder_core::metadata::DEPENDS_ON_ANNOTATION;
    use rudder_core::object::Gvk;

    use super::*;

    fn config_map(ns: &str, name: &str) -> DynamicObject {
        DynamicObject::named(&Gvk::core("v1", "ConfigMap"), ns, name)
    }

    fn run(objects: &[DynamicObject], target: &SyncTarget) -> ValidationCollector {
        let mut collector = ValidationCollector::new();
        validate(objects, target, &mut collector);
        collector
    }

    #[test]
    fn test_valid_set_passes() {
        let objects = vec![config_map("ns", "a"), config_map("ns", "b")];
        assert!(run(&objects, &SyncTarget::root("root-sync")).is_empty());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let objects = vec![config_map("ns", "a"), config_map("ns", "a")];
        let collector = run(&objects, &SyncTarget::root("root-sync"));
        assert_eq!(collector.errors().len(), 1);
        assert_eq!(collector.invalid_ids().len(), 1);
    }

    #[test]
    fn test_inline_inventory_rejected() {
        let inv = DynamicObject::named(&inventory::inventory_gvk(), "rudder-system", "inv");
        let collector = run(&[inv], &SyncTarget::root("root-sync"));
        assert!(!collector.is_empty());
    }

    #[test]
    fn test_scope_violations_rejected() {
        let target = SyncTarget::namespaced("repo-sync", "shipping");

        let foreign = config_map("billing", "cm");
        let collector = run(&[foreign], &target);
        assert_eq!(collector.errors().len(), 1);

        let cluster_scoped =
            DynamicObject::named(&Gvk::new("rbac.authorization.k8s.io", "v1", "ClusterRole"), "", "admin");
        let collector = run(&[cluster_scoped], &target);
        assert_eq!(collector.errors().len(), 1);

        let ok = config_map("shipping", "cm");
        assert!(run(&[ok], &target).is_empty());
    }

    #[test]
    fn test_missing_namespace_rejected() {
        let collector = run(&[config_map("", "cm")], &SyncTarget::root("root-sync"));
        assert_eq!(collector.errors().len(), 1);
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let mut obj = config_map("ns", "a");
        obj.set_annotation(DEPENDS_ON_ANNOTATION, "/ConfigMap/ns/ghost");
        let collector = run(&[obj], &SyncTarget::root("root-sync"));
        assert_eq!(collector.errors().len(), 1);
        assert_eq!(
            collector.invalid_ids(),
            &[ObjectId::new("", "ConfigMap", "ns", "a")]
        );
    }

    #[test]
    fn test_malformed_dependency_rejected() {
        let mut obj = config_map("ns", "a");
        obj.set_annotation(DEPENDS_ON_ANNOTATION, "garbage");
        let collector = run(&[obj], &SyncTarget::root("root-sync"));
        assert_eq!(collector.errors().len(), 1);
    }
}
