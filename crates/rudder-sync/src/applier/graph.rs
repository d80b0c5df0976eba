//! Dependency graphs over object IDs.
//!
//! Objects reference each other by ID only. Edges come from the depends-on
//! annotation plus two implicit orderings: a namespaced object depends on its
//! Namespace when that Namespace is in the same set, and a custom resource
//! depends on the CRD that defines its kind when that CRD is in the set.
//! Waves are produced by Kahn's algorithm; a cycle is a validation error at
//! queue-build time.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use rudder_core::object::registry;
use rudder_core::{metadata, DynamicObject, ObjectId, SyncError};

/// Adjacency sets over object IDs, restricted to one object set.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// id -> prerequisites within the set.
    deps: HashMap<ObjectId, Vec<ObjectId>>,
    /// id -> dependents within the set.
    dependents: HashMap<ObjectId, Vec<ObjectId>>,
    /// All ids, in declaration order.
    ids: Vec<ObjectId>,
}

impl DependencyGraph {
    /// Builds the graph for an object set. Malformed or out-of-set
    /// depends-on references are reported by validation, not here; they are
    /// ignored for edge construction.
    #[must_use]
    pub fn build(objects: &[DynamicObject]) -> Self {
        let ids: Vec<ObjectId> = objects.iter().map(DynamicObject::id).collect();
        let id_set: HashSet<ObjectId> = ids.iter().cloned().collect();

        // Namespace objects and CRDs in the set, for implicit edges.
        let mut namespaces: HashMap<String, ObjectId> = HashMap::new();
        let mut crds: HashMap<(String, String), ObjectId> = HashMap::new();
        for obj in objects {
            let caps = registry::capabilities(&obj.gvk().group_kind());
            if caps.is_namespace {
                namespaces.insert(obj.name().to_string(), obj.id());
            }
            if caps.is_crd {
                let group = obj
                    .field("spec.group")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let kind = obj
                    .field("spec.names.kind")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if !kind.is_empty() {
                    crds.insert((group, kind), obj.id());
                }
            }
        }

        let mut deps: HashMap<ObjectId, Vec<ObjectId>> = HashMap::new();
        let mut dependents: HashMap<ObjectId, Vec<ObjectId>> = HashMap::new();
        let mut add_edge = |from: &ObjectId, to: ObjectId| {
            if to == *from || !id_set.contains(&to) {
                return;
            }
            let entry = deps.entry(from.clone()).or_default();
            if !entry.contains(&to) {
                entry.push(to.clone());
                dependents.entry(to).or_default().push(from.clone());
            }
        };

        for obj in objects {
            let id = obj.id();
            for dep in metadata::depends_on(obj).unwrap_or_default() {
                add_edge(&id, dep);
            }
            if let Some(ns_id) = namespaces.get(&id.namespace) {
                add_edge(&id, ns_id.clone());
            }
            if let Some(crd_id) = crds.get(&(id.group.clone(), id.kind.clone())) {
                add_edge(&id, crd_id.clone());
            }
        }

        Self {
            deps,
            dependents,
            ids,
        }
    }

    /// Prerequisites of one object within the set.
    #[must_use]
    pub fn dependencies_of(&self, id: &ObjectId) -> &[ObjectId] {
        self.deps.get(id).map_or(&[], Vec::as_slice)
    }

    /// A copy of the full prerequisite map.
    #[must_use]
    pub fn dependency_map(&self) -> HashMap<ObjectId, Vec<ObjectId>> {
        self.deps.clone()
    }

    /// A copy of the full dependent map.
    #[must_use]
    pub fn dependents_map(&self) -> HashMap<ObjectId, Vec<ObjectId>> {
        self.dependents.clone()
    }

    /// Dependents of one object within the set.
    #[must_use]
    pub fn dependents_of(&self, id: &ObjectId) -> &[ObjectId] {
        self.dependents.get(id).map_or(&[], Vec::as_slice)
    }

    /// Topologically partitions the set into waves: every object lands in a
    /// wave strictly after all of its prerequisites. Declaration order is
    /// preserved within a wave.
    ///
    /// # Errors
    ///
    /// `SyncError::Validation` naming the cycle members when the graph has a
    /// cycle.
    pub fn sorted_waves(&self) -> Result<Vec<Vec<ObjectId>>, SyncError> {
        let mut unmet: IndexMap<ObjectId, usize> = self
            .ids
            .iter()
            .map(|id| (id.clone(), self.dependencies_of(id).len()))
            .collect();

        let mut waves = Vec::new();
        while !unmet.is_empty() {
            let ready: Vec<ObjectId> = unmet
                .iter()
                .filter(|(_, count)| **count == 0)
                .map(|(id, _)| id.clone())
                .collect();
            if ready.is_empty() {
                let mut cycle: Vec<ObjectId> = unmet.keys().cloned().collect();
                cycle.sort();
                return Err(SyncError::Validation {
                    message: format!(
                        "cyclic dependency among {} object(s): {}",
                        cycle.len(),
                        cycle
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join("; ")
                    ),
                    ids: cycle,
                });
            }
            for id in &ready {
                unmet.shift_remove(id);
                for dependent in self.dependents_of(id) {
                    if let Some(count) = unmet.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            waves.push(ready);
        }
        Ok(waves)
    }

    /// Waves in reverse topological order, for pruning: dependents go before
    /// their prerequisites.
    ///
    /// # Errors
    ///
    /// Same cycle error as [`Self::sorted_waves`].
    pub fn reversed_waves(&self) -> Result<Vec<Vec<ObjectId>>, SyncError> {
        let mut waves = self.sorted_waves()?;
        waves.reverse();
        Ok(waves)
    }
}
