//! Apply and prune filters.
//!
//! Filters run per object during task execution, after the queue is built:
//! they enforce the adoption policy, the deletion opt-out, namespace prune
//! safety, and dependency outcomes from earlier waves.

use std::collections::{HashMap, HashSet};

use rudder_core::config::AdoptionPolicy;
use rudder_core::inventory::{Actuation, Reconcile};
use rudder_core::{metadata, DynamicObject, ObjectId, SyncError};

use super::task::TaskContext;

/// What happens to the inventory record of an object skipped by a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDisposition {
    /// Keep the record; the next cycle retries.
    Retain,
    /// Drop the record; the object belongs to someone else.
    Forget,
    /// Drop the record and strip the management metadata off the live
    /// object; it opted out of management.
    Detach,
}

/// Decision of one filter for one object.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterResult {
    /// Proceed with the mutation.
    Allow,
    /// Skip the mutation this cycle.
    Skip {
        /// Human-readable skip reason, surfaced on the event.
        reason: String,
        /// Inventory handling for the skipped object.
        disposition: SkipDisposition,
    },
    /// Fail the object with an error.
    Fail {
        /// The failure.
        error: SyncError,
    },
}

/// Filter applied to each object before its apply.
pub trait ApplyFilter: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Decides whether `obj` may be applied over `live`.
    fn filter(&self, obj: &DynamicObject, live: Option<&DynamicObject>, ctx: &TaskContext)
        -> FilterResult;
}

/// Filter applied to each live object before its prune.
pub trait PruneFilter: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Decides whether `live` may be pruned.
    fn filter(&self, live: &DynamicObject, ctx: &TaskContext) -> FilterResult;
}

/// Enforces the adoption policy against the live object's inventory-ID
/// annotation and manager label.
pub struct InventoryPolicyApplyFilter {
    /// Adoption policy in force.
    pub policy: AdoptionPolicy,
    /// This sync's inventory ID.
    pub inventory_id: String,
    /// This sync's manager string.
    pub manager: String,
}

impl InventoryPolicyApplyFilter {
    fn conflict(&self, id: ObjectId, live: &DynamicObject) -> FilterResult {
        FilterResult::Fail {
            error: SyncError::ManagementConflict {
                id,
                current_manager: metadata::manager_of(live).unwrap_or("<unmanaged>").to_string(),
                other_manager: self.manager.clone(),
            },
        }
    }
}

impl ApplyFilter for InventoryPolicyApplyFilter {
    fn name(&self) -> &'static str {
        "inventory-policy-apply"
    }

    fn filter(
        &self,
        obj: &DynamicObject,
        live: Option<&DynamicObject>,
        _ctx: &TaskContext,
    ) -> FilterResult {
        let Some(live) = live else {
            return FilterResult::Allow;
        };
        match metadata::inventory_id_of(live) {
            Some(id) if id == self.inventory_id => FilterResult::Allow,
            // Owned by a different inventory: only AdoptAll takes over.
            Some(_) => match self.policy {
                AdoptionPolicy::AdoptAll => FilterResult::Allow,
                AdoptionPolicy::AdoptIfNoInventory | AdoptionPolicy::PreventAdoption => {
                    self.conflict(obj.id(), live)
                }
            },
            // Unowned: adoptable unless the policy forbids it.
            None => match self.policy {
                AdoptionPolicy::AdoptAll | AdoptionPolicy::AdoptIfNoInventory => FilterResult::Allow,
                AdoptionPolicy::PreventAdoption => self.conflict(obj.id(), live),
            },
        }
    }
}

/// Skips an object whose prerequisites did not apply and reconcile in an
/// earlier wave.
pub struct DependencyApplyFilter {
    /// id -> prerequisites within the declared set.
    pub deps: HashMap<ObjectId, Vec<ObjectId>>,
}

impl ApplyFilter for DependencyApplyFilter {
    fn name(&self) -> &'static str {
        "dependency-apply"
    }

    fn filter(
        &self,
        obj: &DynamicObject,
        _live: Option<&DynamicObject>,
        ctx: &TaskContext,
    ) -> FilterResult {
        let id = obj.id();
        for dep in self.deps.get(&id).map_or(&[][..], Vec::as_slice) {
            if ctx.is_invalid(dep) {
                return FilterResult::Skip {
                    reason: format!("dependency {dep} is invalid"),
                    disposition: SkipDisposition::Retain,
                };
            }
            if ctx.actuation(dep) != Some(Actuation::Succeeded) {
                return FilterResult::Skip {
                    reason: format!("dependency {dep} was not applied"),
                    disposition: SkipDisposition::Retain,
                };
            }
            if ctx.reconcile(dep) != Some(Reconcile::Current) {
                return FilterResult::Skip {
                    reason: format!("dependency {dep} has not reconciled"),
                    disposition: SkipDisposition::Retain,
                };
            }
        }
        FilterResult::Allow
    }
}

/// Honors the lifecycle annotation opting an object out of deletion. The
/// object is detached: dropped from the inventory with its management
/// metadata stripped.
pub struct PreventRemoveFilter;

impl PruneFilter for PreventRemoveFilter {
    fn name(&self) -> &'static str {
        "prevent-remove"
    }

    fn filter(&self, live: &DynamicObject, _ctx: &TaskContext) -> FilterResult {
        if metadata::prevents_deletion(live) {
            FilterResult::Skip {
                reason: format!(
                    "object opted out of deletion ({}: {})",
                    metadata::LIFECYCLE_DELETION_ANNOTATION,
                    metadata::LIFECYCLE_DETACH
                ),
                disposition: SkipDisposition::Detach,
            }
        } else {
            FilterResult::Allow
        }
    }
}

/// Refuses to prune objects this inventory does not own.
pub struct InventoryPolicyPruneFilter {
    /// Adoption policy in force.
    pub policy: AdoptionPolicy,
    /// This sync's inventory ID.
    pub inventory_id: String,
}

impl PruneFilter for InventoryPolicyPruneFilter {
    fn name(&self) -> &'static str {
        "inventory-policy-prune"
    }

    fn filter(&self, live: &DynamicObject, _ctx: &TaskContext) -> FilterResult {
        if self.policy == AdoptionPolicy::AdoptAll {
            return FilterResult::Allow;
        }
        match metadata::inventory_id_of(live) {
            Some(id) if id == self.inventory_id => FilterResult::Allow,
            _ => FilterResult::Skip {
                reason: "object is not owned by this inventory".to_string(),
                disposition: SkipDisposition::Forget,
            },
        }
    }
}

/// Never prunes a namespace that still holds declared objects of this sync.
pub struct LocalNamespacesFilter {
    /// Namespaces referenced by the declared set (plus the inventory's own
    /// namespace).
    pub namespaces: HashSet<String>,
}

impl PruneFilter for LocalNamespacesFilter {
    fn name(&self) -> &'static str {
        "local-namespaces"
    }

    fn filter(&self, live: &DynamicObject, _ctx: &TaskContext) -> FilterResult {
        if live.is_namespace() && self.namespaces.contains(live.name()) {
            FilterResult::Skip {
                reason: "namespace still in use".to_string(),
                disposition: SkipDisposition::Retain,
            }
        } else {
            FilterResult::Allow
        }
    }
}

/// Refuses to prune an object that something still depends on: a declared
/// object naming it as a prerequisite, or an in-set dependent whose own
/// prune has not succeeded.
pub struct DependencyPruneFilter {
    /// prune id -> declared objects depending on it.
    pub declared_dependents: HashMap<ObjectId, Vec<ObjectId>>,
    /// prune id -> other prune candidates depending on it.
    pub prune_dependents: HashMap<ObjectId, Vec<ObjectId>>,
}

impl PruneFilter for DependencyPruneFilter {
    fn name(&self) -> &'static str {
        "dependency-prune"
    }

    fn filter(&self, live: &DynamicObject, ctx: &TaskContext) -> FilterResult {
        let id = live.id();
        if let Some(dependent) = self
            .declared_dependents
            .get(&id)
            .and_then(|deps| deps.first())
        {
            return FilterResult::Skip {
                reason: format!("dependent {dependent} is still declared"),
                disposition: SkipDisposition::Retain,
            };
        }
        for dependent in self.prune_dependents.get(&id).map_or(&[][..], Vec::as_slice) {
            if ctx.actuation(dependent) != Some(Actuation::Succeeded) {
                return FilterResult::Skip {
                    reason: format!("dependent {dependent} has not been pruned"),
                    disposition: SkipDisposition::Retain,
                };
            }
        }
        FilterResult::Allow
    }
}
