//! Task taxonomy and shared run context.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use rudder_core::inventory::{Actuation, Reconcile};
use rudder_core::object::DynamicObject;
use rudder_core::{MultiError, ObjectId, SyncError};
use tokio::sync::mpsc;

use super::event::{ActionGroup, Event, TaskAction};

/// Which inventory write a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryPhase {
    /// Record the intended actuation set before any mutation.
    Pre,
    /// Finalize with observed outcomes.
    Post,
}

/// One step of an apply run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Persist the inventory.
    InventoryUpsert(InventoryPhase),
    /// Apply one dependency wave; objects within a wave are independent.
    ApplyWave {
        /// Objects to apply.
        ids: Vec<ObjectId>,
    },
    /// Wait for an applied wave to become current.
    WaitCurrent {
        /// Objects to await.
        ids: Vec<ObjectId>,
        /// Per-wave deadline.
        timeout: Duration,
    },
    /// Prune one reverse-dependency wave.
    PruneWave {
        /// Objects to prune.
        ids: Vec<ObjectId>,
    },
    /// Wait for a pruned wave to be gone.
    WaitGone {
        /// Objects to await.
        ids: Vec<ObjectId>,
        /// Per-wave deadline.
        timeout: Duration,
    },
}

impl Task {
    /// The action-group form of this task, reported in the `Init` event.
    #[must_use]
    pub fn action_group(&self) -> ActionGroup {
        match self {
            Self::InventoryUpsert(_) => ActionGroup {
                action: TaskAction::InventoryUpsert,
                ids: Vec::new(),
            },
            Self::ApplyWave { ids } => ActionGroup {
                action: TaskAction::Apply,
                ids: ids.clone(),
            },
            Self::WaitCurrent { ids, .. } => ActionGroup {
                action: TaskAction::WaitCurrent,
                ids: ids.clone(),
            },
            Self::PruneWave { ids } => ActionGroup {
                action: TaskAction::Prune,
                ids: ids.clone(),
            },
            Self::WaitGone { ids, .. } => ActionGroup {
                action: TaskAction::WaitGone,
                ids: ids.clone(),
            },
        }
    }
}

/// State threaded between tasks of one run.
///
/// Workers applying a wave in parallel record their outcomes here; later
/// tasks (dependency filters, inventory finalization) read them back.
#[derive(Debug)]
pub struct TaskContext {
    actuations: Mutex<HashMap<ObjectId, Actuation>>,
    reconciles: Mutex<HashMap<ObjectId, Reconcile>>,
    invalid: Mutex<HashSet<ObjectId>>,
    forgotten: Mutex<HashSet<ObjectId>>,
    applied: Mutex<HashMap<ObjectId, DynamicObject>>,
    errors: Mutex<MultiError>,
    events: mpsc::UnboundedSender<Event>,
}

impl TaskContext {
    /// Creates a context reporting events on the given channel.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            actuations: Mutex::new(HashMap::new()),
            reconciles: Mutex::new(HashMap::new()),
            invalid: Mutex::new(HashSet::new()),
            forgotten: Mutex::new(HashSet::new()),
            applied: Mutex::new(HashMap::new()),
            errors: Mutex::new(MultiError::new()),
            events,
        }
    }

    /// Emits a progress event. Dropped silently when nobody listens.
    pub fn send_event(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Records the actuation outcome for one object.
    pub fn set_actuation(&self, id: ObjectId, actuation: Actuation) {
        self.lock_actuations().insert(id, actuation);
    }

    /// The recorded actuation outcome for one object.
    #[must_use]
    pub fn actuation(&self, id: &ObjectId) -> Option<Actuation> {
        self.lock_actuations().get(id).copied()
    }

    /// Records the reconcile outcome for one object.
    pub fn set_reconcile(&self, id: ObjectId, reconcile: Reconcile) {
        self.reconciles
            .lock()
            .expect("task context lock poisoned")
            .insert(id, reconcile);
    }

    /// The recorded reconcile outcome for one object.
    #[must_use]
    pub fn reconcile(&self, id: &ObjectId) -> Option<Reconcile> {
        self.reconciles
            .lock()
            .expect("task context lock poisoned")
            .get(id)
            .copied()
    }

    /// Registers an invalid object: retained in the inventory but excluded
    /// from this run's mutations.
    pub fn mark_invalid(&self, id: ObjectId) {
        self.invalid.lock().expect("task context lock poisoned").insert(id);
    }

    /// Whether the object was registered invalid.
    #[must_use]
    pub fn is_invalid(&self, id: &ObjectId) -> bool {
        self.invalid.lock().expect("task context lock poisoned").contains(id)
    }

    /// Drops an object from the inventory at finalization (abandoned or
    /// owned by another sync).
    pub fn forget(&self, id: ObjectId) {
        self.forgotten.lock().expect("task context lock poisoned").insert(id);
    }

    /// Whether the object was dropped from the inventory.
    #[must_use]
    pub fn is_forgotten(&self, id: &ObjectId) -> bool {
        self.forgotten
            .lock()
            .expect("task context lock poisoned")
            .contains(id)
    }

    /// Caches the applied form of an object for apply-time mutation sources.
    pub fn record_applied(&self, obj: DynamicObject) {
        self.applied
            .lock()
            .expect("task context lock poisoned")
            .insert(obj.id(), obj);
    }

    /// The applied form of an object earlier in this run, if any.
    #[must_use]
    pub fn applied(&self, id: &ObjectId) -> Option<DynamicObject> {
        self.applied
            .lock()
            .expect("task context lock poisoned")
            .get(id)
            .map(DynamicObject::deep_copy)
    }

    /// Accumulates a non-fatal error.
    pub fn push_error(&self, err: SyncError) {
        self.errors.lock().expect("task context lock poisoned").push(err);
    }

    /// A copy of the accumulated error set.
    #[must_use]
    pub fn errors(&self) -> MultiError {
        self.errors.lock().expect("task context lock poisoned").clone()
    }

    fn lock_actuations(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectId, Actuation>> {
        self.actuations.lock().expect("task context lock poisoned")
    }
}
