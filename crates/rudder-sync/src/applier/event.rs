//! Typed events emitted while an apply run executes.
//!
//! Every run reports progress on a public channel: one `Init` event naming
//! the planned action groups, then per-object `Apply`/`Prune`/`Status`/`Wait`
//! events as the task queue drains, `Validation` events under the
//! skip-invalid policy, and `Error` events for run-level failures.

use std::fmt;

use rudder_core::{ObjectId, SyncError};

/// The kind of work a task performs, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// Persist the intended or observed inventory.
    InventoryUpsert,
    /// Apply one wave of objects.
    Apply,
    /// Wait for an applied wave to become current.
    WaitCurrent,
    /// Prune one wave of objects.
    Prune,
    /// Wait for a pruned wave to be gone.
    WaitGone,
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InventoryUpsert => "inventory",
            Self::Apply => "apply",
            Self::WaitCurrent => "wait-current",
            Self::Prune => "prune",
            Self::WaitGone => "wait-gone",
        };
        write!(f, "{name}")
    }
}

/// One planned task and the objects it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionGroup {
    /// What the task does.
    pub action: TaskAction,
    /// Objects the task covers, in execution order.
    pub ids: Vec<ObjectId>,
}

/// Outcome of applying one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The object did not exist and was created.
    Created,
    /// The live object was updated to the declared form.
    Configured,
    /// The live object already matched the declared form.
    Unchanged,
    /// A filter excluded the object this cycle.
    Skipped,
    /// The apply failed.
    Failed,
}

/// Outcome of pruning one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOutcome {
    /// The object was deleted, or was already gone.
    Pruned,
    /// A filter excluded the object from pruning.
    Skipped,
    /// The delete failed.
    Failed,
}

/// Outcome of one object inside a wait task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The object reconciled to its declared form.
    Reconciled,
    /// The object is fully gone.
    Gone,
    /// The wait deadline passed first.
    TimedOut,
}

/// One progress event from an apply run.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// The run was planned; lists every task and the objects it covers.
    Init {
        /// Planned tasks in execution order.
        action_groups: Vec<ActionGroup>,
    },

    /// One object finished its apply step.
    Apply {
        /// The applied object.
        id: ObjectId,
        /// How the apply ended.
        outcome: ApplyOutcome,
        /// Skip reason, when a filter excluded the object.
        reason: Option<String>,
        /// Failure detail, when the apply failed.
        error: Option<SyncError>,
    },

    /// One object finished its prune step.
    Prune {
        /// The pruned object.
        id: ObjectId,
        /// How the prune ended.
        outcome: PruneOutcome,
        /// Skip reason, when a filter excluded the object.
        reason: Option<String>,
        /// Failure detail, when the delete failed.
        error: Option<SyncError>,
    },

    /// A watched object settled while a wait task was running.
    Status {
        /// The observed object.
        id: ObjectId,
        /// Whether the object is current (`true`) or gone (`false`).
        current: bool,
    },

    /// One object finished its wait step.
    Wait {
        /// The awaited object.
        id: ObjectId,
        /// How the wait ended.
        outcome: WaitOutcome,
    },

    /// Objects were rejected by validation under the skip-invalid policy.
    Validation {
        /// The invalid objects, when known.
        ids: Vec<ObjectId>,
        /// The rejection.
        error: SyncError,
    },

    /// A run-level failure; the cycle aborts.
    Error {
        /// The failure.
        error: SyncError,
    },
}
