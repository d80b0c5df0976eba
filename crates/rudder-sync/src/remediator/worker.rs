//! Remediation workers.
//!
//! A pool of workers dequeues observed object IDs and corrects each one
//! against the declared-resource store: re-apply the declared form on drift,
//! delete owned objects that are no longer declared, and report management
//! conflicts without ever overwriting another sync's objects.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use rudder_core::cluster::{ClusterError, DynamicClient};
use rudder_core::{metadata, DeclaredResources, DynamicObject, ObjectId, SyncError, SyncTarget};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::fight::FightDetector;
use super::queue::WorkQueue;

/// State shared by the remediator facade, its watchers, and its workers.
pub(super) struct RemediatorShared {
    pub(super) store: Arc<DeclaredResources>,
    pub(super) cluster: Arc<dyn DynamicClient>,
    pub(super) queue: Arc<WorkQueue>,
    pub(super) target: SyncTarget,
    pub(super) inventory_id: String,
    pub(super) conflicts: Mutex<IndexMap<ObjectId, SyncError>>,
    pub(super) fights: FightDetector,
}

impl RemediatorShared {
    pub(super) fn conflict_errors(&self) -> Vec<SyncError> {
        self.conflicts
            .lock()
            .expect("remediator lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn record_conflict(&self, id: ObjectId, current_manager: String) {
        let err = SyncError::ManagementConflict {
            id: id.clone(),
            current_manager,
            other_manager: self.target.manager(),
        };
        debug!(%id, %err, "remediator observed a management conflict");
        self.conflicts
            .lock()
            .expect("remediator lock poisoned")
            .insert(id, err);
    }

    fn clear_conflict(&self, id: &ObjectId) {
        self.conflicts
            .lock()
            .expect("remediator lock poisoned")
            .shift_remove(id);
    }

    /// Whether a live object belongs to a different sync: its manager label
    /// or inventory-ID annotation names someone else. Unlabeled objects are
    /// not foreign; their metadata was stripped and drift correction will
    /// restore it.
    fn foreign_manager(&self, live: &DynamicObject) -> Option<String> {
        if let Some(manager) = metadata::manager_of(live) {
            if manager != self.target.manager() {
                return Some(manager.to_string());
            }
        }
        if let Some(inventory_id) = metadata::inventory_id_of(live) {
            if inventory_id != self.inventory_id {
                return Some(
                    metadata::manager_of(live)
                        .unwrap_or("<unknown manager>")
                        .to_string(),
                );
            }
        }
        None
    }

    fn owned(&self, live: &DynamicObject) -> bool {
        metadata::manager_of(live) == Some(self.target.manager().as_str())
            && metadata::inventory_id_of(live) == Some(self.inventory_id.as_str())
    }
}

/// One worker: dequeue IDs while running, remediate each.
pub(super) async fn worker_loop(
    shared: Arc<RemediatorShared>,
    mut paused: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    loop {
        // While paused, watchers keep enqueuing but nothing is dequeued.
        while *paused.borrow() {
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        let id = tokio::select! {
            () = cancel.cancelled() => return,
            id = shared.queue.take() => id,
            changed = paused.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        };
        remediate(&shared, id).await;
    }
}

/// Corrects one object toward the current snapshot.
pub(super) async fn remediate(shared: &RemediatorShared, id: ObjectId) {
    let declared = shared.store.get(&id);
    let live = match shared.cluster.get(&id).await {
        Ok(live) => live,
        Err(err) => {
            warn!(%id, %err, "remediator failed to read live object");
            return;
        }
    };

    match (declared, live) {
        (None, None) => {}
        (Some((declared, revision)), None) => {
            // A managed object was deleted out from under the sync.
            apply_declared(shared, &id, declared, &revision, None).await;
        }
        (None, Some(live)) => {
            if shared.owned(&live) {
                debug!(%id, "deleting undeclared managed object");
                match shared.cluster.delete(&id).await {
                    Ok(()) | Err(ClusterError::NotFound { .. }) => {
                        shared.clear_conflict(&id);
                    }
                    Err(err) => warn!(%id, %err, "remediator delete failed"),
                }
            }
        }
        (Some((declared, revision)), Some(live)) => {
            if let Some(current_manager) = shared.foreign_manager(&live) {
                shared.record_conflict(id, current_manager);
                return;
            }
            let mut stamped = declared;
            metadata::stamp_management_metadata(
                &mut stamped,
                &shared.target.manager(),
                &shared.inventory_id,
                &revision,
            );
            if stamped.drifts_from(&live) {
                apply_declared(shared, &id, stamped, &revision, Some(&live)).await;
            } else {
                shared.clear_conflict(&id);
            }
        }
    }
}

async fn apply_declared(
    shared: &RemediatorShared,
    id: &ObjectId,
    mut declared: DynamicObject,
    revision: &str,
    live: Option<&DynamicObject>,
) {
    metadata::stamp_management_metadata(
        &mut declared,
        &shared.target.manager(),
        &shared.inventory_id,
        revision,
    );
    match shared.cluster.apply(&declared).await {
        Ok(_) => {
            debug!(%id, revision, "remediated drifted object");
            shared.clear_conflict(id);
            if let Some(fight) = shared.fights.record_correction(id) {
                warn!(%id, %fight, "resource fight detected");
            }
        }
        Err(
            ClusterError::Denied { .. }
            | ClusterError::Conflict { .. }
            | ClusterError::AlreadyExists { .. },
        ) => {
            let current = live
                .and_then(metadata::manager_of)
                .unwrap_or("<unknown manager>")
                .to_string();
            shared.record_conflict(id.clone(), current);
        }
        Err(err) => warn!(%id, %err, "remediator apply failed"),
    }
}
