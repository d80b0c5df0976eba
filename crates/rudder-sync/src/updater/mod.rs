//! Updater: the serialized cycle orchestrator.
//!
//! One cycle per trigger: pause the remediator, install the declared
//! snapshot, apply it, update the remediator watches, resume. Partial
//! progress is tracked per revision in the [`CommitCache`] so a transient
//! downstream error resumes where the previous cycle left off. Every
//! returned error set is prepended with the remediator's current conflict
//! and fight errors, so multi-reconciler conflicts stay visible even when
//! this sync's own cycle was clean.

mod cache;

pub use cache::CommitCache;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rudder_core::inventory::InventoryInfo;
use rudder_core::status::ErrorBuffer;
use rudder_core::{DeclaredResources, MultiError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::applier::Applier;
use crate::remediator::Remediator;

/// Serialized reconcile-cycle orchestrator for one sync.
pub struct Updater {
    resources: Arc<DeclaredResources>,
    remediator: Arc<Remediator>,
    applier: Arc<Applier>,
    inventory_info: InventoryInfo,
    cycle_lock: tokio::sync::Mutex<()>,
    updating: AtomicBool,
    validation_errors: ErrorBuffer,
}

impl Updater {
    /// Creates an updater over the store, remediator, and applier of one
    /// sync.
    #[must_use]
    pub fn new(
        resources: Arc<DeclaredResources>,
        remediator: Arc<Remediator>,
        applier: Arc<Applier>,
        inventory_info: InventoryInfo,
    ) -> Self {
        Self {
            resources,
            remediator,
            applier,
            inventory_info,
            cycle_lock: tokio::sync::Mutex::new(()),
            updating: AtomicBool::new(false),
            validation_errors: ErrorBuffer::new(),
        }
    }

    /// Whether a cycle is currently in flight. Safe to call at any time.
    #[must_use]
    pub fn updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    /// The latest known error set across subsystems: remediator conflicts
    /// and fights, store validation errors, and applier errors. Safe to call
    /// while a cycle is running.
    #[must_use]
    pub fn errors(&self) -> MultiError {
        let mut errors = MultiError::new();
        errors.extend(self.remediator.conflict_errors());
        errors.extend(self.remediator.fight_errors());
        errors.merge(self.validation_errors.get());
        errors.merge(self.applier.errors());
        errors
    }

    /// Runs one cycle against the cached source. `old_revision` is the
    /// revision the installed snapshot is being replaced from.
    ///
    /// Returns the cycle's error set, prepended with current remediator
    /// conflict and fight errors; empty means a fully clean cycle.
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        cache: &mut CommitCache,
        old_revision: &str,
    ) -> MultiError {
        let _guard = self.cycle_lock.lock().await;
        self.updating.store(true, Ordering::SeqCst);
        let result = self.update_inner(cancel, cache, old_revision).await;
        self.updating.store(false, Ordering::SeqCst);

        let mut errors = MultiError::new();
        errors.extend(self.remediator.conflict_errors());
        errors.extend(self.remediator.fight_errors());
        if let Err(cycle_errors) = result {
            errors.merge(cycle_errors);
        }
        errors
    }

    async fn update_inner(
        &self,
        cancel: &CancellationToken,
        cache: &mut CommitCache,
        old_revision: &str,
    ) -> Result<(), MultiError> {
        // Stop remediator workers so objects are not corrected against a
        // snapshot mid-replacement or applied in the wrong order. Watchers
        // keep enqueuing; queued objects are remediated on resume.
        self.remediator.pause();

        let (old_gvks, _) = self.resources.declared_gvks();

        // Install the snapshot: the source of truth for the remediator.
        // After this, objects removed from the declared set are no longer
        // remediated if they drift.
        if !cache.declared_resources_updated {
            debug!(revision = %cache.revision, "declared resources updating");
            match self
                .resources
                .update(cache.objects.clone(), &cache.revision, old_revision)
            {
                Ok(accepted) => {
                    self.validation_errors.clear();
                    debug!(declared = accepted.len(), "declared resources updated");
                }
                Err(err) => {
                    warn!(%err, "failed to validate declared resources");
                    self.validation_errors.set(err.clone().into());
                    return Err(err.into());
                }
            }
            if cache.parse_errors.is_empty() {
                cache.declared_resources_updated = true;
            }
        }

        // Apply the declared resources.
        if !cache.applied {
            let (objects, revision) = self.resources.declared_objects();
            let (new_gvks, _) = self.resources.declared_gvks();
            // Kinds leaving the declared set may still have prunes in
            // flight; keep their watchers alive until the apply completes.
            self.remediator
                .add_pending_prunes(old_gvks.difference(&new_gvks).cloned());

            debug!(revision = %revision, objects = objects.len(), "applier starting");
            let errors = self
                .applier
                .run(cancel, &self.inventory_info, objects, &revision)
                .await;
            if !errors.is_empty() {
                warn!(%errors, "failed to apply declared resources");
                return Err(errors);
            }
            self.remediator.clear_pending_prunes();
            if cache.parse_errors.is_empty() {
                cache.applied = true;
            }
        }

        // Update the watches: the triggers for the remediator.
        if !cache.watches_updated {
            let (gvks, revision) = self.resources.declared_gvks();
            debug!(gvks = gvks.len(), "remediator watches updating");
            self.remediator.update_watches(&gvks, &revision);
            if cache.parse_errors.is_empty() {
                cache.watches_updated = true;
            }
        }

        // Resume only after declare, apply, and watch update all succeeded;
        // otherwise objects could be corrected in the wrong order.
        self.remediator.resume();
        Ok(())
    }
}
