//! Task execution.
//!
//! The [`TaskStatusRunner`] drains the task queue sequentially, interleaving
//! mutation tasks with status waits. Within one wave, independent objects are
//! applied or pruned in parallel, bounded by a semaphore. Cancellation aborts
//! any in-flight wait; results of in-flight API calls are discarded.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use indexmap::IndexMap;
use rudder_core::cluster::{ClusterError, DynamicClient, StatusReader};
use rudder_core::inventory::{Actuation, Inventory, InventoryClient, ObjectRecord, Reconcile};
use rudder_core::{metadata, DynamicObject, ObjectId, SyncError};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::event::{ApplyOutcome, Event, PruneOutcome, WaitOutcome};
use super::filter::{ApplyFilter, FilterResult, PruneFilter, SkipDisposition};
use super::mutator::ApplyTimeMutator;
use super::task::{InventoryPhase, Task, TaskContext};

/// Executes the ordered task queue of one apply run.
pub struct TaskStatusRunner {
    /// Cluster client for mutations and live reads.
    pub cluster: Arc<dyn DynamicClient>,
    /// Status seam for wait tasks.
    pub status: Arc<dyn StatusReader>,
    /// Apply-time mutation resolver.
    pub mutator: ApplyTimeMutator,
    /// Filters run before each apply.
    pub apply_filters: Vec<Box<dyn ApplyFilter>>,
    /// Filters run before each prune.
    pub prune_filters: Vec<Box<dyn PruneFilter>>,
    /// Desired objects, stamped with management metadata.
    pub desired: IndexMap<ObjectId, DynamicObject>,
    /// Inventory being advanced by this run; starts as the previous record.
    pub inventory: Mutex<Inventory>,
    /// Client persisting the inventory.
    pub inv_client: InventoryClient,
    /// This sync's manager string.
    pub manager: String,
    /// Source revision being applied.
    pub revision: String,
    /// Poll interval for status waits.
    pub poll_interval: Duration,
    /// Validate and report without mutating the cluster.
    pub dry_run: bool,
    /// Maximum concurrent mutations within one wave.
    pub parallelism: usize,
}

impl TaskStatusRunner {
    /// Runs the queue to completion.
    ///
    /// Per-object failures become events and context errors; only
    /// cancellation and inventory persistence failures are fatal.
    ///
    /// # Errors
    ///
    /// `SyncError::Internal` on cancellation or when the inventory cannot be
    /// persisted.
    pub async fn run(
        self: Arc<Self>,
        cancel: &CancellationToken,
        tasks: Vec<Task>,
        ctx: &Arc<TaskContext>,
    ) -> Result<(), SyncError> {
        for task in tasks {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            match task {
                Task::InventoryUpsert(phase) => self.inventory_upsert(phase, ctx).await?,
                Task::ApplyWave { ids } => Self::apply_wave(&self, cancel, &ids, ctx).await,
                Task::WaitCurrent { ids, timeout } => {
                    self.wait_current(cancel, &ids, timeout, ctx).await?;
                }
                Task::PruneWave { ids } => Self::prune_wave(&self, cancel, &ids, ctx).await,
                Task::WaitGone { ids, timeout } => {
                    self.wait_gone(cancel, &ids, timeout, ctx).await?;
                }
            }
        }
        Ok(())
    }

    /// The inventory as advanced by this run.
    #[must_use]
    pub fn final_inventory(&self) -> Inventory {
        self.inventory.lock().expect("runner inventory lock poisoned").clone()
    }

    async fn inventory_upsert(
        &self,
        phase: InventoryPhase,
        ctx: &TaskContext,
    ) -> Result<(), SyncError> {
        let updated = {
            let mut inventory = self.inventory.lock().expect("runner inventory lock poisoned");
            match phase {
                InventoryPhase::Pre => {
                    // Record intent before any mutation, so a crash leaves a
                    // superset of what might have been touched.
                    for id in self.desired.keys() {
                        if !inventory.contains(id) {
                            inventory.set_record(
                                id.clone(),
                                ObjectRecord {
                                    actuation: Actuation::Pending,
                                    reconcile: Reconcile::Pending,
                                    revision: self.revision.clone(),
                                },
                            );
                        }
                    }
                }
                InventoryPhase::Post => {
                    let previous = inventory.clone();
                    let mut next = Inventory::empty(previous.info.clone());
                    for id in self.desired.keys() {
                        let actuation = ctx.actuation(id).unwrap_or(Actuation::Pending);
                        let reconcile = ctx.reconcile(id).unwrap_or(match actuation {
                            Actuation::Skipped => Reconcile::Unknown,
                            _ => Reconcile::Pending,
                        });
                        let revision = if actuation == Actuation::Succeeded {
                            self.revision.clone()
                        } else {
                            previous
                                .record(id)
                                .map_or_else(|| self.revision.clone(), |rec| rec.revision.clone())
                        };
                        next.set_record(
                            id.clone(),
                            ObjectRecord {
                                actuation,
                                reconcile,
                                revision,
                            },
                        );
                    }
                    for (id, record) in &previous.objects {
                        if self.desired.contains_key(id) || ctx.is_forgotten(id) {
                            continue;
                        }
                        // Pruned objects drop out; everything else (skipped,
                        // failed, invalid, unattempted) is retained.
                        if ctx.actuation(id) == Some(Actuation::Succeeded) {
                            continue;
                        }
                        next.set_record(id.clone(), record.clone());
                    }
                    *inventory = next;
                }
            }
            inventory.clone()
        };

        if self.dry_run {
            debug!(phase = ?phase, "dry run: skipping inventory persistence");
            return Ok(());
        }
        self.inv_client.replace(&updated).await
    }

    async fn apply_wave(
        this: &Arc<Self>,
        cancel: &CancellationToken,
        ids: &[ObjectId],
        ctx: &Arc<TaskContext>,
    ) {
        let semaphore = Arc::new(Semaphore::new(this.parallelism.max(1)));
        let mut join_set = JoinSet::new();
        for id in ids {
            let Some(obj) = this.desired.get(id).map(DynamicObject::deep_copy) else {
                continue;
            };
            if ctx.is_invalid(id) {
                continue;
            }
            let this = Arc::clone(this);
            let ctx = Arc::clone(ctx);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                if cancel.is_cancelled() {
                    return;
                }
                this.apply_one(obj, &ctx).await;
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    async fn apply_one(&self, mut obj: DynamicObject, ctx: &TaskContext) {
        let id = obj.id();

        let live = match self.cluster.get(&id).await {
            Ok(live) => live,
            Err(err) => {
                self.fail_apply(
                    ctx,
                    id.clone(),
                    SyncError::Apply {
                        id,
                        message: format!("reading live object: {err}"),
                    },
                );
                return;
            }
        };

        for filter in &self.apply_filters {
            match filter.filter(&obj, live.as_ref(), ctx) {
                FilterResult::Allow => {}
                FilterResult::Skip { reason, .. } => {
                    debug!(%id, filter = filter.name(), reason, "apply skipped");
                    ctx.set_actuation(id.clone(), Actuation::Skipped);
                    ctx.send_event(Event::Apply {
                        id,
                        outcome: ApplyOutcome::Skipped,
                        reason: Some(reason),
                        error: None,
                    });
                    return;
                }
                FilterResult::Fail { error } => {
                    debug!(%id, filter = filter.name(), %error, "apply rejected");
                    self.fail_apply(ctx, id, error);
                    return;
                }
            }
        }

        if let Err(err) = self.mutator.mutate(&mut obj, ctx).await {
            self.fail_apply(ctx, id, err);
            return;
        }

        let outcome = match &live {
            None => ApplyOutcome::Created,
            Some(live) if obj.drifts_from(live) => ApplyOutcome::Configured,
            Some(_) => ApplyOutcome::Unchanged,
        };

        let applied = if self.dry_run {
            obj
        } else {
            match self.cluster.apply(&obj).await {
                Ok(applied) => applied,
                Err(err) => {
                    let error = self.classify_apply_error(&id, live.as_ref(), err);
                    self.fail_apply(ctx, id, error);
                    return;
                }
            }
        };

        ctx.record_applied(applied);
        ctx.set_actuation(id.clone(), Actuation::Succeeded);
        ctx.send_event(Event::Apply {
            id,
            outcome,
            reason: None,
            error: None,
        });
    }

    fn classify_apply_error(
        &self,
        id: &ObjectId,
        live: Option<&DynamicObject>,
        err: ClusterError,
    ) -> SyncError {
        match err {
            ClusterError::Denied { .. }
            | ClusterError::Conflict { .. }
            | ClusterError::AlreadyExists { .. } => SyncError::ManagementConflict {
                id: id.clone(),
                current_manager: live
                    .and_then(metadata::manager_of)
                    .unwrap_or("<unknown>")
                    .to_string(),
                other_manager: self.manager.clone(),
            },
            other => SyncError::Apply {
                id: id.clone(),
                message: other.to_string(),
            },
        }
    }

    fn fail_apply(&self, ctx: &TaskContext, id: ObjectId, error: SyncError) {
        ctx.set_actuation(id.clone(), Actuation::Failed);
        ctx.push_error(error.clone());
        ctx.send_event(Event::Apply {
            id,
            outcome: ApplyOutcome::Failed,
            reason: None,
            error: Some(error),
        });
    }

    async fn prune_wave(
        this: &Arc<Self>,
        cancel: &CancellationToken,
        ids: &[ObjectId],
        ctx: &Arc<TaskContext>,
    ) {
        let semaphore = Arc::new(Semaphore::new(this.parallelism.max(1)));
        let mut join_set = JoinSet::new();
        for id in ids {
            if ctx.is_invalid(id) {
                continue;
            }
            let id = id.clone();
            let this = Arc::clone(this);
            let ctx = Arc::clone(ctx);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                if cancel.is_cancelled() {
                    return;
                }
                this.prune_one(id, &ctx).await;
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    async fn prune_one(&self, id: ObjectId, ctx: &TaskContext) {
        let live = match self.cluster.get(&id).await {
            Ok(Some(live)) => live,
            Ok(None) => {
                ctx.set_actuation(id.clone(), Actuation::Succeeded);
                ctx.send_event(Event::Prune {
                    id,
                    outcome: PruneOutcome::Pruned,
                    reason: Some("object already gone".to_string()),
                    error: None,
                });
                return;
            }
            Err(err) => {
                self.fail_prune(
                    ctx,
                    id.clone(),
                    SyncError::Prune {
                        id,
                        message: format!("reading live object: {err}"),
                    },
                );
                return;
            }
        };

        for filter in &self.prune_filters {
            match filter.filter(&live, ctx) {
                FilterResult::Allow => {}
                FilterResult::Skip { reason, disposition } => {
                    debug!(%id, filter = filter.name(), reason, "skipped delete");
                    ctx.set_actuation(id.clone(), Actuation::Skipped);
                    match disposition {
                        SkipDisposition::Retain => {}
                        SkipDisposition::Forget => ctx.forget(id.clone()),
                        SkipDisposition::Detach => {
                            ctx.forget(id.clone());
                            if !self.dry_run {
                                let mut detached = live.deep_copy();
                                metadata::strip_management_metadata(&mut detached);
                                if let Err(err) = self.cluster.apply(&detached).await {
                                    warn!(%id, %err, "failed to strip management metadata");
                                }
                            }
                        }
                    }
                    ctx.send_event(Event::Prune {
                        id,
                        outcome: PruneOutcome::Skipped,
                        reason: Some(reason),
                        error: None,
                    });
                    return;
                }
                FilterResult::Fail { error } => {
                    self.fail_prune(ctx, id, error);
                    return;
                }
            }
        }

        if !self.dry_run {
            match self.cluster.delete(&id).await {
                Ok(()) | Err(ClusterError::NotFound { .. }) => {}
                Err(err) => {
                    self.fail_prune(
                        ctx,
                        id.clone(),
                        SyncError::Prune {
                            id,
                            message: err.to_string(),
                        },
                    );
                    return;
                }
            }
        }

        ctx.set_actuation(id.clone(), Actuation::Succeeded);
        ctx.send_event(Event::Prune {
            id,
            outcome: PruneOutcome::Pruned,
            reason: None,
            error: None,
        });
    }

    fn fail_prune(&self, ctx: &TaskContext, id: ObjectId, error: SyncError) {
        ctx.set_actuation(id.clone(), Actuation::Failed);
        ctx.push_error(error.clone());
        ctx.send_event(Event::Prune {
            id,
            outcome: PruneOutcome::Failed,
            reason: None,
            error: Some(error),
        });
    }

    async fn wait_current(
        &self,
        cancel: &CancellationToken,
        ids: &[ObjectId],
        timeout: Duration,
        ctx: &TaskContext,
    ) -> Result<(), SyncError> {
        let mut remaining: Vec<ObjectId> = ids
            .iter()
            .filter(|id| ctx.actuation(id) == Some(Actuation::Succeeded))
            .cloned()
            .collect();

        if self.dry_run {
            for id in remaining {
                ctx.set_reconcile(id.clone(), Reconcile::Current);
                ctx.send_event(Event::Wait {
                    id,
                    outcome: WaitOutcome::Reconciled,
                });
            }
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut still_waiting = Vec::new();
            for id in remaining {
                match self.status.is_current(&id).await {
                    Ok(true) => {
                        ctx.set_reconcile(id.clone(), Reconcile::Current);
                        ctx.send_event(Event::Status {
                            id: id.clone(),
                            current: true,
                        });
                        ctx.send_event(Event::Wait {
                            id,
                            outcome: WaitOutcome::Reconciled,
                        });
                    }
                    Ok(false) => still_waiting.push(id),
                    Err(err) => {
                        ctx.set_reconcile(id.clone(), Reconcile::Unknown);
                        ctx.push_error(SyncError::Apply {
                            id: id.clone(),
                            message: format!("reading reconcile status: {err}"),
                        });
                        ctx.send_event(Event::Wait {
                            id,
                            outcome: WaitOutcome::TimedOut,
                        });
                    }
                }
            }
            remaining = still_waiting;
            if remaining.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                for id in remaining {
                    ctx.set_reconcile(id.clone(), Reconcile::Pending);
                    ctx.push_error(SyncError::Apply {
                        id: id.clone(),
                        message: format!("timed out waiting for reconciliation after {timeout:?}"),
                    });
                    ctx.send_event(Event::Wait {
                        id,
                        outcome: WaitOutcome::TimedOut,
                    });
                }
                return Ok(());
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(cancelled()),
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn wait_gone(
        &self,
        cancel: &CancellationToken,
        ids: &[ObjectId],
        timeout: Duration,
        ctx: &TaskContext,
    ) -> Result<(), SyncError> {
        let mut remaining: Vec<ObjectId> = ids
            .iter()
            .filter(|id| ctx.actuation(id) == Some(Actuation::Succeeded))
            .cloned()
            .collect();

        if self.dry_run {
            for id in remaining {
                ctx.send_event(Event::Wait {
                    id,
                    outcome: WaitOutcome::Gone,
                });
            }
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut still_waiting = Vec::new();
            for id in remaining {
                match self.status.is_gone(&id).await {
                    Ok(true) => {
                        ctx.send_event(Event::Status {
                            id: id.clone(),
                            current: false,
                        });
                        ctx.send_event(Event::Wait {
                            id,
                            outcome: WaitOutcome::Gone,
                        });
                    }
                    Ok(false) => still_waiting.push(id),
                    Err(err) => {
                        ctx.push_error(SyncError::Prune {
                            id: id.clone(),
                            message: format!("reading deletion status: {err}"),
                        });
                        ctx.send_event(Event::Wait {
                            id,
                            outcome: WaitOutcome::TimedOut,
                        });
                    }
                }
            }
            remaining = still_waiting;
            if remaining.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                for id in remaining {
                    ctx.push_error(SyncError::Prune {
                        id: id.clone(),
                        message: format!("timed out waiting for deletion after {timeout:?}"),
                    });
                    ctx.send_event(Event::Wait {
                        id,
                        outcome: WaitOutcome::TimedOut,
                    });
                }
                return Ok(());
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(cancelled()),
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

fn cancelled() -> SyncError {
    SyncError::Internal {
        message: "cycle cancelled".to_string(),
    }
}
