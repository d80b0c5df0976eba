//! Applier: ordered, dependency-aware apply/prune execution.
//!
//! Given the desired object set and the inventory of previously owned
//! objects, a run builds an ordered queue of tasks that advances the cluster
//! toward the desired state: validate, record intent in the inventory, apply
//! in topological waves with status waits, prune the no-longer-desired set in
//! reverse order, finalize the inventory. Progress is reported as typed
//! [`Event`]s; per-object failures accumulate and never abort the run.

mod event;
mod filter;
mod graph;
mod mutator;
mod runner;
mod solver;
mod task;
mod validate;

pub use event::{ActionGroup, ApplyOutcome, Event, PruneOutcome, TaskAction, WaitOutcome};
pub use filter::{
    ApplyFilter, DependencyApplyFilter, DependencyPruneFilter, FilterResult,
    InventoryPolicyApplyFilter, InventoryPolicyPruneFilter, LocalNamespacesFilter,
    PreventRemoveFilter, PruneFilter, SkipDisposition,
};
pub use graph::DependencyGraph;
pub use mutator::ApplyTimeMutator;
pub use runner::TaskStatusRunner;
pub use solver::TaskQueueBuilder;
pub use task::{InventoryPhase, Task, TaskContext};
pub use validate::{validate, ValidationCollector};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use rudder_core::cluster::{BlindStatusReader, DynamicClient, StatusReader};
use rudder_core::config::{AdoptionPolicy, NamespaceStrategy, SyncConfig, ValidationPolicy};
use rudder_core::inventory::{Inventory, InventoryClient, InventoryInfo};
use rudder_core::object::Gvk;
use rudder_core::status::ErrorBuffer;
use rudder_core::{metadata, DynamicObject, MultiError, ObjectId, SyncError, SyncTarget};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Options governing one apply run.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Per-wave deadline for current-status waits.
    pub reconcile_timeout: Duration,
    /// Per-wave deadline for gone-status waits.
    pub prune_timeout: Duration,
    /// Poll interval for status waits.
    pub status_poll_interval: Duration,
    /// Maximum concurrent mutations within one wave.
    pub apply_parallelism: usize,
    /// Adoption policy for pre-existing live objects.
    pub adoption_policy: AdoptionPolicy,
    /// Handling of invalid declared objects.
    pub validation_policy: ValidationPolicy,
    /// Namespace creation strategy.
    pub namespace_strategy: NamespaceStrategy,
    /// Validate and report without mutating the cluster.
    pub dry_run: bool,
}

impl ApplyOptions {
    /// Extracts the applier options from the engine configuration.
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            reconcile_timeout: config.reconcile_timeout,
            prune_timeout: config.prune_timeout,
            status_poll_interval: config.status_poll_interval,
            apply_parallelism: config.apply_parallelism,
            adoption_policy: config.adoption_policy,
            validation_policy: config.validation_policy,
            namespace_strategy: config.namespace_strategy,
            dry_run: config.dry_run,
        }
    }
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Bulk client applying a desired object set and tracking it in the
/// inventory.
pub struct Applier {
    cluster: Arc<dyn DynamicClient>,
    status: Arc<dyn StatusReader>,
    inv_client: InventoryClient,
    target: SyncTarget,
    options: ApplyOptions,
    errors: ErrorBuffer,
    events: mpsc::UnboundedSender<Event>,
}

impl Applier {
    /// Creates an applier. The returned receiver carries the typed event
    /// stream of every run; dropping it discards events.
    #[must_use]
    pub fn new(
        cluster: Arc<dyn DynamicClient>,
        status: Arc<dyn StatusReader>,
        target: SyncTarget,
        options: ApplyOptions,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                inv_client: InventoryClient::new(Arc::clone(&cluster)),
                cluster,
                status,
                target,
                options,
                errors: ErrorBuffer::new(),
                events,
            },
            events_rx,
        )
    }

    /// The latest known error set from this applier. Safe to call while a
    /// run is in flight.
    #[must_use]
    pub fn errors(&self) -> MultiError {
        self.errors.get()
    }

    /// A destroyer sharing this applier's clients and event channel.
    #[must_use]
    pub fn destroyer(&self) -> Destroyer {
        Destroyer {
            cluster: Arc::clone(&self.cluster),
            status: Arc::clone(&self.status),
            inv_client: self.inv_client.clone(),
            options: self.options.clone(),
            events: self.events.clone(),
        }
    }

    /// Runs one apply cycle: validate, apply the desired set in dependency
    /// waves, prune everything the inventory owns that is no longer desired,
    /// and finalize the inventory.
    ///
    /// Returns the accumulated error set; empty means a clean run.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        info: &InventoryInfo,
        objects: Vec<DynamicObject>,
        revision: &str,
    ) -> MultiError {
        let started = std::time::Instant::now();
        let ctx = Arc::new(TaskContext::new(self.events.clone()));
        let mut run_errors = MultiError::new();

        // Validate before anything mutates.
        let mut collector = ValidationCollector::new();
        validate(&objects, &self.target, &mut collector);

        let inventory = match self.load_inventory(info).await {
            Ok(inventory) => inventory,
            Err(err) => return self.finish_fatal(&ctx, run_errors, err),
        };

        let mut active = objects;
        if !collector.is_empty() {
            match self.options.validation_policy {
                ValidationPolicy::ExitEarly => {
                    for err in collector.errors() {
                        ctx.send_event(Event::Error { error: err.clone() });
                        run_errors.push(err.clone());
                    }
                    self.errors.set(run_errors.clone());
                    return run_errors;
                }
                ValidationPolicy::SkipInvalid => {
                    for err in collector.errors() {
                        if let SyncError::Validation { ids, .. } = err {
                            ctx.send_event(Event::Validation {
                                ids: ids.clone(),
                                error: err.clone(),
                            });
                        }
                        run_errors.push(err.clone());
                    }
                    for id in collector.invalid_ids() {
                        ctx.mark_invalid(id.clone());
                    }
                    active.retain(|obj| !ctx.is_invalid(&obj.id()));
                }
            }
        }

        if let Err(err) = self.add_implicit_namespaces(&mut active).await {
            return self.finish_fatal(&ctx, run_errors, err);
        }

        // Partition the desired set into dependency waves. A cycle is a
        // validation error at queue-build time.
        let mut graph = DependencyGraph::build(&active);
        let apply_waves = match graph.sorted_waves() {
            Ok(waves) => waves,
            Err(err) => match self.options.validation_policy {
                ValidationPolicy::ExitEarly => {
                    return self.finish_fatal(&ctx, run_errors, err);
                }
                ValidationPolicy::SkipInvalid => {
                    if let SyncError::Validation { ids, .. } = &err {
                        for id in ids {
                            ctx.mark_invalid(id.clone());
                        }
                        ctx.send_event(Event::Validation {
                            ids: ids.clone(),
                            error: err.clone(),
                        });
                    }
                    run_errors.push(err);
                    active.retain(|obj| !ctx.is_invalid(&obj.id()));
                    graph = DependencyGraph::build(&active);
                    graph.sorted_waves().unwrap_or_default()
                }
            },
        };

        // Stamp management metadata and fix the desired set.
        let manager = self.target.manager();
        let mut desired: IndexMap<ObjectId, DynamicObject> = IndexMap::new();
        for mut obj in active {
            metadata::stamp_management_metadata(&mut obj, &manager, &info.id, revision);
            desired.insert(obj.id(), obj);
        }

        // Prune candidates: previously owned, no longer desired.
        let prune_ids: Vec<ObjectId> = inventory
            .ids()
            .into_iter()
            .filter(|id| !desired.contains_key(id) && *id != info.object_id())
            .collect();
        let (prune_waves, prune_graph) =
            plan_prune_waves(&self.cluster, &prune_ids, &ctx).await;

        // Declared objects still depending on a prune candidate block its
        // removal.
        let mut declared_dependents: HashMap<ObjectId, Vec<ObjectId>> = HashMap::new();
        for (id, obj) in &desired {
            for dep in metadata::depends_on(obj).unwrap_or_default() {
                if prune_ids.contains(&dep) {
                    declared_dependents.entry(dep).or_default().push(id.clone());
                }
            }
        }

        let mut local_namespaces: HashSet<String> = desired
            .values()
            .map(|obj| obj.namespace().to_string())
            .filter(|ns| !ns.is_empty())
            .collect();
        if !info.namespace.is_empty() {
            local_namespaces.insert(info.namespace.clone());
        }

        let apply_filters: Vec<Box<dyn ApplyFilter>> = vec![
            Box::new(InventoryPolicyApplyFilter {
                policy: self.options.adoption_policy,
                inventory_id: info.id.clone(),
                manager: manager.clone(),
            }),
            Box::new(DependencyApplyFilter {
                deps: graph.dependency_map(),
            }),
        ];
        let prune_filters: Vec<Box<dyn PruneFilter>> = vec![
            Box::new(LocalNamespacesFilter {
                namespaces: local_namespaces,
            }),
            Box::new(PreventRemoveFilter),
            Box::new(InventoryPolicyPruneFilter {
                policy: self.options.adoption_policy,
                inventory_id: info.id.clone(),
            }),
            Box::new(DependencyPruneFilter {
                declared_dependents,
                prune_dependents: prune_graph.dependents_map(),
            }),
        ];

        let status: Arc<dyn StatusReader> = if self.options.dry_run {
            Arc::new(BlindStatusReader)
        } else {
            Arc::clone(&self.status)
        };
        let runner = Arc::new(TaskStatusRunner {
            cluster: Arc::clone(&self.cluster),
            status,
            mutator: ApplyTimeMutator::new(Arc::clone(&self.cluster)),
            apply_filters,
            prune_filters,
            desired,
            inventory: Mutex::new(inventory),
            inv_client: self.inv_client.clone(),
            manager,
            revision: revision.to_string(),
            poll_interval: self.options.status_poll_interval,
            dry_run: self.options.dry_run,
            parallelism: self.options.apply_parallelism,
        });

        let builder = TaskQueueBuilder {
            reconcile_timeout: self.options.reconcile_timeout,
            prune_timeout: self.options.prune_timeout,
        };
        let tasks = builder.build(&apply_waves, &prune_waves);
        ctx.send_event(Event::Init {
            action_groups: tasks.iter().map(Task::action_group).collect(),
        });

        if let Err(err) = Arc::clone(&runner).run(cancel, tasks, &ctx).await {
            ctx.send_event(Event::Error { error: err.clone() });
            run_errors.push(err);
        }
        run_errors.merge(ctx.errors());

        debug!(
            revision,
            elapsed_ms = started.elapsed().as_millis() as u64,
            errors = run_errors.len(),
            "apply run finished"
        );
        self.errors.set(run_errors.clone());
        run_errors
    }

    async fn load_inventory(&self, info: &InventoryInfo) -> Result<Inventory, SyncError> {
        let inventory = self.inv_client.get_or_create(info).await?;
        if inventory.info.id != info.id {
            return Err(SyncError::Internal {
                message: format!(
                    "expected inventory object to have inventory-id {:?} but got {:?}",
                    info.id, inventory.info.id
                ),
            });
        }
        Ok(inventory)
    }

    /// Root syncs under the implicit strategy synthesize missing namespaces
    /// of declared objects, marked so they are never deleted by pruning.
    async fn add_implicit_namespaces(
        &self,
        objects: &mut Vec<DynamicObject>,
    ) -> Result<(), SyncError> {
        if !self.target.scope.is_root()
            || self.options.namespace_strategy != NamespaceStrategy::Implicit
        {
            return Ok(());
        }
        let declared: HashSet<String> = objects
            .iter()
            .filter(|obj| obj.is_namespace())
            .map(|obj| obj.name().to_string())
            .collect();
        let mut needed: Vec<String> = Vec::new();
        for obj in objects.iter() {
            let ns = obj.namespace();
            if !ns.is_empty() && !declared.contains(ns) && !needed.iter().any(|n| n == ns) {
                needed.push(ns.to_string());
            }
        }
        for ns in needed {
            let ns_id = ObjectId::new("", "Namespace", "", ns.clone());
            let live = self.cluster.get(&ns_id).await.map_err(|err| SyncError::Internal {
                message: format!("checking namespace {ns}: {err}"),
            })?;
            if live.is_some() {
                continue;
            }
            debug!(namespace = %ns, "declaring implicit namespace");
            let mut ns_obj = DynamicObject::named(&Gvk::core("v1", "Namespace"), "", &ns);
            ns_obj.set_annotation(metadata::LIFECYCLE_DELETION_ANNOTATION, metadata::LIFECYCLE_DETACH);
            objects.push(ns_obj);
        }
        Ok(())
    }

    fn finish_fatal(
        &self,
        ctx: &TaskContext,
        mut run_errors: MultiError,
        err: SyncError,
    ) -> MultiError {
        ctx.send_event(Event::Error { error: err.clone() });
        run_errors.push(err);
        run_errors.merge(ctx.errors());
        self.errors.set(run_errors.clone());
        run_errors
    }
}

/// Tears down everything a sync owns: prunes every inventoried object in
/// reverse dependency order, then deletes the inventory itself.
pub struct Destroyer {
    cluster: Arc<dyn DynamicClient>,
    status: Arc<dyn StatusReader>,
    inv_client: InventoryClient,
    options: ApplyOptions,
    events: mpsc::UnboundedSender<Event>,
}

impl Destroyer {
    /// Runs the teardown. Returns the accumulated error set; empty means
    /// everything was pruned and the inventory deleted.
    pub async fn run(&self, cancel: &CancellationToken, info: &InventoryInfo) -> MultiError {
        let ctx = Arc::new(TaskContext::new(self.events.clone()));
        let mut errors = MultiError::new();

        let inventory = match self.inv_client.get(info).await {
            Ok(Some(inventory)) => inventory,
            Ok(None) => return errors,
            Err(err) => {
                ctx.send_event(Event::Error { error: err.clone() });
                errors.push(err);
                return errors;
            }
        };

        let prune_ids: Vec<ObjectId> = inventory
            .ids()
            .into_iter()
            .filter(|id| *id != info.object_id())
            .collect();
        let (prune_waves, prune_graph) =
            plan_prune_waves(&self.cluster, &prune_ids, &ctx).await;

        let prune_filters: Vec<Box<dyn PruneFilter>> = vec![
            Box::new(PreventRemoveFilter),
            Box::new(InventoryPolicyPruneFilter {
                policy: self.options.adoption_policy,
                inventory_id: info.id.clone(),
            }),
            Box::new(DependencyPruneFilter {
                declared_dependents: HashMap::new(),
                prune_dependents: prune_graph.dependents_map(),
            }),
        ];

        let status: Arc<dyn StatusReader> = if self.options.dry_run {
            Arc::new(BlindStatusReader)
        } else {
            Arc::clone(&self.status)
        };
        let runner = Arc::new(TaskStatusRunner {
            cluster: Arc::clone(&self.cluster),
            status,
            mutator: ApplyTimeMutator::new(Arc::clone(&self.cluster)),
            apply_filters: Vec::new(),
            prune_filters,
            desired: IndexMap::new(),
            inventory: Mutex::new(inventory),
            inv_client: self.inv_client.clone(),
            manager: String::new(),
            revision: String::new(),
            poll_interval: self.options.status_poll_interval,
            dry_run: self.options.dry_run,
            parallelism: self.options.apply_parallelism,
        });

        let builder = TaskQueueBuilder {
            reconcile_timeout: self.options.reconcile_timeout,
            prune_timeout: self.options.prune_timeout,
        };
        let tasks = builder.build(&[], &prune_waves);
        ctx.send_event(Event::Init {
            action_groups: tasks.iter().map(Task::action_group).collect(),
        });

        if let Err(err) = Arc::clone(&runner).run(cancel, tasks, &ctx).await {
            ctx.send_event(Event::Error { error: err.clone() });
            errors.push(err);
        }
        errors.merge(ctx.errors());

        if runner.final_inventory().is_empty() && !self.options.dry_run {
            if let Err(err) = self.inv_client.delete(info).await {
                errors.push(err);
            }
        }
        errors
    }
}

/// Orders prune candidates into reverse-dependency waves from their live
/// forms. Already-gone candidates go in a leading wave so their records are
/// settled first.
async fn plan_prune_waves(
    cluster: &Arc<dyn DynamicClient>,
    prune_ids: &[ObjectId],
    ctx: &TaskContext,
) -> (Vec<Vec<ObjectId>>, DependencyGraph) {
    let mut live_objects = Vec::new();
    let mut missing = Vec::new();
    for id in prune_ids {
        match cluster.get(id).await {
            Ok(Some(obj)) => live_objects.push(obj),
            Ok(None) => missing.push(id.clone()),
            Err(err) => {
                ctx.push_error(SyncError::Prune {
                    id: id.clone(),
                    message: format!("reading live object: {err}"),
                });
            }
        }
    }
    let graph = DependencyGraph::build(&live_objects);
    let mut waves = match graph.reversed_waves() {
        Ok(waves) => waves,
        Err(err) => {
            // A cycle among leftovers must not block cleanup.
            warn!(%err, "dependency cycle among prune candidates; pruning in one wave");
            vec![live_objects.iter().map(DynamicObject::id).collect()]
        }
    };
    if !missing.is_empty() {
        waves.insert(0, missing);
    }
    (waves, graph)
}
