//! The sync engine: wiring and the reconcile loop.
//!
//! One engine reconciles one sync target. The loop is single-threaded:
//! source pushes and publisher triggers are handled in arrival order, one
//! cycle at a time. The remediator and its watchers run concurrently in the
//! background and are paused by the updater across each cycle.

use std::sync::Arc;

use rudder_core::cluster::{DynamicClient, StatusReader};
use rudder_core::config::SyncConfig;
use rudder_core::inventory::InventoryInfo;
use rudder_core::status::{ErrorBuffer, StallDetector};
use rudder_core::{DeclaredResources, MultiError, SyncTarget};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::applier::{Applier, ApplyOptions, Destroyer, Event};
use crate::events::{NamespaceSignal, PublishingGroup, PublishingGroupBuilder, Trigger};
use crate::remediator::Remediator;
use crate::updater::{CommitCache, Updater};

const SOURCE_CHANNEL_CAPACITY: usize = 8;

/// One parsed source push: the object set at a revision, plus any
/// non-blocking parser errors.
#[derive(Debug, Clone)]
pub struct SourceCommit {
    /// Source revision, typically a commit hash.
    pub revision: String,
    /// Parsed objects as raw field trees.
    pub objects: Vec<serde_json::Value>,
    /// Non-blocking parser errors; while present, cycle progress is not
    /// marked done, forcing retry.
    pub parse_errors: MultiError,
}

/// Cloneable handle for feeding and observing a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    source_tx: mpsc::Sender<SourceCommit>,
    signal: NamespaceSignal,
    errors: Arc<ErrorBuffer>,
}

impl EngineHandle {
    /// Pushes a parsed source revision to the engine. Returns `false` when
    /// the engine has shut down.
    pub async fn push_source(&self, commit: SourceCommit) -> bool {
        self.source_tx.send(commit).await.is_ok()
    }

    /// Requests an out-of-band namespace resync.
    pub fn request_namespace_sync(&self) {
        self.signal.ping();
    }

    /// The aggregated error set last surfaced by the engine. Safe to call
    /// at any time.
    #[must_use]
    pub fn errors(&self) -> MultiError {
        self.errors.get()
    }
}

/// The reconcile core for one sync target.
pub struct SyncEngine {
    target: SyncTarget,
    store: Arc<DeclaredResources>,
    remediator: Arc<Remediator>,
    updater: Updater,
    applier: Arc<Applier>,
    inventory_info: InventoryInfo,
    publishers: PublishingGroup,
    source_tx: mpsc::Sender<SourceCommit>,
    source_rx: mpsc::Receiver<SourceCommit>,
    signal: NamespaceSignal,
    events_rx: Option<mpsc::UnboundedReceiver<Event>>,
    errors: Arc<ErrorBuffer>,
    stall: StallDetector,
    cache: CommitCache,
    previous_revision: String,
    has_source: bool,
    last_status: String,
}

impl SyncEngine {
    /// Wires up an engine: store, remediator, applier, updater, and trigger
    /// publishers. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(
        target: SyncTarget,
        cluster: Arc<dyn DynamicClient>,
        status: Arc<dyn StatusReader>,
        inventory_info: InventoryInfo,
        config: &SyncConfig,
    ) -> Self {
        let store = Arc::new(DeclaredResources::new());
        let remediator = Arc::new(Remediator::new(
            target.clone(),
            Arc::clone(&store),
            Arc::clone(&cluster),
            inventory_info.id.clone(),
            config,
        ));
        let (applier, events_rx) = Applier::new(
            cluster,
            status,
            target.clone(),
            ApplyOptions::from_config(config),
        );
        let applier = Arc::new(applier);
        let updater = Updater::new(
            Arc::clone(&store),
            Arc::clone(&remediator),
            Arc::clone(&applier),
            inventory_info.clone(),
        );

        let signal = NamespaceSignal::new();
        let publishers = PublishingGroupBuilder::from_config(config).build(signal.clone());
        let (source_tx, source_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);

        Self {
            target,
            store,
            remediator,
            updater,
            applier,
            inventory_info,
            publishers,
            source_tx,
            source_rx,
            signal,
            events_rx: Some(events_rx),
            errors: Arc::new(ErrorBuffer::new()),
            stall: StallDetector::new(config.stall_threshold),
            cache: CommitCache::default(),
            previous_revision: String::new(),
            has_source: false,
            last_status: String::new(),
        }
    }

    /// A handle for pushing source revisions and reading surfaced errors.
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            source_tx: self.source_tx.clone(),
            signal: self.signal.clone(),
            errors: Arc::clone(&self.errors),
        }
    }

    /// Takes the applier event stream. `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.events_rx.take()
    }

    /// The declared-resource store of this engine.
    #[must_use]
    pub fn store(&self) -> Arc<DeclaredResources> {
        Arc::clone(&self.store)
    }

    /// The remediator of this engine.
    #[must_use]
    pub fn remediator(&self) -> Arc<Remediator> {
        Arc::clone(&self.remediator)
    }

    /// A destroyer for explicit teardown of everything this sync owns.
    #[must_use]
    pub fn destroyer(&self) -> Destroyer {
        self.applier.destroyer()
    }

    /// Runs the reconcile loop until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(sync = %self.target.name, scope = %self.target.scope, "sync engine started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                commit = self.source_rx.recv() => {
                    let Some(commit) = commit else { break };
                    self.accept_source(commit);
                    self.reconcile(&cancel, "source-push").await;
                }
                trigger = self.publishers.next() => match trigger {
                    Trigger::StatusUpdate => self.surface_status(),
                    Trigger::Sync => self.reconcile(&cancel, "sync").await,
                    Trigger::Retry => self.reconcile(&cancel, "retry").await,
                    Trigger::NamespaceSync => self.reconcile(&cancel, "namespace-sync").await,
                },
            }
        }
        info!(sync = %self.target.name, "sync engine stopped");
    }

    fn accept_source(&mut self, commit: SourceCommit) {
        if self.has_source && commit.revision != self.cache.revision {
            self.previous_revision = self.cache.revision.clone();
        }
        debug!(revision = %commit.revision, objects = commit.objects.len(), "source pushed");
        self.cache
            .advance(&commit.revision, commit.objects, commit.parse_errors);
        self.has_source = true;
    }

    async fn reconcile(&mut self, cancel: &CancellationToken, reason: &str) {
        if !self.has_source {
            debug!(reason, "no source pushed yet; skipping reconcile");
            return;
        }
        if self.remediator.needs_update() {
            debug!("remediator observation was lossy; reconciling recovers it");
        }

        let started = std::time::Instant::now();
        let child = cancel.child_token();
        let errors = self
            .updater
            .update(&child, &mut self.cache, &self.previous_revision.clone())
            .await;
        let success = errors.is_empty();
        self.publishers.cycle_finished(success);

        if success {
            self.stall.observe_success();
            info!(
                reason,
                revision = %self.cache.revision,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "cycle succeeded"
            );
        } else {
            let stalled = self.stall.observe_failure(&errors);
            warn!(
                reason,
                revision = %self.cache.revision,
                stalled,
                %errors,
                "cycle failed"
            );
        }

        let mut surfaced = errors;
        surfaced.merge(self.cache.parse_errors.clone());
        self.errors.set(surfaced);
    }

    /// Writes the aggregated error set to the status surface. Idempotent:
    /// an unchanged set is not re-surfaced.
    fn surface_status(&mut self) {
        let mut errors = self.updater.errors();
        errors.merge(self.cache.parse_errors.clone());
        let rendered = errors.to_string();
        if rendered == self.last_status {
            return;
        }
        info!(
            sync = %self.target.name,
            revision = %self.cache.revision,
            errors = errors.len(),
            status = %rendered,
            "sync status updated"
        );
        self.errors.set(errors);
        self.last_status = rendered;
    }

    /// Identity of this engine's persisted inventory.
    #[must_use]
    pub fn inventory_info(&self) -> &InventoryInfo {
        &self.inventory_info
    }
}
