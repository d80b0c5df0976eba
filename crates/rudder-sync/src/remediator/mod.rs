//! Remediator: live drift correction.
//!
//! Watches live objects of every declared kind; when a live object diverges
//! from the declared version the declared form is re-applied. While paused,
//! watchers continue to enqueue but workers do not dequeue, so the
//! remediator never races the applier during a cycle; on resume, drift
//! accumulated during the cycle is reconciled against the new snapshot.

mod fight;
mod queue;
mod watcher;
mod worker;

pub use fight::FightDetector;
pub use queue::WorkQueue;
pub use watcher::WatchManager;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rudder_core::cluster::DynamicClient;
use rudder_core::config::SyncConfig;
use rudder_core::object::Gvk;
use rudder_core::{DeclaredResources, SyncError, SyncTarget};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use worker::{worker_loop, RemediatorShared};

/// Drift-correction subsystem for one sync.
///
/// Created paused; the updater resumes it after the first successful cycle.
/// Must be created inside a tokio runtime: workers and watchers are
/// background tasks.
pub struct Remediator {
    shared: Arc<RemediatorShared>,
    watch_manager: WatchManager,
    paused_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    last_revision: Mutex<String>,
}

impl Remediator {
    /// Creates the remediator and spawns its worker pool, paused.
    #[must_use]
    pub fn new(
        target: SyncTarget,
        store: Arc<DeclaredResources>,
        cluster: Arc<dyn DynamicClient>,
        inventory_id: String,
        config: &SyncConfig,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(config.remediator_queue_capacity));
        let shared = Arc::new(RemediatorShared {
            store,
            cluster: Arc::clone(&cluster),
            queue: Arc::clone(&queue),
            target,
            inventory_id,
            conflicts: Mutex::new(indexmap::IndexMap::new()),
            fights: FightDetector::new(config.fight_threshold, config.fight_window),
        });
        let watch_manager = WatchManager::new(cluster, queue);

        let (paused_tx, _) = watch::channel(true);
        let cancel = CancellationToken::new();
        let workers = (0..config.remediator_workers.max(1))
            .map(|_| {
                tokio::spawn(worker_loop(
                    Arc::clone(&shared),
                    paused_tx.subscribe(),
                    cancel.clone(),
                ))
            })
            .collect();

        Self {
            shared,
            watch_manager,
            paused_tx,
            cancel,
            workers,
            last_revision: Mutex::new(String::new()),
        }
    }

    /// Stops workers from dequeuing. Watchers keep enqueuing; queued objects
    /// are remediated when the workers resume.
    pub fn pause(&self) {
        debug!("remediator paused");
        let _ = self.paused_tx.send(true);
    }

    /// Resumes worker dequeuing.
    pub fn resume(&self) {
        debug!("remediator resumed");
        let _ = self.paused_tx.send(false);
    }

    /// Whether workers are currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    /// Diffs the watched kind set against `gvks`: starts missing watchers,
    /// stops extraneous ones (deferred for kinds still being pruned). A
    /// revision advance clears the fight ledger.
    pub fn update_watches(&self, gvks: &HashSet<Gvk>, revision: &str) {
        {
            let mut last = self.last_revision.lock().expect("remediator lock poisoned");
            if *last != revision {
                self.shared.fights.reset();
                *last = revision.to_string();
            }
        }
        self.watch_manager.update_watches(gvks);
    }

    /// Kinds currently being watched.
    #[must_use]
    pub fn watched_gvks(&self) -> HashSet<Gvk> {
        self.watch_manager.active_gvks()
    }

    /// Keeps watchers of these kinds alive while their prunes are in
    /// flight.
    pub fn add_pending_prunes(&self, gvks: impl IntoIterator<Item = Gvk>) {
        self.watch_manager.add_pending_prunes(gvks);
    }

    /// Clears the pending-prune set, stopping watchers only it retained.
    pub fn clear_pending_prunes(&self) {
        self.watch_manager.clear_pending_prunes();
    }

    /// Management conflicts observed by drift correction, in detection
    /// order. Conflicts clear when the object is corrected or deleted.
    #[must_use]
    pub fn conflict_errors(&self) -> Vec<SyncError> {
        self.shared.conflict_errors()
    }

    /// Whether any management conflict is currently held.
    #[must_use]
    pub fn management_conflict(&self) -> bool {
        !self.shared.conflict_errors().is_empty()
    }

    /// Resource fights recorded since the last revision change.
    #[must_use]
    pub fn fight_errors(&self) -> Vec<SyncError> {
        self.shared.fights.fight_errors()
    }

    /// Whether observation was lossy (queue overflow, watch lag, failed
    /// initial list) and a full sync should run to recover.
    #[must_use]
    pub fn needs_update(&self) -> bool {
        self.shared.queue.take_shed() || self.watch_manager.needs_update()
    }

    /// Number of observations waiting for a worker.
    #[must_use]
    pub fn pending_corrections(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stops watchers and workers.
    pub async fn shutdown(self) {
        self.watch_manager.shutdown();
        self.cancel.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
