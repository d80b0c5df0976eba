//! Per-GVK watch lifecycle.
//!
//! One background task per watched kind pumps observed object IDs into the
//! work queue. `update_watches` diffs the wanted set against the active set:
//! missing watchers start, extraneous watchers stop. A stop is deferred
//! while an in-flight prune still targets the kind, so deletion events of
//! pruned objects are observed to the end.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rudder_core::cluster::DynamicClient;
use rudder_core::object::Gvk;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::queue::WorkQueue;

struct WatcherHandle {
    cancel: CancellationToken,
}

/// Starts and stops per-GVK watcher tasks.
pub struct WatchManager {
    cluster: Arc<dyn DynamicClient>,
    queue: Arc<WorkQueue>,
    active: Mutex<HashMap<Gvk, WatcherHandle>>,
    pending_prunes: Mutex<HashSet<Gvk>>,
    wanted: Mutex<HashSet<Gvk>>,
    needs_update: Arc<AtomicBool>,
}

impl WatchManager {
    /// Creates a manager feeding the given queue.
    #[must_use]
    pub fn new(cluster: Arc<dyn DynamicClient>, queue: Arc<WorkQueue>) -> Self {
        Self {
            cluster,
            queue,
            active: Mutex::new(HashMap::new()),
            pending_prunes: Mutex::new(HashSet::new()),
            wanted: Mutex::new(HashSet::new()),
            needs_update: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Diffs the active watcher set against `gvks`: starts missing watchers,
    /// stops extraneous ones. Kinds with pending prunes keep their watchers
    /// until the prunes clear.
    pub fn update_watches(&self, gvks: &HashSet<Gvk>) {
        *self.wanted.lock().expect("watch manager lock poisoned") = gvks.clone();
        self.reconcile_watchers();
    }

    /// Kinds currently being watched.
    #[must_use]
    pub fn active_gvks(&self) -> HashSet<Gvk> {
        self.active
            .lock()
            .expect("watch manager lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Defers watcher stops for kinds still being pruned.
    pub fn add_pending_prunes(&self, gvks: impl IntoIterator<Item = Gvk>) {
        self.pending_prunes
            .lock()
            .expect("watch manager lock poisoned")
            .extend(gvks);
    }

    /// Clears the pending-prune set and stops any watcher that was only
    /// retained for it.
    pub fn clear_pending_prunes(&self) {
        self.pending_prunes
            .lock()
            .expect("watch manager lock poisoned")
            .clear();
        self.reconcile_watchers();
    }

    /// Whether a watcher fell behind or failed its initial list; a full
    /// re-sync is needed to recover anything missed.
    #[must_use]
    pub fn needs_update(&self) -> bool {
        self.needs_update.swap(false, Ordering::Relaxed)
    }

    /// Stops every watcher.
    pub fn shutdown(&self) {
        let mut active = self.active.lock().expect("watch manager lock poisoned");
        for (_, handle) in active.drain() {
            handle.cancel.cancel();
        }
    }

    fn reconcile_watchers(&self) {
        let wanted = self.wanted.lock().expect("watch manager lock poisoned").clone();
        let pending = self
            .pending_prunes
            .lock()
            .expect("watch manager lock poisoned")
            .clone();
        let mut active = self.active.lock().expect("watch manager lock poisoned");

        active.retain(|gvk, handle| {
            if wanted.contains(gvk) || pending.contains(gvk) {
                true
            } else {
                debug!(%gvk, "stopping watcher");
                handle.cancel.cancel();
                false
            }
        });

        for gvk in &wanted {
            if active.contains_key(gvk) {
                continue;
            }
            debug!(%gvk, "starting watcher");
            let cancel = CancellationToken::new();
            tokio::spawn(watch_loop(
                gvk.clone(),
                Arc::clone(&self.cluster),
                Arc::clone(&self.queue),
                Arc::clone(&self.needs_update),
                cancel.clone(),
            ));
            active.insert(gvk.clone(), WatcherHandle { cancel });
        }
    }
}

/// One watcher: list the kind once so pre-existing drift is observed, then
/// stream change events into the queue until cancelled.
async fn watch_loop(
    gvk: Gvk,
    cluster: Arc<dyn DynamicClient>,
    queue: Arc<WorkQueue>,
    needs_update: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut rx = cluster.watch(&gvk);

    match cluster.list(&gvk).await {
        Ok(objects) => {
            for obj in objects {
                queue.add(obj.id());
            }
        }
        Err(err) => {
            warn!(%gvk, %err, "initial list failed; flagging resync");
            needs_update.store(true, Ordering::Relaxed);
        }
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => queue.add(event.id()),
                Err(RecvError::Lagged(missed)) => {
                    warn!(%gvk, missed, "watch stream lagged; flagging resync");
                    needs_update.store(true, Ordering::Relaxed);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!(%gvk, "watcher stopped");
}

#[cfg(test)]
mod tests {
    use rudder_core::cluster::FakeCluster;
    use rudder_core::DynamicObject;

    use super::*;

    fn gvk(kind: &str) -> Gvk {
        Gvk::core("v1", kind)
    }

    fn manager() -> (WatchManager, Arc<FakeCluster>, Arc<WorkQueue>) {
        let cluster = Arc::new(FakeCluster::new());
        let queue = Arc::new(WorkQueue::new(64));
        let manager = WatchManager::new(
            Arc::clone(&cluster) as Arc<dyn DynamicClient>,
            Arc::clone(&queue),
        );
        (manager, cluster, queue)
    }

    #[tokio::test]
    async fn test_update_watches_diffs_active_set() {
        let (manager, _cluster, _queue) = manager();

        manager.update_watches(&HashSet::from([gvk("ConfigMap"), gvk("Secret")]));
        assert_eq!(
            manager.active_gvks(),
            HashSet::from([gvk("ConfigMap"), gvk("Secret")])
        );

        manager.update_watches(&HashSet::from([gvk("ConfigMap")]));
        assert_eq!(manager.active_gvks(), HashSet::from([gvk("ConfigMap")]));
    }

    #[tokio::test]
    async fn test_pending_prune_defers_stop() {
        let (manager, _cluster, _queue) = manager();

        manager.update_watches(&HashSet::from([gvk("ConfigMap"), gvk("Secret")]));
        manager.add_pending_prunes([gvk("Secret")]);

        // Secret is no longer declared but its prune is still in flight.
        manager.update_watches(&HashSet::from([gvk("ConfigMap")]));
        assert_eq!(
            manager.active_gvks(),
            HashSet::from([gvk("ConfigMap"), gvk("Secret")])
        );

        manager.clear_pending_prunes();
        assert_eq!(manager.active_gvks(), HashSet::from([gvk("ConfigMap")]));
    }

    #[tokio::test]
    async fn test_watcher_enqueues_observed_changes() {
        let (manager, cluster, queue) = manager();
        let obj = DynamicObject::named(&gvk("ConfigMap"), "ns", "cm");

        manager.update_watches(&HashSet::from([gvk("ConfigMap")]));
        // Give the watcher task a chance to subscribe.
        tokio::task::yield_now().await;

        cluster.apply(&obj).await.unwrap();
        let id = queue.take().await;
        assert_eq!(id, obj.id());
    }

    #[tokio::test]
    async fn test_initial_list_enqueues_existing_objects() {
        let (manager, cluster, queue) = manager();
        let obj = DynamicObject::named(&gvk("ConfigMap"), "ns", "pre-existing");
        cluster.seed(obj.clone());

        manager.update_watches(&HashSet::from([gvk("ConfigMap")]));
        let id = queue.take().await;
        assert_eq!(id, obj.id());
    }
}
