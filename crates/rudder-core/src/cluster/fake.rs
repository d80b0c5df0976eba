//! In-memory cluster for tests and local development.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ClusterError, DynamicClient, StatusReader, WatchEvent};
use crate::object::{registry, DynamicObject, Gvk, ObjectId};

const WATCH_CHANNEL_CAPACITY: usize = 256;

/// An in-memory [`DynamicClient`] with watch streams, injectable failures,
/// and reconcile-status overrides.
///
/// Tests use the hooks to hold objects in a pending state, reject writes the
/// way the admission webhook would, or fail applies transiently.
#[derive(Debug, Default)]
pub struct FakeCluster {
    objects: RwLock<HashMap<ObjectId, DynamicObject>>,
    watchers: Mutex<HashMap<Gvk, broadcast::Sender<WatchEvent>>>,
    apply_failures: Mutex<HashMap<ObjectId, ClusterError>>,
    pending_status: Mutex<HashMap<ObjectId, bool>>,
    enforce_namespaces: Mutex<bool>,
}

impl FakeCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables namespace-existence enforcement on apply. Off by
    /// default so unit tests need no namespace scaffolding.
    pub fn enforce_namespaces(&self, enforce: bool) {
        *self.enforce_namespaces.lock().expect("fake cluster lock poisoned") = enforce;
    }

    /// Seeds an object directly, without watch events or failure hooks.
    pub fn seed(&self, obj: DynamicObject) {
        self.objects
            .write()
            .expect("fake cluster lock poisoned")
            .insert(obj.id(), obj);
    }

    /// Makes every apply of `id` fail with `err` until cleared.
    pub fn set_apply_failure(&self, id: ObjectId, err: ClusterError) {
        self.apply_failures
            .lock()
            .expect("fake cluster lock poisoned")
            .insert(id, err);
    }

    /// Clears an injected apply failure.
    pub fn clear_apply_failure(&self, id: &ObjectId) {
        self.apply_failures
            .lock()
            .expect("fake cluster lock poisoned")
            .remove(id);
    }

    /// Holds `id` in a not-yet-reconciled state for status waits.
    pub fn set_pending(&self, id: ObjectId, pending: bool) {
        self.pending_status
            .lock()
            .expect("fake cluster lock poisoned")
            .insert(id, pending);
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().expect("fake cluster lock poisoned").len()
    }

    /// Whether the cluster holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn broadcast(&self, gvk: &Gvk, event: WatchEvent) {
        let watchers = self.watchers.lock().expect("fake cluster lock poisoned");
        if let Some(tx) = watchers.get(gvk) {
            // Send fails only when no receiver is subscribed.
            let _ = tx.send(event);
        }
    }

    fn namespace_exists(&self, namespace: &str) -> bool {
        let ns_id = ObjectId::new("", "Namespace", "", namespace);
        self.objects
            .read()
            .expect("fake cluster lock poisoned")
            .contains_key(&ns_id)
    }
}

#[async_trait]
impl DynamicClient for FakeCluster {
    async fn get(&self, id: &ObjectId) -> Result<Option<DynamicObject>, ClusterError> {
        Ok(self
            .objects
            .read()
            .expect("fake cluster lock poisoned")
            .get(id)
            .map(DynamicObject::deep_copy))
    }

    async fn list(&self, gvk: &Gvk) -> Result<Vec<DynamicObject>, ClusterError> {
        Ok(self
            .objects
            .read()
            .expect("fake cluster lock poisoned")
            .values()
            .filter(|obj| obj.gvk() == *gvk)
            .map(DynamicObject::deep_copy)
            .collect())
    }

    async fn apply(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let id = obj.id();
        if let Some(err) = self
            .apply_failures
            .lock()
            .expect("fake cluster lock poisoned")
            .get(&id)
        {
            return Err(err.clone());
        }

        let enforce = *self.enforce_namespaces.lock().expect("fake cluster lock poisoned");
        if enforce
            && !id.namespace.is_empty()
            && !registry::is_cluster_scoped(&id.group_kind())
            && !self.namespace_exists(&id.namespace)
        {
            return Err(ClusterError::NamespaceNotFound {
                namespace: id.namespace.clone(),
            });
        }

        let stored = obj.deep_copy();
        self.objects
            .write()
            .expect("fake cluster lock poisoned")
            .insert(id, stored.clone());
        self.broadcast(&stored.gvk(), WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), ClusterError> {
        let removed = self
            .objects
            .write()
            .expect("fake cluster lock poisoned")
            .remove(id);
        match removed {
            Some(obj) => {
                self.broadcast(&obj.gvk(), WatchEvent::Deleted(id.clone()));
                Ok(())
            }
            None => Err(ClusterError::NotFound { id: id.clone() }),
        }
    }

    fn watch(&self, gvk: &Gvk) -> broadcast::Receiver<WatchEvent> {
        let mut watchers = self.watchers.lock().expect("fake cluster lock poisoned");
        watchers
            .entry(gvk.clone())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[async_trait]
impl StatusReader for FakeCluster {
    async fn is_current(&self, id: &ObjectId) -> Result<bool, ClusterError> {
        let pending = self
            .pending_status
            .lock()
            .expect("fake cluster lock poisoned")
            .get(id)
            .copied()
            .unwrap_or(false);
        if pending {
            return Ok(false);
        }
        Ok(self
            .objects
            .read()
            .expect("fake cluster lock poisoned")
            .contains_key(id))
    }

    async fn is_gone(&self, id: &ObjectId) -> Result<bool, ClusterError> {
        Ok(!self
            .objects
            .read()
            .expect("fake cluster lock poisoned")
            .contains_key(id))
    }
}
