//! Cluster client abstraction.
//!
//! The engine talks to the API server through the [`DynamicClient`] trait so
//! the applier, remediator, and inventory client can run against a real
//! cluster or the in-memory [`FakeCluster`]. Status waiting goes through the
//! separate [`StatusReader`] seam; dry-run substitutes [`BlindStatusReader`],
//! which treats every object as settled immediately.

mod fake;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use fake::FakeCluster;

use crate::object::{DynamicObject, Gvk, ObjectId};

/// Errors surfaced by a cluster client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// The requested object does not exist.
    #[error("not found: {id}")]
    NotFound {
        /// The missing object.
        id: ObjectId,
    },

    /// Create failed because the object already exists.
    #[error("object already exists: {id}")]
    AlreadyExists {
        /// The pre-existing object.
        id: ObjectId,
    },

    /// The admission webhook rejected the write.
    #[error("admission webhook denied write to {id}: {reason}")]
    Denied {
        /// The rejected object.
        id: ObjectId,
        /// Webhook denial reason.
        reason: String,
    },

    /// The target namespace does not exist.
    #[error("namespaces {namespace:?} not found")]
    NamespaceNotFound {
        /// The missing namespace.
        namespace: String,
    },

    /// A write raced another writer.
    #[error("conflict writing {id}: {reason}")]
    Conflict {
        /// The contested object.
        id: ObjectId,
        /// Conflict description.
        reason: String,
    },

    /// Transport or server failure.
    #[error("cluster error: {message}")]
    Internal {
        /// Failure description.
        message: String,
    },
}

/// A live-object change observed on a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// An object was created or updated. Carries the new live form.
    Applied(DynamicObject),
    /// An object was deleted.
    Deleted(ObjectId),
}

impl WatchEvent {
    /// The ID of the object the event concerns.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        match self {
            Self::Applied(obj) => obj.id(),
            Self::Deleted(id) => id.clone(),
        }
    }
}

/// Schema-free client for reading and writing live API objects.
#[async_trait]
pub trait DynamicClient: Send + Sync {
    /// Fetches a live object by ID. `Ok(None)` when absent.
    async fn get(&self, id: &ObjectId) -> Result<Option<DynamicObject>, ClusterError>;

    /// Lists all live objects of a kind.
    async fn list(&self, gvk: &Gvk) -> Result<Vec<DynamicObject>, ClusterError>;

    /// Creates or updates an object with the declared form, returning the
    /// stored object.
    async fn apply(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    /// Deletes an object by ID.
    ///
    /// # Errors
    ///
    /// `ClusterError::NotFound` when the object is already gone.
    async fn delete(&self, id: &ObjectId) -> Result<(), ClusterError>;

    /// Subscribes to change events for one kind.
    fn watch(&self, gvk: &Gvk) -> broadcast::Receiver<WatchEvent>;
}

/// Reads the reconcile state of live objects for status waits.
#[async_trait]
pub trait StatusReader: Send + Sync {
    /// Whether the object has reconciled to its declared form.
    async fn is_current(&self, id: &ObjectId) -> Result<bool, ClusterError>;

    /// Whether the object is fully gone.
    async fn is_gone(&self, id: &ObjectId) -> Result<bool, ClusterError>;
}

/// Status reader used for dry runs: every object is current and every
/// deletion is complete immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlindStatusReader;

#[async_trait]
impl StatusReader for BlindStatusReader {
    async fn is_current(&self, _id: &ObjectId) -> Result<bool, ClusterError> {
        Ok(true)
    }

    async fn is_gone(&self, _id: &ObjectId) -> Result<bool, ClusterError> {
        Ok(true)
    }
}
