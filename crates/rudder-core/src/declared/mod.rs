//! Declared-resource store.
//!
//! A threadsafe container for the set of resources declared in the source of
//! truth, snapshot-versioned by revision. Writers replace the snapshot
//! pointer under a write lock; readers take a shared lock only long enough to
//! sample the pointer, then work off the immutable snapshot. The store never
//! returns a reference to its internal map or objects, only copies.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::object::{DynamicObject, Gvk, ObjectId};
use crate::status::SyncError;

/// An immutable desired-state object set at a given revision.
///
/// Once installed a snapshot is never mutated; updates build a new snapshot
/// and swap the pointer.
#[derive(Debug)]
struct Snapshot {
    /// Insertion-ordered map of declared objects. Read-only once installed.
    objects: IndexMap<ObjectId, DynamicObject>,
    /// Source revision the objects were declared at.
    revision: String,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            objects: IndexMap::new(),
            revision: String::new(),
        }
    }

    /// Names of namespaces declared as Namespace objects in this snapshot.
    fn declared_namespaces(&self) -> HashSet<String> {
        self.objects
            .values()
            .filter(|obj| obj.is_namespace())
            .map(|obj| obj.name().to_string())
            .collect()
    }

    /// Namespaces referenced by namespaced objects in this snapshot.
    fn populated_namespaces(&self) -> HashSet<String> {
        self.objects
            .values()
            .map(|obj| obj.namespace().to_string())
            .filter(|ns| !ns.is_empty())
            .collect()
    }
}

/// A threadsafe registry of the declared object set, keyed by revision.
#[derive(Debug)]
pub struct DeclaredResources {
    inner: RwLock<Arc<Snapshot>>,
}

impl Default for DeclaredResources {
    fn default() -> Self {
        Self::new()
    }
}

impl DeclaredResources {
    /// Creates an empty store with no revision.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Snapshot::empty())),
        }
    }

    /// Atomically replaces the current snapshot with the given object set.
    ///
    /// Null entries are logged and skipped as parser internal errors; any
    /// other malformed entry aborts with an internal error. The
    /// namespace-retention rule rejects updates that would drop every
    /// declared namespace along with all of its contents.
    ///
    /// Returns the accepted objects in declaration order.
    ///
    /// # Errors
    ///
    /// `SyncError::Internal` on conversion failure, `SyncError::NamespaceRetention`
    /// when the retention rule fires. On error the previous snapshot stays
    /// installed.
    pub fn update(
        &self,
        objects: Vec<Value>,
        revision: &str,
        old_revision: &str,
    ) -> Result<Vec<DynamicObject>, SyncError> {
        let mut new_set: IndexMap<ObjectId, DynamicObject> = IndexMap::new();
        for value in objects {
            if value.is_null() {
                warn!("declared resource set contained a null object; skipping");
                continue;
            }
            let obj = DynamicObject::from_value(value).map_err(|err| SyncError::Internal {
                message: format!("converting declared resource: {err}"),
            })?;
            new_set.insert(obj.id(), obj);
        }

        // Gauge of declared resources per revision. When the revision
        // advances, the prior revision's stream is closed out at zero so
        // downstream aggregation sees the decrease.
        debug!(revision, declared = new_set.len(), "declared resources updated");
        if !old_revision.is_empty() && old_revision != revision {
            debug!(revision = old_revision, declared = 0usize, "declared resources updated");
        }

        let new_snapshot = Snapshot {
            objects: new_set,
            revision: revision.to_string(),
        };

        let mut guard = self.inner.write().expect("declared store lock poisoned");
        check_namespace_retention(&guard, &new_snapshot)?;
        let accepted = new_snapshot.objects.values().cloned().collect();
        *guard = Arc::new(new_snapshot);
        Ok(accepted)
    }

    /// Returns a deep copy of the declared object with this ID, along with
    /// the snapshot revision. The caller may freely mutate the copy.
    #[must_use]
    pub fn get(&self, id: &ObjectId) -> Option<(DynamicObject, String)> {
        let snapshot = self.sample();
        snapshot
            .objects
            .get(id)
            .map(|obj| (obj.deep_copy(), snapshot.revision.clone()))
    }

    /// Returns copies of all declared objects in declaration order, along
    /// with the snapshot revision.
    #[must_use]
    pub fn declared_objects(&self) -> (Vec<DynamicObject>, String) {
        let snapshot = self.sample();
        (
            snapshot.objects.values().map(DynamicObject::deep_copy).collect(),
            snapshot.revision.clone(),
        )
    }

    /// Returns the set of group-version-kinds present in the snapshot, along
    /// with the snapshot revision.
    #[must_use]
    pub fn declared_gvks(&self) -> (HashSet<Gvk>, String) {
        let snapshot = self.sample();
        (
            snapshot.objects.values().map(DynamicObject::gvk).collect(),
            snapshot.revision.clone(),
        )
    }

    /// The revision of the installed snapshot; empty before the first update.
    #[must_use]
    pub fn revision(&self) -> String {
        self.sample().revision.clone()
    }

    /// Whether the installed snapshot declares an object with this ID.
    #[must_use]
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.sample().objects.contains_key(id)
    }

    /// Number of declared objects in the installed snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sample().objects.len()
    }

    /// Whether the installed snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sample(&self) -> Arc<Snapshot> {
        self.inner.read().expect("declared store lock poisoned").clone()
    }
}

/// Rejects an update that drops every declared namespace together with all
/// of its declared contents, which almost always means a truncated checkout
/// rather than an intentional teardown.
fn check_namespace_retention(previous: &Snapshot, next: &Snapshot) -> Result<(), SyncError> {
    let prev_namespaces = previous.declared_namespaces();
    if prev_namespaces.is_empty() {
        return Ok(());
    }
    // A fully empty source is explicit teardown, not a truncation.
    if next.objects.is_empty() {
        return Ok(());
    }
    // Any surviving previously-declared namespace means a deliberate edit.
    let next_namespaces = next.declared_namespaces();
    if prev_namespaces.iter().any(|ns| next_namespaces.contains(ns)) {
        return Ok(());
    }
    // Only guard namespaces that actually held declared objects.
    let prev_populated = previous.populated_namespaces();
    if prev_namespaces.iter().all(|ns| !prev_populated.contains(ns)) {
        return Ok(());
    }
    Err(SyncError::NamespaceRetention {
        message: format!(
            "update removes all {} declared namespace(s) and their contents; \
             rejecting to prevent accidental mass deletion",
            prev_namespaces.len()
        ),
    })
}
