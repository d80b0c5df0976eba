//! Inventory of owned live objects.
//!
//! The inventory is itself a live API object managed by the engine and is
//! the durable ground truth of ownership across restarts: it lists the IDs
//! the sync currently owns, the revision each was applied under, and per
//! object actuation and reconcile status.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::cluster::{ClusterError, DynamicClient};
use crate::object::{DynamicObject, Gvk, ObjectId};
use crate::status::SyncError;

/// API group of the persisted inventory object.
pub const INVENTORY_GROUP: &str = "rudder.dev";
/// API version of the persisted inventory object.
pub const INVENTORY_VERSION: &str = "v1";
/// Kind of the persisted inventory object.
pub const INVENTORY_KIND: &str = "Inventory";

/// The group/version/kind of persisted inventory objects.
#[must_use]
pub fn inventory_gvk() -> Gvk {
    Gvk::new(INVENTORY_GROUP, INVENTORY_VERSION, INVENTORY_KIND)
}

/// Identity of a persisted inventory: its stable ID plus the name/namespace
/// of the live object holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryInfo {
    /// Stable inventory ID, stamped onto every owned object.
    pub id: String,
    /// Name of the live inventory object.
    pub name: String,
    /// Namespace of the live inventory object.
    pub namespace: String,
}

impl InventoryInfo {
    /// Creates an inventory identity.
    pub fn new(id: impl Into<String>, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Creates an identity with a generated inventory ID.
    pub fn generated(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), name, namespace)
    }

    /// The ID of the live object holding this inventory.
    #[must_use]
    pub fn object_id(&self) -> ObjectId {
        ObjectId::new(
            INVENTORY_GROUP,
            INVENTORY_KIND,
            self.namespace.clone(),
            self.name.clone(),
        )
    }
}

/// Whether an owned object was actuated this cycle, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actuation {
    /// Mutation intended but not yet performed.
    Pending,
    /// Mutation performed successfully.
    Succeeded,
    /// Mutation failed.
    Failed,
    /// Mutation skipped by a filter or policy.
    Skipped,
}

/// Whether an owned object has reconciled to its declared form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconcile {
    /// Not yet observed current.
    Pending,
    /// Observed current.
    Current,
    /// Status could not be determined.
    Unknown,
}

/// Per-object record in the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Actuation status of the last cycle touching the object.
    pub actuation: Actuation,
    /// Reconcile status of the object.
    pub reconcile: Reconcile,
    /// Source revision the object was applied under.
    pub revision: String,
}

/// The owned-object listing for one sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    /// Identity of the persisted inventory.
    pub info: InventoryInfo,
    /// Records by owned object ID, in insertion order.
    pub objects: IndexMap<ObjectId, ObjectRecord>,
    /// When the inventory was last written.
    pub updated_at: DateTime<Utc>,
}

impl Inventory {
    /// Creates an empty inventory for the given identity.
    #[must_use]
    pub fn empty(info: InventoryInfo) -> Self {
        Self {
            info,
            objects: IndexMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// IDs of all owned objects, in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.keys().cloned().collect()
    }

    /// Record for one owned object.
    #[must_use]
    pub fn record(&self, id: &ObjectId) -> Option<&ObjectRecord> {
        self.objects.get(id)
    }

    /// Inserts or replaces an owned-object record.
    pub fn set_record(&mut self, id: ObjectId, record: ObjectRecord) {
        self.objects.insert(id, record);
    }

    /// Removes an owned-object record.
    pub fn remove(&mut self, id: &ObjectId) {
        self.objects.shift_remove(id);
    }

    /// Whether the inventory lists this ID.
    #[must_use]
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Number of owned objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the inventory lists no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Encodes the inventory as its live object form.
    #[must_use]
    pub fn to_object(&self) -> DynamicObject {
        let records: Vec<serde_json::Value> = self
            .objects
            .iter()
            .map(|(id, record)| {
                json!({
                    "group": id.group,
                    "kind": id.kind,
                    "namespace": id.namespace,
                    "name": id.name,
                    "actuation": record.actuation,
                    "reconcile": record.reconcile,
                    "revision": record.revision,
                })
            })
            .collect();
        let mut obj = DynamicObject::named(&inventory_gvk(), &self.info.namespace, &self.info.name);
        obj.set_field("spec", json!({
            "inventoryId": self.info.id,
            "updatedAt": self.updated_at.to_rfc3339(),
            "objects": records,
        }))
        .expect("fresh object accepts spec");
        obj
    }

    /// Decodes an inventory from its live object form.
    ///
    /// # Errors
    ///
    /// `SyncError::Internal` when the stored spec is malformed.
    pub fn from_object(obj: &DynamicObject) -> Result<Self, SyncError> {
        let malformed = |what: &str| SyncError::Internal {
            message: format!("malformed inventory object {}: {what}", obj.id()),
        };

        let id = obj
            .field("spec.inventoryId")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| malformed("missing spec.inventoryId"))?
            .to_string();
        let updated_at = obj
            .field("spec.updatedAt")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or_else(Utc::now, |t| t.with_timezone(&Utc));

        let mut objects = IndexMap::new();
        if let Some(records) = obj.field("spec.objects").and_then(serde_json::Value::as_array) {
            for record in records {
                let field = |key: &str| {
                    record
                        .get(key)
                        .and_then(serde_json::Value::as_str)
                        .map(ToString::to_string)
                };
                let object_id = ObjectId::new(
                    field("group").ok_or_else(|| malformed("record missing group"))?,
                    field("kind").ok_or_else(|| malformed("record missing kind"))?,
                    field("namespace").unwrap_or_default(),
                    field("name").ok_or_else(|| malformed("record missing name"))?,
                );
                let actuation: Actuation = record
                    .get("actuation")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or(Actuation::Pending);
                let reconcile: Reconcile = record
                    .get("reconcile")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or(Reconcile::Unknown);
                objects.insert(
                    object_id,
                    ObjectRecord {
                        actuation,
                        reconcile,
                        revision: field("revision").unwrap_or_default(),
                    },
                );
            }
        }

        Ok(Self {
            info: InventoryInfo::new(id, obj.name(), obj.namespace()),
            objects,
            updated_at,
        })
    }
}

/// Persists and reads the inventory through the cluster client.
#[derive(Clone)]
pub struct InventoryClient {
    cluster: Arc<dyn DynamicClient>,
}

impl InventoryClient {
    /// Creates an inventory client over a cluster client.
    #[must_use]
    pub fn new(cluster: Arc<dyn DynamicClient>) -> Self {
        Self { cluster }
    }

    /// Reads the persisted inventory. `Ok(None)` when it does not exist.
    pub async fn get(&self, info: &InventoryInfo) -> Result<Option<Inventory>, SyncError> {
        let live = self
            .cluster
            .get(&info.object_id())
            .await
            .map_err(internal)?;
        match live {
            Some(obj) => Ok(Some(Inventory::from_object(&obj)?)),
            None => Ok(None),
        }
    }

    /// Reads the persisted inventory, or returns a fresh empty one when the
    /// live object does not exist yet.
    pub async fn get_or_create(&self, info: &InventoryInfo) -> Result<Inventory, SyncError> {
        match self.get(info).await? {
            Some(inv) => Ok(inv),
            None => Ok(Inventory::empty(info.clone())),
        }
    }

    /// Writes the inventory back as its live object form.
    pub async fn replace(&self, inventory: &Inventory) -> Result<(), SyncError> {
        let mut inventory = inventory.clone();
        inventory.updated_at = Utc::now();
        self.cluster
            .apply(&inventory.to_object())
            .await
            .map_err(internal)?;
        Ok(())
    }

    /// Deletes the persisted inventory object. Missing is not an error.
    pub async fn delete(&self, info: &InventoryInfo) -> Result<(), SyncError> {
        match self.cluster.delete(&info.object_id()).await {
            Ok(()) | Err(ClusterError::NotFound { .. }) => Ok(()),
            Err(err) => Err(internal(err)),
        }
    }
}

fn internal(err: ClusterError) -> SyncError {
    SyncError::Internal {
        message: format!("inventory: {err}"),
    }
}
