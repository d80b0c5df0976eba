//! # rudder-core
//!
//! Core library for rudder - a GitOps-style cluster configuration
//! synchronizer.
//!
//! This crate provides the data model and seams shared by the sync engine:
//! the schema-free object representation, the metadata vocabulary written
//! onto managed objects, the declared-resource snapshot store, the inventory
//! of owned objects, and the cluster client abstraction.
//!
//! ## Example
//!
//! ```rust
//! use rudder_core::declared::DeclaredResources;
//! use serde_json::json;
//!
//! let store = DeclaredResources::new();
//! let objects = vec![json!({
//!     "apiVersion": "v1",
//!     "kind": "ConfigMap",
//!     "metadata": { "name": "settings", "namespace": "prod" },
//!     "data": { "mode": "on" },
//! })];
//! store.update(objects, "rev-1", "").unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod declared;
pub mod inventory;
pub mod metadata;
pub mod object;
pub mod status;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cluster::{ClusterError, DynamicClient, StatusReader};
    pub use crate::config::SyncConfig;
    pub use crate::declared::DeclaredResources;
    pub use crate::inventory::{Inventory, InventoryClient, InventoryInfo};
    pub use crate::object::{DynamicObject, Gvk, ObjectId, Scope, SyncTarget};
    pub use crate::status::{MultiError, SyncError};
}

pub use config::SyncConfig;
pub use declared::DeclaredResources;
pub use object::{DynamicObject, Gvk, ObjectId, Scope, SyncTarget};
pub use status::{MultiError, SyncError};
