//! Shared fixtures for the sync engine integration tests.

// Each integration test binary compiles this module independently and uses
// a different subset of it.
#![allow(dead_code)]

use std::sync::Arc;

use rudder_core::cluster::{DynamicClient, FakeCluster, StatusReader};
use rudder_core::config::SyncConfig;
use rudder_core::inventory::{InventoryClient, InventoryInfo};
use rudder_core::{DynamicObject, SyncTarget};
use rudder_sync::applier::{Applier, ApplyOptions, Event};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config_map(ns: &str, name: &str, value: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": ns },
        "data": { "k": value },
    })
}

pub fn namespace(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name },
    })
}

pub fn role(ns: &str, name: &str) -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "Role",
        "metadata": { "name": name, "namespace": ns },
        "rules": [{ "apiGroups": [""], "resources": ["pods"], "verbs": ["get"] }],
    })
}

pub fn objects(values: Vec<Value>) -> Vec<DynamicObject> {
    values
        .into_iter()
        .map(|value| DynamicObject::from_value(value).expect("test object is well formed"))
        .collect()
}

pub fn inventory_info(id: &str) -> InventoryInfo {
    InventoryInfo::new(id, format!("inventory-{id}"), "rudder-system")
}

pub struct Fixture {
    pub cluster: Arc<FakeCluster>,
    pub applier: Applier,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub info: InventoryInfo,
}

impl Fixture {
    pub fn new(target: SyncTarget, inventory_id: &str, options: ApplyOptions) -> Self {
        init_tracing();
        let cluster = Arc::new(FakeCluster::new());
        let (applier, events) = Applier::new(
            Arc::clone(&cluster) as Arc<dyn DynamicClient>,
            Arc::clone(&cluster) as Arc<dyn StatusReader>,
            target,
            options,
        );
        Self {
            cluster,
            applier,
            events,
            info: inventory_info(inventory_id),
        }
    }

    pub fn root(inventory_id: &str) -> Self {
        Self::new(
            SyncTarget::root("root-sync"),
            inventory_id,
            ApplyOptions::from_config(&SyncConfig::default()),
        )
    }

    pub fn inventory_client(&self) -> InventoryClient {
        InventoryClient::new(Arc::clone(&self.cluster) as Arc<dyn DynamicClient>)
    }

    /// Drains every buffered event.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
