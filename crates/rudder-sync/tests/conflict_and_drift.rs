//! Multi-sync conflict safety and drift correction scenarios.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{config_map, init_tracing, objects, role, Fixture};
use rudder_core::cluster::{DynamicClient, FakeCluster};
use rudder_core::config::SyncConfig;
use rudder_core::metadata::MANAGER_LABEL;
use rudder_core::object::Gvk;
use rudder_core::{DeclaredResources, ObjectId, SyncError, SyncTarget};
use rudder_sync::applier::{Applier, ApplyOptions};
use rudder_sync::remediator::Remediator;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_two_root_syncs_compete_for_one_object() {
    init_tracing();
    let cancel = CancellationToken::new();
    let cluster = Arc::new(FakeCluster::new());
    let role_id = ObjectId::new("rbac.authorization.k8s.io", "Role", "ns", "pods");

    let mk_applier = |name: &str| {
        Applier::new(
            Arc::clone(&cluster) as Arc<dyn DynamicClient>,
            Arc::clone(&cluster) as _,
            SyncTarget::root(name),
            ApplyOptions::default(),
        )
        .0
    };
    let applier_a = mk_applier("sync-a");
    let applier_b = mk_applier("sync-b");
    let info_a = common::inventory_info("inv-a");
    let info_b = common::inventory_info("inv-b");

    // The first sync to apply wins.
    let errors = applier_a
        .run(&cancel, &info_a, objects(vec![role("ns", "pods")]), "rev-a1")
        .await;
    assert!(errors.is_empty(), "{errors}");

    // The second sync declares the same object and loses.
    let errors = applier_b
        .run(&cancel, &info_b, objects(vec![role("ns", "pods")]), "rev-b1")
        .await;
    assert_eq!(errors.len(), 1);
    let conflict = &errors.errors()[0];
    assert!(matches!(conflict, SyncError::ManagementConflict { .. }));
    assert!(conflict.to_string().contains("detected a management conflict"));

    // The conflict stays visible on the loser's aggregated errors.
    assert_eq!(applier_b.errors().len(), 1);

    // The role's content and manager label remain those of the winner.
    let live = cluster.get(&role_id).await.unwrap().unwrap();
    assert_eq!(live.label(MANAGER_LABEL), Some(":root_sync-a"));
    assert_eq!(
        live.annotation(rudder_core::metadata::INVENTORY_ID_ANNOTATION),
        Some("inv-a")
    );

    // The loser never modified the object and never recorded ownership.
    let inventory_b = rudder_core::inventory::InventoryClient::new(
        Arc::clone(&cluster) as Arc<dyn DynamicClient>,
    )
    .get(&info_b)
    .await
    .unwrap()
    .unwrap();
    let record = inventory_b.record(&role_id).unwrap();
    assert_ne!(record.actuation, rudder_core::inventory::Actuation::Succeeded);
}

#[tokio::test]
async fn test_drift_corrected_to_declared_value() {
    init_tracing();
    let cancel = CancellationToken::new();
    let fixture = Fixture::root("inv-1");
    let cm_id = ObjectId::new("", "ConfigMap", "ns", "cm");

    // Sync the declared value through the applier.
    let errors = fixture
        .applier
        .run(
            &cancel,
            &fixture.info,
            objects(vec![config_map("ns", "cm", "v1")]),
            "rev-1",
        )
        .await;
    assert!(errors.is_empty(), "{errors}");

    // Stand up a remediator over the same cluster with the same snapshot.
    let store = Arc::new(DeclaredResources::new());
    store
        .update(vec![config_map("ns", "cm", "v1")], "rev-1", "")
        .unwrap();
    let config = SyncConfig {
        fight_threshold: 3,
        ..SyncConfig::default()
    };
    let remediator = Remediator::new(
        SyncTarget::root("root-sync"),
        store,
        Arc::clone(&fixture.cluster) as Arc<dyn DynamicClient>,
        "inv-1".to_string(),
        &config,
    );
    remediator.update_watches(&HashSet::from([Gvk::core("v1", "ConfigMap")]), "rev-1");
    remediator.resume();
    tokio::task::yield_now().await;

    // An external actor patches the declared value.
    let mut live = fixture.cluster.get(&cm_id).await.unwrap().unwrap();
    live.set_field("data.k", json!("v2")).unwrap();
    fixture.cluster.apply(&live).await.unwrap();

    // Within one remediator cycle the declared value is restored.
    for _ in 0..100 {
        tokio::task::yield_now().await;
        let current = fixture.cluster.get(&cm_id).await.unwrap().unwrap();
        if current.field("data.k") == Some(&json!("v1")) {
            break;
        }
    }
    let corrected = fixture.cluster.get(&cm_id).await.unwrap().unwrap();
    assert_eq!(corrected.field("data.k"), Some(&json!("v1")));

    // A single correction is below the fight threshold.
    assert!(remediator.fight_errors().is_empty());
    remediator.shutdown().await;
}
