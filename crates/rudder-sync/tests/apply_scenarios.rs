//! End-to-end apply and prune scenarios against the in-memory cluster.

mod common;

use common::{config_map, namespace, objects, Fixture};
use rudder_core::cluster::DynamicClient;
use rudder_core::config::{NamespaceStrategy, SyncConfig};
use rudder_core::inventory::Actuation;
use rudder_core::metadata::{
    DEPENDS_ON_ANNOTATION, LIFECYCLE_DELETION_ANNOTATION, LIFECYCLE_DETACH, MANAGER_LABEL,
};
use rudder_core::{ObjectId, SyncError, SyncTarget};
use rudder_sync::applier::{ApplyOptions, ApplyOutcome, Event, PruneOutcome};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn cm_id(ns: &str, name: &str) -> ObjectId {
    ObjectId::new("", "ConfigMap", ns, name)
}

fn ns_id(name: &str) -> ObjectId {
    ObjectId::new("", "Namespace", "", name)
}

#[tokio::test]
async fn test_implicit_namespace_created_for_root_sync() {
    let fixture = Fixture::root("inv-1");
    fixture.cluster.enforce_namespaces(true);
    let cancel = CancellationToken::new();

    let errors = fixture
        .applier
        .run(
            &cancel,
            &fixture.info,
            objects(vec![config_map("foo", "cm1", "v1")]),
            "rev-1",
        )
        .await;
    assert!(errors.is_empty(), "clean run expected: {errors}");

    // The namespace was created implicitly with the prevent-deletion
    // lifecycle annotation.
    let ns = fixture.cluster.get(&ns_id("foo")).await.unwrap().unwrap();
    assert_eq!(
        ns.annotation(LIFECYCLE_DELETION_ANNOTATION),
        Some(LIFECYCLE_DETACH)
    );
    assert!(fixture.cluster.get(&cm_id("foo", "cm1")).await.unwrap().is_some());

    // The inventory lists both.
    let inventory = fixture
        .inventory_client()
        .get(&fixture.info)
        .await
        .unwrap()
        .unwrap();
    assert!(inventory.contains(&ns_id("foo")));
    assert!(inventory.contains(&cm_id("foo", "cm1")));
}

#[tokio::test]
async fn test_explicit_strategy_blocks_implicit_namespace() {
    let options = ApplyOptions {
        namespace_strategy: NamespaceStrategy::Explicit,
        ..ApplyOptions::from_config(&SyncConfig::default())
    };
    let fixture = Fixture::new(SyncTarget::root("root-sync"), "inv-1", options);
    fixture.cluster.enforce_namespaces(true);
    let cancel = CancellationToken::new();

    let errors = fixture
        .applier
        .run(
            &cancel,
            &fixture.info,
            objects(vec![config_map("foo", "cm1", "v1")]),
            "rev-1",
        )
        .await;

    // The apply failed because the namespace does not exist.
    assert_eq!(errors.len(), 1);
    let rendered = errors.to_string();
    assert!(
        rendered.contains("namespaces \"foo\" not found"),
        "unexpected error: {rendered}"
    );

    // No namespace was created; the inventory records cm1 as not applied.
    assert!(fixture.cluster.get(&ns_id("foo")).await.unwrap().is_none());
    let inventory = fixture
        .inventory_client()
        .get(&fixture.info)
        .await
        .unwrap()
        .unwrap();
    let record = inventory.record(&cm_id("foo", "cm1")).unwrap();
    assert_eq!(record.actuation, Actuation::Failed);
}

#[tokio::test]
async fn test_namespace_in_use_is_not_pruned() {
    let mut fixture = Fixture::root("inv-1");
    let cancel = CancellationToken::new();

    let errors = fixture
        .applier
        .run(
            &cancel,
            &fixture.info,
            objects(vec![namespace("foo"), config_map("foo", "cm1", "v1")]),
            "rev-1",
        )
        .await;
    assert!(errors.is_empty(), "{errors}");
    fixture.drain_events();

    // The namespace leaves the source while cm1 remains declared.
    let errors = fixture
        .applier
        .run(
            &cancel,
            &fixture.info,
            objects(vec![config_map("foo", "cm1", "v1")]),
            "rev-2",
        )
        .await;
    assert!(errors.is_empty(), "{errors}");

    let events = fixture.drain_events();
    let skip = events
        .iter()
        .find_map(|event| match event {
            Event::Prune {
                id,
                outcome: PruneOutcome::Skipped,
                reason: Some(reason),
                ..
            } if *id == ns_id("foo") => Some(reason.clone()),
            _ => None,
        })
        .expect("namespace prune should be skipped");
    assert_eq!(skip, "namespace still in use");
    assert_eq!(
        format!("skipped delete of {}: {skip}", ns_id("foo")),
        "skipped delete of Namespace, /foo: namespace still in use"
    );

    // Namespace and cm1 both remain, live and inventoried.
    assert!(fixture.cluster.get(&ns_id("foo")).await.unwrap().is_some());
    assert!(fixture.cluster.get(&cm_id("foo", "cm1")).await.unwrap().is_some());
    let inventory = fixture
        .inventory_client()
        .get(&fixture.info)
        .await
        .unwrap()
        .unwrap();
    assert!(inventory.contains(&ns_id("foo")));
    assert!(inventory.contains(&cm_id("foo", "cm1")));
}

#[tokio::test]
async fn test_second_cycle_is_idempotent_and_inventory_covers_snapshot() {
    let mut fixture = Fixture::root("inv-1");
    let cancel = CancellationToken::new();
    let declared = vec![config_map("ns", "a", "v1"), config_map("ns", "b", "v1")];

    let errors = fixture
        .applier
        .run(&cancel, &fixture.info, objects(declared.clone()), "rev-1")
        .await;
    assert!(errors.is_empty(), "{errors}");
    fixture.drain_events();

    // After a successful cycle at rev-1, the inventory ID set equals the
    // snapshot ID set.
    let inventory = fixture
        .inventory_client()
        .get(&fixture.info)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inventory.ids(), vec![cm_id("ns", "a"), cm_id("ns", "b")]);
    for id in inventory.ids() {
        let record = inventory.record(&id).unwrap();
        assert_eq!(record.actuation, Actuation::Succeeded);
        assert_eq!(record.revision, "rev-1");
    }

    // A second cycle with the same revision and no drift produces zero
    // mutations: every apply is unchanged, nothing is pruned.
    let errors = fixture
        .applier
        .run(&cancel, &fixture.info, objects(declared), "rev-1")
        .await;
    assert!(errors.is_empty(), "{errors}");

    let events = fixture.drain_events();
    for event in &events {
        match event {
            Event::Apply { outcome, id, .. } => {
                assert_eq!(*outcome, ApplyOutcome::Unchanged, "unexpected mutation of {id}");
            }
            Event::Prune { id, .. } => panic!("nothing should be pruned, got prune of {id}"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_dependency_order_on_apply_and_prune() {
    let mut fixture = Fixture::root("inv-1");
    let cancel = CancellationToken::new();

    let mut dependent = config_map("ns", "app", "v1");
    dependent["metadata"]["annotations"] = json!({ (DEPENDS_ON_ANNOTATION): "/ConfigMap/ns/base" });
    let declared = vec![dependent, config_map("ns", "base", "v1")];

    let errors = fixture
        .applier
        .run(&cancel, &fixture.info, objects(declared), "rev-1")
        .await;
    assert!(errors.is_empty(), "{errors}");

    let events = fixture.drain_events();
    let apply_order: Vec<ObjectId> = events
        .iter()
        .filter_map(|event| match event {
            Event::Apply { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(apply_order, vec![cm_id("ns", "base"), cm_id("ns", "app")]);

    // Removing everything prunes in reverse order: the dependent goes
    // before its prerequisite.
    let errors = fixture
        .applier
        .run(&cancel, &fixture.info, Vec::new(), "rev-2")
        .await;
    assert!(errors.is_empty(), "{errors}");

    let events = fixture.drain_events();
    let prune_order: Vec<ObjectId> = events
        .iter()
        .filter_map(|event| match event {
            Event::Prune {
                id,
                outcome: PruneOutcome::Pruned,
                ..
            } => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(prune_order, vec![cm_id("ns", "app"), cm_id("ns", "base")]);
    // Only the inventory object itself remains live.
    assert_eq!(fixture.cluster.len(), 1);
}

#[tokio::test]
async fn test_apply_revert_apply_round_trips() {
    let fixture = Fixture::root("inv-1");
    let cancel = CancellationToken::new();

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
    let first = fixture.cluster.get(&cm_id("ns", "cm")).await.unwrap().unwrap();

    let errors = fixture
        .applier
        .run(
            &cancel,
            &fixture.info,
            objects(vec![config_map("ns", "cm", "v2")]),
            "rev-2",
        )
        .await;
    assert!(errors.is_empty(), "{errors}");
    let second = fixture.cluster.get(&cm_id("ns", "cm")).await.unwrap().unwrap();
    assert_ne!(first, second);

    // Reverting to the previous snapshot reaches a state equal to the
    // first application.
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
    let third = fixture.cluster.get(&cm_id("ns", "cm")).await.unwrap().unwrap();
    assert_eq!(first, third);
}

#[tokio::test]
async fn test_validation_exit_early_aborts_before_mutation() {
    let fixture = Fixture::root("inv-1");
    let cancel = CancellationToken::new();

    // Duplicate IDs are rejected and nothing reaches the cluster.
    let errors = fixture
        .applier
        .run(
            &cancel,
            &fixture.info,
            objects(vec![
                config_map("ns", "dup", "v1"),
                config_map("ns", "dup", "v2"),
            ]),
            "rev-1",
        )
        .await;
    assert!(!errors.is_empty());
    assert!(matches!(
        errors.errors()[0],
        SyncError::Validation { .. }
    ));
    assert!(fixture.cluster.is_empty());
    assert!(fixture
        .inventory_client()
        .get(&fixture.info)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_destroyer_tears_down_everything_owned() {
    let fixture = Fixture::root("inv-1");
    let cancel = CancellationToken::new();

    let errors = fixture
        .applier
        .run(
            &cancel,
            &fixture.info,
            objects(vec![
                config_map("ns", "a", "v1"),
                config_map("ns", "b", "v1"),
            ]),
            "rev-1",
        )
        .await;
    assert!(errors.is_empty(), "{errors}");
    assert_eq!(fixture.cluster.len(), 3);

    let errors = fixture.applier.destroyer().run(&cancel, &fixture.info).await;
    assert!(errors.is_empty(), "{errors}");

    // Owned objects and the inventory itself are gone.
    assert!(fixture.cluster.is_empty());
    assert!(fixture
        .inventory_client()
        .get(&fixture.info)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_manager_label_stamped_on_applied_objects() {
    let mut fixture = Fixture::root("inv-1");
    let cancel = CancellationToken::new();

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

    let live = fixture.cluster.get(&cm_id("ns", "cm")).await.unwrap().unwrap();
    assert_eq!(live.label(MANAGER_LABEL), Some(":root_root-sync"));
    assert_eq!(
        live.annotation(rudder_core::metadata::INVENTORY_ID_ANNOTATION),
        Some("inv-1")
    );
    assert_eq!(
        live.label(rudder_core::metadata::DECLARED_VERSION_LABEL),
        Some("rev-1")
    );
    fixture.drain_events();
}
