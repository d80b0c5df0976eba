//! Updater cycle semantics and full engine loop behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config_map, init_tracing, inventory_info};
use rudder_core::cluster::{ClusterError, DynamicClient, FakeCluster, StatusReader};
use rudder_core::config::SyncConfig;
use rudder_core::{DeclaredResources, MultiError, ObjectId, SyncTarget};
use rudder_sync::applier::{Applier, ApplyOptions};
use rudder_sync::engine::{SourceCommit, SyncEngine};
use rudder_sync::remediator::Remediator;
use rudder_sync::updater::{CommitCache, Updater};
use tokio_util::sync::CancellationToken;

struct UpdaterFixture {
    cluster: Arc<FakeCluster>,
    updater: Updater,
    remediator: Arc<Remediator>,
    store: Arc<DeclaredResources>,
}

fn updater_fixture() -> UpdaterFixture {
    init_tracing();
    let cluster = Arc::new(FakeCluster::new());
    let store = Arc::new(DeclaredResources::new());
    let target = SyncTarget::root("root-sync");
    let config = SyncConfig::default();
    let remediator = Arc::new(Remediator::new(
        target.clone(),
        Arc::clone(&store),
        Arc::clone(&cluster) as Arc<dyn DynamicClient>,
        "inv-1".to_string(),
        &config,
    ));
    let (applier, _events) = Applier::new(
        Arc::clone(&cluster) as Arc<dyn DynamicClient>,
        Arc::clone(&cluster) as Arc<dyn StatusReader>,
        target,
        ApplyOptions::from_config(&config),
    );
    let updater = Updater::new(
        Arc::clone(&store),
        Arc::clone(&remediator),
        Arc::new(applier),
        inventory_info("inv-1"),
    );
    UpdaterFixture {
        cluster,
        updater,
        remediator,
        store,
    }
}

#[tokio::test]
async fn test_partial_progress_resumes_after_transient_apply_failure() {
    let fixture = updater_fixture();
    let cancel = CancellationToken::new();
    let cm_id = ObjectId::new("", "ConfigMap", "ns", "cm");

    // Force the apply step to fail transiently after declare succeeds.
    fixture.cluster.set_apply_failure(
        cm_id.clone(),
        ClusterError::Internal {
            message: "transient server failure".to_string(),
        },
    );

    let mut cache = CommitCache::new(
        "rev-1",
        vec![config_map("ns", "cm", "v1")],
        MultiError::new(),
    );
    let errors = fixture.updater.update(&cancel, &mut cache, "").await;
    assert!(!errors.is_empty());

    // Declare succeeded and its flag persists; apply did not.
    assert!(cache.declared_resources_updated);
    assert!(!cache.applied);
    assert!(!cache.watches_updated);
    assert_eq!(fixture.store.revision(), "rev-1");

    // The next trigger skips re-declare and proceeds directly to apply.
    fixture.cluster.clear_apply_failure(&cm_id);
    let errors = fixture.updater.update(&cancel, &mut cache, "").await;
    assert!(errors.is_empty(), "{errors}");
    assert!(cache.fully_synced());
    assert!(fixture.cluster.get(&cm_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_parse_errors_force_retry_without_clearing_progress() {
    let fixture = updater_fixture();
    let cancel = CancellationToken::new();

    let mut parse_errors = MultiError::new();
    parse_errors.push(rudder_core::SyncError::Parse {
        message: "unparsable trailing document".to_string(),
    });
    let mut cache = CommitCache::new("rev-1", vec![config_map("ns", "cm", "v1")], parse_errors);

    let errors = fixture.updater.update(&cancel, &mut cache, "").await;
    // The cycle itself ran clean, but no step is marked done while parser
    // errors persist.
    assert!(errors.is_empty(), "{errors}");
    assert!(!cache.declared_resources_updated);
    assert!(!cache.applied);
    assert!(!cache.watches_updated);

    cache.advance("rev-1", vec![config_map("ns", "cm", "v1")], MultiError::new());
    let errors = fixture.updater.update(&cancel, &mut cache, "").await;
    assert!(errors.is_empty(), "{errors}");
    assert!(cache.fully_synced());
}

#[tokio::test]
async fn test_watches_match_declared_gvks_after_cycle() {
    let fixture = updater_fixture();
    let cancel = CancellationToken::new();

    let mut cache = CommitCache::new(
        "rev-1",
        vec![
            config_map("ns", "cm", "v1"),
            common::role("ns", "pods"),
        ],
        MultiError::new(),
    );
    let errors = fixture.updater.update(&cancel, &mut cache, "").await;
    assert!(errors.is_empty(), "{errors}");

    let (declared_gvks, _) = fixture.store.declared_gvks();
    assert_eq!(fixture.remediator.watched_gvks(), declared_gvks);
    // The remediator resumed after the successful cycle.
    assert!(!fixture.remediator.is_paused());
}

#[tokio::test]
async fn test_remediator_stays_paused_after_failed_cycle() {
    let fixture = updater_fixture();
    let cancel = CancellationToken::new();
    let cm_id = ObjectId::new("", "ConfigMap", "ns", "cm");
    fixture.cluster.set_apply_failure(
        cm_id,
        ClusterError::Internal {
            message: "boom".to_string(),
        },
    );

    let mut cache = CommitCache::new(
        "rev-1",
        vec![config_map("ns", "cm", "v1")],
        MultiError::new(),
    );
    let errors = fixture.updater.update(&cancel, &mut cache, "").await;
    assert!(!errors.is_empty());
    assert!(fixture.remediator.is_paused());
}

#[tokio::test]
async fn test_cycles_serialize_on_one_updater() {
    let fixture = updater_fixture();
    let updater = Arc::new(fixture.updater);
    let cancel = CancellationToken::new();

    // Two concurrent triggers for the same revision: the cycle mutex
    // serializes them, and the second finds all work already done.
    let first = {
        let updater = Arc::clone(&updater);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut cache = CommitCache::new(
                "rev-1",
                vec![config_map("ns", "a", "v1")],
                MultiError::new(),
            );
            updater.update(&cancel, &mut cache, "").await
        })
    };
    let second = {
        let updater = Arc::clone(&updater);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut cache = CommitCache::new(
                "rev-1",
                vec![config_map("ns", "a", "v1")],
                MultiError::new(),
            );
            updater.update(&cancel, &mut cache, "").await
        })
    };
    assert!(first.await.unwrap().is_empty());
    assert!(second.await.unwrap().is_empty());
    assert!(!updater.updating());
}

#[tokio::test]
async fn test_engine_loop_reconciles_pushed_source() {
    init_tracing();
    let cluster = Arc::new(FakeCluster::new());
    let config = SyncConfig {
        sync_period: Duration::from_secs(3600),
        status_update_period: Duration::ZERO,
        namespace_sync_period: Duration::ZERO,
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(
        SyncTarget::root("root-sync"),
        Arc::clone(&cluster) as Arc<dyn DynamicClient>,
        Arc::clone(&cluster) as Arc<dyn StatusReader>,
        inventory_info("inv-1"),
        &config,
    );
    let handle = engine.handle();
    let cancel = CancellationToken::new();
    let engine_task = tokio::spawn(engine.run(cancel.clone()));

    assert!(
        handle
            .push_source(SourceCommit {
                revision: "rev-1".to_string(),
                objects: vec![config_map("ns", "cm", "v1")],
                parse_errors: MultiError::new(),
            })
            .await
    );

    let cm_id = ObjectId::new("", "ConfigMap", "ns", "cm");
    let mut applied = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if cluster.get(&cm_id).await.unwrap().is_some() {
            applied = true;
            break;
        }
    }
    assert!(applied, "engine never applied the pushed source");
    assert!(handle.errors().is_empty());

    cancel.cancel();
    engine_task.await.unwrap();
}
