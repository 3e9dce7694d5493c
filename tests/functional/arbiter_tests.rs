//! Ownership arbitration across several observers.
//!
//! The arbiter starts real namespace controllers against the mock cluster,
//! so effects of a promotion show up asynchronously and are awaited with
//! [`wait_for`].

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;

use sdi_observer_operator::ClusterApi;
use sdi_observer_operator::HealthState;
use sdi_observer_operator::config::ControllerSettings;
use sdi_observer_operator::controller::arbiter::Arbiter;
use sdi_observer_operator::controller::error::Error;
use sdi_observer_operator::controller::namespace_controller::NamespaceController;
use sdi_observer_operator::controller::status::find_condition;
use sdi_observer_operator::crd::{ConditionStatus, ConditionType, ObserverKey, reasons};

use crate::mock_cluster::{MockCluster, wait_for};

const SDI: &str = "sdi";

fn arbiter(cluster: &Arc<MockCluster>) -> Arbiter {
    arbiter_with_health(cluster, None)
}

fn arbiter_with_health(cluster: &Arc<MockCluster>, health: Option<Arc<HealthState>>) -> Arbiter {
    let client: Arc<dyn ClusterApi> = cluster.clone();
    Arbiter::new(client, ControllerSettings::default(), health)
}

fn route_owner(cluster: &MockCluster) -> Option<String> {
    cluster
        .route(SDI, "vsystem")
        .and_then(|route| route.annotations().get("operator-sdk/primary-resource").cloned())
}

fn backup_status(cluster: &MockCluster, key: &ObserverKey) -> Option<(ConditionStatus, String, String)> {
    cluster
        .condition(key, ConditionType::Backup)
        .map(|c| (c.status, c.reason, c.message))
}

/// `a` owns `sdi` from its own namespace; `b` asks for it explicitly from `ops`.
async fn owner_and_backup(cluster: &Arc<MockCluster>, arbiter: &Arbiter) -> (ObserverKey, ObserverKey) {
    cluster.add_sdi_installation(SDI);
    let a = cluster.add_observer(SDI, "a", "", 100);
    let b = cluster.add_observer("ops", "b", SDI, 200);
    arbiter.reconcile(&a).await.unwrap();
    arbiter.reconcile(&b).await.unwrap();
    wait_for("route of a", || route_owner(cluster).as_deref() == Some("sdi/a")).await;
    (a, b)
}

// =============================================================================
// Claiming a namespace
// =============================================================================

#[tokio::test]
async fn test_first_observer_becomes_owner() {
    let cluster = Arc::new(MockCluster::new());
    cluster.add_sdi_installation(SDI);
    let a = cluster.add_observer(SDI, "a", "", 100);
    let arbiter = arbiter(&cluster);

    arbiter.reconcile(&a).await.unwrap();

    let snapshot = arbiter.snapshot().await;
    assert_eq!(snapshot.owner_of(SDI), Some(&a));
    assert!(snapshot.is_consistent());
    assert!(arbiter.is_running(&a).await);
    assert_eq!(cluster.event_reasons(&a), vec!["Promoted"]);
    let (status, reason, _) = backup_status(&cluster, &a).unwrap();
    assert_eq!(status, ConditionStatus::False);
    assert_eq!(reason, reasons::ACTIVE);

    wait_for("vsystem route", || cluster.route(SDI, "vsystem").is_some()).await;
    wait_for("ready condition", || {
        cluster
            .condition(&a, ConditionType::Ready)
            .is_some_and(|c| c.status == ConditionStatus::True)
    })
    .await;
}

#[tokio::test]
async fn test_second_observer_becomes_backup() {
    let cluster = Arc::new(MockCluster::new());
    let arbiter = arbiter(&cluster);
    let (a, b) = owner_and_backup(&cluster, &arbiter).await;

    let (status, reason, message) = backup_status(&cluster, &b).unwrap();
    assert_eq!(status, ConditionStatus::True);
    assert_eq!(reason, reasons::ALREADY_MANAGED);
    assert!(message.contains("sdi/a"), "{message}");
    let ready = cluster.condition(&b, ConditionType::Ready).unwrap();
    assert_eq!(ready.status, ConditionStatus::Unknown);
    assert_eq!(ready.reason, reasons::BACKUP);

    let snapshot = arbiter.snapshot().await;
    assert_eq!(snapshot.owner_of(SDI), Some(&a));
    assert_eq!(snapshot.running.len(), 1);
    assert!(snapshot.backups.contains(&b));
    assert!(snapshot.is_consistent());
    assert!(!arbiter.is_running(&b).await);
    assert_eq!(cluster.watch_count(), 1);
}

#[tokio::test]
async fn test_backup_reconcile_is_idempotent() {
    let cluster = Arc::new(MockCluster::new());
    let arbiter = arbiter(&cluster);
    let (_a, b) = owner_and_backup(&cluster, &arbiter).await;
    let version = cluster.observer(&b).metadata.resource_version;

    arbiter.reconcile(&b).await.unwrap();
    arbiter.reconcile(&b).await.unwrap();

    assert_eq!(cluster.event_reasons(&b), vec!["Backup"]);
    assert_eq!(cluster.observer(&b).metadata.resource_version, version);
}

#[tokio::test]
async fn test_owner_reconcile_is_forwarded() {
    let cluster = Arc::new(MockCluster::new());
    let arbiter = arbiter(&cluster);
    let (a, _b) = owner_and_backup(&cluster, &arbiter).await;

    arbiter.reconcile(&a).await.unwrap();

    assert_eq!(cluster.event_reasons(&a), vec!["Promoted"]);
    assert!(arbiter.is_running(&a).await);
    assert_eq!(cluster.watch_count(), 1);
}

// =============================================================================
// Hand-off
// =============================================================================

#[tokio::test]
async fn test_hand_off_to_backup() {
    let cluster = Arc::new(MockCluster::new());
    let arbiter = arbiter(&cluster);
    let (a, b) = owner_and_backup(&cluster, &arbiter).await;
    let uid = cluster.route(SDI, "vsystem").unwrap().metadata.uid;

    cluster.delete_observer(&a);
    arbiter.reconcile(&a).await.unwrap();

    let snapshot = arbiter.snapshot().await;
    assert_eq!(snapshot.owner_of(SDI), Some(&b));
    assert!(!snapshot.desired.contains_key(&a));
    assert!(snapshot.backups.is_empty());
    assert!(snapshot.is_consistent());
    assert!(cluster.event_reasons(&b).contains(&"HandOff"));
    let (status, reason, _) = backup_status(&cluster, &b).unwrap();
    assert_eq!(status, ConditionStatus::False);
    assert_eq!(reason, reasons::ACTIVE);

    // The existing route is adopted, not recreated.
    wait_for("route adopted by b", || route_owner(&cluster).as_deref() == Some("ops/b")).await;
    assert_eq!(cluster.route(SDI, "vsystem").unwrap().metadata.uid, uid);
}

#[tokio::test]
async fn test_hand_off_on_pending_deletion() {
    let cluster = Arc::new(MockCluster::new());
    let arbiter = arbiter(&cluster);
    let (a, b) = owner_and_backup(&cluster, &arbiter).await;

    cluster.start_deleting_observer(&a);
    arbiter.reconcile(&a).await.unwrap();

    let snapshot = arbiter.snapshot().await;
    assert_eq!(snapshot.owner_of(SDI), Some(&b));
    assert!(!snapshot.desired.contains_key(&a));
    assert!(!arbiter.is_running(&a).await);
    assert!(arbiter.is_running(&b).await);
}

#[tokio::test]
async fn test_explicit_request_wins_election() {
    let cluster = Arc::new(MockCluster::new());
    cluster.add_sdi_installation(SDI);
    let a = cluster.add_observer(SDI, "a", "", 100);
    let implicit = cluster.add_observer(SDI, "implicit", "", 50);
    let explicit = cluster.add_observer("ops", "explicit", SDI, 300);
    let arbiter = arbiter(&cluster);
    for key in [&a, &implicit, &explicit] {
        arbiter.reconcile(key).await.unwrap();
    }
    assert_eq!(arbiter.snapshot().await.owner_of(SDI), Some(&a));

    cluster.delete_observer(&a);
    arbiter.reconcile(&a).await.unwrap();

    let snapshot = arbiter.snapshot().await;
    assert_eq!(snapshot.owner_of(SDI), Some(&explicit));
    assert!(snapshot.backups.contains(&implicit));
    let (status, _, message) = backup_status(&cluster, &implicit).unwrap();
    assert_eq!(status, ConditionStatus::True);
    assert!(message.contains("ops/explicit"), "{message}");
}

#[tokio::test]
async fn test_departure_without_candidates_stops_controller() {
    let cluster = Arc::new(MockCluster::new());
    cluster.add_sdi_installation(SDI);
    let a = cluster.add_observer(SDI, "a", "", 100);
    let arbiter = arbiter(&cluster);
    arbiter.reconcile(&a).await.unwrap();
    assert_eq!(cluster.watch_count(), 1);

    cluster.delete_observer(&a);
    arbiter.reconcile(&a).await.unwrap();

    let snapshot = arbiter.snapshot().await;
    assert!(snapshot.active.is_empty());
    assert!(snapshot.running.is_empty());
    assert!(snapshot.desired.is_empty());
    wait_for("watches released", || cluster.watch_count() == 0).await;
}

#[tokio::test]
async fn test_unknown_observer_departure_is_a_no_op() {
    let cluster = Arc::new(MockCluster::new());
    let arbiter = arbiter(&cluster);

    arbiter
        .reconcile(&ObserverKey::new(SDI, "never-seen"))
        .await
        .unwrap();

    assert_eq!(arbiter.snapshot().await, Default::default());
}

// =============================================================================
// Retargeting
// =============================================================================

#[tokio::test]
async fn test_retargeted_owner_hands_off() {
    let cluster = Arc::new(MockCluster::new());
    let arbiter = arbiter(&cluster);
    let (a, b) = owner_and_backup(&cluster, &arbiter).await;
    cluster.add_sdi_installation("other");

    cluster.update_observer(&a, |observer| {
        observer.spec.sdi_namespace = "other".to_string();
    });
    arbiter.reconcile(&a).await.unwrap();

    let snapshot = arbiter.snapshot().await;
    assert_eq!(snapshot.owner_of(SDI), Some(&b));
    assert_eq!(snapshot.owner_of("other"), Some(&a));
    assert_eq!(snapshot.running.len(), 2);
    assert!(snapshot.is_consistent());
    assert!(cluster.event_reasons(&b).contains(&"HandOff"));
    assert_eq!(cluster.event_reasons(&a), vec!["Promoted", "Promoted"]);

    wait_for("route adopted by b", || route_owner(&cluster).as_deref() == Some("ops/b")).await;
    wait_for("route in other namespace", || cluster.route("other", "vsystem").is_some()).await;
}

#[tokio::test]
async fn test_retargeting_to_owned_namespace_makes_backup() {
    let cluster = Arc::new(MockCluster::new());
    cluster.add_sdi_installation(SDI);
    cluster.add_sdi_installation("other");
    let a = cluster.add_observer(SDI, "a", "", 100);
    let c = cluster.add_observer("other", "c", "", 100);
    let arbiter = arbiter(&cluster);
    arbiter.reconcile(&a).await.unwrap();
    arbiter.reconcile(&c).await.unwrap();

    cluster.update_observer(&a, |observer| {
        observer.spec.sdi_namespace = "other".to_string();
    });
    arbiter.reconcile(&a).await.unwrap();

    let snapshot = arbiter.snapshot().await;
    assert_eq!(snapshot.owner_of("other"), Some(&c));
    assert_eq!(snapshot.owner_of(SDI), None);
    assert!(snapshot.backups.contains(&a));
    assert!(snapshot.is_consistent());
    let (status, _, message) = backup_status(&cluster, &a).unwrap();
    assert_eq!(status, ConditionStatus::True);
    assert!(message.contains("other/c"), "{message}");
}

#[tokio::test]
async fn test_demoted_owner_drops_active_status() {
    let cluster = Arc::new(MockCluster::new());
    cluster.add_sdi_installation(SDI);
    cluster.add_sdi_installation("other");
    let a = cluster.add_observer(SDI, "a", "", 100);
    let c = cluster.add_observer("other", "c", "", 100);
    let arbiter = arbiter(&cluster);
    arbiter.reconcile(&a).await.unwrap();
    arbiter.reconcile(&c).await.unwrap();
    wait_for("status of a", || {
        cluster.observer(&a).status.is_some_and(|status| {
            status.managed_data_hub_ref.is_some() && !status.vsystem_route.conditions.is_empty()
        })
    })
    .await;

    cluster.update_observer(&a, |observer| {
        observer.spec.sdi_namespace = "other".to_string();
    });
    arbiter.reconcile(&a).await.unwrap();

    let status = cluster.observer(&a).status.unwrap();
    let expected = [
        (ConditionType::Backup, ConditionStatus::True, reasons::ALREADY_MANAGED),
        (ConditionType::Ready, ConditionStatus::Unknown, reasons::BACKUP),
        (ConditionType::Progressing, ConditionStatus::Unknown, reasons::BACKUP),
        (ConditionType::Degraded, ConditionStatus::False, reasons::BACKUP),
    ];
    for (condition_type, condition_status, reason) in expected {
        let condition = find_condition(&status.conditions, condition_type).unwrap();
        assert_eq!(condition.status, condition_status, "{condition_type}");
        assert_eq!(condition.reason, reason, "{condition_type}");
    }
    assert!(status.managed_data_hub_ref.is_none());
    assert!(status.vsystem_route.conditions.is_empty());
    assert!(status.slcb_route.conditions.is_empty());
}

// =============================================================================
// Shutdown and metrics
// =============================================================================

#[tokio::test]
async fn test_shutdown_stops_all_controllers() {
    let cluster = Arc::new(MockCluster::new());
    cluster.add_sdi_installation(SDI);
    cluster.add_sdi_installation("other");
    let a = cluster.add_observer(SDI, "a", "", 100);
    let c = cluster.add_observer("other", "c", "", 100);
    let arbiter = arbiter(&cluster);
    arbiter.reconcile(&a).await.unwrap();
    arbiter.reconcile(&c).await.unwrap();
    assert_eq!(cluster.watch_count(), 2);

    arbiter.shutdown().await;

    assert!(arbiter.snapshot().await.running.is_empty());
    assert!(!arbiter.is_running(&a).await);
    wait_for("watches released", || cluster.watch_count() == 0).await;
}

#[tokio::test]
async fn test_ownership_metrics() {
    let cluster = Arc::new(MockCluster::new());
    let health = Arc::new(HealthState::new());
    let arbiter = arbiter_with_health(&cluster, Some(health.clone()));
    let (a, _b) = owner_and_backup(&cluster, &arbiter).await;

    let metrics = health.metrics.encode();
    assert!(metrics.contains("sdiobserver_namespace_controllers 1"), "{metrics}");
    assert!(metrics.contains("sdiobserver_backup_observers 1"), "{metrics}");

    cluster.delete_observer(&a);
    arbiter.reconcile(&a).await.unwrap();

    let metrics = health.metrics.encode();
    assert!(metrics.contains("sdiobserver_backup_observers 0"), "{metrics}");
    assert!(
        metrics.contains("sdiobserver_handoffs_total{target_namespace=\"sdi\"} 1"),
        "{metrics}"
    );
}

// =============================================================================
// Namespace controller lifecycle
// =============================================================================

fn start_controller(cluster: &Arc<MockCluster>, key: &ObserverKey) -> NamespaceController {
    let client: Arc<dyn ClusterApi> = cluster.clone();
    NamespaceController::start(
        client,
        key.clone(),
        SDI.to_string(),
        ControllerSettings::default(),
        None,
    )
}

#[tokio::test]
async fn test_controller_reconciles_on_request() {
    let cluster = Arc::new(MockCluster::new());
    cluster.add_sdi_installation(SDI);
    let a = cluster.add_observer(SDI, "a", "", 100);
    let mut controller = start_controller(&cluster, &a);

    controller.reconcile_now().unwrap();
    wait_for("vsystem route", || cluster.route(SDI, "vsystem").is_some()).await;

    controller.stop().await;
}

#[tokio::test]
async fn test_controller_reacts_to_watch_events() {
    let cluster = Arc::new(MockCluster::new());
    cluster.add_sdi_installation(SDI);
    let a = cluster.add_observer(SDI, "a", "", 100);
    let mut controller = start_controller(&cluster, &a);
    controller.reconcile_now().unwrap();
    wait_for("vsystem route", || cluster.route(SDI, "vsystem").is_some()).await;

    // Admission is only seen through the route watch.
    cluster.admit_route(SDI, "vsystem");
    wait_for("exposed condition", || {
        cluster.observer(&a).status.is_some_and(|status| {
            status
                .vsystem_route
                .conditions
                .iter()
                .any(|c| c.r#type == "Exposed" && c.status == ConditionStatus::True)
        })
    })
    .await;

    // A deleted route is recreated.
    cluster.delete_route(SDI, "vsystem").await.unwrap();
    wait_for("recreated route", || cluster.route(SDI, "vsystem").is_some()).await;

    controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_controller_rechecks_failed_datahub_lookup() {
    let cluster = Arc::new(MockCluster::new());
    cluster.add_sdi_installation(SDI);
    cluster.fail_datahub_lookups(SDI);
    let a = cluster.add_observer(SDI, "a", "", 100);
    let mut controller = start_controller(&cluster, &a);
    controller.reconcile_now().unwrap();
    wait_for("failed lookup", || {
        cluster
            .condition(&a, ConditionType::Ready)
            .is_some_and(|c| c.reason == reasons::FAILED_GET)
    })
    .await;

    // Nothing is watched that would tell the worker about the recovery.
    cluster.restore_datahub_lookups(SDI);
    assert!(cluster.route(SDI, "vsystem").is_none());

    tokio::time::advance(Duration::from_secs(30)).await;
    wait_for("timed re-check", || {
        cluster.route(SDI, "vsystem").is_some()
            && cluster
                .observer(&a)
                .status
                .is_some_and(|status| status.managed_data_hub_ref.is_some())
    })
    .await;

    controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_controller_requeues_after_error() {
    let cluster = Arc::new(MockCluster::new());
    cluster.add_sdi_installation(SDI);
    let a = cluster.add_observer(SDI, "a", "", 100);
    cluster.update_observer(&a, |observer| {
        observer.spec.vsystem_route.management_state = "Unmanaged".to_string();
    });
    // More conflicts than one pass retries.
    cluster.inject_status_conflicts(5);
    let mut controller = start_controller(&cluster, &a);
    controller.reconcile_now().unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(cluster.observer(&a).status.is_none());

    tokio::time::advance(Duration::from_secs(30)).await;
    wait_for("requeued pass", || cluster.observer(&a).status.is_some()).await;

    controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_controller_resyncs_periodically() {
    let cluster = Arc::new(MockCluster::new());
    cluster.add_sdi_installation(SDI);
    let a = cluster.add_observer(SDI, "a", "", 100);
    let client: Arc<dyn ClusterApi> = cluster.clone();
    let settings = ControllerSettings {
        resync_interval: Duration::from_secs(60),
        ..Default::default()
    };
    let mut controller = NamespaceController::start(client, a.clone(), SDI.to_string(), settings, None);
    controller.reconcile_now().unwrap();
    wait_for("vsystem route", || cluster.route(SDI, "vsystem").is_some()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Service removal is not announced to the worker.
    cluster.remove_vsystem_service(SDI);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(cluster.route(SDI, "vsystem").is_some());

    tokio::time::advance(Duration::from_secs(60)).await;
    wait_for("resync removes the route", || cluster.route(SDI, "vsystem").is_none()).await;

    controller.stop().await;
}

#[tokio::test]
async fn test_controller_stop_is_idempotent() {
    let cluster = Arc::new(MockCluster::new());
    let a = cluster.add_observer(SDI, "a", "", 100);
    let mut controller = start_controller(&cluster, &a);
    assert!(controller.is_running());
    assert_eq!(controller.namespace(), SDI);

    controller.stop().await;
    controller.stop().await;

    assert!(!controller.is_running());
    assert!(matches!(
        controller.reconcile_now(),
        Err(Error::ControllerStopped(_))
    ));
    assert_eq!(cluster.watch_count(), 0);
}
