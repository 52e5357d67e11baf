//! App lifecycle: create, scale, delete, fixed-mode validation.

mod harness;

use bosun_events::EventKind;
use bosun_manager::broker::BrokerCall;
use bosun_manager::state::{AppError, AppRunState, SlotState};
use harness::{big_offer, fixed_version, offer_with, replicates_version, TestCluster};

#[tokio::test]
async fn create_replicates_app_reaches_normal() {
    let cluster = TestCluster::start().await;
    let mut domain_events = cluster.bus.subscribe("test");

    let view = cluster
        .handle
        .create_app(replicates_version("web", 3))
        .await
        .unwrap();
    assert_eq!(view.state, AppRunState::Creating);
    assert_eq!(view.slots.len(), 3);
    assert!(view
        .slots
        .iter()
        .all(|s| s.state == SlotState::PendingOffer));

    let app_id = view.app_id.clone();
    assert_eq!(app_id.as_str(), "web-ops-c1");

    cluster.inject_offer(big_offer("o1"));
    let launch = cluster.next_call().await;
    let Some(BrokerCall::Launch { tasks, .. }) = launch else {
        panic!("expected a launch call, got {launch:?}");
    };
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.ports.len() == 1));

    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.slots.iter().all(|s| s.state == SlotState::Assigned))
                    .unwrap_or(false)
            },
            "all slots assigned",
        )
        .await;

    cluster.run_assigned_slots(&app_id).await;
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.state == AppRunState::Normal && v.running_instances == 3)
                    .unwrap_or(false)
            },
            "app normal with 3 running",
        )
        .await;

    // Every slot announced itself exactly once.
    let mut running_events = 0;
    while let Ok(event) = domain_events.try_recv() {
        if event.kind == EventKind::SlotRunning {
            running_events += 1;
        }
    }
    assert_eq!(running_events, 3);

    // All running slots bound to the current version.
    let view = cluster.handle.get_app(&app_id).unwrap();
    assert!(view.proposed_version_id.is_none());
    assert!(view
        .slots
        .iter()
        .all(|s| s.version_id == view.current_version_id));
}

#[tokio::test]
async fn scale_up_adds_contiguous_slots() {
    let cluster = TestCluster::start().await;
    let view = cluster
        .handle
        .create_app(replicates_version("web", 3))
        .await
        .unwrap();
    let app_id = view.app_id;

    cluster.inject_offer(big_offer("o1"));
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.slots.iter().all(|s| s.state == SlotState::Assigned))
                    .unwrap_or(false)
            },
            "slots assigned",
        )
        .await;
    cluster.run_assigned_slots(&app_id).await;
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.state == AppRunState::Normal)
                    .unwrap_or(false)
            },
            "app normal",
        )
        .await;

    cluster.handle.scale_up(app_id.clone(), 2, vec![]).await.unwrap();
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.state == AppRunState::ScaleUp && v.slots.len() == 5)
                    .unwrap_or(false)
            },
            "scale_up with 5 slots",
        )
        .await;

    cluster.inject_offer(big_offer("o2"));
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| {
                        v.slots
                            .iter()
                            .all(|s| s.state != SlotState::PendingOffer)
                    })
                    .unwrap_or(false)
            },
            "new slots assigned",
        )
        .await;
    cluster.run_assigned_slots(&app_id).await;

    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.state == AppRunState::Normal && v.running_instances == 5)
                    .unwrap_or(false)
            },
            "app normal with 5 running",
        )
        .await;

    // Indices are the contiguous range 0..5, in memory and in the store.
    let view = cluster.handle.get_app(&app_id).unwrap();
    let indices: Vec<u32> = view.slots.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    assert_eq!(view.instances, 5);

    let stored = cluster.store.load_app(&app_id).unwrap().unwrap();
    assert_eq!(stored.slots.len(), 5);
    assert_eq!(stored.versions.len(), 1);
}

#[tokio::test]
async fn scale_down_removes_highest_indices() {
    let cluster = TestCluster::start().await;
    let view = cluster
        .handle
        .create_app(replicates_version("web", 5))
        .await
        .unwrap();
    let app_id = view.app_id;

    cluster.inject_offer(big_offer("o1"));
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.slots.iter().all(|s| s.state == SlotState::Assigned))
                    .unwrap_or(false)
            },
            "slots assigned",
        )
        .await;
    cluster.run_assigned_slots(&app_id).await;
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.state == AppRunState::Normal)
                    .unwrap_or(false)
            },
            "app normal",
        )
        .await;

    cluster.handle.scale_down(app_id.clone(), 2).await.unwrap();
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.state == AppRunState::ScaleDown)
                    .unwrap_or(false)
            },
            "scale_down state",
        )
        .await;

    // Slots 4 and 3 are being killed; confirm both.
    let view = cluster.handle.get_app(&app_id).unwrap();
    for slot in view.slots.iter().filter(|s| s.mark_for_deletion) {
        assert!(slot.index >= 3);
        assert_eq!(slot.state, SlotState::Killing);
        cluster.inject_status(
            slot.task_id.clone(),
            bosun_manager::broker::TaskState::TaskKilled,
        );
    }

    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.state == AppRunState::Normal && v.slots.len() == 3)
                    .unwrap_or(false)
            },
            "app back to normal with 3 slots",
        )
        .await;

    let stored = cluster.store.load_app(&app_id).unwrap().unwrap();
    assert_eq!(stored.slots.len(), 3);
    assert_eq!(stored.meta.state, AppRunState::Normal);
}

#[tokio::test]
async fn fixed_mode_ip_mismatch_is_rejected_without_side_effects() {
    let cluster = TestCluster::start().await;

    let err = cluster
        .handle
        .create_app(fixed_version("db", 3, &["10.0.1.10", "10.0.1.11"]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // Nothing persisted, nothing visible.
    assert!(cluster.handle.list_apps().is_empty());
    assert!(cluster.store.list_apps().unwrap().is_empty());
    assert_eq!(cluster.ipam.reserved_count().unwrap(), 0);
}

#[tokio::test]
async fn delete_drains_slots_and_janitor_reaps_the_app() {
    let cluster = TestCluster::start().await;
    let mut domain_events = cluster.bus.subscribe("test");
    let view = cluster
        .handle
        .create_app(replicates_version("web", 2))
        .await
        .unwrap();
    let app_id = view.app_id;

    cluster.inject_offer(big_offer("o1"));
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.slots.iter().all(|s| s.state == SlotState::Assigned))
                    .unwrap_or(false)
            },
            "slots assigned",
        )
        .await;
    cluster.run_assigned_slots(&app_id).await;
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.state == AppRunState::Normal)
                    .unwrap_or(false)
            },
            "app normal",
        )
        .await;

    cluster.handle.delete_app(app_id.clone()).await.unwrap();
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.state == AppRunState::Deleting)
                    .unwrap_or(false)
            },
            "deleting state",
        )
        .await;

    let view = cluster.handle.get_app(&app_id).unwrap();
    for slot in &view.slots {
        cluster.inject_status(
            slot.task_id.clone(),
            bosun_manager::broker::TaskState::TaskKilled,
        );
    }

    // Janitor reaps once all slots are gone.
    cluster
        .wait_until(|| cluster.handle.get_app(&app_id).is_none(), "app reaped")
        .await;

    // Create→delete→list leaves the store without any key for the app.
    assert!(cluster.store.load_app(&app_id).unwrap().is_none());
    assert!(cluster
        .kv
        .scan_prefix(&format!("/v1/apps/{app_id}/"))
        .unwrap()
        .is_empty());

    // The sweep announces the deletion on the bus.
    let mut saw_app_deleted = false;
    while let Ok(event) = domain_events.try_recv() {
        if event.kind == EventKind::AppDeleted && event.app_id == app_id {
            saw_app_deleted = true;
        }
    }
    assert!(saw_app_deleted);
}

#[tokio::test]
async fn delete_of_pending_app_needs_no_broker() {
    let cluster = TestCluster::start().await;
    let view = cluster
        .handle
        .create_app(replicates_version("web", 2))
        .await
        .unwrap();
    let app_id = view.app_id;

    // Slots never launched; delete must finish without any task updates.
    cluster.handle.delete_app(app_id.clone()).await.unwrap();
    cluster
        .wait_until(|| cluster.handle.get_app(&app_id).is_none(), "app reaped")
        .await;
    assert!(cluster.store.list_apps().unwrap().is_empty());
}

#[tokio::test]
async fn fixed_mode_app_reserves_and_releases_ips() {
    let cluster = TestCluster::start().await;
    let view = cluster
        .handle
        .create_app(fixed_version("db", 2, &["10.0.5.20", "10.0.5.21"]))
        .await
        .unwrap();
    let app_id = view.app_id;
    assert_eq!(cluster.ipam.reserved_count().unwrap(), 2);

    // An offer without a routable subnet is declined outright.
    cluster.inject_offer(offer_with("o1", "agent-9", "agent-9.dc1", 8.0, 8192.0));
    let call = cluster.next_call().await;
    assert!(
        matches!(call, Some(BrokerCall::Decline { ref offer_ids }) if offer_ids.len() == 1),
        "expected a decline, got {call:?}"
    );

    // A routable one is matched; the launch carries the static IPs.
    let mut offer = offer_with("o2", "agent-1", "agent-1.dc1", 8.0, 8192.0);
    offer
        .attributes
        .insert("subnets".to_string(), "10.0.5.0/24".to_string());
    cluster.inject_offer(offer);
    let launch = cluster.next_call().await;
    let Some(BrokerCall::Launch { tasks, .. }) = launch else {
        panic!("expected launch, got {launch:?}");
    };
    let mut ips: Vec<_> = tasks.iter().map(|t| t.ip.clone().unwrap()).collect();
    ips.sort();
    assert_eq!(ips, vec!["10.0.5.20", "10.0.5.21"]);
    assert!(tasks.iter().all(|t| t.ports.is_empty()));

    cluster.run_assigned_slots(&app_id).await;
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.state == AppRunState::Normal)
                    .unwrap_or(false)
            },
            "fixed app normal",
        )
        .await;

    // Deletion returns the IPs to the pool.
    cluster.handle.delete_app(app_id.clone()).await.unwrap();
    let view = cluster.handle.get_app(&app_id).unwrap();
    for slot in &view.slots {
        cluster.inject_status(
            slot.task_id.clone(),
            bosun_manager::broker::TaskState::TaskKilled,
        );
    }
    cluster
        .wait_until(|| cluster.handle.get_app(&app_id).is_none(), "app reaped")
        .await;
    assert_eq!(cluster.ipam.reserved_count().unwrap(), 0);
}
