use fleet_coord::memory::MemoryStore;
use fleet_coord::{CoordinatorConfig, FleetCoordinator, PositionPolicy, Transition};
use fleet_core::model::{Availability, Coordinates, Package, PackageState, Room};
use fleet_core::wire::{Command, LocationUpdatePayload, WireMsg};
use fleet_core::{CoordError, FleetStore, StoreError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        persist_backoff: Duration::from_millis(1),
        poll_timeout: Duration::from_millis(100),
        ..CoordinatorConfig::default()
    }
}

fn coordinator_with(store: Arc<MemoryStore>, config: CoordinatorConfig) -> FleetCoordinator {
    let coordinator = FleetCoordinator::new(store, config);
    coordinator.bootstrap().expect("bootstrap");
    coordinator
}

fn fleet() -> Arc<MemoryStore> {
    let store = MemoryStore::with_agents([(3, "Ana"), (5, "Beto"), (7, "Caro"), (8, "Dani")]);
    store.insert_package(Package::pending(101, "Av. Universidad 3000"));
    Arc::new(store)
}

fn update(agent_id: i64, lat: f64, lng: f64, ts: i64) -> LocationUpdatePayload {
    LocationUpdatePayload {
        agent_id,
        lat: json!(lat),
        lng: json!(lng),
        ts: Some(ts),
    }
}

#[test]
fn package_lifecycle_p101_with_a7() {
    let store = fleet();
    let coordinator = coordinator_with(store.clone(), fast_config());
    coordinator.connect(7, 1, 10).expect("connect");

    let assigned = coordinator.execute(
        &Command::Assign {
            package_id: 101,
            agent_id: 7,
        },
        20,
    );
    assert!(assigned.result.is_ok(), "{:?}", assigned.result);
    let package = coordinator.package(101).expect("package");
    assert_eq!(package.state, PackageState::InTransit);
    assert_eq!(package.agent_id, Some(7));
    assert!(assigned
        .outbound
        .iter()
        .any(|out| matches!(out.msg, WireMsg::PackageAssigned(_))
            && out.rooms == vec![Room::Admin, Room::Agent(7)]));

    let delivered = coordinator.execute(&Command::Deliver { package_id: 101 }, 30);
    assert!(delivered.result.is_ok());
    let package = coordinator.package(101).expect("package");
    assert_eq!(package.state, PackageState::Delivered);
    assert_eq!(package.agent_id, Some(7));

    let cancelled = coordinator.execute(&Command::Cancel { package_id: 101 }, 40);
    let error = cancelled.result.error.expect("rejected");
    assert_eq!(error.code, "invalid_transition");
    assert!(cancelled.outbound.is_empty());
    assert_eq!(
        store.package(101).map(|package| package.state),
        Some(PackageState::Delivered)
    );
}

#[test]
fn assign_on_non_pending_is_invalid_transition() {
    let coordinator = coordinator_with(fleet(), fast_config());
    coordinator
        .transition(101, Transition::Assign { agent_id: 3 })
        .expect("first assign");
    let err = coordinator
        .transition(101, Transition::Assign { agent_id: 5 })
        .expect_err("second assign");
    assert!(matches!(err, CoordError::InvalidTransition(_)));
    assert_eq!(coordinator.package(101).and_then(|p| p.agent_id), Some(3));
}

#[test]
fn concurrent_assign_has_exactly_one_winner() {
    let store = fleet();
    let coordinator = Arc::new(coordinator_with(store.clone(), fast_config()));
    let gate = store.gate_next_write();

    let first = {
        let coordinator = coordinator.clone();
        std::thread::spawn(move || coordinator.transition(101, Transition::Assign { agent_id: 7 }))
    };
    assert!(gate.wait_entered(Duration::from_secs(5)), "first assign reached the store");

    let second = coordinator.transition(101, Transition::Assign { agent_id: 8 });
    assert!(matches!(second, Err(CoordError::Conflict(_))), "{second:?}");

    gate.release();
    let (notice, _) = first.join().expect("join").expect("winner");
    assert_eq!(notice.package.agent_id, Some(7));
    assert_eq!(coordinator.package(101).and_then(|p| p.agent_id), Some(7));
    assert_eq!(store.writes(), vec!["assign 101 7".to_string()]);
}

#[test]
fn racing_assigns_never_produce_two_owners() {
    let store = fleet();
    let coordinator = Arc::new(coordinator_with(store.clone(), fast_config()));
    let handles: Vec<_> = [3, 5, 7, 8]
        .into_iter()
        .map(|agent_id| {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || {
                (
                    agent_id,
                    coordinator.transition(101, Transition::Assign { agent_id }),
                )
            })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        let (agent_id, result) = handle.join().expect("join");
        match result {
            Ok(_) => winners.push(agent_id),
            Err(CoordError::Conflict(_)) | Err(CoordError::InvalidTransition(_)) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(winners.len(), 1);
    let owner = coordinator.package(101).and_then(|p| p.agent_id);
    assert_eq!(owner, Some(winners[0]));
    assert!(coordinator.package(101).expect("package").owner_consistent());
}

#[test]
fn failed_assignment_write_releases_the_claim() {
    let store = fleet();
    let coordinator = coordinator_with(store.clone(), fast_config());
    store.fail_next_writes([StoreError::Rejected("constraint".into())]);

    let err = coordinator
        .transition(101, Transition::Assign { agent_id: 7 })
        .expect_err("write refused");
    assert!(matches!(err, CoordError::Fatal(_)));
    let package = coordinator.package(101).expect("package");
    assert_eq!(package.state, PackageState::Pending);
    assert_eq!(package.agent_id, None);

    coordinator
        .transition(101, Transition::Assign { agent_id: 7 })
        .expect("retry after release");
}

#[test]
fn transient_store_errors_are_retried_within_budget() {
    let store = fleet();
    let coordinator = coordinator_with(store.clone(), fast_config());
    store.fail_next_writes([
        StoreError::Unavailable("locked".into()),
        StoreError::Unavailable("locked".into()),
    ]);
    coordinator
        .transition(101, Transition::Cancel)
        .expect("third attempt lands");
    assert_eq!(
        store.package(101).map(|p| p.state),
        Some(PackageState::Cancelled)
    );
    assert_eq!(coordinator.package(101).and_then(|p| p.agent_id), None);
}

#[test]
fn exhausted_retry_budget_escalates() {
    let store = fleet();
    let coordinator = coordinator_with(store.clone(), fast_config());
    store.fail_next_writes(vec![StoreError::Unavailable("down".into()); 3]);
    let err = coordinator
        .transition(101, Transition::Cancel)
        .expect_err("budget spent");
    assert_eq!(err.code(), "fatal");
    assert_eq!(
        coordinator.package(101).map(|p| p.state),
        Some(PackageState::Pending)
    );
}

#[test]
fn debounce_scenario_a3() {
    let coordinator = coordinator_with(fleet(), fast_config());
    coordinator.connect(3, 11, 0).expect("connect");
    let base = 1_700_000_000_000;

    let first = coordinator
        .handle_location(11, &update(3, 20.0, -100.0, base), base)
        .expect("first");
    assert_eq!(first.len(), 1);
    let second = coordinator
        .handle_location(11, &update(3, 20.001, -100.001, base + 1_000), base + 1_000)
        .expect("second");
    assert!(second.is_empty());
    assert_eq!(
        coordinator.snapshot().agents[&3].position,
        Some(Coordinates {
            lat: 20.0,
            lng: -100.0
        })
    );

    coordinator
        .handle_location(11, &update(3, 20.002, -100.002, base + 2_100), base + 2_100)
        .expect("third");
    assert_eq!(
        coordinator.snapshot().agents[&3].position,
        Some(Coordinates {
            lat: 20.002,
            lng: -100.002
        })
    );
}

#[test]
fn receipt_time_policy_lets_late_samples_land() {
    let config = CoordinatorConfig {
        policy: PositionPolicy::ReceiptTime,
        ..fast_config()
    };
    let coordinator = coordinator_with(fleet(), config);
    coordinator.connect(3, 11, 0).expect("connect");
    coordinator
        .handle_location(11, &update(3, 10.0, 10.0, 10_000), 10_000)
        .expect("fresh");
    coordinator
        .handle_location(11, &update(3, 5.0, 5.0, 5_000), 13_000)
        .expect("late");
    assert_eq!(
        coordinator.snapshot().agents[&3].position,
        Some(Coordinates { lat: 5.0, lng: 5.0 })
    );
}

#[test]
fn malformed_and_detached_samples_are_dropped() {
    let coordinator = coordinator_with(fleet(), fast_config());
    coordinator.connect(3, 11, 0).expect("connect");

    let bad = LocationUpdatePayload {
        agent_id: 3,
        lat: json!("north"),
        lng: json!(-100.0),
        ts: Some(1),
    };
    let err = coordinator.handle_location(11, &bad, 1).expect_err("malformed");
    assert!(matches!(err, CoordError::MalformedInput(_)));

    let from_other_session = coordinator
        .handle_location(99, &update(3, 20.0, -100.0, 5), 5)
        .expect("ignored");
    assert!(from_other_session.is_empty());
    assert!(coordinator.snapshot().agents[&3].position.is_none());

    let good = coordinator
        .handle_location(11, &update(3, 20.0, -100.0, 10), 10)
        .expect("stream continues");
    assert_eq!(good.len(), 1);
}

#[test]
fn future_stamped_sample_cannot_freeze_the_position() {
    let coordinator = coordinator_with(fleet(), fast_config());
    coordinator.connect(3, 11, 0).expect("connect");
    let base = 1_700_000_000_000;
    let year_ms = 365 * 24 * 3_600 * 1_000;

    coordinator
        .handle_location(11, &update(3, 1.0, -100.0, base), base)
        .expect("first");
    let err = coordinator
        .handle_location(11, &update(3, 9.0, -100.0, base + year_ms), base + 5_000)
        .expect_err("clock far ahead");
    assert!(matches!(err, CoordError::MalformedInput(_)));
    let err = coordinator
        .handle_location(11, &update(3, 9.0, -100.0, i64::MIN), base + 6_000)
        .expect_err("negative ts");
    assert!(matches!(err, CoordError::MalformedInput(_)));

    let next = coordinator
        .handle_location(11, &update(3, 42.0, -100.0, base + 10_000), base + 10_000)
        .expect("stream continues");
    assert_eq!(next.len(), 1);
    assert_eq!(
        coordinator.snapshot().agents[&3].position,
        Some(Coordinates {
            lat: 42.0,
            lng: -100.0
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_agent_takes_snapshot_value_a5() {
    let store = fleet();
    let coordinator = coordinator_with(store.clone(), fast_config());
    coordinator.connect(3, 11, 0).expect("connect");
    let now = fleet_core::now_ms();
    coordinator
        .handle_location(11, &update(3, 20.0, -100.0, now), now)
        .expect("fresh push");

    store.set_position(3, Some(Coordinates { lat: 0.0, lng: 0.0 }));
    store.set_position(5, Some(Coordinates { lat: 19.9, lng: -99.9 }));
    let replaced = coordinator.poll_store().await.expect("poll");
    assert_eq!(replaced, 1);

    let snapshot = coordinator.snapshot();
    assert_eq!(
        snapshot.agents[&5].position,
        Some(Coordinates { lat: 19.9, lng: -99.9 })
    );
    assert_eq!(
        snapshot.agents[&3].position,
        Some(Coordinates {
            lat: 20.0,
            lng: -100.0
        }),
        "push wins inside the poll interval"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poll_timeout_and_failure_keep_state() {
    let store = fleet();
    let coordinator = coordinator_with(store.clone(), fast_config());
    store.set_position(5, Some(Coordinates { lat: 19.9, lng: -99.9 }));
    store.set_fetch_delay(Some(Duration::from_millis(400)));

    let err = coordinator.poll_store().await.expect_err("timeout");
    assert!(matches!(err, CoordError::Transient(_)));
    assert!(coordinator.snapshot().agents[&5].position.is_none());

    store.set_fetch_delay(None);
    store.fail_next_fetch(StoreError::Unavailable("busy".into()));
    assert!(coordinator.poll_store().await.is_err());
    assert!(coordinator.snapshot().agents[&5].position.is_none());

    assert_eq!(coordinator.poll_store().await.expect("recovered"), 1);
}

#[test]
fn disconnect_twice_reaches_inactive_once() {
    let store = fleet();
    let coordinator = coordinator_with(store.clone(), fast_config());
    coordinator.connect(7, 1, 10).expect("connect");
    let first = coordinator.disconnect(7, 1, 20).expect("disconnect");
    let second = coordinator.disconnect(7, 1, 30).expect("disconnect again");

    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(coordinator.availability(7), Some(Availability::Inactive));
    let inactive_writes = store
        .writes()
        .iter()
        .filter(|write| *write == "presence 7 inactive")
        .count();
    assert_eq!(inactive_writes, 1);
}

#[test]
fn reconnect_supersedes_the_older_session() {
    let coordinator = coordinator_with(fleet(), fast_config());
    coordinator.connect(7, 1, 10).expect("connect");
    let outcome = coordinator.connect(7, 2, 20).expect("reconnect");
    assert_eq!(outcome.superseded, Some(1));

    assert!(coordinator.disconnect(7, 1, 30).expect("old teardown").is_empty());
    assert_eq!(coordinator.availability(7), Some(Availability::Available));
    assert!(coordinator.is_live(7, 2));
}

#[test]
fn toggle_failure_rolls_back_and_surfaces() {
    let store = fleet();
    let coordinator = coordinator_with(store.clone(), fast_config());
    coordinator.connect(7, 1, 10).expect("connect");

    store.fail_next_writes([StoreError::Rejected("readonly".into())]);
    let result = coordinator.execute(
        &Command::ToggleAvailability {
            agent_id: 7,
            available: false,
        },
        20,
    );
    assert_eq!(result.result.error.map(|e| e.code), Some("fatal".to_string()));
    assert_eq!(coordinator.availability(7), Some(Availability::Available));
    assert_eq!(
        store.agent(7).map(|agent| agent.availability),
        Some(Availability::Available)
    );

    let not_connected = coordinator.execute(
        &Command::ToggleAvailability {
            agent_id: 5,
            available: true,
        },
        30,
    );
    assert_eq!(
        not_connected.result.error.map(|e| e.code),
        Some("invalid_transition".to_string())
    );
}

#[test]
fn carrying_a_package_reports_busy() {
    let coordinator = coordinator_with(fleet(), fast_config());
    coordinator.connect(7, 1, 10).expect("connect");

    let (_, outbound) = coordinator
        .transition(101, Transition::Assign { agent_id: 7 })
        .expect("assign");
    assert_eq!(coordinator.availability(7), Some(Availability::Busy));
    assert!(outbound.iter().any(|out| matches!(
        &out.msg,
        WireMsg::PresenceChanged(payload) if payload.state == Availability::Busy
    )));

    coordinator
        .transition(101, Transition::Deliver)
        .expect("deliver");
    assert_eq!(coordinator.availability(7), Some(Availability::Available));
}

#[test]
fn add_package_and_visibility() {
    let coordinator = coordinator_with(fleet(), fast_config());
    let added = coordinator.execute(
        &Command::AddPackage {
            destination: "  Insurgentes Sur 1602 ".to_string(),
        },
        1,
    );
    let package = added.result.package.expect("created");
    assert_eq!(package.destination, "Insurgentes Sur 1602");
    assert_eq!(coordinator.pending_packages().len(), 2);

    coordinator
        .transition(package.id, Transition::Assign { agent_id: 5 })
        .expect("assign");
    assert_eq!(coordinator.packages_for_agent(5).len(), 1);
    assert!(coordinator.packages_for_agent(7).is_empty());
    assert_eq!(coordinator.snapshot().packages.len(), 2);

    let blank = coordinator.execute(
        &Command::AddPackage {
            destination: " ".to_string(),
        },
        2,
    );
    assert_eq!(
        blank.result.error.map(|e| e.code),
        Some("malformed_input".to_string())
    );
}

#[test]
fn diffs_follow_every_observed_change() {
    let coordinator = coordinator_with(fleet(), fast_config());
    let mut diffs = coordinator.subscribe();
    let start = coordinator.snapshot().seq;

    coordinator.connect(3, 11, 0).expect("connect");
    coordinator
        .handle_location(11, &update(3, 20.0, -100.0, 1_000), 1_000)
        .expect("push");

    let presence = diffs.try_recv().expect("presence diff");
    let position = diffs.try_recv().expect("position diff");
    assert_eq!(presence.seq, start + 1);
    assert_eq!(position.seq, start + 2);
    assert_eq!(
        position.agents[0].entry.as_ref().and_then(|entry| entry.position),
        Some(Coordinates {
            lat: 20.0,
            lng: -100.0
        })
    );
}

#[test]
fn unknown_agents_and_packages_are_not_found() {
    let coordinator = coordinator_with(fleet(), fast_config());
    assert_eq!(
        coordinator.connect(42, 1, 0).expect_err("unknown agent").code(),
        "not_found"
    );
    let result = coordinator.execute(
        &Command::Assign {
            package_id: 101,
            agent_id: 42,
        },
        0,
    );
    assert_eq!(result.result.error.map(|e| e.code), Some("not_found".to_string()));
    let result = coordinator.execute(&Command::Deliver { package_id: 999 }, 0);
    assert_eq!(result.result.error.map(|e| e.code), Some("not_found".to_string()));
}

#[test]
fn bootstrap_resets_stale_presence() {
    let store = fleet();
    store
        .persist_presence(8, Availability::Available)
        .expect("seed stale presence");
    let coordinator = coordinator_with(store.clone(), fast_config());
    assert_eq!(coordinator.availability(8), Some(Availability::Inactive));
    assert_eq!(
        store.agent(8).map(|agent| agent.availability),
        Some(Availability::Inactive)
    );
}

#[test]
fn agent_carrying_packages_at_bootstrap_is_busy_once_connected() {
    let store = fleet();
    let mut carried = Package::pending(102, "Insurgentes Sur 1602");
    carried.state = PackageState::InTransit;
    carried.agent_id = Some(5);
    store.insert_package(carried);
    store
        .persist_presence(5, Availability::Available)
        .expect("seed stale presence");

    let coordinator = coordinator_with(store, fast_config());
    assert_eq!(coordinator.availability(5), Some(Availability::Inactive));

    coordinator.connect(5, 21, 100).expect("connect");
    assert_eq!(coordinator.availability(5), Some(Availability::Busy));
}
