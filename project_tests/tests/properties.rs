//! Engine-wide guarantees: cache monotonicity, no polling of unwatched hosts,
//! idempotent subscriptions, complete fan-out and disconnect cleanup.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_common::core::fetcher::ScriptedOutcome;
use lib_common::core::{
    ClientMessage, Dispatcher, HostState, PutOutcome, Registry, ResourceSnapshot, ServerMessage, SnapshotCache,
};
use project_tests::{Harness, data_stamps, drain, settle};

fn snapshot(host_id: &str, fetched_at_millis: u64) -> Arc<ResourceSnapshot> {
    Arc::new(ResourceSnapshot {
        host_id: host_id.to_string(),
        fetched_at_millis,
        records: Vec::new(),
    })
}

fn subscribe(host_id: &str) -> ClientMessage {
    ClientMessage::Subscribe {
        host_id: host_id.to_string(),
    }
}

// --- Cache monotonicity ---

#[tokio::test(start_paused = true)]
async fn cache_accepts_only_strictly_newer_snapshots() {
    let mut cache = SnapshotCache::new(Duration::from_secs(5));
    let offered = [10, 20, 20, 15, 30, 29, 31];
    let mut accepted = Vec::new();
    for stamp in offered {
        let before = cache.last_known("h1").map(|s| s.fetched_at_millis);
        match cache.put(snapshot("h1", stamp)) {
            PutOutcome::Stored => accepted.push(stamp),
            PutOutcome::Rejected { cached_at_millis, .. } => {
                assert_eq!(Some(cached_at_millis), before);
                assert_eq!(cache.last_known("h1").map(|s| s.fetched_at_millis), before);
            }
        }
    }
    assert_eq!(accepted, vec![10, 20, 30, 31]);
    assert!(accepted.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(start_paused = true)]
async fn broadcast_timestamps_strictly_increase() {
    let h = Harness::new(&["h1"]);
    let (mut c1, mut rx) = h.hub.open_session();
    c1.handle(subscribe("h1"));

    tokio::time::sleep(Duration::from_millis(9_500)).await;
    let stamps = data_stamps(&drain(&mut rx), "h1");
    assert_eq!(stamps.len(), 10);
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(
        h.hub.last_known("h1").map(|s| s.fetched_at_millis),
        stamps.last().copied()
    );
}

// --- Idle guarantee ---

#[tokio::test(start_paused = true)]
async fn unwatched_host_is_not_fetched_until_resubscribed() {
    let h = Harness::new(&["h1"]);
    let (mut c1, _rx) = h.hub.open_session();
    c1.handle(subscribe("h1"));
    settle().await;
    c1.handle(ClientMessage::Unsubscribe {
        host_id: "h1".to_string(),
    });
    assert_eq!(h.hub.scheduler().state_of("h1"), Some(HostState::Idle));
    let calls = h.fetcher.calls_for("h1");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.fetcher.calls_for("h1"), calls);
    // A refresh request is refused while idle.
    assert!(!h.hub.scheduler().trigger("h1"));

    c1.handle(subscribe("h1"));
    settle().await;
    assert_eq!(h.fetcher.calls_for("h1"), calls + 1);
}

#[tokio::test(start_paused = true)]
async fn fetch_in_flight_at_unsubscribe_is_cached_but_not_broadcast() {
    let h = Harness::new(&["h1"]);
    h.fetcher.set_latency(Duration::from_millis(200));
    let (mut c1, mut rx) = h.hub.open_session();
    c1.handle(subscribe("h1"));
    settle().await;
    assert_eq!(h.fetcher.calls_for("h1"), 1);

    c1.handle(ClientMessage::Unsubscribe {
        host_id: "h1".to_string(),
    });
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(h.fetcher.calls_for("h1"), 1);
    assert!(h.hub.last_known("h1").is_some());
    assert!(data_stamps(&drain(&mut rx), "h1").is_empty());
}

// --- Subscription idempotence ---

#[test]
fn registry_subscribe_is_idempotent_and_unsubscribe_tolerates_missing_edges() {
    let mut registry = Registry::new();
    assert_eq!(registry.subscribe(1, "h1"), 1);
    assert_eq!(registry.subscribe(1, "h1"), 1);
    assert_eq!(registry.subscriber_count("h1"), 1);

    assert_eq!(registry.unsubscribe(2, "h1"), 1);
    assert_eq!(registry.unsubscribe(1, "nope"), 0);
    assert_eq!(registry.unsubscribe(1, "h1"), 0);
    assert_eq!(registry.unsubscribe(1, "h1"), 0);
}

#[tokio::test(start_paused = true)]
async fn double_subscribe_through_a_session_polls_once() {
    let h = Harness::new(&["h1"]);
    let (mut c1, mut rx) = h.hub.open_session();
    c1.handle(subscribe("h1"));
    c1.handle(subscribe("h1"));
    settle().await;

    assert_eq!(h.hub.subscriber_count("h1"), 1);
    assert_eq!(h.fetcher.calls_for("h1"), 1);
    assert_eq!(data_stamps(&drain(&mut rx), "h1").len(), 1);
}

// --- Broadcast completeness ---

#[tokio::test(start_paused = true)]
async fn every_subscriber_gets_one_data_message_despite_a_dead_peer() {
    let h = Harness::new(&["h1"]);
    let (mut c1, mut rx1) = h.hub.open_session();
    let (mut c2, rx2) = h.hub.open_session();
    let (mut c3, mut rx3) = h.hub.open_session();
    for session in [&mut c1, &mut c2, &mut c3] {
        session.handle(subscribe("h1"));
    }
    settle().await;
    drain(&mut rx1);
    drain(&mut rx3);
    drop(rx2);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let first = data_stamps(&drain(&mut rx1), "h1");
    let third = data_stamps(&drain(&mut rx3), "h1");
    assert_eq!(first.len(), 1);
    assert_eq!(first, third);
}

#[test]
fn dispatcher_reports_failures_without_skipping_recipients() {
    let registry = Arc::new(Mutex::new(Registry::new()));
    let dispatcher = Dispatcher::new(Arc::clone(&registry));
    let mut rx1 = dispatcher.add_client(1, 4);
    let rx2 = dispatcher.add_client(2, 4);
    let mut rx3 = dispatcher.add_client(3, 4);
    drop(rx2);
    {
        let mut registry = registry.lock().unwrap();
        for conn in 1..=3 {
            registry.subscribe(conn, "h1");
        }
    }

    let report = dispatcher.broadcast_data(&snapshot("h1", 42));
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    for rx in [&mut rx1, &mut rx3] {
        match &*rx.try_recv().unwrap() {
            ServerMessage::Data { fetched_at_millis, .. } => assert_eq!(*fetched_at_millis, 42),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}

// --- Disconnect cleanup ---

#[tokio::test(start_paused = true)]
async fn closing_a_connection_removes_all_of_its_edges() {
    let h = Harness::new(&["h1", "h2"]);
    let (mut c1, _rx1) = h.hub.open_session();
    let (mut c2, _rx2) = h.hub.open_session();
    c1.handle(subscribe("h1"));
    c1.handle(subscribe("h2"));
    c2.handle(subscribe("h2"));
    settle().await;
    let c1_id = c1.id();

    drop(c1);

    {
        let registry = h.hub.registry().lock().unwrap();
        assert!(!registry.subscribers_of("h1").contains(&c1_id));
        assert!(!registry.subscribers_of("h2").contains(&c1_id));
        assert!(registry.hosts_of(c1_id).is_empty());
    }
    assert_eq!(h.hub.scheduler().state_of("h1"), Some(HostState::Idle));
    assert_eq!(h.hub.scheduler().state_of("h2"), Some(HostState::Active));

    let h1_calls = h.fetcher.calls_for("h1");
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.fetcher.calls_for("h1"), h1_calls);
    assert!(h.fetcher.calls_for("h2") > 1);
    drop(c2);
}

#[tokio::test(start_paused = true)]
async fn late_result_after_disconnect_does_not_resurrect_polling() {
    let h = Harness::new(&["h1"]);
    h.fetcher.push("h1", ScriptedOutcome::Hang);
    let (mut c1, _rx) = h.hub.open_session();
    c1.handle(subscribe("h1"));
    settle().await;
    c1.close();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.fetcher.calls_for("h1"), 1);
    assert_eq!(h.hub.scheduler().state_of("h1"), Some(HostState::Idle));
}
