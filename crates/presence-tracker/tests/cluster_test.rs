//! Multi-node scenarios over the in-memory network.
//!
//! Every test runs with paused time, so heartbeats, timeouts and retries
//! advance instantly whenever the runtime is idle.

use presence_tracker::{
    LivenessGuard, MemoryNetwork, Metadata, NodeId, PeerStatus, PresenceRef, Presences, Tracker,
    TrackerConfig, TrackerError, Transport,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(node: &str) -> TrackerConfig {
    TrackerConfig::new(
        node,
        Duration::from_millis(100),
        Duration::from_millis(300),
        Duration::from_secs(1),
        Duration::from_millis(500),
    )
    .with_broadcast_period(Duration::from_millis(10))
    .with_retry(3, Duration::from_millis(10))
}

fn cluster(names: &[&str]) -> (Arc<MemoryNetwork>, Vec<Tracker>) {
    init_tracing();
    let network = MemoryNetwork::new();
    let trackers = names
        .iter()
        .map(|name| {
            let (transport, inbound) = network.join(*name);
            let tracker = Tracker::start(config(name), transport).unwrap();
            tracker.attach_inbound(inbound);
            tracker
        })
        .collect();
    (network, trackers)
}

fn status(status: &str) -> Metadata {
    Metadata::new().with("status", status)
}

/// Every (key, ref) visible under `topic`, ignoring per-node ordering.
fn refs(tracker: &Tracker, topic: &str) -> BTreeSet<(String, PresenceRef)> {
    tracker
        .list(topic)
        .iter()
        .flat_map(|(key, metas)| {
            metas
                .iter()
                .map(move |m| (key.clone(), m.presence_ref.clone()))
        })
        .collect()
}

fn keys(tracker: &Tracker, topic: &str) -> Vec<String> {
    tracker.list(topic).keys().cloned().collect()
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn wait_for_status(tracker: &Tracker, peer: &str, expected: PeerStatus) {
    let peer = NodeId::new(peer);
    for _ in 0..500 {
        let peers = tracker.peers().await.unwrap();
        if peers.get(&peer) == Some(&expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never saw {peer} as {expected}", tracker.node());
}

#[tokio::test(start_paused = true)]
async fn test_presence_replicates_to_peers() {
    let (_network, nodes) = cluster(&["a", "b", "c"]);
    let guard = LivenessGuard::new();

    let r1 = nodes[0]
        .track("room:1", "user:7", status("online"), guard.watch())
        .await
        .unwrap();

    for node in &nodes[1..] {
        wait_until("replication", || node.get_by_key("room:1", "user:7").len() == 1).await;
        let meta = &node.get_by_key("room:1", "user:7")[0];
        assert_eq!(meta.presence_ref, r1);
        assert_eq!(meta.node, NodeId::new("a"));
        assert_eq!(meta.metadata, status("online"));
    }

    wait_for_status(&nodes[0], "b", PeerStatus::InSync).await;
    wait_for_status(&nodes[0], "c", PeerStatus::InSync).await;
}

#[tokio::test(start_paused = true)]
async fn test_update_scenario_across_nodes() {
    let (_network, nodes) = cluster(&["a", "b"]);
    let (a, b) = (&nodes[0], &nodes[1]);
    let guard = LivenessGuard::new();
    let mut diffs = b.subscribe("room:1");

    let r1 = a
        .track("room:1", "user:7", status("online"), guard.watch())
        .await
        .unwrap();
    let join = diffs.recv().await.unwrap();
    assert_eq!(join.joins["user:7"][0].presence_ref, r1);

    let r2 = a.update(&r1, status("away")).await.unwrap();

    wait_until("update visible on b", || {
        b.get_by_key("room:1", "user:7")
            .iter()
            .any(|m| m.presence_ref == r2)
    })
    .await;
    let metas = b.get_by_key("room:1", "user:7");
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].metadata, status("away"));
    assert_eq!(metas[0].prev_ref, Some(r1.clone()));

    let diff = diffs.recv().await.unwrap();
    assert_eq!(diff.leaves["user:7"][0].presence_ref, r1);
    assert_eq!(diff.joins["user:7"][0].presence_ref, r2);
    assert!(diffs.try_recv().is_none());

    assert!(matches!(
        a.update(&r1, status("busy")).await,
        Err(TrackerError::UnknownRef(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_multi_session_key() {
    let (_network, nodes) = cluster(&["a", "b"]);
    let (a, b) = (&nodes[0], &nodes[1]);
    let phone_conn = LivenessGuard::new();
    let laptop_conn = LivenessGuard::new();

    let phone = a
        .track("room:1", "user:7", status("phone"), phone_conn.watch())
        .await
        .unwrap();
    let laptop = b
        .track("room:1", "user:7", status("laptop"), laptop_conn.watch())
        .await
        .unwrap();

    for node in [a, b] {
        wait_until("both sessions", || node.get_by_key("room:1", "user:7").len() == 2).await;
    }

    let mut diffs = b.subscribe("room:1");
    a.untrack(&phone).await.unwrap();

    let diff = diffs.recv().await.unwrap();
    assert!(diff.joins.is_empty());
    assert_eq!(diff.leaves["user:7"].len(), 1);
    assert_eq!(diff.leaves["user:7"][0].presence_ref, phone);

    let remaining = b.get_by_key("room:1", "user:7");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].presence_ref, laptop);
}

#[tokio::test(start_paused = true)]
async fn test_same_ref_on_two_nodes() {
    let (_network, nodes) = cluster(&["a", "b"]);
    let (a, b) = (&nodes[0], &nodes[1]);
    let (conn_a, conn_b) = (LivenessGuard::new(), LivenessGuard::new());
    let shared = PresenceRef::from("conn-1");

    a.track_with_ref(shared.clone(), "room:1", "user:7", status("a"), conn_a.watch())
        .await
        .unwrap();
    b.track_with_ref(shared.clone(), "room:1", "user:7", status("b"), conn_b.watch())
        .await
        .unwrap();
    wait_until("both entries on b", || b.get_by_key("room:1", "user:7").len() == 2).await;

    let mut diffs = b.subscribe("room:1");
    a.untrack(&shared).await.unwrap();

    let diff = diffs.recv().await.unwrap();
    assert!(diff.joins.is_empty());
    assert_eq!(diff.leaves["user:7"].len(), 1);
    assert_eq!(diff.leaves["user:7"][0].node, NodeId::new("a"));

    let remaining = b.get_by_key("room:1", "user:7");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].node, NodeId::new("b"));
    assert_eq!(remaining[0].presence_ref, shared);
}

#[tokio::test(start_paused = true)]
async fn test_reused_ref_reaches_subscribers() {
    let (_network, nodes) = cluster(&["a", "b"]);
    let (a, b) = (&nodes[0], &nodes[1]);
    let guard = LivenessGuard::new();
    let reused = PresenceRef::from("conn-1");
    let mut diffs = b.subscribe("room:1");

    a.track_with_ref(reused.clone(), "room:1", "user:7", status("online"), guard.watch())
        .await
        .unwrap();
    let mut client = Presences::new();
    diffs.recv().await.unwrap().apply_to(&mut client);
    let first = client["user:7"][0].clone();

    // Untrack and re-track under the same ref, back to back.
    a.untrack(&reused).await.unwrap();
    a.track_with_ref(reused.clone(), "room:1", "user:7", status("away"), guard.watch())
        .await
        .unwrap();

    let mut left = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        let away = status("away");
        while client
            .get("user:7")
            .and_then(|metas| metas.first())
            .map(|m| &m.metadata)
            != Some(&away)
        {
            let diff = diffs.recv().await.unwrap();
            left.extend(diff.leaves.get("user:7").cloned().unwrap_or_default());
            diff.apply_to(&mut client);
        }
    })
    .await
    .expect("subscriber never saw the re-tracked entry");

    assert_eq!(left, vec![first.clone()]);
    assert_eq!(client["user:7"].len(), 1);
    assert_eq!(client["user:7"][0].presence_ref, reused);
    assert_ne!(client["user:7"][0].tag, first.tag);
    assert_eq!(client, *b.list("room:1"));
}

#[tokio::test(start_paused = true)]
async fn test_liveness_termination_propagates() {
    let (_network, nodes) = cluster(&["a", "b"]);
    let (a, b) = (&nodes[0], &nodes[1]);
    let connection = LivenessGuard::new();

    a.track("room:1", "user:7", status("online"), connection.watch())
        .await
        .unwrap();
    a.track("room:2", "user:7", status("online"), connection.watch())
        .await
        .unwrap();
    wait_until("replication", || b.list_topics().len() == 2).await;

    drop(connection);

    wait_until("cleanup on a", || a.list_topics().is_empty()).await;
    wait_until("cleanup on b", || b.list_topics().is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn test_only_the_owner_can_untrack() {
    let (_network, nodes) = cluster(&["a", "b"]);
    let (a, b) = (&nodes[0], &nodes[1]);
    let guard = LivenessGuard::new();

    let r1 = a
        .track("room:1", "user:7", status("online"), guard.watch())
        .await
        .unwrap();
    wait_until("replication", || b.get_by_key("room:1", "user:7").len() == 1).await;

    // A foreign ref is unknown on b: untrack is a no-op, update an error.
    b.untrack(&r1).await.unwrap();
    assert!(matches!(
        b.update(&r1, status("away")).await,
        Err(TrackerError::UnknownRef(_))
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.get_by_key("room:1", "user:7").len(), 1);
    assert_eq!(b.get_by_key("room:1", "user:7").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_partition_heal_converges() {
    let (network, nodes) = cluster(&["a", "b"]);
    let (a, b) = (&nodes[0], &nodes[1]);
    let (node_a, node_b) = (NodeId::new("a"), NodeId::new("b"));
    let (conn_a, conn_b) = (LivenessGuard::new(), LivenessGuard::new());

    wait_for_status(a, "b", PeerStatus::InSync).await;
    network.partition(&[node_a.clone()], &[node_b.clone()]);

    a.track("room:1", "user:7", status("online"), conn_a.watch())
        .await
        .unwrap();
    b.track("room:1", "user:9", status("online"), conn_b.watch())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(keys(a, "room:1"), vec!["user:7"]);
    assert_eq!(keys(b, "room:1"), vec!["user:9"]);

    network.heal();

    for node in [a, b] {
        wait_until("convergence after heal", || {
            keys(node, "room:1") == vec!["user:7", "user:9"]
        })
        .await;
    }
    assert_eq!(refs(a, "room:1"), refs(b, "room:1"));
}

#[tokio::test(start_paused = true)]
async fn test_long_partition_heal_converges() {
    let (network, nodes) = cluster(&["a", "b"]);
    let (a, b) = (&nodes[0], &nodes[1]);
    let (node_a, node_b) = (NodeId::new("a"), NodeId::new("b"));
    let (conn_a, conn_b) = (LivenessGuard::new(), LivenessGuard::new());

    wait_for_status(a, "b", PeerStatus::InSync).await;
    network.partition(&[node_a.clone()], &[node_b.clone()]);

    a.track("room:1", "user:7", status("online"), conn_a.watch())
        .await
        .unwrap();
    b.track("room:1", "user:9", status("online"), conn_b.watch())
        .await
        .unwrap();

    // Long enough for both sides to declare each other down.
    wait_for_status(a, "b", PeerStatus::Down).await;
    wait_for_status(b, "a", PeerStatus::Down).await;

    network.heal();

    wait_for_status(a, "b", PeerStatus::InSync).await;
    wait_for_status(b, "a", PeerStatus::InSync).await;
    for node in [a, b] {
        wait_until("convergence after heal", || {
            keys(node, "room:1") == vec!["user:7", "user:9"]
        })
        .await;
    }
    assert_eq!(refs(a, "room:1"), refs(b, "room:1"));
}

#[tokio::test(start_paused = true)]
async fn test_node_down_removes_without_resurrection() {
    let (network, nodes) = cluster(&["a", "b", "c"]);
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let conn_c = LivenessGuard::new();

    let r3 = c
        .track("room:1", "user:3", status("online"), conn_c.watch())
        .await
        .unwrap();
    for node in [a, b] {
        wait_until("replication", || node.get_by_key("room:1", "user:3").len() == 1).await;
    }

    let mut diffs = a.subscribe("room:1");
    network.partition(
        &[NodeId::new("c")],
        &[NodeId::new("a"), NodeId::new("b")],
    );

    wait_for_status(a, "c", PeerStatus::Down).await;
    let diff = diffs.recv().await.unwrap();
    assert_eq!(diff.leaves["user:3"][0].presence_ref, r3);
    assert!(a.list("room:1").is_empty());
    wait_until("b purges c", || b.list("room:1").is_empty()).await;

    network.heal();
    wait_for_status(a, "c", PeerStatus::InSync).await;
    wait_for_status(c, "a", PeerStatus::InSync).await;

    // c learns it was declared down and drops its old presence too.
    wait_until("c drops its purged presence", || c.list("room:1").is_empty()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(a.list("room:1").is_empty());
    assert!(b.list("room:1").is_empty());
    assert!(matches!(
        c.update(&r3, status("away")).await,
        Err(TrackerError::UnknownRef(_))
    ));

    // Re-tracking brings it back everywhere.
    let again = c
        .track("room:1", "user:3", status("online"), conn_c.watch())
        .await
        .unwrap();
    for node in [a, b] {
        wait_until("re-track visible", || {
            node.get_by_key("room:1", "user:3")
                .iter()
                .any(|m| m.presence_ref == again)
        })
        .await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_churn_converges() {
    let (_network, nodes) = cluster(&["a", "b", "c"]);
    let guard = LivenessGuard::new();

    let mut live = Vec::new();
    for round in 0..5 {
        for (i, node) in nodes.iter().enumerate() {
            let key = format!("user:{}", (round + i) % 4);
            let r = node
                .track("room:1", key, status("online"), guard.watch())
                .await
                .unwrap();
            live.push((i, r));
        }
        // Every other round, each node updates or drops its oldest presence.
        if round % 2 == 1 {
            for (i, node) in nodes.iter().enumerate() {
                let Some(pos) = live.iter().position(|(owner, _)| *owner == i) else {
                    continue;
                };
                let (_, r) = live.remove(pos);
                if i == 0 {
                    let r2 = node.update(&r, status("away")).await.unwrap();
                    live.push((i, r2));
                } else {
                    node.untrack(&r).await.unwrap();
                }
            }
        }
    }

    let expected: BTreeSet<PresenceRef> = live.iter().map(|(_, r)| r.clone()).collect();
    for node in &nodes {
        wait_until("churn convergence", || {
            refs(node, "room:1")
                .into_iter()
                .map(|(_, r)| r)
                .collect::<BTreeSet<_>>()
                == expected
        })
        .await;
    }
    assert_eq!(refs(&nodes[0], "room:1"), refs(&nodes[1], "room:1"));
    assert_eq!(refs(&nodes[1], "room:1"), refs(&nodes[2], "room:1"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_dropped() {
    let (network, nodes) = cluster(&["a", "b"]);
    let (a, b) = (&nodes[0], &nodes[1]);
    let guard = LivenessGuard::new();

    // A rogue sender that speaks garbage.
    let (rogue, _rogue_inbound) = network.join("rogue");
    rogue
        .send(&NodeId::new("a"), vec![0x07, 0xff, 0xff, 0xff, 0xff])
        .await
        .unwrap();
    a.receive(b"not a sync message".to_vec()).unwrap();

    a.track("room:1", "user:7", status("online"), guard.watch())
        .await
        .unwrap();
    wait_until("a keeps replicating", || b.get_by_key("room:1", "user:7").len() == 1).await;
    assert_eq!(a.list("room:1").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_receives_full_state() {
    init_tracing();
    let network = MemoryNetwork::new();
    let guard = LivenessGuard::new();

    let (transport, inbound) = network.join("a");
    let a = Tracker::start(config("a"), transport).unwrap();
    a.attach_inbound(inbound);
    let r1 = a
        .track("room:1", "user:7", status("online"), guard.watch())
        .await
        .unwrap();
    let r2 = a
        .track("room:2", "user:8", status("online"), guard.watch())
        .await
        .unwrap();
    a.untrack(&r2).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let (transport, inbound) = network.join("b");
    let b = Tracker::start(config("b"), transport).unwrap();
    b.attach_inbound(inbound);

    wait_until("full state transfer", || b.get_by_key("room:1", "user:7").len() == 1).await;
    assert_eq!(b.get_by_key("room:1", "user:7")[0].presence_ref, r1);
    assert_eq!(b.list_topics(), vec!["room:1"]);
    wait_for_status(&b, "a", PeerStatus::InSync).await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_node_is_declared_down() {
    let (network, nodes) = cluster(&["a", "b"]);
    let (a, b) = (&nodes[0], &nodes[1]);
    let guard = LivenessGuard::new();

    b.track("room:1", "user:9", status("online"), guard.watch())
        .await
        .unwrap();
    wait_until("replication", || a.get_by_key("room:1", "user:9").len() == 1).await;

    b.shutdown().await.unwrap();
    network.leave(&NodeId::new("b"));
    assert!(matches!(
        b.track("room:1", "user:10", status("online"), guard.watch())
            .await,
        Err(TrackerError::Shutdown)
    ));

    wait_for_status(a, "b", PeerStatus::Down).await;
    assert!(a.list("room:1").is_empty());
}
