//! Beacon integration test harness.
//!
//! Tests run real discovery instances against each other over loopback
//! UDP with OS-assigned ports — no privileges, no fixed ports, no
//! multicast (mDNS needs a real link and is covered at the unit level).
//!
//! Each scenario file drives full client↔tracker exchanges: probes, token
//! acquisition, announces, lookups, pushes.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

pub use beacon_discovery::{Discovery, DiscoveryConfig, DiscoveryEvent, Peer, Topic};

mod pushes;
mod scenarios;
mod whoami;

// ── Harness ───────────────────────────────────────────────────────────────────

pub struct Node {
    pub discovery: Discovery,
    pub events: UnboundedReceiver<DiscoveryEvent>,
}

/// Start a tracker on an OS-assigned port. Returns the node and its port.
pub async fn tracker() -> (Node, u16) {
    let config = DiscoveryConfig {
        multicast: false,
        ..Default::default()
    };
    let (discovery, events) = Discovery::new(config).await.expect("tracker instance");
    let ports = discovery.listen(&[0]).await.expect("tracker bind");
    (Node { discovery, events }, ports[0])
}

/// A client configured against the given loopback tracker ports.
/// Secondary ports are disabled so probes go straight to the target.
pub async fn client(tracker_ports: &[u16]) -> Node {
    let trackers = tracker_ports
        .iter()
        .map(|port| format!("127.0.0.1:{port},0"))
        .collect();
    let config = DiscoveryConfig {
        multicast: false,
        trackers,
        ..Default::default()
    };
    let (discovery, events) = Discovery::new(config).await.expect("client instance");
    Node { discovery, events }
}

/// Await the next peer event, skipping other event kinds.
pub async fn next_peer(events: &mut UnboundedReceiver<DiscoveryEvent>) -> (Topic, Peer) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Some(DiscoveryEvent::Peer { topic, peer }) => return (topic, peer),
                Some(_) => {}
                None => panic!("event stream ended while waiting for a peer"),
            }
        }
    })
    .await
    .expect("timed out waiting for a peer event")
}

/// Poll until `check` passes. Server-side effects land just after the
/// response hits the wire, so assertions on tracker state need a grace
/// window.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within 5s");
}

// ── Smoke tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn tracker_binds_and_reports_listening() {
    let (mut node, port) = tracker().await;
    assert_ne!(port, 0);
    assert!(node.discovery.is_listening());
    assert!(matches!(
        node.events.recv().await,
        Some(DiscoveryEvent::Listening)
    ));
    node.discovery.destroy();
    loop {
        match node.events.recv().await {
            Some(DiscoveryEvent::Close) => break,
            Some(_) => {}
            None => panic!("stream ended without close"),
        }
    }
}

#[tokio::test]
async fn announce_round_trip_succeeds() {
    let (tracker_node, port) = tracker().await;
    let client_node = client(&[port]).await;

    client_node
        .discovery
        .announce("abcd", 4000)
        .await
        .expect("announce against a live tracker");

    // local mirror: the client can answer for itself
    let local = client_node.discovery.to_json();
    assert_eq!(local["abcd"][0]["host"], "0.0.0.0");
    assert_eq!(local["abcd"][0]["port"], 4000);

    // tracker registered the announcer under its observed address
    wait_for(|| {
        let json = tracker_node.discovery.to_json();
        json["abcd"]
            .as_array()
            .map(|peers| {
                peers
                    .iter()
                    .any(|p| p["host"] == "127.0.0.1" && p["port"] == 4000)
            })
            .unwrap_or(false)
    })
    .await;
}
