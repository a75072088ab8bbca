//! Client↔tracker lifecycle scenarios: lookup, unannounce, fan-out.

use crate::*;

#[tokio::test]
async fn lookup_discovers_an_announced_peer() {
    let (tracker_node, port) = tracker().await;
    let announcer = client(&[port]).await;
    announcer
        .discovery
        .announce("abcd", 4000)
        .await
        .expect("announce");
    wait_for(|| tracker_node.discovery.to_json()["abcd"].is_array()).await;

    let mut seeker = client(&[port]).await;
    seeker.discovery.lookup("abcd").await.expect("lookup");

    let (topic, peer) = next_peer(&mut seeker.events).await;
    assert_eq!(topic, Topic::from_name("abcd"));
    assert_eq!(peer, Peer::new("127.0.0.1".parse().unwrap(), 4000));
}

#[tokio::test]
async fn byte_ids_find_hex_announcements() {
    let (tracker_node, port) = tracker().await;
    let announcer = client(&[port]).await;
    announcer
        .discovery
        .announce("abcd", 4000)
        .await
        .expect("announce");
    wait_for(|| tracker_node.discovery.to_json()["abcd"].is_array()).await;

    let mut seeker = client(&[port]).await;
    seeker
        .discovery
        .lookup(&[0xab, 0xcd][..])
        .await
        .expect("lookup by raw bytes");
    let (topic, _) = next_peer(&mut seeker.events).await;
    assert_eq!(topic, Topic::from_name("abcd"));
}

#[tokio::test]
async fn unannounce_clears_tracker_and_local_state() {
    let (tracker_node, port) = tracker().await;
    let node = client(&[port]).await;

    node.discovery.announce("abcd", 4000).await.expect("announce");
    wait_for(|| tracker_node.discovery.to_json()["abcd"].is_array()).await;

    node.discovery
        .unannounce("abcd", 4000)
        .await
        .expect("unannounce");
    wait_for(|| {
        tracker_node
            .discovery
            .to_json()
            .as_object()
            .map(|topics| topics.is_empty())
            .unwrap_or(false)
    })
    .await;
    assert!(node
        .discovery
        .to_json()
        .as_object()
        .expect("object export")
        .is_empty());
}

#[tokio::test]
async fn announced_tracker_answers_repeat_clients_with_cached_token() {
    let (_tracker_node, port) = tracker().await;
    let node = client(&[port]).await;

    // Two visits: the second reuses the slot token, no re-probe.
    node.discovery.announce("abcd", 4000).await.expect("first");
    node.discovery.announce("abcd", 4000).await.expect("second");
}

#[tokio::test]
async fn fan_out_succeeds_if_any_tracker_answers() {
    let (_tracker_node, live_port) = tracker().await;
    let dead_port = {
        // bind and immediately drop: nothing will answer here
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };

    let node = client(&[dead_port, live_port]).await;
    node.discovery
        .announce("abcd", 4000)
        .await
        .expect("one live tracker is enough");
}

#[tokio::test]
async fn fan_out_fails_when_every_leg_is_dead() {
    let dead_port = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };
    let node = client(&[dead_port]).await;
    let result = node.discovery.lookup("abcd").await;
    assert!(matches!(
        result,
        Err(beacon_discovery::DiscoveryError::QueryFailed)
    ));
}

#[tokio::test]
async fn dual_port_probe_races_and_promotes_the_live_port() {
    let (_tracker_node, live_port) = tracker().await;
    let dead_port = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };

    // Primary is dead, secondary is the live tracker: the race settles on
    // the secondary and the announce still lands.
    let config = DiscoveryConfig {
        multicast: false,
        trackers: vec![format!("127.0.0.1:{dead_port},{live_port}")],
        ..Default::default()
    };
    let (discovery, _events) = Discovery::new(config).await.expect("client instance");
    discovery
        .announce("abcd", 4000)
        .await
        .expect("secondary port should win the race");
}
