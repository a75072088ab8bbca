//! whoami: cross-tracker agreement on our public address.

use beacon_core::dns::{Message, Record, RecordData};
use beacon_core::txt::TxtPayload;

use crate::*;

/// A minimal scripted tracker: answers every probe with a fixed
/// host/port observation.
async fn scripted_observer(host: &str, port_text: &str) -> u16 {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("bind scripted observer");
    let port = socket.local_addr().expect("local addr").port();
    let host = host.to_string();
    let port_text = port_text.to_string();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Ok(query) = Message::unpack(&buf[..len]) else {
                continue;
            };
            if query.response || query.questions.is_empty() {
                continue;
            }
            let payload = TxtPayload {
                token: Some("scripted-token".into()),
                host: Some(host.clone()),
                port: Some(port_text.clone()),
                ..Default::default()
            };
            let mut reply = Message::reply_to(&query);
            reply.answers.push(Record {
                name: query.questions[0].name.clone(),
                ttl: 0,
                data: RecordData::Txt(payload.encode()),
            });
            let Ok(bytes) = reply.pack() else { continue };
            let _ = socket.send_to(&bytes, from).await;
        }
    });
    port
}

#[tokio::test]
async fn agreeing_observations_resolve() {
    let first = scripted_observer("203.0.113.50", "4567").await;
    let second = scripted_observer("203.0.113.50", "4567").await;
    let node = client(&[first, second]).await;

    let observed = node.discovery.whoami().await.expect("whoami");
    assert_eq!(observed, Peer::new("203.0.113.50".parse().unwrap(), 4567));
}

#[tokio::test]
async fn real_trackers_agree_on_the_loopback_address() {
    let (_tracker_a, port_a) = tracker().await;
    let (_tracker_b, port_b) = tracker().await;
    let node = client(&[port_a, port_b]).await;

    let observed = node.discovery.whoami().await.expect("whoami");
    assert_eq!(observed.host, "127.0.0.1".parse::<std::net::Ipv4Addr>().unwrap());
    assert_ne!(observed.port, 0);
}

#[tokio::test]
async fn disagreeing_observations_error() {
    let first = scripted_observer("203.0.113.50", "4567").await;
    let second = scripted_observer("198.51.100.9", "4567").await;
    let node = client(&[first, second]).await;

    let result = node.discovery.whoami().await;
    assert!(matches!(
        result,
        Err(beacon_discovery::DiscoveryError::InconsistentObservation)
    ));
}

#[tokio::test]
async fn port_disagreement_is_also_inconsistent() {
    let first = scripted_observer("203.0.113.50", "4567").await;
    let second = scripted_observer("203.0.113.50", "4568").await;
    let node = client(&[first, second]).await;

    assert!(matches!(
        node.discovery.whoami().await,
        Err(beacon_discovery::DiscoveryError::InconsistentObservation)
    ));
}

#[tokio::test]
async fn single_tracker_cannot_cross_check() {
    let (_tracker_node, port) = tracker().await;
    let node = client(&[port]).await;
    assert!(matches!(
        node.discovery.whoami().await,
        Err(beacon_discovery::DiscoveryError::ProbeFailed)
    ));
}
