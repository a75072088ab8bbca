//! Push-notification scenarios: subscribers hear about new registrations
//! without asking again.

use crate::*;

#[tokio::test]
async fn announcer_is_pushed_later_arrivals() {
    let (tracker_node, port) = tracker().await;

    let mut first = client(&[port]).await;
    first
        .discovery
        .announce("abcd", 4000)
        .await
        .expect("first announce");
    wait_for(|| tracker_node.discovery.to_json()["abcd"].is_array()).await;

    let mut second = client(&[port]).await;
    second
        .discovery
        .announce("abcd", 4001)
        .await
        .expect("second announce");

    // The second announcer sees the first in the tracker's reply...
    let (topic, peer) = next_peer(&mut second.events).await;
    assert_eq!(topic, Topic::from_name("abcd"));
    assert_eq!(peer, Peer::new("127.0.0.1".parse().unwrap(), 4000));

    // ...and the first hears about the second via push, unprompted.
    let (topic, peer) = next_peer(&mut first.events).await;
    assert_eq!(topic, Topic::from_name("abcd"));
    assert_eq!(peer, Peer::new("127.0.0.1".parse().unwrap(), 4001));
}

#[tokio::test]
async fn lookup_subscribes_for_pushes() {
    let (_tracker_node, port) = tracker().await;

    let mut watcher = client(&[port]).await;
    // Nothing announced yet; the lookup itself registers the subscription.
    watcher.discovery.lookup("abcd").await.expect("lookup");

    let announcer = client(&[port]).await;
    announcer
        .discovery
        .announce("abcd", 4000)
        .await
        .expect("announce");

    let (topic, peer) = next_peer(&mut watcher.events).await;
    assert_eq!(topic, Topic::from_name("abcd"));
    assert_eq!(peer, Peer::new("127.0.0.1".parse().unwrap(), 4000));
}
