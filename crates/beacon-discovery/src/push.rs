//! Push notifications.
//!
//! When a fresh announcement lands, up to 16 subscribers get a DNS query
//! whose additionals carry the new peer as an SRV record. The recipient's
//! ingester turns that into a peer event. Delivery is fire-and-forget:
//! sends are spawned, retried by the transport, and never awaited by the
//! ingest path that triggered them.

use std::net::{IpAddr, SocketAddr};

use beacon_core::dns::{Message, Record, RecordData};
use beacon_core::wire::{Peer, Topic};

use crate::discovery::Shared;
use crate::unicast::{DnsSocket, QUERY_RETRIES};

/// Subscriber sample size per push.
pub(crate) const MAX_PUSH_SUBSCRIBERS: usize = 16;

/// Notify a random sample of `topic`'s subscribers that `peer` registered.
pub(crate) fn notify(shared: &Shared, via: &DnsSocket, topic: &Topic, peer: Peer) {
    let subscribers = shared.subscribers.get(topic, MAX_PUSH_SUBSCRIBERS);
    if subscribers.is_empty() {
        return;
    }
    tracing::debug!(
        topic = %topic,
        peer = %peer,
        subscribers = subscribers.len(),
        "pushing new peer"
    );

    let record = Record {
        name: topic.fqdn(&shared.domain),
        ttl: shared.ttl_secs as u32,
        data: RecordData::Srv {
            port: peer.port,
            target: peer.host.to_string(),
        },
    };
    for subscriber in subscribers {
        let message = Message {
            additionals: vec![record.clone()],
            ..Default::default()
        };
        let socket = via.clone();
        tokio::spawn(async move {
            let to = SocketAddr::new(IpAddr::V4(subscriber.host), subscriber.port);
            if let Err(e) = socket.query(message, to, QUERY_RETRIES).await {
                tracing::trace!(%to, error = %e, "push went unacknowledged");
            }
        });
    }
}
