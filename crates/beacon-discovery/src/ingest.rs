//! The answer ingester.
//!
//! One code path consumes every inbound record: answers from unicast and
//! multicast responses, and the answers/additionals riding on inbound
//! queries. Records outside our domain, non-IPv4 SRV targets, undecodable
//! TXT payloads, and unparseable ports are all dropped without a sound —
//! byzantine traffic is normal background noise here.
//!
//! The token check is double-duty. A fresh match means the payload carries
//! a token *we* issued to this sender — for an announce that authenticates
//! the mutation, and for a reflected peer list it marks the record as our
//! own echo, which must not be re-emitted as a remote peer. Mutations also
//! pass with the previous-generation (grace) token so announcements signed
//! just before a rotation still land.

use std::net::SocketAddr;

use beacon_core::dns::{Message, Record, RecordData};
use beacon_core::token::TokenMatch;
use beacon_core::txt::TxtPayload;
use beacon_core::wire::{unpack_peers, Peer, Topic};

use crate::discovery::Shared;
use crate::push;
use crate::unicast::DnsSocket;

/// Ingest the answers and additionals of one inbound message.
pub(crate) fn ingest_sections(
    shared: &Shared,
    message: &Message,
    from: SocketAddr,
    push_via: &DnsSocket,
) {
    for record in message.answers.iter().chain(message.additionals.iter()) {
        ingest_record(shared, record, from, push_via);
    }
}

/// Ingest a single record observed from `from`.
pub(crate) fn ingest_record(
    shared: &Shared,
    record: &Record,
    from: SocketAddr,
    push_via: &DnsSocket,
) {
    let src = match from {
        SocketAddr::V4(src) => src,
        SocketAddr::V6(_) => return,
    };
    let src_ip = *src.ip();
    let src_port = src.port();
    let Some(topic) = Topic::from_fqdn(&record.name, &shared.domain) else {
        return;
    };

    match &record.data {
        RecordData::Srv { port, target } => {
            let Ok(host) = target.parse::<std::net::Ipv4Addr>() else {
                return;
            };
            let peer = Peer::new(host, *port)
                .substitute(src_ip);
            let peer = if peer.port == 0 {
                Peer::new(peer.host, src_port)
            } else {
                peer
            };
            shared.emit_peer(topic, peer);
        }
        RecordData::Txt(strings) => {
            let Some(payload) = TxtPayload::decode(strings) else {
                return;
            };
            let verdict = match payload.token.as_deref() {
                Some(token) => shared.validate_token(token, src_ip),
                None => TokenMatch::Invalid,
            };

            // Not our own echo: surface whatever peers the sender packed.
            if verdict != TokenMatch::Fresh {
                if let Some(peers) = &payload.peers {
                    for peer in unpack_peers(peers) {
                        shared.emit_peer(topic.clone(), peer.substitute(src_ip));
                    }
                }
            }

            if !shared.is_listening() {
                return;
            }
            if verdict == TokenMatch::Invalid {
                return;
            }

            if let Some(announce) = &payload.announce {
                if let Ok(port) = announce.parse::<u16>() {
                    let port = if port == 0 { src_port } else { port };
                    let peer = Peer::new(src_ip, port);
                    shared.emit_peer(topic.clone(), peer);
                    if shared.peers.add(&topic, peer) {
                        tracing::debug!(topic = %topic, peer = %peer, "peer registered");
                        push::notify(shared, push_via, &topic, peer);
                    }
                }
            }
            if let Some(unannounce) = &payload.unannounce {
                if let Ok(port) = unannounce.parse::<u16>() {
                    let port = if port == 0 { src_port } else { port };
                    shared.peers.remove(&topic, Peer::new(src_ip, port));
                }
            }
            if payload.subscribe {
                shared.subscribers.add(&topic, Peer::new(src_ip, src_port));
            } else {
                shared.subscribers.remove(&topic, Peer::new(src_ip, src_port));
            }
        }
        RecordData::A(_) => {}
    }
}
