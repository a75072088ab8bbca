//! Inbound question handling.
//!
//! Four question shapes are served, all from the local peer store:
//!
//! - `TXT <domain>` — the probe: hands the asker a token bound to its
//!   observed address, plus that address and port (the whoami answer).
//! - `TXT <id>.<domain>` — lookup: token plus a packed random sample of
//!   peers. Over multicast an empty sample produces no answer at all,
//!   which keeps idle networks quiet.
//! - `A <id>.<domain>` — plain address answers, substituting our own
//!   primary address for self-announced `0.0.0.0` entries.
//! - `SRV <id>.<domain>` — host:port answers, sentinel left intact for the
//!   receiver to substitute.

use std::net::SocketAddr;

use beacon_core::dns::{Message, Record, RecordData, RecordType};
use beacon_core::txt::TxtPayload;
use beacon_core::wire::Topic;

use crate::discovery::Shared;

/// Peer-list cap for packed TXT lookup answers.
pub(crate) const MAX_LOOKUP_PEERS: usize = 100;
/// Peer cap for A and SRV answer sets.
pub(crate) const MAX_ADDRESS_PEERS: usize = 10;

/// Answer the questions in `query`. Returns `None` when nothing should be
/// sent — which over multicast is any reply with zero answers.
pub(crate) fn answer(
    shared: &Shared,
    query: &Message,
    from: SocketAddr,
    multicast: bool,
) -> Option<Message> {
    let src = match from {
        SocketAddr::V4(src) => src,
        SocketAddr::V6(_) => return None,
    };
    let src_ip = *src.ip();
    let ttl = shared.ttl_secs as u32;
    let mut reply = Message::reply_to(query);

    for question in &query.questions {
        match question.rtype {
            RecordType::Txt if is_domain(&question.name, &shared.domain) => {
                let payload = TxtPayload {
                    token: Some(shared.issue_token(src_ip)),
                    host: Some(src_ip.to_string()),
                    port: Some(src.port().to_string()),
                    ..Default::default()
                };
                reply.answers.push(Record {
                    name: question.name.clone(),
                    ttl,
                    data: RecordData::Txt(payload.encode()),
                });
            }
            RecordType::Txt => {
                let Some(topic) = Topic::from_fqdn(&question.name, &shared.domain) else {
                    continue;
                };
                let packed = shared.peers.get_packed(&topic, MAX_LOOKUP_PEERS);
                if multicast && packed.is_empty() {
                    continue;
                }
                let payload = TxtPayload {
                    token: Some(shared.issue_token(src_ip)),
                    peers: Some(packed),
                    ..Default::default()
                };
                reply.answers.push(Record {
                    name: question.name.clone(),
                    ttl,
                    data: RecordData::Txt(payload.encode()),
                });
            }
            RecordType::A => {
                let Some(topic) = Topic::from_fqdn(&question.name, &shared.domain) else {
                    continue;
                };
                for peer in shared.peers.get(&topic, MAX_ADDRESS_PEERS) {
                    let host = if peer.is_unspecified() {
                        shared.local_ip
                    } else {
                        peer.host
                    };
                    reply.answers.push(Record {
                        name: question.name.clone(),
                        ttl,
                        data: RecordData::A(host),
                    });
                }
            }
            RecordType::Srv => {
                let Some(topic) = Topic::from_fqdn(&question.name, &shared.domain) else {
                    continue;
                };
                for peer in shared.peers.get(&topic, MAX_ADDRESS_PEERS) {
                    reply.answers.push(Record {
                        name: question.name.clone(),
                        ttl,
                        data: RecordData::Srv {
                            port: peer.port,
                            target: peer.host.to_string(),
                        },
                    });
                }
            }
        }
    }

    if multicast && reply.answers.is_empty() {
        return None;
    }
    Some(reply)
}

fn is_domain(name: &str, domain: &str) -> bool {
    name.strip_suffix('.').unwrap_or(name).eq_ignore_ascii_case(domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::dns::Question;
    use beacon_core::token::TokenMatch;
    use beacon_core::wire::Peer;
    use std::net::Ipv4Addr;

    use crate::discovery::test_support::shared_for_tests;

    fn txt_question(name: &str) -> Message {
        Message {
            id: 42,
            questions: vec![Question {
                name: name.into(),
                rtype: RecordType::Txt,
            }],
            ..Default::default()
        }
    }

    fn decode_txt(record: &Record) -> TxtPayload {
        match &record.data {
            RecordData::Txt(strings) => TxtPayload::decode(strings).expect("decodable TXT"),
            other => panic!("expected TXT, got {other:?}"),
        }
    }

    #[test]
    fn probe_reply_carries_token_host_and_port() {
        let shared = shared_for_tests();
        let from: SocketAddr = "203.0.113.9:12345".parse().unwrap();

        let reply = answer(&shared, &txt_question("dns-discovery.local"), from, false)
            .expect("unicast probe gets a reply");
        assert!(reply.response);
        assert_eq!(reply.id, 42);
        let payload = decode_txt(&reply.answers[0]);
        assert_eq!(payload.host.as_deref(), Some("203.0.113.9"));
        assert_eq!(payload.port.as_deref(), Some("12345"));
        let token = payload.token.expect("probe reply has a token");
        assert_eq!(
            shared.validate_token(&token, Ipv4Addr::new(203, 0, 113, 9)),
            TokenMatch::Fresh
        );
    }

    #[test]
    fn lookup_reply_packs_sampled_peers() {
        let shared = shared_for_tests();
        let topic = Topic::from_name("abcd");
        shared
            .peers
            .add(&topic, Peer::new(Ipv4Addr::new(10, 0, 0, 1), 4000));
        let from: SocketAddr = "1.2.3.4:5000".parse().unwrap();

        let reply = answer(
            &shared,
            &txt_question("abcd.dns-discovery.local"),
            from,
            false,
        )
        .unwrap();
        let payload = decode_txt(&reply.answers[0]);
        assert_eq!(
            payload.peers.as_deref(),
            Some(&[10, 0, 0, 1, 0x0f, 0xa0][..])
        );
    }

    #[test]
    fn multicast_lookup_with_no_peers_is_silent() {
        let shared = shared_for_tests();
        let from: SocketAddr = "1.2.3.4:5000".parse().unwrap();
        let query = txt_question("abcd.dns-discovery.local");

        assert!(answer(&shared, &query, from, true).is_none());
        // unicast still gets an (empty-peers) reply
        assert!(answer(&shared, &query, from, false).is_some());
    }

    #[test]
    fn a_answers_substitute_our_own_address() {
        let shared = shared_for_tests();
        let topic = Topic::from_name("abcd");
        shared.peers.add(&topic, Peer::unspecified(4000));
        shared
            .peers
            .add(&topic, Peer::new(Ipv4Addr::new(10, 0, 0, 1), 5000));
        let query = Message {
            questions: vec![Question {
                name: "abcd.dns-discovery.local".into(),
                rtype: RecordType::A,
            }],
            ..Default::default()
        };
        let reply = answer(&shared, &query, "1.2.3.4:5000".parse().unwrap(), false).unwrap();

        let mut hosts: Vec<Ipv4Addr> = reply
            .answers
            .iter()
            .map(|r| match r.data {
                RecordData::A(host) => host,
                ref other => panic!("expected A, got {other:?}"),
            })
            .collect();
        hosts.sort();
        assert_eq!(hosts, vec![Ipv4Addr::new(10, 0, 0, 1), shared.local_ip]);
    }

    #[test]
    fn srv_answers_keep_the_sentinel_for_the_receiver() {
        let shared = shared_for_tests();
        let topic = Topic::from_name("abcd");
        shared.peers.add(&topic, Peer::unspecified(4000));
        let query = Message {
            questions: vec![Question {
                name: "abcd.dns-discovery.local".into(),
                rtype: RecordType::Srv,
            }],
            ..Default::default()
        };
        let reply = answer(&shared, &query, "1.2.3.4:5000".parse().unwrap(), false).unwrap();
        assert_eq!(
            reply.answers[0].data,
            RecordData::Srv {
                port: 4000,
                target: "0.0.0.0".into()
            }
        );
    }

    #[test]
    fn foreign_names_are_ignored() {
        let shared = shared_for_tests();
        let reply = answer(
            &shared,
            &txt_question("abcd.example.com"),
            "1.2.3.4:5000".parse().unwrap(),
            false,
        )
        .unwrap();
        assert!(reply.answers.is_empty());
    }
}
