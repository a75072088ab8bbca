//! Tracker sessions.
//!
//! Each configured tracker gets a slot holding its address and a cached
//! token. A probe (TXT query for the bare domain) acquires the token and
//! doubles as the tracker's observation of our public address. Trackers
//! usually listen on two ports; the first successful probe races both and
//! promotes the winner for the rest of the instance's lifetime.

use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use beacon_core::config::TrackerAddr;
use beacon_core::dns::{Message, Question, Record, RecordData, RecordType};
use beacon_core::txt::TxtPayload;
use beacon_core::wire::Topic;

use crate::discovery::{DiscoveryError, Shared};
use crate::unicast::DnsSocket;

/// The three request shapes a client sends to a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Lookup,
    Announce,
    Unannounce,
}

struct SlotState {
    host: String,
    port: u16,
    secondary_port: u16,
    resolved: Option<IpAddr>,
    token: Option<String>,
    age: u64,
}

/// Per-tracker state: address, winning port, cached token.
pub(crate) struct TrackerSlot {
    pub index: usize,
    state: Mutex<SlotState>,
}

impl TrackerSlot {
    pub fn new(index: usize, addr: TrackerAddr) -> Self {
        let resolved = addr.host.parse::<IpAddr>().ok();
        Self {
            index,
            state: Mutex::new(SlotState {
                host: addr.host,
                port: addr.port,
                secondary_port: addr.secondary_port,
                resolved,
                token: None,
                age: 0,
            }),
        }
    }

    /// The cached token, if it has not aged out.
    pub fn cached_token(&self, tick: u64) -> Option<String> {
        let state = self.state.lock().unwrap();
        if state.age >= tick {
            state.token.clone()
        } else {
            None
        }
    }

    pub fn store_token(&self, token: String, tick: u64) {
        let mut state = self.state.lock().unwrap();
        state.token = Some(token);
        state.age = tick;
    }

    /// Drop a token that fell behind the rotation tick. The next operation
    /// on this slot re-probes.
    pub fn expire_token(&self, tick: u64) {
        let mut state = self.state.lock().unwrap();
        if state.age < tick {
            state.token = None;
        }
    }

    /// Persist the winning probe port; no fallback to the loser later.
    fn promote(&self, winner: u16) {
        let mut state = self.state.lock().unwrap();
        state.port = winner;
        state.secondary_port = 0;
    }

    fn endpoints(&self) -> (String, u16, u16, Option<IpAddr>) {
        let state = self.state.lock().unwrap();
        (
            state.host.clone(),
            state.port,
            state.secondary_port,
            state.resolved,
        )
    }

    fn set_resolved(&self, ip: IpAddr) {
        self.state.lock().unwrap().resolved = Some(ip);
    }
}

/// Probe the tracker: TXT query for the bare domain. Caches the returned
/// token and returns the decoded payload (whoami reads `host`/`port` from
/// it). While a secondary port is configured, both ports race and the
/// loser's transaction is cancelled.
pub(crate) async fn probe(
    shared: &Shared,
    socket: &DnsSocket,
    slot: &TrackerSlot,
    retries: u32,
) -> Result<TxtPayload, DiscoveryError> {
    let (host, port, secondary, resolved) = slot.endpoints();
    let ip = match resolved {
        Some(ip) => ip,
        None => {
            let ip = resolve(&host, port).await?;
            slot.set_resolved(ip);
            ip
        }
    };

    let question = probe_message(&shared.domain);
    let (response, _from) = if secondary != 0 {
        let primary_fut = socket.query(question.clone(), SocketAddr::new(ip, port), retries);
        let secondary_fut = socket.query(question, SocketAddr::new(ip, secondary), retries);
        tokio::pin!(primary_fut);
        tokio::pin!(secondary_fut);
        let outcome = tokio::select! {
            result = &mut primary_fut => match result {
                Ok(response) => Some((response, port)),
                Err(_) => secondary_fut.await.ok().map(|r| (r, secondary)),
            },
            result = &mut secondary_fut => match result {
                Ok(response) => Some((response, secondary)),
                Err(_) => primary_fut.await.ok().map(|r| (r, port)),
            },
        };
        match outcome {
            Some((response, winner)) => {
                tracing::debug!(tracker = %host, winner, "probe port promoted");
                slot.promote(winner);
                response
            }
            None => return Err(DiscoveryError::ProbeFailed),
        }
    } else {
        socket
            .query(question, SocketAddr::new(ip, port), retries)
            .await
            .map_err(|_| DiscoveryError::ProbeFailed)?
    };

    let payload = first_txt_payload(&response).ok_or(DiscoveryError::ProbeFailed)?;
    if let Some(token) = &payload.token {
        slot.store_token(token.clone(), shared.tick());
    }
    Ok(payload)
}

/// Send a lookup/announce/unannounce request and return the raw response.
pub(crate) async fn send(
    shared: &Shared,
    socket: &DnsSocket,
    slot: &TrackerSlot,
    kind: RequestKind,
    topic: &Topic,
    port: u16,
    token: String,
) -> Result<(Message, SocketAddr), DiscoveryError> {
    let (host, tracker_port, _, resolved) = slot.endpoints();
    let ip = match resolved {
        Some(ip) => ip,
        None => {
            let ip = resolve(&host, tracker_port).await?;
            slot.set_resolved(ip);
            ip
        }
    };
    let request = build_request(
        &shared.domain,
        topic,
        kind,
        port,
        shared.implied_port,
        token,
        shared.ttl_secs as u32,
    );
    socket
        .query(request, SocketAddr::new(ip, tracker_port), crate::unicast::QUERY_RETRIES)
        .await
        .map_err(|_| DiscoveryError::QueryFailed)
}

fn probe_message(domain: &str) -> Message {
    Message {
        questions: vec![Question {
            name: domain.to_string(),
            rtype: RecordType::Txt,
        }],
        ..Default::default()
    }
}

/// Build the TXT question + TXT control additional for one request.
/// With `implied_port` the textual port is "0", telling the tracker to use
/// the UDP source port it observes.
pub(crate) fn build_request(
    domain: &str,
    topic: &Topic,
    kind: RequestKind,
    port: u16,
    implied_port: bool,
    token: String,
    ttl: u32,
) -> Message {
    let name = topic.fqdn(domain);
    let port_text = if implied_port {
        "0".to_string()
    } else {
        port.to_string()
    };
    let payload = match kind {
        RequestKind::Lookup => TxtPayload {
            subscribe: true,
            token: Some(token),
            ..Default::default()
        },
        RequestKind::Announce => TxtPayload {
            subscribe: true,
            token: Some(token),
            announce: Some(port_text),
            ..Default::default()
        },
        RequestKind::Unannounce => TxtPayload {
            token: Some(token),
            unannounce: Some(port_text),
            ..Default::default()
        },
    };
    Message {
        questions: vec![Question {
            name: name.clone(),
            rtype: RecordType::Txt,
        }],
        additionals: vec![Record {
            name,
            ttl,
            data: RecordData::Txt(payload.encode()),
        }],
        ..Default::default()
    }
}

/// First decodable TXT answer in a response, if any.
pub(crate) fn first_txt_payload(message: &Message) -> Option<TxtPayload> {
    message.answers.iter().find_map(|record| match &record.data {
        RecordData::Txt(strings) => TxtPayload::decode(strings),
        _ => None,
    })
}

async fn resolve(host: &str, port: u16) -> Result<IpAddr, DiscoveryError> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs
        .find(|a| a.is_ipv4())
        .map(|a| a.ip())
        .ok_or(DiscoveryError::ProbeFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> TrackerSlot {
        TrackerSlot::new(0, "10.0.0.1:9000,9001".parse().unwrap())
    }

    #[test]
    fn tokens_age_out_against_the_tick() {
        let slot = slot();
        slot.store_token("abc".into(), 1);
        assert_eq!(slot.cached_token(1).as_deref(), Some("abc"));
        slot.expire_token(2);
        assert_eq!(slot.cached_token(2), None);
    }

    #[test]
    fn expire_keeps_current_generation_tokens() {
        let slot = slot();
        slot.store_token("abc".into(), 3);
        slot.expire_token(3);
        assert_eq!(slot.cached_token(3).as_deref(), Some("abc"));
    }

    #[test]
    fn promotion_clears_the_secondary_port() {
        let slot = slot();
        slot.promote(9001);
        let (_, port, secondary, _) = slot.endpoints();
        assert_eq!(port, 9001);
        assert_eq!(secondary, 0);
    }

    #[test]
    fn announce_request_carries_subscribe_token_and_port() {
        let topic = Topic::from_name("abcd");
        let msg = build_request(
            "dns-discovery.local",
            &topic,
            RequestKind::Announce,
            4000,
            false,
            "t".into(),
            60,
        );
        assert_eq!(msg.questions[0].name, "abcd.dns-discovery.local");
        assert_eq!(msg.questions[0].rtype, RecordType::Txt);
        let payload = match &msg.additionals[0].data {
            RecordData::Txt(strings) => TxtPayload::decode(strings).unwrap(),
            other => panic!("unexpected additional: {other:?}"),
        };
        assert!(payload.subscribe);
        assert_eq!(payload.token.as_deref(), Some("t"));
        assert_eq!(payload.announce.as_deref(), Some("4000"));
        assert_eq!(payload.unannounce, None);
    }

    #[test]
    fn implied_port_sends_zero_regardless_of_port() {
        let topic = Topic::from_name("abcd");
        for kind in [RequestKind::Announce, RequestKind::Unannounce] {
            let msg = build_request(
                "dns-discovery.local",
                &topic,
                kind,
                4000,
                true,
                "t".into(),
                0,
            );
            let payload = match &msg.additionals[0].data {
                RecordData::Txt(strings) => TxtPayload::decode(strings).unwrap(),
                other => panic!("unexpected additional: {other:?}"),
            };
            let sent = payload.announce.or(payload.unannounce);
            assert_eq!(sent.as_deref(), Some("0"));
        }
    }

    #[test]
    fn unannounce_request_does_not_subscribe() {
        let topic = Topic::from_name("abcd");
        let msg = build_request(
            "dns-discovery.local",
            &topic,
            RequestKind::Unannounce,
            4000,
            false,
            "t".into(),
            0,
        );
        let payload = match &msg.additionals[0].data {
            RecordData::Txt(strings) => TxtPayload::decode(strings).unwrap(),
            other => panic!("unexpected additional: {other:?}"),
        };
        assert!(!payload.subscribe);
        assert_eq!(payload.unannounce.as_deref(), Some("4000"));
    }
}
