//! The discovery instance.
//!
//! `Discovery` ties the pieces together: the client DNS socket, optional
//! server sockets (tracker mode), the mDNS transport, the peer and
//! subscriber stores, the secret ring with its 5-minute rotation, and the
//! event stream. One logical announce/lookup/unannounce fans out to every
//! configured tracker plus the local link and aggregates their completions
//! into a single result.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_core::config::DiscoveryConfig;
use beacon_core::dns::{Message, Question, RecordData, RecordType};
use beacon_core::token::{self, SecretRing, TokenMatch};
use beacon_core::txt::TxtPayload;
use beacon_core::wire::{unpack_peers, Peer, Topic};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::ingest;
use crate::mdns::{MdnsInbound, MdnsTransport};
use crate::responder;
use crate::store::PeerStore;
use crate::tracker::{self, RequestKind, TrackerSlot};
use crate::unicast::{DnsSocket, InboundQuery, QUERY_RETRIES};

/// Ports bound by `listen` when none are given.
pub const DEFAULT_SERVER_PORTS: [u16; 2] = [53, 5300];

/// Secret rotation period. Tokens older than one period are re-probed.
const ROTATION_INTERVAL: Duration = Duration::from_secs(300);

/// Everything the instance observes, as a typed stream.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A peer was discovered (or registered, in server mode) for a topic.
    Peer { topic: Topic, peer: Peer },
    /// A transport-level failure. Never fatal to the instance.
    Error { message: String },
    /// All listen sockets are bound.
    Listening,
    /// The instance is destroyed. Emitted exactly once.
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Config(#[from] beacon_core::config::ConfigError),
    #[error("already listening")]
    AlreadyListening,
    #[error("instance destroyed")]
    Destroyed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("Probe failed")]
    ProbeFailed,
    #[error("Query failed")]
    QueryFailed,
    #[error("Inconsistent remote port/host")]
    InconsistentObservation,
}

/// State shared between the public API, the inbound loop, and the timers.
pub(crate) struct Shared {
    pub domain: String,
    pub ttl_secs: u64,
    pub implied_port: bool,
    pub instance_id: String,
    pub local_ip: Ipv4Addr,
    pub slots: Vec<TrackerSlot>,
    pub peers: PeerStore,
    pub subscribers: PeerStore,
    ring: Mutex<SecretRing>,
    tick: AtomicU64,
    listening: AtomicBool,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl Shared {
    pub(crate) fn new(
        config: &DiscoveryConfig,
        slots: Vec<TrackerSlot>,
        local_ip: Ipv4Addr,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        Self {
            domain: config.domain.clone(),
            ttl_secs: config.ttl_secs,
            implied_port: config.implied_port,
            instance_id: token::instance_id(),
            local_ip,
            slots,
            peers: PeerStore::new(Duration::from_secs(config.ttl_secs), config.limit),
            subscribers: PeerStore::new(
                Duration::from_secs(config.subscriber_ttl_secs),
                config.subscriber_limit,
            ),
            ring: Mutex::new(SecretRing::generate()),
            tick: AtomicU64::new(1),
            listening: AtomicBool::new(false),
            events,
        }
    }

    pub(crate) fn tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub(crate) fn set_listening(&self) {
        self.listening.store(true, Ordering::SeqCst);
    }

    pub(crate) fn issue_token(&self, host: Ipv4Addr) -> String {
        self.ring.lock().unwrap().issue(host)
    }

    pub(crate) fn validate_token(&self, token: &str, host: Ipv4Addr) -> TokenMatch {
        self.ring.lock().unwrap().validate(token, host)
    }

    pub(crate) fn emit(&self, event: DiscoveryEvent) {
        // A gone receiver just means nobody is watching.
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_peer(&self, topic: Topic, peer: Peer) {
        self.emit(DiscoveryEvent::Peer { topic, peer });
    }

    /// One rotation period elapsed. Servers shift secret generations; every
    /// mode ages out cached tracker tokens, forcing a re-probe on next use.
    pub(crate) fn rotate_tick(&self) {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;
        if self.is_listening() {
            self.ring.lock().unwrap().rotate();
            tracing::debug!(tick, "secret generation rotated");
        }
        for slot in &self.slots {
            slot.expire_token(tick);
        }
    }
}

/// A peer discovery instance. Client and tracker are the same type; calling
/// [`listen`](Discovery::listen) is what makes it a tracker.
pub struct Discovery {
    shared: Arc<Shared>,
    client: DnsSocket,
    mdns: Option<Arc<MdnsTransport>>,
    query_tx: mpsc::UnboundedSender<InboundQuery>,
    servers: Mutex<Vec<DnsSocket>>,
    listen_called: AtomicBool,
    closed: AtomicBool,
    rotation_task: Mutex<Option<JoinHandle<()>>>,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    /// Create an instance and its event stream.
    pub async fn new(
        config: DiscoveryConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DiscoveryEvent>), DiscoveryError> {
        let trackers = config.tracker_addrs()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (query_tx, query_rx) = mpsc::unbounded_channel();

        let client = DnsSocket::bind("0.0.0.0:0".parse().expect("static addr"), query_tx.clone())
            .await?;
        let local_ip = local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST);
        let slots = trackers
            .into_iter()
            .enumerate()
            .map(|(index, addr)| TrackerSlot::new(index, addr))
            .collect();
        let shared = Arc::new(Shared::new(&config, slots, local_ip, event_tx));

        let (mdns, mdns_rx) = if config.multicast {
            let (tx, rx) = mpsc::unbounded_channel();
            match MdnsTransport::new(tx) {
                Ok(transport) => (Some(Arc::new(transport)), Some(rx)),
                Err(e) => {
                    tracing::warn!(error = %e, "multicast disabled: mdns socket setup failed");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let inbound_task = tokio::spawn(inbound_loop(
            shared.clone(),
            client.clone(),
            mdns.clone(),
            query_rx,
            mdns_rx,
        ));
        let rotation_task = tokio::spawn(rotation_loop(shared.clone()));

        tracing::debug!(
            instance = %shared.instance_id,
            trackers = shared.slots.len(),
            multicast = mdns.is_some(),
            local_ip = %local_ip,
            "discovery instance ready"
        );

        Ok((
            Self {
                shared,
                client,
                mdns,
                query_tx,
                servers: Mutex::new(Vec::new()),
                listen_called: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                rotation_task: Mutex::new(Some(rotation_task)),
                inbound_task: Mutex::new(Some(inbound_task)),
            },
            event_rx,
        ))
    }

    /// Publish that we serve `id` on `port`.
    pub async fn announce<T: Into<Topic>>(
        &self,
        id: T,
        port: u16,
    ) -> Result<(), DiscoveryError> {
        self.visit(RequestKind::Announce, id.into(), port).await
    }

    /// Retract a previous announcement.
    pub async fn unannounce<T: Into<Topic>>(
        &self,
        id: T,
        port: u16,
    ) -> Result<(), DiscoveryError> {
        self.visit(RequestKind::Unannounce, id.into(), port).await
    }

    /// Ask for peers serving `id`. Results arrive as
    /// [`DiscoveryEvent::Peer`] events.
    pub async fn lookup<T: Into<Topic>>(&self, id: T) -> Result<(), DiscoveryError> {
        self.visit(RequestKind::Lookup, id.into(), 0).await
    }

    /// Bind tracker sockets and return the ports actually bound. At most
    /// one call per instance; empty `ports` means the defaults, 53 and
    /// 5300, and port 0 asks the OS for one.
    pub async fn listen(&self, ports: &[u16]) -> Result<Vec<u16>, DiscoveryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Destroyed);
        }
        if self.listen_called.swap(true, Ordering::SeqCst) {
            return Err(DiscoveryError::AlreadyListening);
        }
        let ports: Vec<u16> = if ports.is_empty() {
            DEFAULT_SERVER_PORTS.to_vec()
        } else {
            ports.to_vec()
        };
        let mut bound = Vec::with_capacity(ports.len());
        for port in ports {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            let socket = DnsSocket::bind(addr, self.query_tx.clone()).await?;
            let port = socket.local_addr()?.port();
            tracing::info!(port, "tracker socket bound");
            bound.push(port);
            self.servers.lock().unwrap().push(socket);
        }
        self.shared.set_listening();
        self.shared.emit(DiscoveryEvent::Listening);
        Ok(bound)
    }

    /// How a tracker sees us: probe every configured tracker and accept the
    /// first two observations that agree on host and port.
    pub async fn whoami(&self) -> Result<Peer, DiscoveryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Destroyed);
        }
        // A single tracker has no independent cross-check.
        if self.shared.slots.len() < 2 {
            return Err(DiscoveryError::ProbeFailed);
        }

        let mut legs = JoinSet::new();
        for index in 0..self.shared.slots.len() {
            let shared = self.shared.clone();
            let socket = self.client.clone();
            legs.spawn(async move {
                let slot = &shared.slots[index];
                let payload = tracker::probe(&shared, &socket, slot, QUERY_RETRIES)
                    .await
                    .ok()?;
                let host: Ipv4Addr = payload.host?.parse().ok()?;
                let port: u16 = payload.port?.parse().ok()?;
                Some(Peer::new(host, port))
            });
        }

        let mut first: Option<Peer> = None;
        while let Some(result) = legs.join_next().await {
            let Ok(Some(observed)) = result else { continue };
            match first {
                None => first = Some(observed),
                Some(previous) if previous == observed => return Ok(observed),
                Some(_) => return Err(DiscoveryError::InconsistentObservation),
            }
        }
        Err(DiscoveryError::ProbeFailed)
    }

    /// Serialize the peer store: `{ "<topic>": [{"host", "port"}, …] }`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (topic, peers) in self.shared.peers.iterate() {
            let list = peers
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "host": p.host.to_string(),
                        "port": p.port,
                    })
                })
                .collect();
            map.insert(topic.as_str().to_string(), serde_json::Value::Array(list));
        }
        serde_json::Value::Object(map)
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    pub fn is_listening(&self) -> bool {
        self.shared.is_listening()
    }

    /// Tear everything down: rotation timer, multicast, then every unicast
    /// socket. In-flight queries fail over to their callers. Emits
    /// [`DiscoveryEvent::Close`] exactly once.
    pub fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.rotation_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(mdns) = &self.mdns {
            mdns.destroy();
        }
        for socket in self.servers.lock().unwrap().drain(..) {
            socket.destroy();
        }
        self.client.destroy();
        if let Some(task) = self.inbound_task.lock().unwrap().take() {
            task.abort();
        }
        self.shared.emit(DiscoveryEvent::Close);
        tracing::debug!(instance = %self.shared.instance_id, "discovery instance destroyed");
    }

    /// The single fan-out behind announce/lookup/unannounce.
    async fn visit(
        &self,
        kind: RequestKind,
        topic: Topic,
        port: u16,
    ) -> Result<(), DiscoveryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Destroyed);
        }

        // Mirror the operation locally first, so this node answers for
        // itself no matter what the trackers say.
        match kind {
            RequestKind::Announce => {
                self.shared.peers.add(&topic, Peer::unspecified(port));
            }
            RequestKind::Unannounce => {
                self.shared.peers.remove(&topic, Peer::unspecified(port));
            }
            RequestKind::Lookup => {}
        }

        let mut legs = JoinSet::new();
        for index in 0..self.shared.slots.len() {
            let shared = self.shared.clone();
            let socket = self.client.clone();
            let topic = topic.clone();
            legs.spawn(async move {
                tracker_leg(shared, socket, index, kind, topic, port).await
            });
        }

        // The multicast leg settles once the question is on the wire;
        // whatever answers come back arrive later as peer events.
        let mut multicast_leg = false;
        if kind != RequestKind::Unannounce {
            if let Some(mdns) = &self.mdns {
                let message = Message {
                    questions: vec![Question {
                        name: topic.fqdn(&self.shared.domain),
                        rtype: RecordType::Txt,
                    }],
                    ..Default::default()
                };
                if let Err(e) = mdns.query(&message).await {
                    self.shared.emit(DiscoveryEvent::Error {
                        message: format!("mdns query failed: {e}"),
                    });
                }
                multicast_leg = true;
            }
        }

        if legs.is_empty() && !multicast_leg {
            // Nothing to fan out to; fail, but never synchronously.
            tokio::task::yield_now().await;
            return Err(DiscoveryError::QueryFailed);
        }

        let mut any_response = false;
        while let Some(result) = legs.join_next().await {
            if matches!(result, Ok(true)) {
                any_response = true;
            }
        }
        if any_response {
            Ok(())
        } else {
            Err(DiscoveryError::QueryFailed)
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// One tracker leg of a visit: reuse the cached token or probe for one,
/// then send. Returns whether the tracker produced a decodable response.
async fn tracker_leg(
    shared: Arc<Shared>,
    socket: DnsSocket,
    index: usize,
    kind: RequestKind,
    topic: Topic,
    port: u16,
) -> bool {
    let slot = &shared.slots[index];
    let token = match slot.cached_token(shared.tick()) {
        Some(token) => token,
        None => {
            if let Err(e) = tracker::probe(&shared, &socket, slot, QUERY_RETRIES).await {
                tracing::debug!(tracker = slot.index, error = %e, "probe failed");
                return false;
            }
            match slot.cached_token(shared.tick()) {
                Some(token) => token,
                None => {
                    tracing::debug!(tracker = slot.index, "probe reply carried no token");
                    return false;
                }
            }
        }
    };

    match tracker::send(&shared, &socket, slot, kind, &topic, port, token).await {
        Ok((response, from)) => {
            parse_tracker_response(&shared, slot, &response, from);
            true
        }
        Err(e) => {
            tracing::debug!(tracker = slot.index, error = %e, "tracker leg failed");
            false
        }
    }
}

/// Digest a tracker's response: refresh the slot token and surface any
/// packed peers, substituting the sentinel with the tracker's address.
fn parse_tracker_response(
    shared: &Shared,
    slot: &TrackerSlot,
    response: &Message,
    from: SocketAddr,
) {
    let src_ip = match from {
        SocketAddr::V4(src) => *src.ip(),
        SocketAddr::V6(_) => return,
    };
    for record in &response.answers {
        let RecordData::Txt(strings) = &record.data else {
            continue;
        };
        let Some(payload) = TxtPayload::decode(strings) else {
            continue;
        };
        if let Some(token) = payload.token {
            slot.store_token(token, shared.tick());
        }
        if let Some(peers) = payload.peers {
            let Some(topic) = Topic::from_fqdn(&record.name, &shared.domain) else {
                continue;
            };
            for peer in unpack_peers(&peers) {
                shared.emit_peer(topic.clone(), peer.substitute(src_ip));
            }
        }
    }
}

async fn rotation_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(ROTATION_INTERVAL);
    interval.tick().await; // the first tick completes immediately
    loop {
        interval.tick().await;
        shared.rotate_tick();
    }
}

/// Serializes every inbound message — server questions, mDNS traffic, and
/// the answer/additional sections that feed the ingester.
async fn inbound_loop(
    shared: Arc<Shared>,
    client: DnsSocket,
    mdns: Option<Arc<MdnsTransport>>,
    mut queries: mpsc::UnboundedReceiver<InboundQuery>,
    mut mdns_rx: Option<mpsc::UnboundedReceiver<MdnsInbound>>,
) {
    loop {
        tokio::select! {
            inbound = queries.recv() => {
                let Some(inbound) = inbound else { break };
                if let Some(reply) =
                    responder::answer(&shared, &inbound.message, inbound.from, false)
                {
                    if let Err(e) = inbound.socket.respond(reply, inbound.from).await {
                        shared.emit(DiscoveryEvent::Error {
                            message: format!("dns respond failed: {e}"),
                        });
                    }
                }
                ingest::ingest_sections(&shared, &inbound.message, inbound.from, &inbound.socket);
            }
            inbound = recv_mdns(&mut mdns_rx) => {
                let Some(inbound) = inbound else { break };
                match inbound {
                    MdnsInbound::Query(message, from) => {
                        if let (Some(mdns), Some(reply)) =
                            (&mdns, responder::answer(&shared, &message, from, true))
                        {
                            if let Err(e) = mdns.respond(&reply).await {
                                shared.emit(DiscoveryEvent::Error {
                                    message: format!("mdns respond failed: {e}"),
                                });
                            }
                        }
                        ingest::ingest_sections(&shared, &message, from, &client);
                    }
                    MdnsInbound::Response(message, from) => {
                        ingest::ingest_sections(&shared, &message, from, &client);
                    }
                }
            }
        }
    }
}

async fn recv_mdns(rx: &mut Option<mpsc::UnboundedReceiver<MdnsInbound>>) -> Option<MdnsInbound> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Our primary IPv4 address, observed by routing a (never-sent) datagram.
fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}
