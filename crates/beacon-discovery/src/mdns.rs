//! Link-local multicast DNS transport.
//!
//! Joins the 224.0.0.251:5353 group and relays raw DNS messages both ways.
//! No transaction tracking here — mDNS answers are correlated by name, not
//! id, and the ingest path treats them like any other inbound record.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use beacon_core::dns::Message;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::unicast::TransportError;

/// The mDNS multicast group.
pub(crate) const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
/// The standard mDNS port.
pub(crate) const MDNS_PORT: u16 = 5353;

const RECV_BUFFER_LEN: usize = 2048;

/// An inbound mDNS message, split by the header's QR bit.
pub(crate) enum MdnsInbound {
    Query(Message, SocketAddr),
    Response(Message, SocketAddr),
}

/// Multicast DNS socket bound to the mDNS group.
pub(crate) struct MdnsTransport {
    socket: Arc<UdpSocket>,
    closed: AtomicBool,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl MdnsTransport {
    pub fn new(inbound: mpsc::UnboundedSender<MdnsInbound>) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::from_std(multicast_socket()?)?);
        let recv_task = tokio::spawn(recv_loop(socket.clone(), inbound));
        Ok(Self {
            socket,
            closed: AtomicBool::new(false),
            recv_task: Mutex::new(Some(recv_task)),
        })
    }

    /// Multicast a query to the group.
    pub async fn query(&self, msg: &Message) -> Result<(), TransportError> {
        self.send(msg).await
    }

    /// Multicast a response to the group.
    pub async fn respond(&self, msg: &Message) -> Result<(), TransportError> {
        self.send(msg).await
    }

    async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let bytes = msg.pack()?;
        let dest = SocketAddr::new(IpAddr::V4(MDNS_GROUP), MDNS_PORT);
        self.socket.send_to(&bytes, dest).await?;
        Ok(())
    }

    pub fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Build the multicast UDP socket: reuse-addr and reuse-port so other mDNS
/// stacks on the host keep working, nonblocking for tokio, joined to the
/// group on all interfaces.
fn multicast_socket() -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    // Binding the group address filters unrelated unicast traffic, but only
    // Linux allows it; elsewhere only the wildcard works.
    let bind_ip = if cfg!(target_os = "linux") {
        IpAddr::V4(MDNS_GROUP)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    socket.bind(&SocketAddr::new(bind_ip, MDNS_PORT).into())?;
    socket.join_multicast_v4(&MDNS_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    Ok(socket.into())
}

async fn recv_loop(socket: Arc<UdpSocket>, inbound: mpsc::UnboundedSender<MdnsInbound>) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(error = %e, "mdns recv_from failed");
                continue;
            }
        };
        let message = match Message::unpack(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!(%from, error = %e, "dropping unparseable mdns packet");
                continue;
            }
        };
        let item = if message.response {
            MdnsInbound::Response(message, from)
        } else {
            MdnsInbound::Query(message, from)
        };
        if inbound.send(item).is_err() {
            return;
        }
    }
}
