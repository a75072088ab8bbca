//! Unicast DNS over UDP.
//!
//! One socket serves both roles: outbound queries are matched to responses
//! by a random transaction id through a shared in-flight table, and inbound
//! queries are handed to the discovery loop over a channel. Retries use a
//! doubling per-attempt timeout; dropping a query future cancels its
//! transaction, which is how the dual-port probe race abandons the loser.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_core::dns::{DnsError, Message};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Retry budget used for probes, pushes, and tracker queries.
pub(crate) const QUERY_RETRIES: u32 = 2;

const FIRST_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);
const RECV_BUFFER_LEN: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("query timed out")]
    Timeout,
    #[error("socket closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] DnsError),
}

/// An inbound DNS query plus the socket it arrived on, so the reply (and
/// any push triggered by it) leaves from the same port.
pub(crate) struct InboundQuery {
    pub message: Message,
    pub from: SocketAddr,
    pub socket: DnsSocket,
}

struct Inner {
    socket: UdpSocket,
    pending: DashMap<u16, oneshot::Sender<(Message, SocketAddr)>>,
    closed: AtomicBool,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

/// A unicast DNS socket. Cheap to clone; all clones share the transaction
/// table and the receive loop.
#[derive(Clone)]
pub(crate) struct DnsSocket {
    inner: Arc<Inner>,
}

impl DnsSocket {
    pub async fn bind(
        addr: SocketAddr,
        queries: mpsc::UnboundedSender<InboundQuery>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let inner = Arc::new(Inner {
            socket,
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            recv_task: Mutex::new(None),
        });
        let task = tokio::spawn(recv_loop(inner.clone(), queries));
        *inner.recv_task.lock().unwrap() = Some(task);
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Send `msg` to `to` and await the matching response. Each attempt
    /// waits twice as long as the previous one; `retries` extra attempts
    /// are made before giving up.
    pub async fn query(
        &self,
        mut msg: Message,
        to: SocketAddr,
        retries: u32,
    ) -> Result<(Message, SocketAddr), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let (tx, mut rx) = oneshot::channel();
        let id = self.register(tx);
        msg.id = id;
        let _guard = PendingGuard {
            inner: self.inner.clone(),
            id,
        };
        let bytes = msg.pack()?;

        let mut wait = FIRST_ATTEMPT_TIMEOUT;
        for _ in 0..=retries {
            self.inner.socket.send_to(&bytes, to).await?;
            match tokio::time::timeout(wait, &mut rx).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(_)) => return Err(TransportError::Closed),
                Err(_) => wait *= 2,
            }
        }
        Err(TransportError::Timeout)
    }

    /// Send a reply. The caller builds it via [`Message::reply_to`], so the
    /// transaction id already echoes the request.
    pub async fn respond(&self, reply: Message, to: SocketAddr) -> Result<(), TransportError> {
        let bytes = reply.pack()?;
        self.inner.socket.send_to(&bytes, to).await?;
        Ok(())
    }

    /// Tear down: stops the receive loop and fails every in-flight query.
    pub fn destroy(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inner.recv_task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.pending.clear();
    }

    /// Reserve a free nonzero transaction id.
    fn register(&self, tx: oneshot::Sender<(Message, SocketAddr)>) -> u16 {
        loop {
            let id = rand::random::<u16>();
            if id == 0 {
                continue;
            }
            match self.inner.pending.entry(id) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(tx);
                    return id;
                }
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
            }
        }
    }
}

/// Removes the transaction when a query future is dropped, so an abandoned
/// query (race loser, caller timeout) cannot leak table entries.
struct PendingGuard {
    inner: Arc<Inner>,
    id: u16,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.id);
    }
}

async fn recv_loop(inner: Arc<Inner>, queries: mpsc::UnboundedSender<InboundQuery>) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        let (len, from) = match inner.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(error = %e, "dns recv_from failed");
                continue;
            }
        };
        let message = match Message::unpack(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!(%from, error = %e, "dropping unparseable dns packet");
                continue;
            }
        };
        if message.response {
            // Late duplicates land here with no waiter and are dropped.
            if let Some((_, waiter)) = inner.pending.remove(&message.id) {
                let _ = waiter.send((message, from));
            }
        } else if queries
            .send(InboundQuery {
                message,
                from,
                socket: DnsSocket {
                    inner: inner.clone(),
                },
            })
            .is_err()
        {
            // Discovery loop is gone; nothing left to deliver to.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::dns::{Question, RecordType};

    fn query_message(name: &str) -> Message {
        Message {
            questions: vec![Question {
                name: name.into(),
                rtype: RecordType::Txt,
            }],
            ..Default::default()
        }
    }

    async fn bind_pair() -> (
        DnsSocket,
        mpsc::UnboundedReceiver<InboundQuery>,
        DnsSocket,
        mpsc::UnboundedReceiver<InboundQuery>,
    ) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = DnsSocket::bind("127.0.0.1:0".parse().unwrap(), tx_a)
            .await
            .unwrap();
        let b = DnsSocket::bind("127.0.0.1:0".parse().unwrap(), tx_b)
            .await
            .unwrap();
        (a, rx_a, b, rx_b)
    }

    #[tokio::test]
    async fn query_reaches_peer_and_response_comes_back() {
        let (a, _rx_a, b, mut rx_b) = bind_pair().await;
        let b_addr = b.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let inbound = rx_b.recv().await.expect("query should arrive");
            assert_eq!(inbound.message.questions.len(), 1);
            let reply = Message::reply_to(&inbound.message);
            inbound.socket.respond(reply, inbound.from).await.unwrap();
        });

        let (response, from) = a
            .query(query_message("dns-discovery.local"), b_addr, 0)
            .await
            .expect("query should resolve");
        assert!(response.response);
        assert_eq!(from, b_addr);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_query_times_out_after_retries() {
        let (a, _rx_a, b, mut rx_b) = bind_pair().await;
        let b_addr = b.local_addr().unwrap();

        let counter = tokio::spawn(async move {
            let mut seen = 0;
            while rx_b.recv().await.is_some() {
                seen += 1;
                if seen == 3 {
                    break;
                }
            }
            seen
        });

        let result = a
            .query(query_message("dns-discovery.local"), b_addr, 2)
            .await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        // initial attempt + 2 retries all hit the wire
        assert_eq!(counter.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn destroy_fails_inflight_queries() {
        let (a, _rx_a, b, _rx_b) = bind_pair().await;
        let b_addr = b.local_addr().unwrap();

        let a2 = a.clone();
        let inflight =
            tokio::spawn(
                async move { a2.query(query_message("dns-discovery.local"), b_addr, 2).await },
            );
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.destroy();
        let result = inflight.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
