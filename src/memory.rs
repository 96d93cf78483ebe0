//! # In-Process Transport
//!
//! [`Transport`] backed by tokio channels. Listeners are registered in a shared
//! table keyed by `SocketAddr`; connecting to a registered address creates a
//! pair of connection ends wired back to back.
//!
//! No sockets are opened, so tests can build many networks in parallel on the
//! same "ports" without interfering, as long as each uses its own transport.
//!
//! ## Semantics
//!
//! - `connect` to an address with no live listener yields `Error("connection refused")`
//! - both ends are open as soon as `connect` returns; the client still
//!   receives a `ConnectionEvent::Open` first
//! - dropping every handle of one end closes the other end with `Closed`
//! - listen with port 0 assigns a port from `EPHEMERAL_PORT_START` upwards

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::transport::{
    ACCEPT_BACKLOG, Connection, ConnectionEvent, ConnectionId, ConnectionIds, Link, LinkState, LinkStatus,
    Listener, Transport,
};

/// First port handed out for client ends and port-0 listeners.
pub const EPHEMERAL_PORT_START: u16 = 49152;

#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    listeners: StdRwLock<HashMap<SocketAddr, mpsc::Sender<Link>>>,
    ids: ConnectionIds,
    next_port: AtomicU16,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            listeners: StdRwLock::new(HashMap::new()),
            ids: ConnectionIds::default(),
            next_port: AtomicU16::new(EPHEMERAL_PORT_START),
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live listener is registered at `addr`.
    pub fn is_listening(&self, addr: SocketAddr) -> bool {
        self.listener_for(addr).is_some()
    }

    fn listener_for(&self, addr: SocketAddr) -> Option<mpsc::Sender<Link>> {
        let listeners = self.inner.listeners.read().ok()?;
        listeners.get(&addr).filter(|tx| !tx.is_closed()).cloned()
    }

    fn ephemeral_addr(&self) -> SocketAddr {
        let port = self.inner.next_port.fetch_add(1, Ordering::SeqCst);
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    fn refused(&self, id: ConnectionId, addr: SocketAddr, reason: &str) -> Link {
        let (connection, _outbound_rx) = Connection::new(id, addr, LinkState::Closed);
        let (event_tx, events) = mpsc::unbounded_channel();
        let _ = event_tx.send(ConnectionEvent::Error(format!("{}: {}", addr, reason)));
        Link { connection, events }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, addr: SocketAddr) -> Result<Listener> {
        let local_addr = if addr.port() == 0 {
            SocketAddr::new(addr.ip(), self.ephemeral_addr().port())
        } else {
            addr
        };

        let mut listeners = self
            .inner
            .listeners
            .write()
            .map_err(|_| anyhow::anyhow!("listener table poisoned"))?;
        if let Some(existing) = listeners.get(&local_addr)
            && !existing.is_closed()
        {
            anyhow::bail!("failed to bind {}: address in use", local_addr);
        }

        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        listeners.insert(local_addr, incoming_tx);
        Ok(Listener::new(local_addr, incoming_rx))
    }

    fn connect(&self, addr: SocketAddr) -> Link {
        let client_id = self.inner.ids.next();
        let Some(acceptor) = self.listener_for(addr) else {
            return self.refused(client_id, addr, "connection refused");
        };

        let (client, client_out) = Connection::new(client_id, addr, LinkState::Open);
        let (server, server_out) = Connection::new(self.inner.ids.next(), self.ephemeral_addr(), LinkState::Open);
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        let server_status = server.status();
        if acceptor.try_send(Link { connection: server, events: server_rx }).is_err() {
            return self.refused(client_id, addr, "accept queue full");
        }

        tokio::spawn(pipe(client_out, server_tx, server_status));
        tokio::spawn(pipe(server_out, client_tx.clone(), client.status()));
        let _ = client_tx.send(ConnectionEvent::Open);

        trace!(client = client_id, %addr, "memory connection established");
        Link { connection: client, events: client_rx }
    }
}

/// Move frames written on one end into the event stream of the other.
async fn pipe(
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    receiver_status: LinkStatus,
) {
    while let Some(frame) = frames.recv().await {
        if events.send(ConnectionEvent::Message(frame)).is_err() {
            break;
        }
    }
    receiver_status.mark_closed();
    let _ = events.send(ConnectionEvent::Closed);
}
