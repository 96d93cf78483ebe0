//! # Transport Boundary
//!
//! Nodes never touch sockets directly. Everything they need from the network
//! goes through the [`Transport`] trait:
//!
//! | Operation | Rust surface |
//! |-----------|--------------|
//! | listen on an address | [`Transport::listen`] → [`Listener`] |
//! | accept a subscriber | [`Listener::accept`] → [`Link`] |
//! | open an outbound connection | [`Transport::connect`] → [`Link`] |
//! | send a frame | [`Connection::send`] |
//! | open / message / error | [`ConnectionEvent`] stream of the [`Link`] |
//! | liveness check | [`Connection::is_open`] |
//!
//! ## Event Streams
//!
//! Each [`Link`] pairs a cloneable [`Connection`] handle (used for sending and
//! liveness checks) with an event receiver. The receiver yields events in the
//! order the transport observed them; the owning node drains it with a single
//! task so events of one connection are handled one at a time.
//!
//! `connect` returns immediately. Establishment happens in the background and
//! is reported through `ConnectionEvent::Open` or `ConnectionEvent::Error`.
//!
//! ## Implementations
//!
//! - [`TcpTransport`](crate::tcp::TcpTransport): tokio TCP, length-prefixed frames
//! - [`MemoryTransport`](crate::memory::MemoryTransport): in-process channel pairs

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Identifier of one end of a connection, unique within a transport.
pub type ConnectionId = u64;

/// Capacity of the accepted-connection queue between a transport and its listener.
pub const ACCEPT_BACKLOG: usize = 1024;

/// Network operations consumed by nodes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start accepting connections on `addr`.
    async fn listen(&self, addr: SocketAddr) -> Result<Listener>;

    /// Open a connection to `addr`. Never blocks; the outcome arrives as an event.
    fn connect(&self, addr: SocketAddr) -> Link;
}

// ============================================================================
// Connection Handle
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

impl LinkState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closed => 2,
        }
    }
}

/// Sending side of one connection end. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    state: Arc<AtomicU8>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl Connection {
    /// Create a handle whose frames are delivered to the returned receiver.
    pub(crate) fn new(
        id: ConnectionId,
        peer: SocketAddr,
        state: LinkState,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let conn = Self {
            id,
            peer,
            state: Arc::new(AtomicU8::new(state.as_u8())),
            outbound,
        };
        (conn, outbound_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address as seen by this end.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Queue a frame for delivery. Fails if the connection is not open.
    pub fn send(&self, frame: Vec<u8>) -> Result<()> {
        match self.state() {
            LinkState::Open => {}
            LinkState::Connecting => anyhow::bail!("connection {} to {} is still connecting", self.id, self.peer),
            LinkState::Closed => anyhow::bail!("connection {} to {} is closed", self.id, self.peer),
        }
        self.outbound
            .send(frame)
            .map_err(|_| anyhow::anyhow!("connection {} to {} has no writer", self.id, self.peer))
    }

    /// Stop accepting frames on this end. Already-queued frames may still be written.
    pub fn close(&self) {
        self.mark_closed();
    }

    /// State handle that does not keep the outbound queue alive.
    pub(crate) fn status(&self) -> LinkStatus {
        LinkStatus(self.state.clone())
    }

    pub(crate) fn mark_closed(&self) {
        self.status().mark_closed();
    }
}

/// Shared state cell of a connection, held by transport I/O tasks.
#[derive(Clone, Debug)]
pub(crate) struct LinkStatus(Arc<AtomicU8>);

impl LinkStatus {
    pub(crate) fn mark_open(&self) {
        // a connection closed before establishment finished stays closed
        let _ = self.0.compare_exchange(
            LinkState::Connecting.as_u8(),
            LinkState::Open.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn mark_closed(&self) {
        self.0.store(LinkState::Closed.as_u8(), Ordering::SeqCst);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Events, Links, Listeners
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Outbound connection established.
    Open,
    /// One inbound frame.
    Message(Vec<u8>),
    /// Transport failure. The connection is closed afterwards.
    Error(String),
    /// Remote end went away.
    Closed,
}

/// A connection handle together with its event stream.
#[derive(Debug)]
pub struct Link {
    pub connection: Connection,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Accepting side of a listening address. Dropping it stops accepting.
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Link>,
}

impl Listener {
    pub(crate) fn new(local_addr: SocketAddr, incoming: mpsc::Receiver<Link>) -> Self {
        Self { local_addr, incoming }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next accepted connection, or `None` once the transport stops listening.
    pub async fn accept(&mut self) -> Option<Link> {
        self.incoming.recv().await
    }
}

/// Connection id source shared by every end a transport creates.
#[derive(Debug, Default)]
pub(crate) struct ConnectionIds(AtomicU64);

impl ConnectionIds {
    pub(crate) fn next(&self) -> ConnectionId {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}
