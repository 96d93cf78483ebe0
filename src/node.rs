//! # Flooding Node
//!
//! A [`Node`] is one peer of the overlay. It may own:
//!
//! | Role | Count | Purpose |
//! |------|-------|---------|
//! | server | 0 or 1 | accepts subscribers, sends each a genesis envelope |
//! | upstream | 0 or 1 | connection to the node's own client address |
//! | subscriber | any | connections to other nodes' client addresses |
//!
//! Envelopes arriving on the upstream or a subscriber connection are run
//! through the [flooding rule](crate::flood) and forwarded on at most one
//! server-side connection.
//!
//! ## Architecture
//!
//! The node uses the **Actor Pattern**:
//! - [`Node`]: public handle, cheap to clone, sends commands over a channel
//! - `NodeActor`: private task owning every connection and the server
//!
//! Each connection has its own pump task that forwards its events, in order,
//! into the actor's command channel. The actor handles one command at a time,
//! so events of one connection are never processed concurrently.
//!
//! Pump and accept tasks hold only weak senders: once every [`Node`] handle is
//! dropped (or [`Node::quit`] is called) the actor stops.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::flood::{self, FloodDecision, FloodLink};
use crate::identity::{NodeId, SequenceAllocator};
use crate::messages::Envelope;
use crate::transport::{Connection, ConnectionEvent, ConnectionId, Listener, Transport};

// ============================================================================
// Configuration
// ============================================================================

/// Capacity of the command channel between handle/pumps and the actor.
pub const DEFAULT_COMMAND_BUFFER: usize = 1024;

/// Capacity of the delivery record channel. Records are dropped when full.
pub const DEFAULT_DELIVERY_BUFFER: usize = 1024;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub command_buffer: usize,
    pub delivery_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            command_buffer: DEFAULT_COMMAND_BUFFER,
            delivery_buffer: DEFAULT_DELIVERY_BUFFER,
        }
    }
}

// ============================================================================
// Public Types
// ============================================================================

/// Which side of the node a connection belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Upstream,
    Subscriber,
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upstream => write!(f, "upstream"),
            Self::Subscriber => write!(f, "subscriber"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// One inbound envelope and what the node did with it.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub node: NodeId,
    pub connection: ConnectionId,
    pub role: Role,
    pub envelope: Envelope,
    pub decision: FloodDecision,
    /// The envelope sent on `decision`'s target, if any.
    pub forwarded: Option<Envelope>,
}

/// An outbound connection (upstream or subscriber) as seen in a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection: ConnectionId,
    pub target: SocketAddr,
    pub alive: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeCounters {
    /// Envelopes decoded on upstream/subscriber connections.
    pub received: u64,
    pub forwarded: u64,
    pub suppressed: u64,
    /// Frames that failed to decode.
    pub dropped: u64,
    pub send_failures: u64,
    /// Forwards withheld because the outbound envelope broke the wire limits.
    pub over_limit: u64,
    pub genesis_sent: u64,
}

#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub client_address: SocketAddr,
    pub server_address: Option<SocketAddr>,
    /// Address the server actually bound, once started.
    pub server_bound: Option<SocketAddr>,
    /// Accepted connections in accept order.
    pub server_connections: Vec<ConnectionId>,
    pub upstream: Option<ConnectionInfo>,
    pub subscribers: Vec<ConnectionInfo>,
    pub counters: NodeCounters,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    CreateServer(oneshot::Sender<Result<Option<SocketAddr>>>),
    CreateListener(Option<SocketAddr>, oneshot::Sender<ConnectionId>),
    HasServer(oneshot::Sender<bool>),
    HasUpstream(oneshot::Sender<bool>),
    Accepted(Connection, mpsc::UnboundedReceiver<ConnectionEvent>),
    Event {
        connection: ConnectionId,
        role: Role,
        event: ConnectionEvent,
    },
    Snapshot(oneshot::Sender<NodeSnapshot>),
    PruneDead(oneshot::Sender<usize>),
    Quit,
}

/// A receiver that can be taken exactly once.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

// ============================================================================
// Node Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Node {
    id: NodeId,
    client_address: SocketAddr,
    server_address: Option<SocketAddr>,
    cmd_tx: mpsc::Sender<Command>,
    deliveries: Arc<TakeOnce<Delivery>>,
}

impl Node {
    /// Spawn the node actor. Addresses are fixed for the node's lifetime.
    pub fn spawn(
        id: NodeId,
        client_address: SocketAddr,
        server_address: Option<SocketAddr>,
        transport: Arc<dyn Transport>,
        sequences: Arc<SequenceAllocator>,
        config: NodeConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer);
        let (delivery_tx, delivery_rx) = mpsc::channel(config.delivery_buffer);

        let actor = NodeActor {
            id,
            client_address,
            server_address,
            transport,
            sequences,
            cmd_tx: cmd_tx.downgrade(),
            delivery_tx,
            server: None,
            upstream: None,
            subscribers: Vec::new(),
            counters: NodeCounters::default(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            id,
            client_address,
            server_address,
            cmd_tx,
            deliveries: Arc::new(tokio::sync::Mutex::new(Some(delivery_rx))),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn client_address(&self) -> SocketAddr {
        self.client_address
    }

    pub fn server_address(&self) -> Option<SocketAddr> {
        self.server_address
    }

    /// `true` when the node can never accept subscribers.
    pub fn is_terminal(&self) -> bool {
        self.server_address.is_none()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow::anyhow!("node {} actor closed", self.id))?;
        rx.await.map_err(|_| anyhow::anyhow!("node {} actor closed", self.id))
    }

    /// Start listening on the server address.
    ///
    /// Returns the bound address, or `None` for a terminal node. Calling it
    /// again returns the existing server's address.
    pub async fn create_server(&self) -> Result<Option<SocketAddr>> {
        self.request(Command::CreateServer).await?
    }

    /// Open the upstream connection (`target == None`, at most once) or a new
    /// subscriber connection to `target`. Returns the connection's id.
    pub async fn create_listener(&self, target: Option<SocketAddr>) -> Result<ConnectionId> {
        self.request(|tx| Command::CreateListener(target, tx)).await
    }

    pub async fn has_server(&self) -> Result<bool> {
        self.request(Command::HasServer).await
    }

    pub async fn has_upstream(&self) -> Result<bool> {
        self.request(Command::HasUpstream).await
    }

    pub async fn snapshot(&self) -> Result<NodeSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Drop subscriber and server entries whose connection has failed or
    /// closed. Returns how many were removed. The upstream entry is kept so it
    /// is still established at most once.
    pub async fn prune_dead_connections(&self) -> Result<usize> {
        self.request(Command::PruneDead).await
    }

    /// Take the delivery record receiver. Returns `None` after the first call.
    pub async fn deliveries(&self) -> Option<mpsc::Receiver<Delivery>> {
        self.deliveries.lock().await.take()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("client_address", &self.client_address)
            .field("server_address", &self.server_address)
            .finish()
    }
}

// ============================================================================
// Node Actor (owns state)
// ============================================================================

struct ServerConnection {
    connection: Connection,
    alive: bool,
}

impl FloodLink for ServerConnection {
    fn link_id(&self) -> ConnectionId {
        self.connection.id()
    }

    fn is_open(&self) -> bool {
        self.connection.is_open()
    }
}

struct ServerState {
    local_addr: SocketAddr,
    connections: Vec<ServerConnection>,
    accept_task: JoinHandle<()>,
}

struct OwnedConnection {
    connection: Connection,
    target: SocketAddr,
    alive: bool,
}

impl OwnedConnection {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection: self.connection.id(),
            target: self.target,
            alive: self.alive,
        }
    }
}

struct NodeActor {
    id: NodeId,
    client_address: SocketAddr,
    server_address: Option<SocketAddr>,
    transport: Arc<dyn Transport>,
    sequences: Arc<SequenceAllocator>,
    cmd_tx: mpsc::WeakSender<Command>,
    delivery_tx: mpsc::Sender<Delivery>,
    server: Option<ServerState>,
    upstream: Option<OwnedConnection>,
    subscribers: Vec<OwnedConnection>,
    counters: NodeCounters,
}

impl NodeActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::CreateServer(reply) => {
                    let _ = reply.send(self.create_server().await);
                }
                Command::CreateListener(target, reply) => {
                    let _ = reply.send(self.create_listener(target));
                }
                Command::HasServer(reply) => {
                    let _ = reply.send(self.server.is_some());
                }
                Command::HasUpstream(reply) => {
                    let _ = reply.send(self.upstream.is_some());
                }
                Command::Accepted(connection, events) => {
                    self.handle_accepted(connection, events);
                }
                Command::Event { connection, role, event } => {
                    self.handle_event(connection, role, event);
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Command::PruneDead(reply) => {
                    let _ = reply.send(self.prune_dead());
                }
                Command::Quit => {
                    debug!(node = %self.id, "node actor quitting");
                    break;
                }
            }
        }

        if let Some(server) = self.server.take() {
            server.accept_task.abort();
        }
        debug!(node = %self.id, "node actor stopped");
    }

    async fn create_server(&mut self) -> Result<Option<SocketAddr>> {
        if let Some(server) = &self.server {
            return Ok(Some(server.local_addr));
        }
        let Some(addr) = self.server_address else {
            return Ok(None);
        };

        let listener = self
            .transport
            .listen(addr)
            .await
            .with_context(|| format!("node {} failed to start server", self.id))?;
        let local_addr = listener.local_addr();
        let accept_task = tokio::spawn(accept_loop(self.id, listener, self.cmd_tx.clone()));

        self.server = Some(ServerState {
            local_addr,
            connections: Vec::new(),
            accept_task,
        });
        info!(node = %self.id, %local_addr, "server has started");
        Ok(Some(local_addr))
    }

    fn create_listener(&mut self, target: Option<SocketAddr>) -> ConnectionId {
        match target {
            None => {
                if let Some(upstream) = &self.upstream {
                    return upstream.connection.id();
                }
                let connection = self.open(self.client_address, Role::Upstream);
                let id = connection.id();
                self.upstream = Some(OwnedConnection {
                    connection,
                    target: self.client_address,
                    alive: true,
                });
                id
            }
            Some(addr) => {
                let connection = self.open(addr, Role::Subscriber);
                let id = connection.id();
                self.subscribers.push(OwnedConnection {
                    connection,
                    target: addr,
                    alive: true,
                });
                id
            }
        }
    }

    fn open(&self, addr: SocketAddr, role: Role) -> Connection {
        let link = self.transport.connect(addr);
        debug!(node = %self.id, %role, %addr, connection = link.connection.id(), "connecting");
        spawn_pump(link.connection.id(), role, link.events, self.cmd_tx.clone());
        link.connection
    }

    fn handle_accepted(&mut self, connection: Connection, events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        let Some(server) = self.server.as_mut() else {
            // server torn down while the accept was in flight
            return;
        };

        let port = server.local_addr.port();
        let genesis = Envelope::genesis(self.id, self.sequences.next(), Some(port));
        match genesis.encode() {
            Ok(frame) => {
                if let Err(e) = connection.send(frame) {
                    warn!(node = %self.id, connection = connection.id(), error = %e, "failed to send genesis");
                    self.counters.send_failures += 1;
                } else {
                    self.counters.genesis_sent += 1;
                }
            }
            Err(e) => warn!(node = %self.id, error = %e, "failed to encode genesis"),
        }
        info!(
            node = %self.id,
            connection = connection.id(),
            peer = %connection.peer(),
            sequence = %genesis.sequence_id,
            "connection made and sent genesis"
        );

        spawn_pump(connection.id(), Role::Server, events, self.cmd_tx.clone());
        server.connections.push(ServerConnection { connection, alive: true });
    }

    fn handle_event(&mut self, connection: ConnectionId, role: Role, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Open => {
                info!(node = %self.id, %role, connection, "connection opened");
            }
            ConnectionEvent::Error(e) => {
                warn!(node = %self.id, %role, connection, error = %e, "connection error");
                self.mark_dead(connection);
            }
            ConnectionEvent::Closed => {
                debug!(node = %self.id, %role, connection, "connection closed");
                self.mark_dead(connection);
            }
            ConnectionEvent::Message(frame) => match role {
                Role::Server => {
                    trace!(node = %self.id, connection, "ignoring frame on server-side connection");
                }
                Role::Upstream | Role::Subscriber => self.handle_message(connection, role, &frame),
            },
        }
    }

    fn handle_message(&mut self, source: ConnectionId, role: Role, frame: &[u8]) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(node = %self.id, %role, connection = source, error = %e, "dropping undecodable frame");
                self.counters.dropped += 1;
                return;
            }
        };
        self.counters.received += 1;
        debug!(
            node = %self.id,
            %role,
            connection = source,
            visited = ?envelope.visited_nodes,
            sequence = %envelope.sequence_id,
            "received envelope"
        );

        let decision = flood::select_target(
            self.id,
            self.server.as_ref().map(|s| s.connections.as_slice()),
            source,
            &envelope,
        );

        let (decision, forwarded) = match decision {
            FloodDecision::Forward { target } => self.forward(target, &envelope),
            FloodDecision::AlreadyVisited { at } => {
                self.counters.suppressed += 1;
                info!(node = %self.id, connection = at, "already visited, not broadcasting");
                (decision, None)
            }
            FloodDecision::NoServer
            | FloodDecision::NoPeers
            | FloodDecision::Exhausted
            | FloodDecision::OverLimit { .. } => {
                trace!(node = %self.id, ?decision, "nothing to broadcast");
                (decision, None)
            }
        };

        let _ = self.delivery_tx.try_send(Delivery {
            node: self.id,
            connection: source,
            role,
            envelope,
            decision,
            forwarded,
        });
    }

    /// Send `envelope`, extended by this node, on `target`. Returns the final
    /// decision and the envelope actually sent.
    fn forward(&mut self, target: ConnectionId, envelope: &Envelope) -> (FloodDecision, Option<Envelope>) {
        let selected = FloodDecision::Forward { target };
        let Some(connection) = self
            .server
            .as_ref()
            .and_then(|s| s.connections.iter().find(|c| c.connection.id() == target))
            .map(|c| c.connection.clone())
        else {
            return (selected, None);
        };

        let outbound = envelope.clone().forwarded_by(self.id, self.sequences.next());
        let frame = match outbound.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node = %self.id, error = %e, "failed to encode envelope");
                return (selected, None);
            }
        };

        // peers would reject it on decode
        if let Err(e) = outbound.check_limits(frame.len()) {
            warn!(node = %self.id, connection = target, error = %e, "envelope exceeds wire limits, not broadcasting");
            self.counters.over_limit += 1;
            return (FloodDecision::OverLimit { target }, None);
        }

        if let Err(e) = connection.send(frame) {
            warn!(node = %self.id, connection = target, error = %e, "broadcast send failed");
            self.counters.send_failures += 1;
            return (selected, None);
        }

        self.counters.forwarded += 1;
        info!(
            node = %self.id,
            connection = target,
            peer = %connection.peer(),
            visited = ?outbound.visited_nodes,
            sequence = %outbound.sequence_id,
            "broadcasting"
        );
        (selected, Some(outbound))
    }

    fn mark_dead(&mut self, connection: ConnectionId) {
        if let Some(upstream) = self.upstream.as_mut()
            && upstream.connection.id() == connection
        {
            upstream.alive = false;
            return;
        }
        if let Some(sub) = self.subscribers.iter_mut().find(|s| s.connection.id() == connection) {
            sub.alive = false;
            return;
        }
        if let Some(server) = self.server.as_mut()
            && let Some(conn) = server.connections.iter_mut().find(|c| c.connection.id() == connection)
        {
            conn.alive = false;
        }
    }

    fn prune_dead(&mut self) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.alive);
        let mut removed = before - self.subscribers.len();

        if let Some(server) = self.server.as_mut() {
            let before = server.connections.len();
            server.connections.retain(|c| c.alive);
            removed += before - server.connections.len();
        }

        if removed > 0 {
            debug!(node = %self.id, removed, "pruned dead connections");
        }
        removed
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id,
            client_address: self.client_address,
            server_address: self.server_address,
            server_bound: self.server.as_ref().map(|s| s.local_addr),
            server_connections: self
                .server
                .as_ref()
                .map(|s| s.connections.iter().map(|c| c.connection.id()).collect())
                .unwrap_or_default(),
            upstream: self.upstream.as_ref().map(OwnedConnection::info),
            subscribers: self.subscribers.iter().map(OwnedConnection::info).collect(),
            counters: self.counters.clone(),
        }
    }
}

// ============================================================================
// Background Tasks
// ============================================================================

/// Forward one connection's events into the actor, in order.
fn spawn_pump(
    connection: ConnectionId,
    role: Role,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    cmd_tx: mpsc::WeakSender<Command>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(tx) = cmd_tx.upgrade() else {
                break;
            };
            if tx.send(Command::Event { connection, role, event }).await.is_err() {
                break;
            }
        }
    });
}

async fn accept_loop(node: NodeId, mut listener: Listener, cmd_tx: mpsc::WeakSender<Command>) {
    while let Some(link) = listener.accept().await {
        let Some(tx) = cmd_tx.upgrade() else {
            break;
        };
        if tx.send(Command::Accepted(link.connection, link.events)).await.is_err() {
            break;
        }
    }
    debug!(%node, "accept loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{NodeIdAllocator, SequenceId};
    use crate::memory::MemoryTransport;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    struct Fixture {
        transport: Arc<MemoryTransport>,
        ids: NodeIdAllocator,
        sequences: Arc<SequenceAllocator>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                transport: Arc::new(MemoryTransport::new()),
                ids: NodeIdAllocator::new(),
                sequences: Arc::new(SequenceAllocator::new()),
            }
        }

        fn node(&self, client: u16, server: Option<u16>) -> Node {
            Node::spawn(
                self.ids.next(),
                addr(client),
                server.map(addr),
                self.transport.clone(),
                self.sequences.clone(),
                NodeConfig::default(),
            )
        }
    }

    async fn recv_envelope(link: &mut crate::transport::Link) -> Envelope {
        loop {
            match timeout(WAIT, link.events.recv()).await.unwrap() {
                Some(ConnectionEvent::Message(frame)) => return Envelope::decode(&frame).unwrap(),
                Some(_) => continue,
                None => panic!("connection ended before an envelope arrived"),
            }
        }
    }

    #[tokio::test]
    async fn terminal_node_has_no_server() {
        let fx = Fixture::new();
        let node = fx.node(9000, None);
        assert!(node.is_terminal());
        assert_eq!(node.create_server().await.unwrap(), None);
        assert!(!node.has_server().await.unwrap());
    }

    #[tokio::test]
    async fn create_server_is_idempotent() {
        let fx = Fixture::new();
        let node = fx.node(9001, Some(9000));
        assert_eq!(node.create_server().await.unwrap(), Some(addr(9000)));
        assert_eq!(node.create_server().await.unwrap(), Some(addr(9000)));
        assert!(node.has_server().await.unwrap());
    }

    #[tokio::test]
    async fn server_sends_genesis_on_accept() {
        let fx = Fixture::new();
        let node = fx.node(9001, Some(9000));
        node.create_server().await.unwrap();

        let mut client = fx.transport.connect(addr(9000));
        let genesis = recv_envelope(&mut client).await;

        assert_eq!(genesis.visited_nodes, vec![node.id()]);
        assert!(genesis.payload.is_none());
        assert_eq!(genesis.port, Some(9000));

        let snap = node.snapshot().await.unwrap();
        assert_eq!(snap.server_connections.len(), 1);
        assert_eq!(snap.counters.genesis_sent, 1);
    }

    #[tokio::test]
    async fn upstream_is_established_once() {
        let fx = Fixture::new();
        let _listener = fx.transport.listen(addr(9100)).await.unwrap();
        let node = fx.node(9100, None);

        let first = node.create_listener(None).await.unwrap();
        let second = node.create_listener(None).await.unwrap();
        assert_eq!(first, second);
        assert!(node.has_upstream().await.unwrap());
        let upstream = node.snapshot().await.unwrap().upstream.unwrap();
        assert_eq!(upstream.connection, first);
        assert_eq!(upstream.target, addr(9100));
        assert!(upstream.alive);
    }

    #[tokio::test]
    async fn refused_upstream_is_reported_dead() {
        let fx = Fixture::new();
        let node = fx.node(9150, None);
        let conn = node.create_listener(None).await.unwrap();

        timeout(WAIT, async {
            loop {
                let upstream = node.snapshot().await.unwrap().upstream.unwrap();
                if !upstream.alive {
                    assert_eq!(upstream.connection, conn);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // kept after pruning so it is still established at most once
        assert_eq!(node.prune_dead_connections().await.unwrap(), 0);
        assert_eq!(node.create_listener(None).await.unwrap(), conn);
    }

    #[tokio::test]
    async fn subscribers_accumulate() {
        let fx = Fixture::new();
        let _a = fx.transport.listen(addr(9200)).await.unwrap();
        let _b = fx.transport.listen(addr(9201)).await.unwrap();
        let node = fx.node(9300, None);

        node.create_listener(Some(addr(9200))).await.unwrap();
        node.create_listener(Some(addr(9201))).await.unwrap();
        node.create_listener(Some(addr(9200))).await.unwrap();

        let targets: Vec<_> = node.snapshot().await.unwrap().subscribers.iter().map(|s| s.target).collect();
        assert_eq!(targets, vec![addr(9200), addr(9201), addr(9200)]);
    }

    #[tokio::test]
    async fn failed_subscription_is_marked_dead_and_prunable() {
        let fx = Fixture::new();
        let node = fx.node(9400, None);
        let conn = node.create_listener(Some(addr(9999))).await.unwrap();

        timeout(WAIT, async {
            loop {
                let snap = node.snapshot().await.unwrap();
                if snap.subscribers.iter().any(|s| s.connection == conn && !s.alive) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(node.prune_dead_connections().await.unwrap(), 1);
        assert!(node.snapshot().await.unwrap().subscribers.is_empty());
    }

    #[tokio::test]
    async fn node_without_server_never_forwards() {
        let fx = Fixture::new();
        let node = fx.node(9501, None);
        let mut deliveries = node.deliveries().await.unwrap();
        assert!(node.deliveries().await.is_none());

        let mut listener = fx.transport.listen(addr(9500)).await.unwrap();
        node.create_listener(Some(addr(9500))).await.unwrap();
        let remote = listener.accept().await.unwrap();
        let env = Envelope::genesis(NodeId::new(77), SequenceId::new(0), None);
        remote.connection.send(env.encode().unwrap()).unwrap();

        let delivery = timeout(WAIT, deliveries.recv()).await.unwrap().unwrap();
        assert_eq!(delivery.decision, FloodDecision::NoServer);
        assert!(delivery.forwarded.is_none());
        assert_eq!(node.snapshot().await.unwrap().counters.forwarded, 0);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let fx = Fixture::new();
        let node = fx.node(9601, None);
        let mut listener = fx.transport.listen(addr(9600)).await.unwrap();
        node.create_listener(Some(addr(9600))).await.unwrap();
        let remote = listener.accept().await.unwrap();

        remote.connection.send(b"{not an envelope".to_vec()).unwrap();
        remote
            .connection
            .send(Envelope::genesis(NodeId::new(1), SequenceId::new(0), None).encode().unwrap())
            .unwrap();

        let mut deliveries = node.deliveries().await.unwrap();
        timeout(WAIT, deliveries.recv()).await.unwrap().unwrap();
        let counters = node.snapshot().await.unwrap().counters;
        assert_eq!(counters.dropped, 1);
        assert_eq!(counters.received, 1);
    }

    #[tokio::test]
    async fn quit_stops_the_actor() {
        let fx = Fixture::new();
        let node = fx.node(9700, None);
        node.quit().await;
        timeout(WAIT, async {
            while node.snapshot().await.is_ok() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
