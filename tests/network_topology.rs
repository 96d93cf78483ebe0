//! End-to-end tests of network construction and multi-hop flooding.
//!
//! Most tests use the in-memory transport so fixed addresses never collide.
//! The TCP test draws its base port from a process-wide counter.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use floodmesh::{
    Delivery, FloodDecision, MemoryTransport, Network, Node, NodeId, NodeSnapshot, Role, TcpTransport,
    TopologyConfig, Transport,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const LONG_TIMEOUT: Duration = Duration::from_secs(120);

static NEXT_TCP_BASE: AtomicU16 = AtomicU16::new(41000);

// =============================================================================
// Helper Functions
// =============================================================================

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

fn ids(raw: &[u64]) -> Vec<NodeId> {
    raw.iter().copied().map(NodeId::new).collect()
}

fn config(nodes: usize, base: u16) -> TopologyConfig {
    TopologyConfig {
        nodes,
        base_addr: addr(base),
        ..Default::default()
    }
}

async fn memory_network(config: TopologyConfig) -> Network {
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    timeout(TEST_TIMEOUT, Network::build(transport, config))
        .await
        .expect("build timed out")
        .expect("build failed")
}

/// Poll until `node` reports `count` accepted connections.
async fn settle(node: &Node, count: usize) -> NodeSnapshot {
    timeout(TEST_TIMEOUT, async {
        loop {
            let snap = node.snapshot().await.unwrap();
            if snap.server_connections.len() >= count {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("node never settled")
}

async fn wait_for(rx: &mut mpsc::Receiver<Delivery>, visited: &[u64]) -> Delivery {
    let wanted = ids(visited);
    timeout(TEST_TIMEOUT, async {
        loop {
            let delivery = rx.recv().await.expect("delivery channel closed");
            if delivery.envelope.visited_nodes == wanted {
                return delivery;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no delivery with visited {:?}", visited))
}

/// Funnel the delivery records of every node into one receiver.
async fn merged_deliveries(network: &Network) -> mpsc::Receiver<Delivery> {
    let (tx, rx) = mpsc::channel(1024);
    for node in network.nodes() {
        let mut node_rx = node.deliveries().await.expect("deliveries already taken");
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(delivery) = node_rx.recv().await {
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
        });
    }
    rx
}

// =============================================================================
// Topology Shape
// =============================================================================

#[tokio::test]
async fn three_node_wiring() {
    let network = memory_network(config(3, 8000)).await;
    assert_eq!(network.len(), 3);

    let n0 = network.node(0).unwrap();
    let n1 = network.node(1).unwrap();
    let n2 = network.node(2).unwrap();

    assert!(n0.is_terminal());
    assert_eq!(n0.client_address(), addr(8000));
    assert_eq!(n1.server_address(), Some(addr(8000)));
    assert_eq!(n2.server_address(), Some(addr(8001)));

    let s0 = n0.snapshot().await.unwrap();
    assert!(s0.server_bound.is_none());
    assert!(s0.upstream.is_some());
    assert!(s0.subscribers.is_empty());

    // N0's upstream, N1's own subscription, N2's subscription
    let s1 = settle(n1, 3).await;
    assert_eq!(s1.server_bound, Some(addr(8000)));
    assert!(s1.upstream.is_some());
    let targets: Vec<_> = s1.subscribers.iter().map(|s| s.target).collect();
    assert_eq!(targets, vec![addr(8000)]);

    // N1's upstream, N2's own subscription
    let s2 = settle(n2, 2).await;
    assert!(s2.upstream.is_none());
    let targets: Vec<_> = s2.subscribers.iter().map(|s| s.target).collect();
    assert_eq!(targets, vec![addr(8000), addr(8001)]);

    network.shutdown().await;
}

#[tokio::test]
async fn skip_self_subscription_leaves_out_own_server() {
    let network = memory_network(TopologyConfig {
        skip_self_subscription: true,
        ..config(3, 8000)
    })
    .await;

    let s1 = settle(network.node(1).unwrap(), 2).await;
    assert!(s1.subscribers.is_empty());

    let s2 = settle(network.node(2).unwrap(), 1).await;
    let targets: Vec<_> = s2.subscribers.iter().map(|s| s.target).collect();
    assert_eq!(targets, vec![addr(8000)]);
}

#[tokio::test]
async fn node_ids_are_sequential_per_network() {
    let a = memory_network(config(4, 8000)).await;
    let b = memory_network(config(2, 9000)).await;

    let ids_a: Vec<_> = a.nodes().iter().map(|n| n.id()).collect();
    let ids_b: Vec<_> = b.nodes().iter().map(|n| n.id()).collect();
    assert_eq!(ids_a, ids(&[0, 1, 2, 3]));
    assert_eq!(ids_b, ids(&[0, 1]));
    assert_eq!(a.allocators().node_ids.peek(), NodeId::new(4));
}

#[tokio::test]
async fn occupied_server_address_fails_build() {
    let transport = Arc::new(MemoryTransport::new());
    let _squatter = transport.listen(addr(8000)).await.unwrap();
    let result = Network::build(transport, config(2, 8000)).await;
    assert!(result.is_err());
}

// =============================================================================
// Multi-hop Flooding
// =============================================================================

#[tokio::test]
async fn genesis_reaches_a_further_hop() {
    let network = memory_network(config(3, 8000)).await;
    let mut d0 = network.node(0).unwrap().deliveries().await.unwrap();

    // N2's genesis, forwarded by N1 into N0's upstream
    let delivery = wait_for(&mut d0, &[1, 2]).await;
    assert_eq!(delivery.role, Role::Upstream);
    assert_eq!(delivery.decision, FloodDecision::NoServer);
    assert_eq!(delivery.envelope.depth(), 1);
    let inner = delivery.envelope.payload.as_deref().unwrap();
    assert_eq!(inner.visited_nodes, ids(&[2]));
    assert!(delivery.envelope.sequence_id > inner.sequence_id);
}

#[tokio::test]
async fn new_node_genesis_crosses_two_hops() {
    let mut network = memory_network(config(3, 8000)).await;
    settle(network.node(1).unwrap(), 3).await;
    settle(network.node(2).unwrap(), 2).await;

    let mut d0 = network.node(0).unwrap().deliveries().await.unwrap();
    let mut d1 = network.node(1).unwrap().deliveries().await.unwrap();

    let n3 = network.add_node().await.unwrap();
    assert_eq!(n3.id(), NodeId::new(3));
    assert_eq!(n3.server_address(), Some(addr(8002)));

    // N2 forwards [3] on its first accepted connection, N1's upstream
    let at_n1 = wait_for(&mut d1, &[2, 3]).await;
    assert_eq!(at_n1.role, Role::Upstream);
    let forwarded = at_n1.forwarded.expect("N1 should forward");
    assert_eq!(forwarded.visited_nodes, ids(&[1, 2, 3]));
    assert!(matches!(at_n1.decision, FloodDecision::Forward { .. }));

    let at_n0 = wait_for(&mut d0, &[1, 2, 3]).await;
    assert_eq!(at_n0.envelope.depth(), 2);
    assert_eq!(at_n0.envelope.origin(), Some(NodeId::new(3)));
}

#[tokio::test]
async fn genesis_crosses_a_chain_longer_than_json_recursion_limit() {
    const NODES: usize = 140;
    let last = NodeId::new(NODES as u64 - 1);

    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    let mut network = Network::new(transport, config(NODES, 10000)).unwrap();

    // drain node 0 while the network grows; its record buffer would fill
    let mut d0 = network.add_node().await.unwrap().deliveries().await.unwrap();
    let (found_tx, found_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        while let Some(delivery) = d0.recv().await {
            if delivery.envelope.origin() == Some(last) {
                let _ = found_tx.send(delivery);
                return;
            }
        }
    });

    timeout(LONG_TIMEOUT, async {
        for _ in 1..NODES {
            network.add_node().await.unwrap();
        }
    })
    .await
    .expect("build timed out");

    // the last genesis is forwarded by every node from NODES-2 down to 1
    let delivery = timeout(LONG_TIMEOUT, found_rx)
        .await
        .expect("genesis of the last node never reached node 0")
        .unwrap();
    let chain: Vec<u64> = (1..NODES as u64).collect();
    assert_eq!(delivery.envelope.visited_nodes, ids(&chain));
    assert_eq!(delivery.envelope.depth(), NODES - 2);

    let mut dropped = 0;
    let mut over_limit = 0;
    for snap in network.snapshot().await.unwrap() {
        dropped += snap.counters.dropped;
        over_limit += snap.counters.over_limit;
    }
    assert_eq!(dropped, 0);
    assert_eq!(over_limit, 0);

    network.shutdown().await;
}

#[tokio::test]
async fn loop_is_suppressed_where_it_started() {
    let network = memory_network(config(3, 8000)).await;
    let mut d1 = network.node(1).unwrap().deliveries().await.unwrap();

    // N1's genesis to its own subscription comes straight back
    let delivery = wait_for(&mut d1, &[1]).await;
    assert_eq!(delivery.role, Role::Subscriber);
    assert!(matches!(delivery.decision, FloodDecision::AlreadyVisited { .. }));
    assert!(delivery.forwarded.is_none());
}

// =============================================================================
// TCP
// =============================================================================

#[tokio::test]
async fn tcp_network_floods() {
    let base = NEXT_TCP_BASE.fetch_add(16, Ordering::SeqCst);
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
    let network = timeout(TEST_TIMEOUT, Network::build(transport, config(3, base)))
        .await
        .expect("build timed out")
        .expect("tcp build failed");

    let s1 = settle(network.node(1).unwrap(), 3).await;
    assert_eq!(s1.server_bound, Some(addr(base)));

    // N1 forwards N2's genesis on whichever connection its server accepted
    // first; TCP does not fix that order, so watch every node
    let mut all = merged_deliveries(&network).await;
    let delivery = wait_for(&mut all, &[1, 2]).await;
    assert_eq!(delivery.envelope.depth(), 1);
    assert_eq!(delivery.envelope.origin(), Some(NodeId::new(2)));

    network.shutdown().await;
}
