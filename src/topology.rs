//! # Topology Construction
//!
//! [`Network`] builds a fixed-size overlay by adding nodes one at a time and
//! wiring each new node to **every** node created before it.
//!
//! ## Addressing
//!
//! [`AddressAllocator`] hands out address pairs from a base address:
//!
//! | Node | client | server |
//! |------|--------|--------|
//! | 0 (terminal) | base | none |
//! | 1 | base+1 | base |
//! | 2 | base+2 | base+1 |
//! | k | base+k | base+k-1 |
//!
//! Every client address is unique and never reused; each server address is
//! the previous node's client address.
//!
//! ## Wiring
//!
//! When node K is added, for each earlier node J in creation order:
//!
//! 1. K starts its server if it has none
//! 2. J opens its upstream connection if it has none
//! 3. K opens a subscriber connection to J's client address
//!
//! With chained addresses, step 3 for J = K-1 targets K's own server.
//! `TopologyConfig::skip_self_subscription` leaves that connection out.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::identity::Allocators;
use crate::node::{Node, NodeConfig, NodeSnapshot};
use crate::transport::Transport;

/// Default network size.
pub const DEFAULT_NODE_COUNT: usize = 5;

/// Default base address of the first node.
pub const DEFAULT_BASE_ADDR: &str = "127.0.0.1:8000";

#[derive(Clone, Debug)]
pub struct TopologyConfig {
    pub nodes: usize,
    pub base_addr: SocketAddr,
    pub skip_self_subscription: bool,
    pub node: NodeConfig,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            nodes: DEFAULT_NODE_COUNT,
            base_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            skip_self_subscription: false,
            node: NodeConfig::default(),
        }
    }
}

// ============================================================================
// Address Allocation
// ============================================================================

/// Issues the address pair of each new node. Owned by one network.
#[derive(Clone, Debug)]
pub struct AddressAllocator {
    base: SocketAddr,
    /// Port of the most recently issued client address.
    current: Option<u16>,
}

impl AddressAllocator {
    pub fn new(base: SocketAddr) -> Self {
        Self { base, current: None }
    }

    /// Address pair for the next node: `(client, server)`. The first call
    /// returns the terminal node's pair with no server.
    pub fn next_pair(&mut self) -> Result<(SocketAddr, Option<SocketAddr>)> {
        match self.current {
            None => {
                self.current = Some(self.base.port());
                Ok((self.base, None))
            }
            Some(port) => {
                let next = port
                    .checked_add(1)
                    .with_context(|| format!("port space exhausted after {}", port))?;
                self.current = Some(next);
                Ok((self.with_port(next), Some(self.with_port(port))))
            }
        }
    }

    fn with_port(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.base.ip(), port)
    }
}

// ============================================================================
// Network Builder
// ============================================================================

pub struct Network {
    transport: Arc<dyn Transport>,
    allocators: Allocators,
    addresses: AddressAllocator,
    config: TopologyConfig,
    nodes: Vec<Node>,
}

impl Network {
    /// Empty network; nodes are added with [`add_node`](Self::add_node).
    pub fn new(transport: Arc<dyn Transport>, config: TopologyConfig) -> Result<Self> {
        if config.base_addr.port() == 0 {
            anyhow::bail!("base address {} must name a concrete port", config.base_addr);
        }
        Ok(Self {
            transport,
            allocators: Allocators::new(),
            addresses: AddressAllocator::new(config.base_addr),
            config,
            nodes: Vec::new(),
        })
    }

    /// Create and wire `config.nodes` nodes.
    pub async fn build(transport: Arc<dyn Transport>, config: TopologyConfig) -> Result<Self> {
        let count = config.nodes;
        let mut network = Self::new(transport, config)?;
        for _ in 0..count {
            network.add_node().await?;
        }
        info!(nodes = network.len(), "network built");
        Ok(network)
    }

    /// Create one node and wire it to every existing node.
    pub async fn add_node(&mut self) -> Result<&Node> {
        let (client, server) = self.addresses.next_pair()?;
        let node = Node::spawn(
            self.allocators.node_ids.next(),
            client,
            server,
            self.transport.clone(),
            self.allocators.sequences.clone(),
            self.config.node.clone(),
        );
        info!(node = %node.id(), client = %client, server = ?server, "node created");

        for old in &self.nodes {
            self.connect_nodes(&node, old).await?;
        }

        self.nodes.push(node);
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    async fn connect_nodes(&self, new: &Node, old: &Node) -> Result<()> {
        if !new.has_server().await? {
            new.create_server().await?;
        }
        if !old.has_upstream().await? {
            old.create_listener(None).await?;
        }
        if self.config.skip_self_subscription && new.server_address() == Some(old.client_address()) {
            debug!(node = %new.id(), target = %old.client_address(), "skipping subscription to own server");
            return Ok(());
        }
        new.create_listener(Some(old.client_address())).await?;
        Ok(())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn allocators(&self) -> &Allocators {
        &self.allocators
    }

    pub async fn snapshot(&self) -> Result<Vec<NodeSnapshot>> {
        let mut snapshots = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            snapshots.push(node.snapshot().await?);
        }
        Ok(snapshots)
    }

    /// Stop every node actor.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.quit().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SocketAddr {
        "127.0.0.1:8000".parse().unwrap()
    }

    fn at(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn default_config_matches_constants() {
        let config = TopologyConfig::default();
        assert_eq!(config.nodes, DEFAULT_NODE_COUNT);
        assert_eq!(config.base_addr, DEFAULT_BASE_ADDR.parse::<SocketAddr>().unwrap());
        assert!(!config.skip_self_subscription);
    }

    #[test]
    fn address_pairs_chain() {
        let mut alloc = AddressAllocator::new(base());
        assert_eq!(alloc.next_pair().unwrap(), (at(8000), None));
        assert_eq!(alloc.next_pair().unwrap(), (at(8001), Some(at(8000))));
        assert_eq!(alloc.next_pair().unwrap(), (at(8002), Some(at(8001))));
    }

    #[test]
    fn client_addresses_never_repeat() {
        let mut alloc = AddressAllocator::new(base());
        let clients: Vec<_> = (0..50).map(|_| alloc.next_pair().unwrap().0).collect();
        let unique: std::collections::HashSet<_> = clients.iter().collect();
        assert_eq!(unique.len(), clients.len());
    }

    #[test]
    fn port_exhaustion_is_an_error() {
        let mut alloc = AddressAllocator::new(at(u16::MAX));
        assert_eq!(alloc.next_pair().unwrap(), (at(u16::MAX), None));
        assert!(alloc.next_pair().is_err());
    }

    #[tokio::test]
    async fn port_zero_base_rejected() {
        let transport = Arc::new(crate::memory::MemoryTransport::new());
        let config = TopologyConfig {
            base_addr: at(0),
            ..Default::default()
        };
        assert!(Network::new(transport, config).is_err());
    }
}
