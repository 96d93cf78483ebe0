//! # Flooding Rule
//!
//! Decides where an inbound envelope goes next. The rule is a pure function
//! over the node's server-side connections so it can be exercised without a
//! running network; [`Node`](crate::node::Node) applies the decision.
//!
//! ## Target Selection
//!
//! Server connections are scanned in accept order:
//!
//! | Check | Outcome |
//! |-------|---------|
//! | connection not open | skip, keep scanning |
//! | connection is the source | skip, keep scanning |
//! | node already in `visitedNodes` | stop, suppress |
//! | otherwise | stop, forward here |
//!
//! At most one connection receives the forward, even when several are
//! eligible. A node without a server, or whose server holds at most one
//! connection, does nothing. The node turns a selected forward into
//! `OverLimit` when the extended envelope would break the wire limits.

use tracing::{debug, trace};

use crate::identity::NodeId;
use crate::messages::Envelope;
use crate::transport::ConnectionId;

/// What the flooding rule needs to know about a candidate connection.
pub trait FloodLink {
    fn link_id(&self) -> ConnectionId;
    fn is_open(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloodDecision {
    /// The node owns no server.
    NoServer,
    /// The server has at most one connection.
    NoPeers,
    /// The first eligible connection was reached, but the envelope has
    /// already visited this node.
    AlreadyVisited { at: ConnectionId },
    /// Forward on this connection.
    Forward { target: ConnectionId },
    /// Every connection was closed or was the source.
    Exhausted,
    /// A target was selected, but the outbound envelope would break the wire
    /// limits and was not sent.
    OverLimit { target: ConnectionId },
}

impl FloodDecision {
    pub fn target(&self) -> Option<ConnectionId> {
        match self {
            Self::Forward { target } => Some(*target),
            _ => None,
        }
    }
}

/// Select the single forward target for `envelope` arriving on `source`.
pub fn select_target<L: FloodLink>(
    node: NodeId,
    server_links: Option<&[L]>,
    source: ConnectionId,
    envelope: &Envelope,
) -> FloodDecision {
    let Some(links) = server_links else {
        return FloodDecision::NoServer;
    };
    // the lone connection is normally this node's own upstream
    if links.len() <= 1 {
        return FloodDecision::NoPeers;
    }

    let visited = envelope.has_visited(node);
    for link in links {
        let id = link.link_id();
        if !link.is_open() {
            debug!(%node, connection = id, "connection not open, skipping");
            continue;
        }
        if id == source {
            trace!(%node, connection = id, "not echoing to source");
            continue;
        }
        if visited {
            return FloodDecision::AlreadyVisited { at: id };
        }
        return FloodDecision::Forward { target: id };
    }

    FloodDecision::Exhausted
}
