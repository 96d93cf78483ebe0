//! # floodmesh - Flooding Overlay Simulator
//!
//! floodmesh builds a small network of peer nodes that exchange messages by
//! flooding. A node receiving an envelope forwards it onward unless the
//! envelope has already visited it.
//!
//! - **Envelopes** carry a visited-node list for loop suppression, a fresh
//!   sequence id per hop, and the superseded envelope as a nested payload
//! - **Topology**: every new node is wired to every previously created node
//! - **Transport**: a trait seam with TCP and in-memory implementations
//!
//! ## Architecture
//!
//! Each node is an actor: a cheap [`Node`] handle talks to a private task that
//! owns all of the node's connections. One pump task per connection feeds its
//! events to the actor in order.
//!
//! ```text
//! ┌──────────────┐   wires    ┌──────────┐  listen/connect  ┌───────────┐
//! │   Network    │──────────► │   Node   │ ───────────────► │ Transport │
//! └──────────────┘            └────┬─────┘                  └───────────┘
//!                                  │ on message
//!                                  ▼
//!                           flood::select_target
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Node and sequence id allocators |
//! | `messages` | Envelope type and JSON codec |
//! | `flood` | Broadcast target selection |
//! | `node` | Node handle and actor |
//! | `topology` | Address allocation and network construction |
//! | `transport` | Transport trait, connection handles, events |
//! | `tcp` | TCP transport |
//! | `memory` | In-process transport |

pub mod flood;
pub mod identity;
pub mod memory;
pub mod messages;
pub mod node;
pub mod tcp;
pub mod topology;
pub mod transport;

pub use flood::FloodDecision;
pub use identity::{Allocators, NodeId, NodeIdAllocator, SequenceAllocator, SequenceId};
pub use memory::MemoryTransport;
pub use messages::{DecodeError, Envelope, MAX_ENVELOPE_DEPTH, MAX_ENVELOPE_SIZE};
pub use node::{ConnectionInfo, Delivery, Node, NodeConfig, NodeCounters, NodeSnapshot, Role};
pub use tcp::TcpTransport;
pub use topology::{AddressAllocator, Network, TopologyConfig};
pub use transport::{Connection, ConnectionEvent, ConnectionId, Link, Listener, Transport};
