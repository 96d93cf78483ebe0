//! # Wire Protocol Messages
//!
//! This module defines the [`Envelope`], the only message type exchanged
//! between nodes, and its JSON codec.
//!
//! ## Wire Format
//!
//! ```text
//! {
//!   "visitedNodes": [2, 1],      // most recent first
//!   "sequenceID": 17,            // fresh per envelope instance
//!   "payload": { ... },          // superseded envelope, absent on genesis
//!   "port": 8001                 // genesis only: listening port of the origin
//! }
//! ```
//!
//! `oldData` is accepted as an alias of `payload` when decoding.
//!
//! ## Envelope Evolution
//!
//! | Step | visitedNodes | payload |
//! |------|--------------|---------|
//! | genesis at server S | `[S]` | absent |
//! | forward by A | `[A, S]` | genesis |
//! | forward by B | `[B, A, S]` | `[A, S]` envelope |
//!
//! Nesting grows by one level per hop, so depth equals the number of forwards.
//!
//! ## Limits
//!
//! - `MAX_ENVELOPE_SIZE`: encoded size bound (1 MiB), enforced before parsing
//! - `MAX_ENVELOPE_DEPTH`: nesting bound, enforced after parsing
//!
//! Both limits are checked by [`Envelope::check_limits`], which the decoder
//! and the forwarding path share, so a node never sends an envelope its peers
//! would reject. Parsing and encoding run through `serde_stacker`, which grows
//! the stack on demand instead of relying on serde_json's recursion limit.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{NodeId, SequenceId};

/// Maximum encoded envelope size (1 MiB).
/// SECURITY: Checked before parsing so oversized frames never allocate a tree.
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Maximum nesting depth (forwards since genesis).
///
/// A chain of this length carries visited lists totalling over half a million
/// ids, so `MAX_ENVELOPE_SIZE` is normally reached first.
pub const MAX_ENVELOPE_DEPTH: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "visitedNodes", default)]
    pub visited_nodes: Vec<NodeId>,
    #[serde(rename = "sequenceID")]
    pub sequence_id: SequenceId,
    #[serde(default, alias = "oldData", skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<Envelope>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Envelope {
    /// The envelope a server sends to every connection it accepts.
    pub fn genesis(origin: NodeId, sequence_id: SequenceId, port: Option<u16>) -> Self {
        Self {
            visited_nodes: vec![origin],
            sequence_id,
            payload: None,
            port,
        }
    }

    /// Wrap `self` as the payload of a new envelope forwarded by `node`.
    pub fn forwarded_by(self, node: NodeId, sequence_id: SequenceId) -> Self {
        debug_assert_ne!(self.head(), Some(node), "node must not forward its own hop twice");

        let mut visited_nodes = Vec::with_capacity(self.visited_nodes.len() + 1);
        visited_nodes.push(node);
        visited_nodes.extend_from_slice(&self.visited_nodes);

        Self {
            visited_nodes,
            sequence_id,
            payload: Some(Box::new(self)),
            port: None,
        }
    }

    pub fn has_visited(&self, node: NodeId) -> bool {
        self.visited_nodes.contains(&node)
    }

    /// Most recently visited node.
    pub fn head(&self) -> Option<NodeId> {
        self.visited_nodes.first().copied()
    }

    /// Node that minted the genesis envelope of this chain.
    pub fn origin(&self) -> Option<NodeId> {
        self.visited_nodes.last().copied()
    }

    /// Number of forwards since genesis.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(inner) = current.payload.as_deref() {
            depth += 1;
            current = inner;
        }
        depth
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::new();
        let mut ser = serde_json::Serializer::new(&mut out);
        self.serialize(serde_stacker::Serializer::new(&mut ser))?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(DecodeError::TooLarge(bytes.len()));
        }

        let mut de = serde_json::Deserializer::from_slice(bytes);
        de.disable_recursion_limit();
        let envelope = Self::deserialize(serde_stacker::Deserializer::new(&mut de))
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        de.end().map_err(|e| DecodeError::Malformed(e.to_string()))?;

        envelope.check_limits(bytes.len())?;
        Ok(envelope)
    }

    /// Whether an envelope encoded to `encoded_len` bytes is acceptable on the
    /// wire.
    pub fn check_limits(&self, encoded_len: usize) -> Result<(), DecodeError> {
        if encoded_len > MAX_ENVELOPE_SIZE {
            return Err(DecodeError::TooLarge(encoded_len));
        }
        let depth = self.depth();
        if depth > MAX_ENVELOPE_DEPTH {
            return Err(DecodeError::TooDeep(depth));
        }
        Ok(())
    }
}

impl Drop for Envelope {
    // unlink the payload chain iteratively; deep envelopes would otherwise
    // recurse once per hop
    fn drop(&mut self) {
        let mut next = self.payload.take();
        while let Some(mut inner) = next {
            next = inner.payload.take();
        }
    }
}

/// Why an inbound frame could not be turned into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame exceeds `MAX_ENVELOPE_SIZE`.
    TooLarge(usize),
    /// Nesting exceeds `MAX_ENVELOPE_DEPTH`.
    TooDeep(usize),
    /// Frame is not a valid envelope.
    Malformed(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge(len) => write!(f, "envelope of {} bytes exceeds maximum {}", len, MAX_ENVELOPE_SIZE),
            Self::TooDeep(depth) => write!(f, "envelope nested {} deep exceeds maximum {}", depth, MAX_ENVELOPE_DEPTH),
            Self::Malformed(reason) => write!(f, "malformed envelope: {}", reason),
        }
    }
}

impl std::error::Error for DecodeError {}
