//! # Identities and Sequence Numbers
//!
//! This module defines the two counters every flooding network depends on:
//!
//! - [`NodeId`]: unique per node, issued by [`NodeIdAllocator`]
//! - [`SequenceId`]: unique per envelope, issued by [`SequenceAllocator`]
//!
//! ## Allocation Model
//!
//! Both allocators are plain atomic counters. `next()` returns the current
//! value and then increments it, so a fresh allocator yields `0, 1, 2, ...`.
//!
//! Allocators are owned by a network ([`Allocators`]) and injected into every
//! node it creates. Two networks in the same process never share a counter,
//! which keeps test cases independent of each other.
//!
//! ## Invariants
//!
//! - I1: values from one allocator are strictly increasing in call order
//! - I2: no value is ever returned twice, even under concurrent callers
//! - I3: `NodeId` and `SequenceId` counters are independent

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// ============================================================================
// Identifier Types
// ============================================================================

/// Identifier of a node. Serialized as a bare integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Freshness tag minted for every envelope instance.
/// Carries no ordering guarantee across nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(u64);

impl SequenceId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Allocators
// ============================================================================

/// Monotonic counter shared by the typed allocators below.
#[derive(Debug, Default)]
struct Counter(AtomicU64);

impl Counter {
    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    fn peek(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Issues node identifiers.
#[derive(Debug, Default)]
pub struct NodeIdAllocator(Counter);

impl NodeIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> NodeId {
        NodeId(self.0.next())
    }

    /// The value the next call to [`next`](Self::next) will return.
    pub fn peek(&self) -> NodeId {
        NodeId(self.0.peek())
    }
}

/// Issues envelope sequence numbers.
#[derive(Debug, Default)]
pub struct SequenceAllocator(Counter);

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> SequenceId {
        SequenceId(self.0.next())
    }

    pub fn peek(&self) -> SequenceId {
        SequenceId(self.0.peek())
    }
}

/// The counters one network shares across its nodes. Cheap to clone.
#[derive(Clone, Debug, Default)]
pub struct Allocators {
    pub node_ids: Arc<NodeIdAllocator>,
    pub sequences: Arc<SequenceAllocator>,
}

impl Allocators {
    pub fn new() -> Self {
        Self::default()
    }
}
