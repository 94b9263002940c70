//! Communication primitives for `meshcast`: node identity, membership,
//! wire framing, and the two `Network` implementations built on top of
//! it.

#[cfg(not(feature = "expose_impl"))]
mod socket;

#[cfg(feature = "expose_impl")]
pub mod socket;

pub mod barrier;
pub mod channel;
pub mod message;
pub mod network;

use std::collections::HashMap;
use std::net::SocketAddr;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// A `NodeId` represents the id of a participant in the system.
///
/// Opaque, unique per participant, stable for the lifetime of a
/// deployment.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct NodeId(String);

impl NodeId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A transport-specific address record. For the stream-socket
/// transports used here, this is a host/port pair.
#[derive(Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Peer {
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Peer { addr }
    }
}

/// A fixed mapping from `NodeId` to `Peer`, including self. Membership
/// is fixed at construction: this crate does not support dynamic
/// membership changes.
#[derive(Clone, Debug)]
pub struct Membership {
    pub(crate) self_id: NodeId,
    pub(crate) peers: HashMap<NodeId, Peer>,
}

impl Membership {
    /// Builds a new `Membership`. `peers` must include an entry for
    /// `self_id`.
    pub fn new(self_id: NodeId, peers: HashMap<NodeId, Peer>) -> Self {
        Membership { self_id, peers }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn peer(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    /// All member ids other than `self`.
    pub fn other_ids(&self) -> impl Iterator<Item = &NodeId> {
        let self_id = &self.self_id;
        self.peers.keys().filter(move |id| *id != self_id)
    }

    /// All member ids, including `self`.
    pub fn all_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.peers.keys()
    }

    /// Total number of members, `n` in the Bracha quorum formulas.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// The reserved topic used by the readiness barrier. Higher layers
/// must not register a receiver on this topic.
pub const NETWORK_MESSAGE_DISTRIBUTOR_SETUP_TOPIC: &str = "NETWORK_MESSAGE_DISTRIBUTOR_SETUP_TOPIC";

/// The reserved pseudo-topic over which a newly opened connection
/// announces its sender id, before any application traffic flows.
pub(crate) const SENDER_ID_TOPIC: &str = "senderId";
