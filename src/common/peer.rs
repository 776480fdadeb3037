//! Struct and implementation of the peer entry in the routing and non-routing tables
use ed25519_dalek::VerifyingKey;

use crate::common::Id;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Peer entry in the [RoutingTable](crate::RoutingTable) or [NonRoutingTable](crate::NonRoutingTable).
pub struct PeerInfo {
    /// The peer's overlay Id.
    pub node_id: Id,
    /// Transport handle for this peer. Differs from `node_id` for relayed or anonymous peers.
    pub connection_id: Id,
    /// The peer's public key, `None` if not (yet) known.
    pub public_key: Option<VerifyingKey>,
}

impl PeerInfo {
    /// Creates a new routing peer, whose connection Id is its node Id.
    pub fn new(node_id: Id, public_key: VerifyingKey) -> PeerInfo {
        PeerInfo {
            node_id,
            connection_id: node_id,
            public_key: Some(public_key),
        }
    }

    /// Creates a peer reachable through a distinct connection Id.
    pub fn with_connection(node_id: Id, connection_id: Id, public_key: VerifyingKey) -> PeerInfo {
        PeerInfo {
            node_id,
            connection_id,
            public_key: Some(public_key),
        }
    }

    /// Bucket of this peer relative to `self_id`, larger is closer.
    pub fn bucket_index(&self, self_id: &Id) -> u8 {
        self_id.bucket_index(&self.node_id)
    }

    /// Returns `true` if `id` is either this peer's node Id or its connection Id.
    pub fn matches(&self, id: &Id) -> bool {
        &self.node_id == id || &self.connection_id == id
    }

    /// Returns `true` if this peer has the Ids and key material required to enter a table.
    pub fn is_valid(&self) -> bool {
        !self.node_id.is_zero() && !self.connection_id.is_zero() && self.has_valid_key()
    }

    fn has_valid_key(&self) -> bool {
        match &self.public_key {
            Some(key) => !key.is_weak(),
            None => false,
        }
    }

    /// Create a peer with a random Id and a fresh key, useful for testing.
    pub fn random() -> PeerInfo {
        let key = ed25519_dalek::SigningKey::from_bytes(&rand::random());

        PeerInfo::new(Id::random(), key.verifying_key())
    }

    /// Create a peer with a given Id and a fresh key, useful for testing.
    pub fn with_id(node_id: Id) -> PeerInfo {
        let key = ed25519_dalek::SigningKey::from_bytes(&rand::random());

        PeerInfo::new(node_id, key.verifying_key())
    }
}
