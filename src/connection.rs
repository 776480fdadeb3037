//! Interface to the reliable transport underneath the overlay.
//!
//! Connection management, NAT traversal and congestion control live behind
//! [ConnectionService], this crate only connects, sends and removes.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use ed25519_dalek::SigningKey;

use crate::common::Id;

/// Called by the connection service for every message received from any peer.
pub type MessageReceivedHandler = Arc<dyn Fn(Bytes) + Send + Sync>;
/// Called by the connection service when the connection to a peer is lost.
pub type ConnectionLostHandler = Arc<dyn Fn(Id) + Send + Sync>;
/// Completion of a [ConnectionService::send].
pub type SendCompletion = Box<dyn FnOnce(SendStatus) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of a single send, as reported by the connection service.
pub enum SendStatus {
    Success,
    /// The peer might still be reachable, sending again may succeed.
    RetryableFailure,
    /// The peer is unreachable, with a transport specific error code.
    Failed(i32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
/// NAT type of this node, as detected by the connection service.
pub enum NatType {
    #[default]
    Unknown,
    Symmetric,
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
/// Local and external endpoints of one side of a connection.
pub struct EndpointPair {
    pub local: Option<SocketAddr>,
    pub external: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of a successful [ConnectionService::bootstrap].
pub struct Bootstrapped {
    /// Connection to the bootstrap node, [Id::ZERO] if this node is the first in the network.
    pub connection_id: Id,
    pub nat_type: NatType,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors reported by a [ConnectionService].
pub enum TransportError {
    #[error("No endpoint could be connected to")]
    Unreachable,

    #[error("No connection to peer {0}")]
    NotConnected(Id),

    #[error("Invalid endpoint pair")]
    InvalidEndpoint,

    #[error("Connection service failed with code {0}")]
    Code(i32),
}

/// A reliable, connection oriented transport between overlay nodes.
///
/// Implementations are shared between threads, and invoke completions
/// and handlers from their own threads.
pub trait ConnectionService: Send + Sync {
    /// Connect to the first reachable of `endpoints` and start receiving messages.
    fn bootstrap(
        &self,
        endpoints: &[SocketAddr],
        on_message: MessageReceivedHandler,
        on_connection_lost: ConnectionLostHandler,
        this_node_id: Id,
        keys: &SigningKey,
        local_endpoint: Option<SocketAddr>,
    ) -> Result<Bootstrapped, TransportError>;

    /// Reserve an endpoint pair for a new connection to `peer_id`.
    fn get_available_endpoint(
        &self,
        peer_id: Id,
        peer_endpoint_pair: EndpointPair,
    ) -> Result<(EndpointPair, NatType), TransportError>;

    /// Open a connection to `peer_id`.
    fn add(
        &self,
        peer_id: Id,
        peer_endpoint_pair: EndpointPair,
        validation_data: Bytes,
    ) -> Result<(), TransportError>;

    /// Close the connection to `peer_id`, if any.
    fn remove(&self, peer_id: Id);

    /// Send `bytes` to `peer_id`, `on_sent` is called once with the outcome.
    fn send(&self, peer_id: Id, bytes: Bytes, on_sent: SendCompletion);

    /// Mark the connection to `peer_id` as validated.
    ///
    /// Returns the peer's endpoint if it is usable for bootstrapping later.
    fn mark_connection_as_valid(&self, peer_id: Id) -> Result<Option<SocketAddr>, TransportError>;
}
