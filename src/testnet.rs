//! In-memory overlay network, for tests, benchmarks and demos.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use ed25519_dalek::{SigningKey, VerifyingKey};
use tracing::{debug, trace};

use crate::common::{Id, Message, PeerInfo};
use crate::connection::{
    Bootstrapped, ConnectionLostHandler, ConnectionService, EndpointPair, MessageReceivedHandler,
    NatType, SendCompletion, SendStatus, TransportError,
};
use crate::{Config, Error, ForwardingEngine, Result};

/// First port of the fake endpoints handed out to testnet nodes.
const BASE_PORT: u16 = 40000;

struct Handlers {
    on_message: MessageReceivedHandler,
    on_connection_lost: ConnectionLostHandler,
}

struct Delivery {
    to: Id,
    bytes: Bytes,
    on_sent: SendCompletion,
}

#[derive(Default)]
struct NetworkInner {
    listeners: RwLock<HashMap<SocketAddr, Id>>,
    nodes: RwLock<HashMap<Id, Handlers>>,
    /// Status forced on every send to a node.
    statuses: RwLock<HashMap<Id, SendStatus>>,
    sends: Mutex<HashMap<Id, usize>>,
}

impl NetworkInner {
    fn deliver(&self, delivery: Delivery) {
        let forced = self
            .statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&delivery.to)
            .copied();

        if let Some(status) = forced.filter(|s| s != &SendStatus::Success) {
            trace!(context = "testnet", to = ?delivery.to, ?status, "Forced send status");
            (delivery.on_sent)(status);
            return;
        }

        let on_message = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&delivery.to)
            .map(|handlers| handlers.on_message.clone());

        match on_message {
            Some(on_message) => {
                on_message(delivery.bytes);
                (delivery.on_sent)(SendStatus::Success);
            }
            None => (delivery.on_sent)(SendStatus::Failed(-1)),
        }
    }
}

#[derive(Clone)]
/// A lossless in-memory network, delivering messages on its own thread.
///
/// Sends to a node can be made to fail with [MemoryNetwork::set_send_status].
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
    sender: flume::Sender<Delivery>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let inner = Arc::new(NetworkInner::default());
        let (sender, receiver) = flume::unbounded::<Delivery>();

        let network = Arc::clone(&inner);
        thread::spawn(move || {
            for delivery in receiver.iter() {
                network.deliver(delivery);
            }

            debug!(context = "testnet", "Network thread stopped");
        });

        MemoryNetwork { inner, sender }
    }

    /// A new [ConnectionService] on this network.
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection {
            network: Arc::clone(&self.inner),
            sender: self.sender.clone(),
        }
    }

    /// Make `endpoint` reachable as the node `node_id`.
    pub fn listen(&self, endpoint: SocketAddr, node_id: Id) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint, node_id);
    }

    /// Force the outcome of every send to `node_id`, `None` to deliver normally.
    pub fn set_send_status(&self, node_id: Id, status: Option<SendStatus>) {
        let mut statuses = self
            .inner
            .statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        match status {
            Some(status) => statuses.insert(node_id, status),
            None => statuses.remove(&node_id),
        };
    }

    /// Number of sends attempted to `node_id` so far.
    pub fn sends_to(&self, node_id: &Id) -> usize {
        self.inner
            .sends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .copied()
            .unwrap_or(0)
    }

    /// Take `node_id` off the network, notifying every other node of the lost connection.
    pub fn disconnect(&self, node_id: &Id) {
        let others: Vec<ConnectionLostHandler> = {
            let mut nodes = self
                .inner
                .nodes
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            nodes.remove(node_id);

            nodes
                .values()
                .map(|handlers| handlers.on_connection_lost.clone())
                .collect()
        };

        for on_connection_lost in others {
            on_connection_lost(*node_id);
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// [ConnectionService] of a single node on a [MemoryNetwork].
pub struct MemoryConnection {
    network: Arc<NetworkInner>,
    sender: flume::Sender<Delivery>,
}

impl MemoryConnection {
    fn endpoint_of(&self, node_id: &Id) -> Option<SocketAddr> {
        self.network
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(_, id)| *id == node_id)
            .map(|(endpoint, _)| *endpoint)
    }

    fn is_connected(&self, node_id: &Id) -> bool {
        self.network
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(node_id)
    }
}

impl ConnectionService for MemoryConnection {
    fn bootstrap(
        &self,
        endpoints: &[SocketAddr],
        on_message: MessageReceivedHandler,
        on_connection_lost: ConnectionLostHandler,
        this_node_id: Id,
        _keys: &SigningKey,
        _local_endpoint: Option<SocketAddr>,
    ) -> std::result::Result<Bootstrapped, TransportError> {
        self.network
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                this_node_id,
                Handlers {
                    on_message,
                    on_connection_lost,
                },
            );

        let listeners = self
            .network
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        endpoints
            .iter()
            .filter_map(|endpoint| listeners.get(endpoint))
            .find(|id| **id != this_node_id)
            .map(|id| Bootstrapped {
                connection_id: *id,
                nat_type: NatType::Other,
            })
            .ok_or(TransportError::Unreachable)
    }

    fn get_available_endpoint(
        &self,
        peer_id: Id,
        _peer_endpoint_pair: EndpointPair,
    ) -> std::result::Result<(EndpointPair, NatType), TransportError> {
        let external = self
            .endpoint_of(&peer_id)
            .ok_or(TransportError::NotConnected(peer_id))?;

        Ok((
            EndpointPair {
                local: Some(external),
                external: Some(external),
            },
            NatType::Other,
        ))
    }

    fn add(
        &self,
        peer_id: Id,
        _peer_endpoint_pair: EndpointPair,
        _validation_data: Bytes,
    ) -> std::result::Result<(), TransportError> {
        if self.is_connected(&peer_id) {
            Ok(())
        } else {
            Err(TransportError::NotConnected(peer_id))
        }
    }

    fn remove(&self, peer_id: Id) {
        trace!(context = "testnet", ?peer_id, "Removed connection");
    }

    fn send(&self, peer_id: Id, bytes: Bytes, on_sent: SendCompletion) {
        *self
            .network
            .sends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(peer_id)
            .or_insert(0) += 1;

        let _ = self.sender.send(Delivery {
            to: peer_id,
            bytes,
            on_sent,
        });
    }

    fn mark_connection_as_valid(
        &self,
        peer_id: Id,
    ) -> std::result::Result<Option<SocketAddr>, TransportError> {
        if !self.is_connected(&peer_id) {
            return Err(TransportError::NotConnected(peer_id));
        }

        Ok(self.endpoint_of(&peer_id))
    }
}

#[derive(Debug)]
/// A node of a [Testnet], collecting the messages delivered to it.
pub struct TestNode {
    pub engine: Arc<ForwardingEngine>,
    pub public_key: VerifyingKey,
    pub endpoint: SocketAddr,
    inbox: flume::Receiver<Message>,
}

impl TestNode {
    pub fn id(&self) -> Id {
        *self.engine.id()
    }

    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo::new(self.id(), self.public_key)
    }

    /// Wait up to `timeout` for the next delivered message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        self.inbox.recv_timeout(timeout).ok()
    }

    /// Messages delivered so far and not yet received.
    pub fn delivered(&self) -> Vec<Message> {
        self.inbox.try_iter().collect()
    }
}

#[derive(Debug)]
/// Create a testnet of fully meshed nodes on a [MemoryNetwork].
pub struct Testnet {
    pub nodes: Vec<TestNode>,
    pub network: MemoryNetwork,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet> {
        Testnet::with_config(count, Config::default())
    }

    /// Create `count` nodes, bootstrap each from another one, and add every
    /// node to every other node's routing table, as far as their capacity allows.
    pub fn with_config(count: usize, config: Config) -> Result<Testnet> {
        if count > 0 {
            testnet_endpoint(count - 1)?;
        }

        let network = MemoryNetwork::new();
        let mut pending = Vec::with_capacity(count);

        for i in 0..count {
            let keys = SigningKey::from_bytes(&rand::random());
            let public_key = keys.verifying_key();

            let engine = Arc::new(ForwardingEngine::new(
                keys,
                config.clone(),
                Arc::new(network.connection()),
            )?);

            let endpoint = testnet_endpoint(i)?;
            network.listen(endpoint, *engine.id());

            pending.push((engine, public_key, endpoint));
        }

        let endpoints: Vec<SocketAddr> = pending.iter().map(|(_, _, e)| *e).collect();
        let mut nodes = Vec::with_capacity(count);

        for (i, (engine, public_key, endpoint)) in pending.into_iter().enumerate() {
            let (inbox_tx, inbox) = flume::unbounded();
            let on_message = message_handler(Arc::downgrade(&engine), inbox_tx);

            let bootstrap = if i == 0 {
                endpoints.get(1)
            } else {
                endpoints.first()
            };
            if let Some(bootstrap) = bootstrap {
                engine.bootstrap(&[*bootstrap], on_message, Arc::new(|_| {}), Some(endpoint))?;
            }

            nodes.push(TestNode {
                engine,
                public_key,
                endpoint,
                inbox,
            });
        }

        for node in &nodes {
            for other in &nodes {
                if node.id() != other.id() {
                    node.engine.routing_table().add_node(other.peer_info());
                }
            }
        }

        Ok(Testnet { nodes, network })
    }
}

/// Fake endpoint of the `index`th testnet node.
fn testnet_endpoint(index: usize) -> Result<SocketAddr> {
    let port = u16::try_from(index)
        .ok()
        .and_then(|index| BASE_PORT.checked_add(index))
        .ok_or(Error::InvalidConfig("too many testnet nodes for the port range"))?;

    Ok(SocketAddr::from(([127, 0, 0, 1], port)))
}

fn message_handler(
    engine: Weak<ForwardingEngine>,
    inbox: flume::Sender<Message>,
) -> MessageReceivedHandler {
    Arc::new(move |bytes| {
        let Some(engine) = engine.upgrade() else {
            return;
        };

        match Message::from_bytes(&bytes) {
            Ok(message) => {
                if let Some(message) = engine.receive(message) {
                    let _ = inbox.send(message);
                }
            }
            Err(error) => debug!(context = "testnet", ?error, "Failed to decode message"),
        }
    })
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork").finish_non_exhaustive()
    }
}
