//! Hop by hop forwarding of overlay messages towards the closest nodes to their destination.

mod dispatcher;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use tracing::{debug, error, info, trace, warn};

use crate::common::{Id, Message, NonRoutingTable, PeerInfo, RoutingTable};
use crate::config::to_socket_address;
use crate::connection::{
    ConnectionLostHandler, ConnectionService, EndpointPair, MessageReceivedHandler, NatType,
    SendCompletion, SendStatus,
};
use crate::{Config, Error, Result};

use dispatcher::{Dispatcher, DispatcherMessage, SendJob};

/// Called with a newly learnt endpoint, usable to bootstrap from later.
pub type NewBootstrapEndpointListener = Arc<dyn Fn(SocketAddr) + Send + Sync>;

#[derive(Debug, Clone)]
/// Shared running flag, flipped once at teardown.
pub(crate) struct Lifecycle(Arc<AtomicBool>);

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns `true` if this call stopped it.
    pub fn stop(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Default)]
struct BootstrapState {
    attempts: usize,
    endpoints: Vec<SocketAddr>,
    connection_id: Id,
    relay_connection_id: Id,
    nat_type: NatType,
}

/// Forwards overlay messages to the peers closest to their destination,
/// retrying and rerouting around unresponsive peers.
///
/// Owns a dispatcher thread running the closest-node sends, stopped by
/// [ForwardingEngine::shutdown] or on drop.
pub struct ForwardingEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    id: Id,
    keys: SigningKey,
    config: Config,
    lifecycle: Lifecycle,

    routing_table: Arc<RoutingTable>,
    non_routing_table: Arc<NonRoutingTable>,
    connection: Arc<dyn ConnectionService>,

    jobs: flume::Sender<DispatcherMessage>,

    bootstrap: Mutex<BootstrapState>,
    new_bootstrap_endpoint: RwLock<Option<NewBootstrapEndpointListener>>,
}

impl ForwardingEngine {
    /// Create an engine for the node identified by `keys`, with empty tables,
    /// sending through `connection`.
    pub fn new(
        keys: SigningKey,
        config: Config,
        connection: Arc<dyn ConnectionService>,
    ) -> Result<Self> {
        config.validate()?;

        let id = Id::from_public_key(&keys.verifying_key());

        let lifecycle = Lifecycle::new();
        let (sender, receiver) = flume::unbounded();

        let inner = Arc::new(EngineInner {
            id,
            keys,
            routing_table: Arc::new(RoutingTable::new(id, &config)),
            non_routing_table: Arc::new(NonRoutingTable::new(id, &config)),
            config,
            lifecycle: lifecycle.clone(),
            connection,
            jobs: sender,
            bootstrap: Mutex::new(BootstrapState::default()),
            new_bootstrap_endpoint: RwLock::new(None),
        });

        let dispatcher = Dispatcher::new(receiver, lifecycle);
        let engine = Arc::clone(&inner);
        thread::spawn(move || dispatcher.run(|job| engine.recursive_send(job)));

        info!(context = "forwarding", ?id, "Forwarding engine started");

        Ok(ForwardingEngine { inner })
    }

    // === Getters ===

    /// This node's Id, derived from its public key.
    pub fn id(&self) -> &Id {
        &self.inner.id
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.inner.routing_table
    }

    pub fn non_routing_table(&self) -> &Arc<NonRoutingTable> {
        &self.inner.non_routing_table
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.is_running()
    }

    /// Connection to the node this node bootstrapped from, [Id::ZERO] if none
    /// or if the engine was shut down.
    pub fn bootstrap_connection_id(&self) -> Id {
        if !self.is_running() {
            return Id::ZERO;
        }

        self.inner.state().connection_id
    }

    pub fn this_node_relay_connection_id(&self) -> Id {
        self.inner.state().relay_connection_id
    }

    pub fn nat_type(&self) -> NatType {
        self.inner.state().nat_type
    }

    // === Public Methods ===

    /// Bootstrap into the network from `endpoints`, returning the connection
    /// Id of the bootstrap node.
    ///
    /// An empty `endpoints` reuses the endpoints of the previous attempt.
    /// On the first attempt, the configured well-known endpoints are appended.
    pub fn bootstrap(
        &self,
        endpoints: &[SocketAddr],
        on_message: MessageReceivedHandler,
        on_connection_lost: ConnectionLostHandler,
        local_endpoint: Option<SocketAddr>,
    ) -> Result<Id> {
        self.inner.ensure_running()?;

        let endpoints = {
            let mut state = self.inner.state();

            if !endpoints.is_empty() {
                state.endpoints = endpoints.to_vec();
            }

            if state.attempts == 0 {
                let config = &self.inner.config;

                if config.append_well_known_endpoints {
                    info!(context = "forwarding", "Appending well-known endpoints");
                    state
                        .endpoints
                        .extend(to_socket_address(&config.well_known_endpoints));
                } else if config.append_well_known_local_endpoints {
                    info!(context = "forwarding", "Appending well-known local endpoints");
                    state
                        .endpoints
                        .extend(to_socket_address(&config.well_known_local_endpoints));
                }
            }

            if state.endpoints.is_empty() {
                return Err(Error::InvalidBootstrapContacts);
            }

            state.endpoints.clone()
        };

        let result = self.inner.connection.bootstrap(
            &endpoints,
            on_message,
            self.inner.wrap_connection_lost(on_connection_lost),
            self.inner.id,
            &self.inner.keys,
            local_endpoint,
        );

        let mut state = self.inner.state();
        state.attempts += 1;

        match result {
            Ok(bootstrapped) if !bootstrapped.connection_id.is_zero() => {
                state.connection_id = bootstrapped.connection_id;
                state.nat_type = bootstrapped.nat_type;
                state.relay_connection_id = self.inner.id;

                info!(
                    context = "forwarding",
                    bootstrap_connection_id = ?bootstrapped.connection_id,
                    "Bootstrap successful"
                );

                Ok(bootstrapped.connection_id)
            }
            Ok(_) => {
                error!(context = "forwarding", "No online bootstrap node found");
                Err(Error::NoOnlineBootstrapContacts)
            }
            Err(error) => {
                error!(context = "forwarding", ?error, "No online bootstrap node found");
                Err(Error::NoOnlineBootstrapContacts)
            }
        }
    }

    pub fn get_available_endpoint(
        &self,
        peer_id: Id,
        peer_endpoint_pair: EndpointPair,
    ) -> Result<(EndpointPair, NatType)> {
        self.inner.ensure_running()?;

        Ok(self
            .inner
            .connection
            .get_available_endpoint(peer_id, peer_endpoint_pair)?)
    }

    /// Open a connection to `peer_id`, it is not added to any table.
    pub fn add(
        &self,
        peer_id: Id,
        peer_endpoint_pair: EndpointPair,
        validation_data: Bytes,
    ) -> Result<()> {
        self.inner.ensure_running()?;

        Ok(self
            .inner
            .connection
            .add(peer_id, peer_endpoint_pair, validation_data)?)
    }

    /// Close the connection to `peer_id`, does nothing once shut down.
    pub fn remove(&self, peer_id: Id) {
        if self.is_running() {
            self.inner.connection.remove(peer_id);
        }
    }

    /// Mark the connection to `peer_id` as valid, notifying the
    /// [NewBootstrapEndpointListener] if the peer is usable for bootstrapping.
    pub fn mark_connection_as_valid(&self, peer_id: Id) -> Result<()> {
        self.inner.ensure_running()?;

        let endpoint = self.inner.connection.mark_connection_as_valid(peer_id)?;

        if let Some(endpoint) = endpoint.filter(|e| !e.ip().is_unspecified()) {
            debug!(context = "forwarding", ?endpoint, "Found usable endpoint for bootstrapping");

            let listener = self
                .inner
                .new_bootstrap_endpoint
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();

            if let Some(listener) = listener {
                listener(endpoint);
            }
        }

        Ok(())
    }

    pub fn set_new_bootstrap_endpoint_listener(
        &self,
        listener: impl Fn(SocketAddr) + Send + Sync + 'static,
    ) {
        *self
            .inner
            .new_bootstrap_endpoint
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    pub fn clear_bootstrap_connection_info(&self) {
        let mut state = self.inner.state();

        state.connection_id = Id::ZERO;
        state.relay_connection_id = Id::ZERO;
    }

    /// Send `message` to a known peer, without retries.
    pub fn send_to_direct(&self, message: &Message, peer_node_id: Id, peer_connection_id: Id) {
        self.inner.send_to(message, peer_node_id, peer_connection_id);
    }

    /// Send `message` over `peer_connection_id`, `on_sent` is called with the outcome.
    pub fn send_to_direct_with(
        &self,
        message: &Message,
        peer_connection_id: Id,
        on_sent: SendCompletion,
    ) {
        self.inner.raw_send(peer_connection_id, message, on_sent);
    }

    /// Send `message` towards the closest nodes to its destination.
    ///
    /// Failures are handled by retrying, rerouting and evicting unreachable
    /// peers. Messages that cannot be routed are logged and dropped.
    pub fn send_to_closest_node(&self, message: Message) {
        self.inner.send_to_closest_node(message);
    }

    /// Route a message received from the network.
    ///
    /// Returns the message if it should be delivered to this node, otherwise
    /// it is forwarded or dropped.
    pub fn receive(&self, message: Message) -> Option<Message> {
        self.inner.receive(message)
    }

    /// Stop the dispatcher, every operation is a no-op or fails with
    /// [Error::ShuttingDown] afterwards.
    pub fn shutdown(&self) {
        if self.inner.lifecycle.stop() {
            let _ = self.inner.jobs.send(DispatcherMessage::Shutdown);

            info!(context = "forwarding", id = ?self.inner.id, "Forwarding engine shut down");
        }
    }
}

impl Drop for ForwardingEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ForwardingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingEngine")
            .field("id", &self.inner.id)
            .field("running", &self.is_running())
            .field("routing_table_size", &self.inner.routing_table.size())
            .finish()
    }
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, BootstrapState> {
        self.bootstrap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.lifecycle.is_running() {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    /// Drop lost peers from both tables before handing over to `handler`,
    /// nothing happens once the engine is shut down.
    fn wrap_connection_lost(
        self: &Arc<Self>,
        handler: ConnectionLostHandler,
    ) -> ConnectionLostHandler {
        let engine = Arc::downgrade(self);

        Arc::new(move |connection_id| {
            let Some(engine) = engine.upgrade() else {
                return;
            };

            if engine.lifecycle.is_running() {
                engine.routing_table.drop_node(&connection_id);
                engine.non_routing_table.drop_connection(&connection_id);

                handler(connection_id)
            }
        })
    }

    fn send_to_closest_node(&self, message: Message) {
        if !self.lifecycle.is_running() {
            return;
        }

        if message.has_destination() {
            let relays = self
                .non_routing_table
                .get_nodes_info(&message.destination_id);

            if !relays.is_empty() && message.direct {
                if message.is_request()
                    && (!message.client_node || message.source_id != message.destination_id)
                {
                    warn!(
                        context = "forwarding",
                        message_id = message.id,
                        destination = ?message.destination_id,
                        "Dropping message, non-client to client messages are not allowed"
                    );
                    return;
                }

                debug!(
                    context = "forwarding",
                    message_id = message.id,
                    relays = relays.len(),
                    "Destination is in the non-routing table"
                );

                for relay in relays {
                    self.send_to(&message, relay.node_id, relay.connection_id);
                }
            } else if !self.routing_table.is_empty() {
                self.submit(SendJob::new(message));
            } else {
                error!(
                    context = "forwarding",
                    message_id = message.id,
                    message_type = message.message_type,
                    "No endpoint to send to, aborting send"
                );
            }

            return;
        }

        if message.has_relay() && message.is_response() {
            let mut relay_message = message;
            relay_message.destination_id = relay_message.relay_id;

            self.send_to(
                &relay_message,
                relay_message.relay_id,
                relay_message.relay_connection_id,
            );
        } else {
            error!(
                context = "forwarding",
                message_id = message.id,
                has_relay = message.has_relay(),
                is_response = message.is_response(),
                "Unable to work out destination, aborting send"
            );
        }
    }

    /// One attempt of the closest-node send, run on the dispatcher thread.
    fn recursive_send(self: &Arc<Self>, job: SendJob) {
        if !self.lifecycle.is_running() {
            return;
        }

        let SendJob {
            mut message,
            mut last_tried,
            mut attempts,
            ..
        } = job;

        if attempts >= self.config.max_send_attempts {
            if let Some(peer) = last_tried.take() {
                warn!(
                    context = "forwarding",
                    message_id = message.id,
                    peer = ?peer.node_id,
                    attempts,
                    "Retry attempts failed, dropping peer and rerouting"
                );
                self.evict(&peer);
            }
            attempts = 0;
        }

        let Some(closest) = self.routing_table.closest_node(
            &message.destination_id,
            &message.route_history,
            !message.direct,
        ) else {
            error!(
                context = "forwarding",
                message_id = message.id,
                "Routing table has no peer to send to, this node needs to re-bootstrap"
            );
            return;
        };

        message.add_route_history(self.id, self.config.max_route_history);

        let bytes = match message.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(error) => {
                error!(
                    context = "forwarding",
                    message_id = message.id,
                    ?error,
                    "Failed to encode message"
                );
                return;
            }
        };

        trace!(
            context = "forwarding",
            message_id = message.id,
            peer = ?closest.node_id,
            destination = ?message.destination_id,
            attempts,
            "Sending to closest node"
        );

        let engine = Arc::downgrade(self);
        let peer = closest.clone();
        let on_sent: SendCompletion = Box::new(move |status| {
            on_recursive_sent(engine, status, message, last_tried, peer, attempts)
        });

        self.connection.send(closest.connection_id, bytes, on_sent);
    }

    fn receive(&self, message: Message) -> Option<Message> {
        if !self.lifecycle.is_running() {
            return None;
        }

        let destination = message.destination_id;

        if message.direct {
            if destination == self.id {
                if message.is_group() {
                    debug!(
                        context = "forwarding",
                        message_id = message.id,
                        group = ?message.group_id,
                        "Delivering copy of a group message"
                    );
                }

                return Some(message);
            }

            if !self.non_routing_table.contains(&destination)
                && self.is_closest_to(&destination, &message.route_history)
            {
                debug!(
                    context = "forwarding",
                    message_id = message.id,
                    ?destination,
                    "No peer closer to the destination, dropping message"
                );
                return None;
            }

            self.send_to_closest_node(message);
            return None;
        }

        if destination != self.id
            && self
                .routing_table
                .is_this_node_in_range(&destination, self.config.node_group_size)
        {
            let members = self.routing_table.closest_nodes(
                &destination,
                self.config.node_group_size - 1,
                &[destination],
            );

            debug!(
                context = "forwarding",
                message_id = message.id,
                ?destination,
                members = members.len(),
                "In close group, delivering to the group"
            );

            for member in members {
                let mut copy = message.clone();
                copy.direct = true;
                copy.group_id = destination;
                copy.destination_id = member.node_id;

                self.send_to(&copy, member.node_id, member.connection_id);
            }

            return Some(message);
        }

        self.send_to_closest_node(message);
        None
    }

    /// Returns `true` if no peer outside `exclude` is closer to `target` than this node.
    fn is_closest_to(&self, target: &Id, exclude: &[Id]) -> bool {
        match self.routing_table.closest_node(target, exclude, false) {
            Some(closest) => !target.closer_to(&closest.node_id, &self.id),
            None => true,
        }
    }

    fn send_to(&self, message: &Message, peer_node_id: Id, peer_connection_id: Id) {
        let message_id = message.id;

        let on_sent: SendCompletion = Box::new(move |status| match status {
            SendStatus::Success => {
                trace!(context = "forwarding", message_id, peer = ?peer_node_id, "Sent");
            }
            status => warn!(
                context = "forwarding",
                message_id,
                peer = ?peer_node_id,
                ?status,
                "Send failed"
            ),
        });

        self.raw_send(peer_connection_id, message, on_sent);
    }

    fn raw_send(&self, peer_connection_id: Id, message: &Message, on_sent: SendCompletion) {
        if !self.lifecycle.is_running() {
            return;
        }

        match message.to_bytes() {
            Ok(bytes) => self
                .connection
                .send(peer_connection_id, Bytes::from(bytes), on_sent),
            Err(error) => error!(
                context = "forwarding",
                message_id = message.id,
                ?error,
                "Failed to encode message"
            ),
        }
    }

    /// Remove `peer` from the connection service and both tables.
    fn evict(&self, peer: &PeerInfo) {
        if !self.lifecycle.is_running() {
            return;
        }

        self.connection.remove(peer.connection_id);
        self.routing_table.drop_node(&peer.node_id);
        self.non_routing_table.drop_connection(&peer.connection_id);
    }

    fn submit(&self, job: SendJob) {
        if self.jobs.send(DispatcherMessage::Send(job)).is_err() {
            debug!(context = "forwarding", "Dispatcher stopped, dropping send");
        }
    }
}

fn on_recursive_sent(
    engine: Weak<EngineInner>,
    status: SendStatus,
    message: Message,
    last_tried: Option<PeerInfo>,
    peer: PeerInfo,
    attempts: u8,
) {
    let Some(engine) = engine.upgrade() else {
        return;
    };
    if !engine.lifecycle.is_running() {
        return;
    }

    match status {
        SendStatus::Success => {
            trace!(
                context = "forwarding",
                message_id = message.id,
                peer = ?peer.node_id,
                "Sent to closest node"
            );
        }
        SendStatus::RetryableFailure => {
            let attempts = attempts + 1;

            debug!(
                context = "forwarding",
                message_id = message.id,
                peer = ?peer.node_id,
                attempts,
                "Send failed, will retry"
            );

            let not_before = (attempts < engine.config.max_send_attempts)
                .then(|| Instant::now() + engine.config.retry_backoff);

            engine.submit(SendJob {
                message,
                last_tried: Some(peer),
                attempts,
                not_before,
            });
        }
        SendStatus::Failed(code) => {
            warn!(
                context = "forwarding",
                message_id = message.id,
                peer = ?peer.node_id,
                code,
                "Send failed, removing peer"
            );

            if let Some(previous) = last_tried {
                engine.connection.remove(previous.connection_id);
            }
            engine.evict(&peer);

            engine.submit(SendJob::new(message));
        }
    }
}
