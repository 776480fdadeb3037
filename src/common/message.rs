//! Overlay message envelope, as relayed hop by hop between nodes.

mod internal;

use bytes::Bytes;

use crate::common::Id;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// The envelope of an overlay message.
///
/// Only the addressing part is interpreted by this crate, `data` is opaque.
pub struct Message {
    /// Correlation id, used to match responses and for logging.
    pub id: u32,
    /// Application defined message type, only used for logging.
    pub message_type: i32,
    /// `true` for requests, `false` for responses.
    pub request: bool,

    /// Target of this message, [Id::ZERO] if absent.
    pub destination_id: Id,
    /// Originator of this message, [Id::ZERO] for anonymous senders.
    pub source_id: Id,
    /// The node relaying on behalf of an anonymous or client sender.
    pub relay_id: Id,
    /// Connection to the anonymous or client sender at `relay_id`.
    pub relay_connection_id: Id,

    /// Nodes that already forwarded this message, oldest first.
    pub route_history: Vec<Id>,

    /// Deliver to `destination_id` only, rather than to its close group.
    pub direct: bool,
    /// Set if the source is a client node.
    pub client_node: bool,
    /// On copies of a group message fanned out within the close group,
    /// the Id the group message was addressed to.
    pub group_id: Id,

    pub data: Bytes,
}

impl Message {
    /// Create a direct request from `source_id` to `destination_id`.
    pub fn request(source_id: Id, destination_id: Id, data: Bytes) -> Message {
        Message {
            id: rand::random(),
            request: true,
            source_id,
            destination_id,
            direct: true,
            data,
            ..Default::default()
        }
    }

    /// Create a group request to the close group of `destination_id`.
    pub fn group_request(source_id: Id, destination_id: Id, data: Bytes) -> Message {
        Message {
            direct: false,
            ..Message::request(source_id, destination_id, data)
        }
    }

    /// Create a response to this message, addressed back to its source,
    /// carrying the relay path for anonymous or client sources.
    pub fn response(&self, responder_id: Id, data: Bytes) -> Message {
        Message {
            id: self.id,
            message_type: self.message_type,
            request: false,
            destination_id: self.source_id,
            source_id: responder_id,
            relay_id: self.relay_id,
            relay_connection_id: self.relay_connection_id,
            route_history: Vec::new(),
            direct: true,
            client_node: false,
            group_id: Id::ZERO,
            data,
        }
    }

    // === Getters ===

    pub fn is_request(&self) -> bool {
        self.request
    }

    pub fn is_response(&self) -> bool {
        !self.request
    }

    pub fn has_destination(&self) -> bool {
        !self.destination_id.is_zero()
    }

    pub fn has_relay(&self) -> bool {
        !self.relay_id.is_zero()
    }

    /// Returns `true` for group messages, and their copies fanned out in the close group.
    pub fn is_group(&self) -> bool {
        !self.direct || !self.group_id.is_zero()
    }

    // === Public Methods ===

    /// Record `node_id` as having forwarded this message.
    ///
    /// Appends `node_id` unless it is zero or already present, then drops the
    /// oldest entries until at most `max_route_history` remain.
    pub fn add_route_history(&mut self, node_id: Id, max_route_history: usize) {
        if node_id.is_zero() || self.route_history.contains(&node_id) {
            return;
        }

        self.route_history.push(node_id);

        if self.route_history.len() > max_route_history {
            let overflow = self.route_history.len() - max_route_history;
            self.route_history.drain(..overflow);
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(internal::WireMessage::from(self).to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        internal::WireMessage::from_bytes(bytes.as_ref())?.try_into()
    }
}
