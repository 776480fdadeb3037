use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::Message;
use crate::common::Id;
use crate::Error;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireMessage {
    #[serde(rename = "t")]
    pub id: u32,

    #[serde(rename = "y")]
    pub message_type: i32,

    #[serde(rename = "q")]
    pub request: u8,

    #[serde(default, rename = "d", skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<Id>,

    #[serde(default, rename = "s", skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Id>,

    #[serde(default, rename = "r", skip_serializing_if = "Option::is_none")]
    pub relay_id: Option<Id>,

    #[serde(default, rename = "rc", skip_serializing_if = "Option::is_none")]
    pub relay_connection_id: Option<Id>,

    #[serde(default, rename = "h")]
    pub route_history: Vec<Id>,

    #[serde(rename = "di")]
    pub direct: u8,

    #[serde(default, rename = "c")]
    pub client_node: u8,

    #[serde(default, rename = "g", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Id>,

    #[serde(rename = "v")]
    pub data: Bytes,
}

impl WireMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

fn non_zero(id: Id) -> Option<Id> {
    (!id.is_zero()).then_some(id)
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        WireMessage {
            id: message.id,
            message_type: message.message_type,
            request: message.request.into(),
            destination_id: non_zero(message.destination_id),
            source_id: non_zero(message.source_id),
            relay_id: non_zero(message.relay_id),
            relay_connection_id: non_zero(message.relay_connection_id),
            route_history: message.route_history.clone(),
            direct: message.direct.into(),
            client_node: message.client_node.into(),
            group_id: non_zero(message.group_id),
            data: message.data.clone(),
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = Error;

    fn try_from(wire: WireMessage) -> Result<Self, Error> {
        if wire.route_history.iter().any(|id| id.is_zero()) {
            return Err(Error::InvalidMessage("zero Id in route history"));
        }

        Ok(Message {
            id: wire.id,
            message_type: wire.message_type,
            request: wire.request != 0,
            destination_id: wire.destination_id.unwrap_or_default(),
            source_id: wire.source_id.unwrap_or_default(),
            relay_id: wire.relay_id.unwrap_or_default(),
            relay_connection_id: wire.relay_connection_id.unwrap_or_default(),
            route_history: wire.route_history,
            direct: wire.direct != 0,
            client_node: wire.client_node != 0,
            group_id: wire.group_id.unwrap_or_default(),
            data: wire.data,
        })
    }
}
