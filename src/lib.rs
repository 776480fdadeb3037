#![doc = include_str!("../README.md")]

// Public modules
mod common;
mod config;
pub mod connection;
mod error;
mod forwarding;
pub mod testnet;

pub use crate::common::{
    Id, Message, NonRoutingTable, PeerInfo, RoutingTable, RoutingTableEvent, ID_SIZE,
};
pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::forwarding::{ForwardingEngine, NewBootstrapEndpointListener};
pub use bytes::Bytes;
pub use testnet::Testnet;

pub use ed25519_dalek::SigningKey;

/// Alias for a [std::result::Result] with this crate's [Error].
pub type Result<T, E = Error> = std::result::Result<T, E>;
