//! Main Crate Error

use crate::connection::TransportError;

#[derive(thiserror::Error, Debug)]
/// Overlay routing crate error enum.
pub enum Error {
    /// The [ForwardingEngine](crate::ForwardingEngine) was shut down.
    #[error("Network is shutting down")]
    ShuttingDown,

    /// Neither explicit nor well-known bootstrap endpoints were available.
    #[error("No bootstrap contacts to bootstrap from")]
    InvalidBootstrapContacts,

    /// The connection service could not reach any of the bootstrap contacts.
    #[error("No online bootstrap contacts")]
    NoOnlineBootstrapContacts,

    /// Indicates that the [Config](crate::Config) is inconsistent.
    #[error("Invalid config: {0}")]
    InvalidConfig(&'static str),

    #[error(transparent)]
    /// Transparent [TransportError] from the connection service.
    Transport(#[from] TransportError),

    /// Indicates that an Id is not [ID_SIZE](crate::ID_SIZE) bytes.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Indicates that a string is not a 40 characters hex encoded Id.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    #[error("Failed to parse message bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// Indicates that a decoded message breaks an envelope invariant.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),
}
