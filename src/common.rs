//! Identifiers, peers, messages and the two peer tables shared by the forwarding engine.

mod id;
mod message;
mod non_routing_table;
mod peer;
mod routing_table;

pub use id::*;
pub use message::*;
pub use non_routing_table::*;
pub use peer::*;
pub use routing_table::*;
