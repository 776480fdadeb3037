use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::{Error, Result};

/// Default number of closest peers always kept in the routing table.
pub const DEFAULT_CLOSEST_NODES_SIZE: usize = 8;
/// Default size of a close group.
pub const DEFAULT_NODE_GROUP_SIZE: usize = 4;
/// Default routing table capacity.
pub const DEFAULT_MAX_ROUTING_TABLE_SIZE: usize = 64;
/// Default route history capacity.
pub const DEFAULT_MAX_ROUTE_HISTORY: usize = 5;
/// Default non-routing table capacity.
pub const DEFAULT_MAX_NON_ROUTING_TABLE_SIZE: usize = 64;
/// Default number of connections a single client may register.
pub const DEFAULT_MAX_CLIENT_CONNECTIONS: usize = 8;
/// Default number of sends to the same peer before it is considered unreachable.
pub const DEFAULT_MAX_SEND_ATTEMPTS: u8 = 3;
/// Default delay before retrying a send to the same peer.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Endpoints of local bootstrap nodes, for development networks.
pub const DEFAULT_WELL_KNOWN_LOCAL_ENDPOINTS: [&str; 2] = ["127.0.0.1:5483", "127.0.0.1:5484"];

#[derive(Debug, Clone)]
/// Routing configurations
pub struct Config {
    /// Number of closest peers that are always accepted and never evicted
    /// while a further peer is available.
    ///
    /// Defaults to [DEFAULT_CLOSEST_NODES_SIZE]
    pub closest_nodes_size: usize,
    /// Number of peers closest to an Id forming its close group,
    /// the recipients of group messages.
    ///
    /// Defaults to [DEFAULT_NODE_GROUP_SIZE]
    pub node_group_size: usize,
    /// Capacity of the routing table.
    ///
    /// Defaults to [DEFAULT_MAX_ROUTING_TABLE_SIZE]
    pub max_routing_table_size: usize,
    /// Number of forwarding nodes remembered in a message to avoid routing loops.
    ///
    /// Defaults to [DEFAULT_MAX_ROUTE_HISTORY]
    pub max_route_history: usize,
    /// Capacity of the non-routing table.
    ///
    /// Defaults to [DEFAULT_MAX_NON_ROUTING_TABLE_SIZE]
    pub max_non_routing_table_size: usize,
    /// Number of connections a single client Id may hold to this node.
    ///
    /// Defaults to [DEFAULT_MAX_CLIENT_CONNECTIONS]
    pub max_client_connections: usize,
    /// Number of sends to the same peer before dropping it and rerouting.
    ///
    /// Defaults to [DEFAULT_MAX_SEND_ATTEMPTS]
    pub max_send_attempts: u8,
    /// Delay between two sends to the same peer.
    ///
    /// Defaults to [DEFAULT_RETRY_BACKOFF]
    pub retry_backoff: Duration,
    /// Append [Self::well_known_endpoints] on the first bootstrap attempt.
    ///
    /// Defaults to false
    pub append_well_known_endpoints: bool,
    /// Append [Self::well_known_local_endpoints] on the first bootstrap attempt,
    /// unless [Self::append_well_known_endpoints] is set.
    ///
    /// Defaults to false
    pub append_well_known_local_endpoints: bool,
    /// Public bootstrap endpoints, as `host:port` strings.
    ///
    /// Defaults to empty
    pub well_known_endpoints: Vec<String>,
    /// Local bootstrap endpoints, as `host:port` strings.
    ///
    /// Defaults to [DEFAULT_WELL_KNOWN_LOCAL_ENDPOINTS]
    pub well_known_local_endpoints: Vec<String>,
}

impl Config {
    /// Check the relations between sizes.
    pub fn validate(&self) -> Result<()> {
        if self.node_group_size == 0 {
            return Err(Error::InvalidConfig("node_group_size must be positive"));
        }
        if self.node_group_size > self.closest_nodes_size {
            return Err(Error::InvalidConfig(
                "node_group_size must not exceed closest_nodes_size",
            ));
        }
        if self.closest_nodes_size > self.max_routing_table_size {
            return Err(Error::InvalidConfig(
                "closest_nodes_size must not exceed max_routing_table_size",
            ));
        }
        if self.max_route_history == 0 {
            return Err(Error::InvalidConfig("max_route_history must be positive"));
        }
        if self.max_client_connections == 0 || self.max_non_routing_table_size == 0 {
            return Err(Error::InvalidConfig(
                "non-routing table bounds must be positive",
            ));
        }
        if self.max_send_attempts == 0 {
            return Err(Error::InvalidConfig("max_send_attempts must be positive"));
        }

        Ok(())
    }
}

/// Resolve `host:port` strings, skipping the ones that fail to resolve.
pub(crate) fn to_socket_address<T: ToSocketAddrs>(endpoints: &[T]) -> Vec<SocketAddr> {
    endpoints
        .iter()
        .flat_map(|s| s.to_socket_addrs().map(|addrs| addrs.collect::<Box<[_]>>()))
        .flatten()
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            closest_nodes_size: DEFAULT_CLOSEST_NODES_SIZE,
            node_group_size: DEFAULT_NODE_GROUP_SIZE,
            max_routing_table_size: DEFAULT_MAX_ROUTING_TABLE_SIZE,
            max_route_history: DEFAULT_MAX_ROUTE_HISTORY,
            max_non_routing_table_size: DEFAULT_MAX_NON_ROUTING_TABLE_SIZE,
            max_client_connections: DEFAULT_MAX_CLIENT_CONNECTIONS,
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            append_well_known_endpoints: false,
            append_well_known_local_endpoints: false,
            well_known_endpoints: Vec::new(),
            well_known_local_endpoints: DEFAULT_WELL_KNOWN_LOCAL_ENDPOINTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}
