//! Bookkeeping of client connections this node relays for.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::common::{Id, PeerInfo};
use crate::Config;

#[derive(Debug)]
/// Clients connected to this node, that are not part of the routing table.
///
/// A client may hold several connections to this node, each registered as
/// a [PeerInfo] sharing the same `node_id`.
pub struct NonRoutingTable {
    id: Id,
    max_client_connections: usize,
    max_size: usize,
    entries: RwLock<Vec<PeerInfo>>,
}

impl NonRoutingTable {
    pub fn new(id: Id, config: &Config) -> Self {
        NonRoutingTable {
            id,
            max_client_connections: config.max_client_connections,
            max_size: config.max_non_routing_table_size,
            entries: RwLock::new(Vec::new()),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Number of registered connections.
    pub fn size(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains(&self, node_id: &Id) -> bool {
        self.read().iter().any(|peer| &peer.node_id == node_id)
    }

    /// All connections registered for the client `node_id`, empty if unknown.
    pub fn get_nodes_info(&self, node_id: &Id) -> Vec<PeerInfo> {
        self.read()
            .iter()
            .filter(|peer| &peer.node_id == node_id)
            .cloned()
            .collect()
    }

    // === Public Methods ===

    /// Returns `true` if `candidate` would be accepted by [Self::add_node].
    pub fn check_node(&self, candidate: &PeerInfo) -> bool {
        self.check(&self.read(), candidate).is_some()
    }

    /// Register a client connection, returns `true` if it was added.
    ///
    /// At capacity, the entry of the furthest client is evicted to make room
    /// for a closer one.
    pub fn add_node(&self, peer: PeerInfo) -> bool {
        let mut entries = self.write();

        let Some(admission) = self.check(&entries, &peer) else {
            return false;
        };

        if let Admission::Replace(index) = admission {
            let evicted = entries.remove(index);
            debug!(
                context = "non_routing_table",
                evicted = ?evicted.node_id,
                added = ?peer.node_id,
                "Evicted client to make room"
            );
        }

        entries.push(peer);

        true
    }

    /// Remove every entry using `connection_id`, returning the removed entries.
    pub fn drop_connection(&self, connection_id: &Id) -> Vec<PeerInfo> {
        self.remove_where(|peer| &peer.connection_id == connection_id)
    }

    /// Remove every entry of the client `node_id`, returning the removed entries.
    pub fn drop_node(&self, node_id: &Id) -> Vec<PeerInfo> {
        self.remove_where(|peer| &peer.node_id == node_id)
    }

    // === Private Methods ===

    fn read(&self) -> RwLockReadGuard<'_, Vec<PeerInfo>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<PeerInfo>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, entries: &[PeerInfo], candidate: &PeerInfo) -> Option<Admission> {
        if !candidate.is_valid() || candidate.node_id == self.id {
            return None;
        }

        if entries
            .iter()
            .any(|peer| peer.connection_id == candidate.connection_id)
        {
            return None;
        }

        let fan_out = entries
            .iter()
            .filter(|peer| peer.node_id == candidate.node_id)
            .count();
        if fan_out >= self.max_client_connections {
            return None;
        }

        if entries.len() < self.max_size {
            return Some(Admission::Append);
        }

        let (index, furthest) = entries
            .iter()
            .enumerate()
            .max_by_key(|(_, peer)| peer.node_id.xor(&self.id))?;

        self.id
            .closer_to(&candidate.node_id, &furthest.node_id)
            .then_some(Admission::Replace(index))
    }

    fn remove_where(&self, predicate: impl Fn(&PeerInfo) -> bool) -> Vec<PeerInfo> {
        let mut entries = self.write();

        let (removed, kept): (Vec<PeerInfo>, Vec<PeerInfo>) =
            entries.drain(..).partition(|peer| predicate(peer));
        *entries = kept;

        removed
    }
}

enum Admission {
    Append,
    /// Replace the entry at this index.
    Replace(usize),
}

#[cfg(test)]
mod test {
    use super::*;

    fn client_connection(node_id: Id) -> PeerInfo {
        let key = ed25519_dalek::SigningKey::from_bytes(&rand::random()).verifying_key();

        PeerInfo::with_connection(node_id, Id::random(), key)
    }

    #[test]
    fn add_and_get() {
        let table = NonRoutingTable::new(Id::random(), &Config::default());
        let client = Id::random();

        assert!(table.get_nodes_info(&client).is_empty());

        let first = client_connection(client);
        let second = client_connection(client);
        assert!(table.add_node(first.clone()));
        assert!(table.add_node(second.clone()));

        assert_eq!(table.get_nodes_info(&client), vec![first, second]);
        assert!(table.contains(&client));
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn rejects_invalid_and_duplicates() {
        let table = NonRoutingTable::new(Id::random(), &Config::default());

        let mut missing_key = PeerInfo::random();
        missing_key.public_key = None;
        assert!(!table.add_node(missing_key));

        assert!(!table.add_node(client_connection(*table.id())));

        let peer = client_connection(Id::random());
        assert!(table.add_node(peer.clone()));
        assert!(!table.add_node(peer.clone()));

        let mut same_connection = client_connection(Id::random());
        same_connection.connection_id = peer.connection_id;
        assert!(!table.check_node(&same_connection));

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn max_client_connections() {
        let config = Config {
            max_client_connections: 2,
            ..Default::default()
        };
        let table = NonRoutingTable::new(Id::random(), &config);
        let client = Id::random();

        assert!(table.add_node(client_connection(client)));
        assert!(table.add_node(client_connection(client)));
        assert!(!table.add_node(client_connection(client)));

        assert!(table.add_node(client_connection(Id::random())));
    }

    #[test]
    fn evicts_furthest_at_capacity() {
        let config = Config {
            max_non_routing_table_size: 4,
            ..Default::default()
        };
        let table = NonRoutingTable::new(Id::random(), &config);

        while table.size() < 4 {
            table.add_node(client_connection(Id::random()));
        }

        let furthest = table
            .read()
            .iter()
            .max_by_key(|peer| peer.node_id.xor(table.id()))
            .cloned()
            .unwrap();

        let mut bytes = *table.id().as_bytes();
        bytes[19] ^= 1;
        let close = client_connection(Id::from(bytes));

        assert!(table.add_node(close.clone()));
        assert_eq!(table.size(), 4);
        assert!(table.contains(&close.node_id));
        assert!(!table.contains(&furthest.node_id));

        let mut far = *table.id().as_bytes();
        for byte in far.iter_mut() {
            *byte ^= 0xff;
        }
        assert!(!table.add_node(client_connection(Id::from(far))));
    }

    #[test]
    fn drop_connection_is_idempotent() {
        let table = NonRoutingTable::new(Id::random(), &Config::default());
        let client = Id::random();

        let first = client_connection(client);
        let second = client_connection(client);
        table.add_node(first.clone());
        table.add_node(second.clone());

        assert_eq!(table.drop_connection(&first.connection_id), vec![first.clone()]);
        assert!(table.drop_connection(&first.connection_id).is_empty());
        assert_eq!(table.get_nodes_info(&client), vec![second]);
    }

    #[test]
    fn drop_node_removes_all_connections() {
        let table = NonRoutingTable::new(Id::random(), &Config::default());
        let client = Id::random();

        table.add_node(client_connection(client));
        table.add_node(client_connection(client));
        table.add_node(client_connection(Id::random()));

        assert_eq!(table.drop_node(&client).len(), 2);
        assert!(!table.contains(&client));
        assert_eq!(table.size(), 1);
    }
}
