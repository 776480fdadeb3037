//! Distance sorted routing table, bounded and balanced across buckets.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, trace};

use crate::common::{Id, PeerInfo};
use crate::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Churn notifications emitted by a [RoutingTable].
pub enum RoutingTableEvent {
    /// A peer was added, `in_close_group` is `true` if it landed within the
    /// `closest_nodes_size` closest peers to this node.
    NodeAdded { peer: PeerInfo, in_close_group: bool },
    /// The `node_group_size` closest peers to this node changed, carries the new group.
    CloseGroupChanged(Vec<PeerInfo>),
    /// Number of peers in the table changed, carries the new size.
    SizeChanged(usize),
}

#[derive(Debug, Clone)]
struct Entry {
    peer: PeerInfo,
    /// Insertion order, larger is more recent.
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    /// Sorted by distance to this node, closest first.
    entries: Vec<Entry>,
    next_seq: u64,
}

#[derive(Debug)]
/// Routing table of a node, keeping a bounded set of peers sorted by their
/// XOR distance to this node's [Id].
///
/// All methods take `&self`, the table is meant to be shared behind an `Arc`.
/// Iteration is only exposed as owned snapshots.
pub struct RoutingTable {
    id: Id,
    closest_nodes_size: usize,
    node_group_size: usize,
    max_size: usize,
    inner: RwLock<Inner>,
    subscribers: Mutex<Vec<flume::Sender<RoutingTableEvent>>>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id, sized by `config`.
    pub fn new(id: Id, config: &Config) -> Self {
        RoutingTable {
            id,
            closest_nodes_size: config.closest_nodes_size,
            node_group_size: config.node_group_size,
            max_size: config.max_routing_table_size,
            inner: RwLock::new(Inner::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Return the number of peers in this routing table.
    pub fn size(&self) -> usize {
        self.read().entries.len()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Returns `true` if a peer with this node Id is in the table.
    pub fn contains(&self, node_id: &Id) -> bool {
        self.read().entries.iter().any(|e| &e.peer.node_id == node_id)
    }

    /// Returns the peer whose node Id or connection Id matches `id`.
    pub fn get(&self, id: &Id) -> Option<PeerInfo> {
        self.read()
            .entries
            .iter()
            .find(|e| e.peer.matches(id))
            .map(|e| e.peer.clone())
    }

    /// Snapshot of all peers, closest to this node first.
    pub fn nodes(&self) -> Vec<PeerInfo> {
        self.read().entries.iter().map(|e| e.peer.clone()).collect()
    }

    /// The `node_group_size` closest peers to this node.
    pub fn close_group(&self) -> Vec<PeerInfo> {
        Self::group(&self.read(), self.node_group_size)
    }

    /// Subscribe to [RoutingTableEvent]s.
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> flume::Receiver<RoutingTableEvent> {
        let (tx, rx) = flume::unbounded();

        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);

        rx
    }

    // === Public Methods ===

    /// Returns `true` if `candidate` would be accepted by [Self::add_node].
    ///
    /// Rejects invalid peers, this node, and duplicate node or connection Ids.
    /// Below capacity every other peer is accepted. At capacity a peer is accepted
    /// if it is closer than the furthest peer, or if swapping it in makes the
    /// buckets more even.
    pub fn check_node(&self, candidate: &PeerInfo) -> bool {
        self.check(&self.read(), candidate)
    }

    /// Attempts to add a peer to this routing table, and return `true` if it did.
    ///
    /// If the table grows over capacity, the [Self::removable_node] is evicted.
    pub fn add_node(&self, peer: PeerInfo) -> bool {
        let events = {
            let mut inner = self.write();

            if !self.check(&inner, &peer) {
                trace!(context = "routing_table", node_id = ?peer.node_id, "Rejected node");
                return false;
            }

            let group_before = Self::group_ids(&inner, self.node_group_size);

            let seq = inner.next_seq;
            inner.next_seq += 1;

            let position = inner
                .entries
                .partition_point(|e| self.id.closer_to(&e.peer.node_id, &peer.node_id));
            inner.entries.insert(
                position,
                Entry {
                    peer: peer.clone(),
                    seq,
                },
            );

            if inner.entries.len() > self.max_size {
                if let Some(evicted) = self.removable(&inner, &[peer.node_id]) {
                    debug!(
                        context = "routing_table",
                        evicted = ?evicted.node_id,
                        added = ?peer.node_id,
                        "Evicted node to make room"
                    );
                    inner.entries.retain(|e| e.peer.node_id != evicted.node_id);
                }
            }

            let in_close_group = inner
                .entries
                .iter()
                .take(self.closest_nodes_size)
                .any(|e| e.peer.node_id == peer.node_id);

            let mut events = Vec::with_capacity(3);
            if Self::group_ids(&inner, self.node_group_size) != group_before {
                events.push(RoutingTableEvent::CloseGroupChanged(Self::group(
                    &inner,
                    self.node_group_size,
                )));
            }
            events.push(RoutingTableEvent::NodeAdded {
                peer,
                in_close_group,
            });
            events.push(RoutingTableEvent::SizeChanged(inner.entries.len()));

            events
        };

        self.notify(events);

        true
    }

    /// Remove the peer whose node Id or connection Id matches `id`, returning it.
    pub fn drop_node(&self, id: &Id) -> Option<PeerInfo> {
        let (dropped, events) = {
            let mut inner = self.write();

            let index = inner.entries.iter().position(|e| e.peer.matches(id))?;
            let was_in_group = index < self.node_group_size;

            let dropped = inner.entries.remove(index).peer;

            let mut events = Vec::with_capacity(2);
            if was_in_group {
                events.push(RoutingTableEvent::CloseGroupChanged(Self::group(
                    &inner,
                    self.node_group_size,
                )));
            }
            events.push(RoutingTableEvent::SizeChanged(inner.entries.len()));

            (dropped, events)
        };

        debug!(context = "routing_table", node_id = ?dropped.node_id, "Dropped node");

        self.notify(events);

        Some(dropped)
    }

    /// Return the peer closest to `target` whose node Id is not in `exclude`.
    ///
    /// If `ignore_exact_match` is set, a peer whose node Id equals `target` is skipped,
    /// to hop past the destination itself.
    pub fn closest_node(
        &self,
        target: &Id,
        exclude: &[Id],
        ignore_exact_match: bool,
    ) -> Option<PeerInfo> {
        self.read()
            .entries
            .iter()
            .filter(|e| !exclude.contains(&e.peer.node_id))
            .filter(|e| !(ignore_exact_match && &e.peer.node_id == target))
            .min_by_key(|e| {
                (
                    e.peer.node_id.xor(target),
                    Reverse(e.peer.bucket_index(&self.id)),
                    e.seq,
                )
            })
            .map(|e| e.peer.clone())
    }

    /// Return up to `count` peers closest to `target`, skipping `exclude`, closest first.
    pub fn closest_nodes(&self, target: &Id, count: usize, exclude: &[Id]) -> Vec<PeerInfo> {
        let mut nodes: Vec<PeerInfo> = self
            .read()
            .entries
            .iter()
            .filter(|e| !exclude.contains(&e.peer.node_id))
            .map(|e| e.peer.clone())
            .collect();

        nodes.sort_by_key(|peer| peer.node_id.xor(target));
        nodes.truncate(count);

        nodes
    }

    /// Returns `true` if fewer than `range` peers, other than `target` itself,
    /// are closer to `target` than this node.
    pub fn is_this_node_in_range(&self, target: &Id, range: usize) -> bool {
        let own_distance = self.id.xor(target);

        let closer = self
            .read()
            .entries
            .iter()
            .filter(|e| &e.peer.node_id != target)
            .filter(|e| e.peer.node_id.xor(target) < own_distance)
            .count();

        closer < range
    }

    /// Pick the peer to evict when making room, never one in `excluded`.
    ///
    /// Draws from the furthest populated bucket, preferring the most recently
    /// added peer, and only falls back to the `closest_nodes_size` closest peers
    /// when nothing else is left.
    pub fn removable_node(&self, excluded: &[Id]) -> Option<PeerInfo> {
        self.removable(&self.read(), excluded)
    }

    // === Private Methods ===

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, inner: &Inner, candidate: &PeerInfo) -> bool {
        if !candidate.is_valid() || candidate.node_id == self.id {
            return false;
        }

        if inner.entries.iter().any(|e| {
            e.peer.node_id == candidate.node_id || e.peer.connection_id == candidate.connection_id
        }) {
            return false;
        }

        if inner.entries.len() < self.max_size {
            return true;
        }

        let Some(furthest) = inner.entries.last() else {
            return true;
        };

        if self.id.closer_to(&candidate.node_id, &furthest.peer.node_id) {
            return true;
        }

        // Not closer, so only accept it if it evens out the buckets.
        let Some(victim) = self.removable(inner, &[]) else {
            return false;
        };

        let bucket_sizes = self.bucket_sizes(inner);
        let size_of = |bucket: u8| bucket_sizes.get(&bucket).copied().unwrap_or(0);

        size_of(candidate.bucket_index(&self.id)) + 1 < size_of(victim.bucket_index(&self.id))
    }

    fn removable(&self, inner: &Inner, excluded: &[Id]) -> Option<PeerInfo> {
        let mut buckets: BTreeMap<u8, Vec<&Entry>> = BTreeMap::new();

        for entry in inner
            .entries
            .iter()
            .skip(self.closest_nodes_size)
            .filter(|e| !excluded.contains(&e.peer.node_id))
        {
            buckets
                .entry(entry.peer.bucket_index(&self.id))
                .or_default()
                .push(entry);
        }

        // Smallest bucket index is the furthest bucket.
        if let Some(entry) = buckets
            .values()
            .next()
            .and_then(|bucket| bucket.iter().max_by_key(|e| e.seq))
        {
            return Some(entry.peer.clone());
        }

        inner
            .entries
            .iter()
            .rev()
            .find(|e| !excluded.contains(&e.peer.node_id))
            .map(|e| e.peer.clone())
    }

    fn bucket_sizes(&self, inner: &Inner) -> BTreeMap<u8, usize> {
        let mut sizes = BTreeMap::new();

        for entry in &inner.entries {
            *sizes.entry(entry.peer.bucket_index(&self.id)).or_insert(0) += 1;
        }

        sizes
    }

    fn group(inner: &Inner, size: usize) -> Vec<PeerInfo> {
        inner
            .entries
            .iter()
            .take(size)
            .map(|e| e.peer.clone())
            .collect()
    }

    fn group_ids(inner: &Inner, size: usize) -> Vec<Id> {
        inner
            .entries
            .iter()
            .take(size)
            .map(|e| e.peer.node_id)
            .collect()
    }

    fn notify(&self, events: Vec<RoutingTableEvent>) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for event in events {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;
    use crate::common::ID_SIZE;

    fn config(max: usize) -> Config {
        Config {
            max_routing_table_size: max,
            ..Default::default()
        }
    }

    fn full_table(max: usize) -> RoutingTable {
        let table = RoutingTable::new(Id::random(), &config(max));

        while table.size() < max {
            assert!(table.add_node(PeerInfo::random()));
        }

        table
    }

    #[test]
    fn table_is_empty() {
        let table = RoutingTable::new(Id::random(), &Config::default());
        assert!(table.is_empty());

        table.add_node(PeerInfo::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn check_node_does_not_mutate() {
        let table = RoutingTable::new(Id::random(), &Config::default());

        for _ in 0..table.closest_nodes_size {
            assert!(table.check_node(&PeerInfo::random()));
        }

        assert_eq!(table.size(), 0);
    }

    #[test]
    fn should_not_add_invalid() {
        let table = RoutingTable::new(Id::random(), &Config::default());

        let mut missing_key = PeerInfo::random();
        missing_key.public_key = None;
        assert!(!table.add_node(missing_key));

        assert!(!table.add_node(PeerInfo::with_id(Id::ZERO)));

        let mut zero_connection = PeerInfo::random();
        zero_connection.connection_id = Id::ZERO;
        assert!(!table.add_node(zero_connection));

        assert!(table.is_empty());
    }

    #[test]
    fn should_not_add_self() {
        let table = RoutingTable::new(Id::random(), &Config::default());

        assert!(!table.add_node(PeerInfo::with_id(*table.id())));
        assert!(table.is_empty())
    }

    #[test]
    fn node_and_connection_ids_are_unique() {
        let table = RoutingTable::new(Id::random(), &Config::default());

        let peer = PeerInfo::random();
        assert!(table.add_node(peer.clone()));

        assert!(!table.add_node(PeerInfo::with_id(peer.node_id)));

        let mut same_connection = PeerInfo::random();
        same_connection.connection_id = peer.connection_id;
        assert!(!table.add_node(same_connection));

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn sorted_closest_first() {
        let table = full_table(32);
        let nodes = table.nodes();

        for pair in nodes.windows(2) {
            assert!(table.id().closer_to(&pair[0].node_id, &pair[1].node_id));
        }
    }

    #[test]
    fn should_not_add_more_than_capacity() {
        let table = full_table(64);

        for _ in 0..200 {
            let candidate = PeerInfo::random();
            let accepted = table.check_node(&candidate);

            assert_eq!(table.add_node(candidate), accepted);
            assert_eq!(table.size(), 64);
        }
    }

    #[test]
    fn closer_candidate_is_accepted_at_capacity() {
        let table = full_table(16);
        let furthest = table.nodes().last().cloned().unwrap();

        // Flip only the last bit of our own Id, closer than any random peer.
        let mut bytes = *table.id().as_bytes();
        bytes[19] ^= 1;
        let close = PeerInfo::with_id(Id::from(bytes));

        assert!(table.id().closer_to(&close.node_id, &furthest.node_id));
        assert!(table.add_node(close.clone()));
        assert_eq!(table.nodes()[0], close);
        assert_eq!(table.size(), 16);
    }

    #[test]
    fn further_candidate_is_accepted_if_it_evens_out_buckets() {
        let table = RoutingTable::new(Id::ZERO, &config(10));

        let with_prefix = |first: u8| {
            let mut bytes = [0_u8; ID_SIZE];
            bytes[0] = first;
            PeerInfo::with_id(Id::from(bytes))
        };

        // Ten peers sharing the `01` prefix, all in bucket 1, furthest added first.
        let crowded: Vec<PeerInfo> = (0..10).rev().map(|k| with_prefix(0x40 + k)).collect();
        for peer in &crowded {
            assert!(table.add_node(peer.clone()));
        }
        assert_eq!(table.size(), 10);

        // Prefix `1` is further than every member, but bucket 0 is empty.
        let lonely = with_prefix(0x80);
        assert!(table
            .nodes()
            .iter()
            .all(|p| table.id().closer_to(&p.node_id, &lonely.node_id)));
        assert_eq!(lonely.bucket_index(table.id()), 0);

        assert!(table.check_node(&lonely));
        assert!(table.add_node(lonely.clone()));
        assert_eq!(table.size(), 10);
        assert!(table.contains(&lonely.node_id));

        // Outside the closest range are 0x48 and 0x49, 0x48 was added last.
        let evicted = with_prefix(0x48).node_id;
        assert!(!table.contains(&evicted));
        assert!(table.contains(&with_prefix(0x49).node_id));

        // Bucket 0 now holds its share, so a further one is rejected.
        let before = table.nodes();
        let further = with_prefix(0xc0);

        assert!(!table.check_node(&further));
        assert!(!table.add_node(further));
        assert_eq!(table.nodes(), before);
    }

    #[test]
    fn drop_node_by_node_or_connection_id() {
        let table = RoutingTable::new(Id::random(), &Config::default());

        let a = PeerInfo::random();
        let key = ed25519_dalek::SigningKey::from_bytes(&rand::random()).verifying_key();
        let b = PeerInfo::with_connection(Id::random(), Id::random(), key);

        table.add_node(a.clone());
        table.add_node(b.clone());

        assert_eq!(table.drop_node(&a.node_id), Some(a.clone()));
        assert_eq!(table.drop_node(&b.connection_id), Some(b.clone()));
        assert_eq!(table.drop_node(&a.node_id), None);
        assert!(table.is_empty());
    }

    #[test]
    fn closest_node_with_exclusion() {
        let table = RoutingTable::new(Id::random(), &Config::default());
        let own_id = *table.id();

        // Empty routing table
        assert_eq!(table.closest_node(&own_id, &[], false), None);
        assert_eq!(table.closest_node(&own_id, &[], true), None);

        // One element
        let node = PeerInfo::random();
        table.add_node(node.clone());

        assert_eq!(table.closest_node(&own_id, &[], false), Some(node.clone()));
        assert_eq!(table.closest_node(&own_id, &[], true), Some(node.clone()));
        assert_eq!(table.closest_node(&node.node_id, &[], false), Some(node.clone()));
        assert_eq!(table.closest_node(&node.node_id, &[], true), None);
        assert_eq!(table.closest_node(&node.node_id, &[node.node_id], false), None);

        // Full table
        while table.size() < table.max_size {
            table.add_node(PeerInfo::random());
        }
        let ids: Vec<Id> = table.nodes().iter().map(|p| p.node_id).collect();
        let target = ids[rand::random::<usize>() % ids.len()];

        let exact = table.closest_node(&target, &[], false).unwrap();
        let past = table.closest_node(&target, &[], true).unwrap();
        assert_eq!(exact.node_id, target);
        assert_ne!(past.node_id, target);

        let excluded = table.closest_node(&target, &[target], false).unwrap();
        assert_eq!(excluded, past);

        assert_eq!(table.closest_node(&target, &ids, false), None);
    }

    #[test]
    fn closest_node_is_minimum_distance() {
        let table = full_table(64);

        for _ in 0..20 {
            let target = Id::random();
            let closest = table.closest_node(&target, &[], false).unwrap();

            for peer in table.nodes() {
                assert!(closest.node_id.xor(&target) <= peer.node_id.xor(&target));
            }
        }
    }

    #[test]
    fn closest_nodes() {
        let table = RoutingTable::new(
            Id::from_str("ba3042eb2d373b19e7c411ce6826e31b37be0b2e").unwrap(),
            &Config::default(),
        );

        let ids = [
            "fb449c17f6c34fadea26a5a83e1952e815e001ea",
            "e63b72f95aacee40ad087f83afb475645739f669",
            "58c65677e3833cb0f15733a6363cc4cb1352f90a",
            "fd042ff1404b495720ad8345404ff5f25acd02a8",
            "dbed34a2c8db568fe59c10adcca9e81825b3dcfd",
            "079d40b746b5721f59972ebde423429739844914",
            "094f1d2fb4b95ba2c3250b014a9f06d13cd9eb9a",
            "98805a55523458c56d59339266bdcecc82370ecd",
            "0a1d6cce47c60f2c7357e9fec2910192de6eb336",
            "fb689ce0e18c2c22f316976d3ae524aed4137773",
        ];

        for id in ids {
            assert!(table.add_node(PeerInfo::with_id(Id::from_str(id).unwrap())));
        }

        let target = Id::from_str("fb400000000000000000000000000000000000ff").unwrap();
        let closest: Vec<String> = table
            .closest_nodes(&target, 3, &[])
            .iter()
            .map(|p| p.node_id.to_string())
            .collect();

        assert_eq!(
            closest,
            vec![
                "fb449c17f6c34fadea26a5a83e1952e815e001ea",
                "fb689ce0e18c2c22f316976d3ae524aed4137773",
                "fd042ff1404b495720ad8345404ff5f25acd02a8",
            ]
        );
    }

    #[test]
    fn removable_node_respects_exclusion() {
        let table = full_table(100);

        let mut drawn: Vec<Id> = vec![];
        for _ in 0..100 {
            let removable = table.removable_node(&drawn).unwrap();
            assert!(!drawn.contains(&removable.node_id));
            drawn.push(removable.node_id);
        }

        assert_eq!(table.removable_node(&drawn), None);
    }

    #[test]
    fn removable_node_is_not_in_closest_range() {
        let table = full_table(64);

        let removable = table.removable_node(&[]).unwrap();
        let closest: Vec<PeerInfo> = table.nodes()[..table.closest_nodes_size].to_vec();

        assert!(!closest.contains(&removable));

        let furthest_bucket = table
            .nodes()
            .iter()
            .skip(table.closest_nodes_size)
            .map(|p| p.bucket_index(table.id()))
            .min()
            .unwrap();
        assert_eq!(removable.bucket_index(table.id()), furthest_bucket);
    }

    #[test]
    fn in_range() {
        let table = RoutingTable::new(Id::random(), &Config::default());

        // Fewer peers than the range.
        assert!(table.is_this_node_in_range(&Id::random(), 4));

        let target = PeerInfo::random();
        table.add_node(target.clone());

        // The target itself is not counted.
        assert!(table.is_this_node_in_range(&target.node_id, 1));

        for _ in 0..10 {
            table.add_node(PeerInfo::random());
        }

        let target = Id::random();
        let own_distance = table.id().xor(&target);
        let closer = table
            .nodes()
            .iter()
            .filter(|p| p.node_id.xor(&target) < own_distance)
            .count();

        assert_eq!(table.is_this_node_in_range(&target, 4), closer < 4);
    }

    #[test]
    fn events() {
        let table = RoutingTable::new(Id::random(), &Config::default());
        let rx = table.subscribe();

        let peer = PeerInfo::random();
        table.add_node(peer.clone());

        assert_eq!(
            rx.try_recv().unwrap(),
            RoutingTableEvent::CloseGroupChanged(vec![peer.clone()])
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            RoutingTableEvent::NodeAdded {
                peer: peer.clone(),
                in_close_group: true
            }
        );
        assert_eq!(rx.try_recv().unwrap(), RoutingTableEvent::SizeChanged(1));

        table.drop_node(&peer.node_id);

        assert_eq!(
            rx.try_recv().unwrap(),
            RoutingTableEvent::CloseGroupChanged(vec![])
        );
        assert_eq!(rx.try_recv().unwrap(), RoutingTableEvent::SizeChanged(0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_subscriber_is_removed() {
        let table = RoutingTable::new(Id::random(), &Config::default());

        drop(table.subscribe());
        table.add_node(PeerInfo::random());

        assert!(table
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty());
    }
}
