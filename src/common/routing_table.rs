//! Routing table: address index, prefix tree and neighborhood bookkeeping.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::common::{
    Id, InfoHash, NodeRef, RemoteNode, Tree, KNODES, MAX_NODE_PENDING_QUERIES,
};
use crate::rpc::PeerStore;
use crate::{Error, Result};

/// Resolve a "host:port" specification to an IPv4 socket address.
pub fn resolve_v4(host_port: &str) -> Result<SocketAddrV4> {
    host_port
        .to_socket_addrs()
        .map_err(|_| Error::AddressResolution(host_port.to_string()))?
        .find_map(|address| match address {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::AddressResolution(host_port.to_string()))
}

/// Two coupled indices over [RemoteNode]s, keyed by the local node id:
/// a map from canonical "ip:port" strings for O(1) ingress lookup, and a
/// prefix tree over node ids for XOR-closest lookups. The address index is
/// the owner; everything else holds [NodeRef] back-references.
#[derive(Debug)]
pub struct RoutingTable {
    id: Id,
    addresses: HashMap<String, RemoteNode>,
    tree: Tree,
    /// The in-neighborhood node with the fewest prefix bits shared with the
    /// local id; the next candidate to be displaced.
    boundary: Option<NodeRef>,
    /// How many prefix bits are shared between the boundary node and the
    /// local id.
    proximity: usize,
}

impl RoutingTable {
    pub fn new(id: Id) -> RoutingTable {
        RoutingTable {
            id,
            addresses: HashMap::new(),
            tree: Tree::default(),
            boundary: None,
            proximity: 0,
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn node(&self, addr: &str) -> Option<&RemoteNode> {
        self.addresses.get(addr)
    }

    pub fn node_mut(&mut self, addr: &str) -> Option<&mut RemoteNode> {
        self.addresses.get_mut(addr)
    }

    pub fn proximity(&self) -> usize {
        self.proximity
    }

    pub fn boundary(&self) -> Option<&NodeRef> {
        self.boundary.as_ref()
    }

    // === Public Methods ===

    /// Find a node based on a "host:port" specification. Returns the node if
    /// one is tracked, along with the canonical address. Fails only if
    /// resolution fails.
    pub fn host_port_to_node(&self, host_port: &str) -> Result<(Option<&RemoteNode>, String)> {
        let addr = resolve_v4(host_port)?.to_string();
        Ok((self.addresses.get(&addr), addr))
    }

    /// Return the canonical address of the node tracked for `host_port`,
    /// preferably an entry that is already in the routing table, creating a
    /// new one otherwise. An already tracked entry keeps its id; for a new
    /// entry the supplied id, when present, is also inserted into the prefix
    /// tree.
    pub fn get_or_create_node(&mut self, id: Option<Id>, host_port: &str) -> Result<String> {
        let address = resolve_v4(host_port)?;
        let addr = address.to_string();
        if self.addresses.contains_key(&addr) {
            return Ok(addr);
        }

        if address.port() == 0 {
            return Err(Error::InvalidNode("port 0"));
        }
        if address.ip().is_unspecified() {
            return Err(Error::InvalidNode("unspecified IP address"));
        }

        let mut node = RemoteNode::new(address);
        node.id = id;
        self.addresses.insert(addr.clone(), node);
        if let Some(id) = id {
            self.tree.insert(NodeRef {
                id,
                addr: addr.clone(),
            });
        }
        Ok(addr)
    }

    /// Record the id a tracked node replied with, inserting it into the
    /// prefix tree. Called after a reply arrives for a node whose id was
    /// unknown until now.
    pub fn update(&mut self, addr: &str, id: Id) -> Result<()> {
        let node = self
            .addresses
            .get_mut(addr)
            .ok_or_else(|| Error::UnknownNode(addr.to_string()))?;
        node.id = Some(id);
        self.tree.insert(NodeRef {
            id,
            addr: addr.to_string(),
        });
        Ok(())
    }

    /// Up to [KNODES] tracked nodes closest to `target` by XOR distance.
    pub fn lookup(&self, target: &InfoHash) -> Vec<NodeRef> {
        self.tree.lookup(target)
    }

    /// Same as [RoutingTable::lookup], excluding nodes with too many
    /// outstanding queries or already searched for this same infohash
    /// recently, so new queries don't re-hit the same nodes.
    pub fn lookup_filtered(&self, target: &InfoHash) -> Vec<NodeRef> {
        let addresses = &self.addresses;
        self.tree.lookup_filtered(target, &|node_ref: &NodeRef| {
            addresses.get(&node_ref.addr).map_or(false, |node| {
                node.pending_queries.len() <= MAX_NODE_PENDING_QUERIES
                    && !node.was_contacted_recently(target)
            })
        })
    }

    /// Remove a node from both indices. If it was the neighborhood boundary,
    /// the boundary and proximity are recomputed, and the peer store marks
    /// any matching peer contact dead.
    pub fn kill(&mut self, addr: &str, peer_store: &mut PeerStore) {
        let Some(removed) = self.addresses.remove(addr) else {
            return;
        };
        if let Some(id) = removed.id {
            self.tree.cut(&id, 0);
        }

        if self
            .boundary
            .as_ref()
            .is_some_and(|boundary| Some(boundary.id) == removed.id)
        {
            self.reset_neighborhood_boundary();
        }
        peer_store.kill_contact(&removed.compact_address());
    }

    /// Update the neighborhood if `node` is closer to the local id than the
    /// 8 nodes currently in it, by replacing the least close one (the
    /// boundary).
    pub fn neighborhood_upkeep(&mut self, node: &NodeRef, peer_store: &mut PeerStore) {
        if self.boundary.is_none() {
            self.add_new_neighbor(node, false, peer_store);
            return;
        }
        if self.len() < KNODES {
            self.add_new_neighbor(node, false, peer_store);
            return;
        }
        let common = self.id.common_bits(&node.id);
        if common == 0 {
            // Not significantly better.
            return;
        }
        if common > self.proximity {
            self.add_new_neighbor(node, true, peer_store);
        }
    }

    /// Returns a batch of nodes requiring a ping, and evicts nodes that have
    /// stopped replying or never replied at all.
    pub fn cleanup(&mut self, period: Duration, peer_store: &mut PeerStore) -> Vec<String> {
        let mut need_ping = Vec::with_capacity(10);
        let mut to_kill = Vec::new();

        for (addr, node) in &self.addresses {
            if *addr != node.address.to_string() {
                debug!(
                    addr,
                    node_addr = %node.address,
                    "cleanup: node address mismatch, deleting node"
                );
                to_kill.push(addr.clone());
                continue;
            }
            if node.reachable {
                if !node.pending_queries.is_empty() {
                    let last_response = node
                        .last_response_time
                        .map_or(Duration::MAX, |at| at.elapsed());
                    // Tolerate two cleanup cycles.
                    if last_response > period * 2 + period / 15 {
                        debug!(addr, ?last_response, "cleanup: old node, deleting");
                        to_kill.push(addr.clone());
                        continue;
                    }
                    if last_response < period / 2 {
                        // Seen recently. No need to ping.
                        continue;
                    }
                }
            } else if node.pending_queries.len() > MAX_NODE_PENDING_QUERIES {
                // Didn't reply to several consecutive queries.
                debug!(addr, "cleanup: node never replied to ping, deleting");
                to_kill.push(addr.clone());
                continue;
            }
            need_ping.push(addr.clone());
        }

        for addr in to_kill {
            self.kill(&addr, peer_store);
        }
        need_ping
    }

    /// The reachable nodes with a known id, for the on-disk snapshot.
    pub fn reachable_nodes(&self) -> HashMap<String, Id> {
        self.addresses
            .iter()
            .filter_map(|(addr, node)| {
                let id = node.id?;
                node.reachable.then(|| (addr.clone(), id))
            })
            .collect()
    }

    // === Private Methods ===

    fn add_new_neighbor(
        &mut self,
        node: &NodeRef,
        displace_boundary: bool,
        peer_store: &mut PeerStore,
    ) {
        if !self.addresses.contains_key(&node.addr) {
            if let Err(e) = self.get_or_create_node(Some(node.id), &node.addr) {
                debug!(?e, "add_new_neighbor failed to insert");
                return;
            }
        }
        if displace_boundary {
            if let Some(boundary) = self.boundary.clone() {
                // This also takes care of setting a new boundary.
                self.kill(&boundary.addr, peer_store);
                return;
            }
        }
        self.reset_neighborhood_boundary();
    }

    fn reset_neighborhood_boundary(&mut self) {
        self.proximity = 0;
        // Find the most distant node within the neighborhood and promote it
        // as the boundary.
        let neighbors = self.tree.lookup(&self.id);
        match neighbors.last() {
            Some(last) => {
                self.proximity = self.id.common_bits(&last.id);
                self.boundary = Some(last.clone());
            }
            None => self.boundary = None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::ID_SIZE;

    const LOCAL_ID: &[u8; 20] = b"01abcdefghij01234567";

    // (id bytes, prefix bits shared with LOCAL_ID)
    const CLOSE_IDS: [(&[u8; 20], usize); 7] = [
        (b"01abcdefghij01234566", 159),
        (b"01abcdefghij01234568", 156),
        (b"01abcdefghij01234569", 156),
        (b"01abcdefghij0123456a", 153),
        (b"01abcdefghij0123456b", 153),
        (b"01abcdefghij0123456c", 153),
        (b"01abcdefghij0123456d", 153),
    ];

    fn peer_store() -> PeerStore {
        PeerStore::new(8, 8)
    }

    fn node_ref(id: Id, octet: u8) -> NodeRef {
        NodeRef {
            id,
            addr: format!("127.1.0.{octet}:1111"),
        }
    }

    fn far_id(i: u8) -> Id {
        let mut bytes: [u8; ID_SIZE] = Id::random().0;
        // Ensure long distance from LOCAL_ID.
        bytes[0] = 0x3d;
        bytes[1] = i;
        Id(bytes)
    }

    #[test]
    fn neighborhood_promotion() {
        let mut table = RoutingTable::new(Id(*LOCAL_ID));
        let mut store = peer_store();

        // 8 random far away nodes become the initial neighborhood.
        for i in 0..KNODES as u8 {
            table.neighborhood_upkeep(&node_ref(far_id(i), i), &mut store);
        }
        assert!(table.proximity() < 8);

        // 7 close nodes displace all but one of them, with proximity rising
        // monotonically as each closer node enters.
        let mut last_proximity = table.proximity();
        for (i, (id, _)) in CLOSE_IDS.iter().enumerate() {
            table.neighborhood_upkeep(&node_ref(Id(**id), 100 + i as u8), &mut store);
            assert!(table.proximity() >= last_proximity);
            last_proximity = table.proximity();
        }

        // One distant node remains, so the boundary proximity stays below
        // the worst of the static entries.
        let worst = CLOSE_IDS[CLOSE_IDS.len() - 1].1;
        assert!(
            table.proximity() < worst,
            "proximity {} should be below {}",
            table.proximity(),
            worst
        );

        // Killing the boundary promotes the next most distant node, which is
        // now one of the close entries.
        let boundary = table.boundary().expect("boundary node").clone();
        table.kill(&boundary.addr, &mut store);
        assert_eq!(table.proximity(), worst);
    }

    #[test]
    fn lookup_filtered_skips_busy_nodes() {
        let ih: InfoHash = "d1c5676ae7ac98e8b19f63565905105e3c4c37a2".parse().unwrap();
        let mut table = RoutingTable::new(Id(*LOCAL_ID));

        let addr = table
            .get_or_create_node(Some(far_id(1)), "127.1.0.1:1111")
            .unwrap();
        assert_eq!(table.lookup_filtered(&ih).len(), 1);

        let node = table.node_mut(&addr).unwrap();
        for _ in 0..=MAX_NODE_PENDING_QUERIES {
            node.new_query(crate::common::QueryKind::GetPeers);
        }
        assert!(table.lookup_filtered(&ih).is_empty());
        assert_eq!(table.lookup(&ih).len(), 1);
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let mut table = RoutingTable::new(Id::random());

        let first = table.get_or_create_node(None, "127.0.0.1:7000").unwrap();
        let second = table
            .get_or_create_node(Some(Id::random()), "127.0.0.1:7000")
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
        // The id supplied on the second call is ignored for a tracked entry.
        assert!(table.node(&first).unwrap().id.is_none());
    }

    #[test]
    fn kill_removes_from_both_indices() {
        let mut table = RoutingTable::new(Id(*LOCAL_ID));
        let mut store = peer_store();

        let id = far_id(9);
        let addr = table.get_or_create_node(Some(id), "127.1.0.9:1111").unwrap();
        assert_eq!(table.lookup(&id).len(), 1);

        table.kill(&addr, &mut store);
        assert!(table.node(&addr).is_none());
        assert!(table.lookup(&id).is_empty());
    }

    #[test]
    fn cleanup_evicts_unreachable_node_with_too_many_pending() {
        let mut table = RoutingTable::new(Id(*LOCAL_ID));
        let mut store = peer_store();

        let addr = table
            .get_or_create_node(Some(far_id(2)), "127.1.0.2:1111")
            .unwrap();
        let node = table.node_mut(&addr).unwrap();
        for _ in 0..6 {
            node.new_query(crate::common::QueryKind::Ping);
        }

        let need_ping = table.cleanup(Duration::from_secs(900), &mut store);
        assert!(table.node(&addr).is_none());
        assert!(!need_ping.contains(&addr));
    }

    #[test]
    fn cleanup_pings_fresh_nodes() {
        let mut table = RoutingTable::new(Id(*LOCAL_ID));
        let mut store = peer_store();

        let addr = table
            .get_or_create_node(Some(far_id(3)), "127.1.0.3:1111")
            .unwrap();
        let need_ping = table.cleanup(Duration::from_secs(900), &mut store);
        assert_eq!(need_ping, vec![addr]);
    }
}
