//! Per-remote state: pending queries, reachability, last-seen times.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::common::{Id, InfoHash};

/// Search a node again for the same infohash only after this period.
pub const SEARCH_RETRY_PERIOD: Duration = Duration::from_secs(15);

/// Consider a node stale if it has more than this number of outstanding
/// queries from us.
pub const MAX_NODE_PENDING_QUERIES: usize = 5;

/// The four KRPC query kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

/// What we remember about a query we sent: its kind and, for searches, the
/// infohash it was about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    pub kind: QueryKind,
    pub info_hash: Option<InfoHash>,
}

/// Record of a known remote node, owned by the routing table.
#[derive(Debug)]
pub struct RemoteNode {
    pub address: SocketAddrV4,
    /// None until the node's id is learned from its first reply, or supplied
    /// by a `nodes` reference.
    pub id: Option<Id>,
    /// Incremented after consumed. Based on the protocol it would be two
    /// letters, but 0-255 rendered as a decimal string works fine.
    last_query_id: u8,
    /// Outstanding queries, keyed by transaction id.
    pub pending_queries: HashMap<String, QueryRecord>,
    /// Recently answered queries, same shape. Kept as a debugging aid; never
    /// read back for protocol decisions.
    pub past_queries: HashMap<String, QueryRecord>,
    /// Cleared until at least one valid reply was received.
    pub reachable: bool,
    pub last_response_time: Option<Instant>,
    pub last_search_time: Option<Instant>,
}

impl RemoteNode {
    pub fn new(address: SocketAddrV4) -> RemoteNode {
        RemoteNode {
            address,
            id: None,
            last_query_id: rand::random(),
            pending_queries: HashMap::new(),
            past_queries: HashMap::new(),
            reachable: false,
            last_response_time: None,
            last_search_time: None,
        }
    }

    /// Advance the transaction counter and record a pending query under the
    /// new transaction id, which is returned in its string form. The caller
    /// fills in the target infohash when there is one.
    pub fn new_query(&mut self, kind: QueryKind) -> String {
        self.last_query_id = self.last_query_id.wrapping_add(1);
        let transaction_id = self.last_query_id.to_string();
        self.pending_queries.insert(
            transaction_id.clone(),
            QueryRecord {
                kind,
                info_hash: None,
            },
        );
        transaction_id
    }

    /// True if a node was contacted recently _and_ one of the recent queries
    /// (not necessarily the last) was about `info_hash`. If the infohash is
    /// different each time, it keeps returning false.
    pub fn was_contacted_recently(&self, info_hash: &InfoHash) -> bool {
        if self.pending_queries.is_empty() && self.past_queries.is_empty() {
            return false;
        }
        if let Some(last_response) = self.last_response_time {
            if last_response.elapsed() > SEARCH_RETRY_PERIOD {
                return false;
            }
        }
        for query in self.pending_queries.values() {
            if query.info_hash.as_ref() == Some(info_hash) {
                return true;
            }
        }
        if let Some(last_search) = self.last_search_time {
            if last_search.elapsed() > SEARCH_RETRY_PERIOD {
                return false;
            }
        }
        for query in self.past_queries.values() {
            if query.info_hash.as_ref() == Some(info_hash) {
                return true;
            }
        }
        false
    }

    /// The 6 byte binary form of this node's address.
    pub fn compact_address(&self) -> [u8; 6] {
        let mut compact = [0u8; 6];
        compact[..4].copy_from_slice(&self.address.ip().octets());
        compact[4..].copy_from_slice(&self.address.port().to_be_bytes());
        compact
    }
}
