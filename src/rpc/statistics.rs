//! Monotonic counters for the engine's externally observable behavior.

use std::sync::atomic::{AtomicU64, Ordering};

/// Bump a counter by one.
#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Add `n` to a counter.
#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Read a counter.
#[inline]
pub fn value(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Counters for everything the node silently drops, sheds or discovers.
/// Shared across the engine and its helper threads; reads are safe from any
/// thread.
#[derive(Debug, Default)]
pub struct Statistics {
    /// Datagrams handed to the engine by the socket reader.
    pub total_recv: AtomicU64,
    /// Datagrams shed by the rate-limit token bucket.
    pub total_dropped_packets: AtomicU64,
    /// Datagrams dropped because their source exceeded the per-minute limit.
    pub total_packets_blocked: AtomicU64,
    /// Datagrams that were not bencode dictionaries we understand.
    pub total_malformed_packets: AtomicU64,

    /// Nodes that replied to us at least once.
    pub total_nodes_reached: AtomicU64,
    /// Node references that aliased the replying node's own address.
    pub total_self_promotions: AtomicU64,
    /// Node references from get_peers replies we already tracked.
    pub total_get_peers_dupes: AtomicU64,
    /// Node references from find_node replies we already tracked.
    pub total_find_node_dupes: AtomicU64,
    /// Peer contacts forwarded to the client.
    pub total_peers_found: AtomicU64,

    pub total_sent: AtomicU64,
    pub total_written_bytes: AtomicU64,
    pub total_read_bytes: AtomicU64,

    pub total_sent_ping: AtomicU64,
    pub total_sent_get_peers: AtomicU64,
    pub total_sent_find_node: AtomicU64,

    pub total_recv_ping: AtomicU64,
    pub total_recv_get_peers: AtomicU64,
    pub total_recv_find_node: AtomicU64,
    pub total_recv_announce_peer: AtomicU64,
    pub total_recv_ping_reply: AtomicU64,
    pub total_recv_get_peers_reply: AtomicU64,
    pub total_recv_find_node_reply: AtomicU64,
}
