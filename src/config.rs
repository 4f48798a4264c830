//! Configuration for a DHT node.

use std::time::Duration;

/// Protocol family for the UDP socket and for picking the `nodes` or
/// `nodes6` field out of replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdpProto {
    /// IPv4, the fully supported path.
    #[default]
    V4,
    /// IPv6. Wire layout only; contact parsing is stubbed.
    V6,
}

#[derive(Debug, Clone)]
/// Config for the DHT node. [Config::default] carries the recommended values.
pub struct Config {
    /// IP address to listen on. If left blank, all interfaces.
    pub address: String,
    /// UDP port the DHT node should listen on. If zero, it picks a random port.
    pub port: u16,
    /// Number of peers that the DHT will try to find for each infohash being
    /// searched. Default value: 5.
    pub num_target_peers: usize,
    /// Comma separated list of DHT routers used for bootstrapping the network.
    pub routers: String,
    /// Maximum number of nodes to store in the routing table. Default value: 500.
    pub max_nodes: usize,
    /// How often to ping nodes in the network to see if they are reachable.
    /// Default value: 15 min.
    pub cleanup_period: Duration,
    /// If true, the node will read the routing table from disk on startup and
    /// save routing table snapshots on disk every few minutes. Default value: true.
    pub save_routing_table: bool,
    /// How often to save the routing table to disk. Default value: 5 minutes.
    pub save_period: Duration,
    /// Maximum packets per second to be processed. Disabled if negative.
    /// Default value: 100.
    pub rate_limit: i64,
    /// Limit of infohashes for which we should keep a peer list. Larger
    /// values help keeping the DHT network healthy. Default value: 2048.
    pub max_info_hashes: usize,
    /// Limit of peers to be tracked for each infohash. A single peer contact
    /// typically consumes 6 bytes. Default value: 256.
    pub max_info_hash_peers: usize,
    /// Protects against spammy clients. Ignore their requests if they exceed
    /// this number of packets per minute. Default value: 50.
    pub client_per_minute_limit: usize,
    /// Number of hosts the client throttler remembers. An LRU is used to
    /// track the most interesting ones. Default value: 1000.
    pub throttler_tracked_clients: usize,
    /// Protocol family for UDP connections.
    pub udp_proto: UdpProto,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: String::new(),
            port: 0,
            num_target_peers: 5,
            routers: "router.magnets.im:6881,router.bittorrent.com:6881,dht.transmissionbt.com:6881"
                .to_string(),
            max_nodes: 500,
            cleanup_period: Duration::from_secs(15 * 60),
            save_routing_table: true,
            save_period: Duration::from_secs(5 * 60),
            rate_limit: 100,
            max_info_hashes: 2048,
            max_info_hash_peers: 256,
            client_per_minute_limit: 50,
            throttler_tracked_clients: 1000,
            udp_proto: UdpProto::V4,
        }
    }
}

impl Config {
    /// The configured bootstrap routers, split out of the comma separated list.
    pub(crate) fn router_list(&self) -> Vec<String> {
        self.routers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}
