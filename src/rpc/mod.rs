//! The protocol engine: a single-threaded event loop multiplexing incoming
//! packets, client requests and periodic upkeep.

mod arena;
mod peers;
mod socket;
pub mod statistics;
mod throttle;
mod tokens;

pub(crate) use arena::Arena;
pub(crate) use peers::PeerStore;
pub(crate) use socket::{spawn_reader, KrpcSocket, MAX_UDP_PACKET_SIZE};
pub(crate) use throttle::ClientThrottle;
pub(crate) use tokens::Tokens;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::common::messages::{
    compact_node, compact_peer, parse_nodes, parse_peer, Message, MessageKind, QueryArguments,
    QuerySpecific, ResponseArguments, V4_NODE_CONTACT_LEN,
};
use crate::common::{
    Id, InfoHash, NodeRef, QueryKind, QueryRecord, RoutingTable, KNODES, SEARCH_RETRY_PERIOD,
};
use crate::config::{Config, UdpProto};
use crate::store::{self, DhtStore};
use crate::Result;

use statistics::{add, bump, Statistics};

/// Try to ensure that at least this many nodes are in the routing table.
const MIN_NODES: usize = 16;

const SECRET_ROTATE_PERIOD: Duration = Duration::from_secs(5 * 60);

const TOKEN_BUCKET_REFILL_PERIOD: Duration = Duration::from_millis(100);

const ARENA_NUM_BLOCKS: usize = 3;

/// Peers discovered for the infohashes the client asked about.
pub type PeersFound = HashMap<InfoHash, Vec<SocketAddrV4>>;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AnnounceOptions {
    pub announce: bool,
    pub port: u16,
}

/// The engine's half of the client plumbing. The matching senders live on
/// the [crate::Dht] handle; the engine also keeps senders for the channels
/// it re-enqueues work onto.
#[derive(Debug)]
pub(crate) struct Channels {
    pub stop: flume::Receiver<()>,
    pub acquaintance: flume::Receiver<String>,
    pub peers_request: flume::Receiver<(InfoHash, AnnounceOptions)>,
    pub peers_request_tx: flume::Sender<(InfoHash, AnnounceOptions)>,
    pub nodes_request: flume::Receiver<InfoHash>,
    pub nodes_request_tx: flume::Sender<InfoHash>,
    pub remove_info_hash: flume::Receiver<InfoHash>,
    pub port_request: flume::Receiver<flume::Sender<u16>>,
    pub results: flume::Sender<PeersFound>,
}

enum Event {
    Stop,
    Acquaintance(String),
    PeersRequest((InfoHash, AnnounceOptions)),
    RemoveInfoHash(InfoHash),
    NodesRequest(InfoHash),
    Packet((Vec<u8>, SocketAddrV4)),
    PingRequest(String),
    PortRequest(flume::Sender<u16>),
}

/// The DHT engine. All protocol state is owned here and mutated only from
/// [Rpc::run] on its own thread; handlers run to completion and outbound
/// sends are fire-and-forget.
#[derive(Debug)]
pub(crate) struct Rpc {
    config: Config,
    id: Id,

    socket: KrpcSocket,
    arena: Arena,

    routing_table: RoutingTable,
    peer_store: PeerStore,
    tokens: Tokens,
    throttle: ClientThrottle,
    token_bucket: i64,

    store: DhtStore,

    chans: Channels,
    packets: flume::Receiver<(Vec<u8>, SocketAddrV4)>,
    ping_tx: flume::Sender<String>,
    ping_rx: flume::Receiver<String>,

    shutdown: Arc<AtomicBool>,
    stats: Arc<Statistics>,

    reader: Option<JoinHandle<()>>,
    pingers: Vec<JoinHandle<()>>,

    next_token_refill: Instant,
    next_cleanup: Instant,
    next_secret_rotate: Instant,
    next_save: Instant,
}

impl Rpc {
    pub(crate) fn new(
        mut config: Config,
        id: Id,
        store: DhtStore,
        chans: Channels,
        shutdown: Arc<AtomicBool>,
        stats: Arc<Statistics>,
    ) -> Result<Rpc> {
        if config.rate_limit > 0 && config.rate_limit < 10 {
            // Less than 10 leads to refill rounding problems.
            config.rate_limit = 10;
        }

        let socket = KrpcSocket::bind(&config.address, config.port, stats.clone())?;

        // One thread pushes buffers and one pops them, passing work to the
        // other, so the arena needs very few blocks. If packet processing is
        // ever parallelized this has to be bumped.
        let arena = Arena::new(MAX_UDP_PACKET_SIZE, ARENA_NUM_BLOCKS);
        let (packets_tx, packets_rx) = flume::bounded(ARENA_NUM_BLOCKS);
        let reader = spawn_reader(
            socket.reader_socket()?,
            arena.clone(),
            packets_tx,
            shutdown.clone(),
            stats.clone(),
        );

        let (ping_tx, ping_rx) = flume::bounded(1);

        let now = Instant::now();
        Ok(Rpc {
            routing_table: RoutingTable::new(id),
            peer_store: PeerStore::new(config.max_info_hashes, config.max_info_hash_peers),
            tokens: Tokens::new(),
            throttle: ClientThrottle::new(
                config.client_per_minute_limit,
                config.throttler_tracked_clients,
            ),
            token_bucket: config.rate_limit.max(0),
            next_token_refill: now + TOKEN_BUCKET_REFILL_PERIOD,
            next_cleanup: now + config.cleanup_period,
            next_secret_rotate: now + SECRET_ROTATE_PERIOD,
            next_save: now + config.save_period,
            id,
            socket,
            arena,
            store,
            chans,
            packets: packets_rx,
            ping_tx,
            ping_rx,
            shutdown,
            stats,
            reader: Some(reader),
            pingers: Vec::new(),
            config,
        })
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.socket.local_addr().port()
    }

    pub(crate) fn saved_remotes(&self) -> Vec<String> {
        self.store.remotes.keys().cloned().collect()
    }

    // === The event loop ===

    pub(crate) fn run(mut self) {
        info!(
            id = %self.id,
            port = self.local_port(),
            "starting DHT node"
        );
        self.bootstrap();

        loop {
            if self.shutdown.load(Relaxed) {
                break;
            }
            let timeout = self
                .next_deadline()
                .saturating_duration_since(Instant::now());

            let event = flume::Selector::new()
                .recv(&self.chans.stop, |_| Event::Stop)
                .recv(&self.chans.acquaintance, |r| {
                    r.map_or(Event::Stop, Event::Acquaintance)
                })
                .recv(&self.chans.peers_request, |r| {
                    r.map_or(Event::Stop, Event::PeersRequest)
                })
                .recv(&self.chans.remove_info_hash, |r| {
                    r.map_or(Event::Stop, Event::RemoveInfoHash)
                })
                .recv(&self.chans.nodes_request, |r| {
                    r.map_or(Event::Stop, Event::NodesRequest)
                })
                .recv(&self.packets, |r| r.map_or(Event::Stop, Event::Packet))
                .recv(&self.ping_rx, |r| r.map_or(Event::Stop, Event::PingRequest))
                .recv(&self.chans.port_request, |r| {
                    r.map_or(Event::Stop, Event::PortRequest)
                })
                .wait_timeout(timeout);

            match event {
                Ok(Event::Stop) => break,
                Ok(event) => self.handle_event(event),
                Err(_timeout) => {}
            }
            self.run_due_timers();
        }

        self.finish();
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Stop => {}
            Event::Acquaintance(addr) => self.hello_from_peer(&addr),
            Event::PeersRequest(first) => self.handle_peers_requests(first),
            Event::RemoveInfoHash(info_hash) => self.peer_store.remove_local_download(&info_hash),
            Event::NodesRequest(first) => self.handle_nodes_requests(first),
            Event::Packet((buffer, from)) => self.ingress(buffer, from),
            Event::PingRequest(addr) => self.ping_node(&addr),
            Event::PortRequest(reply) => {
                let _ = reply.send(self.local_port());
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.next_cleanup.min(self.next_secret_rotate);
        if self.config.rate_limit >= 0 {
            deadline = deadline.min(self.next_token_refill);
        }
        if self.config.save_routing_table {
            deadline = deadline.min(self.next_save);
        }
        deadline
    }

    fn run_due_timers(&mut self) {
        let now = Instant::now();
        if self.config.rate_limit >= 0 && now >= self.next_token_refill {
            self.refill_token_bucket();
            self.next_token_refill = now + TOKEN_BUCKET_REFILL_PERIOD;
        }
        if now >= self.next_cleanup {
            self.cleanup_tick();
            self.next_cleanup = now + self.config.cleanup_period;
        }
        if now >= self.next_secret_rotate {
            self.tokens.rotate();
            self.next_secret_rotate = now + SECRET_ROTATE_PERIOD;
        }
        if self.config.save_routing_table && now >= self.next_save {
            self.save_tick();
            self.next_save = now + self.config.save_period;
        }
    }

    fn finish(self) {
        info!("DHT node exiting");
        let Rpc {
            arena,
            packets,
            reader,
            pingers,
            ..
        } = self;
        // The channels and the socket were dropped just now, which unblocks
        // the pacing pingers and fails the reader's next hand-off. Queued
        // buffers go back to the arena so the reader can't be left waiting
        // on an empty pool while we join it.
        while let Ok((buffer, _)) = packets.try_recv() {
            arena.push(buffer);
        }
        drop(packets);
        if let Some(reader) = reader {
            let _ = reader.join();
        }
        for pinger in pingers {
            let _ = pinger.join();
        }
    }

    // === Client requests ===

    fn hello_from_peer(&mut self, addr: &str) {
        // A new address. See if we already track it, and if not and there is
        // room, check whether it is reachable.
        match self.routing_table.host_port_to_node(addr) {
            Ok((Some(_), _)) => {}
            Ok((None, resolved)) => {
                if self.routing_table.len() < self.config.max_nodes {
                    self.ping(&resolved);
                }
            }
            Err(e) => debug!(?e, addr, "hello_from_peer error"),
        }
    }

    fn handle_peers_requests(&mut self, first: (InfoHash, AnnounceOptions)) {
        // Drain all requests sitting in the channel and de-dupe them; later
        // requests replace earlier announce options for the same infohash.
        let mut requests: HashMap<InfoHash, AnnounceOptions> = HashMap::new();
        requests.insert(first.0, first.1);
        while let Ok((info_hash, options)) = self.chans.peers_request.try_recv() {
            requests.insert(info_hash, options);
        }

        for (info_hash, options) in requests {
            if options.announce {
                self.peer_store.add_local_download(info_hash, options.port);
            }
            // There might be enough peers in the store already, but no seeds.
            self.get_peers(info_hash);
        }
    }

    fn handle_nodes_requests(&mut self, first: InfoHash) {
        let mut targets: HashSet<InfoHash> = HashSet::new();
        targets.insert(first);
        while let Ok(target) = self.chans.nodes_request.try_recv() {
            targets.insert(target);
        }

        for target in targets {
            self.find_node(target);
        }
    }

    // === Periodic upkeep ===

    fn refill_token_bucket(&mut self) {
        if self.token_bucket < self.config.rate_limit {
            self.token_bucket =
                (self.token_bucket + self.config.rate_limit / 10).min(self.config.rate_limit);
        }
    }

    fn cleanup_tick(&mut self) {
        let need_ping = self
            .routing_table
            .cleanup(self.config.cleanup_period, &mut self.peer_store);
        if !need_ping.is_empty() {
            let ping_tx = self.ping_tx.clone();
            let shutdown = self.shutdown.clone();
            let period = self.config.cleanup_period;
            self.pingers
                .push(thread::spawn(move || {
                    ping_slowly(ping_tx, need_ping, period, shutdown)
                }));
        }
        self.pingers.retain(|pinger| !pinger.is_finished());

        if self.need_more_nodes() {
            self.bootstrap();
        }
    }

    fn save_tick(&mut self) {
        let reachable = self.routing_table.reachable_nodes();
        if reachable.len() > 5 {
            self.store.remotes = reachable
                .into_iter()
                .map(|(addr, id)| (addr, id.to_vec()))
                .collect();
            self.store.port = self.local_port();
            if let Err(e) = store::save(&self.store) {
                debug!(?e, "failed to save routing table snapshot");
            }
        }
    }

    // === Outgoing queries ===

    fn bootstrap(&mut self) {
        for router in self.config.router_list() {
            self.ping(&router);
            if let Ok(addr) = self.routing_table.get_or_create_node(None, &router) {
                let target = self.id;
                self.find_node_from(&addr, target);
            }
        }
        let target = self.id;
        self.find_node(target);
        self.get_more_peers(None);
    }

    fn ping(&mut self, host_port: &str) {
        match self.routing_table.get_or_create_node(None, host_port) {
            Ok(addr) => self.ping_node(&addr),
            Err(e) => debug!(?e, host_port, "ping error"),
        }
    }

    fn ping_node(&mut self, addr: &str) {
        let id = self.id;
        let Some(node) = self.routing_table.node_mut(addr) else {
            return;
        };
        let transaction_id = node.new_query(QueryKind::Ping);
        let address = node.address;

        debug!(%address, "sending ping");
        self.socket
            .send_message(address, &Message::query(transaction_id, &id, QuerySpecific::Ping));
        bump(&self.stats.total_sent_ping);
    }

    /// Ask for peers for an infohash, from the closest usable nodes or, when
    /// none qualify, from the bootstrap routers.
    fn get_peers(&mut self, info_hash: InfoHash) {
        let closest = self.routing_table.lookup_filtered(&info_hash);
        if closest.is_empty() {
            for router in self.config.router_list() {
                match self.routing_table.get_or_create_node(None, &router) {
                    Ok(addr) => self.get_peers_from(&addr, info_hash),
                    Err(e) => debug!(?e, %router, "bootstrap router unusable"),
                }
            }
        }
        for node in closest {
            self.get_peers_from(&node.addr, info_hash);
        }
    }

    fn get_peers_from(&mut self, addr: &str, info_hash: InfoHash) {
        let id = self.id;
        let Some(node) = self.routing_table.node_mut(addr) else {
            return;
        };
        let transaction_id = node.new_query(QueryKind::GetPeers);
        if let Some(pending) = node.pending_queries.get_mut(&transaction_id) {
            pending.info_hash = Some(info_hash);
        }
        node.last_search_time = Some(Instant::now());
        let address = node.address;

        debug!(%address, %info_hash, "sending get_peers");
        let message = Message::query(transaction_id, &id, QuerySpecific::GetPeers { info_hash });
        self.socket.send_message(address, &message);
        bump(&self.stats.total_sent_get_peers);
    }

    fn find_node(&mut self, target: Id) {
        let closest = self.routing_table.lookup_filtered(&target);
        if closest.is_empty() {
            for router in self.config.router_list() {
                match self.routing_table.get_or_create_node(None, &router) {
                    Ok(addr) => self.find_node_from(&addr, target),
                    Err(e) => debug!(?e, %router, "bootstrap router unusable"),
                }
            }
        }
        for node in closest {
            self.find_node_from(&node.addr, target);
        }
    }

    fn find_node_from(&mut self, addr: &str, target: Id) {
        let id = self.id;
        let Some(node) = self.routing_table.node_mut(addr) else {
            return;
        };
        let transaction_id = node.new_query(QueryKind::FindNode);
        if let Some(pending) = node.pending_queries.get_mut(&transaction_id) {
            pending.info_hash = Some(target);
        }
        node.last_search_time = Some(Instant::now());
        let address = node.address;

        debug!(%address, %target, "sending find_node");
        let message = Message::query(transaction_id, &id, QuerySpecific::FindNode { target });
        self.socket.send_message(address, &message);
        bump(&self.stats.total_sent_find_node);
    }

    /// Advertise this node as a peer for `info_hash`, authenticated by the
    /// token echoed from a get_peers reply.
    fn announce_peer(&mut self, address: SocketAddrV4, info_hash: InfoHash, port: u16, token: Vec<u8>) {
        let addr = match self.routing_table.get_or_create_node(None, &address.to_string()) {
            Ok(addr) => addr,
            Err(e) => {
                debug!(?e, "announce_peer error");
                return;
            }
        };
        let id = self.id;
        let Some(node) = self.routing_table.node_mut(&addr) else {
            return;
        };
        let transaction_id = node.new_query(QueryKind::AnnouncePeer);
        let address = node.address;

        debug!(%address, %info_hash, port, "sending announce_peer");
        let message = Message::query(
            transaction_id,
            &id,
            QuerySpecific::AnnouncePeer {
                info_hash,
                port,
                token,
            },
        );
        self.socket.send_message(address, &message);
    }

    /// Search again every infohash we download and still want peers for,
    /// either through one new contact or through the closest known nodes.
    fn get_more_peers(&mut self, from: Option<&str>) {
        for info_hash in self.peer_store.local_downloads() {
            if self.need_more_peers(&info_hash) {
                match from {
                    Some(addr) => self.get_peers_from(addr, info_hash),
                    None => self.get_peers(info_hash),
                }
            }
        }
    }

    fn need_more_nodes(&self) -> bool {
        let nodes = self.routing_table.len();
        nodes < MIN_NODES || nodes * 2 < self.config.max_nodes
    }

    fn need_more_peers(&self, info_hash: &InfoHash) -> bool {
        self.peer_store.alive(info_hash) < self.config.num_target_peers
    }

    // === Packet ingress ===

    fn ingress(&mut self, buffer: Vec<u8>, from: SocketAddrV4) {
        bump(&self.stats.total_recv);
        if self.config.rate_limit > 0 {
            if self.token_bucket > 0 {
                self.token_bucket -= 1;
                self.process_packet(&buffer, from);
            } else {
                bump(&self.stats.total_dropped_packets);
            }
        } else {
            self.process_packet(&buffer, from);
        }
        self.arena.push(buffer);
    }

    fn process_packet(&mut self, bytes: &[u8], from: SocketAddrV4) {
        if !self.throttle.allow(*from.ip()) {
            bump(&self.stats.total_packets_blocked);
            debug!(%from, "source exceeded the per-minute limit, dropping packet");
            return;
        }
        if bytes.first() != Some(&b'd') {
            // Protocol extensions out there that we don't understand.
            bump(&self.stats.total_malformed_packets);
            return;
        }
        let message = match Message::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                bump(&self.stats.total_malformed_packets);
                debug!(?e, %from, "dropping undecodable packet");
                return;
            }
        };

        match message.kind {
            MessageKind::Response(arguments) => {
                self.process_response(message.transaction_id, arguments, from)
            }
            MessageKind::Query(arguments) => {
                self.process_query(message.transaction_id, arguments, from)
            }
            MessageKind::Error { code, message } => {
                debug!(code, %message, %from, "error reply")
            }
        }
    }

    fn process_response(
        &mut self,
        transaction_id: Vec<u8>,
        arguments: ResponseArguments,
        from: SocketAddrV4,
    ) {
        let Ok(sender_id) = Id::from_bytes(&arguments.id) else {
            debug!(len = arguments.id.len(), "response with bogus node id");
            return;
        };
        if sender_id == self.id {
            debug!("received reply from self");
            return;
        }

        let addr = from.to_string();
        if self.routing_table.node(&addr).is_none() {
            debug!(%from, "received reply from a host we don't know");
            if self.routing_table.len() < self.config.max_nodes {
                self.ping(&addr);
            }
            return;
        }

        let stored_id = self.routing_table.node(&addr).and_then(|node| node.id);
        match stored_id {
            None => {
                if let Err(e) = self.routing_table.update(&addr, sender_id) {
                    debug!(?e, "failed to record a learned id");
                }
            }
            Some(stored) if stored != sender_id => {
                debug!(%stored, %sender_id, "node changed ids");
            }
            _ => {}
        }

        let Ok(transaction_id) = String::from_utf8(transaction_id) else {
            debug!("reply with a non-textual transaction id");
            return;
        };

        let Some(node) = self.routing_table.node_mut(&addr) else {
            return;
        };
        let Some(record) = node.pending_queries.remove(&transaction_id) else {
            debug!(%transaction_id, "reply with an unknown transaction id");
            return;
        };
        let first_reply = !node.reachable;
        node.reachable = true;
        node.last_response_time = Some(Instant::now());
        node.past_queries.insert(transaction_id, record.clone());

        if first_reply {
            bump(&self.stats.total_nodes_reached);
        }

        let node_ref = NodeRef {
            id: stored_id.unwrap_or(sender_id),
            addr,
        };
        self.routing_table
            .neighborhood_upkeep(&node_ref, &mut self.peer_store);

        // Build up the neighborhood while the table is under-populated.
        if self.need_more_nodes() {
            let target = self.id;
            self.find_node(target);
        }

        match record.kind {
            QueryKind::Ping => bump(&self.stats.total_recv_ping_reply),
            QueryKind::GetPeers => self.process_get_peers_results(&node_ref, &record, &arguments),
            QueryKind::FindNode => self.process_find_node_results(&node_ref, &record, &arguments),
            QueryKind::AnnouncePeer => {}
        }
    }

    fn process_query(
        &mut self,
        transaction_id: Vec<u8>,
        arguments: QueryArguments,
        from: SocketAddrV4,
    ) {
        if arguments.id == self.id.0 {
            debug!("received query from self");
            return;
        }

        let addr = from.to_string();
        let known_sender = self.routing_table.node(&addr).is_some();
        if !known_sender && self.routing_table.len() < self.config.max_nodes {
            // Another candidate for the routing table. See if it's reachable.
            self.ping(&addr);
        }

        match arguments.query {
            QuerySpecific::Ping => {
                bump(&self.stats.total_recv_ping);
                self.reply_ack(from, transaction_id);
            }
            QuerySpecific::GetPeers { info_hash } => {
                bump(&self.stats.total_recv_get_peers);
                self.reply_get_peers(from, transaction_id, info_hash);
            }
            QuerySpecific::FindNode { target } => {
                bump(&self.stats.total_recv_find_node);
                self.reply_find_node(from, transaction_id, target);
            }
            QuerySpecific::AnnouncePeer {
                info_hash,
                port,
                token,
            } => {
                bump(&self.stats.total_recv_announce_peer);
                self.reply_announce_peer(from, transaction_id, known_sender, info_hash, port, &token);
            }
        }
    }

    // === Query handlers ===

    fn reply_ack(&mut self, from: SocketAddrV4, transaction_id: Vec<u8>) {
        let arguments = ResponseArguments::plain(&self.id);
        self.socket
            .send_message(from, &Message::response(transaction_id, arguments));
    }

    fn reply_get_peers(&mut self, from: SocketAddrV4, transaction_id: Vec<u8>, info_hash: InfoHash) {
        debug!(%from, %info_hash, "get_peers");
        let mut arguments = ResponseArguments::plain(&self.id);
        arguments.token = Some(self.tokens.generate(from).into_bytes());

        let contacts = self.peer_store.peer_contacts(&info_hash);
        if contacts.is_empty() {
            arguments.nodes = Some(self.nodes_for_info_hash(&info_hash));
        } else {
            debug!(%info_hash, peers = contacts.len(), "giving peers");
            arguments.values = contacts;
        }
        self.socket
            .send_message(from, &Message::response(transaction_id, arguments));
    }

    fn reply_find_node(&mut self, from: SocketAddrV4, transaction_id: Vec<u8>, target: Id) {
        debug!(%from, %target, "find_node");
        let mut neighbors = self.routing_table.lookup_filtered(&target);
        if neighbors.len() < KNODES {
            neighbors.extend(self.routing_table.lookup(&target));
        }

        let mut nodes = Vec::with_capacity(KNODES * V4_NODE_CONTACT_LEN);
        for node_ref in neighbors.into_iter().take(KNODES) {
            if let Some(node) = self.routing_table.node(&node_ref.addr) {
                nodes.extend_from_slice(&compact_node(&node_ref.id, &node.address));
            }
        }

        let mut arguments = ResponseArguments::plain(&self.id);
        arguments.nodes = Some(nodes);
        self.socket
            .send_message(from, &Message::response(transaction_id, arguments));
    }

    fn reply_announce_peer(
        &mut self,
        from: SocketAddrV4,
        transaction_id: Vec<u8>,
        known_sender: bool,
        info_hash: InfoHash,
        port: u16,
        token: &[u8],
    ) {
        debug!(%from, %info_hash, port, "announce_peer");
        // The sender can be unknown if, for example, the node just restarted
        // and received an announce_peer from a node it doesn't know yet.
        if known_sender && self.tokens.validate(from, token) {
            let contact = compact_peer(&SocketAddrV4::new(*from.ip(), port));
            self.peer_store.add_contact(info_hash, &contact);
            // The announcer is telling us it has this infohash, so make it
            // searchable again immediately.
            if let Some(node) = self.routing_table.node_mut(&from.to_string()) {
                node.last_response_time = Some(Instant::now() - SEARCH_RETRY_PERIOD);
            }
            if self.peer_store.has_local_download(&info_hash).is_some() {
                if let Some(peer) = parse_peer(&contact) {
                    let mut results = PeersFound::new();
                    results.insert(info_hash, vec![peer]);
                    self.send_results(results);
                }
            }
        }
        // Always reply positively, to discourage back-tracking by network
        // scanners probing for valid tokens.
        self.reply_ack(from, transaction_id);
    }

    fn nodes_for_info_hash(&self, info_hash: &InfoHash) -> Vec<u8> {
        let mut nodes = Vec::with_capacity(KNODES * V4_NODE_CONTACT_LEN);
        for node_ref in self.routing_table.lookup(info_hash) {
            if let Some(node) = self.routing_table.node(&node_ref.addr) {
                nodes.extend_from_slice(&compact_node(&node_ref.id, &node.address));
            }
        }
        nodes
    }

    // === Reply handlers ===

    fn process_get_peers_results(
        &mut self,
        node_ref: &NodeRef,
        record: &QueryRecord,
        arguments: &ResponseArguments,
    ) {
        bump(&self.stats.total_recv_get_peers_reply);
        let Some(info_hash) = record.info_hash else {
            return;
        };

        if let Some(port) = self.peer_store.has_local_download(&info_hash) {
            if let Some(address) = self.routing_table.node(&node_ref.addr).map(|n| n.address) {
                let token = arguments.token.clone().unwrap_or_default();
                self.announce_peer(address, info_hash, port, token);
            }
        }

        let mut found: Vec<SocketAddrV4> = Vec::new();
        for contact in &arguments.values {
            // Stored and forwarded even when already known; the client is
            // expected to handle dupes across deliveries.
            self.peer_store.add_contact(info_hash, contact);
            if let Some(peer) = parse_peer(contact) {
                if !found.contains(&peer) {
                    found.push(peer);
                }
            }
        }
        if !found.is_empty() {
            add(&self.stats.total_peers_found, found.len() as u64);
            let mut results = PeersFound::new();
            results.insert(info_hash, found);
            self.send_results(results);
        }

        let nodes = match self.config.udp_proto {
            UdpProto::V4 => arguments.nodes.as_deref(),
            UdpProto::V6 => arguments.nodes6.as_deref(),
        };
        let Some(nodes) = nodes else {
            return;
        };
        let Some(contacts) = parse_nodes(nodes, self.config.udp_proto) else {
            bump(&self.stats.total_malformed_packets);
            return;
        };
        for (id, address) in contacts {
            if id == self.id {
                debug!("got a reference to self from get_peers");
                continue;
            }
            let addr = address.to_string();
            if addr == node_ref.addr {
                // Probably trying to sniff the network or to attract a lot
                // of traffic to itself. Ignore all of its results.
                bump(&self.stats.total_self_promotions);
                continue;
            }
            if self.routing_table.node(&addr).is_some() {
                bump(&self.stats.total_get_peers_dupes);
                continue;
            }
            if self.routing_table.get_or_create_node(Some(id), &addr).is_ok()
                && self.need_more_peers(&info_hash)
            {
                // Requeue the search. The new node is already in the routing
                // table, so when the channel is full it still gets used at
                // the next natural query.
                let _ = self
                    .chans
                    .peers_request_tx
                    .try_send((info_hash, AnnounceOptions::default()));
            }
        }
    }

    fn process_find_node_results(
        &mut self,
        node_ref: &NodeRef,
        record: &QueryRecord,
        arguments: &ResponseArguments,
    ) {
        bump(&self.stats.total_recv_find_node_reply);

        let nodes = match self.config.udp_proto {
            UdpProto::V4 => arguments.nodes.as_deref(),
            UdpProto::V6 => arguments.nodes6.as_deref(),
        };
        let Some(nodes) = nodes else {
            return;
        };
        let Some(contacts) = parse_nodes(nodes, self.config.udp_proto) else {
            bump(&self.stats.total_malformed_packets);
            return;
        };
        for (id, address) in contacts {
            if id == self.id {
                debug!("got a reference to self from find_node");
                continue;
            }
            let addr = address.to_string();
            if addr == node_ref.addr {
                // Self promotions happen even for well known routers.
                bump(&self.stats.total_self_promotions);
                continue;
            }
            if self.routing_table.node(&addr).is_some() {
                bump(&self.stats.total_find_node_dupes);
                continue;
            }
            match self.routing_table.get_or_create_node(Some(id), &addr) {
                Err(e) => debug!(?e, %address, "find_node reference unusable"),
                Ok(new_addr) => {
                    // Only continue the search if we really have to.
                    if self.need_more_nodes() {
                        let target = record.info_hash.unwrap_or(self.id);
                        let _ = self.chans.nodes_request_tx.try_send(target);
                    }
                    self.get_more_peers(Some(&new_addr));
                }
            }
        }
    }

    /// Deliver discovered peers, blocking briefly but never past shutdown,
    /// so a slow consumer cannot deadlock the engine.
    fn send_results(&self, results: PeersFound) {
        let mut pending = results;
        loop {
            match self
                .chans
                .results
                .send_timeout(pending, Duration::from_millis(50))
            {
                Ok(()) => return,
                Err(flume::SendTimeoutError::Timeout(returned)) => {
                    if self.shutdown.load(Relaxed) {
                        return;
                    }
                    pending = returned;
                }
                Err(flume::SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }
}

/// Distribute the cleanup pings throughout the cleanup interval, to avoid
/// network traffic bursts. The pings are not sent from here; the engine is
/// signalled over its ping channel.
fn ping_slowly(
    ping_tx: flume::Sender<String>,
    need_ping: Vec<String>,
    cleanup_period: Duration,
    shutdown: Arc<AtomicBool>,
) {
    if need_ping.is_empty() {
        return;
    }
    let duration = cleanup_period.saturating_sub(Duration::from_secs(60));
    let per_ping_wait = duration / need_ping.len() as u32;

    for addr in need_ping {
        if shutdown.load(Relaxed) {
            return;
        }
        if ping_tx.send(addr).is_err() {
            return;
        }
        let mut waited = Duration::ZERO;
        while waited < per_ping_wait {
            if shutdown.load(Relaxed) {
                return;
            }
            let step = (per_ping_wait - waited).min(Duration::from_millis(500));
            thread::sleep(step);
            waited += step;
        }
    }
}

#[cfg(test)]
mod test {
    use super::statistics::value;
    use super::*;
    use std::net::{SocketAddr, UdpSocket};

    struct TestNode {
        rpc: Rpc,
        results_rx: flume::Receiver<PeersFound>,
        _stop_tx: flume::Sender<()>,
        _acquaintance_tx: flume::Sender<String>,
        _remove_tx: flume::Sender<InfoHash>,
        _port_tx: flume::Sender<flume::Sender<u16>>,
    }

    fn test_config() -> Config {
        Config {
            address: "127.0.0.1".to_string(),
            routers: String::new(),
            save_routing_table: false,
            ..Config::default()
        }
    }

    fn test_node(config: Config) -> TestNode {
        let (stop_tx, stop_rx) = flume::bounded(1);
        let (acquaintance_tx, acquaintance_rx) = flume::bounded(100);
        let (peers_tx, peers_rx) = flume::bounded(100);
        let (nodes_tx, nodes_rx) = flume::bounded(100);
        let (remove_tx, remove_rx) = flume::bounded(16);
        let (port_tx, port_rx) = flume::bounded(1);
        let (results_tx, results_rx) = flume::bounded(100);

        let chans = Channels {
            stop: stop_rx,
            acquaintance: acquaintance_rx,
            peers_request: peers_rx,
            peers_request_tx: peers_tx,
            nodes_request: nodes_rx,
            nodes_request_tx: nodes_tx,
            remove_info_hash: remove_rx,
            port_request: port_rx,
            results: results_tx,
        };
        let rpc = Rpc::new(
            config,
            Id::random(),
            DhtStore::default(),
            chans,
            Arc::new(AtomicBool::new(false)),
            Arc::new(Statistics::default()),
        )
        .unwrap();

        TestNode {
            rpc,
            results_rx,
            _stop_tx: stop_tx,
            _acquaintance_tx: acquaintance_tx,
            _remove_tx: remove_tx,
            _port_tx: port_tx,
        }
    }

    fn bound_socket() -> (UdpSocket, SocketAddrV4) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let SocketAddr::V4(addr) = socket.local_addr().unwrap() else {
            panic!("expected a v4 address");
        };
        (socket, addr)
    }

    fn read_message(socket: &UdpSocket) -> Message {
        let mut buffer = [0u8; MAX_UDP_PACKET_SIZE];
        let (read, _) = socket.recv_from(&mut buffer).expect("expected a datagram");
        Message::from_bytes(&buffer[..read]).unwrap()
    }

    // Replies can be preceded by the ping probing an unknown sender.
    fn read_response(socket: &UdpSocket) -> ResponseArguments {
        loop {
            if let MessageKind::Response(arguments) = read_message(socket).kind {
                return arguments;
            }
        }
    }

    fn test_info_hash() -> InfoHash {
        "d1c5676ae7ac98e8b19f63565905105e3c4c37a2".parse().unwrap()
    }

    #[test]
    fn bootstrap_learns_router_and_referenced_nodes() {
        let (router, router_addr) = bound_socket();

        let mut config = test_config();
        config.routers = router_addr.to_string();
        let mut node = test_node(config);

        node.rpc.bootstrap();

        // The router sees a ping and two find_node queries for the local id.
        let mut find_node_tid = None;
        for _ in 0..3 {
            let message = read_message(&router);
            if let MessageKind::Query(query) = message.kind {
                match query.query {
                    QuerySpecific::FindNode { target } => {
                        assert_eq!(target, node.rpc.id);
                        find_node_tid = Some(message.transaction_id);
                    }
                    QuerySpecific::Ping => {}
                    other => panic!("unexpected bootstrap query {other:?}"),
                }
            }
        }
        let transaction_id = find_node_tid.expect("router saw a find_node");

        // The router replies with one referenced contact.
        let router_id = Id::random();
        let contact_id = Id::random();
        let contact_addr = SocketAddrV4::new([127, 0, 0, 1].into(), 3456);
        let mut arguments = ResponseArguments::plain(&router_id);
        arguments.nodes = Some(compact_node(&contact_id, &contact_addr).to_vec());
        let reply = Message::response(transaction_id, arguments);
        node.rpc
            .process_packet(&reply.to_bytes().unwrap(), router_addr);

        // Both the router and the referenced contact are now tracked.
        assert!(node.rpc.routing_table.node(&router_addr.to_string()).is_some());
        assert!(node
            .rpc
            .routing_table
            .node(&contact_addr.to_string())
            .is_some());

        let local_id = *node.rpc.routing_table.id();
        let neighborhood = node.rpc.routing_table.lookup(&local_id);
        assert_eq!(neighborhood.len(), 2);
        let mut ids: Vec<Id> = neighborhood.iter().map(|n| n.id).collect();
        ids.sort();
        let mut expected = vec![router_id, contact_id];
        expected.sort();
        assert_eq!(ids, expected);

        // Sorted by XOR distance to the local id.
        let distances: Vec<_> = neighborhood
            .iter()
            .map(|n| local_id.xor_distance(&n.id))
            .collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);
    }

    #[test]
    fn get_peers_replies_with_nodes_for_unknown_infohash() {
        let mut node = test_node(test_config());
        // Pre-populate the routing table so the reply can reference nodes.
        for i in 1..4u8 {
            node.rpc
                .routing_table
                .get_or_create_node(Some(Id::random()), &format!("127.0.0.{i}:6881"))
                .unwrap();
        }

        let (querier, querier_addr) = bound_socket();
        let query = Message::query(
            "aa".to_string(),
            &Id::random(),
            QuerySpecific::GetPeers {
                info_hash: test_info_hash(),
            },
        );
        node.rpc
            .process_packet(&query.to_bytes().unwrap(), querier_addr);

        let arguments = read_response(&querier);
        assert!(arguments.values.is_empty());
        let nodes = arguments.nodes.expect("nodes are present");
        assert_eq!(nodes.len(), 3 * V4_NODE_CONTACT_LEN);
        assert!(arguments.token.is_some());
    }

    #[test]
    fn get_peers_then_announce_then_serve_values() {
        let mut node = test_node(test_config());
        let info_hash = test_info_hash();

        // Peer P runs get_peers and announces with the echoed token.
        let (peer, peer_addr) = bound_socket();
        let peer_id = Id::random();
        let query = Message::query(
            "aa".to_string(),
            &peer_id,
            QuerySpecific::GetPeers { info_hash },
        );
        node.rpc.process_packet(&query.to_bytes().unwrap(), peer_addr);
        let token = read_response(&peer).token.expect("reply carries a token");

        let announce = Message::query(
            "ab".to_string(),
            &peer_id,
            QuerySpecific::AnnouncePeer {
                info_hash,
                port: 6881,
                token,
            },
        );
        node.rpc
            .process_packet(&announce.to_bytes().unwrap(), peer_addr);
        let ack = read_response(&peer);
        assert_eq!(ack.id, node.rpc.id.to_vec());

        let expected_contact = compact_peer(&SocketAddrV4::new(*peer_addr.ip(), 6881));
        assert_eq!(node.rpc.peer_store.count(&info_hash), 1);

        // A third party now receives values and no nodes.
        let (third, third_addr) = bound_socket();
        let query = Message::query(
            "ac".to_string(),
            &Id::random(),
            QuerySpecific::GetPeers { info_hash },
        );
        node.rpc.process_packet(&query.to_bytes().unwrap(), third_addr);

        let arguments = read_response(&third);
        assert_eq!(arguments.values, vec![expected_contact.to_vec()]);
        assert!(arguments.nodes.is_none());
        assert!(arguments.token.is_some());
    }

    #[test]
    fn announce_with_stale_token_is_not_stored() {
        let mut node = test_node(test_config());
        let info_hash = test_info_hash();

        let (peer, peer_addr) = bound_socket();
        let peer_id = Id::random();
        let query = Message::query(
            "aa".to_string(),
            &peer_id,
            QuerySpecific::GetPeers { info_hash },
        );
        node.rpc.process_packet(&query.to_bytes().unwrap(), peer_addr);
        let token = read_response(&peer).token.expect("reply carries a token");

        // Two rotations invalidate the token.
        node.rpc.tokens.rotate();
        node.rpc.tokens.rotate();

        let announce = Message::query(
            "ab".to_string(),
            &peer_id,
            QuerySpecific::AnnouncePeer {
                info_hash,
                port: 6881,
                token,
            },
        );
        node.rpc
            .process_packet(&announce.to_bytes().unwrap(), peer_addr);

        // The reply still looks positive, but nothing was stored.
        let ack = read_response(&peer);
        assert_eq!(ack.id, node.rpc.id.to_vec());
        assert_eq!(node.rpc.peer_store.count(&info_hash), 0);
    }

    #[test]
    fn reply_correlation_moves_pending_to_past() {
        let mut node = test_node(test_config());
        let from: SocketAddrV4 = "127.0.0.1:4567".parse().unwrap();
        let addr = node
            .rpc
            .routing_table
            .get_or_create_node(None, &from.to_string())
            .unwrap();
        let transaction_id = node
            .rpc
            .routing_table
            .node_mut(&addr)
            .unwrap()
            .new_query(QueryKind::Ping);
        let remote_id = Id::random();

        // A reply with an unknown transaction id is ignored.
        let bogus = Message::response(b"zz".to_vec(), ResponseArguments::plain(&remote_id));
        node.rpc.process_packet(&bogus.to_bytes().unwrap(), from);
        {
            let remote = node.rpc.routing_table.node(&addr).unwrap();
            assert_eq!(remote.pending_queries.len(), 1);
            assert!(remote.past_queries.is_empty());
            assert!(!remote.reachable);
        }

        // The matching id moves the entry to past_queries exactly once.
        let reply = Message::response(
            transaction_id.clone().into_bytes(),
            ResponseArguments::plain(&remote_id),
        );
        node.rpc.process_packet(&reply.to_bytes().unwrap(), from);
        {
            let remote = node.rpc.routing_table.node(&addr).unwrap();
            // The engine may already have new queries in flight to this
            // node, but the answered one is gone from pending.
            assert!(!remote.pending_queries.contains_key(&transaction_id));
            assert!(remote.past_queries.contains_key(&transaction_id));
            assert!(remote.reachable);
            assert_eq!(remote.id, Some(remote_id));
        }
        assert_eq!(value(&node.rpc.stats.total_nodes_reached), 1);

        // Replaying the reply is harmless.
        let replay = Message::response(
            transaction_id.into_bytes(),
            ResponseArguments::plain(&remote_id),
        );
        node.rpc.process_packet(&replay.to_bytes().unwrap(), from);
        assert_eq!(
            node.rpc
                .routing_table
                .node(&addr)
                .unwrap()
                .past_queries
                .len(),
            1
        );
    }

    #[test]
    fn self_promotion_references_are_discarded() {
        let mut node = test_node(test_config());
        let info_hash = test_info_hash();
        let replier: SocketAddrV4 = "127.0.0.1:5678".parse().unwrap();
        let replier_id = Id::random();
        let addr = node
            .rpc
            .routing_table
            .get_or_create_node(Some(replier_id), &replier.to_string())
            .unwrap();
        let transaction_id = {
            let remote = node.rpc.routing_table.node_mut(&addr).unwrap();
            let transaction_id = remote.new_query(QueryKind::GetPeers);
            remote
                .pending_queries
                .get_mut(&transaction_id)
                .unwrap()
                .info_hash = Some(info_hash);
            transaction_id
        };

        let good_id = Id::random();
        let good_addr = SocketAddrV4::new([127, 0, 0, 1].into(), 7000);
        let mut nodes = Vec::new();
        // A reference aliasing the replier's own address.
        nodes.extend_from_slice(&compact_node(&Id::random(), &replier));
        // A reference to ourselves.
        nodes.extend_from_slice(&compact_node(&node.rpc.id, &good_addr));
        nodes.extend_from_slice(&compact_node(&good_id, &good_addr));

        let mut arguments = ResponseArguments::plain(&replier_id);
        arguments.nodes = Some(nodes);
        let reply = Message::response(transaction_id.into_bytes(), arguments);
        node.rpc.process_packet(&reply.to_bytes().unwrap(), replier);

        assert_eq!(value(&node.rpc.stats.total_self_promotions), 1);
        let stored = node
            .rpc
            .routing_table
            .node(&good_addr.to_string())
            .expect("the good reference was stored");
        assert_eq!(stored.id, Some(good_id));
    }

    #[test]
    fn rate_limiter_sheds_excess_packets() {
        let mut config = test_config();
        config.rate_limit = 10;
        let mut node = test_node(config);

        let from: SocketAddrV4 = "127.0.0.1:9999".parse().unwrap();
        let query = Message::query("aa".to_string(), &Id::random(), QuerySpecific::Ping)
            .to_bytes()
            .unwrap();

        for _ in 0..11 {
            node.rpc.ingress(query.clone(), from);
        }
        assert_eq!(value(&node.rpc.stats.total_recv), 11);
        assert_eq!(value(&node.rpc.stats.total_dropped_packets), 1);
        assert_eq!(node.rpc.token_bucket, 0);

        node.rpc.refill_token_bucket();
        assert_eq!(node.rpc.token_bucket, 1);
    }

    #[test]
    fn cleanup_eviction_marks_peer_contact_dead() {
        let mut node = test_node(test_config());
        let info_hash = test_info_hash();
        node.rpc.peer_store.add_local_download(info_hash, 6881);

        let addr = node
            .rpc
            .routing_table
            .get_or_create_node(Some(Id::random()), "127.0.0.9:7777")
            .unwrap();
        let contact = {
            let remote = node.rpc.routing_table.node_mut(&addr).unwrap();
            for _ in 0..6 {
                remote.new_query(QueryKind::Ping);
            }
            remote.compact_address()
        };
        node.rpc.peer_store.add_contact(info_hash, &contact);
        assert_eq!(node.rpc.peer_store.alive(&info_hash), 1);

        let period = node.rpc.config.cleanup_period;
        node.rpc
            .routing_table
            .cleanup(period, &mut node.rpc.peer_store);

        assert!(node.rpc.routing_table.node(&addr).is_none());
        assert_eq!(node.rpc.peer_store.count(&info_hash), 1);
        assert_eq!(node.rpc.peer_store.alive(&info_hash), 0);
    }

    #[test]
    fn get_peers_results_forward_values_once() {
        let mut node = test_node(test_config());
        let info_hash = test_info_hash();

        let replier: SocketAddrV4 = "127.0.0.1:5679".parse().unwrap();
        let replier_id = Id::random();
        let addr = node
            .rpc
            .routing_table
            .get_or_create_node(Some(replier_id), &replier.to_string())
            .unwrap();
        let transaction_id = {
            let remote = node.rpc.routing_table.node_mut(&addr).unwrap();
            let transaction_id = remote.new_query(QueryKind::GetPeers);
            remote
                .pending_queries
                .get_mut(&transaction_id)
                .unwrap()
                .info_hash = Some(info_hash);
            transaction_id
        };

        let peer = SocketAddrV4::new([10, 1, 2, 3].into(), 51413);
        let mut arguments = ResponseArguments::plain(&replier_id);
        arguments.values = vec![
            compact_peer(&peer).to_vec(),
            compact_peer(&peer).to_vec(), // duplicate within one reply
        ];
        let reply = Message::response(transaction_id.into_bytes(), arguments);
        node.rpc.process_packet(&reply.to_bytes().unwrap(), replier);

        let results = node
            .results_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("peers were delivered");
        assert_eq!(results.get(&info_hash), Some(&vec![peer]));
        assert_eq!(node.rpc.peer_store.count(&info_hash), 1);
    }
}
