//! The client-facing DHT node handle.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::info;

use crate::common::{Id, InfoHash};
use crate::config::Config;
use crate::rpc::{statistics::Statistics, AnnounceOptions, Channels, PeersFound, Rpc};
use crate::store;
use crate::{Error, Result};

/// A DHT node. It provides DHT features to a torrent client, such as finding
/// new peers for torrent downloads without requiring a tracker.
///
/// Construct with [Dht::new], then call [Dht::start] to bind the socket and
/// launch the engine. All request methods are non-blocking; discovered peers
/// arrive on [Dht::peers_found]. [Dht::stop] blocks until every background
/// task has joined.
#[derive(Debug)]
pub struct Dht {
    config: Config,
    id: Id,

    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Statistics>,

    stop_tx: flume::Sender<()>,
    acquaintance_tx: flume::Sender<String>,
    peers_request_tx: flume::Sender<(InfoHash, AnnounceOptions)>,
    remove_info_hash_tx: flume::Sender<InfoHash>,
    port_request_tx: flume::Sender<flume::Sender<u16>>,
    results_rx: flume::Receiver<PeersFound>,

    // The engine's half, consumed by start().
    engine: Option<(Channels, store::DhtStore)>,
}

impl Dht {
    /// Create a node. The persisted node id is loaded, or generated and
    /// saved when missing or invalid. No socket is bound yet.
    pub fn new(config: Config) -> Result<Dht> {
        let mut persisted = store::open(config.port, config.save_routing_table);
        let id = match Id::from_bytes(&persisted.id) {
            Ok(id) => id,
            Err(_) => {
                let id = Id::random();
                info!(%id, "using a new random node id");
                persisted.id = id.to_vec();
                let _ = store::save(&persisted);
                id
            }
        };

        let (stop_tx, stop_rx) = flume::bounded(1);
        // Buffered to avoid blocking on sends.
        let (acquaintance_tx, acquaintance_rx) = flume::bounded(100);
        let (peers_request_tx, peers_request_rx) = flume::bounded(100);
        let (nodes_request_tx, nodes_request_rx) = flume::bounded(100);
        let (remove_info_hash_tx, remove_info_hash_rx) = flume::bounded(16);
        let (port_request_tx, port_request_rx) = flume::bounded(1);
        let (results_tx, results_rx) = flume::bounded(1);

        let channels = Channels {
            stop: stop_rx,
            acquaintance: acquaintance_rx,
            peers_request: peers_request_rx,
            peers_request_tx: peers_request_tx.clone(),
            nodes_request: nodes_request_rx,
            nodes_request_tx,
            remove_info_hash: remove_info_hash_rx,
            port_request: port_request_rx,
            results: results_tx,
        };

        Ok(Dht {
            config,
            id,
            handle: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Statistics::default()),
            stop_tx,
            acquaintance_tx,
            peers_request_tx,
            remove_info_hash_tx,
            port_request_tx,
            results_rx,
            engine: Some((channels, persisted)),
        })
    }

    // === Getters ===

    /// This node's stable id.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Delivers maps of infohash to newly discovered peer addresses, as
    /// replies are processed.
    pub fn peers_found(&self) -> flume::Receiver<PeersFound> {
        self.results_rx.clone()
    }

    /// Counters describing the node's traffic. Readable at any time.
    pub fn statistics(&self) -> Arc<Statistics> {
        self.stats.clone()
    }

    // === Public Methods ===

    /// Bind the UDP socket and launch the engine. Returns immediately; bind
    /// and resolution failures surface here.
    pub fn start(&mut self) -> Result<()> {
        let (channels, persisted) = self.engine.take().ok_or(Error::AlreadyStarted)?;

        let rpc = Rpc::new(
            self.config.clone(),
            self.id,
            persisted,
            channels,
            self.shutdown.clone(),
            self.stats.clone(),
        )?;

        // Replay the saved remotes through the public add_node channel; the
        // loader must not touch engine state directly.
        let saved = rpc.saved_remotes();
        if !saved.is_empty() {
            let acquaintance_tx = self.acquaintance_tx.clone();
            thread::spawn(move || {
                for addr in saved {
                    if acquaintance_tx.send(addr).is_err() {
                        break;
                    }
                }
            });
        }

        self.handle = Some(
            thread::Builder::new()
                .name("dht-engine".to_string())
                .spawn(move || rpc.run())?,
        );
        Ok(())
    }

    /// Stop the node, blocking until all background tasks joined.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Relaxed);
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Inform the DHT of a new node it should consider for its routing
    /// table. `addr` is a "host:port" UDP address.
    pub fn add_node(&self, addr: &str) {
        let _ = self.acquaintance_tx.try_send(addr.to_string());
    }

    /// Ask the DHT to search for more peers for `info_hash`. `announce`
    /// should be true if this node is actively downloading the infohash,
    /// which is normally the case unless it is just a router.
    pub fn peers_request(&self, info_hash: InfoHash, announce: bool) {
        self.peers_request_port(info_hash, announce, self.config.port);
    }

    /// Same as [Dht::peers_request], with an explicit port to use in
    /// announce_peer requests.
    pub fn peers_request_port(&self, info_hash: InfoHash, announce: bool, port: u16) {
        let _ = self
            .peers_request_tx
            .try_send((info_hash, AnnounceOptions { announce, port }));
        info!(%info_hash, "client asking for more peers");
    }

    /// Remove an infohash from the local interest map. Call when the client
    /// is no longer downloading it.
    pub fn remove_info_hash(&self, info_hash: InfoHash) {
        let _ = self.remove_info_hash_tx.try_send(info_hash);
    }

    /// The actual bound UDP port. Useful with automatic port assignment,
    /// i.e. a configured port of 0. None when the engine is not running.
    pub fn port(&self) -> Option<u16> {
        if self.handle.is_none() {
            return None;
        }
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.port_request_tx.send(reply_tx).ok()?;
        reply_rx.recv().ok()
    }
}
