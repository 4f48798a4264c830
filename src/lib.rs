//! # Sloppy
//!
//! A node in the trackerless BitTorrent Mainline DHT
//! ([BEP-5](http://www.bittorrent.org/beps/bep_0005.html)): a Kademlia
//! overlay mapping infohashes to the peers sharing them.
//!
//! The node keeps a routing table of reachable DHT nodes, locates peers for
//! infohashes on behalf of a local client, and serves the same role for
//! remote nodes that query it.
//!
//! ```no_run
//! use sloppy::{Config, Dht, InfoHash};
//!
//! # fn main() -> sloppy::Result<()> {
//! let mut dht = Dht::new(Config::default())?;
//! dht.start()?;
//!
//! let info_hash: InfoHash = "d1c5676ae7ac98e8b19f63565905105e3c4c37a2".parse()?;
//! dht.peers_request(info_hash, true);
//!
//! for found in dht.peers_found().iter() {
//!     for (info_hash, peers) in found {
//!         println!("{info_hash}: {peers:?}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod common;
pub mod config;
pub mod dht;
mod error;
mod rpc;
mod store;

pub use common::{Id, InfoHash, ID_SIZE};
pub use config::{Config, UdpProto};
pub use dht::Dht;
pub use error::Error;
pub use rpc::statistics;
pub use rpc::statistics::Statistics;
pub use rpc::PeersFound;

/// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = core::result::Result<T, E>;
