//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Sloppy crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Failed to encode routing table snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// Indicates that an id was not exactly 20 bytes.
    #[error("Invalid id size, expected 20 bytes, got: {0}")]
    InvalidIdSize(usize),

    #[error("Failed to resolve address: {0}")]
    AddressResolution(String),

    /// A node was rejected by the routing table.
    #[error("Invalid node: {0}")]
    InvalidNode(&'static str),

    /// A routing table operation referenced an address that is not tracked.
    #[error("Node missing from the routing table: {0}")]
    UnknownNode(String),

    /// [crate::Dht::start] was called twice.
    #[error("Node already started")]
    AlreadyStarted,
}
