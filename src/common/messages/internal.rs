use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(flatten)]
    pub variant: WireVariant,
}

impl WireMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum WireVariant {
    #[serde(rename = "q")]
    Query(WireQuery),

    #[serde(rename = "r")]
    Response {
        #[serde(rename = "r")]
        arguments: WireResponseArguments,
    },

    #[serde(rename = "e")]
    Error {
        #[serde(rename = "e")]
        error: (i64, String),
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "q")]
pub enum WireQuery {
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "a")]
        arguments: WirePingArguments,
    },

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "a")]
        arguments: WireFindNodeArguments,
    },

    #[serde(rename = "get_peers")]
    GetPeers {
        #[serde(rename = "a")]
        arguments: WireGetPeersArguments,
    },

    #[serde(rename = "announce_peer")]
    AnnouncePeer {
        #[serde(rename = "a")]
        arguments: WireAnnouncePeerArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WirePingArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireFindNodeArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(with = "serde_bytes")]
    pub target: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireGetPeersArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(with = "serde_bytes")]
    pub info_hash: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireAnnouncePeerArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(with = "serde_bytes")]
    pub info_hash: Vec<u8>,

    pub port: u16,

    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireResponseArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    // Some clients send a single concatenated string here instead of a list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<WireValues>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub nodes6: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub token: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum WireValues {
    List(Vec<ByteBuf>),
    Single(ByteBuf),
}
