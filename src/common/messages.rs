//! Typed KRPC messages and their bencode wire form.

mod internal;

use std::net::SocketAddrV4;

use tracing::debug;

use crate::common::{Id, InfoHash, ID_SIZE};
use crate::config::UdpProto;
use crate::Result;

use internal::{
    WireAnnouncePeerArguments, WireFindNodeArguments, WireGetPeersArguments, WireMessage,
    WirePingArguments, WireQuery, WireResponseArguments, WireValues, WireVariant,
};

/// Wire length of an IPv4 node contact: 20 byte id + 4 byte IP + 2 byte port.
pub const V4_NODE_CONTACT_LEN: usize = 26;

/// Wire length of an IPv6 node contact.
pub const V6_NODE_CONTACT_LEN: usize = 38;

/// Wire length of an IPv4 peer contact: 4 byte IP + 2 byte port.
pub const PEER_CONTACT_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Short opaque string correlating replies to queries.
    pub transaction_id: Vec<u8>,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Query(QueryArguments),
    Response(ResponseArguments),
    Error { code: i64, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryArguments {
    /// The querying node's claimed id, as sent. Length is validated by the
    /// engine, not the codec.
    pub id: Vec<u8>,
    pub query: QuerySpecific,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuerySpecific {
    Ping,
    FindNode {
        target: Id,
    },
    GetPeers {
        info_hash: InfoHash,
    },
    AnnouncePeer {
        info_hash: InfoHash,
        port: u16,
        token: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponseArguments {
    /// The responding node's claimed id, as sent.
    pub id: Vec<u8>,
    /// Peer contact strings, 6 bytes each.
    pub values: Vec<Vec<u8>>,
    /// Concatenated IPv4 node contacts, 26 bytes each.
    pub nodes: Option<Vec<u8>>,
    /// Concatenated IPv6 node contacts, 38 bytes each.
    pub nodes6: Option<Vec<u8>>,
    pub token: Option<Vec<u8>>,
}

impl ResponseArguments {
    /// The minimal positive reply: just our id.
    pub fn plain(id: &Id) -> ResponseArguments {
        ResponseArguments {
            id: id.to_vec(),
            ..ResponseArguments::default()
        }
    }
}

impl Message {
    pub fn query(transaction_id: String, id: &Id, query: QuerySpecific) -> Message {
        Message {
            transaction_id: transaction_id.into_bytes(),
            kind: MessageKind::Query(QueryArguments {
                id: id.to_vec(),
                query,
            }),
        }
    }

    pub fn response(transaction_id: Vec<u8>, arguments: ResponseArguments) -> Message {
        Message {
            transaction_id,
            kind: MessageKind::Response(arguments),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        Message::from_wire(WireMessage::from_bytes(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_wire().to_bytes()?)
    }

    // === Private Methods ===

    fn from_wire(wire: WireMessage) -> Result<Message> {
        let kind = match wire.variant {
            WireVariant::Query(query) => MessageKind::Query(match query {
                WireQuery::Ping { arguments } => QueryArguments {
                    id: arguments.id,
                    query: QuerySpecific::Ping,
                },
                WireQuery::FindNode { arguments } => QueryArguments {
                    id: arguments.id,
                    query: QuerySpecific::FindNode {
                        target: Id::from_bytes(&arguments.target)?,
                    },
                },
                WireQuery::GetPeers { arguments } => QueryArguments {
                    id: arguments.id,
                    query: QuerySpecific::GetPeers {
                        info_hash: Id::from_bytes(&arguments.info_hash)?,
                    },
                },
                WireQuery::AnnouncePeer { arguments } => QueryArguments {
                    id: arguments.id,
                    query: QuerySpecific::AnnouncePeer {
                        info_hash: Id::from_bytes(&arguments.info_hash)?,
                        port: arguments.port,
                        token: arguments.token,
                    },
                },
            }),
            WireVariant::Response { arguments } => MessageKind::Response(ResponseArguments {
                id: arguments.id,
                values: arguments.values.map_or_else(Vec::new, flatten_values),
                nodes: arguments.nodes,
                nodes6: arguments.nodes6,
                token: arguments.token,
            }),
            WireVariant::Error { error } => MessageKind::Error {
                code: error.0,
                message: error.1,
            },
        };
        Ok(Message {
            transaction_id: wire.transaction_id,
            kind,
        })
    }

    fn to_wire(&self) -> WireMessage {
        let variant = match &self.kind {
            MessageKind::Query(arguments) => WireVariant::Query(match &arguments.query {
                QuerySpecific::Ping => WireQuery::Ping {
                    arguments: WirePingArguments {
                        id: arguments.id.clone(),
                    },
                },
                QuerySpecific::FindNode { target } => WireQuery::FindNode {
                    arguments: WireFindNodeArguments {
                        id: arguments.id.clone(),
                        target: target.to_vec(),
                    },
                },
                QuerySpecific::GetPeers { info_hash } => WireQuery::GetPeers {
                    arguments: WireGetPeersArguments {
                        id: arguments.id.clone(),
                        info_hash: info_hash.to_vec(),
                    },
                },
                QuerySpecific::AnnouncePeer {
                    info_hash,
                    port,
                    token,
                } => WireQuery::AnnouncePeer {
                    arguments: WireAnnouncePeerArguments {
                        id: arguments.id.clone(),
                        info_hash: info_hash.to_vec(),
                        port: *port,
                        token: token.clone(),
                    },
                },
            }),
            MessageKind::Response(arguments) => WireVariant::Response {
                arguments: WireResponseArguments {
                    id: arguments.id.clone(),
                    values: if arguments.values.is_empty() {
                        None
                    } else {
                        Some(WireValues::List(
                            arguments.values.iter().cloned().map(Into::into).collect(),
                        ))
                    },
                    nodes: arguments.nodes.clone(),
                    nodes6: arguments.nodes6.clone(),
                    token: arguments.token.clone(),
                },
            },
            MessageKind::Error { code, message } => WireVariant::Error {
                error: (*code, message.clone()),
            },
        };
        WireMessage {
            transaction_id: self.transaction_id.clone(),
            variant,
        }
    }
}

// Normalizes the two accepted wire forms of `values`: a list of peer contact
// strings, or one concatenated string.
fn flatten_values(values: WireValues) -> Vec<Vec<u8>> {
    match values {
        WireValues::List(list) => list.into_iter().map(|buf| buf.into_vec()).collect(),
        WireValues::Single(concatenated) => concatenated
            .chunks_exact(PEER_CONTACT_LEN)
            .map(|chunk| chunk.to_vec())
            .collect(),
    }
}

/// Parse a `nodes` reply string: fixed length contacts concatenated
/// arbitrarily. Returns None when the length is not a contact multiple.
pub fn parse_nodes(nodes: &[u8], proto: UdpProto) -> Option<Vec<(Id, SocketAddrV4)>> {
    if proto == UdpProto::V6 {
        if nodes.len() % V6_NODE_CONTACT_LEN != 0 {
            return None;
        }
        // Wire layout only; contacts from nodes6 are not usable over the
        // IPv4 socket.
        debug!(len = nodes.len(), "skipping nodes6 contacts");
        return Some(Vec::new());
    }
    if nodes.len() % V4_NODE_CONTACT_LEN != 0 {
        debug!(
            len = nodes.len(),
            "invalid nodes length, should be a multiple of {}", V4_NODE_CONTACT_LEN
        );
        return None;
    }

    let mut parsed = Vec::with_capacity(nodes.len() / V4_NODE_CONTACT_LEN);
    for contact in nodes.chunks_exact(V4_NODE_CONTACT_LEN) {
        let id = Id::from_bytes(&contact[..ID_SIZE]).expect("contact id is 20 bytes");
        let address = parse_peer(&contact[ID_SIZE..]).expect("contact address is 6 bytes");
        parsed.push((id, address));
    }
    Some(parsed)
}

/// The 26 byte wire form of an IPv4 node contact.
pub fn compact_node(id: &Id, address: &SocketAddrV4) -> [u8; V4_NODE_CONTACT_LEN] {
    let mut contact = [0u8; V4_NODE_CONTACT_LEN];
    contact[..ID_SIZE].copy_from_slice(id.as_bytes());
    contact[ID_SIZE..ID_SIZE + 4].copy_from_slice(&address.ip().octets());
    contact[ID_SIZE + 4..].copy_from_slice(&address.port().to_be_bytes());
    contact
}

/// The 6 byte wire form of an IPv4 peer contact.
pub fn compact_peer(address: &SocketAddrV4) -> [u8; PEER_CONTACT_LEN] {
    let mut contact = [0u8; PEER_CONTACT_LEN];
    contact[..4].copy_from_slice(&address.ip().octets());
    contact[4..].copy_from_slice(&address.port().to_be_bytes());
    contact
}

/// Decode a 6 byte peer contact.
pub fn parse_peer(contact: &[u8]) -> Option<SocketAddrV4> {
    if contact.len() != PEER_CONTACT_LEN {
        return None;
    }
    let ip: [u8; 4] = contact[..4].try_into().ok()?;
    let port = u16::from_be_bytes([contact[4], contact[5]]);
    Some(SocketAddrV4::new(ip.into(), port))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_ping_query() {
        let bytes = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe";
        let message = Message::from_bytes(bytes).unwrap();

        assert_eq!(message.transaction_id, b"aa");
        assert_eq!(
            message.kind,
            MessageKind::Query(QueryArguments {
                id: b"abcdefghij0123456789".to_vec(),
                query: QuerySpecific::Ping,
            })
        );
    }

    #[test]
    fn query_round_trips() {
        let id = Id::random();
        let ih: InfoHash = "d1c5676ae7ac98e8b19f63565905105e3c4c37a2".parse().unwrap();

        for query in [
            QuerySpecific::Ping,
            QuerySpecific::FindNode { target: ih },
            QuerySpecific::GetPeers { info_hash: ih },
            QuerySpecific::AnnouncePeer {
                info_hash: ih,
                port: 6881,
                token: b"aoeusnth".to_vec(),
            },
        ] {
            let message = Message::query("42".to_string(), &id, query);
            let decoded = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn response_with_values_list() {
        let bytes = b"d1:rd2:id20:abcdefghij01234567895:token8:aoeusnth6:valuesl6:axje.u6:idhtnmee1:t2:aa1:y1:re";
        let message = Message::from_bytes(bytes).unwrap();

        let MessageKind::Response(arguments) = message.kind else {
            panic!("expected a response");
        };
        assert_eq!(arguments.values, vec![b"axje.u".to_vec(), b"idhtnm".to_vec()]);
        assert_eq!(arguments.token, Some(b"aoeusnth".to_vec()));
        assert_eq!(arguments.nodes, None);
    }

    #[test]
    fn response_with_values_single_string() {
        // Some clients concatenate the contacts into one string.
        let bytes =
            b"d1:rd2:id20:abcdefghij01234567895:token8:aoeusnth6:values12:axje.uidhtnme1:t2:aa1:y1:re";
        let message = Message::from_bytes(bytes).unwrap();

        let MessageKind::Response(arguments) = message.kind else {
            panic!("expected a response");
        };
        assert_eq!(arguments.values, vec![b"axje.u".to_vec(), b"idhtnm".to_vec()]);
    }

    #[test]
    fn decode_error_message() {
        let bytes = b"d1:eli201e23:A Generic Error Ocurrede1:t2:aa1:y1:ee";
        let message = Message::from_bytes(bytes).unwrap();

        assert_eq!(
            message.kind,
            MessageKind::Error {
                code: 201,
                message: "A Generic Error Ocurred".to_string()
            }
        );
    }

    #[test]
    fn malformed_packets_fail_decoding() {
        assert!(Message::from_bytes(b"").is_err());
        assert!(Message::from_bytes(b"d1:t2:aae").is_err());
        assert!(Message::from_bytes(b"i42e").is_err());
    }

    #[test]
    fn nodes_round_trip_and_stride_check() {
        let id = Id::random();
        let address = SocketAddrV4::new([97, 98, 99, 100].into(), 25958);
        let mut nodes = compact_node(&id, &address).to_vec();
        nodes.extend_from_slice(&compact_node(&Id::random(), &address));

        let parsed = parse_nodes(&nodes, UdpProto::V4).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], (id, address));

        nodes.push(0);
        assert!(parse_nodes(&nodes, UdpProto::V4).is_none());
    }

    #[test]
    fn peer_contact_round_trip() {
        let address = SocketAddrV4::new([97, 98, 99, 100].into(), 25958);
        assert_eq!(&compact_peer(&address), b"abcdef");
        assert_eq!(parse_peer(b"abcdef"), Some(address));
        assert_eq!(parse_peer(b"abc"), None);
    }
}
