//! KRPC message codec: the bencoded dictionaries the DHT exchanges over UDP.
//!
//! Every message carries a transaction id `t` (opaque bytes chosen by the querier) and a
//! type tag `y` of `"q"`, `"r"` or `"e"`. Queries add the method name `q` and arguments
//! `a`; responses add the result dict `r`; errors add the `[code, message]` list `e`.
//! Contact endpoints travel in fixed-stride compact forms: 26 bytes per node
//! (id, IPv4, port) and 6 bytes per peer (IPv4, port), all network byte order.
use super::node_id::NodeId;
use super::routing::Node;
use super::DhtError;
use super::DhtResult;
use crate::bencode::{decoder, BencodeValue};
use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

/// One of the four canonical KRPC queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: [u8; 20],
        port: u16,
        token: Vec<u8>,
    },
}

impl Query {
    pub fn method(&self) -> &'static str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }

    fn arguments(&self) -> HashMap<Vec<u8>, BencodeValue> {
        let mut args = HashMap::new();
        match self {
            Query::Ping { id } => {
                args.insert(b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec()));
            }
            Query::FindNode { id, target } => {
                args.insert(b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec()));
                args.insert(
                    b"target".to_vec(),
                    BencodeValue::String(target.as_bytes().to_vec()),
                );
            }
            Query::GetPeers { id, info_hash } => {
                args.insert(b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec()));
                args.insert(
                    b"info_hash".to_vec(),
                    BencodeValue::String(info_hash.to_vec()),
                );
            }
            Query::AnnouncePeer {
                id,
                info_hash,
                port,
                token,
            } => {
                args.insert(b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec()));
                args.insert(
                    b"info_hash".to_vec(),
                    BencodeValue::String(info_hash.to_vec()),
                );
                args.insert(b"port".to_vec(), BencodeValue::Integer(*port as i64));
                args.insert(b"token".to_vec(), BencodeValue::String(token.clone()));
            }
        }
        args
    }
}

/// The result dict of a successful query.
///
/// `ping` and `announce_peer` carry only `id`; `find_node` fills `nodes`;
/// `get_peers` fills either `values` or `nodes`, plus a `token`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    pub id: Option<NodeId>,
    pub nodes: Vec<Node>,
    pub values: Vec<SocketAddrV4>,
    pub token: Option<Vec<u8>>,
}

/// A full KRPC message, tagged by `y`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Query {
        transaction: Vec<u8>,
        query: Query,
    },
    Response {
        transaction: Vec<u8>,
        response: Response,
    },
    Error {
        transaction: Vec<u8>,
        code: i64,
        message: String,
    },
}

impl Message {
    pub fn transaction(&self) -> &[u8] {
        match self {
            Message::Query { transaction, .. }
            | Message::Response { transaction, .. }
            | Message::Error { transaction, .. } => transaction,
        }
    }

    /// Encodes this message into its wire form.
    pub fn to_bytes(&self) -> DhtResult<Vec<u8>> {
        let mut root = HashMap::new();
        match self {
            Message::Query { transaction, query } => {
                root.insert(b"t".to_vec(), BencodeValue::String(transaction.clone()));
                root.insert(b"y".to_vec(), BencodeValue::String(b"q".to_vec()));
                root.insert(
                    b"q".to_vec(),
                    BencodeValue::String(query.method().as_bytes().to_vec()),
                );
                root.insert(b"a".to_vec(), BencodeValue::Dict(query.arguments()));
            }
            Message::Response {
                transaction,
                response,
            } => {
                root.insert(b"t".to_vec(), BencodeValue::String(transaction.clone()));
                root.insert(b"y".to_vec(), BencodeValue::String(b"r".to_vec()));
                let mut r = HashMap::new();
                if let Some(id) = response.id {
                    r.insert(b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec()));
                }
                if !response.nodes.is_empty() {
                    r.insert(
                        b"nodes".to_vec(),
                        BencodeValue::String(encode_compact_nodes(&response.nodes)),
                    );
                }
                if !response.values.is_empty() {
                    let values = response
                        .values
                        .iter()
                        .map(|addr| BencodeValue::String(encode_compact_peer(addr).to_vec()))
                        .collect();
                    r.insert(b"values".to_vec(), BencodeValue::List(values));
                }
                if let Some(token) = &response.token {
                    r.insert(b"token".to_vec(), BencodeValue::String(token.clone()));
                }
                root.insert(b"r".to_vec(), BencodeValue::Dict(r));
            }
            Message::Error {
                transaction,
                code,
                message,
            } => {
                root.insert(b"t".to_vec(), BencodeValue::String(transaction.clone()));
                root.insert(b"y".to_vec(), BencodeValue::String(b"e".to_vec()));
                root.insert(
                    b"e".to_vec(),
                    BencodeValue::List(vec![
                        BencodeValue::Integer(*code),
                        BencodeValue::String(message.as_bytes().to_vec()),
                    ]),
                );
            }
        }
        Ok(BencodeValue::Dict(root).to_bytes()?)
    }

    /// Decodes a datagram into a KRPC message.
    ///
    /// Trailing bytes after the first bencode value are tolerated; everything else that
    /// deviates from the schema is a `Malformed` error, which the node logs and drops
    /// without tearing down the UDP loop.
    pub fn from_bytes(bytes: &[u8]) -> DhtResult<Message> {
        let (root, _consumed) = decoder::decode(bytes)?;
        let transaction = root
            .get(b"t")
            .and_then(BencodeValue::as_bytes)
            .ok_or_else(|| DhtError::Malformed("missing transaction id".to_string()))?
            .to_vec();
        let y = root
            .get(b"y")
            .and_then(BencodeValue::as_bytes)
            .ok_or_else(|| DhtError::Malformed("missing message type".to_string()))?;

        match y {
            b"q" => {
                let query = decode_query(&root)?;
                Ok(Message::Query { transaction, query })
            }
            b"r" => {
                let response = decode_response(&root)?;
                Ok(Message::Response {
                    transaction,
                    response,
                })
            }
            b"e" => {
                let list = root
                    .get(b"e")
                    .and_then(BencodeValue::as_list)
                    .ok_or_else(|| DhtError::Malformed("missing error list".to_string()))?;
                let code = list
                    .first()
                    .and_then(BencodeValue::as_integer)
                    .ok_or_else(|| DhtError::Malformed("missing error code".to_string()))?;
                let message = list
                    .get(1)
                    .and_then(BencodeValue::as_bytes)
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Ok(Message::Error {
                    transaction,
                    code,
                    message,
                })
            }
            other => Err(DhtError::Malformed(format!(
                "unknown message type {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

fn require_id(args: &BencodeValue) -> DhtResult<NodeId> {
    let bytes = args
        .get(b"id")
        .and_then(BencodeValue::as_bytes)
        .ok_or_else(|| DhtError::Malformed("missing sender id".to_string()))?;
    NodeId::from_bytes(bytes)
}

fn require_hash(args: &BencodeValue, key: &[u8]) -> DhtResult<[u8; 20]> {
    let bytes = args
        .get(key)
        .and_then(BencodeValue::as_bytes)
        .ok_or_else(|| {
            DhtError::Malformed(format!("missing {}", String::from_utf8_lossy(key)))
        })?;
    if bytes.len() != 20 {
        return Err(DhtError::Malformed(format!(
            "{} must be 20 bytes",
            String::from_utf8_lossy(key)
        )));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(bytes);
    Ok(hash)
}

fn decode_query(root: &BencodeValue) -> DhtResult<Query> {
    let method = root
        .get(b"q")
        .and_then(BencodeValue::as_bytes)
        .ok_or_else(|| DhtError::Malformed("missing query method".to_string()))?;
    let args = root
        .get(b"a")
        .ok_or_else(|| DhtError::Malformed("missing query arguments".to_string()))?;
    let id = require_id(args)?;

    match method {
        b"ping" => Ok(Query::Ping { id }),
        b"find_node" => {
            let target = NodeId::from_bytes(
                args.get(b"target")
                    .and_then(BencodeValue::as_bytes)
                    .ok_or_else(|| DhtError::Malformed("missing target".to_string()))?,
            )?;
            Ok(Query::FindNode { id, target })
        }
        b"get_peers" => Ok(Query::GetPeers {
            id,
            info_hash: require_hash(args, b"info_hash")?,
        }),
        b"announce_peer" => {
            let port = args
                .get(b"port")
                .and_then(BencodeValue::as_integer)
                .filter(|p| (0..=u16::MAX as i64).contains(p))
                .ok_or_else(|| DhtError::Malformed("missing or invalid port".to_string()))?;
            let token = args
                .get(b"token")
                .and_then(BencodeValue::as_bytes)
                .unwrap_or_default()
                .to_vec();
            Ok(Query::AnnouncePeer {
                id,
                info_hash: require_hash(args, b"info_hash")?,
                port: port as u16,
                token,
            })
        }
        other => Err(DhtError::Malformed(format!(
            "unknown query method {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn decode_response(root: &BencodeValue) -> DhtResult<Response> {
    let r = root
        .get(b"r")
        .ok_or_else(|| DhtError::Malformed("missing response dict".to_string()))?;

    let id = match r.get(b"id").and_then(BencodeValue::as_bytes) {
        Some(bytes) => Some(NodeId::from_bytes(bytes)?),
        None => None,
    };

    let nodes = match r.get(b"nodes").and_then(BencodeValue::as_bytes) {
        Some(bytes) => decode_compact_nodes(bytes)?,
        None => Vec::new(),
    };

    let values = match r.get(b"values").and_then(BencodeValue::as_list) {
        Some(list) => {
            let mut peers = Vec::with_capacity(list.len());
            for entry in list {
                let bytes = entry
                    .as_bytes()
                    .ok_or_else(|| DhtError::Malformed("peer value not a string".to_string()))?;
                peers.push(decode_compact_peer(bytes)?);
            }
            peers
        }
        None => Vec::new(),
    };

    let token = r
        .get(b"token")
        .and_then(BencodeValue::as_bytes)
        .map(|b| b.to_vec());

    Ok(Response {
        id,
        nodes,
        values,
        token,
    })
}

/// Encodes nodes in the 26-byte compact form: 20-byte id, 4-byte IPv4, 2-byte port.
pub fn encode_compact_nodes(nodes: &[Node]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        out.extend_from_slice(node.id.as_bytes());
        out.extend_from_slice(&node.addr.ip().octets());
        let mut port = [0u8; 2];
        BigEndian::write_u16(&mut port, node.addr.port());
        out.extend_from_slice(&port);
    }
    out
}

/// Decodes a 26-byte-stride compact node string.
pub fn decode_compact_nodes(bytes: &[u8]) -> DhtResult<Vec<Node>> {
    if bytes.len() % 26 != 0 {
        return Err(DhtError::Malformed(format!(
            "compact nodes length {} not a multiple of 26",
            bytes.len()
        )));
    }
    let mut nodes = Vec::with_capacity(bytes.len() / 26);
    for chunk in bytes.chunks_exact(26) {
        let id = NodeId::from_bytes(&chunk[..20])?;
        let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = BigEndian::read_u16(&chunk[24..26]);
        nodes.push(Node {
            id,
            addr: SocketAddrV4::new(ip, port),
        });
    }
    Ok(nodes)
}

/// Encodes one peer endpoint in the 6-byte compact form: 4-byte IPv4, 2-byte port.
pub fn encode_compact_peer(addr: &SocketAddrV4) -> [u8; 6] {
    let mut out = [0u8; 6];
    out[..4].copy_from_slice(&addr.ip().octets());
    BigEndian::write_u16(&mut out[4..], addr.port());
    out
}

/// Decodes one 6-byte compact peer endpoint.
pub fn decode_compact_peer(bytes: &[u8]) -> DhtResult<SocketAddrV4> {
    if bytes.len() != 6 {
        return Err(DhtError::Malformed(format!(
            "compact peer must be 6 bytes, got {}",
            bytes.len()
        )));
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = BigEndian::read_u16(&bytes[4..6]);
    Ok(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Message {
        Message::from_bytes(&message.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn roundtrips_ping_query() {
        let message = Message::Query {
            transaction: b"aa".to_vec(),
            query: Query::Ping {
                id: NodeId([7u8; 20]),
            },
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn roundtrips_find_node() {
        let message = Message::Query {
            transaction: b"ab".to_vec(),
            query: Query::FindNode {
                id: NodeId([1u8; 20]),
                target: NodeId([2u8; 20]),
            },
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn roundtrips_announce_peer() {
        let message = Message::Query {
            transaction: b"xz".to_vec(),
            query: Query::AnnouncePeer {
                id: NodeId([3u8; 20]),
                info_hash: [9u8; 20],
                port: 6881,
                token: b"tok".to_vec(),
            },
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn roundtrips_response_with_nodes_and_values() {
        let node = Node {
            id: NodeId([5u8; 20]),
            addr: SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 6881),
        };
        let message = Message::Response {
            transaction: b"cd".to_vec(),
            response: Response {
                id: Some(NodeId([4u8; 20])),
                nodes: vec![node],
                values: vec![SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 9), 51413)],
                token: Some(b"t0".to_vec()),
            },
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn roundtrips_error() {
        let message = Message::Error {
            transaction: b"ee".to_vec(),
            code: 203,
            message: "Protocol Error".to_string(),
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn compact_node_layout_is_network_order() {
        let node = Node {
            id: NodeId([0xaa; 20]),
            addr: SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 0x1234),
        };
        let encoded = encode_compact_nodes(&[node]);
        assert_eq!(encoded.len(), 26);
        assert_eq!(&encoded[20..24], &[1, 2, 3, 4]);
        assert_eq!(&encoded[24..26], &[0x12, 0x34]);
    }

    #[test]
    fn rejects_misaligned_compact_nodes() {
        assert!(decode_compact_nodes(&[0u8; 27]).is_err());
        assert!(decode_compact_peer(&[0u8; 5]).is_err());
    }

    #[test]
    fn rejects_schema_violations() {
        // not a dict
        assert!(Message::from_bytes(b"i42e").is_err());
        // missing y
        assert!(Message::from_bytes(b"d1:t2:aae").is_err());
        // unknown method
        assert!(Message::from_bytes(b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:oops1:t2:aa1:y1:qe").is_err());
    }
}
