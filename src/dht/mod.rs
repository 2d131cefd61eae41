//! Kademlia-style DHT node for trackerless peer discovery (BEP 5).
//!
//! The DHT speaks KRPC: bencoded query/response dictionaries over UDP. Four queries
//! are implemented (`ping`, `find_node`, `get_peers` and `announce_peer`) on top of
//! an XOR-metric routing table of K-sized buckets.
use thiserror::Error;
pub mod krpc;
pub mod node;
pub mod node_id;
pub mod routing;

pub use node::Dht;
pub use node_id::NodeId;
pub use routing::{Node, RoutingTable};

/// Kademlia bucket capacity.
pub const K: usize = 8;
/// Number of parallel in-flight queries during an iterative lookup.
pub const ALPHA: usize = 3;
/// Per-query UDP timeout; one retry is attempted after the first expiry.
pub const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);
/// Largest datagram this node will build or accept.
pub const MAX_PACKET_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Malformed KRPC message: {0}")]
    Malformed(String),

    #[error("Query timed out")]
    Timeout,

    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Node is shutting down")]
    ShuttingDown,
}

pub type DhtResult<T> = std::result::Result<T, DhtError>;
