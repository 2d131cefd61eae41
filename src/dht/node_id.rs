use super::DhtError;
use super::DhtResult;
use rand::Rng;
use std::fmt;

/// A 160-bit Kademlia node identifier.
///
/// Node ids live in the same space as info hashes, which is what lets a `get_peers`
/// lookup walk the routing table toward the content fingerprint: both are just 20-byte
/// values compared under the XOR metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Generates a uniformly random node id.
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id[..]);
        NodeId(id)
    }

    /// Builds a node id from a wire byte slice, which must be exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> DhtResult<Self> {
        if bytes.len() != 20 {
            return Err(DhtError::Malformed(format!(
                "Node id must be 20 bytes, got {}",
                bytes.len()
            )));
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(NodeId(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to `other`, compared as an unsigned 160-bit integer.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut d = [0u8; 20];
        for (i, byte) in d.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(d)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The XOR of two node ids; ordered lexicographically, i.e. as an unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; 20]);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// The length of the common prefix with zero, i.e. the number of leading zero bits.
    ///
    /// Buckets are indexed by this value: two ids sharing `n` leading bits with ours land
    /// in bucket `n`. Returns `None` for the zero distance (the id is our own).
    pub fn prefix_len(&self) -> Option<usize> {
        for (i, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return Some(i * 8 + byte.leading_zeros() as usize);
            }
        }
        None
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}
