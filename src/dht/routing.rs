use super::node_id::NodeId;
use super::K;
use std::net::SocketAddrV4;

/// A contact in the DHT: node id plus IPv4 UDP endpoint.
///
/// Routing identity is the id alone; equality (used by the eviction check) is the
/// full triple, so a node that reappears on a different endpoint is not mistaken
/// for the entry it would replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

/// An ordered bucket of at most K nodes, oldest first.
#[derive(Debug, Default, Clone)]
pub struct Bucket {
    nodes: Vec<Node>,
}

impl Bucket {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == *id)
    }
}

/// The outcome of observing a node, telling the caller what (if anything) is left to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The node was already known; it moved to the most-recently-seen end.
    Refreshed,
    /// The node was appended to a bucket with room.
    Added,
    /// The bucket is full. The caller should ping `oldest` and then either
    /// `confirm_oldest` (it answered) or `replace_oldest` (it did not).
    BucketFull { bucket: usize, oldest: Node },
    /// The observed id is our own; the table never contains self.
    OwnId,
}

/// A Kademlia routing table: one bucket per XOR-prefix class with our own id.
///
/// Buckets are created lazily as ids with longer shared prefixes are observed.
/// The self-covering bucket is never split; the table stays a flat bucket list,
/// which trades lookup optimality for a much simpler structure.
#[derive(Debug)]
pub struct RoutingTable {
    own_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId) -> Self {
        RoutingTable {
            own_id,
            buckets: Vec::new(),
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    /// The bucket index for `id`: the length of its common bit-prefix with our id.
    /// `None` when `id` is our own.
    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        self.own_id.distance(id).prefix_len()
    }

    /// Records that `node` was seen on the wire.
    ///
    /// Implements the observation rule: known node moves to the tail; a bucket with
    /// room appends; a full bucket defers to the caller, who pings the oldest entry
    /// and resolves with `confirm_oldest` or `replace_oldest`.
    pub fn observe(&mut self, node: Node) -> Observation {
        let Some(index) = self.bucket_index(&node.id) else {
            return Observation::OwnId;
        };
        if index >= self.buckets.len() {
            self.buckets.resize(index + 1, Bucket::default());
        }
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.position(&node.id) {
            // Known id: refresh recency and track the latest observed endpoint.
            let mut entry = bucket.nodes.remove(pos);
            entry.addr = node.addr;
            bucket.nodes.push(entry);
            return Observation::Refreshed;
        }

        if bucket.nodes.len() < K {
            bucket.nodes.push(node);
            return Observation::Added;
        }

        Observation::BucketFull {
            bucket: index,
            oldest: bucket.nodes[0],
        }
    }

    /// The oldest node of `bucket` answered a ping: move it to the tail (and drop the
    /// candidate that triggered the check). No-op if the bucket changed in the meantime.
    pub fn confirm_oldest(&mut self, bucket: usize, oldest: &Node) {
        if let Some(b) = self.buckets.get_mut(bucket) {
            if b.nodes.first() == Some(oldest) {
                let entry = b.nodes.remove(0);
                b.nodes.push(entry);
            }
        }
    }

    /// The oldest node did not answer: evict it and append the candidate.
    /// No-op if the table changed in the meantime (keeps the no-duplicates invariant).
    pub fn replace_oldest(&mut self, bucket: usize, oldest: &Node, node: Node) {
        if let Some(b) = self.buckets.get_mut(bucket) {
            if b.nodes.first() == Some(oldest) {
                b.nodes.remove(0);
                if b.position(&node.id).is_none() {
                    b.nodes.push(node);
                }
            }
        }
    }

    /// Drops a node (full-triple match) from the table, e.g. after repeated timeouts.
    pub fn remove(&mut self, node: &Node) {
        if let Some(index) = self.bucket_index(&node.id) {
            if let Some(b) = self.buckets.get_mut(index) {
                b.nodes.retain(|n| n != node);
            }
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.bucket_index(id)
            .and_then(|i| self.buckets.get(i))
            .is_some_and(|b| b.position(id).is_some())
    }

    /// All known nodes, sorted ascending by XOR distance to `target`, truncated to `k`.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter().copied())
            .collect();
        nodes.sort_by_key(|n| n.id.distance(target));
        nodes.truncate(k);
        nodes
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn node(first_byte: u8, tail: u8, port: u16) -> Node {
        let mut id = [tail; 20];
        id[0] = first_byte;
        Node {
            id: NodeId(id),
            addr: addr(port),
        }
    }

    #[test]
    fn never_contains_self() {
        let own = NodeId([0u8; 20]);
        let mut table = RoutingTable::new(own);
        let outcome = table.observe(Node {
            id: own,
            addr: addr(1),
        });
        assert_eq!(outcome, Observation::OwnId);
        assert!(table.is_empty());
    }

    #[test]
    fn buckets_cap_at_k_without_duplicates() {
        let mut table = RoutingTable::new(NodeId([0u8; 20]));
        // all these ids share prefix_len 0 with the zero id (first bit set)
        for i in 0..20u8 {
            table.observe(node(0x80, i, 1000 + i as u16));
        }
        for bucket in table.buckets() {
            assert!(bucket.nodes().len() <= K);
            let mut ids: Vec<_> = bucket.nodes().iter().map(|n| n.id).collect();
            ids.dedup();
            assert_eq!(ids.len(), bucket.nodes().len());
        }
        assert_eq!(table.len(), K);
    }

    #[test]
    fn reobserving_moves_to_tail() {
        let mut table = RoutingTable::new(NodeId([0u8; 20]));
        let a = node(0x80, 1, 1);
        let b = node(0x80, 2, 2);
        table.observe(a);
        table.observe(b);
        assert_eq!(table.observe(a), Observation::Refreshed);
        let bucket = &table.buckets()[0];
        assert_eq!(bucket.nodes().last().unwrap().id, a.id);
    }

    #[test]
    fn full_bucket_defers_to_caller() {
        let mut table = RoutingTable::new(NodeId([0u8; 20]));
        for i in 0..K as u8 {
            assert_eq!(table.observe(node(0x80, i + 1, 1)), Observation::Added);
        }
        let oldest = node(0x80, 1, 1);
        let candidate = node(0x80, 0x7f, 9);
        match table.observe(candidate) {
            Observation::BucketFull {
                bucket,
                oldest: reported,
            } => {
                assert_eq!(reported, oldest);
                // unresponsive head: evict and append the candidate
                table.replace_oldest(bucket, &oldest, candidate);
            }
            other => panic!("expected BucketFull, got {:?}", other),
        }
        assert!(!table.contains(&oldest.id));
        assert!(table.contains(&candidate.id));
        assert_eq!(table.len(), K);
    }

    #[test]
    fn responsive_head_survives_eviction_check() {
        let mut table = RoutingTable::new(NodeId([0u8; 20]));
        for i in 0..K as u8 {
            table.observe(node(0x80, i + 1, 1));
        }
        let oldest = node(0x80, 1, 1);
        let candidate = node(0x80, 0x7f, 9);
        if let Observation::BucketFull { bucket, .. } = table.observe(candidate) {
            table.confirm_oldest(bucket, &oldest);
        }
        assert!(table.contains(&oldest.id));
        assert!(!table.contains(&candidate.id));
        // the confirmed head is now most-recently-seen
        let bucket = &table.buckets()[0];
        assert_eq!(bucket.nodes().last().unwrap().id, oldest.id);
    }

    #[test]
    fn closest_sorts_by_xor_distance() {
        let mut table = RoutingTable::new(NodeId([0u8; 20]));
        let near = node(0x01, 0, 1);
        let mid = node(0x10, 0, 2);
        let far = node(0xf0, 0, 3);
        table.observe(far);
        table.observe(near);
        table.observe(mid);

        let target = NodeId([0u8; 20]);
        let closest = table.closest(&target, 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].id, near.id);
        assert_eq!(closest[1].id, mid.id);
    }
}
