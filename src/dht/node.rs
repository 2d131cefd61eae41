//! The running DHT node: a UDP socket, the routing table behind it, and the
//! request/response plumbing for the four KRPC queries.
//!
//! One task owns the receive loop. Incoming queries are answered from the routing
//! table and the announced-peer store; incoming responses are routed to the waiting
//! caller through a transaction map. Malformed datagrams are logged and dropped.
use super::krpc::{Message, Query, Response};
use super::node_id::NodeId;
use super::routing::{Node, Observation, RoutingTable};
use super::{DhtError, DhtResult, ALPHA, K, MAX_PACKET_SIZE, QUERY_TIMEOUT};
use rand::Rng;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::instrument;

/// Upper bound on `values` entries in one `get_peers` response, keeping the datagram
/// under `MAX_PACKET_SIZE`.
const MAX_VALUES_PER_RESPONSE: usize = 64;

struct Inner {
    id: NodeId,
    socket: UdpSocket,
    table: RwLock<RoutingTable>,
    /// Peers announced to us, keyed by info hash.
    store: Mutex<HashMap<[u8; 20], HashSet<SocketAddrV4>>>,
    /// In-flight queries keyed by transaction id.
    pending: Mutex<HashMap<Vec<u8>, oneshot::Sender<DhtResult<Response>>>>,
    /// Node-local secret the announce tokens are derived from.
    secret: [u8; 16],
    next_transaction: AtomicU16,
}

/// Handle to a running DHT node. Cheap to clone; the node stops when `shutdown`
/// is invoked (or every handle is dropped and the loop errors out).
#[derive(Clone)]
pub struct Dht {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
}

impl Dht {
    /// Binds a UDP socket and starts the receive loop with a random node id.
    pub async fn bind(addr: SocketAddr) -> DhtResult<Dht> {
        Self::bind_with_id(addr, NodeId::random()).await
    }

    /// Binds a UDP socket and starts the receive loop with the given node id.
    pub async fn bind_with_id(addr: SocketAddr, id: NodeId) -> DhtResult<Dht> {
        let socket = UdpSocket::bind(addr).await?;
        let mut secret = [0u8; 16];
        rand::rng().fill(&mut secret[..]);

        let inner = Arc::new(Inner {
            id,
            socket,
            table: RwLock::new(RoutingTable::new(id)),
            store: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            secret,
            next_transaction: AtomicU16::new(rand::rng().random()),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_loop(inner.clone(), shutdown_rx));

        Ok(Dht { inner, shutdown })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn local_addr(&self) -> DhtResult<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Signals the receive loop to stop. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Sends a `ping` and returns the responder's node id.
    pub async fn ping(&self, addr: SocketAddrV4) -> DhtResult<NodeId> {
        let response = query(&self.inner, addr, Query::Ping { id: self.inner.id }).await?;
        response
            .id
            .ok_or_else(|| DhtError::Malformed("ping response without id".to_string()))
    }

    /// Sends a `find_node` for `target` and returns the nodes from the reply.
    pub async fn find_node(&self, addr: SocketAddrV4, target: NodeId) -> DhtResult<Vec<Node>> {
        let response = query(
            &self.inner,
            addr,
            Query::FindNode {
                id: self.inner.id,
                target,
            },
        )
        .await?;
        Ok(response.nodes)
    }

    /// Sends a `get_peers` for `info_hash`; the reply carries either peer values or
    /// closer nodes, plus the token needed to announce to this responder.
    pub async fn get_peers(
        &self,
        addr: SocketAddrV4,
        info_hash: [u8; 20],
    ) -> DhtResult<Response> {
        query(
            &self.inner,
            addr,
            Query::GetPeers {
                id: self.inner.id,
                info_hash,
            },
        )
        .await
    }

    /// Announces that we serve `info_hash` on `port`, using a token previously
    /// obtained from this responder via `get_peers`.
    pub async fn announce_peer(
        &self,
        addr: SocketAddrV4,
        info_hash: [u8; 20],
        port: u16,
        token: Vec<u8>,
    ) -> DhtResult<()> {
        query(
            &self.inner,
            addr,
            Query::AnnouncePeer {
                id: self.inner.id,
                info_hash,
                port,
                token,
            },
        )
        .await?;
        Ok(())
    }

    /// Bootstraps the routing table: a `find_node` for our own id to each contact,
    /// folding every returned node in. This both fills buckets and advertises us to
    /// our future neighbors. Returns the number of nodes folded in.
    #[instrument(skip(self, contacts), level = "debug")]
    pub async fn bootstrap(&self, contacts: &[SocketAddr]) -> usize {
        let mut folded = 0;
        for contact in contacts {
            let SocketAddr::V4(addr) = contact else {
                tracing::debug!(?contact, "Skipping non-IPv4 bootstrap contact");
                continue;
            };
            match self.find_node(*addr, self.inner.id).await {
                Ok(nodes) => {
                    for node in nodes {
                        observe(&self.inner, node).await;
                        folded += 1;
                    }
                }
                Err(e) => {
                    tracing::debug!(?addr, error = %e, "Bootstrap contact did not respond");
                }
            }
        }
        tracing::debug!(folded, table_len = self.table_len(), "Bootstrap finished");
        folded
    }

    /// Iterative `get_peers` lookup for `info_hash`: α parallel queries walk a
    /// shortlist sorted by XOR distance to the target until K values-responses have
    /// arrived or a full round brings nothing closer. Returns every peer endpoint
    /// collected along the way.
    #[instrument(skip(self), fields(info_hash = %hex::encode(info_hash)), level = "debug")]
    pub async fn lookup_peers(&self, info_hash: [u8; 20]) -> Vec<SocketAddrV4> {
        let (peers, _responders) = self.lookup(info_hash).await;
        peers
    }

    /// Runs a peer lookup, then announces to the K closest responders that handed us
    /// a token. Returns the peers collected by the lookup.
    #[instrument(skip(self), fields(info_hash = %hex::encode(info_hash)), level = "debug")]
    pub async fn announce(&self, info_hash: [u8; 20], port: u16) -> Vec<SocketAddrV4> {
        let (peers, mut responders) = self.lookup(info_hash).await;
        let target = NodeId(info_hash);
        responders.sort_by_key(|(node, _)| node.id.distance(&target));
        for (node, token) in responders.into_iter().take(K) {
            if let Err(e) = self
                .announce_peer(node.addr, info_hash, port, token)
                .await
            {
                tracing::debug!(addr = ?node.addr, error = %e, "announce_peer failed");
            }
        }
        peers
    }

    /// The shared lookup walk. Returns collected peers and the responders that
    /// granted announce tokens.
    async fn lookup(&self, info_hash: [u8; 20]) -> (Vec<SocketAddrV4>, Vec<(Node, Vec<u8>)>) {
        let target = NodeId(info_hash);
        let mut shortlist = self
            .inner
            .table
            .read()
            .expect("routing table lock poisoned")
            .closest(&target, K);
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut peers: HashSet<SocketAddrV4> = HashSet::new();
        let mut responders: Vec<(Node, Vec<u8>)> = Vec::new();
        let mut values_responses = 0usize;

        loop {
            let round: Vec<Node> = shortlist
                .iter()
                .filter(|n| !queried.contains(&n.id))
                .take(ALPHA)
                .copied()
                .collect();
            if round.is_empty() {
                break;
            }

            let best_before = shortlist.first().map(|n| n.id.distance(&target));

            let mut join = tokio::task::JoinSet::new();
            for node in round {
                queried.insert(node.id);
                let inner = self.inner.clone();
                join.spawn(async move {
                    let reply = query(
                        &inner,
                        node.addr,
                        Query::GetPeers {
                            id: inner.id,
                            info_hash,
                        },
                    )
                    .await;
                    (node, reply)
                });
            }

            while let Some(joined) = join.join_next().await {
                let Ok((node, reply)) = joined else { continue };
                match reply {
                    Ok(response) => {
                        if !response.values.is_empty() {
                            values_responses += 1;
                            peers.extend(response.values.iter().copied());
                        }
                        if let Some(token) = response.token {
                            responders.push((node, token));
                        }
                        for found in response.nodes {
                            if found.id != self.inner.id
                                && !shortlist.iter().any(|n| n.id == found.id)
                            {
                                shortlist.push(found);
                            }
                            let inner = self.inner.clone();
                            tokio::spawn(async move {
                                observe(&inner, found).await;
                            });
                        }
                    }
                    Err(e) => {
                        tracing::trace!(addr = ?node.addr, error = %e, "Lookup query failed");
                    }
                }
            }

            shortlist.sort_by_key(|n| n.id.distance(&target));

            if values_responses >= K {
                break;
            }
            let best_after = shortlist.first().map(|n| n.id.distance(&target));
            let improved = match (best_before, best_after) {
                (Some(before), Some(after)) => after < before,
                (None, Some(_)) => true,
                _ => false,
            };
            let unqueried_near = shortlist
                .iter()
                .take(K)
                .any(|n| !queried.contains(&n.id));
            if !improved && !unqueried_near {
                break;
            }
        }

        (peers.into_iter().collect(), responders)
    }

    pub fn table_len(&self) -> usize {
        self.inner
            .table
            .read()
            .expect("routing table lock poisoned")
            .len()
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.inner
            .table
            .read()
            .expect("routing table lock poisoned")
            .contains(id)
    }

    /// Peer endpoints announced to this node for `info_hash`.
    pub fn stored_peers(&self, info_hash: &[u8; 20]) -> Vec<SocketAddrV4> {
        self.inner
            .store
            .lock()
            .expect("peer store lock poisoned")
            .get(info_hash)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Sends one query with the 2 s timeout and a single retry, waiting for the
/// response routed back through the transaction map.
async fn query(inner: &Arc<Inner>, addr: SocketAddrV4, q: Query) -> DhtResult<Response> {
    for _attempt in 0..2 {
        let transaction = inner
            .next_transaction
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
            .to_vec();
        let message = Message::Query {
            transaction: transaction.clone(),
            query: q.clone(),
        };
        let datagram = message.to_bytes()?;

        let (tx, rx) = oneshot::channel();
        inner
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(transaction.clone(), tx);

        if let Err(e) = inner.socket.send_to(&datagram, addr).await {
            inner
                .pending
                .lock()
                .expect("pending map lock poisoned")
                .remove(&transaction);
            return Err(e.into());
        }

        match timeout(QUERY_TIMEOUT, rx).await {
            Ok(Ok(result)) => return result,
            Ok(Err(_dropped)) => return Err(DhtError::ShuttingDown),
            Err(_elapsed) => {
                inner
                    .pending
                    .lock()
                    .expect("pending map lock poisoned")
                    .remove(&transaction);
                tracing::trace!(?addr, method = q.method(), "Query timed out");
            }
        }
    }
    Err(DhtError::Timeout)
}

/// Folds an observed node into the routing table, pinging the bucket head when the
/// bucket is full to decide between keeping it and evicting it.
async fn observe(inner: &Arc<Inner>, node: Node) {
    let outcome = inner
        .table
        .write()
        .expect("routing table lock poisoned")
        .observe(node);
    if let Observation::BucketFull { bucket, oldest } = outcome {
        let alive = query(inner, oldest.addr, Query::Ping { id: inner.id })
            .await
            .is_ok();
        let mut table = inner.table.write().expect("routing table lock poisoned");
        if alive {
            table.confirm_oldest(bucket, &oldest);
        } else {
            table.replace_oldest(bucket, &oldest, node);
        }
    }
}

/// The receive loop: parses datagrams, answers queries, routes responses.
async fn run_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!("DHT loop shutting down");
                break;
            }
            received = inner.socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "UDP receive error");
                        continue;
                    }
                };
                let SocketAddr::V4(from) = from else {
                    continue;
                };
                let message = match Message::from_bytes(&buf[..len]) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::debug!(?from, error = %e, "Dropping malformed datagram");
                        continue;
                    }
                };
                match message {
                    Message::Query { transaction, query } => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            handle_query(inner, transaction, query, from).await;
                        });
                    }
                    Message::Response { transaction, response } => {
                        if let Some(id) = response.id {
                            let inner = inner.clone();
                            tokio::spawn(async move {
                                observe(&inner, Node { id, addr: from }).await;
                            });
                        }
                        deliver(&inner, &transaction, Ok(response));
                    }
                    Message::Error { transaction, code, message } => {
                        deliver(&inner, &transaction, Err(DhtError::Remote { code, message }));
                    }
                }
            }
        }
    }
}

/// Hands a routed response (or remote error) to the waiting query, if any.
fn deliver(inner: &Arc<Inner>, transaction: &[u8], result: DhtResult<Response>) {
    let waiter = inner
        .pending
        .lock()
        .expect("pending map lock poisoned")
        .remove(transaction);
    match waiter {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => {
            tracing::trace!("Response for unknown transaction dropped");
        }
    }
}

/// Answers one incoming query.
async fn handle_query(inner: Arc<Inner>, transaction: Vec<u8>, query: Query, from: SocketAddrV4) {
    let sender_id = match &query {
        Query::Ping { id }
        | Query::FindNode { id, .. }
        | Query::GetPeers { id, .. }
        | Query::AnnouncePeer { id, .. } => *id,
    };
    observe(
        &inner,
        Node {
            id: sender_id,
            addr: from,
        },
    )
    .await;

    let reply = match query {
        Query::Ping { .. } => Message::Response {
            transaction,
            response: Response {
                id: Some(inner.id),
                ..Default::default()
            },
        },
        Query::FindNode { target, .. } => {
            let nodes = inner
                .table
                .read()
                .expect("routing table lock poisoned")
                .closest(&target, K);
            Message::Response {
                transaction,
                response: Response {
                    id: Some(inner.id),
                    nodes,
                    ..Default::default()
                },
            }
        }
        Query::GetPeers { info_hash, .. } => {
            let token = make_token(&inner.secret, &from);
            let values: Vec<SocketAddrV4> = inner
                .store
                .lock()
                .expect("peer store lock poisoned")
                .get(&info_hash)
                .map(|set| set.iter().take(MAX_VALUES_PER_RESPONSE).copied().collect())
                .unwrap_or_default();
            let response = if values.is_empty() {
                let nodes = inner
                    .table
                    .read()
                    .expect("routing table lock poisoned")
                    .closest(&NodeId(info_hash), K);
                Response {
                    id: Some(inner.id),
                    nodes,
                    token: Some(token),
                    ..Default::default()
                }
            } else {
                Response {
                    id: Some(inner.id),
                    values,
                    token: Some(token),
                    ..Default::default()
                }
            };
            Message::Response {
                transaction,
                response,
            }
        }
        Query::AnnouncePeer {
            info_hash,
            port,
            token,
            ..
        } => {
            if token != make_token(&inner.secret, &from) {
                Message::Error {
                    transaction,
                    code: 203,
                    message: "Protection Error: bad token".to_string(),
                }
            } else {
                let peer = SocketAddrV4::new(*from.ip(), port);
                inner
                    .store
                    .lock()
                    .expect("peer store lock poisoned")
                    .entry(info_hash)
                    .or_default()
                    .insert(peer);
                Message::Response {
                    transaction,
                    response: Response {
                        id: Some(inner.id),
                        ..Default::default()
                    },
                }
            }
        }
    };

    match reply.to_bytes() {
        Ok(datagram) if datagram.len() <= MAX_PACKET_SIZE => {
            if let Err(e) = inner.socket.send_to(&datagram, from).await {
                tracing::debug!(?from, error = %e, "Failed to send reply");
            }
        }
        Ok(datagram) => {
            tracing::warn!(len = datagram.len(), "Reply exceeds max packet size, dropped");
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode reply");
        }
    }
}

/// Derives the announce token for a requester endpoint: the first 8 bytes of
/// SHA-1(ip + port + secret). Stateless, so it survives without a grant table.
fn make_token(secret: &[u8; 16], addr: &SocketAddrV4) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(addr.ip().octets());
    hasher.update(addr.port().to_be_bytes());
    hasher.update(secret);
    hasher.finalize()[..8].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    async fn bind_node() -> Dht {
        Dht::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(addr) => addr,
            _ => panic!("expected v4"),
        }
    }

    #[tokio::test]
    async fn ping_returns_responder_id_and_fills_table() {
        let a = bind_node().await;
        let b = bind_node().await;

        let id = a.ping(v4(b.local_addr().unwrap())).await.unwrap();
        assert_eq!(id, b.id());

        // both sides observe each other (b from the query, a from the response)
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.contains_node(&b.id()));
        assert!(b.contains_node(&a.id()));
    }

    #[tokio::test]
    async fn bootstrap_folds_nodes_from_responder() {
        let a = bind_node().await;

        // in-process UDP responder: replies to find_node with one fixed compact entry
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        let n0 = Node {
            id: NodeId([0x42; 20]),
            addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 42424),
        };
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_PACKET_SIZE];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            let message = Message::from_bytes(&buf[..len]).unwrap();
            if let Message::Query { transaction, query } = message {
                assert!(matches!(query, Query::FindNode { .. }));
                let reply = Message::Response {
                    transaction,
                    response: Response {
                        id: Some(NodeId([0x24; 20])),
                        nodes: vec![n0],
                        ..Default::default()
                    },
                };
                responder
                    .send_to(&reply.to_bytes().unwrap(), from)
                    .await
                    .unwrap();
            }
        });

        let folded = a.bootstrap(&[responder_addr]).await;
        assert_eq!(folded, 1);
        assert!(a.contains_node(&NodeId([0x42; 20])));
    }

    #[tokio::test]
    async fn get_peers_falls_back_to_nodes_then_serves_values() {
        let a = bind_node().await;
        let b = bind_node().await;
        let c = bind_node().await;
        let b_addr = v4(b.local_addr().unwrap());
        let info_hash = [0x11u8; 20];

        // no peers stored yet: reply carries a token (and possibly nodes)
        let reply = a.get_peers(b_addr, info_hash).await.unwrap();
        assert!(reply.values.is_empty());
        let token = reply.token.expect("get_peers must grant a token");

        // announce with that token, then another node sees the value
        a.announce_peer(b_addr, info_hash, 6881, token).await.unwrap();
        assert_eq!(b.stored_peers(&info_hash).len(), 1);

        let reply = c.get_peers(b_addr, info_hash).await.unwrap();
        assert_eq!(reply.values.len(), 1);
        assert_eq!(reply.values[0].port(), 6881);
    }

    #[tokio::test]
    async fn announce_with_bad_token_is_rejected() {
        let a = bind_node().await;
        let b = bind_node().await;
        let b_addr = v4(b.local_addr().unwrap());

        let result = a
            .announce_peer(b_addr, [0x22u8; 20], 6881, b"bogus".to_vec())
            .await;
        match result {
            Err(DhtError::Remote { code, .. }) => assert_eq!(code, 203),
            other => panic!("expected remote error 203, got {:?}", other),
        }
        assert!(b.stored_peers(&[0x22u8; 20]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn query_times_out_against_silent_endpoint() {
        let a = bind_node().await;
        // bound but never reads or replies
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = v4(silent.local_addr().unwrap());

        let result = a.ping(addr).await;
        assert!(matches!(result, Err(DhtError::Timeout)));
    }

    #[tokio::test]
    async fn malformed_datagram_does_not_kill_loop() {
        let a = bind_node().await;
        let a_addr = a.local_addr().unwrap();

        let prober = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        prober.send_to(b"not bencode at all", a_addr).await.unwrap();
        prober.send_to(b"i42e", a_addr).await.unwrap();

        // the loop is still alive and answering
        let b = bind_node().await;
        let id = b.ping(v4(a_addr)).await.unwrap();
        assert_eq!(id, a.id());
    }

    #[tokio::test]
    async fn lookup_collects_peers_across_hops() {
        // topology: a knows b; b knows c; c stores a peer for the hash
        let a = bind_node().await;
        let b = bind_node().await;
        let c = bind_node().await;
        let info_hash = [0x33u8; 20];

        // seed c's store via a tokened announce from b
        let c_addr = v4(c.local_addr().unwrap());
        let grant = b.get_peers(c_addr, info_hash).await.unwrap();
        b.announce_peer(c_addr, info_hash, 51413, grant.token.unwrap())
            .await
            .unwrap();

        // wire the routing tables: b learns of c, a learns of b
        b.ping(c_addr).await.unwrap();
        a.ping(v4(b.local_addr().unwrap())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let peers = a.lookup_peers(info_hash).await;
        assert!(peers.iter().any(|p| p.port() == 51413));
    }
}
