//! The engine that drives every peer connection for one torrent.
//!
//! Each connection gets a reader task and a writer task; shared state lives in
//! [`PeerState`]. Engine-wide tasks run beside them: the choking controller
//! (tit-for-tat every choke interval, optimistic unchoke on a longer cycle) and the
//! piece-event task that broadcasts `have` messages as pieces verify. A single watch
//! channel is the shutdown signal for all of it.
use super::bitfield::Bitfield;
use super::connection::{BlockRequest, PeerState};
use super::handshake::Handshake;
use super::message::{self, Message};
use super::picker::PiecePicker;
use super::{PeerError, PeerResult};
use crate::piece::{PieceError, PieceEvent, PieceManager, BLOCK_SIZE};
use bytes::BytesMut;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout};
use tracing::instrument;

/// How many peers the tit-for-tat pass may keep unchoked at once.
const UNCHOKE_SLOTS: usize = 4;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TCP listen port; 0 lets the OS pick (used by tests).
    pub listen_port: u16,
    /// Cap on our in-flight `request`s per peer.
    pub max_outstanding: usize,
    /// Tit-for-tat recalculation period.
    pub choke_interval: Duration,
    /// Optimistic unchoke period; rounded to a whole number of choke intervals.
    pub optimistic_interval: Duration,
    /// How often the writer emits a keep-alive on an idle connection.
    pub keep_alive_interval: Duration,
    /// A connection silent for this long is closed.
    pub keep_alive_timeout: Duration,
    /// Outbound queue depth per peer; a full queue halts request top-up.
    pub outbound_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            listen_port: 6881,
            max_outstanding: 5,
            choke_interval: Duration::from_secs(10),
            optimistic_interval: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(90),
            keep_alive_timeout: Duration::from_secs(120),
            outbound_queue: 64,
        }
    }
}

struct EngineInner {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    config: EngineConfig,
    pieces: Arc<PieceManager>,
    picker: Mutex<PiecePicker>,
    peers: Mutex<HashMap<u64, Arc<PeerState>>>,
    next_peer: AtomicU64,
}

/// Handle to a running peer-wire engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Engine {
    /// Builds the engine and starts the choking controller and the piece-event task.
    /// `events` is the stream produced by the piece manager.
    pub fn new(
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        pieces: Arc<PieceManager>,
        events: mpsc::UnboundedReceiver<PieceEvent>,
        config: EngineConfig,
    ) -> Engine {
        let num_pieces = pieces.num_pieces();
        let inner = Arc::new(EngineInner {
            info_hash,
            peer_id,
            config,
            pieces,
            picker: Mutex::new(PiecePicker::new(num_pieces)),
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(0),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(choking_loop(inner.clone(), shutdown_rx.clone()));
        tokio::spawn(event_loop(inner.clone(), events, shutdown_rx.clone()));

        Engine {
            inner,
            shutdown,
            shutdown_rx,
        }
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.inner.info_hash
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.inner.peer_id
    }

    /// Binds the listen socket and starts accepting inbound peers. Returns the bound
    /// address. A bind failure is fatal and surfaces to the caller.
    #[instrument(skip(self), level = "debug")]
    pub async fn listen(&self) -> PeerResult<SocketAddr> {
        let listener =
            TcpListener::bind(("0.0.0.0", self.inner.config.listen_port)).await?;
        let local = listener.local_addr()?;
        tracing::debug!(?local, "Listening for peers");

        let inner = self.inner.clone();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => {
                        let (stream, addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::warn!(error = %e, "Accept failed");
                                continue;
                            }
                        };
                        tracing::debug!(?addr, "Inbound peer connection");
                        let inner = inner.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = start_inbound(inner, stream, shutdown).await {
                                tracing::debug!(?addr, error = %e, "Inbound peer rejected");
                            }
                        });
                    }
                }
            }
        });
        Ok(local)
    }

    /// Dials a peer, runs the initiating handshake, and registers the connection.
    #[instrument(skip(self), level = "debug")]
    pub async fn connect(&self, addr: SocketAddr) -> PeerResult<Arc<PeerState>> {
        let mut stream = timeout(Duration::from_secs(10), TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;
        let theirs =
            Handshake::initiate(&mut stream, self.inner.info_hash, self.inner.peer_id).await?;
        tracing::debug!(?addr, peer_id = %hex::encode(theirs.peer_id), "Outbound handshake ok");
        register_connection(
            self.inner.clone(),
            stream,
            theirs.peer_id,
            self.shutdown_rx.clone(),
        )
    }

    pub fn peers(&self) -> Vec<Arc<PeerState>> {
        self.inner
            .peers
            .lock()
            .expect("peer map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn num_peers(&self) -> usize {
        self.inner.peers.lock().expect("peer map lock poisoned").len()
    }

    /// Signals every engine task to stop; writers drain their queues before closing.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        for state in self.peers() {
            state.close();
        }
    }
}

async fn start_inbound(
    inner: Arc<EngineInner>,
    mut stream: TcpStream,
    shutdown: watch::Receiver<bool>,
) -> PeerResult<()> {
    let theirs = Handshake::accept(&mut stream, inner.info_hash, inner.peer_id).await?;
    register_connection(inner, stream, theirs.peer_id, shutdown)?;
    Ok(())
}

/// Registers a handshaken connection: shared state, peer-map entry, our bitfield
/// advertisement, and the two I/O tasks.
fn register_connection(
    inner: Arc<EngineInner>,
    stream: TcpStream,
    remote_peer_id: [u8; 20],
    shutdown: watch::Receiver<bool>,
) -> PeerResult<Arc<PeerState>> {
    let addr = stream.peer_addr()?;
    let (outbound_tx, outbound_rx) = mpsc::channel(inner.config.outbound_queue);
    let state = Arc::new(PeerState::new(addr, outbound_tx));
    state.set_peer_id(remote_peer_id);

    let id = inner.next_peer.fetch_add(1, Ordering::Relaxed);
    inner
        .peers
        .lock()
        .expect("peer map lock poisoned")
        .insert(id, state.clone());

    // advertise what we already hold; an empty bitfield is omitted
    if inner.pieces.verified_count() > 0 {
        state.try_send(Message::Bitfield(inner.pieces.piece_bitfield()));
    }

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(run_reader(
        inner.clone(),
        id,
        state.clone(),
        read_half,
        shutdown.clone(),
    ));
    tokio::spawn(run_writer(inner, state.clone(), write_half, outbound_rx, shutdown));
    Ok(state)
}

async fn run_reader(
    inner: Arc<EngineInner>,
    id: u64,
    state: Arc<PeerState>,
    read_half: OwnedReadHalf,
    shutdown: watch::Receiver<bool>,
) {
    let result = reader_loop(&inner, &state, read_half, shutdown).await;
    match &result {
        Ok(()) => tracing::debug!(addr = ?state.addr(), "Peer connection closed"),
        Err(e) => tracing::debug!(addr = ?state.addr(), error = %e, "Peer connection dropped"),
    }
    remove_peer(&inner, id, &state);
}

async fn reader_loop(
    inner: &Arc<EngineInner>,
    state: &Arc<PeerState>,
    mut read_half: OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
) -> PeerResult<()> {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut first_message = true;

    loop {
        while let Some(frame) = message::next_frame(&mut buf)? {
            let Some(parsed) = Message::parse(&frame)? else {
                // unknown id: dropped, stream continues
                continue;
            };
            state.touch();
            handle_message(inner, state, parsed, &mut first_message).await?;
        }

        if state.is_closed() {
            return Ok(());
        }

        tokio::select! {
            _ = state.close_signal.notified() => return Ok(()),
            _ = shutdown.changed() => return Ok(()),
            read = timeout(inner.config.keep_alive_timeout, read_half.read_buf(&mut buf)) => {
                match read {
                    Err(_elapsed) => return Err(PeerError::KeepAliveTimeout),
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(0)) => return Err(PeerError::ConnectionClosed),
                    Ok(Ok(_n)) => {}
                }
            }
        }
    }
}

async fn handle_message(
    inner: &Arc<EngineInner>,
    state: &Arc<PeerState>,
    parsed: Message,
    first_message: &mut bool,
) -> PeerResult<()> {
    if matches!(parsed, Message::Bitfield(_)) && !*first_message {
        return Err(PeerError::ProtocolViolation(
            "bitfield after first message".to_string(),
        ));
    }
    *first_message = false;

    match parsed {
        Message::KeepAlive => {}
        Message::Choke => {
            state.set_choked_by_peer(true);
            // requests in flight go back to the pool; they may be resent on unchoke
            let returned = state.take_outstanding();
            inner
                .picker
                .lock()
                .expect("picker lock poisoned")
                .release(&returned);
        }
        Message::Unchoke => {
            state.set_choked_by_peer(false);
            top_up_requests(inner, state);
        }
        Message::Interested => state.set_peer_interested(true),
        Message::NotInterested => state.set_peer_interested(false),
        Message::Have(index) => {
            let piece = index as usize;
            if piece >= inner.pieces.num_pieces() {
                return Err(PeerError::ProtocolViolation(format!(
                    "have for piece {} of {}",
                    piece,
                    inner.pieces.num_pieces()
                )));
            }
            state.mark_have(piece, inner.pieces.num_pieces());
            inner
                .picker
                .lock()
                .expect("picker lock poisoned")
                .add_have(piece);
            update_interest(inner, state);
            if !state.choked_by_peer() {
                top_up_requests(inner, state);
            }
        }
        Message::Bitfield(payload) => {
            let bits = Bitfield::from_payload(payload, inner.pieces.num_pieces())?;
            inner
                .picker
                .lock()
                .expect("picker lock poisoned")
                .add_bitfield(&bits);
            state.set_bitfield(bits);
            update_interest(inner, state);
        }
        Message::Request {
            index,
            begin,
            length,
        } => {
            if state.choked_by_us() {
                tracing::trace!(index, "Request from choked peer ignored");
                return Ok(());
            }
            let piece = index as usize;
            let serveable = length > 0
                && length as usize <= BLOCK_SIZE
                && piece < inner.pieces.num_pieces()
                && (begin as usize + length as usize) <= inner.pieces.piece_size(piece)
                && inner.pieces.is_verified(piece);
            if !serveable {
                tracing::trace!(index, begin, length, "Unserveable request ignored");
                return Ok(());
            }
            state.queue_upload(BlockRequest {
                piece: index,
                offset: begin,
                length,
            });
        }
        Message::Piece {
            index,
            begin,
            block,
        } => {
            if state.remove_outstanding(index, begin).is_none() {
                return Err(PeerError::ProtocolViolation(format!(
                    "piece ({}, {}) was never requested",
                    index, begin
                )));
            }
            inner
                .picker
                .lock()
                .expect("picker lock poisoned")
                .mark_received(index, begin);
            state.download.record(block.len());
            match inner.pieces.store_block(index as usize, begin as usize, &block) {
                Ok(_outcome) => {}
                Err(PieceError::DuplicateBlock { piece, offset }) => {
                    tracing::debug!(piece, offset, "Duplicate block dropped");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Block rejected");
                }
            }
            top_up_requests(inner, state);
        }
        Message::Cancel {
            index,
            begin,
            length,
        } => {
            state.cancel_upload(&BlockRequest {
                piece: index,
                offset: begin,
                length,
            });
        }
    }
    Ok(())
}

/// Recomputes whether we want blocks from this peer and tells it on a change.
fn update_interest(inner: &Arc<EngineInner>, state: &Arc<PeerState>) {
    let Some(bits) = state.bitfield_snapshot() else {
        return;
    };
    let interested = bits
        .pieces()
        .into_iter()
        .any(|piece| !inner.pieces.is_verified(piece));
    if interested != state.we_interested() {
        state.set_we_interested(interested);
        state.try_send(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        });
    }
}

/// Fills the request pipeline toward `max_outstanding`, honoring choke state and
/// outbound backpressure.
fn top_up_requests(inner: &Arc<EngineInner>, state: &Arc<PeerState>) {
    if state.choked_by_peer() || state.is_closed() {
        return;
    }
    let Some(bits) = state.bitfield_snapshot() else {
        return;
    };
    let capacity = inner
        .config
        .max_outstanding
        .saturating_sub(state.outstanding_len());
    if capacity == 0 {
        return;
    }
    let requests = inner
        .picker
        .lock()
        .expect("picker lock poisoned")
        .next_requests(&bits, &inner.pieces, capacity);
    for request in requests {
        state.add_outstanding(request);
        let sent = state.try_send(Message::Request {
            index: request.piece,
            begin: request.offset,
            length: request.length,
        });
        if !sent {
            // outbound queue full: stop enqueuing, hand the block back
            state.remove_outstanding(request.piece, request.offset);
            inner
                .picker
                .lock()
                .expect("picker lock poisoned")
                .release(&[request]);
            break;
        }
    }
}

async fn run_writer(
    inner: Arc<EngineInner>,
    state: Arc<PeerState>,
    write_half: OwnedWriteHalf,
    outbound_rx: mpsc::Receiver<Message>,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = writer_loop(&inner, &state, write_half, outbound_rx, shutdown).await {
        tracing::debug!(addr = ?state.addr(), error = %e, "Writer stopped");
    }
    state.close();
}

async fn writer_loop(
    inner: &Arc<EngineInner>,
    state: &Arc<PeerState>,
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) -> PeerResult<()> {
    let mut keepalive = interval(inner.config.keep_alive_interval);
    keepalive.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            queued = outbound_rx.recv() => match queued {
                Some(outgoing) => write_half.write_all(&outgoing.encode()).await?,
                None => return Ok(()),
            },
            _ = state.upload_signal.notified() => {
                serve_uploads(inner, state, &mut write_half).await?;
            }
            _ = keepalive.tick() => {
                write_half.write_all(&Message::KeepAlive.encode()).await?;
            }
            _ = state.close_signal.notified() => {
                return drain_and_stop(&mut outbound_rx, &mut write_half).await;
            }
            _ = shutdown.changed() => {
                return drain_and_stop(&mut outbound_rx, &mut write_half).await;
            }
        }
        if state.is_closed() {
            return drain_and_stop(&mut outbound_rx, &mut write_half).await;
        }
    }
}

/// Shutdown grace: flush whatever is already queued, then let the socket close.
async fn drain_and_stop(
    outbound_rx: &mut mpsc::Receiver<Message>,
    write_half: &mut OwnedWriteHalf,
) -> PeerResult<()> {
    while let Ok(outgoing) = outbound_rx.try_recv() {
        write_half.write_all(&outgoing.encode()).await?;
    }
    write_half.flush().await?;
    Ok(())
}

/// Serves queued upload requests in arrival order, skipping any the choke state no
/// longer allows.
async fn serve_uploads(
    inner: &Arc<EngineInner>,
    state: &Arc<PeerState>,
    write_half: &mut OwnedWriteHalf,
) -> PeerResult<()> {
    while let Some(request) = state.pop_upload() {
        if state.choked_by_us() {
            continue;
        }
        match inner.pieces.get_block(
            request.piece as usize,
            request.offset as usize,
            request.length as usize,
        ) {
            Ok(block) => {
                let bytes = block.len();
                write_half
                    .write_all(
                        &Message::Piece {
                            index: request.piece,
                            begin: request.offset,
                            block,
                        }
                        .encode(),
                    )
                    .await?;
                state.upload.record(bytes);
            }
            Err(e) => {
                tracing::debug!(piece = request.piece, error = %e, "Upload request dropped");
            }
        }
    }
    Ok(())
}

/// Tears a connection out of the engine: peer map, availability counts, and any
/// outstanding requests go back to the scheduler's pool.
fn remove_peer(inner: &Arc<EngineInner>, id: u64, state: &Arc<PeerState>) {
    state.close();
    inner
        .peers
        .lock()
        .expect("peer map lock poisoned")
        .remove(&id);
    let outstanding = state.take_outstanding();
    let mut picker = inner.picker.lock().expect("picker lock poisoned");
    picker.release(&outstanding);
    if let Some(bits) = state.bitfield_snapshot() {
        picker.remove_bitfield(&bits);
    }
}

/// The tit-for-tat core: which peers stay unchoked this interval.
///
/// `peers` carries (id, download rate, peer_interested). The top `slots` interested
/// peers by rate win a slot; the optimistic pick, when present, is added on top.
fn select_unchoked(
    peers: &[(u64, u64, bool)],
    optimistic: Option<u64>,
    slots: usize,
) -> HashSet<u64> {
    let mut ranked: Vec<&(u64, u64, bool)> =
        peers.iter().filter(|(_, _, interested)| *interested).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut unchoked: HashSet<u64> = ranked.iter().take(slots).map(|(id, _, _)| *id).collect();
    if let Some(id) = optimistic {
        unchoked.insert(id);
    }
    unchoked
}

async fn choking_loop(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(inner.config.choke_interval);
    let optimistic_every = (inner.config.optimistic_interval.as_millis()
        / inner.config.choke_interval.as_millis().max(1))
    .max(1) as u64;
    let mut rounds: u64 = 0;
    let mut optimistic: Option<u64> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tick.tick() => {}
        }
        rounds += 1;

        let snapshot: Vec<(u64, Arc<PeerState>)> = inner
            .peers
            .lock()
            .expect("peer map lock poisoned")
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect();

        // roll every rate window, whether or not the peer is interesting
        let mut rated: Vec<(u64, u64, bool)> = Vec::with_capacity(snapshot.len());
        for (id, state) in &snapshot {
            let rate = state.download.tick(inner.config.choke_interval);
            state.upload.tick(inner.config.choke_interval);
            rated.push((*id, rate, state.peer_interested()));
        }

        // the optimistic slot rotates on its own cycle and overrides tit-for-tat
        if rounds % optimistic_every == 0 {
            let winners = select_unchoked(&rated, None, UNCHOKE_SLOTS);
            let candidates: Vec<u64> = snapshot
                .iter()
                .filter(|(id, state)| {
                    state.peer_interested()
                        && state.choked_by_us()
                        && !winners.contains(id)
                })
                .map(|(id, _)| *id)
                .collect();
            optimistic = if candidates.is_empty() {
                None
            } else {
                Some(candidates[rand::rng().random_range(0..candidates.len())])
            };
        }
        // drop the slot if that peer left
        if let Some(id) = optimistic {
            if !snapshot.iter().any(|(other, _)| *other == id) {
                optimistic = None;
            }
        }

        let unchoked = select_unchoked(&rated, optimistic, UNCHOKE_SLOTS);
        for (id, state) in &snapshot {
            let should_unchoke = unchoked.contains(id);
            if should_unchoke && state.choked_by_us() {
                state.set_choked_by_us(false);
                if !state.try_send(Message::Unchoke) {
                    // full outbound queue: flag must keep matching what the peer saw
                    state.set_choked_by_us(true);
                }
            } else if !should_unchoke && !state.choked_by_us() {
                state.set_choked_by_us(true);
                state.clear_uploads();
                if !state.try_send(Message::Choke) {
                    state.set_choked_by_us(false);
                }
            }
        }
    }
}

/// Reacts to piece verification outcomes: broadcast `have` on success, rearm the
/// request pipeline after a corruption reset.
async fn event_loop(
    inner: Arc<EngineInner>,
    mut events: mpsc::UnboundedReceiver<PieceEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            event = events.recv() => {
                let Some(event) = event else { return };
                let snapshot: Vec<Arc<PeerState>> = inner
                    .peers
                    .lock()
                    .expect("peer map lock poisoned")
                    .values()
                    .cloned()
                    .collect();
                match event {
                    PieceEvent::Verified { piece } => {
                        tracing::debug!(piece, "Broadcasting have");
                        for state in &snapshot {
                            state.try_send(Message::Have(piece as u32));
                            update_interest(&inner, state);
                        }
                    }
                    PieceEvent::Corrupt { piece } => {
                        tracing::warn!(piece, "Piece corrupt, re-requesting its blocks");
                        for state in &snapshot {
                            top_up_requests(&inner, state);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    fn test_config() -> EngineConfig {
        EngineConfig {
            listen_port: 0,
            choke_interval: Duration::from_millis(50),
            optimistic_interval: Duration::from_millis(150),
            ..EngineConfig::default()
        }
    }

    fn piece_contents(num_pieces: usize, piece_len: usize) -> Vec<Vec<u8>> {
        (0..num_pieces)
            .map(|piece| {
                (0..piece_len)
                    .map(|i| (i as u8).wrapping_mul(31).wrapping_add(piece as u8))
                    .collect()
            })
            .collect()
    }

    fn build_engine(
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        contents: &[Vec<u8>],
        piece_len: usize,
        seeded: bool,
    ) -> (Engine, Arc<PieceManager>) {
        let hashes: Vec<[u8; 20]> = contents.iter().map(|c| Sha1::digest(c).into()).collect();
        let total: u64 = contents.iter().map(|c| c.len() as u64).sum();
        let (manager, events) = PieceManager::in_memory(hashes, piece_len, total);
        if seeded {
            for (piece, content) in contents.iter().enumerate() {
                for (block, chunk) in content.chunks(BLOCK_SIZE).enumerate() {
                    manager.store_block(piece, block * BLOCK_SIZE, chunk).unwrap();
                }
                assert!(manager.is_verified(piece));
            }
        }
        let pieces = Arc::new(manager);
        let engine = Engine::new(info_hash, peer_id, pieces.clone(), events, test_config());
        (engine, pieces)
    }

    fn loopback(addr: SocketAddr) -> SocketAddr {
        format!("127.0.0.1:{}", addr.port()).parse().unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn engines_handshake_and_register_each_other() {
        let contents = piece_contents(2, 2 * BLOCK_SIZE);
        let info_hash = [0x55u8; 20];
        let (a, _) = build_engine(info_hash, [0xaa; 20], &contents, 2 * BLOCK_SIZE, false);
        let (b, _) = build_engine(info_hash, [0xbb; 20], &contents, 2 * BLOCK_SIZE, false);

        let a_addr = a.listen().await.unwrap();
        let state = b.connect(loopback(a_addr)).await.unwrap();
        assert_eq!(state.peer_id(), Some([0xaa; 20]));

        wait_until(|| a.num_peers() == 1, "listener to register the peer").await;
        assert_eq!(b.num_peers(), 1);
        let seen = &a.peers()[0];
        assert_eq!(seen.peer_id(), Some([0xbb; 20]));

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn mismatched_info_hash_closes_both_sides() {
        let contents = piece_contents(1, BLOCK_SIZE);
        let (a, _) = build_engine([0x01; 20], [0xaa; 20], &contents, BLOCK_SIZE, false);
        let (b, _) = build_engine([0x02; 20], [0xbb; 20], &contents, BLOCK_SIZE, false);

        let a_addr = a.listen().await.unwrap();
        let result = b.connect(loopback(a_addr)).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(a.num_peers(), 0);
        assert_eq!(b.num_peers(), 0);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn leecher_downloads_everything_from_seeder() {
        let piece_len = 2 * BLOCK_SIZE;
        let contents = piece_contents(3, piece_len);
        let info_hash = [0x77u8; 20];
        let (seeder, _seeder_pieces) =
            build_engine(info_hash, [0x5e; 20], &contents, piece_len, true);
        let (leecher, leecher_pieces) =
            build_engine(info_hash, [0x1e; 20], &contents, piece_len, false);

        let seeder_addr = seeder.listen().await.unwrap();
        leecher.connect(loopback(seeder_addr)).await.unwrap();

        wait_until(|| leecher_pieces.is_complete(), "the download to finish").await;
        assert_eq!(leecher_pieces.verified_count(), 3);
        assert_eq!(leecher_pieces.bytes_left(), 0);

        // the seeder saw interest and unchoked us at some point
        wait_until(|| seeder.num_peers() == 1, "seeder peer registration").await;
        let served = &seeder.peers()[0];
        assert!(served.upload.total() >= (3 * piece_len) as u64);

        seeder.shutdown();
        leecher.shutdown();
    }

    #[tokio::test]
    async fn completed_leecher_reports_not_interested() {
        let piece_len = BLOCK_SIZE;
        let contents = piece_contents(1, piece_len);
        let info_hash = [0x78u8; 20];
        let (seeder, _) = build_engine(info_hash, [0x5e; 20], &contents, piece_len, true);
        let (leecher, leecher_pieces) =
            build_engine(info_hash, [0x1e; 20], &contents, piece_len, false);

        let seeder_addr = seeder.listen().await.unwrap();
        let state = leecher.connect(loopback(seeder_addr)).await.unwrap();

        wait_until(|| leecher_pieces.is_complete(), "the download to finish").await;
        wait_until(|| !state.we_interested(), "interest to clear").await;

        seeder.shutdown();
        leecher.shutdown();
    }

    #[test]
    fn tit_for_tat_selects_top_rates_among_interested() {
        // three interested peers at {10, 5, 0} MB/s plus one fast non-interested peer
        let peers = vec![
            (1u64, 10_000_000u64, true),
            (2, 5_000_000, true),
            (3, 0, true),
            (4, 99_000_000, false),
        ];
        let unchoked = select_unchoked(&peers, None, UNCHOKE_SLOTS);
        // top-4 rule caps at four, so every interested peer wins a slot
        assert_eq!(unchoked, HashSet::from([1, 2, 3]));
        assert!(!unchoked.contains(&4));
    }

    #[test]
    fn tit_for_tat_caps_at_four_slots() {
        let peers: Vec<(u64, u64, bool)> =
            (0..6).map(|id| (id, 1000 - id * 100, true)).collect();
        let unchoked = select_unchoked(&peers, None, UNCHOKE_SLOTS);
        assert_eq!(unchoked, HashSet::from([0, 1, 2, 3]));
    }

    #[test]
    fn optimistic_slot_overrides_the_rate_ranking() {
        let peers = vec![(1u64, 100u64, true), (2, 50, true), (3, 0, true)];
        let unchoked = select_unchoked(&peers, Some(3), 2);
        assert_eq!(unchoked, HashSet::from([1, 2, 3]));
    }
}
