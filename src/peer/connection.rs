//! Shared per-connection state.
//!
//! Each peer connection is driven by a reader task and a writer task; everything both
//! tasks (and the engine-wide choking controller) need to see lives here behind
//! atomics or short-lived mutexes. The four choke/interest flags are single-word
//! atomics with release/acquire ordering: message handlers write them, the choking
//! controller only reads.
use super::bitfield::Bitfield;
use super::message::Message;
use super::rate::RateCounter;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// A block request on the wire, in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

pub struct PeerState {
    addr: SocketAddr,
    /// Remote peer id, set once the handshake completes.
    peer_id: OnceLock<[u8; 20]>,

    choked_by_peer: AtomicBool,
    choked_by_us: AtomicBool,
    peer_interested: AtomicBool,
    we_interested: AtomicBool,

    /// The peer's advertised pieces; absent until a `bitfield` or first `have` arrives.
    bitfield: Mutex<Option<Bitfield>>,

    pub download: RateCounter,
    pub upload: RateCounter,
    last_activity: Mutex<Instant>,

    /// Outbound message queue drained by the writer task. Bounded: a full queue is
    /// the backpressure signal that stops request top-up for this peer.
    outbound: mpsc::Sender<Message>,

    /// Our in-flight `request`s to this peer.
    outstanding: Mutex<HashSet<BlockRequest>>,

    /// The peer's pending `request`s to us, served by the writer task.
    upload_queue: Mutex<VecDeque<BlockRequest>>,
    pub(super) upload_signal: Notify,

    closed: AtomicBool,
    pub(super) close_signal: Notify,
}

impl PeerState {
    pub fn new(addr: SocketAddr, outbound: mpsc::Sender<Message>) -> Self {
        PeerState {
            addr,
            peer_id: OnceLock::new(),
            // both directions start choked, neither side interested
            choked_by_peer: AtomicBool::new(true),
            choked_by_us: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            we_interested: AtomicBool::new(false),
            bitfield: Mutex::new(None),
            download: RateCounter::new(),
            upload: RateCounter::new(),
            last_activity: Mutex::new(Instant::now()),
            outbound,
            outstanding: Mutex::new(HashSet::new()),
            upload_queue: Mutex::new(VecDeque::new()),
            upload_signal: Notify::new(),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_peer_id(&self, id: [u8; 20]) {
        let _ = self.peer_id.set(id);
    }

    pub fn peer_id(&self) -> Option<[u8; 20]> {
        self.peer_id.get().copied()
    }

    pub fn choked_by_peer(&self) -> bool {
        self.choked_by_peer.load(Ordering::Acquire)
    }

    pub fn set_choked_by_peer(&self, choked: bool) {
        self.choked_by_peer.store(choked, Ordering::Release);
    }

    pub fn choked_by_us(&self) -> bool {
        self.choked_by_us.load(Ordering::Acquire)
    }

    pub fn set_choked_by_us(&self, choked: bool) {
        self.choked_by_us.store(choked, Ordering::Release);
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::Acquire)
    }

    pub fn set_peer_interested(&self, interested: bool) {
        self.peer_interested.store(interested, Ordering::Release);
    }

    pub fn we_interested(&self) -> bool {
        self.we_interested.load(Ordering::Acquire)
    }

    pub fn set_we_interested(&self, interested: bool) {
        self.we_interested.store(interested, Ordering::Release);
    }

    /// Replaces the peer's advertised bitmap (from a `bitfield` message).
    pub fn set_bitfield(&self, bitfield: Bitfield) {
        *self.bitfield.lock().expect("bitfield lock poisoned") = Some(bitfield);
    }

    /// Marks one piece as advertised (from a `have` message), materializing an empty
    /// bitmap for peers that never sent `bitfield`.
    pub fn mark_have(&self, piece: usize, num_pieces: usize) {
        let mut guard = self.bitfield.lock().expect("bitfield lock poisoned");
        guard
            .get_or_insert_with(|| Bitfield::new(num_pieces))
            .set(piece);
    }

    pub fn bitfield_snapshot(&self) -> Option<Bitfield> {
        self.bitfield
            .lock()
            .expect("bitfield lock poisoned")
            .clone()
    }

    pub fn peer_has(&self, piece: usize) -> bool {
        self.bitfield
            .lock()
            .expect("bitfield lock poisoned")
            .as_ref()
            .is_some_and(|b| b.has(piece))
    }

    /// Stamps the activity clock; called on every received message.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }

    /// Queues a message without blocking. `false` means the outbound queue is full
    /// (backpressure) or the writer is gone; the caller decides whether that is fatal.
    pub fn try_send(&self, message: Message) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    /// Queues a message, waiting for space. Errors once the writer has stopped.
    pub async fn send(&self, message: Message) -> bool {
        self.outbound.send(message).await.is_ok()
    }

    // --- our requests to the peer ---

    /// Tracks a request we are about to send. `false` if it was already in flight.
    pub fn add_outstanding(&self, request: BlockRequest) -> bool {
        self.outstanding
            .lock()
            .expect("outstanding lock poisoned")
            .insert(request)
    }

    /// Clears a request once its block arrived. Matches on (piece, offset).
    pub fn remove_outstanding(&self, piece: u32, offset: u32) -> Option<BlockRequest> {
        let mut outstanding = self.outstanding.lock().expect("outstanding lock poisoned");
        let found = outstanding
            .iter()
            .find(|r| r.piece == piece && r.offset == offset)
            .copied();
        if let Some(request) = found {
            outstanding.remove(&request);
        }
        found
    }

    /// Drains every in-flight request, e.g. on `choke` or close, so the scheduler can
    /// hand the blocks to another peer.
    pub fn take_outstanding(&self) -> Vec<BlockRequest> {
        self.outstanding
            .lock()
            .expect("outstanding lock poisoned")
            .drain()
            .collect()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding
            .lock()
            .expect("outstanding lock poisoned")
            .len()
    }

    // --- the peer's requests to us ---

    /// Appends an upload request and wakes the writer.
    pub fn queue_upload(&self, request: BlockRequest) {
        self.upload_queue
            .lock()
            .expect("upload queue lock poisoned")
            .push_back(request);
        self.upload_signal.notify_one();
    }

    /// Honors a `cancel`: removes a matching request that has not been served yet.
    pub fn cancel_upload(&self, request: &BlockRequest) -> bool {
        let mut queue = self.upload_queue.lock().expect("upload queue lock poisoned");
        if let Some(position) = queue.iter().position(|r| r == request) {
            queue.remove(position);
            true
        } else {
            false
        }
    }

    pub fn pop_upload(&self) -> Option<BlockRequest> {
        self.upload_queue
            .lock()
            .expect("upload queue lock poisoned")
            .pop_front()
    }

    /// Drops all pending uploads, used when we choke the peer.
    pub fn clear_uploads(&self) {
        self.upload_queue
            .lock()
            .expect("upload queue lock poisoned")
            .clear();
    }

    // --- lifecycle ---

    /// Marks the connection closed and wakes both I/O tasks. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_signal.notify_waiters();
        self.upload_signal.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerState")
            .field("addr", &self.addr)
            .field("peer_id", &self.peer_id.get().map(hex::encode))
            .field("choked_by_peer", &self.choked_by_peer())
            .field("choked_by_us", &self.choked_by_us())
            .field("peer_interested", &self.peer_interested())
            .field("we_interested", &self.we_interested())
            .field("outstanding", &self.outstanding_len())
            .finish()
    }
}
