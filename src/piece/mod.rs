//! Piece assembly and verification.
//!
//! Blocks arrive out of order from many peer tasks at once; the manager buffers them
//! per piece, counts receipt, and hash-checks a piece the moment its last block lands.
//! Verified pieces are flushed to the [`PieceStore`] and served back out of it; a piece
//! that fails its hash is discarded whole and rearmed for re-request.
use sha1::{Digest, Sha1};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::instrument;

pub mod store;
pub use store::{MemoryStore, PieceStore};

/// Canonical transfer block size: the unit of `request`/`piece` exchange.
pub const BLOCK_SIZE: usize = 16_384;

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("Piece index {0} out of range")]
    IndexOutOfRange(usize),

    #[error("Offset {offset} is not block-aligned (piece {piece})")]
    UnalignedOffset { piece: usize, offset: usize },

    #[error("Block of {length} bytes at offset {offset} does not fit piece {piece}")]
    BlockOutOfBounds {
        piece: usize,
        offset: usize,
        length: usize,
    },

    #[error("Unexpected block length {length} at offset {offset} of piece {piece}")]
    WrongBlockLength {
        piece: usize,
        offset: usize,
        length: usize,
    },

    #[error("Duplicate block at offset {offset} of piece {piece}")]
    DuplicateBlock { piece: usize, offset: usize },

    #[error("Piece {0} is not verified")]
    NotVerified(usize),

    #[error("Storage error: {0}")]
    Store(#[from] std::io::Error),
}

pub type PieceResult<T> = std::result::Result<T, PieceError>;

/// Lifecycle of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    Partial,
    /// All blocks received, hash check in progress.
    PendingVerify,
    Verified,
}

/// What a successful `store_block` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Block buffered; the piece is still incomplete.
    Stored,
    /// The block completed the piece and the hash matched.
    Verified,
    /// The block completed the piece but the hash did not match; the piece was
    /// reset to missing and every block must be fetched again.
    HashMismatch,
}

/// Completion/corruption notifications, consumed by the peer engine to broadcast
/// `have` messages and to rearm the picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceEvent {
    Verified { piece: usize },
    Corrupt { piece: usize },
}

#[derive(Debug)]
struct PieceState {
    buffer: Vec<u8>,
    received: Vec<bool>,
    received_count: usize,
    status: PieceStatus,
}

impl PieceState {
    fn empty(block_count: usize) -> Self {
        PieceState {
            buffer: Vec::new(),
            received: vec![false; block_count],
            received_count: 0,
            status: PieceStatus::Missing,
        }
    }

    fn reset(&mut self) {
        self.buffer = Vec::new();
        self.received.iter_mut().for_each(|b| *b = false);
        self.received_count = 0;
        self.status = PieceStatus::Missing;
    }
}

/// Tracks per-piece block receipt and hash verification for one torrent.
///
/// All state transitions are serialized per piece; any peer task may call
/// `store_block`/`get_block` concurrently.
pub struct PieceManager {
    piece_length: usize,
    total_length: u64,
    hashes: Vec<[u8; 20]>,
    states: Vec<Mutex<PieceState>>,
    verified: Mutex<Vec<bool>>,
    store: Box<dyn PieceStore>,
    events: mpsc::UnboundedSender<PieceEvent>,
}

impl PieceManager {
    /// Builds a manager for `hashes.len()` pieces of `piece_length` bytes each (last
    /// piece truncated to fit `total_length`). Returns the manager and the event
    /// stream of verification outcomes.
    pub fn new(
        hashes: Vec<[u8; 20]>,
        piece_length: usize,
        total_length: u64,
        store: Box<dyn PieceStore>,
    ) -> (Self, mpsc::UnboundedReceiver<PieceEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let num_pieces = hashes.len();
        let mut states = Vec::with_capacity(num_pieces);
        for piece in 0..num_pieces {
            let size = piece_size_of(piece, num_pieces, piece_length, total_length);
            states.push(Mutex::new(PieceState::empty(size.div_ceil(BLOCK_SIZE))));
        }
        let manager = PieceManager {
            piece_length,
            total_length,
            hashes,
            states,
            verified: Mutex::new(vec![false; num_pieces]),
            store,
            events,
        };
        (manager, events_rx)
    }

    /// Convenience constructor backed by an in-memory store.
    pub fn in_memory(
        hashes: Vec<[u8; 20]>,
        piece_length: usize,
        total_length: u64,
    ) -> (Self, mpsc::UnboundedReceiver<PieceEvent>) {
        let num_pieces = hashes.len();
        let sizes: Vec<usize> = (0..num_pieces)
            .map(|piece| piece_size_of(piece, num_pieces, piece_length, total_length))
            .collect();
        Self::new(
            hashes,
            piece_length,
            total_length,
            Box::new(MemoryStore::new(&sizes)),
        )
    }

    pub fn num_pieces(&self) -> usize {
        self.hashes.len()
    }

    /// The byte length of piece `piece`; every piece is `piece_length` except the last.
    pub fn piece_size(&self, piece: usize) -> usize {
        piece_size_of(
            piece,
            self.hashes.len(),
            self.piece_length,
            self.total_length,
        )
    }

    /// The number of blocks in piece `piece`.
    pub fn block_count(&self, piece: usize) -> usize {
        self.piece_size(piece).div_ceil(BLOCK_SIZE)
    }

    /// The expected byte length of the block at `offset` within `piece`; shorter than
    /// `BLOCK_SIZE` only for the final block of the final piece.
    pub fn block_size(&self, piece: usize, offset: usize) -> usize {
        (self.piece_size(piece) - offset).min(BLOCK_SIZE)
    }

    /// Buffers one received block.
    ///
    /// Validates index, alignment, bounds and exact block length; duplicate deliveries
    /// of the same `(piece, offset)` are rejected. When the final block lands, the
    /// piece is hashed: on a match it is flushed to the store and marked verified; on
    /// a mismatch the whole piece is discarded and rearmed.
    #[instrument(skip(self, data), level = "trace")]
    pub fn store_block(&self, piece: usize, offset: usize, data: &[u8]) -> PieceResult<StoreOutcome> {
        if piece >= self.num_pieces() {
            return Err(PieceError::IndexOutOfRange(piece));
        }
        let size = self.piece_size(piece);
        if offset % BLOCK_SIZE != 0 {
            return Err(PieceError::UnalignedOffset { piece, offset });
        }
        if offset + data.len() > size {
            return Err(PieceError::BlockOutOfBounds {
                piece,
                offset,
                length: data.len(),
            });
        }
        if data.len() != self.block_size(piece, offset) {
            return Err(PieceError::WrongBlockLength {
                piece,
                offset,
                length: data.len(),
            });
        }

        let block = offset / BLOCK_SIZE;
        let mut state = self.states[piece].lock().expect("piece lock poisoned");

        if state.status == PieceStatus::Verified || state.received[block] {
            return Err(PieceError::DuplicateBlock { piece, offset });
        }

        if state.buffer.is_empty() {
            state.buffer = vec![0u8; size];
        }
        state.buffer[offset..offset + data.len()].copy_from_slice(data);
        state.received[block] = true;
        state.received_count += 1;
        state.status = PieceStatus::Partial;

        if state.received_count < state.received.len() {
            return Ok(StoreOutcome::Stored);
        }

        // last block landed: verify under the piece lock
        state.status = PieceStatus::PendingVerify;
        let digest: [u8; 20] = Sha1::digest(&state.buffer).into();
        if digest != self.hashes[piece] {
            tracing::warn!(piece, "Piece failed hash check, discarding");
            state.reset();
            let _ = self.events.send(PieceEvent::Corrupt { piece });
            return Ok(StoreOutcome::HashMismatch);
        }

        self.store.write(piece, 0, &state.buffer)?;
        state.buffer = Vec::new();
        state.status = PieceStatus::Verified;
        drop(state);

        self.verified.lock().expect("verified lock poisoned")[piece] = true;
        tracing::debug!(piece, "Piece verified");
        let _ = self.events.send(PieceEvent::Verified { piece });
        Ok(StoreOutcome::Verified)
    }

    /// Reads a block back for upload. Only verified pieces are served; a request
    /// against anything else answers `NotVerified`.
    pub fn get_block(&self, piece: usize, offset: usize, length: usize) -> PieceResult<Vec<u8>> {
        if piece >= self.num_pieces() {
            return Err(PieceError::IndexOutOfRange(piece));
        }
        if offset + length > self.piece_size(piece) {
            return Err(PieceError::BlockOutOfBounds {
                piece,
                offset,
                length,
            });
        }
        if !self.is_verified(piece) {
            return Err(PieceError::NotVerified(piece));
        }
        Ok(self.store.read(piece, offset, length)?)
    }

    pub fn status(&self, piece: usize) -> PieceResult<PieceStatus> {
        let state = self
            .states
            .get(piece)
            .ok_or(PieceError::IndexOutOfRange(piece))?
            .lock()
            .expect("piece lock poisoned");
        Ok(state.status)
    }

    pub fn is_verified(&self, piece: usize) -> bool {
        self.verified
            .lock()
            .expect("verified lock poisoned")
            .get(piece)
            .copied()
            .unwrap_or(false)
    }

    pub fn verified_count(&self) -> usize {
        self.verified
            .lock()
            .expect("verified lock poisoned")
            .iter()
            .filter(|&&v| v)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count() == self.num_pieces()
    }

    /// Bytes still missing, as reported to trackers in the `left` parameter.
    pub fn bytes_left(&self) -> u64 {
        let verified = self.verified.lock().expect("verified lock poisoned");
        let mut left = self.total_length;
        for (piece, &ok) in verified.iter().enumerate() {
            if ok {
                left -= self.piece_size(piece) as u64;
            }
        }
        left
    }

    /// The n-bit MSB-first packed bitmap of verified pieces, byte-padded with zero
    /// tail bits, ready to send as a `bitfield` message.
    pub fn piece_bitfield(&self) -> Vec<u8> {
        let verified = self.verified.lock().expect("verified lock poisoned");
        let mut packed = vec![0u8; self.num_pieces().div_ceil(8)];
        for (piece, &ok) in verified.iter().enumerate() {
            if ok {
                packed[piece / 8] |= 1 << (7 - piece % 8);
            }
        }
        packed
    }

    /// The `(offset, length)` pairs of blocks not yet received for `piece`.
    /// Empty for verified pieces.
    pub fn missing_blocks(&self, piece: usize) -> Vec<(u32, u32)> {
        let Some(state) = self.states.get(piece) else {
            return Vec::new();
        };
        let state = state.lock().expect("piece lock poisoned");
        if state.status == PieceStatus::Verified {
            return Vec::new();
        }
        state
            .received
            .iter()
            .enumerate()
            .filter(|(_, &received)| !received)
            .map(|(block, _)| {
                let offset = block * BLOCK_SIZE;
                (offset as u32, self.block_size(piece, offset) as u32)
            })
            .collect()
    }
}

fn piece_size_of(piece: usize, num_pieces: usize, piece_length: usize, total_length: u64) -> usize {
    if piece + 1 < num_pieces {
        piece_length
    } else {
        let full = (num_pieces.saturating_sub(1)) as u64 * piece_length as u64;
        (total_length - full) as usize
    }
}
