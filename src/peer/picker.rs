//! Piece selection policy.
//!
//! The picker decides which blocks to request next from a given peer. Pieces that are
//! already partially downloaded take strict priority (finish what is started); among
//! the rest, pieces advertised by the fewest peers come first (rarest-first). Blocks
//! already requested from some peer are excluded until they are received or released.
use super::bitfield::Bitfield;
use super::connection::BlockRequest;
use crate::piece::{PieceManager, PieceStatus};
use std::collections::HashSet;

pub struct PiecePicker {
    num_pieces: usize,
    /// How many connected peers advertise each piece.
    availability: Vec<u32>,
    /// Blocks currently requested from some peer: (piece, offset).
    pending: HashSet<(u32, u32)>,
}

impl PiecePicker {
    pub fn new(num_pieces: usize) -> Self {
        PiecePicker {
            num_pieces,
            availability: vec![0; num_pieces],
            pending: HashSet::new(),
        }
    }

    /// Folds a newly arrived peer bitfield into the availability counts.
    pub fn add_bitfield(&mut self, bitfield: &Bitfield) {
        for piece in bitfield.pieces() {
            if let Some(count) = self.availability.get_mut(piece) {
                *count += 1;
            }
        }
    }

    /// Reverses `add_bitfield` when a peer disconnects.
    pub fn remove_bitfield(&mut self, bitfield: &Bitfield) {
        for piece in bitfield.pieces() {
            if let Some(count) = self.availability.get_mut(piece) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Counts one more peer advertising `piece` (from a `have` message).
    pub fn add_have(&mut self, piece: usize) {
        if let Some(count) = self.availability.get_mut(piece) {
            *count += 1;
        }
    }

    pub fn availability(&self, piece: usize) -> u32 {
        self.availability.get(piece).copied().unwrap_or(0)
    }

    /// Picks up to `limit` distinct blocks to request from a peer advertising
    /// `peer_bits`. Picked blocks are marked in flight.
    pub fn next_requests(
        &mut self,
        peer_bits: &Bitfield,
        pieces: &PieceManager,
        limit: usize,
    ) -> Vec<BlockRequest> {
        if limit == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<usize> = (0..self.num_pieces)
            .filter(|&piece| peer_bits.has(piece) && !pieces.is_verified(piece))
            .collect();
        // partial pieces first, then rarest, index as the tie-breaker
        candidates.sort_by_key(|&piece| {
            let partial = matches!(pieces.status(piece), Ok(PieceStatus::Partial));
            (!partial, self.availability[piece], piece)
        });

        let mut requests = Vec::with_capacity(limit);
        'outer: for piece in candidates {
            for (offset, length) in pieces.missing_blocks(piece) {
                let key = (piece as u32, offset);
                if self.pending.contains(&key) {
                    continue;
                }
                self.pending.insert(key);
                requests.push(BlockRequest {
                    piece: piece as u32,
                    offset,
                    length,
                });
                if requests.len() == limit {
                    break 'outer;
                }
            }
        }
        requests
    }

    /// Returns in-flight blocks to the candidate pool, e.g. when the peer that held
    /// them choked us or went away.
    pub fn release(&mut self, requests: &[BlockRequest]) {
        for request in requests {
            self.pending.remove(&(request.piece, request.offset));
        }
    }

    /// Clears the in-flight mark once a block has been received and buffered.
    pub fn mark_received(&mut self, piece: u32, offset: u32) {
        self.pending.remove(&(piece, offset));
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::BLOCK_SIZE;
    use sha1::{Digest, Sha1};

    fn manager(num_pieces: usize) -> PieceManager {
        let contents: Vec<Vec<u8>> = (0..num_pieces)
            .map(|i| vec![i as u8; 2 * BLOCK_SIZE])
            .collect();
        let hashes = contents.iter().map(|c| Sha1::digest(c).into()).collect();
        let total = (num_pieces * 2 * BLOCK_SIZE) as u64;
        PieceManager::in_memory(hashes, 2 * BLOCK_SIZE, total).0
    }

    fn full_bitfield(num_pieces: usize) -> Bitfield {
        let mut bits = Bitfield::new(num_pieces);
        for piece in 0..num_pieces {
            bits.set(piece);
        }
        bits
    }

    #[test]
    fn prefers_rarest_piece() {
        let pieces = manager(3);
        let mut picker = PiecePicker::new(3);
        // piece 0 on two peers, piece 1 on one, piece 2 on three
        let mut seen = Bitfield::new(3);
        seen.set(0);
        picker.add_bitfield(&seen);
        picker.add_bitfield(&full_bitfield(3));
        picker.add_bitfield(&full_bitfield(3));
        picker.add_have(2);

        let requests = picker.next_requests(&full_bitfield(3), &pieces, 2);
        assert_eq!(requests.len(), 2);
        // piece 1 is rarest (availability 2 vs 3 and 4)
        assert!(requests.iter().all(|r| r.piece == 1));
    }

    #[test]
    fn partial_piece_takes_priority_over_rarity() {
        let pieces = manager(2);
        let mut picker = PiecePicker::new(2);
        // piece 1 is rarer...
        let mut only_zero = Bitfield::new(2);
        only_zero.set(0);
        picker.add_bitfield(&only_zero);
        picker.add_bitfield(&full_bitfield(2));
        picker.add_bitfield(&full_bitfield(2));

        // ...but piece 0 is already partially downloaded
        pieces
            .store_block(0, 0, &vec![0u8; BLOCK_SIZE])
            .unwrap();

        let requests = picker.next_requests(&full_bitfield(2), &pieces, 1);
        assert_eq!(requests[0].piece, 0);
        assert_eq!(requests[0].offset, BLOCK_SIZE as u32);
    }

    #[test]
    fn in_flight_blocks_are_not_repicked_until_released() {
        let pieces = manager(1);
        let mut picker = PiecePicker::new(1);
        picker.add_bitfield(&full_bitfield(1));

        let first = picker.next_requests(&full_bitfield(1), &pieces, 2);
        assert_eq!(first.len(), 2);
        assert!(picker
            .next_requests(&full_bitfield(1), &pieces, 2)
            .is_empty());

        picker.release(&first);
        assert_eq!(picker.next_requests(&full_bitfield(1), &pieces, 2).len(), 2);
    }

    #[test]
    fn received_blocks_leave_the_pending_set() {
        let pieces = manager(1);
        let mut picker = PiecePicker::new(1);
        picker.add_bitfield(&full_bitfield(1));

        let requests = picker.next_requests(&full_bitfield(1), &pieces, 1);
        picker.mark_received(requests[0].piece, requests[0].offset);
        assert_eq!(picker.pending_len(), 0);

        // the block is buffered now, so it is no longer missing
        pieces
            .store_block(0, requests[0].offset as usize, &vec![0u8; BLOCK_SIZE])
            .unwrap();
        let next = picker.next_requests(&full_bitfield(1), &pieces, 2);
        assert_eq!(next.len(), 1);
        assert_ne!(next[0].offset, requests[0].offset);
    }

    #[test]
    fn skips_pieces_the_peer_lacks() {
        let pieces = manager(2);
        let mut picker = PiecePicker::new(2);
        let mut bits = Bitfield::new(2);
        bits.set(1);
        picker.add_bitfield(&bits);

        let requests = picker.next_requests(&bits, &pieces, 8);
        assert!(requests.iter().all(|r| r.piece == 1));
    }
}
