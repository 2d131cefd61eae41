use std::io;
use std::sync::Mutex;

/// Storage seam for completed piece data.
///
/// The piece manager flushes a piece here once it verifies and serves uploads back
/// out of it. A disk-backed implementation can substitute without touching the
/// protocol plane.
pub trait PieceStore: Send + Sync {
    fn write(&self, piece: usize, offset: usize, bytes: &[u8]) -> io::Result<()>;
    fn read(&self, piece: usize, offset: usize, length: usize) -> io::Result<Vec<u8>>;
}

/// In-memory store: one preallocated buffer per piece.
pub struct MemoryStore {
    pieces: Mutex<Vec<Vec<u8>>>,
}

impl MemoryStore {
    /// Allocates a buffer for each piece, sized by `piece_sizes`.
    pub fn new(piece_sizes: &[usize]) -> Self {
        MemoryStore {
            pieces: Mutex::new(piece_sizes.iter().map(|&size| vec![0u8; size]).collect()),
        }
    }
}

impl PieceStore for MemoryStore {
    fn write(&self, piece: usize, offset: usize, bytes: &[u8]) -> io::Result<()> {
        let mut pieces = self.pieces.lock().expect("memory store lock poisoned");
        let buffer = pieces.get_mut(piece).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "piece index out of range")
        })?;
        if offset + bytes.len() > buffer.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past end of piece",
            ));
        }
        buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, piece: usize, offset: usize, length: usize) -> io::Result<Vec<u8>> {
        let pieces = self.pieces.lock().expect("memory store lock poisoned");
        let buffer = pieces.get(piece).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "piece index out of range")
        })?;
        if offset + length > buffer.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read past end of piece",
            ));
        }
        Ok(buffer[offset..offset + length].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let store = MemoryStore::new(&[32, 16]);
        store.write(0, 4, b"data").unwrap();
        assert_eq!(store.read(0, 4, 4).unwrap(), b"data");
        assert_eq!(store.read(0, 0, 4).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn rejects_out_of_range_access() {
        let store = MemoryStore::new(&[8]);
        assert!(store.write(1, 0, b"x").is_err());
        assert!(store.write(0, 6, b"abc").is_err());
        assert!(store.read(0, 7, 2).is_err());
    }
}
