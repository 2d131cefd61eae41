//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It verifies
//! that both peers are participating in the same torrent (via info_hash) and
//! establishes basic protocol compatibility.
//!
use super::PeerError;
use super::PeerResult;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

/// How long either side of the exchange may take before the connection is rejected.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/** Represents a BitTorrent handshake message as defined in the BitTorrent protocol.

A handshake is the first message exchanged between peers and contains:
- Protocol identifier ("BitTorrent protocol")
- Reserved bytes for protocol extensions
- Info hash identifying the torrent
- Peer ID identifying the client */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_len: u8,
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /** Creates a new handshake with the specified info hash and peer ID.

    Arguments:
    - info_hash - The SHA-1 hash of the torrent's info dictionary
    - peer_id - A unique identifier for this client

    Returns:
    A new Handshake instance with default protocol settings */
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol_len: 19,
            protocol: *b"BitTorrent protocol",
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /** Serializes the handshake into a 68-byte array as per the BitTorrent protocol.

    The serialized format is:
    - 1 byte: protocol string length (19)
    - 19 bytes: protocol string ("BitTorrent protocol")
    - 8 bytes: reserved bytes (all zeros)
    - 20 bytes: info hash
    - 20 bytes: peer ID

    Returns:
    A 68-byte array containing the serialized handshake */
    #[instrument(level = "trace")]
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = self.protocol_len;
        buf[1..20].copy_from_slice(&self.protocol);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads and validates a peer's 68-byte handshake from the stream.
    ///
    /// # How it works
    /// 1. Reads the first byte (protocol_len) and rejects anything but 19.
    /// 2. Reads the remaining 67 bytes.
    /// 3. Validates the protocol string is exactly "BitTorrent protocol".
    /// 4. Extracts reserved bytes, info_hash, and peer_id.
    ///
    /// A short read (the peer closed before 68 bytes) surfaces as an I/O error,
    /// which callers treat as a rejected connection.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut length_buf = [0u8; 1];
        stream.read_exact(&mut length_buf).await?;
        let protocol_len = length_buf[0];

        if protocol_len != 19 {
            return Err(PeerError::HandshakeInvalidProtocol);
        }

        let mut buf = [0u8; 67];
        stream.read_exact(&mut buf).await?;

        let mut protocol = [0u8; 19];
        protocol.copy_from_slice(&buf[0..19]);
        if &protocol != b"BitTorrent protocol" {
            return Err(PeerError::HandshakeInvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[19..27]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[27..47]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[47..67]);

        Ok(Self {
            protocol_len,
            protocol,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /** Validates that this handshake's info hash matches the expected value.

    Arguments:
    - expected_info_hash - The expected SHA-1 hash of the torrent's info dictionary

    Errors:
    Returns HandshakeInfoHashMismatch if the info hash doesn't match the expected value */
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> PeerResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(PeerError::HandshakeInfoHashMismatch);
        }
        Ok(())
    }

    /// Performs the initiating side of the handshake on an already-connected stream:
    /// send ours first, then read and validate the reply. Returns the peer's handshake.
    ///
    /// The whole exchange is bounded by `HANDSHAKE_TIMEOUT`.
    #[instrument(level = "debug", skip(stream))]
    pub async fn initiate(
        stream: &mut TcpStream,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> PeerResult<Handshake> {
        timeout(HANDSHAKE_TIMEOUT, async {
            let ours = Handshake::new(info_hash, peer_id);
            stream.write_all(&ours.serialize()).await?;
            let theirs = Handshake::read(stream).await?;
            theirs.validate(info_hash)?;
            Ok(theirs)
        })
        .await
        .map_err(|_| PeerError::HandshakeTimeout)?
    }

    /// Performs the accepting side of the handshake: read the remote's handshake
    /// first, validate it, then reply with ours. Returns the peer's handshake.
    ///
    /// The whole exchange is bounded by `HANDSHAKE_TIMEOUT`.
    #[instrument(level = "debug", skip(stream))]
    pub async fn accept(
        stream: &mut TcpStream,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> PeerResult<Handshake> {
        timeout(HANDSHAKE_TIMEOUT, async {
            let theirs = Handshake::read(stream).await?;
            theirs.validate(info_hash)?;
            let ours = Handshake::new(info_hash, peer_id);
            stream.write_all(&ours.serialize()).await?;
            Ok(theirs)
        })
        .await
        .map_err(|_| PeerError::HandshakeTimeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn serializes_to_68_bytes() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[tokio::test]
    async fn exchange_succeeds_with_matching_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [7u8; 20];

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            Handshake::accept(&mut stream, info_hash, [0xbb; 20]).await
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let theirs = Handshake::initiate(&mut stream, info_hash, [0xaa; 20])
            .await
            .unwrap();
        assert_eq!(theirs.peer_id, [0xbb; 20]);

        let seen_by_server = server.await.unwrap().unwrap();
        assert_eq!(seen_by_server.peer_id, [0xaa; 20]);
    }

    #[tokio::test]
    async fn exchange_fails_on_info_hash_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            Handshake::accept(&mut stream, [1u8; 20], [0xbb; 20]).await
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let result = Handshake::initiate(&mut stream, [2u8; 20], [0xaa; 20]).await;
        assert!(result.is_err());
        assert!(matches!(
            server.await.unwrap(),
            Err(PeerError::HandshakeInfoHashMismatch)
        ));
    }

    #[tokio::test]
    async fn rejects_wrong_protocol_string() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut bogus = [0u8; 68];
            bogus[0] = 19;
            bogus[1..20].copy_from_slice(b"BitTorrent protocoL");
            stream.write_all(&bogus).await.unwrap();
            stream
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let result = Handshake::accept(&mut stream, [1u8; 20], [0xbb; 20]).await;
        assert!(matches!(result, Err(PeerError::HandshakeInvalidProtocol)));
        drop(client.await.unwrap());
    }
}
