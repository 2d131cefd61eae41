//! Peer wire message set and framing.
//!
//! Every post-handshake message is a 4-byte big-endian length prefix followed by that
//! many payload bytes; a zero length is a keep-alive, otherwise the first payload byte
//! is the message id. The message set is closed, so it is modeled as a plain enum and
//! dispatched by match; ids outside the table are dropped by the reader, not errors.
use super::PeerError;
use super::PeerResult;
use bytes::{Buf, Bytes, BytesMut};

/// Hard cap on a single frame. Large enough for a block message plus header or a
/// bitfield for a very large torrent; anything bigger is treated as framing desync.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
}

impl Message {
    /// The wire id of this message; `None` for keep-alives, which have no id byte.
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
        }
    }

    /// Encodes this message with its length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(id) = self.id() {
            body.push(id);
        }
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have(index) => body.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(payload) => body.extend_from_slice(payload),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(block);
            }
        }
        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        framed
    }

    /// Parses one frame payload (the bytes after the length prefix).
    ///
    /// An empty payload is a keep-alive. An id outside the message table yields
    /// `Ok(None)`: the caller drops the frame and keeps reading. A known id with a
    /// body of the wrong shape is a `MalformedMessage` error.
    pub fn parse(payload: &[u8]) -> PeerResult<Option<Message>> {
        if payload.is_empty() {
            return Ok(Some(Message::KeepAlive));
        }
        let id = payload[0];
        let body = &payload[1..];
        let message = match id {
            0 => expect_empty(body, "choke").map(|_| Message::Choke)?,
            1 => expect_empty(body, "unchoke").map(|_| Message::Unchoke)?,
            2 => expect_empty(body, "interested").map(|_| Message::Interested)?,
            3 => expect_empty(body, "not interested").map(|_| Message::NotInterested)?,
            4 => {
                if body.len() != 4 {
                    return Err(PeerError::MalformedMessage(format!(
                        "have body of {} bytes",
                        body.len()
                    )));
                }
                Message::Have(read_u32(body, 0))
            }
            5 => Message::Bitfield(body.to_vec()),
            6 | 8 => {
                if body.len() != 12 {
                    return Err(PeerError::MalformedMessage(format!(
                        "request/cancel body of {} bytes",
                        body.len()
                    )));
                }
                let index = read_u32(body, 0);
                let begin = read_u32(body, 4);
                let length = read_u32(body, 8);
                if id == 6 {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            7 => {
                if body.len() < 8 {
                    return Err(PeerError::MalformedMessage(format!(
                        "piece body of {} bytes",
                        body.len()
                    )));
                }
                Message::Piece {
                    index: read_u32(body, 0),
                    begin: read_u32(body, 4),
                    block: body[8..].to_vec(),
                }
            }
            other => {
                tracing::trace!(id = other, "Dropping message with unknown id");
                return Ok(None);
            }
        };
        Ok(Some(message))
    }
}

fn expect_empty(body: &[u8], name: &str) -> PeerResult<()> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(PeerError::MalformedMessage(format!(
            "{} message with a body",
            name
        )))
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Pulls the next complete frame payload out of the inbound buffer, if one is there.
///
/// The reader appends raw socket bytes to `buf` and calls this in a loop: while at
/// least 4 bytes are buffered the length prefix is known, and once `length` more
/// bytes arrive the payload is split off. Frames above `MAX_FRAME_SIZE` mean the
/// stream has desynced and the connection must be dropped.
pub fn next_frame(buf: &mut BytesMut) -> PeerResult<Option<Bytes>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = read_u32(buf, 0) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(PeerError::ProtocolViolation(format!(
            "frame of {} bytes exceeds limit",
            length
        )));
    }
    if buf.len() < 4 + length {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(length).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) {
        let encoded = message.encode();
        let mut buf = BytesMut::from(&encoded[..]);
        let frame = next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(Message::parse(&frame).unwrap(), Some(message));
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrips_every_message() {
        roundtrip(Message::KeepAlive);
        roundtrip(Message::Choke);
        roundtrip(Message::Unchoke);
        roundtrip(Message::Interested);
        roundtrip(Message::NotInterested);
        roundtrip(Message::Have(42));
        roundtrip(Message::Bitfield(vec![0b1010_0000]));
        roundtrip(Message::Request {
            index: 1,
            begin: 16_384,
            length: 16_384,
        });
        roundtrip(Message::Piece {
            index: 3,
            begin: 0,
            block: vec![9u8; 64],
        });
        roundtrip(Message::Cancel {
            index: 1,
            begin: 16_384,
            length: 16_384,
        });
    }

    #[test]
    fn keep_alive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn unknown_id_is_dropped_not_an_error() {
        assert_eq!(Message::parse(&[20, 1, 2, 3]).unwrap(), None);
    }

    #[test]
    fn malformed_bodies_are_errors() {
        assert!(Message::parse(&[4, 0, 0]).is_err()); // short have
        assert!(Message::parse(&[6, 0, 0, 0, 1]).is_err()); // short request
        assert!(Message::parse(&[7, 0, 0, 0]).is_err()); // short piece
        assert!(Message::parse(&[0, 1]).is_err()); // choke with body
    }

    #[test]
    fn recovers_messages_from_arbitrarily_split_stream() {
        let messages = vec![
            Message::Have(7),
            Message::KeepAlive,
            Message::Request {
                index: 0,
                begin: 0,
                length: 16_384,
            },
            Message::Piece {
                index: 0,
                begin: 0,
                block: vec![1, 2, 3, 4, 5],
            },
            Message::Choke,
        ];
        let stream: Vec<u8> = messages.iter().flat_map(|m| m.encode()).collect();

        for chunk_size in [1usize, 2, 3, 5, 7, 11, stream.len()] {
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                while let Some(frame) = next_frame(&mut buf).unwrap() {
                    decoded.push(Message::parse(&frame).unwrap().unwrap());
                }
            }
            assert_eq!(decoded, messages, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn oversized_frame_is_a_protocol_violation() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        assert!(next_frame(&mut buf).is_err());
    }
}
