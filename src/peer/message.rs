//! Wire message codec.
//!
//! Every message after the handshake is a 4-byte big-endian length prefix
//! followed by that many payload bytes; a zero length is a keep-alive,
//! otherwise the payload starts with a 1-byte message id.
use super::{PeerError, PeerResult};
use bytes::{Buf, BytesMut};

/// Block size used in `request` messages; fixed by the wire protocol.
pub const BLOCK_LEN: u32 = 16384;

/// Upper bound on a single frame. The largest legitimate frame is a
/// `piece` message carrying one 16 KiB block; bitfields for very large
/// torrents stay well below this too.
const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, PartialEq, Clone)]
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
    Port(u16),
    /// A message id this client does not understand; logged and skipped.
    Unknown(u8),
}

impl Message {
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
            Message::Port(_) => Some(9),
            Message::Unknown(id) => Some(*id),
        }
    }

    /// Serializes the message with its length prefix.
    pub fn serialize(&self) -> Vec<u8> {
        let mut msg = Vec::new();
        match self {
            Message::KeepAlive => msg.extend_from_slice(&0u32.to_be_bytes()),
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::Unknown(_) => {
                msg.extend_from_slice(&1u32.to_be_bytes());
                msg.push(self.id().unwrap_or(0));
            }
            Message::Have(index) => {
                msg.extend_from_slice(&5u32.to_be_bytes());
                msg.push(4);
                msg.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bitfield) => {
                msg.extend_from_slice(&(1 + bitfield.len() as u32).to_be_bytes());
                msg.push(5);
                msg.extend_from_slice(bitfield);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                msg.extend_from_slice(&13u32.to_be_bytes());
                msg.push(6);
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                msg.extend_from_slice(&(9 + block.len() as u32).to_be_bytes());
                msg.push(7);
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                msg.extend_from_slice(&13u32.to_be_bytes());
                msg.push(8);
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(&length.to_be_bytes());
            }
            Message::Port(port) => {
                msg.extend_from_slice(&3u32.to_be_bytes());
                msg.push(9);
                msg.extend_from_slice(&port.to_be_bytes());
            }
        }
        msg
    }

    /**
    Drains one complete message from the accumulation buffer.

    Returns `Ok(None)` when the buffer does not yet hold a full frame; the
    partial bytes stay in place for the next socket read. A complete frame
    is consumed from the buffer and decoded.
    */
    pub fn parse(buf: &mut BytesMut) -> PeerResult<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(PeerError::Protocol(format!(
                "frame length {length} exceeds limit"
            )));
        }
        if buf.len() < 4 + length {
            return Ok(None);
        }

        buf.advance(4);
        if length == 0 {
            return Ok(Some(Message::KeepAlive));
        }
        let frame = buf.split_to(length);
        Self::decode_frame(&frame).map(Some)
    }

    /// Decodes one frame (id byte plus payload, length prefix stripped).
    fn decode_frame(data: &[u8]) -> PeerResult<Message> {
        let id = data[0];
        let payload = &data[1..];
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if payload.len() != 4 {
                    return Err(PeerError::Protocol(format!(
                        "have message with {} payload bytes",
                        payload.len()
                    )));
                }
                Message::Have(read_u32(payload, 0))
            }
            5 => Message::Bitfield(payload.to_vec()),
            6 => {
                if payload.len() != 12 {
                    return Err(PeerError::Protocol(format!(
                        "request message with {} payload bytes",
                        payload.len()
                    )));
                }
                Message::Request {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                }
            }
            7 => {
                if payload.len() < 8 {
                    return Err(PeerError::Protocol(format!(
                        "piece message with {} payload bytes",
                        payload.len()
                    )));
                }
                Message::Piece {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    block: payload[8..].to_vec(),
                }
            }
            8 => {
                if payload.len() != 12 {
                    return Err(PeerError::Protocol(format!(
                        "cancel message with {} payload bytes",
                        payload.len()
                    )));
                }
                Message::Cancel {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                }
            }
            9 => {
                if payload.len() != 2 {
                    return Err(PeerError::Protocol(format!(
                        "port message with {} payload bytes",
                        payload.len()
                    )));
                }
                Message::Port(u16::from_be_bytes([payload[0], payload[1]]))
            }
            other => Message::Unknown(other),
        };
        Ok(msg)
    }
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(bytes: &[u8]) -> Message {
        let mut buf = BytesMut::from(bytes);
        Message::parse(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn keep_alive_round_trip() {
        let bytes = Message::KeepAlive.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(parse_one(&bytes), Message::KeepAlive);
    }

    #[test]
    fn state_messages_round_trip() {
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            assert_eq!(parse_one(&msg.serialize()), msg);
        }
        assert_eq!(Message::Unchoke.serialize(), vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn request_layout_is_exact() {
        let msg = Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        };
        assert_eq!(
            msg.serialize(),
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
        assert_eq!(parse_one(&msg.serialize()), msg);
    }

    #[test]
    fn piece_carries_block_bytes() {
        let msg = Message::Piece {
            index: 2,
            begin: 0,
            block: vec![0xaa, 0xbb, 0xcc],
        };
        let bytes = msg.serialize();
        assert_eq!(&bytes[..4], &12u32.to_be_bytes());
        assert_eq!(parse_one(&bytes), msg);
    }

    #[test]
    fn partial_frames_stay_buffered() {
        let full = Message::Have(7).serialize();
        let mut buf = BytesMut::from(&full[..6]);
        assert_eq!(Message::parse(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&full[6..]);
        assert_eq!(Message::parse(&mut buf).unwrap(), Some(Message::Have(7)));
        assert!(buf.is_empty());
    }

    #[test]
    fn drains_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Message::Unchoke.serialize());
        buf.extend_from_slice(&Message::Have(3).serialize());
        assert_eq!(Message::parse(&mut buf).unwrap(), Some(Message::Unchoke));
        assert_eq!(Message::parse(&mut buf).unwrap(), Some(Message::Have(3)));
        assert_eq!(Message::parse(&mut buf).unwrap(), None);
    }

    #[test]
    fn unknown_ids_are_surfaced_not_fatal() {
        let mut buf = BytesMut::from(&[0, 0, 0, 2, 42, 0xff][..]);
        assert_eq!(Message::parse(&mut buf).unwrap(), Some(Message::Unknown(42)));
    }

    #[test]
    fn oversized_frames_are_a_protocol_violation() {
        let mut buf = BytesMut::from(&[0xff, 0xff, 0xff, 0xff][..]);
        assert!(matches!(
            Message::parse(&mut buf).unwrap_err(),
            PeerError::Protocol(_)
        ));
    }

    #[test]
    fn malformed_fixed_length_payloads_are_rejected() {
        // A have message must carry exactly four payload bytes.
        let mut buf = BytesMut::from(&[0, 0, 0, 3, 4, 0, 0][..]);
        assert!(Message::parse(&mut buf).is_err());
    }
}
