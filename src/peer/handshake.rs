//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It
//! verifies that both peers are participating in the same torrent (via
//! info_hash) and establishes basic protocol compatibility.
use super::{PeerError, PeerResult};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::instrument;

pub const HANDSHAKE_LEN: usize = 68;
const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/** Represents a BitTorrent handshake message as defined in the BitTorrent
protocol.

A handshake is the first message exchanged between peers and contains:
- Protocol identifier ("BitTorrent protocol")
- Reserved bytes for protocol extensions (transmitted as all zeros)
- Info hash identifying the torrent
- Peer ID identifying the client */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /** Serializes the handshake into a 68-byte array.

    The serialized format is:
    - 1 byte: protocol string length (19)
    - 19 bytes: protocol string ("BitTorrent protocol")
    - 8 bytes: reserved bytes (all zeros)
    - 20 bytes: info hash
    - 20 bytes: peer ID */
    #[instrument(level = "trace")]
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        // buf[20..28] stays zero: reserved bytes
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a received 68-byte handshake, validating the protocol length
    /// and identifier.
    pub fn deserialize(buf: &[u8; HANDSHAKE_LEN]) -> PeerResult<Self> {
        if buf[0] as usize != PROTOCOL.len() || &buf[1..20] != PROTOCOL {
            return Err(PeerError::HandshakeInvalidProtocol);
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self { info_hash, peer_id })
    }

    /// Reads exactly one handshake from the stream.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await?;
        Self::deserialize(&buf)
    }

    /// Validates that this handshake's info hash matches the expected value.
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> PeerResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(PeerError::HandshakeInfoHashMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_exact_wire_form() {
        let info_hash = [0xaa; 20];
        let peer_id = [0xbb; 20];
        let buf = Handshake::new(info_hash, peer_id).serialize();

        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(&buf[28..48], &info_hash);
        assert_eq!(&buf[48..68], &peer_id);
    }

    #[test]
    fn round_trips_and_validates() {
        let sent = Handshake::new([1; 20], [2; 20]);
        let received = Handshake::deserialize(&sent.serialize()).unwrap();
        assert_eq!(received, sent);
        assert!(received.validate([1; 20]).is_ok());
        assert!(matches!(
            received.validate([9; 20]).unwrap_err(),
            PeerError::HandshakeInfoHashMismatch
        ));
    }

    #[test]
    fn rejects_foreign_protocol_strings() {
        let mut buf = Handshake::new([1; 20], [2; 20]).serialize();
        buf[1] = b'X';
        assert!(matches!(
            Handshake::deserialize(&buf).unwrap_err(),
            PeerError::HandshakeInvalidProtocol
        ));

        let mut buf = Handshake::new([1; 20], [2; 20]).serialize();
        buf[0] = 18;
        assert!(Handshake::deserialize(&buf).is_err());
    }
}
