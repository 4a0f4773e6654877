//! The BitTorrent handshake: the first 68 bytes exchanged on every peer
//! connection, before any framed message.
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

use super::ProtocolError;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// A decoded or to-be-sent handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Serializes to the wire format:
    /// `0x13 | "BitTorrent protocol" | 8 reserved zero bytes | info_hash | peer_id`.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        // buf[20..28] reserved, already zeroed.
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a handshake from exactly [`HANDSHAKE_LEN`] bytes.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HANDSHAKE_LEN {
            return Err(ProtocolError::BadHandshake("handshake shorter than 68 bytes".into()));
        }
        if buf[0] != 19 {
            return Err(ProtocolError::BadHandshake(format!(
                "protocol string length is {}, expected 19",
                buf[0]
            )));
        }
        if &buf[1..20] != PROTOCOL {
            return Err(ProtocolError::BadHandshake("protocol string mismatch".into()));
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self { info_hash, peer_id })
    }

    /// Reads exactly 68 bytes from `stream` and validates them against
    /// `expected_info_hash`. Any bytes the socket buffered beyond the
    /// handshake belong to the framed message stream and must be read
    /// separately by the caller (sockets don't over-read on `read_exact`).
    #[instrument(skip(stream), level = "debug")]
    pub async fn read_and_validate(
        stream: &mut TcpStream,
        expected_info_hash: [u8; 20],
    ) -> Result<Handshake, ProtocolError> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await.map_err(ProtocolError::Io)?;
        let handshake = Handshake::parse(&buf)?;
        if handshake.info_hash != expected_info_hash {
            return Err(ProtocolError::BadHandshake("info_hash mismatch".into()));
        }
        Ok(handshake)
    }

    pub async fn write(&self, stream: &mut TcpStream) -> Result<(), ProtocolError> {
        stream.write_all(&self.serialize()).await.map_err(ProtocolError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_68_bytes() {
        let info_hash = [0u8; 20];
        let peer_id = [0x41u8; 20];
        let bytes = Handshake::new(info_hash, peer_id).serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[0u8; 20]);
        assert_eq!(&bytes[48..68], &[0x41u8; 20]);
    }

    #[test]
    fn parses_own_serialization() {
        let info_hash = [7u8; 20];
        let peer_id = [9u8; 20];
        let bytes = Handshake::new(info_hash, peer_id).serialize();
        let parsed = Handshake::parse(&bytes).unwrap();
        assert_eq!(parsed.info_hash, info_hash);
        assert_eq!(parsed.peer_id, peer_id);
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(Handshake::parse(&[19u8; 10]).is_err());
    }

    #[test]
    fn rejects_wrong_protocol_string() {
        let mut bytes = Handshake::new([0; 20], [0; 20]).serialize();
        bytes[5] = b'X';
        assert!(Handshake::parse(&bytes).is_err());
    }
}
