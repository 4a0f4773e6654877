//! Peer wire messages and the length-prefixed frame parser.
//!
//! Every message except the handshake is framed as
//! `<u32 length, big-endian><payload>`; a zero-length frame is a
//! keep-alive. The frame parser in [`FrameDecoder`] accumulates bytes
//! across arbitrary read chunk boundaries and yields exactly one message
//! per complete frame.
use tracing::{instrument, trace, warn};

use super::ProtocolError;

/// Block request size fixed by convention: 16 KiB.
pub const BLOCK_SIZE: u32 = 1 << 14;

/// Safety ceiling on a single frame's declared length (1 MiB). Declaring
/// more than this is treated as a hostile or corrupt peer.
const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bits: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { port: u16 },
    /// A recognized frame with an id this client doesn't implement.
    /// Logged and otherwise ignored; the frame is still fully consumed.
    Unknown { id: u8 },
}

impl PeerMessage {
    /// Serializes to the full wire frame, including the 4-byte length
    /// prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            PeerMessage::KeepAlive => return 0u32.to_be_bytes().to_vec(),
            PeerMessage::Choke => payload.push(0),
            PeerMessage::Unchoke => payload.push(1),
            PeerMessage::Interested => payload.push(2),
            PeerMessage::NotInterested => payload.push(3),
            PeerMessage::Have { index } => {
                payload.push(4);
                payload.extend_from_slice(&index.to_be_bytes());
            }
            PeerMessage::Bitfield { bits } => {
                payload.push(5);
                payload.extend_from_slice(bits);
            }
            PeerMessage::Request { index, begin, length } => {
                payload.push(6);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            PeerMessage::Piece { index, begin, block } => {
                payload.push(7);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
            }
            PeerMessage::Cancel { index, begin, length } => {
                payload.push(8);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            PeerMessage::Port { port } => {
                payload.push(9);
                payload.extend_from_slice(&port.to_be_bytes());
            }
            PeerMessage::Unknown { id } => payload.push(*id),
        }
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&payload);
        frame
    }

    fn decode_payload(id: u8, body: &[u8]) -> Result<PeerMessage, ProtocolError> {
        match id {
            0 => Ok(PeerMessage::Choke),
            1 => Ok(PeerMessage::Unchoke),
            2 => Ok(PeerMessage::Interested),
            3 => Ok(PeerMessage::NotInterested),
            4 => {
                let index = read_u32(body, 0, "have")?;
                Ok(PeerMessage::Have { index })
            }
            5 => Ok(PeerMessage::Bitfield { bits: body.to_vec() }),
            6 => Ok(PeerMessage::Request {
                index: read_u32(body, 0, "request")?,
                begin: read_u32(body, 4, "request")?,
                length: read_u32(body, 8, "request")?,
            }),
            7 => {
                if body.len() < 8 {
                    return Err(ProtocolError::UnexpectedMessage("piece payload too short".into()));
                }
                Ok(PeerMessage::Piece {
                    index: read_u32(body, 0, "piece")?,
                    begin: read_u32(body, 4, "piece")?,
                    block: body[8..].to_vec(),
                })
            }
            8 => Ok(PeerMessage::Cancel {
                index: read_u32(body, 0, "cancel")?,
                begin: read_u32(body, 4, "cancel")?,
                length: read_u32(body, 8, "cancel")?,
            }),
            9 => {
                if body.len() < 2 {
                    return Err(ProtocolError::UnexpectedMessage("port payload too short".into()));
                }
                Ok(PeerMessage::Port { port: u16::from_be_bytes([body[0], body[1]]) })
            }
            other => {
                warn!(id = other, "unsupported peer message id, skipping");
                Ok(PeerMessage::Unknown { id: other })
            }
        }
    }
}

fn read_u32(body: &[u8], offset: usize, what: &'static str) -> Result<u32, ProtocolError> {
    body.get(offset..offset + 4)
        .map(|s| u32::from_be_bytes(s.try_into().unwrap()))
        .ok_or_else(|| ProtocolError::UnexpectedMessage(format!("{what} payload too short")))
}

/// Accumulates bytes read from a peer's socket and yields complete
/// [`PeerMessage`]s as soon as a full frame is buffered. Any bytes beyond
/// a full frame are retained for the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the decoder with bytes left over from the handshake read.
    pub fn with_prefix(prefix: Vec<u8>) -> Self {
        Self { buf: prefix }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempts to parse one frame out of the buffered bytes. Returns
    /// `Ok(None)` when more bytes are needed.
    #[instrument(skip(self), level = "trace")]
    pub fn try_next(&mut self) -> Result<Option<PeerMessage>, ProtocolError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes(self.buf[0..4].try_into().unwrap()) as usize;

        if length == 0 {
            self.buf.drain(0..4);
            return Ok(Some(PeerMessage::KeepAlive));
        }
        if length > MAX_FRAME_LEN {
            return Err(ProtocolError::OversizedFrame(length));
        }
        if self.buf.len() < 4 + length {
            return Ok(None);
        }

        let id = self.buf[4];
        let body = self.buf[5..4 + length].to_vec();
        let message = PeerMessage::decode_payload(id, &body)?;
        self.buf.drain(0..4 + length);
        trace!(?message, "decoded peer message");
        Ok(Some(message))
    }

    /// Call at EOF: a non-empty buffer that cannot complete a frame is a
    /// truncated stream.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Truncated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_round_trips() {
        let mut dec = FrameDecoder::new();
        dec.feed(&PeerMessage::KeepAlive.encode());
        assert_eq!(dec.try_next().unwrap(), Some(PeerMessage::KeepAlive));
        assert_eq!(dec.try_next().unwrap(), None);
    }

    #[test]
    fn waits_for_full_frame_across_chunks() {
        let frame = PeerMessage::Have { index: 7 }.encode();
        let mut dec = FrameDecoder::new();
        dec.feed(&frame[..2]);
        assert_eq!(dec.try_next().unwrap(), None);
        dec.feed(&frame[2..]);
        assert_eq!(dec.try_next().unwrap(), Some(PeerMessage::Have { index: 7 }));
    }

    #[test]
    fn parses_arbitrary_chunking_of_a_message_sequence() {
        let messages = vec![
            PeerMessage::Bitfield { bits: vec![0xFF, 0x00] },
            PeerMessage::Unchoke,
            PeerMessage::Request { index: 1, begin: 0, length: BLOCK_SIZE },
            PeerMessage::KeepAlive,
            PeerMessage::Piece { index: 1, begin: 0, block: vec![1, 2, 3, 4] },
        ];
        let mut concatenated = Vec::new();
        for m in &messages {
            concatenated.extend(m.encode());
        }

        for chunk_size in [1usize, 2, 3, 7, 64] {
            let mut dec = FrameDecoder::new();
            let mut decoded = Vec::new();
            for chunk in concatenated.chunks(chunk_size) {
                dec.feed(chunk);
                while let Some(msg) = dec.try_next().unwrap() {
                    decoded.push(msg);
                }
            }
            assert_eq!(decoded, messages, "chunk_size={chunk_size}");
            dec.finish().unwrap();
        }
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut dec = FrameDecoder::new();
        dec.feed(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        assert!(matches!(dec.try_next(), Err(ProtocolError::OversizedFrame(_))));
    }

    #[test]
    fn truncated_trailing_bytes_fail_at_finish() {
        let mut dec = FrameDecoder::new();
        dec.feed(&[0, 0, 0, 5, 4]); // declares 5 bytes, only id byte present
        assert_eq!(dec.try_next().unwrap(), None);
        assert!(dec.finish().is_err());
    }

    #[test]
    fn unknown_id_is_skipped_not_fatal() {
        let mut dec = FrameDecoder::new();
        dec.feed(&[0, 0, 0, 2, 200, 0]);
        assert_eq!(dec.try_next().unwrap(), Some(PeerMessage::Unknown { id: 200 }));
    }
}
