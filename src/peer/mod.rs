//! Peer wire protocol: handshake, framed messages, and the per-peer
//! connection state machine.
pub mod connection;
pub mod handshake;
pub mod message;

use thiserror::Error;

pub use connection::{Connection, ConnectionError, PeerState};
pub use handshake::Handshake;
pub use message::{FrameDecoder, PeerMessage, BLOCK_SIZE};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad handshake: {0}")]
    BadHandshake(String),

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("peer declared an oversized frame ({0} bytes)")]
    OversizedFrame(usize),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("idle timeout waiting for peer")]
    IdleTimeout,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What we believe the peer thinks of us, and what we think of the peer.
/// Both sides start choking and not-interested per the protocol's default
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokeState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}
