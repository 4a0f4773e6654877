//! Per-peer connection: drives one TCP socket through the handshake and
//! framed-message lifecycle, dispatching inbound messages to a shared
//! piece manager.
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::piece::{PeerId, PeerView, PieceManager};
use crate::storage::{Storage, StorageError};
use crate::torrent::Torrent;
use crate::tracker::PeerEndpoint;

use super::handshake::Handshake;
use super::message::{FrameDecoder, PeerMessage, BLOCK_SIZE};
use super::ProtocolError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const READ_CHUNK: usize = 16 * 1024;

/// Everything that can end a connection's run loop. Kept distinct from
/// [`ProtocolError`] because a disk write failure is never the remote
/// peer's fault: the orchestrator treats the two differently (drop and
/// cool down the endpoint vs. abort the whole session).
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("disk storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Lifecycle state of a single peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Connecting,
    Handshaking,
    ChokedInterested,
    Active,
    Stopped,
}

/// The pure transition logic for a peer's lifecycle state, independent of
/// any socket I/O so it can be exercised directly in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLifecycle {
    state: PeerState,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for PeerLifecycle {
    fn default() -> Self {
        Self {
            state: PeerState::Idle,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl PeerLifecycle {
    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn begin_connecting(&mut self) {
        self.state = PeerState::Connecting;
    }

    /// Completes a validated handshake: resets choke/interest defaults and
    /// declares intent to download.
    pub fn complete_handshake(&mut self) {
        self.peer_choking = true;
        self.am_interested = true;
        self.state = PeerState::ChokedInterested;
    }

    pub fn receive_unchoke(&mut self) {
        if matches!(self.state, PeerState::ChokedInterested) {
            self.peer_choking = false;
            self.state = PeerState::Active;
        }
    }

    pub fn receive_choke(&mut self) {
        if matches!(self.state, PeerState::Active) {
            self.peer_choking = true;
            self.state = PeerState::ChokedInterested;
        }
    }

    pub fn receive_interested(&mut self) {
        self.peer_interested = true;
    }

    pub fn receive_not_interested(&mut self) {
        self.peer_interested = false;
    }

    pub fn can_request(&self) -> bool {
        matches!(self.state, PeerState::Active)
    }

    /// Terminal, idempotent: any state may transition to `stopped`.
    pub fn stop(&mut self) {
        self.state = PeerState::Stopped;
    }
}

/// A live or dropped peer connection.
pub struct Connection {
    pub id: PeerId,
    pub endpoint: PeerEndpoint,
    lifecycle: PeerLifecycle,
    view: PeerView,
}

impl Connection {
    pub fn new(id: PeerId, endpoint: PeerEndpoint) -> Self {
        Self {
            id,
            endpoint,
            lifecycle: PeerLifecycle::default(),
            view: PeerView::default(),
        }
    }

    pub fn state(&self) -> PeerState {
        self.lifecycle.state()
    }

    /// Connects, handshakes, and drives the framed message loop against a
    /// shared piece manager and storage layer until the peer disconnects,
    /// errors, or is cancelled. Always leaves the connection in
    /// `Stopped` and releases the socket on every exit path.
    #[instrument(skip(self, torrent, piece_manager, storage), fields(peer = %self.endpoint.ip))]
    pub async fn run(
        &mut self,
        torrent: Arc<Torrent>,
        local_peer_id: [u8; 20],
        piece_manager: Arc<Mutex<dyn PieceManager + Send>>,
        storage: Arc<Storage>,
    ) -> Result<(), ConnectionError> {
        self.lifecycle.begin_connecting();
        let result = self.drive(torrent, local_peer_id, piece_manager.clone(), storage).await;
        piece_manager.lock().await.on_peer_disconnect(self.id);
        self.lifecycle.stop();
        if let Err(ref e) = result {
            warn!(error = %e, "peer connection ended");
        }
        result
    }

    async fn drive(
        &mut self,
        torrent: Arc<Torrent>,
        local_peer_id: [u8; 20],
        piece_manager: Arc<Mutex<dyn PieceManager + Send>>,
        storage: Arc<Storage>,
    ) -> Result<(), ConnectionError> {
        let addr = std::net::SocketAddr::from((self.endpoint.ip, self.endpoint.port));
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::ConnectTimeout)?
            .map_err(ProtocolError::Io)?;

        let outbound = Handshake::new(torrent.info_hash, local_peer_id);
        outbound.write(&mut stream).await?;

        let inbound = Handshake::read_and_validate(&mut stream, torrent.info_hash).await?;
        debug!(peer_id = %hex::encode(inbound.peer_id), "handshake complete");

        self.lifecycle.complete_handshake();
        stream
            .write_all(&PeerMessage::Interested.encode())
            .await
            .map_err(ProtocolError::Io)?;

        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let read = tokio::time::timeout(IDLE_TIMEOUT, stream.read(&mut buf))
                .await
                .map_err(|_| ProtocolError::IdleTimeout)?
                .map_err(ProtocolError::Io)?;

            if read == 0 {
                decoder.finish()?;
                return Ok(());
            }
            decoder.feed(&buf[..read]);

            while let Some(message) = decoder.try_next()? {
                self.handle_message(message, &piece_manager, &storage, &torrent, &mut stream).await?;
            }

            if matches!(self.lifecycle.state(), PeerState::Active) {
                self.request_more(&piece_manager, &mut stream).await?;
            }
        }
    }

    async fn handle_message(
        &mut self,
        message: PeerMessage,
        piece_manager: &Arc<Mutex<dyn PieceManager + Send>>,
        storage: &Arc<Storage>,
        torrent: &Arc<Torrent>,
        stream: &mut TcpStream,
    ) -> Result<(), ConnectionError> {
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => self.lifecycle.receive_choke(),
            PeerMessage::Unchoke => {
                self.lifecycle.receive_unchoke();
                self.request_more(piece_manager, stream).await?;
            }
            PeerMessage::Interested => self.lifecycle.receive_interested(),
            PeerMessage::NotInterested => self.lifecycle.receive_not_interested(),
            PeerMessage::Have { index } => {
                self.view.mark_have(index as usize);
                piece_manager.lock().await.on_have(self.id, index as usize);
            }
            PeerMessage::Bitfield { bits } => {
                self.view = PeerView::from_bitfield(&bits, torrent.info.num_pieces());
                piece_manager.lock().await.on_bitfield(self.id, &bits);
            }
            PeerMessage::Piece { index, begin, block } => {
                let completed = piece_manager
                    .lock()
                    .await
                    .on_block(self.id, index as usize, begin, block);
                if let Some(data) = completed {
                    info!(index, "piece verified");
                    // A write failure here is a local disk fault, not a
                    // protocol violation by this peer; propagate it as
                    // its own variant so the orchestrator can tell the
                    // two apart.
                    storage.write_piece(torrent, index as usize, &data).await?;
                }
            }
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } | PeerMessage::Port { .. } => {
                // Seeding and DHT are out of scope for a leech-only client.
            }
            PeerMessage::Unknown { id } => {
                debug!(id, "ignoring unsupported message id");
            }
        }
        Ok(())
    }

    async fn request_more(
        &mut self,
        piece_manager: &Arc<Mutex<dyn PieceManager + Send>>,
        stream: &mut TcpStream,
    ) -> Result<(), ConnectionError> {
        if !self.lifecycle.can_request() {
            return Ok(());
        }
        loop {
            let next = piece_manager.lock().await.next_request(self.id, &self.view);
            match next {
                Some((index, begin, length)) => {
                    let request = PeerMessage::Request { index: index as u32, begin, length };
                    stream
                        .write_all(&request.encode())
                        .await
                        .map_err(ProtocolError::Io)?;
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// Default block size requested per `request` message.
pub const REQUEST_BLOCK_SIZE: u32 = BLOCK_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_then_unchoke_reaches_active() {
        let mut lc = PeerLifecycle::default();
        lc.begin_connecting();
        lc.complete_handshake();
        assert_eq!(lc.state(), PeerState::ChokedInterested);

        lc.receive_unchoke();
        assert_eq!(lc.state(), PeerState::Active);
        assert!(lc.can_request());
    }

    #[test]
    fn choke_returns_to_choked_interested_and_blocks_requests() {
        let mut lc = PeerLifecycle::default();
        lc.begin_connecting();
        lc.complete_handshake();
        lc.receive_unchoke();
        assert!(lc.can_request());

        lc.receive_choke();
        assert_eq!(lc.state(), PeerState::ChokedInterested);
        assert!(!lc.can_request());
    }

    #[test]
    fn stop_is_terminal_and_idempotent() {
        let mut lc = PeerLifecycle::default();
        lc.begin_connecting();
        lc.complete_handshake();
        lc.receive_unchoke();
        lc.stop();
        assert_eq!(lc.state(), PeerState::Stopped);
        lc.stop();
        assert_eq!(lc.state(), PeerState::Stopped);
    }

    #[test]
    fn unchoke_without_handshake_is_ignored() {
        let mut lc = PeerLifecycle::default();
        lc.receive_unchoke();
        assert_eq!(lc.state(), PeerState::Idle);
    }
}
