//! Concrete rarest-first scheduling policy.
use std::collections::HashMap;

use sha1::{Digest, Sha1};
use tracing::warn;

use crate::torrent::Torrent;

use super::{BlockId, PeerId, PeerView, PieceManager, PieceState};

/// Default number of in-flight blocks allowed per peer. Matches the
/// teacher's conservative single-peer debugging default, generalized into
/// a configurable depth.
pub const DEFAULT_PIPELINE_DEPTH: usize = 5;

struct PieceRecord {
    state: PieceState,
    size: u64,
    hash: [u8; 20],
    /// Blocks received so far, keyed by offset, pending assembly.
    blocks: HashMap<u32, Vec<u8>>,
}

/// Rarest-first piece scheduler: tracks piece rarity across all peers and
/// always offers the rarest eligible piece first.
pub struct RarestFirstManager {
    pieces: Vec<PieceRecord>,
    /// Number of peers known to hold each piece.
    rarity: Vec<u32>,
    peer_views: HashMap<PeerId, PeerView>,
    in_flight: HashMap<PeerId, Vec<BlockId>>,
    pipeline_depth: usize,
    block_size: u32,
}

impl RarestFirstManager {
    pub fn new(torrent: &Torrent, pipeline_depth: usize) -> Self {
        let num_pieces = torrent.info.num_pieces();
        let mut pieces = Vec::with_capacity(num_pieces);
        for index in 0..num_pieces {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(torrent.info.piece_hash(index).expect("index in range"));
            pieces.push(PieceRecord {
                state: PieceState::Missing,
                size: torrent.piece_size(index),
                hash,
                blocks: HashMap::new(),
            });
        }
        Self {
            pieces,
            rarity: vec![0; num_pieces],
            peer_views: HashMap::new(),
            in_flight: HashMap::new(),
            pipeline_depth,
            block_size: crate::peer::BLOCK_SIZE,
        }
    }

    fn peer_in_flight_count(&self, peer: PeerId) -> usize {
        self.in_flight.get(&peer).map_or(0, Vec::len)
    }

    fn next_unrequested_block(&self, index: usize) -> Option<(u32, u32)> {
        let record = &self.pieces[index];
        let requested: std::collections::HashSet<u32> = match &record.state {
            PieceState::InProgress { requested } => {
                requested.iter().map(|b| b.begin).collect()
            }
            _ => Default::default(),
        };
        let mut begin = 0u32;
        while (begin as u64) < record.size {
            if !requested.contains(&begin) && !record.blocks.contains_key(&begin) {
                let remaining = record.size - begin as u64;
                let length = remaining.min(self.block_size as u64) as u32;
                return Some((begin, length));
            }
            begin += self.block_size;
        }
        None
    }

    fn reset_piece(&mut self, index: usize) {
        let record = &mut self.pieces[index];
        record.state = PieceState::Missing;
        record.blocks.clear();
    }
}

impl PieceManager for RarestFirstManager {
    fn next_request(&mut self, peer: PeerId, view: &PeerView) -> Option<(usize, u32, u32)> {
        if self.peer_in_flight_count(peer) >= self.pipeline_depth {
            return None;
        }

        let mut candidates: Vec<usize> = (0..self.pieces.len())
            .filter(|&i| view.has(i) && !matches!(self.pieces[i].state, PieceState::Complete))
            .collect();
        candidates.sort_by_key(|&i| (self.rarity[i], i));

        for index in candidates {
            if let Some((begin, length)) = self.next_unrequested_block(index) {
                let block = BlockId { index, begin };
                let record = &mut self.pieces[index];
                match &mut record.state {
                    PieceState::InProgress { requested } => requested.push(block),
                    _ => record.state = PieceState::InProgress { requested: vec![block] },
                }
                self.in_flight.entry(peer).or_default().push(block);
                return Some((index, begin, length));
            }
        }
        None
    }

    fn on_have(&mut self, peer: PeerId, index: usize) {
        let view = self.peer_views.entry(peer).or_default();
        if !view.has(index) {
            view.mark_have(index);
            self.rarity[index] += 1;
        }
    }

    fn on_bitfield(&mut self, peer: PeerId, bits: &[u8]) {
        let view = PeerView::from_bitfield(bits, self.pieces.len());
        for &index in &view.pieces {
            self.rarity[index] += 1;
        }
        self.peer_views.insert(peer, view);
    }

    fn on_block(&mut self, peer: PeerId, index: usize, begin: u32, bytes: Vec<u8>) -> Option<Vec<u8>> {
        if let Some(requests) = self.in_flight.get_mut(&peer) {
            requests.retain(|b| !(b.index == index && b.begin == begin));
        }

        let record = self.pieces.get_mut(index)?;
        if matches!(record.state, PieceState::Complete) {
            return None; // duplicate delivery after completion, ignore
        }
        record.blocks.insert(begin, bytes);

        let received: u64 = record.blocks.values().map(|b| b.len() as u64).sum();
        if received < record.size {
            return None;
        }

        let mut assembled = Vec::with_capacity(record.size as usize);
        let mut offset = 0u32;
        while (offset as u64) < record.size {
            match record.blocks.get(&offset) {
                Some(chunk) => {
                    assembled.extend_from_slice(chunk);
                    offset += chunk.len() as u32;
                }
                None => return None, // gap, still waiting on a block
            }
        }

        let mut hasher = Sha1::new();
        hasher.update(&assembled);
        let digest: [u8; 20] = hasher.finalize().into();

        if digest != record.hash {
            warn!(index, "piece hash mismatch, discarding and re-requesting");
            self.reset_piece(index);
            return None;
        }

        let record = &mut self.pieces[index];
        record.state = PieceState::Complete;
        record.blocks.clear();
        Some(assembled)
    }

    fn on_peer_disconnect(&mut self, peer: PeerId) {
        if let Some(requests) = self.in_flight.remove(&peer) {
            for block in requests {
                if let Some(record) = self.pieces.get_mut(block.index) {
                    if let PieceState::InProgress { requested } = &mut record.state {
                        requested.retain(|b| b.begin != block.begin);
                    }
                }
            }
        }
        if let Some(view) = self.peer_views.remove(&peer) {
            for index in view.pieces {
                if let Some(r) = self.rarity.get_mut(index) {
                    *r = r.saturating_sub(1);
                }
            }
        }
    }

    fn is_complete(&self, index: usize) -> bool {
        self.pieces.get(index).is_some_and(|r| matches!(r.state, PieceState::Complete))
    }

    fn all_complete(&self) -> bool {
        self.pieces.iter().all(|r| matches!(r.state, PieceState::Complete))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::Torrent;

    fn fixture_torrent(piece_count: usize, piece_data: &[Vec<u8>]) -> Torrent {
        let piece_length = 16u32; // one block per piece, small fixture
        let mut pieces_hashes = Vec::new();
        for data in piece_data {
            let mut hasher = Sha1::new();
            hasher.update(data);
            pieces_hashes.extend_from_slice(&hasher.finalize());
        }
        let mut buf = Vec::new();
        buf.extend(format!("d8:announce3:foo4:infod6:lengthi{}e4:name1:a12:piece lengthi{}e6:pieces{}:", piece_count as u64 * piece_length as u64, piece_length, pieces_hashes.len()).as_bytes());
        buf.extend(&pieces_hashes);
        buf.extend(b"ee");
        Torrent::parse(&buf).unwrap()
    }

    #[test]
    fn rarest_piece_is_offered_first() {
        let data = vec![vec![1u8; 16], vec![2u8; 16]];
        let torrent = fixture_torrent(2, &data);
        let mut mgr = RarestFirstManager::new(&torrent, DEFAULT_PIPELINE_DEPTH);

        // peer 1 and peer 3 both have piece 0; only peer 1 has piece 1 ->
        // piece 1 is rarer.
        let mut view_a = PeerView::default();
        view_a.mark_have(0);
        view_a.mark_have(1);
        mgr.on_have(1, 0);
        mgr.on_have(1, 1);
        mgr.on_have(3, 0);

        let req = mgr.next_request(1, &view_a).unwrap();
        assert_eq!(req.0, 1, "rarer piece should be requested first");
    }

    #[test]
    fn disconnect_frees_in_flight_blocks() {
        let data = vec![vec![1u8; 16]];
        let torrent = fixture_torrent(1, &data);
        let mut mgr = RarestFirstManager::new(&torrent, DEFAULT_PIPELINE_DEPTH);
        mgr.on_have(1, 0);
        let mut view = PeerView::default();
        view.mark_have(0);

        let first = mgr.next_request(1, &view).unwrap();
        assert_eq!(first, (0, 0, 16));
        assert_eq!(mgr.next_request(1, &view), None, "only one block for this tiny piece");

        mgr.on_peer_disconnect(1);

        let reassigned = mgr.next_request(2, &view).unwrap();
        assert_eq!(reassigned, (0, 0, 16));
    }

    #[test]
    fn completes_and_verifies_piece_from_blocks() {
        let data = vec![vec![7u8; 16]];
        let torrent = fixture_torrent(1, &data);
        let mut mgr = RarestFirstManager::new(&torrent, DEFAULT_PIPELINE_DEPTH);
        let result = mgr.on_block(1, 0, 0, data[0].clone());
        assert_eq!(result, Some(data[0].clone()));
        assert!(mgr.is_complete(0));
    }

    #[test]
    fn mismatched_hash_discards_and_resets() {
        let data = vec![vec![7u8; 16]];
        let torrent = fixture_torrent(1, &data);
        let mut mgr = RarestFirstManager::new(&torrent, DEFAULT_PIPELINE_DEPTH);
        let result = mgr.on_block(1, 0, 0, vec![9u8; 16]);
        assert_eq!(result, None);
        assert!(!mgr.is_complete(0));
    }
}
