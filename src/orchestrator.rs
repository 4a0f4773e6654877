//! Orchestrator: owns the torrent's download session — the tracker
//! client, the shared piece manager, the peer queue, and the pool of
//! peer worker tasks.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::config::AppConfig;
use crate::peer::{Connection, ConnectionError};
use crate::piece::{PieceManager, RarestFirstManager};
use crate::storage::Storage;
use crate::torrent::Torrent;
use crate::tracker::{self, Client, PeerEndpoint, TrackerResponse};

/// After three consecutive announce failures with an empty peer queue,
/// the orchestrator gives up rather than spin forever against a dead
/// tracker.
const MAX_CONSECUTIVE_ANNOUNCE_FAILURES: u32 = 3;

/// How long a disconnected endpoint is left out of the peer queue before
/// it's eligible to be re-queued from a later announce's peer list.
const ENDPOINT_COOLDOWN: Duration = Duration::from_secs(60);

/// True if `endpoint` ended its last connection recently enough that it
/// should still be skipped.
fn in_cooldown(cooldowns: &HashMap<PeerEndpoint, Instant>, endpoint: &PeerEndpoint, now: Instant) -> bool {
    match cooldowns.get(endpoint) {
        Some(ended_at) => now < *ended_at + ENDPOINT_COOLDOWN,
        None => false,
    }
}

pub struct Orchestrator {
    torrent: Arc<Torrent>,
    tracker: Client,
    piece_manager: Arc<Mutex<dyn PieceManager + Send>>,
    storage: Arc<Storage>,
    max_peers: usize,
    local_peer_id: [u8; 20],
}

impl Orchestrator {
    pub fn new(torrent: Torrent, config: &AppConfig) -> Self {
        let tracker = Client::new(config.port);
        let local_peer_id = tracker.peer_id();
        let piece_manager = RarestFirstManager::new(&torrent, crate::piece::rarest_first::DEFAULT_PIPELINE_DEPTH);
        Self {
            torrent: Arc::new(torrent),
            tracker,
            piece_manager: Arc::new(Mutex::new(piece_manager)),
            storage: Arc::new(Storage::new(config.output.clone())),
            max_peers: config.max_peers,
            local_peer_id,
        }
    }

    /// Runs the download loop until every piece is complete or a fatal
    /// condition is hit (tracker unreachable with no peers after three
    /// announces).
    #[instrument(skip(self), fields(announce = %self.torrent.announce))]
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.storage.prepare(&self.torrent).await?;

        let mut queue: VecDeque<PeerEndpoint> = VecDeque::new();
        let mut active: HashSet<PeerEndpoint> = HashSet::new();
        let mut cooldowns: HashMap<PeerEndpoint, Instant> = HashMap::new();
        let mut tasks: JoinSet<(PeerEndpoint, Result<(), ConnectionError>)> = JoinSet::new();

        let mut last_announce: Option<Instant> = None;
        let mut interval = Duration::from_secs(0);
        let mut known_interval: Option<Duration> = None;
        let mut consecutive_failures = 0u32;
        let mut sent_completed = false;
        let mut next_peer_id: u64 = 0;

        loop {
            let due = match last_announce {
                None => true,
                Some(t) => Instant::now() >= t + interval,
            };

            if due {
                let all_complete = self.all_complete().await;
                let event = if last_announce.is_none() {
                    "started"
                } else if all_complete && !sent_completed {
                    "completed"
                } else {
                    ""
                };

                let left = self.bytes_left().await;
                let downloaded = self.torrent.total_size.saturating_sub(left);
                match self.tracker.announce(&self.torrent, 0, downloaded, left, event).await {
                    Ok(TrackerResponse::Success { interval: iv, peers, .. }) => {
                        interval = Duration::from_secs(iv.max(0) as u64);
                        known_interval = Some(interval);
                        consecutive_failures = 0;
                        if event == "completed" {
                            sent_completed = true;
                        }
                        let now = Instant::now();
                        for peer in peers {
                            if active.contains(&peer) || in_cooldown(&cooldowns, &peer, now) {
                                continue;
                            }
                            active.insert(peer);
                            queue.push_back(peer);
                        }
                    }
                    Ok(TrackerResponse::Failure { reason }) => {
                        warn!(reason, "tracker returned a failure reason");
                        consecutive_failures += 1;
                        interval = tracker::retry_backoff(consecutive_failures, known_interval);
                    }
                    Err(e) => {
                        warn!(error = %e, "announce failed");
                        consecutive_failures += 1;
                        interval = tracker::retry_backoff(consecutive_failures, known_interval);
                    }
                }
                last_announce = Some(Instant::now());
            }

            while tasks.len() < self.max_peers {
                let Some(endpoint) = queue.pop_front() else { break };
                let id = next_peer_id;
                next_peer_id += 1;
                let torrent = self.torrent.clone();
                let piece_manager = self.piece_manager.clone();
                let storage = self.storage.clone();
                let local_peer_id = self.local_peer_id;
                tasks.spawn(async move {
                    let mut connection = Connection::new(id, endpoint);
                    let result = connection.run(torrent, local_peer_id, piece_manager, storage).await;
                    (endpoint, result)
                });
            }

            if self.all_complete().await {
                info!("all pieces verified, download complete");
                break;
            }

            if queue.is_empty() && tasks.is_empty() && consecutive_failures >= MAX_CONSECUTIVE_ANNOUNCE_FAILURES {
                anyhow::bail!(
                    "tracker unreachable and no peers available after {} announces",
                    consecutive_failures
                );
            }

            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let (endpoint, result) = joined?;
                    active.remove(&endpoint);
                    cooldowns.insert(endpoint, Instant::now());
                    if let Err(ConnectionError::Storage(e)) = result {
                        anyhow::bail!("disk storage failure, aborting session: {e}");
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn all_complete(&self) -> bool {
        self.piece_manager.lock().await.all_complete()
    }

    async fn bytes_left(&self) -> u64 {
        let pm = self.piece_manager.lock().await;
        (0..self.torrent.info.num_pieces())
            .filter(|&i| !pm.is_complete(i))
            .map(|i| self.torrent.piece_size(i))
            .sum()
    }

    /// Best-effort final announce; failures here are logged, not
    /// propagated, since the download has already either finished or
    /// been cancelled.
    async fn shutdown(&self) {
        let left = self.bytes_left().await;
        let downloaded = self.torrent.total_size.saturating_sub(left);
        if let Err(e) = self.tracker.announce(&self.torrent, 0, downloaded, left, "stopped").await {
            warn!(error = %e, "best-effort stopped announce failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoint(port: u16) -> PeerEndpoint {
        PeerEndpoint { ip: Ipv4Addr::new(127, 0, 0, 1), port }
    }

    #[test]
    fn freshly_ended_endpoint_is_in_cooldown() {
        let mut cooldowns = HashMap::new();
        let peer = endpoint(6881);
        let now = Instant::now();
        cooldowns.insert(peer, now);
        assert!(in_cooldown(&cooldowns, &peer, now));
        assert!(in_cooldown(&cooldowns, &peer, now + Duration::from_secs(59)));
    }

    #[test]
    fn endpoint_leaves_cooldown_after_the_window_elapses() {
        let mut cooldowns = HashMap::new();
        let peer = endpoint(6881);
        let ended_at = Instant::now();
        cooldowns.insert(peer, ended_at);
        assert!(!in_cooldown(&cooldowns, &peer, ended_at + ENDPOINT_COOLDOWN + Duration::from_secs(1)));
    }

    #[test]
    fn endpoint_never_seen_is_not_in_cooldown() {
        let cooldowns = HashMap::new();
        assert!(!in_cooldown(&cooldowns, &endpoint(6881), Instant::now()));
    }
}
