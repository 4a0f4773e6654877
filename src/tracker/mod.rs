//! Tracker client: builds an HTTP announce request from a [`Torrent`] and
//! client state, and parses the bencoded response into a [`TrackerResponse`].
use std::net::Ipv4Addr;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::bencode::{decoder, BencodeValue};
use crate::torrent::Torrent;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// A peer endpoint as surfaced by a tracker: an IPv4 address and port.
/// Opaque beyond equality — two endpoints are equal iff both fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// The outcome of a tracker announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerResponse {
    /// A protocol-level refusal, not a transport error.
    Failure { reason: String },
    Success {
        interval: i64,
        min_interval: Option<i64>,
        warning_message: Option<String>,
        tracker_id: Option<String>,
        complete: Option<i64>,
        incomplete: Option<i64>,
        peers: Vec<PeerEndpoint>,
    },
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker responded with HTTP status {0}")]
    Http(u16),

    #[error("malformed tracker response: {0}")]
    MalformedResponse(String),

    #[error("bad peer list: {0}")]
    BadPeers(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("announce timed out")]
    Timeout,
}

/// Tracker-facing client state: our peer-id and advertised listening port.
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
    http: reqwest::Client,
}

impl Client {
    pub fn new(port: u16) -> Self {
        Self {
            peer_id: generate_peer_id(),
            port,
            http: reqwest::Client::new(),
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Announces to `torrent.announce`, reporting current transfer
    /// counters and an optional lifecycle event
    /// (`"started"`/`"stopped"`/`"completed"`/`""`).
    #[instrument(skip(self, torrent), fields(announce = %torrent.announce), level = "debug")]
    pub async fn announce(
        &self,
        torrent: &Torrent,
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: &str,
    ) -> Result<TrackerResponse, TrackerError> {
        let url = self.build_announce_url(torrent, uploaded, downloaded, left, event);
        debug!(%url, "sending announce request");

        let response = tokio::time::timeout(ANNOUNCE_TIMEOUT, self.http.get(&url).send())
            .await
            .map_err(|_| TrackerError::Timeout)??;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(TrackerError::Http(status.as_u16()));
        }

        let body = response.bytes().await?;
        parse_announce_response(&body)
    }

    fn build_announce_url(
        &self,
        torrent: &Torrent,
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: &str,
    ) -> String {
        let sep = if torrent.announce.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{announce}{sep}info_hash={info_hash}&peer_id={peer_id}&port={port}&uploaded={uploaded}&downloaded={downloaded}&left={left}&compact=1",
            announce = torrent.announce,
            sep = sep,
            info_hash = percent_encode_bytes(&torrent.info_hash),
            peer_id = percent_encode_bytes(&self.peer_id),
            port = self.port,
            uploaded = uploaded,
            downloaded = downloaded,
            left = left,
        );
        if !event.is_empty() {
            url.push_str("&event=");
            url.push_str(event);
        }
        url
    }
}

/// Generates a process-local peer-id: `-RT0001-` followed by 12 random
/// alphanumeric bytes, generated once at client construction.
fn generate_peer_id() -> [u8; 20] {
    const PREFIX: &[u8; 8] = b"-RT0001-";
    const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PREFIX);
    let mut rng = rand::rng();
    for byte in &mut id[8..] {
        *byte = ALNUM[rng.random_range(0..ALNUM.len())];
    }
    id
}

/// Percent-encodes every byte outside the unreserved set `A-Za-z0-9-_.~`,
/// octet-by-octet. Used for `info_hash` and `peer_id`, which are raw
/// 20-byte values, not text.
fn percent_encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn parse_announce_response(body: &[u8]) -> Result<TrackerResponse, TrackerError> {
    let value = decoder::decode(body)
        .map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;
    let dict = value
        .as_dict()
        .ok_or_else(|| TrackerError::MalformedResponse("top-level value is not a dict".into()))?;

    if let Some(reason) = dict.get(b"failure reason".as_slice()).and_then(BencodeValue::as_str) {
        return Ok(TrackerResponse::Failure {
            reason: String::from_utf8_lossy(reason).into_owned(),
        });
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(BencodeValue::as_integer)
        .ok_or_else(|| TrackerError::MalformedResponse("missing interval".into()))?;
    let min_interval = dict.get(b"min interval".as_slice()).and_then(BencodeValue::as_integer);
    let warning_message = dict
        .get(b"warning message".as_slice())
        .and_then(BencodeValue::as_str)
        .map(|b| String::from_utf8_lossy(b).into_owned());
    let tracker_id = dict
        .get(b"tracker id".as_slice())
        .and_then(BencodeValue::as_str)
        .map(|b| String::from_utf8_lossy(b).into_owned());
    let complete = dict.get(b"complete".as_slice()).and_then(BencodeValue::as_integer);
    let incomplete = dict.get(b"incomplete".as_slice()).and_then(BencodeValue::as_integer);

    let peers = match dict.get(b"peers".as_slice()) {
        Some(BencodeValue::String(blob)) => parse_compact_peers(blob)?,
        Some(BencodeValue::List(entries)) => parse_dict_peers(entries)?,
        _ => Vec::new(),
    };

    Ok(TrackerResponse::Success {
        interval,
        min_interval,
        warning_message,
        tracker_id,
        complete,
        incomplete,
        peers,
    })
}

fn parse_compact_peers(blob: &[u8]) -> Result<Vec<PeerEndpoint>, TrackerError> {
    if blob.len() % 6 != 0 {
        return Err(TrackerError::BadPeers(format!(
            "compact peers blob length {} is not a multiple of 6",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(6)
        .map(|chunk| PeerEndpoint {
            ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect())
}

fn parse_dict_peers(entries: &[BencodeValue]) -> Result<Vec<PeerEndpoint>, TrackerError> {
    entries
        .iter()
        .map(|entry| {
            let dict = entry
                .as_dict()
                .ok_or_else(|| TrackerError::BadPeers("peer entry is not a dict".into()))?;
            let ip_bytes = dict
                .get(b"ip".as_slice())
                .and_then(BencodeValue::as_str)
                .ok_or_else(|| TrackerError::BadPeers("peer entry missing ip".into()))?;
            let ip_text = std::str::from_utf8(ip_bytes)
                .map_err(|_| TrackerError::BadPeers("peer ip is not UTF-8".into()))?;
            let ip: Ipv4Addr = ip_text
                .parse()
                .map_err(|_| TrackerError::BadPeers(format!("peer ip {ip_text:?} is not IPv4")))?;
            let port = dict
                .get(b"port".as_slice())
                .and_then(BencodeValue::as_integer)
                .ok_or_else(|| TrackerError::BadPeers("peer entry missing port".into()))?;
            Ok(PeerEndpoint { ip, port: port as u16 })
        })
        .collect()
}

/// Backoff schedule used by the orchestrator between failed announces:
/// 5s, 15s, 60s, capped at the last known-good announce interval (if one
/// is shorter than the current ladder step, it wins).
pub fn retry_backoff(attempt: u32, known_interval: Option<Duration>) -> Duration {
    let ladder = match attempt {
        0 => Duration::from_secs(5),
        1 => Duration::from_secs(15),
        _ => Duration::from_secs(60),
    };
    match known_interval {
        Some(interval) => ladder.min(interval),
        None => ladder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_peers_vector() {
        let blob = [0x0Au8, 0x00, 0x00, 0x01, 0x1A, 0xE1, 0xC0, 0xA8, 0x01, 0x02, 0xC8, 0xD5];
        let peers = parse_compact_peers(&blob).unwrap();
        assert_eq!(
            peers,
            vec![
                PeerEndpoint { ip: Ipv4Addr::new(10, 0, 0, 1), port: 6881 },
                PeerEndpoint { ip: Ipv4Addr::new(192, 168, 1, 2), port: 51413 },
            ]
        );
    }

    #[test]
    fn rejects_compact_peers_not_multiple_of_six() {
        let blob = [0u8; 7];
        assert!(parse_compact_peers(&blob).is_err());
    }

    #[test]
    fn percent_encodes_every_non_unreserved_byte() {
        let encoded = percent_encode_bytes(&[0u8; 2]);
        assert_eq!(encoded, "%00%00");
        assert_eq!(percent_encode_bytes(b"abc-._~"), "abc-._~");
    }

    #[test]
    fn parses_failure_reason() {
        let body = b"d14:failure reason5:nope!e";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(
            response,
            TrackerResponse::Failure { reason: "nope!".to_string() }
        );
    }

    #[test]
    fn parses_success_with_compact_peers() {
        let body = b"d8:intervali1800e5:peers12:\x0a\x00\x00\x01\x1a\xe1\xc0\xa8\x01\x02\xc8\xd5e";
        let response = parse_announce_response(body).unwrap();
        match response {
            TrackerResponse::Success { interval, peers, .. } => {
                assert_eq!(interval, 1800);
                assert_eq!(peers.len(), 2);
            }
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn generated_peer_id_has_expected_shape() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-RT0001-");
        assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn backoff_follows_ladder_without_known_interval() {
        assert_eq!(retry_backoff(0, None), Duration::from_secs(5));
        assert_eq!(retry_backoff(1, None), Duration::from_secs(15));
        assert_eq!(retry_backoff(2, None), Duration::from_secs(60));
        assert_eq!(retry_backoff(9, None), Duration::from_secs(60));
    }

    #[test]
    fn backoff_is_capped_at_a_shorter_known_interval() {
        let interval = Duration::from_secs(20);
        assert_eq!(retry_backoff(2, Some(interval)), interval);
        // Early ladder steps shorter than the interval are left alone.
        assert_eq!(retry_backoff(0, Some(interval)), Duration::from_secs(5));
    }

    #[test]
    fn backoff_is_not_raised_by_a_longer_known_interval() {
        let interval = Duration::from_secs(1800);
        assert_eq!(retry_backoff(2, Some(interval)), Duration::from_secs(60));
    }
}
