//! Library root for rstc, a leech-only BitTorrent v1 client.
//!
//! Re-exports core modules: bencode, torrent, tracker, peer, piece,
//! storage, config, and orchestrator for use in binaries and other
//! libraries.
pub mod bencode;
pub mod config;
pub mod orchestrator;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod torrent;
pub mod tracker;
