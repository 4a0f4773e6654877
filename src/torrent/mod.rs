//! Metainfo model: parses a `.torrent` file into a typed tree and computes
//! its info-hash.
//!
//! The `info` sub-dictionary's raw bencoded bytes are sliced out of the
//! input during the top-level parse and used directly for the SHA-1
//! info-hash, so hash correctness never depends on the encoder
//! reproducing byte-identical output.
pub mod file;
pub mod info_hash;

pub use file::{Mode, Torrent, TorrentFileEntry, TorrentInfo};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("root value is not a dictionary")]
    RootNotDict,

    #[error("missing required key: {0}")]
    MissingKey(&'static str),

    #[error("wrong type for key: {0}")]
    WrongType(&'static str),

    #[error("pieces length {0} is not a multiple of 20")]
    EmptyPieces(usize),

    #[error("piece length must be positive, got {0}")]
    BadPieceLength(i64),
}

pub type MetainfoResult<T> = std::result::Result<T, MetainfoError>;
