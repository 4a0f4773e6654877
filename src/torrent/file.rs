//! `.torrent` file structure and parsing.
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::instrument;

use crate::bencode::{decoder, BencodeValue};

use super::info_hash::calculate_info_hash;
use super::{MetainfoError, MetainfoResult};

/// Either a single-file or multi-file torrent layout, selected by which of
/// `length`/`files` was present in the `info` dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    SingleFile { length: u64 },
    MultiFile { files: Vec<TorrentFileEntry> },
}

/// One entry of a multi-file torrent's `files` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFileEntry {
    pub length: u64,
    pub path: Vec<String>,
}

/// The parsed `info` sub-dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u32,
    /// Concatenated 20-byte SHA-1 hashes, one per piece.
    pub pieces: Vec<u8>,
    pub mode: Mode,
}

impl TorrentInfo {
    pub fn num_pieces(&self) -> usize {
        self.pieces.len() / 20
    }

    pub fn piece_hash(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(20)?;
        self.pieces.get(start..start + 20)
    }
}

/// A fully parsed `.torrent` file plus its info-hash.
///
/// Everything here is immutable and owned independently of any download
/// session; peer-id, advertised port, and the downloaded-bytes counter live
/// on the session that wraps a `Torrent` (see [`crate::orchestrator`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Torrent {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<SystemTime>,
    pub info: TorrentInfo,
    pub info_hash: [u8; 20],
    pub total_size: u64,
}

impl Torrent {
    /// Parses a `.torrent` byte blob.
    #[instrument(skip(data), level = "debug")]
    pub fn parse(data: &[u8]) -> MetainfoResult<Torrent> {
        let (raw_info, top) = parse_top_level_dict(data)?;

        let announce = take_string(&top, "announce")?;
        let announce_list = match top.get("announce-list") {
            Some(value) => parse_announce_list(value)?,
            None => Vec::new(),
        };
        let comment = top.get("comment").and_then(value_as_text);
        let created_by = top.get("created by").and_then(value_as_text);
        let creation_date = top
            .get("creation date")
            .and_then(BencodeValue::as_integer)
            .and_then(|secs| u64::try_from(secs).ok())
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));

        let info_value = top
            .get("info")
            .ok_or(MetainfoError::MissingKey("info"))?;
        let info = parse_info(info_value)?;

        let info_hash = calculate_info_hash(&raw_info);
        let total_size = match &info.mode {
            Mode::SingleFile { length } => *length,
            Mode::MultiFile { files } => files.iter().map(|f| f.length).sum(),
        };

        Ok(Torrent {
            announce,
            announce_list,
            comment,
            created_by,
            creation_date,
            info,
            info_hash,
            total_size,
        })
    }

    pub fn piece_size(&self, index: usize) -> u64 {
        let num_pieces = self.info.num_pieces();
        if index >= num_pieces {
            return 0;
        }
        if index < num_pieces - 1 {
            self.info.piece_length as u64
        } else {
            let full = (num_pieces - 1) as u64 * self.info.piece_length as u64;
            self.total_size.saturating_sub(full)
        }
    }

    /// File paths (relative to `name`) that overlap piece `index`.
    pub fn file_paths_for_piece(&self, index: usize) -> Vec<PathBuf> {
        if index >= self.info.num_pieces() {
            return Vec::new();
        }
        let piece_start = index as u64 * self.info.piece_length as u64;
        let piece_end = piece_start + self.piece_size(index);

        match &self.info.mode {
            Mode::SingleFile { .. } => vec![PathBuf::from(&self.info.name)],
            Mode::MultiFile { files } => {
                let mut paths = Vec::new();
                let mut cursor = 0u64;
                for entry in files {
                    let file_start = cursor;
                    let file_end = file_start + entry.length;
                    if file_end > piece_start && file_start < piece_end {
                        let mut path = PathBuf::from(&self.info.name);
                        path.extend(&entry.path);
                        paths.push(path);
                    }
                    cursor = file_end;
                }
                paths
            }
        }
    }
}

/// A small, string-keyed view over the top-level dictionary, built once so
/// field lookups below don't repeat `b"...".to_vec()` allocations.
struct TopLevel(std::collections::HashMap<String, BencodeValue>);

impl TopLevel {
    fn get(&self, key: &str) -> Option<&BencodeValue> {
        self.0.get(key)
    }
}

fn value_as_text(value: &BencodeValue) -> Option<String> {
    value
        .as_str()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

fn take_string(top: &TopLevel, key: &'static str) -> MetainfoResult<String> {
    let value = top.get(key).ok_or(MetainfoError::MissingKey(key))?;
    value_as_text(value).ok_or(MetainfoError::WrongType(key))
}

/// Walks the top-level dictionary by hand (rather than via the generic
/// recursive decoder) so that the exact raw bytes of the `info` value can
/// be sliced out of the original buffer as it is encountered.
fn parse_top_level_dict(data: &[u8]) -> MetainfoResult<(Vec<u8>, TopLevel)> {
    if data.first() != Some(&b'd') {
        return Err(MetainfoError::RootNotDict);
    }
    let mut rest = &data[1..];
    let mut map = std::collections::HashMap::new();
    let mut raw_info: Option<Vec<u8>> = None;

    loop {
        match rest.first() {
            None => return Err(crate::bencode::BencodeError::UnexpectedEof.into()),
            Some(b'e') => {
                rest = &rest[1..];
                break;
            }
            Some(b'0'..=b'9') => {
                let (key_bytes, after_key) = decoder::decode_string(rest)?;
                let key = String::from_utf8_lossy(&key_bytes).into_owned();
                if key == "info" {
                    let (value, after_value) = decoder::decode_value(after_key)?;
                    let consumed = after_key.len() - after_value.len();
                    raw_info = Some(after_key[..consumed].to_vec());
                    map.insert(key, value);
                    rest = after_value;
                } else {
                    let (value, after_value) = decoder::decode_value(after_key)?;
                    map.insert(key, value);
                    rest = after_value;
                }
            }
            _ => return Err(crate::bencode::BencodeError::DictKeyNotString.into()),
        }
    }

    let raw_info = raw_info.ok_or(MetainfoError::MissingKey("info"))?;
    Ok((raw_info, TopLevel(map)))
}

fn parse_announce_list(value: &BencodeValue) -> MetainfoResult<Vec<Vec<String>>> {
    let tiers = value
        .as_list()
        .ok_or(MetainfoError::WrongType("announce-list"))?;
    tiers
        .iter()
        .map(|tier| {
            let urls = tier
                .as_list()
                .ok_or(MetainfoError::WrongType("announce-list tier"))?;
            urls.iter()
                .map(|url| value_as_text(url).ok_or(MetainfoError::WrongType("announce-list url")))
                .collect()
        })
        .collect()
}

fn parse_info(value: &BencodeValue) -> MetainfoResult<TorrentInfo> {
    let dict = value.as_dict().ok_or(MetainfoError::WrongType("info"))?;

    let name = dict
        .get(b"name".as_slice())
        .and_then(value_as_text)
        .ok_or(MetainfoError::MissingKey("name"))?;

    let piece_length = dict
        .get(b"piece length".as_slice())
        .and_then(BencodeValue::as_integer)
        .ok_or(MetainfoError::MissingKey("piece length"))?;
    if piece_length <= 0 {
        return Err(MetainfoError::BadPieceLength(piece_length));
    }
    let piece_length = piece_length as u32;

    let pieces = dict
        .get(b"pieces".as_slice())
        .and_then(BencodeValue::as_str)
        .ok_or(MetainfoError::MissingKey("pieces"))?
        .to_vec();
    if pieces.len() % 20 != 0 {
        return Err(MetainfoError::EmptyPieces(pieces.len()));
    }

    let mode = match dict.get(b"files".as_slice()) {
        Some(BencodeValue::List(entries)) if !entries.is_empty() => {
            let files = entries
                .iter()
                .map(parse_file_entry)
                .collect::<MetainfoResult<Vec<_>>>()?;
            Mode::MultiFile { files }
        }
        _ => {
            let length = dict
                .get(b"length".as_slice())
                .and_then(BencodeValue::as_integer)
                .ok_or(MetainfoError::MissingKey("length"))?;
            Mode::SingleFile { length: length as u64 }
        }
    };

    Ok(TorrentInfo {
        name,
        piece_length,
        pieces,
        mode,
    })
}

fn parse_file_entry(value: &BencodeValue) -> MetainfoResult<TorrentFileEntry> {
    let dict = value.as_dict().ok_or(MetainfoError::WrongType("files[]"))?;
    let length = dict
        .get(b"length".as_slice())
        .and_then(BencodeValue::as_integer)
        .ok_or(MetainfoError::MissingKey("files[].length"))?;
    let path_list = dict
        .get(b"path".as_slice())
        .and_then(BencodeValue::as_list)
        .ok_or(MetainfoError::MissingKey("files[].path"))?;
    let path = path_list
        .iter()
        .map(|p| value_as_text(p).ok_or(MetainfoError::WrongType("files[].path[]")))
        .collect::<MetainfoResult<Vec<_>>>()?;
    Ok(TorrentFileEntry {
        length: length as u64,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let pieces = vec![0xABu8; 20];
        let mut buf = Vec::new();
        buf.extend(b"d8:announce20:http://tracker.test/4:infod6:lengthi1024e4:name8:file.bin12:piece lengthi512e6:pieces20:");
        buf.extend(&pieces);
        buf.extend(b"ee");
        buf
    }

    #[test]
    fn parses_single_file_torrent() {
        let torrent = Torrent::parse(&single_file_torrent()).unwrap();
        assert_eq!(torrent.announce, "http://tracker.test/");
        assert_eq!(torrent.total_size, 1024);
        assert_eq!(torrent.info.num_pieces(), 1);
        assert!(matches!(torrent.info.mode, Mode::SingleFile { length: 1024 }));
    }

    #[test]
    fn info_hash_is_stable_across_reparses() {
        let bytes = single_file_torrent();
        let a = Torrent::parse(&bytes).unwrap();
        let b = Torrent::parse(&bytes).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
        assert_eq!(a.info_hash.len(), 20);
    }

    #[test]
    fn rejects_missing_info() {
        let err = Torrent::parse(b"d8:announce3:fooe").unwrap_err();
        assert!(matches!(err, MetainfoError::MissingKey("info")));
    }

    #[test]
    fn rejects_bad_pieces_length() {
        let buf = b"d8:announce3:foo4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces3:abcee";
        let err = Torrent::parse(buf).unwrap_err();
        assert!(matches!(err, MetainfoError::EmptyPieces(3)));
    }

    #[test]
    fn multi_file_piece_spans_two_files() {
        let pieces = vec![0u8; 40];
        let mut buf = Vec::new();
        buf.extend(b"d8:announce3:foo4:infod5:filesld6:lengthi5e4:pathl1:aeed6:lengthi5e4:pathl1:beee4:name4:root12:piece lengthi8e6:pieces40:");
        buf.extend(&pieces);
        buf.extend(b"ee");
        let torrent = Torrent::parse(&buf).unwrap();
        assert_eq!(torrent.total_size, 10);
        // piece 0 covers bytes [0,8) -> overlaps file a [0,5) and file b [5,10)
        let paths = torrent.file_paths_for_piece(0);
        assert_eq!(paths.len(), 2);
    }
}
