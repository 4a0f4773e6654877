//! Bencode: the four-type self-describing encoding used by BitTorrent
//! metainfo files and tracker responses.
//!
//! Byte strings are the canonical representation everywhere in this module;
//! values are decoded to UTF-8 text only at the boundaries that need it
//! (the metainfo and tracker layers).
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// A decoded bencode value.
///
/// Dictionary keys are stored in a `BTreeMap` so that re-encoding a value
/// always emits keys in ascending lexicographic order of their raw bytes,
/// per the bencode spec, without a separate sort step at encode time.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Errors produced while decoding or encoding bencode values.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer literal")]
    InvalidInteger,

    #[error("invalid string length prefix")]
    InvalidStringLength,

    #[error("trailing bytes after top-level value")]
    TrailingBytes,

    #[error("dictionary keys must be byte strings")]
    DictKeyNotString,

    #[error("duplicate dictionary key")]
    DuplicateKey,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
