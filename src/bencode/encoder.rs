//! Bencode encoding. The inverse of [`super::decoder`].
use tracing::instrument;

use super::{BencodeError, BencodeResult, BencodeValue};

/// Encodes `value` and returns the bencoded bytes.
#[instrument(skip(value), level = "debug")]
pub fn encode(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf)?;
    Ok(buf)
}

/// Encodes `value`, appending its bencoded bytes onto `buf`.
#[instrument(skip(value, buf), level = "trace")]
pub fn encode_into(value: &BencodeValue, buf: &mut Vec<u8>) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(s, buf),
        BencodeValue::Integer(i) => encode_integer(*i, buf),
        BencodeValue::List(items) => {
            buf.push(b'l');
            for item in items {
                encode_into(item, buf)?;
            }
            buf.push(b'e');
            Ok(())
        }
        BencodeValue::Dict(map) => {
            buf.push(b'd');
            // `BTreeMap` iterates in ascending key order already, so this
            // always emits keys sorted lexicographically by raw bytes.
            for (key, val) in map {
                encode_string(key, buf)?;
                encode_into(val, buf)?;
            }
            buf.push(b'e');
            Ok(())
        }
    }
}

fn encode_string(s: &[u8], buf: &mut Vec<u8>) -> BencodeResult<()> {
    buf.extend_from_slice(s.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(s);
    Ok(())
}

fn encode_integer(i: i64, buf: &mut Vec<u8>) -> BencodeResult<()> {
    buf.push(b'i');
    buf.extend_from_slice(i.to_string().as_bytes());
    buf.push(b'e');
    Ok(())
}
