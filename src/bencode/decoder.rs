//! Bencode decoding.
//!
//! Every decode function takes the remaining input slice and returns the
//! decoded value together with the unconsumed tail. Because the tail is a
//! sub-slice of the caller's input, the number of bytes a sub-value
//! consumed is always `input.len() - tail.len()` — this is how the
//! metainfo layer recovers the exact raw bytes of the `info` dictionary for
//! info-hash computation, without re-encoding anything.
use std::collections::BTreeMap;

use tracing::instrument;

use super::{BencodeError, BencodeResult, BencodeValue};

/// Decodes a single top-level bencode value. Fails if any bytes remain
/// after the value.
#[instrument(skip(data), level = "debug")]
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    let (value, rest) = decode_value(data)?;
    if !rest.is_empty() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

/// Decodes one bencode value from the front of `data`, returning it along
/// with whatever bytes remain after it.
#[instrument(skip(data), level = "trace")]
pub fn decode_value(data: &[u8]) -> BencodeResult<(BencodeValue, &[u8])> {
    match data.first() {
        None => Err(BencodeError::UnexpectedEof),
        Some(b'i') => {
            let (i, rest) = decode_integer(data)?;
            Ok((BencodeValue::Integer(i), rest))
        }
        Some(b'0'..=b'9') => {
            let (s, rest) = decode_string(data)?;
            Ok((BencodeValue::String(s), rest))
        }
        Some(b'l') => decode_list(data),
        Some(b'd') => decode_dict(data),
        Some(&c) => Err(BencodeError::InvalidFormat(format!(
            "unexpected leading byte {:#04x}",
            c
        ))),
    }
}

/// Decodes a bencode byte string: `<len>:<bytes>`.
#[instrument(skip(data), level = "trace")]
pub fn decode_string(data: &[u8]) -> BencodeResult<(Vec<u8>, &[u8])> {
    let colon = data
        .iter()
        .position(|&b| b == b':')
        .ok_or(BencodeError::UnexpectedEof)?;
    let len_bytes = &data[..colon];
    if len_bytes.is_empty() || !len_bytes.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidStringLength);
    }
    let len: usize = std::str::from_utf8(len_bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::InvalidStringLength)?;

    let body_start = colon + 1;
    let body_end = body_start
        .checked_add(len)
        .ok_or(BencodeError::InvalidStringLength)?;
    if body_end > data.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    Ok((data[body_start..body_end].to_vec(), &data[body_end..]))
}

/// Decodes a bencode integer: `i<digits>e`. Rejects leading zeros and `-0`,
/// per canonical bencode.
#[instrument(skip(data), level = "trace")]
pub fn decode_integer(data: &[u8]) -> BencodeResult<(i64, &[u8])> {
    if data.first() != Some(&b'i') {
        return Err(BencodeError::InvalidFormat("integer must start with 'i'".into()));
    }
    let end = data
        .iter()
        .position(|&b| b == b'e')
        .ok_or(BencodeError::UnexpectedEof)?;
    let digits = &data[1..end];

    let (negative, magnitude) = match digits.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, digits),
    };
    if magnitude.is_empty() || !magnitude.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidInteger);
    }
    if magnitude.len() > 1 && magnitude[0] == b'0' {
        return Err(BencodeError::InvalidInteger);
    }
    if negative && magnitude == b"0" {
        return Err(BencodeError::InvalidInteger);
    }

    let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;
    let value = text.parse::<i64>().map_err(|_| BencodeError::InvalidInteger)?;
    Ok((value, &data[end + 1..]))
}

/// Decodes a bencode list: `l<items>e`.
#[instrument(skip(data), level = "trace")]
fn decode_list(data: &[u8]) -> BencodeResult<(BencodeValue, &[u8])> {
    debug_assert_eq!(data.first(), Some(&b'l'));
    let mut rest = &data[1..];
    let mut items = Vec::new();
    loop {
        match rest.first() {
            None => return Err(BencodeError::UnexpectedEof),
            Some(b'e') => {
                rest = &rest[1..];
                break;
            }
            _ => {
                let (item, tail) = decode_value(rest)?;
                items.push(item);
                rest = tail;
            }
        }
    }
    Ok((BencodeValue::List(items), rest))
}

/// Decodes a bencode dictionary: `d<key><value>...e`. Keys must be byte
/// strings; duplicate keys are rejected.
#[instrument(skip(data), level = "trace")]
fn decode_dict(data: &[u8]) -> BencodeResult<(BencodeValue, &[u8])> {
    debug_assert_eq!(data.first(), Some(&b'd'));
    let mut rest = &data[1..];
    let mut entries = BTreeMap::new();
    loop {
        match rest.first() {
            None => return Err(BencodeError::UnexpectedEof),
            Some(b'e') => {
                rest = &rest[1..];
                break;
            }
            Some(b'0'..=b'9') => {
                let (key, tail) = decode_string(rest)?;
                let (value, tail) = decode_value(tail)?;
                if entries.insert(key, value).is_some() {
                    return Err(BencodeError::DuplicateKey);
                }
                rest = tail;
            }
            _ => return Err(BencodeError::DictKeyNotString),
        }
    }
    Ok((BencodeValue::Dict(entries), rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(bytes: &[u8]) -> BencodeValue {
        BencodeValue::String(bytes.to_vec())
    }

    #[test]
    fn decodes_integer() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-1e").unwrap(), BencodeValue::Integer(-1));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
    }

    #[test]
    fn decodes_string() {
        assert_eq!(decode(b"4:spam").unwrap(), s(b"spam"));
        assert_eq!(decode(b"0:").unwrap(), s(b""));
    }

    #[test]
    fn decodes_list() {
        let BencodeValue::List(items) = decode(b"l3:bar3:foo4:spami42ee").unwrap() else {
            panic!("expected list");
        };
        assert_eq!(items, vec![s(b"bar"), s(b"foo"), s(b"spam"), BencodeValue::Integer(42)]);
    }

    #[test]
    fn decodes_dict() {
        let BencodeValue::Dict(map) = decode(b"d3:bar4:spam3:fooi42ee").unwrap() else {
            panic!("expected dict");
        };
        assert_eq!(map.get(b"bar".as_slice()), Some(&s(b"spam")));
        assert_eq!(map.get(b"foo".as_slice()), Some(&BencodeValue::Integer(42)));
    }

    #[test]
    fn decodes_failure_reason_dict() {
        let input =
            b"d14:failure reason63:Requested download is not authorized for use with this tracker.e";
        let BencodeValue::Dict(map) = decode(input).unwrap() else {
            panic!("expected dict");
        };
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.get(b"failure reason".as_slice()),
            Some(&s(b"Requested download is not authorized for use with this tracker."))
        );
    }

    #[test]
    fn rejects_negative_zero() {
        assert!(matches!(decode(b"i-0e"), Err(BencodeError::InvalidInteger)));
    }

    #[test]
    fn rejects_leading_zero() {
        assert!(matches!(decode(b"i03e"), Err(BencodeError::InvalidInteger)));
    }

    #[test]
    fn rejects_short_string() {
        assert!(matches!(decode(b"3:ab"), Err(BencodeError::UnexpectedEof)));
    }

    #[test]
    fn rejects_unterminated_list() {
        assert!(matches!(decode(b"l"), Err(BencodeError::UnexpectedEof)));
    }

    #[test]
    fn rejects_unterminated_dict_entry() {
        assert!(matches!(decode(b"d1:ai1e"), Err(BencodeError::UnexpectedEof)));
    }

    #[test]
    fn rejects_non_string_dict_key() {
        assert!(matches!(decode(b"di1ei2ee"), Err(BencodeError::DictKeyNotString)));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(matches!(decode(b"4:abcdX"), Err(BencodeError::TrailingBytes)));
    }

    #[test]
    fn rejects_duplicate_keys() {
        assert!(matches!(
            decode(b"d1:ai1e1:ai2ee"),
            Err(BencodeError::DuplicateKey)
        ));
    }
}
