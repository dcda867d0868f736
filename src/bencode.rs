//! Bencode decoding and encoding
//!
//! Hand-rolled parser for the torrent metadata format. Decoding is
//! tolerant of unsorted dictionary keys (seen in the wild) but rejects
//! duplicates, truncated input, and absurd string lengths. The parser
//! tracks byte offsets so the raw span of the `info` value can be
//! recovered exactly as it appeared in the source buffer, which is what
//! the info-hash must be computed over.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Cap on a single byte-string length. Torrent metadata is small; the
/// largest legitimate strings are the concatenated piece hashes.
const MAX_STRING_LEN: usize = 100 * 1024 * 1024;

/// Nesting cap to keep malicious input from exhausting the stack.
const MAX_DEPTH: usize = 64;

/// A decoded bencode value.
#[derive(Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl std::fmt::Debug for Bencode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bencode::Int(n) => write!(f, "Int({})", n),
            Bencode::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "Bytes({:?})", s),
                Err(_) => write!(f, "Bytes(<{} raw bytes>)", b.len()),
            },
            Bencode::List(items) => f.debug_list().entries(items).finish(),
            Bencode::Dict(map) => {
                let mut d = f.debug_map();
                for (k, v) in map {
                    match std::str::from_utf8(k) {
                        Ok(s) => d.entry(&s, v),
                        Err(_) => d.entry(&format!("<{} raw bytes>", k.len()), v),
                    };
                }
                d.finish()
            }
        }
    }
}

impl Bencode {
    /// Decode a buffer that must contain exactly one value.
    pub fn decode(data: &[u8]) -> Result<Bencode> {
        let (value, consumed) = Self::decode_prefix(data)?;
        if consumed != data.len() {
            return Err(parse_err(format!(
                "trailing data after value ({} bytes)",
                data.len() - consumed
            )));
        }
        Ok(value)
    }

    /// Decode one value from the front of `data`, returning it together
    /// with the number of bytes consumed. Extension messages carry raw
    /// payload after the bencoded header, so partial consumption is
    /// normal there.
    pub fn decode_prefix(data: &[u8]) -> Result<(Bencode, usize)> {
        let mut cursor = Cursor { data, pos: 0 };
        let value = cursor.parse_value(0)?;
        Ok((value, cursor.pos))
    }

    /// Encode to a fresh buffer. Dictionary keys are emitted in sorted
    /// order as the format requires.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Int(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            Bencode::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Bencode::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Bencode::Dict(map) => {
                out.push(b'd');
                for (key, value) in map {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Bencode::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Bencode>> {
        match self {
            Bencode::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Dictionary lookup by key. Returns `None` for non-dicts.
    pub fn get(&self, key: &[u8]) -> Option<&Bencode> {
        self.as_dict().and_then(|d| d.get(key))
    }

    pub fn get_int(&self, key: &[u8]) -> Option<i64> {
        self.get(key).and_then(Bencode::as_int)
    }

    pub fn get_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        self.get(key).and_then(Bencode::as_bytes)
    }

    pub fn get_str(&self, key: &[u8]) -> Option<&str> {
        self.get(key).and_then(Bencode::as_str)
    }

    pub fn get_list(&self, key: &[u8]) -> Option<&[Bencode]> {
        self.get(key).and_then(Bencode::as_list)
    }
}

/// Locate the raw byte range of the `info` value inside a bencoded
/// torrent document.
///
/// The top-level dictionary is walked with the same cursor the parser
/// uses, so the returned span covers exactly the bytes a conforming
/// encoder produced for the value, untouched by re-encoding. Hashing
/// that span yields the canonical info-hash even when our in-memory
/// representation would serialize differently.
pub fn info_dict_span(data: &[u8]) -> Result<Range<usize>> {
    let mut cursor = Cursor { data, pos: 0 };
    if cursor.peek() != Some(b'd') {
        return Err(parse_err("torrent root is not a dictionary"));
    }
    cursor.pos += 1;

    while cursor.peek() != Some(b'e') {
        let key = match cursor.parse_value(1)? {
            Bencode::Bytes(k) => k,
            _ => return Err(parse_err("dictionary key is not a string")),
        };
        let start = cursor.pos;
        // Value is parsed for its extent only
        cursor.parse_value(1)?;
        if key == b"info" {
            return Ok(start..cursor.pos);
        }
    }
    Err(parse_err("no info dictionary in torrent"))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn parse_value(&mut self, depth: usize) -> Result<Bencode> {
        if depth > MAX_DEPTH {
            return Err(parse_err("nesting too deep"));
        }
        match self.peek() {
            Some(b'i') => self.parse_int(),
            Some(b'0'..=b'9') => self.parse_bytes().map(Bencode::Bytes),
            Some(b'l') => self.parse_list(depth),
            Some(b'd') => self.parse_dict(depth),
            Some(c) => Err(parse_err(format!(
                "unexpected byte 0x{:02x} at offset {}",
                c, self.pos
            ))),
            None => Err(parse_err("unexpected end of input")),
        }
    }

    fn parse_int(&mut self) -> Result<Bencode> {
        self.pos += 1; // 'i'
        let end = self.find(b'e')?;
        let digits = &self.data[self.pos..end];
        if digits.is_empty() {
            return Err(parse_err("empty integer"));
        }
        let text = std::str::from_utf8(digits)
            .map_err(|_| parse_err("non-ASCII integer"))?;
        let n: i64 = text
            .parse()
            .map_err(|_| parse_err(format!("invalid integer '{}'", text)))?;
        self.pos = end + 1;
        Ok(Bencode::Int(n))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        let colon = self.find(b':')?;
        let len_text = std::str::from_utf8(&self.data[self.pos..colon])
            .map_err(|_| parse_err("non-ASCII string length"))?;
        let len: usize = len_text
            .parse()
            .map_err(|_| parse_err(format!("invalid string length '{}'", len_text)))?;
        if len > MAX_STRING_LEN {
            return Err(parse_err(format!("string length {} exceeds limit", len)));
        }
        let start = colon + 1;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| parse_err("string extends past end of input"))?;
        self.pos = end;
        Ok(self.data[start..end].to_vec())
    }

    fn parse_list(&mut self, depth: usize) -> Result<Bencode> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Bencode::List(items));
                }
                Some(_) => items.push(self.parse_value(depth + 1)?),
                None => return Err(parse_err("unterminated list")),
            }
        }
    }

    fn parse_dict(&mut self, depth: usize) -> Result<Bencode> {
        self.pos += 1; // 'd'
        let mut map = BTreeMap::new();
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Bencode::Dict(map));
                }
                Some(b'0'..=b'9') => {
                    let key = self.parse_bytes()?;
                    let value = self.parse_value(depth + 1)?;
                    if map.insert(key.clone(), value).is_some() {
                        return Err(parse_err(format!(
                            "duplicate dictionary key '{}'",
                            String::from_utf8_lossy(&key)
                        )));
                    }
                }
                Some(_) => return Err(parse_err("dictionary key is not a string")),
                None => return Err(parse_err("unterminated dictionary")),
            }
        }
    }

    fn find(&self, byte: u8) -> Result<usize> {
        self.data[self.pos..]
            .iter()
            .position(|&b| b == byte)
            .map(|i| self.pos + i)
            .ok_or_else(|| parse_err(format!("missing '{}' terminator", byte as char)))
    }
}

fn parse_err(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::BencodeParse, message)
}
