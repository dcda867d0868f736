//! Magnet link parsing
//!
//! A magnet link carries the swarm identity (info-hash) plus optional
//! hints: display name, exact content length, tracker URLs. Everything
//! else about the torrent arrives later through the metadata exchange.
//!
//! Format: `magnet:?xt=urn:btih:<hash>&dn=<name>&xl=<len>&tr=<tracker>`

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;

/// Parsed magnet link: a partial torrent descriptor.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    /// Info hash (20 bytes)
    pub info_hash: Sha1Hash,
    /// Display name hint (`dn`)
    pub display_name: Option<String>,
    /// Exact content length hint (`xl`)
    pub exact_length: Option<u64>,
    /// Tracker URLs (`tr`, repeatable)
    pub trackers: Vec<String>,
}

impl MagnetLink {
    /// Parse a magnet link.
    ///
    /// The `xt=urn:btih:` parameter is required and must carry a 40-digit
    /// hex or 32-character base32 hash. Unknown parameters are ignored.
    pub fn parse(uri: &str) -> Result<Self> {
        let query = uri.strip_prefix("magnet:?").ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::InvalidMagnet,
                "URI must start with 'magnet:?'",
            )
        })?;

        let mut info_hash: Option<Sha1Hash> = None;
        let mut display_name = None;
        let mut exact_length = None;
        let mut trackers = Vec::new();

        for param in query.split('&') {
            let Some((key, raw_value)) = param.split_once('=') else {
                continue;
            };
            let value = percent_decode(raw_value);

            // Hybrid links number their topics ("xt.1", "xt.2")
            match key {
                "xt" | "xt.1" | "xt.2" => {
                    if let Some(encoded) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(decode_btih(encoded)?);
                    }
                }
                "dn" => {
                    if !value.is_empty() {
                        display_name = Some(value);
                    }
                }
                "xl" => {
                    exact_length = value.parse().ok();
                }
                "tr" => {
                    if !value.is_empty() {
                        trackers.push(value);
                    }
                }
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::InvalidMagnet,
                "missing xt=urn:btih parameter",
            )
        })?;

        Ok(Self {
            info_hash,
            display_name,
            exact_length,
            trackers,
        })
    }
}

/// Decode the hash part of an `urn:btih:` topic.
fn decode_btih(s: &str) -> Result<Sha1Hash> {
    match s.len() {
        40 => decode_hex(s),
        32 => decode_base32(s),
        n => Err(EngineError::protocol(
            ProtocolErrorKind::InvalidMagnet,
            format!("btih hash has {} characters, expected 40 or 32", n),
        )),
    }
}

fn decode_hex(s: &str) -> Result<Sha1Hash> {
    let mut hash = [0u8; 20];
    let bytes = s.as_bytes();
    for (i, out) in hash.iter_mut().enumerate() {
        let pair = std::str::from_utf8(&bytes[i * 2..i * 2 + 2]).map_err(|_| bad_hex())?;
        *out = u8::from_str_radix(pair, 16).map_err(|_| bad_hex())?;
    }
    Ok(hash)
}

fn bad_hex() -> EngineError {
    EngineError::protocol(
        ProtocolErrorKind::InvalidMagnet,
        "btih hash contains non-hex characters",
    )
}

/// RFC 4648 base32, as produced by older magnet generators. 32 characters
/// decode to exactly 160 bits with no padding.
fn decode_base32(s: &str) -> Result<Sha1Hash> {
    let mut hash = [0u8; 20];
    let mut acc: u64 = 0;
    let mut acc_bits = 0u32;
    let mut out = 0usize;

    for c in s.chars() {
        let value = match c {
            'A'..='Z' => c as u64 - 'A' as u64,
            'a'..='z' => c as u64 - 'a' as u64,
            '2'..='7' => c as u64 - '2' as u64 + 26,
            _ => {
                return Err(EngineError::protocol(
                    ProtocolErrorKind::InvalidMagnet,
                    format!("invalid base32 character '{}'", c),
                ))
            }
        };
        acc = (acc << 5) | value;
        acc_bits += 5;
        if acc_bits >= 8 {
            acc_bits -= 8;
            hash[out] = (acc >> acc_bits) as u8;
            out += 1;
        }
    }
    Ok(hash)
}

/// Percent-decoding with `+` as space. Malformed escapes pass through
/// untouched; magnet links in the wild are not reliably well-formed.
/// Works on raw bytes: an escape may sit next to multi-byte text.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = bytes.get(i + 1).copied().and_then(hex_nibble);
                let lo = bytes.get(i + 2).copied().and_then(hex_nibble);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push(hi << 4 | lo);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
