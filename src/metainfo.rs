//! Torrent descriptor
//!
//! Parses .torrent documents (BEP 3) into the static layout the swarm
//! coordinator works against: piece hashes, piece/block sizing, and the
//! mapping from the flat piece address space onto the multi-file byte
//! layout. The descriptor is immutable once constructed; for magnet
//! sessions it is built late, from metadata fetched out of the swarm.

use crate::bencode::{self, Bencode};
use crate::error::{EngineError, ProtocolErrorKind, Result};
use sha1::{Digest, Sha1};
use std::ops::Range;
use std::path::PathBuf;
use tracing::warn;

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

/// Request unit cap. Pieces are fetched in blocks of at most this many
/// bytes; larger requests are rejected by mainstream clients.
pub const MAX_BLOCK_SIZE: u32 = 16384;

/// One file in the torrent's content layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path relative to the torrent root (single component for
    /// single-file torrents)
    pub path: PathBuf,
    /// File length in bytes
    pub length: u64,
    /// Start offset in the concatenated content stream
    pub offset: u64,
}

/// A contiguous run of bytes within one file, produced when a piece or
/// byte range is resolved against the file table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    /// Index into `Torrent::files`
    pub file: usize,
    /// Offset within that file
    pub offset: u64,
    /// Length of the run
    pub len: u64,
}

/// Static torrent descriptor.
#[derive(Debug, Clone)]
pub struct Torrent {
    /// SHA-1 of the raw info dictionary; the swarm identity
    pub info_hash: Sha1Hash,
    /// Torrent name (directory name for multi-file layouts)
    pub name: String,
    /// Announce URLs, primary first, duplicates removed
    pub trackers: Vec<String>,
    /// Nominal piece length in bytes
    pub piece_length: u32,
    /// Per-piece SHA-1 hashes
    pub piece_hashes: Vec<Sha1Hash>,
    /// Content files in stream order
    pub files: Vec<TorrentFile>,
    /// Total content size in bytes
    pub total_size: u64,
    /// Raw bencoded info dictionary, kept for session snapshots
    pub info_bytes: Vec<u8>,
}

impl Torrent {
    /// Parse a .torrent document.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = Bencode::decode(data)?;
        let span = bencode::info_dict_span(data)?;
        let info_bytes = data[span].to_vec();

        let trackers = collect_trackers(&root);
        Self::build(&info_bytes, trackers)
    }

    /// Build a descriptor from a raw info dictionary, as assembled by the
    /// metadata exchange. The caller is responsible for checking the hash
    /// of `info` against the expected swarm identity first.
    pub fn from_info_bytes(info: &[u8], trackers: Vec<String>) -> Result<Self> {
        Self::build(info, trackers)
    }

    fn build(info_bytes: &[u8], trackers: Vec<String>) -> Result<Self> {
        let info = Bencode::decode(info_bytes)?;
        if info.as_dict().is_none() {
            return Err(invalid_torrent("info is not a dictionary"));
        }

        let info_hash: Sha1Hash = Sha1::digest(info_bytes).into();

        let name = info
            .get_str(b"name")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid_torrent("info has no name"))?
            .to_string();

        let piece_length = info
            .get_int(b"piece length")
            .filter(|&n| n > 0)
            .ok_or_else(|| invalid_torrent("missing or invalid piece length"))?;
        let piece_length = u32::try_from(piece_length)
            .map_err(|_| invalid_torrent("piece length too large"))?;
        if !(16 * 1024..=64 * 1024 * 1024).contains(&piece_length) {
            warn!(piece_length, "unusual piece length");
        }

        let pieces_raw = info
            .get_bytes(b"pieces")
            .ok_or_else(|| invalid_torrent("missing pieces"))?;
        if pieces_raw.is_empty() || pieces_raw.len() % 20 != 0 {
            return Err(invalid_torrent(format!(
                "pieces length {} is not a positive multiple of 20",
                pieces_raw.len()
            )));
        }
        let piece_hashes: Vec<Sha1Hash> = pieces_raw
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = parse_files(&info, &name)?;
        let total_size: u64 = files.iter().map(|f| f.length).sum();
        if total_size == 0 {
            return Err(invalid_torrent("torrent has no content"));
        }

        let expected_pieces = total_size.div_ceil(piece_length as u64);
        if piece_hashes.len() as u64 != expected_pieces {
            return Err(invalid_torrent(format!(
                "{} piece hashes for {} bytes at piece length {} (expected {})",
                piece_hashes.len(),
                total_size,
                piece_length,
                expected_pieces
            )));
        }

        Ok(Self {
            info_hash,
            name,
            trackers,
            piece_length,
            piece_hashes,
            files,
            total_size,
            info_bytes: info_bytes.to_vec(),
        })
    }

    /// Number of pieces.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Block size for this torrent: `MAX_BLOCK_SIZE` capped by the piece
    /// length (tiny torrents can have pieces smaller than one block).
    pub fn block_size(&self) -> u32 {
        MAX_BLOCK_SIZE.min(self.piece_length)
    }

    /// Actual size of a piece; only the last piece may be shorter.
    pub fn piece_size(&self, piece: u32) -> u32 {
        if piece + 1 == self.piece_count() {
            let rem = (self.total_size % self.piece_length as u64) as u32;
            if rem != 0 {
                return rem;
            }
        }
        self.piece_length
    }

    /// Number of blocks in a piece.
    pub fn blocks_in_piece(&self, piece: u32) -> u32 {
        self.piece_size(piece).div_ceil(self.block_size())
    }

    /// Exact length of one block; only the final block of the final
    /// piece may be shorter than `block_size()`.
    pub fn block_len(&self, piece: u32, block: u32) -> u32 {
        let piece_size = self.piece_size(piece);
        let start = block * self.block_size();
        debug_assert!(start < piece_size);
        self.block_size().min(piece_size - start)
    }

    /// Absolute content offset of a piece.
    pub fn piece_offset(&self, piece: u32) -> u64 {
        piece as u64 * self.piece_length as u64
    }

    /// Hash a verified piece must match.
    pub fn piece_hash(&self, piece: u32) -> &Sha1Hash {
        &self.piece_hashes[piece as usize]
    }

    /// Pieces overlapping the byte range `[offset, offset + len)`,
    /// clamped to the content size.
    pub fn pieces_for_range(&self, offset: u64, len: u64) -> Range<u32> {
        let end = offset.saturating_add(len).min(self.total_size);
        if offset >= end {
            return 0..0;
        }
        let first = (offset / self.piece_length as u64) as u32;
        let last = ((end - 1) / self.piece_length as u64) as u32;
        first..last + 1
    }

    /// Resolve a byte range of the content stream into per-file runs.
    ///
    /// A piece near a file boundary straddles: the first run ends at the
    /// boundary (write-first), interior files are covered whole, and the
    /// final run starts at a file's beginning (write-last). Zero-length
    /// files produce no runs.
    pub fn slices_for_range(&self, start: u64, len: u64) -> Vec<FileSlice> {
        let end = start.saturating_add(len).min(self.total_size);
        let mut slices = Vec::new();
        if start >= end {
            return slices;
        }

        let first = self
            .files
            .partition_point(|f| f.offset + f.length <= start);
        for (i, file) in self.files.iter().enumerate().skip(first) {
            if file.offset >= end {
                break;
            }
            let slice_start = start.max(file.offset);
            let slice_end = end.min(file.offset + file.length);
            if slice_end > slice_start {
                slices.push(FileSlice {
                    file: i,
                    offset: slice_start - file.offset,
                    len: slice_end - slice_start,
                });
            }
        }
        slices
    }

    /// Per-file runs covering one whole piece, in buffer order.
    pub fn slices_for_piece(&self, piece: u32) -> Vec<FileSlice> {
        self.slices_for_range(self.piece_offset(piece), self.piece_size(piece) as u64)
    }

    /// Info hash as lowercase hex, for logging and snapshot names.
    pub fn info_hash_hex(&self) -> String {
        hash_hex(&self.info_hash)
    }
}

/// Lowercase hex rendering of a 20-byte hash.
pub fn hash_hex(hash: &Sha1Hash) -> String {
    let mut out = String::with_capacity(40);
    for byte in hash {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn collect_trackers(root: &Bencode) -> Vec<String> {
    let mut trackers = Vec::new();
    if let Some(announce) = root.get_str(b"announce") {
        if !announce.is_empty() {
            trackers.push(announce.to_string());
        }
    }
    // announce-list is a list of tiers; flatten in order (BEP 12)
    if let Some(tiers) = root.get_list(b"announce-list") {
        for tier in tiers {
            let Some(urls) = tier.as_list() else { continue };
            for url in urls {
                if let Some(u) = url.as_str() {
                    if !u.is_empty() && !trackers.iter().any(|t| t == u) {
                        trackers.push(u.to_string());
                    }
                }
            }
        }
    }
    trackers
}

fn parse_files(info: &Bencode, name: &str) -> Result<Vec<TorrentFile>> {
    if let Some(entries) = info.get_list(b"files") {
        // Multi-file layout: each entry carries a "path" component list
        let mut files = Vec::with_capacity(entries.len());
        let mut offset = 0u64;
        for entry in entries {
            let length = entry
                .get_int(b"length")
                .filter(|&n| n >= 0)
                .ok_or_else(|| invalid_torrent("file entry has no length"))?
                as u64;
            let components = entry
                .get_list(b"path")
                .ok_or_else(|| invalid_torrent("file entry has no path"))?;
            if components.is_empty() {
                return Err(invalid_torrent("file entry has empty path"));
            }
            let mut path = PathBuf::new();
            for component in components {
                let part = component
                    .as_str()
                    .ok_or_else(|| invalid_torrent("non-UTF-8 path component"))?;
                validate_path_component(part)?;
                path.push(part);
            }
            files.push(TorrentFile {
                path,
                length,
                offset,
            });
            offset += length;
        }
        if files.is_empty() {
            return Err(invalid_torrent("files list is empty"));
        }
        Ok(files)
    } else {
        let length = info
            .get_int(b"length")
            .filter(|&n| n > 0)
            .ok_or_else(|| invalid_torrent("missing length"))?
            as u64;
        validate_path_component(name)?;
        Ok(vec![TorrentFile {
            path: PathBuf::from(name),
            length,
            offset: 0,
        }])
    }
}

/// Reject path components that could escape the download directory.
fn validate_path_component(part: &str) -> Result<()> {
    if part.is_empty()
        || part == "."
        || part == ".."
        || part.contains('/')
        || part.contains('\\')
        || part.contains('\0')
    {
        return Err(invalid_torrent(format!(
            "unsafe path component {:?}",
            part
        )));
    }
    Ok(())
}

fn invalid_torrent(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::InvalidTorrent, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn bencode_str(s: &str) -> Bencode {
        Bencode::Bytes(s.as_bytes().to_vec())
    }

    fn make_info(name: &str, piece_length: i64, piece_count: usize, layout: Bencode) -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bencode_str(name));
        info.insert(b"piece length".to_vec(), Bencode::Int(piece_length));
        info.insert(
            b"pieces".to_vec(),
            Bencode::Bytes(vec![0xab; piece_count * 20]),
        );
        match layout {
            Bencode::Int(length) => {
                info.insert(b"length".to_vec(), Bencode::Int(length));
            }
            files @ Bencode::List(_) => {
                info.insert(b"files".to_vec(), files);
            }
            _ => unreachable!(),
        }
        Bencode::Dict(info).encode()
    }

    fn make_torrent(info: &[u8], announce: &str) -> Vec<u8> {
        let mut root = Vec::new();
        root.push(b'd');
        root.extend_from_slice(format!("8:announce{}:{}", announce.len(), announce).as_bytes());
        root.extend_from_slice(b"4:info");
        root.extend_from_slice(info);
        root.push(b'e');
        root
    }

    fn file_entry(length: i64, components: &[&str]) -> Bencode {
        let mut entry = BTreeMap::new();
        entry.insert(b"length".to_vec(), Bencode::Int(length));
        entry.insert(
            b"path".to_vec(),
            Bencode::List(components.iter().map(|c| bencode_str(c)).collect()),
        );
        Bencode::Dict(entry)
    }

    #[test]
    fn test_parse_single_file() {
        let info = make_info("file.bin", 16384, 3, Bencode::Int(40000));
        let data = make_torrent(&info, "http://tracker.example/announce");
        let torrent = Torrent::parse(&data).unwrap();

        assert_eq!(torrent.name, "file.bin");
        assert_eq!(torrent.total_size, 40000);
        assert_eq!(torrent.piece_count(), 3);
        assert_eq!(torrent.files.len(), 1);
        assert_eq!(torrent.trackers, vec!["http://tracker.example/announce"]);
        assert_eq!(torrent.info_hash, Sha1Hash::from(Sha1::digest(&info)));
    }

    #[test]
    fn test_info_hash_covers_raw_span() {
        // Unsorted outer keys don't disturb the hash: it covers the raw
        // info value bytes, not a re-encoding
        let info = make_info("x", 16384, 1, Bencode::Int(100));
        let mut data = Vec::new();
        data.extend_from_slice(b"d4:info");
        data.extend_from_slice(&info);
        data.extend_from_slice(b"8:announce7:http://e");
        let torrent = Torrent::parse(&data).unwrap();
        assert_eq!(torrent.info_hash, Sha1Hash::from(Sha1::digest(&info)));
    }

    #[test]
    fn test_last_piece_and_block_sizing() {
        let info = make_info("file.bin", 16384, 3, Bencode::Int(40000));
        let data = make_torrent(&info, "http://t");
        let torrent = Torrent::parse(&data).unwrap();

        // 40000 = 2*16384 + 7232
        assert_eq!(torrent.piece_size(0), 16384);
        assert_eq!(torrent.piece_size(2), 7232);
        assert_eq!(torrent.block_size(), 16384);
        assert_eq!(torrent.blocks_in_piece(0), 1);
        assert_eq!(torrent.blocks_in_piece(2), 1);
        assert_eq!(torrent.block_len(2, 0), 7232);
    }

    #[test]
    fn test_exact_multiple_keeps_full_last_piece() {
        let info = make_info("file.bin", 16384, 2, Bencode::Int(32768));
        let data = make_torrent(&info, "http://t");
        let torrent = Torrent::parse(&data).unwrap();
        assert_eq!(torrent.piece_size(1), 16384);
        assert_eq!(torrent.block_len(1, 0), 16384);
    }

    #[test]
    fn test_small_piece_length_caps_block() {
        let info = make_info("tiny.bin", 8192, 2, Bencode::Int(10000));
        let data = make_torrent(&info, "http://t");
        let torrent = Torrent::parse(&data).unwrap();
        assert_eq!(torrent.block_size(), 8192);
        assert_eq!(torrent.blocks_in_piece(0), 1);
        // last piece: 10000 - 8192 = 1808
        assert_eq!(torrent.piece_size(1), 1808);
        assert_eq!(torrent.block_len(1, 0), 1808);
    }

    #[test]
    fn test_straddling_piece_slices() {
        let files = Bencode::List(vec![
            file_entry(10000, &["a.bin"]),
            file_entry(5000, &["sub", "b.bin"]),
            file_entry(50000, &["c.bin"]),
        ]);
        let info = make_info("multi", 16384, 4, files);
        let data = make_torrent(&info, "http://t");
        let torrent = Torrent::parse(&data).unwrap();

        assert_eq!(torrent.total_size, 65000);
        assert_eq!(torrent.piece_count(), 4);

        // piece 0 crosses both boundaries: 10000 + 5000 + 1384 = 16384
        let slices = torrent.slices_for_piece(0);
        assert_eq!(
            slices,
            vec![
                FileSlice { file: 0, offset: 0, len: 10000 },
                FileSlice { file: 1, offset: 0, len: 5000 },
                FileSlice { file: 2, offset: 0, len: 1384 },
            ]
        );

        // piece 1 lies entirely inside file 2
        let slices = torrent.slices_for_piece(1);
        assert_eq!(
            slices,
            vec![FileSlice { file: 2, offset: 1384, len: 16384 }]
        );

        // last piece: 65000 - 3*16384 = 15848
        assert_eq!(torrent.piece_size(3), 15848);
        let slices = torrent.slices_for_piece(3);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len, 15848);
    }

    #[test]
    fn test_zero_length_file_produces_no_slice() {
        let files = Bencode::List(vec![
            file_entry(100, &["a.bin"]),
            file_entry(0, &["empty.bin"]),
            file_entry(100, &["b.bin"]),
        ]);
        let info = make_info("multi", 16384, 1, files);
        let data = make_torrent(&info, "http://t");
        let torrent = Torrent::parse(&data).unwrap();

        let slices = torrent.slices_for_piece(0);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].file, 0);
        assert_eq!(slices[1].file, 2);
    }

    #[test]
    fn test_pieces_for_range() {
        let info = make_info("file.bin", 16384, 3, Bencode::Int(40000));
        let data = make_torrent(&info, "http://t");
        let torrent = Torrent::parse(&data).unwrap();

        assert_eq!(torrent.pieces_for_range(0, 1), 0..1);
        assert_eq!(torrent.pieces_for_range(16000, 1000), 0..2);
        assert_eq!(torrent.pieces_for_range(39999, 100), 2..3);
        assert_eq!(torrent.pieces_for_range(50000, 10), 0..0);
    }

    #[test]
    fn test_announce_list_flattened_deduped() {
        let info = make_info("x", 16384, 1, Bencode::Int(100));
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce8:http://a13:announce-listll8:http://a8:http://bel8:http://cee4:info");
        data.extend_from_slice(&info);
        data.push(b'e');
        let torrent = Torrent::parse(&data).unwrap();
        assert_eq!(torrent.trackers, vec!["http://a", "http://b", "http://c"]);
    }

    #[test]
    fn test_rejects_bad_piece_count() {
        // 3 hashes claimed but size needs 2
        let info = make_info("file.bin", 16384, 3, Bencode::Int(20000));
        let data = make_torrent(&info, "http://t");
        assert!(Torrent::parse(&data).is_err());
    }

    #[test]
    fn test_rejects_traversal_paths() {
        let files = Bencode::List(vec![file_entry(100, &["..", "evil.bin"])]);
        let info = make_info("multi", 16384, 1, files);
        let data = make_torrent(&info, "http://t");
        assert!(Torrent::parse(&data).is_err());
    }

    #[test]
    fn test_from_info_bytes_round_trip() {
        let info = make_info("file.bin", 16384, 3, Bencode::Int(40000));
        let torrent = Torrent::from_info_bytes(&info, vec!["udp://t".into()]).unwrap();
        assert_eq!(torrent.name, "file.bin");
        assert_eq!(torrent.trackers, vec!["udp://t"]);
        assert_eq!(torrent.info_bytes, info);
    }
}
