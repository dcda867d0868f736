//! Metadata exchange and bootstrap (BEP 9)
//!
//! Magnet sessions start with nothing but an info-hash. The ut_metadata
//! extension lets peers serve the info dictionary in 16 KiB pieces; this
//! module holds the wire codec for those messages and the bootstrap state
//! machine that assembles, sizes, and verifies the dictionary before any
//! content transfer can begin.

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::bencode::Bencode;
use crate::bitfield::Bitfield;
use crate::error::{EngineError, IntegrityErrorKind, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;

/// Metadata transfer unit (16 KiB).
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

/// Extension name advertised in the BEP 10 handshake.
pub const METADATA_EXTENSION_NAME: &str = "ut_metadata";

/// Cap on the advertised metadata size. Real info dictionaries top out
/// in the low megabytes; anything bigger is a hostile peer.
const MAX_METADATA_SIZE: usize = 32 * 1024 * 1024;

/// Piece count assumed before the first size-bearing reply. Lets the
/// session put two requests in flight immediately.
const PROVISIONAL_PIECES: usize = 2;

/// Initial parallel-request budget.
const INITIAL_BUDGET: i32 = 4;

/// A ut_metadata extension message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u64, payload: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    /// Encode to the extension payload: a bencoded header, with the raw
    /// piece bytes appended for data messages.
    pub fn encode(&self) -> Vec<u8> {
        let mut dict = std::collections::BTreeMap::new();
        let (msg_type, piece) = match self {
            Self::Request { piece } => (0, *piece),
            Self::Data { piece, total_size, .. } => {
                dict.insert(
                    b"total_size".to_vec(),
                    Bencode::Int(*total_size as i64),
                );
                (1, *piece)
            }
            Self::Reject { piece } => (2, *piece),
        };
        dict.insert(b"msg_type".to_vec(), Bencode::Int(msg_type));
        dict.insert(b"piece".to_vec(), Bencode::Int(piece as i64));

        let mut encoded = Bencode::Dict(dict).encode();
        if let Self::Data { payload, .. } = self {
            encoded.extend_from_slice(payload);
        }
        encoded
    }

    /// Decode an extension payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (header, consumed) = Bencode::decode_prefix(data)?;

        let msg_type = header.get_int(b"msg_type").ok_or_else(|| {
            bad_message("metadata message has no msg_type")
        })?;
        let piece = header
            .get_int(b"piece")
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| bad_message("metadata message has no piece"))?;

        match msg_type {
            0 => Ok(Self::Request { piece }),
            1 => {
                let total_size = header
                    .get_int(b"total_size")
                    .and_then(|n| u64::try_from(n).ok())
                    .ok_or_else(|| bad_message("data message has no total_size"))?;
                Ok(Self::Data {
                    piece,
                    total_size,
                    payload: data[consumed..].to_vec(),
                })
            }
            2 => Ok(Self::Reject { piece }),
            other => Err(bad_message(format!("unknown metadata msg_type {}", other))),
        }
    }
}

fn bad_message(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::PeerProtocol, message)
}

/// Bootstrap phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    /// No size-bearing reply yet; piece count is provisional
    SizeUnknown,
    /// Size known, pieces arriving
    Collecting,
    /// All pieces in, hash check running
    Validating,
    /// Verified against the info-hash
    Done,
}

/// Outcome of feeding a data reply into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataUpdate {
    /// Duplicate, stale, or malformed; state unchanged
    Ignored,
    /// Piece stored, more outstanding
    Stored,
    /// Final piece stored and the assembly verified
    Complete,
}

/// Reassembles the info dictionary from metadata pieces.
///
/// Single-owner state driven by the coordinator under its lock; requests
/// are throttled by a signed budget that request issuance drains and
/// completions (success, reject, or timeout) refund.
pub struct MetadataBootstrap {
    info_hash: Sha1Hash,
    total_size: Option<usize>,
    received: Bitfield,
    buffer: Vec<u8>,
    budget: i32,
    phase: BootstrapPhase,
}

impl MetadataBootstrap {
    pub fn new(info_hash: Sha1Hash) -> Self {
        Self {
            info_hash,
            total_size: None,
            received: Bitfield::new(PROVISIONAL_PIECES),
            buffer: Vec::new(),
            budget: INITIAL_BUDGET,
            phase: BootstrapPhase::SizeUnknown,
        }
    }

    pub fn phase(&self) -> BootstrapPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == BootstrapPhase::Done
    }

    pub fn total_size(&self) -> Option<usize> {
        self.total_size
    }

    pub fn piece_count(&self) -> usize {
        self.received.len()
    }

    pub fn received_count(&self) -> usize {
        self.received.count_set()
    }

    /// Learn the metadata size, from an extension handshake or the first
    /// data reply. The first value wins; the piece bitfield is resized
    /// from the provisional guess, keeping any set bits.
    pub fn set_total_size(&mut self, size: usize) -> Result<()> {
        if size == 0 || self.total_size.is_some() {
            return Ok(());
        }
        if size > MAX_METADATA_SIZE {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("metadata size {} exceeds limit", size),
            ));
        }
        let count = size.div_ceil(METADATA_PIECE_SIZE);
        debug!(size, count, "metadata size learned");
        self.total_size = Some(size);
        self.received.resize(count);
        self.buffer.resize(size, 0);
        self.phase = BootstrapPhase::Collecting;
        Ok(())
    }

    /// Pick up to two missing pieces for one capable peer and charge the
    /// budget for them. Empty when the budget is drained or nothing is
    /// missing.
    pub fn begin_requests(&mut self) -> Vec<u32> {
        if self.budget < 1 || self.phase == BootstrapPhase::Done {
            return Vec::new();
        }
        let mut picks = Vec::with_capacity(2);
        if let Some(first) = self.received.first_clear(0) {
            picks.push(first as u32);
            if let Some(second) = self.received.first_clear(first + 1) {
                picks.push(second as u32);
            }
        }
        match picks.len() {
            0 => {}
            1 => self.budget -= 1,
            _ => self.budget -= 2,
        }
        picks
    }

    /// Return a request slot to the pool. Called for rejects and
    /// timeouts; successful data replies refund internally.
    pub fn refund(&mut self) {
        self.budget += 2;
    }

    /// Feed one data reply in.
    ///
    /// Fails only on the unrecoverable cases: a hostile size claim, or a
    /// fully assembled dictionary that does not hash to the info-hash.
    pub fn on_data(
        &mut self,
        piece: u32,
        total_size: u64,
        payload: &[u8],
    ) -> Result<MetadataUpdate> {
        if self.phase == BootstrapPhase::Done {
            return Ok(MetadataUpdate::Ignored);
        }

        self.set_total_size(total_size as usize)?;
        // The request slot comes back whatever the payload looks like
        self.budget += 2;

        let Some(total) = self.total_size else {
            warn!(piece, "metadata piece with no usable size, dropping");
            return Ok(MetadataUpdate::Ignored);
        };

        let index = piece as usize;
        if index >= self.piece_count() {
            warn!(piece, count = self.piece_count(), "metadata piece out of range");
            return Ok(MetadataUpdate::Ignored);
        }
        if self.received.get(index) {
            return Ok(MetadataUpdate::Ignored);
        }

        let offset = index * METADATA_PIECE_SIZE;
        let expected = METADATA_PIECE_SIZE.min(total - offset);
        if payload.len() != expected {
            warn!(
                piece,
                got = payload.len(),
                expected,
                "metadata piece has wrong length"
            );
            return Ok(MetadataUpdate::Ignored);
        }

        self.buffer[offset..offset + expected].copy_from_slice(payload);
        self.received.set(index);

        if !self.received.is_complete() {
            return Ok(MetadataUpdate::Stored);
        }

        self.phase = BootstrapPhase::Validating;
        let hash: Sha1Hash = Sha1::digest(&self.buffer).into();
        if hash != self.info_hash {
            return Err(EngineError::integrity(
                IntegrityErrorKind::Metadata,
                "assembled metadata does not match the info-hash",
            ));
        }
        self.phase = BootstrapPhase::Done;
        Ok(MetadataUpdate::Complete)
    }

    /// The verified info dictionary, once `Done`.
    pub fn assembled(&self) -> Option<&[u8]> {
        if self.is_done() {
            Some(&self.buffer)
        } else {
            None
        }
    }
}
