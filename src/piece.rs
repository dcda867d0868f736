//! Per-session piece state
//!
//! The mutable heart of a download: which pieces are verified, which
//! blocks are in flight, and the partially assembled piece buffers. All
//! methods are synchronous and run under the coordinator's state lock;
//! nothing here touches the network or the disk.
//!
//! Two bitfields anchor the model. `progress` marks pieces verified and
//! written; its bits are never cleared while a session runs. `requests`
//! marks pieces whose every block is received or outstanding; bits come
//! back out of it when work is lost (timeout, rejection, disconnect,
//! hash mismatch) so another peer can pick the piece up.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};
use tracing::{debug, error, trace};

use crate::bitfield::Bitfield;
use crate::metainfo::{Sha1Hash, Torrent};

/// One block request to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub piece: u32,
    /// Byte offset within the piece
    pub offset: u32,
    pub len: u32,
}

/// Ledger entry for an in-flight block. The ledger is the authority for
/// timeout detection and for returning a dead peer's work to the pool.
#[derive(Debug, Clone)]
pub struct Outstanding {
    pub requested_at: Instant,
    pub peer: SocketAddr,
    pub piece: u32,
    pub block: u32,
    pub len: u32,
}

/// Buffer and per-block state for a piece that is partially received.
struct Assembly {
    buffer: Vec<u8>,
    received: Bitfield,
    requested: Bitfield,
}

impl Assembly {
    fn new(piece_size: u32, blocks: u32) -> Self {
        Self {
            buffer: vec![0; piece_size as usize],
            received: Bitfield::new(blocks as usize),
            requested: Bitfield::new(blocks as usize),
        }
    }
}

/// Outcome of delivering one block.
#[derive(Debug)]
pub enum BlockOutcome {
    /// Duplicate, stale, or mis-sized; only the dropped-byte counter moves
    Dropped { bytes: u64 },
    /// Stored in the assembly, piece not yet complete
    Accepted,
    /// Assembled piece failed its hash; the piece is requestable again
    HashMismatch { bytes: u64 },
    /// Assembled piece verified; the buffer is ready for storage
    Verified { data: Vec<u8> },
}

/// Tracks piece/block state for one torrent.
pub struct PieceTracker {
    torrent: Arc<Torrent>,
    progress: Bitfield,
    requests: Bitfield,
    assemblies: HashMap<u32, Assembly>,
    ledger: Vec<Outstanding>,
    focus: Option<Range<u32>>,
}

impl PieceTracker {
    pub fn new(torrent: Arc<Torrent>) -> Self {
        let count = torrent.piece_count() as usize;
        Self {
            torrent,
            progress: Bitfield::new(count),
            requests: Bitfield::new(count),
            assemblies: HashMap::new(),
            ledger: Vec::new(),
            focus: None,
        }
    }

    /// Rebuild from resumed progress. Requests mirror progress so only
    /// the missing pieces are selectable.
    pub fn from_resume(torrent: Arc<Torrent>, progress: Bitfield) -> Self {
        let requests = progress.clone();
        let count = torrent.piece_count() as usize;
        debug_assert_eq!(progress.len(), count);
        Self {
            torrent,
            progress,
            requests,
            assemblies: HashMap::new(),
            ledger: Vec::new(),
            focus: None,
        }
    }

    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.torrent
    }

    pub fn progress(&self) -> &Bitfield {
        &self.progress
    }

    pub fn is_complete(&self) -> bool {
        self.progress.is_complete()
    }

    pub fn verified_count(&self) -> usize {
        self.progress.count_set()
    }

    pub fn outstanding_count(&self) -> usize {
        self.ledger.len()
    }

    /// Blocks currently in flight to one peer.
    pub fn outstanding_for(&self, peer: SocketAddr) -> usize {
        self.ledger.iter().filter(|o| o.peer == peer).count()
    }

    /// Prioritize a piece range for a streaming reader.
    pub fn set_focus(&mut self, pieces: Range<u32>) {
        self.focus = Some(pieces);
    }

    pub fn clear_focus(&mut self) {
        self.focus = None;
    }

    /// Pick up to `quota` blocks for one peer and record them in the
    /// ledger. Returns the wire requests, batched for a single send.
    ///
    /// Piece choice: the focus window first when it is satisfiable by
    /// this peer, then the first globally unrequested piece the peer
    /// claims. Within a piece, blocks go out in order.
    pub fn select_for_peer(
        &mut self,
        peer: SocketAddr,
        has_all: bool,
        peer_pieces: Option<&Bitfield>,
        quota: usize,
        now: Instant,
    ) -> Vec<BlockRequest> {
        let mut selected = Vec::new();
        while selected.len() < quota {
            let Some(piece) = self.pick_piece(has_all, peer_pieces) else {
                break;
            };

            let blocks = self.torrent.blocks_in_piece(piece);
            let piece_size = self.torrent.piece_size(piece);
            let assembly = self
                .assemblies
                .entry(piece)
                .or_insert_with(|| Assembly::new(piece_size, blocks));

            let Some(block) = assembly.requested.first_clear(0) else {
                // A fully requested piece must carry its global bit;
                // restore it rather than spin on the same piece
                error!(piece, "piece fully requested but not marked; re-marking");
                self.requests.set(piece as usize);
                continue;
            };
            let block = block as u32;

            assembly.requested.set(block as usize);
            if assembly.requested.is_complete() {
                self.requests.set(piece as usize);
            }

            let len = self.torrent.block_len(piece, block);
            self.ledger.push(Outstanding {
                requested_at: now,
                peer,
                piece,
                block,
                len,
            });
            selected.push(BlockRequest {
                piece,
                offset: block * self.torrent.block_size(),
                len,
            });
        }
        if !selected.is_empty() {
            trace!(%peer, count = selected.len(), "blocks selected");
        }
        selected
    }

    fn pick_piece(&self, has_all: bool, peer_pieces: Option<&Bitfield>) -> Option<u32> {
        if let Some(focus) = &self.focus {
            let range = focus.start as usize..focus.end as usize;
            let hit = if has_all {
                self.requests
                    .first_clear(range.start)
                    .filter(|&i| i < range.end)
            } else {
                peer_pieces.and_then(|bf| {
                    self.requests.first_clear_matching_set_in(bf, range)
                })
            };
            if let Some(piece) = hit {
                return Some(piece as u32);
            }
        }

        let hit = if has_all {
            self.requests.first_clear(0)
        } else {
            peer_pieces.and_then(|bf| self.requests.first_clear_matching_set(bf, 0))
        };
        hit.map(|i| i as u32)
    }

    /// Deliver one block.
    pub fn on_block(&mut self, piece: u32, offset: u32, data: &[u8]) -> BlockOutcome {
        let bytes = data.len() as u64;
        let block_size = self.torrent.block_size();
        if offset % block_size != 0 {
            return BlockOutcome::Dropped { bytes };
        }
        let block = offset / block_size;

        if piece >= self.torrent.piece_count() || self.progress.get(piece as usize) {
            return BlockOutcome::Dropped { bytes };
        }
        let Some(mut assembly) = self.assemblies.remove(&piece) else {
            // Nothing in flight for this piece (late delivery after a
            // hash mismatch reset)
            return BlockOutcome::Dropped { bytes };
        };
        if assembly.received.get(block as usize)
            || block >= self.torrent.blocks_in_piece(piece)
            || data.len() as u32 != self.torrent.block_len(piece, block)
        {
            self.assemblies.insert(piece, assembly);
            return BlockOutcome::Dropped { bytes };
        }

        let start = (block * block_size) as usize;
        assembly.buffer[start..start + data.len()].copy_from_slice(data);
        assembly.received.set(block as usize);
        // A stale timeout must not re-queue a block we already hold
        assembly.requested.set(block as usize);
        self.ledger
            .retain(|o| !(o.piece == piece && o.block == block));

        if !assembly.received.is_complete() {
            self.assemblies.insert(piece, assembly);
            return BlockOutcome::Accepted;
        }

        let hash: Sha1Hash = Sha1::digest(&assembly.buffer).into();
        if &hash != self.torrent.piece_hash(piece) {
            debug!(piece, "piece failed verification, re-queuing");
            self.requests.clear(piece as usize);
            return BlockOutcome::HashMismatch {
                bytes: assembly.buffer.len() as u64,
            };
        }

        self.progress.set(piece as usize);
        // A timeout sweep may have cleared the global bit while this
        // block was in flight; a verified piece must never be selectable
        self.requests.set(piece as usize);
        BlockOutcome::Verified {
            data: assembly.buffer,
        }
    }

    /// A peer declined a block. Unless the block completed meanwhile,
    /// return it to the pool.
    pub fn on_reject(&mut self, piece: u32, offset: u32) {
        let block_size = self.torrent.block_size();
        if offset % block_size != 0 {
            return;
        }
        let block = offset / block_size;
        self.ledger
            .retain(|o| !(o.piece == piece && o.block == block));

        if self.progress.get(piece as usize) {
            return;
        }
        if let Some(assembly) = self.assemblies.get_mut(&piece) {
            if assembly.received.get(block as usize) {
                return;
            }
            assembly.requested.clear(block as usize);
        }
        self.requests.clear(piece as usize);
    }

    /// Expire ledger entries older than `timeout`, returning the work to
    /// the pool. The returned entries let the caller attribute each
    /// timeout to its peer.
    pub fn sweep_timeouts(&mut self, timeout: Duration, now: Instant) -> Vec<Outstanding> {
        let mut expired = Vec::new();
        let mut kept = Vec::with_capacity(self.ledger.len());

        for entry in self.ledger.drain(..) {
            if now.duration_since(entry.requested_at) < timeout {
                kept.push(entry);
                continue;
            }
            // Completed meanwhile: drop the entry without penalty
            let done = self.progress.get(entry.piece as usize)
                || self
                    .assemblies
                    .get(&entry.piece)
                    .map(|a| a.received.get(entry.block as usize))
                    .unwrap_or(false);
            if done {
                continue;
            }
            if let Some(assembly) = self.assemblies.get_mut(&entry.piece) {
                assembly.requested.clear(entry.block as usize);
            }
            self.requests.clear(entry.piece as usize);
            expired.push(entry);
        }

        self.ledger = kept;
        expired
    }

    /// Drop every in-flight request held by a disconnecting peer and
    /// make the affected pieces selectable again.
    pub fn release_peer(&mut self, peer: SocketAddr) -> usize {
        let mut released = 0;
        let mut kept = Vec::with_capacity(self.ledger.len());
        for entry in self.ledger.drain(..) {
            if entry.peer != peer {
                kept.push(entry);
                continue;
            }
            let done = self.progress.get(entry.piece as usize)
                || self
                    .assemblies
                    .get(&entry.piece)
                    .map(|a| a.received.get(entry.block as usize))
                    .unwrap_or(false);
            if !done {
                if let Some(assembly) = self.assemblies.get_mut(&entry.piece) {
                    assembly.requested.clear(entry.block as usize);
                }
                self.requests.clear(entry.piece as usize);
            }
            released += 1;
        }
        self.ledger = kept;
        released
    }
}
