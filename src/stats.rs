//! Throughput accounting
//!
//! Counters are written on the event-processing path and read on the
//! stats cadence, so they are plain atomics. Rate and ETA arithmetic is
//! deliberately saturating; a stalled swarm reports zero rates and an
//! unknown ETA rather than wrapping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Byte totals shared between the coordinator and stats refresh.
#[derive(Debug, Default)]
pub struct Counters {
    downloaded: AtomicU64,
    dropped: AtomicU64,
    previous_session: AtomicU64,
    hash_failures: AtomicU64,
}

impl Counters {
    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, bytes: u64) {
        self.dropped.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Write off bytes previously counted as downloaded. Used when a
    /// corrupt piece moves wholesale into the dropped bucket, keeping
    /// the two buckets disjoint.
    pub fn remove_downloaded(&self, bytes: u64) {
        let _ = self
            .downloaded
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    pub fn add_hash_failure(&self) {
        self.hash_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes carried over from a resumed session; set once at startup.
    pub fn set_previous_session(&self, bytes: u64) {
        self.previous_session.store(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn previous_session(&self) -> u64 {
        self.previous_session.load(Ordering::Relaxed)
    }

    pub fn hash_failures(&self) -> u64 {
        self.hash_failures.load(Ordering::Relaxed)
    }
}

/// Live peer counts by phase at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerCounts {
    pub queued: usize,
    pub connecting: usize,
    pub connected: usize,
    pub ready: usize,
    pub downloading: usize,
    pub failed: usize,
    pub disconnected: usize,
}

impl PeerCounts {
    pub fn total(&self) -> usize {
        self.queued
            + self.connecting
            + self.connected
            + self.ready
            + self.downloading
            + self.failed
            + self.disconnected
    }
}

/// Point-in-time view published on the stats cadence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Bytes verified and written this session
    pub bytes_downloaded: u64,
    /// Bytes recovered from part files at resume
    pub bytes_previous_session: u64,
    /// Bytes received but discarded (duplicates, hash failures, stray blocks)
    pub bytes_dropped: u64,
    /// Rate over the last refresh window, bytes per second
    pub down_rate: u64,
    /// Rate since session start, bytes per second
    pub avg_rate: u64,
    /// Highest windowed rate observed
    pub max_rate: u64,
    /// Estimated seconds to completion; None while unknowable
    pub eta_secs: Option<u64>,
    /// Pieces that failed verification and were re-queued
    pub hash_failures: u64,
    pub verified_pieces: u32,
    pub total_pieces: u32,
    pub peers: PeerCounts,
}

/// Windowed rate computation fed by the cumulative downloaded total.
#[derive(Debug)]
pub struct RateTracker {
    started: Instant,
    window_start: Instant,
    window_bytes: u64,
    max_rate: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    pub down_rate: u64,
    pub avg_rate: u64,
    pub max_rate: u64,
}

impl RateTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            window_start: now,
            window_bytes: 0,
            max_rate: 0,
        }
    }

    /// Close the current window and open the next one. `total` is the
    /// cumulative session byte count; should it shrink (a corrupt piece
    /// written off), the window reports a zero rate.
    pub fn refresh(&mut self, total: u64, now: Instant) -> RateSample {
        let window_ms = now.duration_since(self.window_start).as_millis().max(1);
        let delta = total.saturating_sub(self.window_bytes);
        let down_rate = per_second(delta, window_ms);

        let session_ms = now.duration_since(self.started).as_millis().max(1);
        let avg_rate = per_second(total, session_ms);

        self.max_rate = self.max_rate.max(down_rate);
        self.window_start = now;
        self.window_bytes = total;

        RateSample {
            down_rate,
            avg_rate,
            max_rate: self.max_rate,
        }
    }
}

fn per_second(bytes: u64, elapsed_ms: u128) -> u64 {
    let scaled = (bytes as u128).saturating_mul(1000) / elapsed_ms;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Seconds until `remaining` bytes arrive. Prefers the windowed rate,
/// falls back to the session average, gives up rather than guessing.
pub fn eta_secs(remaining: u64, down_rate: u64, avg_rate: u64) -> Option<u64> {
    if remaining == 0 {
        return Some(0);
    }
    let rate = if down_rate > 0 { down_rate } else { avg_rate };
    if rate == 0 {
        return None;
    }
    Some(remaining / rate)
}
