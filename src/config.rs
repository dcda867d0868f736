//! Session configuration
//!
//! All tunables for a swarm download session. Defaults follow field-proven
//! values: 60 connections keeps most home uplinks saturated, and the
//! timeout ladder (connect < handshake < piece) drops dead peers before
//! they can stall the request pipeline.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for a download session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory completed files are moved into
    pub download_dir: PathBuf,

    /// Directory holding in-progress part files.
    /// Defaults to `<download_dir>/.incomplete` when unset.
    #[serde(default)]
    pub incomplete_dir: Option<PathBuf>,

    /// Maximum concurrent peer connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Outstanding block requests per peer. Also the per-peer timeout
    /// quota: a peer that times out this many blocks is dropped.
    #[serde(default = "default_blocks_per_peer")]
    pub blocks_per_peer: usize,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Handshake exchange timeout in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Metadata piece request timeout in milliseconds
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,

    /// Block request timeout in milliseconds
    #[serde(default = "default_piece_timeout_ms")]
    pub piece_timeout_ms: u64,

    /// Control loop tick interval in milliseconds.
    /// Lower values increase responsiveness but use more CPU.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Timeout sweep and stats refresh interval in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Keep-alive interval for idle ready peers in seconds
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,

    /// Interval for re-sending interested to choked peers in seconds
    #[serde(default = "default_re_interested_interval_secs")]
    pub re_interested_interval_secs: u64,

    /// Tracker re-announce and DHT cache refresh interval in seconds
    #[serde(default = "default_reannounce_interval_secs")]
    pub reannounce_interval_secs: u64,

    /// Enable DHT peer discovery
    #[serde(default = "default_true")]
    pub enable_dht: bool,

    /// Enable tracker announces
    #[serde(default = "default_true")]
    pub enable_trackers: bool,
}

fn default_max_connections() -> usize {
    60
}

fn default_blocks_per_peer() -> usize {
    6
}

fn default_connect_timeout_ms() -> u64 {
    2500
}

fn default_handshake_timeout_ms() -> u64 {
    3000
}

fn default_metadata_timeout_ms() -> u64 {
    1600
}

fn default_piece_timeout_ms() -> u64 {
    8000
}

fn default_tick_interval_ms() -> u64 {
    15
}

fn default_sweep_interval_secs() -> u64 {
    2
}

fn default_keep_alive_interval_secs() -> u64 {
    5
}

fn default_re_interested_interval_secs() -> u64 {
    16
}

fn default_reannounce_interval_secs() -> u64 {
    40
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            incomplete_dir: None,
            max_connections: 60,
            blocks_per_peer: 6,
            connect_timeout_ms: 2500,
            handshake_timeout_ms: 3000,
            metadata_timeout_ms: 1600,
            piece_timeout_ms: 8000,
            tick_interval_ms: 15,
            sweep_interval_secs: 2,
            keep_alive_interval_secs: 5,
            re_interested_interval_secs: 16,
            reannounce_interval_secs: 40,
            enable_dht: true,
            enable_trackers: true,
        }
    }
}

impl SessionConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the download directory
    pub fn download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = path.into();
        self
    }

    /// Set the incomplete (part file) directory
    pub fn incomplete_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.incomplete_dir = Some(path.into());
        self
    }

    /// Set maximum concurrent peer connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set outstanding block requests per peer
    pub fn blocks_per_peer(mut self, blocks: usize) -> Self {
        self.blocks_per_peer = blocks;
        self
    }

    /// Set the block request timeout
    pub fn piece_timeout_ms(mut self, ms: u64) -> Self {
        self.piece_timeout_ms = ms;
        self
    }

    /// Enable or disable DHT discovery
    pub fn enable_dht(mut self, enable: bool) -> Self {
        self.enable_dht = enable;
        self
    }

    /// Enable or disable tracker announces
    pub fn enable_trackers(mut self, enable: bool) -> Self {
        self.enable_trackers = enable;
        self
    }

    /// The part-file directory, derived from `download_dir` if not set
    pub fn resolved_incomplete_dir(&self) -> PathBuf {
        self.incomplete_dir
            .clone()
            .unwrap_or_else(|| self.download_dir.join(".incomplete"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(EngineError::invalid_input(
                "max_connections",
                "Must be at least 1",
            ));
        }

        if self.blocks_per_peer == 0 || self.blocks_per_peer > 128 {
            return Err(EngineError::invalid_input(
                "blocks_per_peer",
                "Must be between 1 and 128",
            ));
        }

        if self.tick_interval_ms == 0 || self.tick_interval_ms > 1000 {
            return Err(EngineError::invalid_input(
                "tick_interval_ms",
                "Must be between 1 and 1000",
            ));
        }

        if self.piece_timeout_ms < 1000 {
            return Err(EngineError::invalid_input(
                "piece_timeout_ms",
                "Must be at least 1000",
            ));
        }

        if self.sweep_interval_secs == 0 {
            return Err(EngineError::invalid_input(
                "sweep_interval_secs",
                "Must be at least 1",
            ));
        }

        Ok(())
    }
}
