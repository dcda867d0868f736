//! Session facade and resume persistence
//!
//! A [`Session`] owns one download from input to terminal status: it
//! parses the .torrent document or magnet link, opens storage, spawns the
//! swarm coordinator, and exposes control (pause/resume/stop), a broadcast
//! event feed, and a streaming read that waits for the backing pieces to
//! verify.
//!
//! Progress survives restarts through a JSON snapshot written next to the
//! part files. [`load_resume`] vets a snapshot against the descriptor and
//! the surviving part files before any of it is trusted.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bitfield::Bitfield;
use crate::config::SessionConfig;
use crate::error::{EngineError, Result};
use crate::magnet::MagnetLink;
use crate::metainfo::Torrent;
use crate::stats::StatsSnapshot;
use crate::storage::PartStore;
use crate::swarm::{Swarm, SwarmEvent};

/// Maximum number of events to buffer per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Control states accepted by a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Normal operation
    Running,
    /// Peers stay connected but no new work is handed out
    Paused,
    /// Terminal; the coordinator snapshots progress and exits
    Stopped,
}

/// How a download ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    /// Every piece verified and the content moved into place
    Done,
    /// Stopped before completion; progress was snapshotted for resume
    StoppedIncomplete,
    /// Unrecoverable failure
    Error(String),
}

/// Events published through [`Session::subscribe`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A magnet start fetched and validated its metadata
    MetadataReady { name: String },
    /// Periodic throughput and peer statistics
    Stats(StatsSnapshot),
    /// The download reached a terminal status; nothing follows this
    Finished(TerminalStatus),
}

/// Progress snapshot persisted next to the part files.
///
/// The descriptor fields are identity checks: a snapshot is only honored
/// when it matches the torrent it is resumed against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub info_hash: String,
    pub name: String,
    pub piece_length: u32,
    pub total_size: u64,
    pub piece_count: u32,
    pub saved_at: DateTime<Utc>,
    /// Verified-piece bitfield, most significant bit first
    pub progress: Vec<u8>,
}

/// Load and vet a progress snapshot from a previous run.
///
/// Returns the surviving progress bits and the byte count they represent,
/// or `None` when there is no usable snapshot. Pieces whose backing part
/// files have disappeared are dropped before counting, including pieces
/// that straddle into a surviving neighbor.
pub(crate) async fn load_resume(
    store: &Arc<PartStore>,
    torrent: &Arc<Torrent>,
) -> Option<(Bitfield, u64)> {
    let path = store.session_path();
    let bytes = tokio::fs::read(&path).await.ok()?;
    let snapshot: SessionSnapshot = match serde_json::from_slice(&bytes) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "session snapshot does not parse, starting fresh");
            return None;
        }
    };
    if snapshot.info_hash != torrent.info_hash_hex()
        || snapshot.piece_length != torrent.piece_length
        || snapshot.total_size != torrent.total_size
        || snapshot.piece_count != torrent.piece_count()
    {
        warn!(path = %path.display(), "session snapshot describes a different torrent, starting fresh");
        return None;
    }
    let mut progress = Bitfield::from_bytes(&snapshot.progress, torrent.piece_count() as usize)?;

    for (index, file) in torrent.files.iter().enumerate() {
        if file.length == 0 || store.has_part(index).await {
            continue;
        }
        let affected = torrent.pieces_for_range(file.offset, file.length);
        debug!(
            file = index,
            pieces = affected.len(),
            "part file missing, dropping its pieces"
        );
        for piece in affected {
            progress.clear(piece as usize);
        }
    }

    if progress.count_set() == 0 {
        return None;
    }
    let resumed_bytes: u64 = progress
        .iter_set()
        .map(|piece| u64::from(torrent.piece_size(piece as u32)))
        .sum();
    info!(
        pieces = progress.count_set(),
        bytes = resumed_bytes,
        "resuming from session snapshot"
    );
    Some((progress, resumed_bytes))
}

/// Channel ends handed to the coordinator task on the first `start()`.
struct PendingStart {
    swarm_events: mpsc::Receiver<SwarmEvent>,
    done: watch::Sender<Option<TerminalStatus>>,
}

/// One download, from input to terminal status.
///
/// Dropping a `Session` closes the control channel; a running coordinator
/// notices and winds down as if stopped.
pub struct Session {
    swarm: Arc<Swarm>,
    events: broadcast::Sender<SessionEvent>,
    control: watch::Sender<RunState>,
    /// Bumped by the swarm once per verified piece
    progress: watch::Receiver<u64>,
    /// Set exactly once, when the coordinator exits
    done: watch::Receiver<Option<TerminalStatus>>,
    pending: Mutex<Option<PendingStart>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a session from the raw bytes of a .torrent document.
    ///
    /// Opens storage immediately and picks up a progress snapshot from a
    /// previous run when one is present and still valid.
    pub async fn from_torrent_bytes(data: &[u8], config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let torrent = Arc::new(Torrent::parse(data)?);
        let store = Arc::new(
            PartStore::open(
                torrent.clone(),
                &config.resolved_incomplete_dir(),
                &config.download_dir,
            )
            .await?,
        );
        store.check_destinations().await?;
        let resume = load_resume(&store, &torrent).await;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (progress_tx, progress_rx) = watch::channel(0);
        let (swarm, swarm_events) =
            Swarm::for_torrent(torrent, store, resume, config, events.clone(), progress_tx)?;
        Ok(Self::assemble(swarm, swarm_events, events, progress_rx))
    }

    /// Create a session from a .torrent file on disk.
    pub async fn from_torrent_file(path: impl AsRef<Path>, config: SessionConfig) -> Result<Self> {
        let data = tokio::fs::read(path.as_ref()).await?;
        Self::from_torrent_bytes(&data, config).await
    }

    /// Create a session from a magnet link.
    ///
    /// Storage stays closed until the metadata exchange completes, at
    /// which point the swarm opens it and checks for resumable progress.
    pub fn from_magnet(uri: &str, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let magnet = MagnetLink::parse(uri)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (progress_tx, progress_rx) = watch::channel(0);
        let (swarm, swarm_events) = Swarm::for_magnet(&magnet, config, events.clone(), progress_tx)?;
        Ok(Self::assemble(swarm, swarm_events, events, progress_rx))
    }

    fn assemble(
        swarm: Arc<Swarm>,
        swarm_events: mpsc::Receiver<SwarmEvent>,
        events: broadcast::Sender<SessionEvent>,
        progress: watch::Receiver<u64>,
    ) -> Self {
        let (control, _) = watch::channel(RunState::Running);
        let (done_tx, done_rx) = watch::channel(None);
        Self {
            swarm,
            events,
            control,
            progress,
            done: done_rx,
            pending: Mutex::new(Some(PendingStart {
                swarm_events,
                done: done_tx,
            })),
            task: Mutex::new(None),
        }
    }

    /// Spawn the coordinator. A second call returns an error.
    pub fn start(&self) -> Result<()> {
        let Some(pending) = self.pending.lock().take() else {
            return Err(EngineError::InvalidState {
                action: "start",
                current_state: "already started".into(),
            });
        };
        let swarm = self.swarm.clone();
        let control = self.control.subscribe();
        let PendingStart { swarm_events, done } = pending;
        let task = tokio::spawn(async move {
            let status = swarm.run(swarm_events, control).await;
            let _ = done.send(Some(status));
        });
        *self.task.lock() = Some(task);
        info!(name = %self.swarm.name(), "session started");
        Ok(())
    }

    /// Suspend request traffic. Connections stay up; no new blocks or
    /// metadata pieces are assigned until [`Session::resume`].
    pub fn pause(&self) {
        self.control.send_replace(RunState::Paused);
    }

    /// Resume a paused session.
    pub fn resume(&self) {
        self.control.send_replace(RunState::Running);
    }

    /// Stop the session and wait for the coordinator to wind down. The
    /// coordinator snapshots progress and announces the stop on its way
    /// out; subscribers receive a final [`SessionEvent::Finished`].
    pub async fn stop(&self) {
        self.control.send_replace(RunState::Stopped);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Subscribe to the session's event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Display name: the torrent name once known, otherwise the magnet's
    /// name or hex info-hash.
    pub fn name(&self) -> String {
        self.swarm.name()
    }

    /// True once every piece has verified.
    pub fn is_complete(&self) -> bool {
        self.swarm.is_complete()
    }

    /// Wait for the terminal status of a started session.
    pub async fn wait(&self) -> Result<TerminalStatus> {
        self.ensure_started("wait")?;
        let mut done = self.done.clone();
        loop {
            if let Some(status) = done.borrow().clone() {
                return Ok(status);
            }
            if done.changed().await.is_err() {
                return Err(EngineError::Shutdown);
            }
        }
    }

    /// Read a byte range of one file, waiting until the pieces backing
    /// it have verified. Focuses piece selection on the range first, so
    /// a sequential reader keeps the swarm filling just ahead of it.
    pub async fn stream_read(&self, file: usize, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.ensure_started("stream_read")?;
        let Some(range) = self.swarm.focus_pieces_for(file, offset, len as u64) else {
            if self.swarm.store().is_none() {
                return Err(EngineError::InvalidState {
                    action: "stream_read",
                    current_state: "fetching metadata".into(),
                });
            }
            return Err(EngineError::invalid_input(
                "file",
                format!("no file at index {}", file),
            ));
        };

        let mut progress = self.progress.clone();
        let mut done = self.done.clone();
        while !self.swarm.range_verified(&range) {
            let ended = done.borrow().clone();
            if let Some(status) = ended {
                return Err(match status {
                    TerminalStatus::Error(message) => EngineError::Internal(message),
                    _ => EngineError::Shutdown,
                });
            }
            tokio::select! {
                changed = progress.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::Shutdown);
                    }
                }
                ended = done.changed() => {
                    if ended.is_err() {
                        return Err(EngineError::Shutdown);
                    }
                }
            }
        }

        let store = self.swarm.store().ok_or(EngineError::Shutdown)?;
        store.read(file, offset, len).await
    }

    fn ensure_started(&self, action: &'static str) -> Result<()> {
        if self.pending.lock().is_some() {
            return Err(EngineError::InvalidState {
                action,
                current_state: "not started".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Bencode;
    use crate::metainfo::TorrentFile;
    use sha1::{Digest, Sha1};
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn dict(entries: Vec<(&[u8], Bencode)>) -> Bencode {
        let mut map = BTreeMap::new();
        for (k, v) in entries {
            map.insert(k.to_vec(), v);
        }
        Bencode::Dict(map)
    }

    /// A real single-file .torrent document over `content`.
    fn torrent_doc(name: &str, piece_length: u32, content: &[u8]) -> Vec<u8> {
        let mut pieces = Vec::new();
        for chunk in content.chunks(piece_length as usize) {
            let hash: [u8; 20] = Sha1::digest(chunk).into();
            pieces.extend_from_slice(&hash);
        }
        let info = dict(vec![
            (b"length", Bencode::Int(content.len() as i64)),
            (b"name", Bencode::Bytes(name.as_bytes().to_vec())),
            (b"piece length", Bencode::Int(piece_length as i64)),
            (b"pieces", Bencode::Bytes(pieces)),
        ]);
        dict(vec![(b"info", info)]).encode()
    }

    fn test_config(dir: &Path) -> SessionConfig {
        SessionConfig::new()
            .download_dir(dir.join("done"))
            .incomplete_dir(dir.join("parts"))
            .enable_dht(false)
            .enable_trackers(false)
    }

    fn make_torrent(files: Vec<(&str, u64)>, piece_length: u32) -> Arc<Torrent> {
        let mut offset = 0u64;
        let files: Vec<TorrentFile> = files
            .into_iter()
            .map(|(path, length)| {
                let f = TorrentFile {
                    path: PathBuf::from(path),
                    length,
                    offset,
                };
                offset += length;
                f
            })
            .collect();
        let total: u64 = offset;
        let count = total.div_ceil(piece_length as u64) as usize;
        Arc::new(Torrent {
            info_hash: [0x5a; 20],
            name: "resume-test".into(),
            trackers: Vec::new(),
            piece_length,
            piece_hashes: vec![[0u8; 20]; count],
            files,
            total_size: total,
            info_bytes: Vec::new(),
        })
    }

    async fn write_snapshot(store: &PartStore, torrent: &Torrent, progress: &Bitfield) {
        let snapshot = SessionSnapshot {
            info_hash: torrent.info_hash_hex(),
            name: torrent.name.clone(),
            piece_length: torrent.piece_length,
            total_size: torrent.total_size,
            piece_count: torrent.piece_count(),
            saved_at: Utc::now(),
            progress: progress.to_bytes(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot).unwrap();
        tokio::fs::write(store.session_path(), bytes).await.unwrap();
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let snapshot = SessionSnapshot {
            info_hash: "aa".repeat(20),
            name: "roundtrip".into(),
            piece_length: 16384,
            total_size: 65000,
            piece_count: 4,
            saved_at: Utc::now(),
            progress: vec![0b1010_0000],
        };
        let json = serde_json::to_vec(&snapshot).unwrap();
        let back: SessionSnapshot = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.info_hash, snapshot.info_hash);
        assert_eq!(back.piece_count, 4);
        assert_eq!(back.progress, vec![0b1010_0000]);
        assert_eq!(back.saved_at, snapshot.saved_at);
    }

    #[tokio::test]
    async fn test_load_resume_counts_surviving_pieces() {
        let dir = tempdir().unwrap();
        // Two 32-byte files, 32-byte pieces: piece 0 backs file 0,
        // piece 1 backs file 1
        let torrent = make_torrent(vec![("a.bin", 32), ("b.bin", 32)], 32);
        let store = Arc::new(
            PartStore::open(torrent.clone(), dir.path(), dir.path())
                .await
                .unwrap(),
        );
        store.write_piece(0, &[0xaa; 32]).await.unwrap();
        store.write_piece(1, &[0xbb; 32]).await.unwrap();

        let mut progress = Bitfield::new(2);
        progress.set(0);
        progress.set(1);
        write_snapshot(&store, &torrent, &progress).await;

        let (bits, bytes) = load_resume(&store, &torrent).await.unwrap();
        assert_eq!(bits.count_set(), 2);
        assert_eq!(bytes, 64);
    }

    #[tokio::test]
    async fn test_load_resume_drops_pieces_of_missing_parts() {
        let dir = tempdir().unwrap();
        let torrent = make_torrent(vec![("a.bin", 32), ("b.bin", 32)], 32);
        let store = Arc::new(
            PartStore::open(torrent.clone(), dir.path(), dir.path())
                .await
                .unwrap(),
        );
        // Only file 0 gets a part on disk
        store.write_piece(0, &[0xaa; 32]).await.unwrap();

        let mut progress = Bitfield::new(2);
        progress.set(0);
        progress.set(1);
        write_snapshot(&store, &torrent, &progress).await;

        let (bits, bytes) = load_resume(&store, &torrent).await.unwrap();
        assert!(bits.get(0));
        assert!(!bits.get(1));
        assert_eq!(bytes, 32);
    }

    #[tokio::test]
    async fn test_load_resume_drops_straddling_piece() {
        let dir = tempdir().unwrap();
        // 48-byte files at 32-byte pieces: piece 1 straddles both files
        let torrent = make_torrent(vec![("a.bin", 48), ("b.bin", 48)], 32);
        let store = Arc::new(
            PartStore::open(torrent.clone(), dir.path(), dir.path())
                .await
                .unwrap(),
        );
        store.write_piece(0, &[0x11; 32]).await.unwrap();
        store.write_piece(1, &[0x22; 32]).await.unwrap();

        let mut progress = Bitfield::new(3);
        progress.set(0);
        progress.set(1);
        write_snapshot(&store, &torrent, &progress).await;

        // File 1's part never hit the disk, which takes the straddling
        // piece 1 with it
        tokio::fs::remove_file(dir.path().join("resume-test").join("b.bin.part"))
            .await
            .unwrap();
        let (bits, bytes) = load_resume(&store, &torrent).await.unwrap();
        assert!(bits.get(0));
        assert!(!bits.get(1));
        assert_eq!(bytes, 32);
    }

    #[tokio::test]
    async fn test_load_resume_rejects_foreign_snapshot() {
        let dir = tempdir().unwrap();
        let torrent = make_torrent(vec![("a.bin", 64)], 32);
        let store = Arc::new(
            PartStore::open(torrent.clone(), dir.path(), dir.path())
                .await
                .unwrap(),
        );
        store.write_piece(0, &[0xcc; 32]).await.unwrap();

        let mut other = (*torrent).clone();
        other.info_hash = [0x77; 20];
        let other = Arc::new(other);
        let mut progress = Bitfield::new(2);
        progress.set(0);
        write_snapshot(&store, &other, &progress).await;

        assert!(load_resume(&store, &torrent).await.is_none());

        // Unparseable snapshots are ignored the same way
        tokio::fs::write(store.session_path(), b"not json")
            .await
            .unwrap();
        assert!(load_resume(&store, &torrent).await.is_none());
    }

    #[tokio::test]
    async fn test_resumed_complete_session_finishes_without_peers() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let content = [0x3cu8; 64];
        let doc = torrent_doc("finished", 32, &content);
        let torrent = Arc::new(Torrent::parse(&doc).unwrap());

        // Lay down every piece and a full snapshot before the session
        // ever sees the torrent
        let store = PartStore::open(
            torrent.clone(),
            &config.resolved_incomplete_dir(),
            &config.download_dir,
        )
        .await
        .unwrap();
        store.write_piece(0, &content[..32]).await.unwrap();
        store.write_piece(1, &content[32..]).await.unwrap();
        let progress = Bitfield::all_set(2);
        write_snapshot(&store, &torrent, &progress).await;
        drop(store);

        let session = Session::from_torrent_bytes(&doc, config.clone()).await.unwrap();
        assert!(session.is_complete());
        session.start().unwrap();
        let status = session.wait().await.unwrap();
        assert_eq!(status, TerminalStatus::Done);

        let final_path = config.download_dir.join("finished");
        let data = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(data, content);

        // stream_read keeps working after materialization
        let read = session.stream_read(0, 16, 32).await.unwrap();
        assert_eq!(read, &content[16..48]);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let dir = tempdir().unwrap();
        let doc = torrent_doc("twice", 32, &[0x01; 32]);
        let session = Session::from_torrent_bytes(&doc, test_config(dir.path()))
            .await
            .unwrap();

        assert!(matches!(
            session.wait().await,
            Err(EngineError::InvalidState { .. })
        ));
        session.start().unwrap();
        assert!(matches!(
            session.start(),
            Err(EngineError::InvalidState { .. })
        ));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_stream_read_before_metadata_errors() {
        let dir = tempdir().unwrap();
        let session = Session::from_magnet(
            "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbb&dn=pending",
            test_config(dir.path()),
        )
        .unwrap();
        session.start().unwrap();

        let err = session.stream_read(0, 0, 16).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));

        session.stop().await;
        let status = session.wait().await.unwrap();
        assert_eq!(status, TerminalStatus::StoppedIncomplete);
    }

    #[tokio::test]
    async fn test_stopped_session_snapshots_progress() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let content = [0x4du8; 64];
        let doc = torrent_doc("partial", 32, &content);
        let torrent = Arc::new(Torrent::parse(&doc).unwrap());

        // One of two pieces already on disk from a previous run
        let store = PartStore::open(
            torrent.clone(),
            &config.resolved_incomplete_dir(),
            &config.download_dir,
        )
        .await
        .unwrap();
        store.write_piece(0, &content[..32]).await.unwrap();
        let mut progress = Bitfield::new(2);
        progress.set(0);
        write_snapshot(&store, &torrent, &progress).await;

        let session = Session::from_torrent_bytes(&doc, config).await.unwrap();
        assert!(!session.is_complete());
        session.start().unwrap();
        session.stop().await;
        assert_eq!(
            session.wait().await.unwrap(),
            TerminalStatus::StoppedIncomplete
        );

        // The wind-down rewrote the snapshot with the same progress
        let bytes = tokio::fs::read(store.session_path()).await.unwrap();
        let snapshot: SessionSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(snapshot.progress, vec![0b1000_0000]);
        assert_eq!(snapshot.piece_count, 2);
    }
}
