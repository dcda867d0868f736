//! Swarm coordinator
//!
//! One task owns the download: it consumes events from peer tasks and
//! discovery sources over a single queue, keeps the peer registry and
//! piece state behind short-lived locks, and drives all periodic work
//! from a fast tick. Peer tasks never touch shared state directly; they
//! report what happened and the coordinator decides what to do next.
//!
//! The download itself is a two-phase state machine. A magnet start
//! spends its first phase collecting the info dictionary from peers
//! (`DownloadState::Bootstrapping`); once that verifies against the
//! info-hash the swarm opens storage and switches to piece collection
//! (`DownloadState::Downloading`). A torrent-file start skips straight
//! to the second phase.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::bitfield::Bitfield;
use crate::config::SessionConfig;
use crate::dht::DhtDiscovery;
use crate::error::Result;
use crate::magnet::MagnetLink;
use crate::metadata::{MetadataBootstrap, MetadataUpdate};
use crate::metainfo::{Sha1Hash, Torrent};
use crate::peer::{self, PeerCommand, PeerEventKind, PeerHandle, PeerTimeouts};
use crate::piece::{BlockOutcome, PieceTracker};
use crate::session::{RunState, SessionEvent, SessionSnapshot, TerminalStatus};
use crate::stats::{eta_secs, Counters, PeerCounts, RateTracker, StatsSnapshot};
use crate::storage::PartStore;
use crate::tracker::{Announce, AnnounceEvent, TrackerClient};

/// Everything feeding the coordinator funnels through one queue of
/// this size. Peer tasks block briefly when it fills, which is the
/// backpressure that keeps a fast swarm from outrunning the loop.
const EVENT_QUEUE: usize = 1024;

/// Port reported to trackers. The engine never listens for inbound
/// connections, so the value only has to be plausible.
const REPORTED_PORT: u16 = 6881;

/// How often metadata request latches are checked against their
/// timeout during bootstrap.
const LATCH_SWEEP: Duration = Duration::from_secs(1);

/// Anything that can happen to the swarm, from any source.
#[derive(Debug)]
pub enum SwarmEvent {
    /// A peer task reporting on its connection
    Peer { addr: SocketAddr, kind: PeerEventKind },
    /// Fresh peer addresses from a tracker or the DHT
    Discovered {
        addrs: Vec<SocketAddr>,
        source: &'static str,
    },
}

/// Where a known peer sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Known address, no task yet
    Queued,
    /// Task spawned, handshake pending
    Connecting,
    /// Handshake done, still choked
    Connected,
    /// Unchoked and idle
    Ready,
    /// Unchoked with requests in flight
    Downloading,
    /// Gave up on this peer
    Failed,
    /// Connection ended
    Disconnected,
}

/// Coordinator-side record for one peer address.
struct PeerState {
    phase: PeerPhase,
    handle: Option<PeerHandle>,
    unchoked: bool,
    has_all: bool,
    has_none: bool,
    /// Bitfield bytes held verbatim until the piece count is known
    raw_bitfield: Option<Vec<u8>>,
    pieces: Option<Bitfield>,
    supports_metadata: bool,
    /// Set while a metadata request batch is outstanding to this peer
    metadata_inflight: Option<Instant>,
    timeout_strikes: usize,
    last_sent: Instant,
}

impl PeerState {
    fn queued() -> Self {
        Self {
            phase: PeerPhase::Queued,
            handle: None,
            unchoked: false,
            has_all: false,
            has_none: false,
            raw_bitfield: None,
            pieces: None,
            supports_metadata: false,
            metadata_inflight: None,
            timeout_strikes: 0,
            last_sent: Instant::now(),
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self.phase,
            PeerPhase::Connecting
                | PeerPhase::Connected
                | PeerPhase::Ready
                | PeerPhase::Downloading
        )
    }
}

/// The two phases of a download.
enum DownloadState {
    /// Collecting the info dictionary from peers (magnet start)
    Bootstrapping(MetadataBootstrap),
    /// Metadata known, collecting content pieces
    Downloading { pieces: PieceTracker },
}

/// Periodic work schedule. The tick fires every few milliseconds; each
/// slower cadence runs when its deadline passes.
struct Cadence {
    sweep_every: Duration,
    keep_alive_every: Duration,
    interested_every: Duration,
    announce_every: Duration,
    next_sweep: Instant,
    next_keep_alive: Instant,
    next_interested: Instant,
    next_announce: Instant,
    next_latch: Instant,
}

impl Cadence {
    fn new(now: Instant, config: &SessionConfig) -> Self {
        let sweep_every = Duration::from_secs(config.sweep_interval_secs.max(1));
        let keep_alive_every = Duration::from_secs(config.keep_alive_interval_secs.max(1));
        let interested_every = Duration::from_secs(config.re_interested_interval_secs.max(1));
        let announce_every = Duration::from_secs(config.reannounce_interval_secs.max(1));
        Self {
            sweep_every,
            keep_alive_every,
            interested_every,
            announce_every,
            next_sweep: now + sweep_every,
            next_keep_alive: now + keep_alive_every,
            next_interested: now + interested_every,
            next_announce: now + announce_every,
            next_latch: now + LATCH_SWEEP,
        }
    }
}

/// The download coordinator for one torrent.
pub struct Swarm {
    config: SessionConfig,
    info_hash: Sha1Hash,
    peer_id: [u8; 20],
    peers: RwLock<HashMap<SocketAddr, PeerState>>,
    state: Arc<RwLock<DownloadState>>,
    /// Set at construction for torrent-file starts, at metadata
    /// completion for magnet starts
    store: OnceLock<Arc<PartStore>>,
    trackers: RwLock<Vec<String>>,
    name: RwLock<String>,
    /// Total-size hint from a magnet link, checked against the real
    /// metadata once it arrives
    length_hint: Option<u64>,
    counters: Arc<Counters>,
    events_tx: mpsc::Sender<SwarmEvent>,
    session_events: broadcast::Sender<SessionEvent>,
    /// Bumped once per verified piece; readers wait on it
    progress_tx: watch::Sender<u64>,
    tracker_client: Arc<TrackerClient>,
}

impl Swarm {
    /// Swarm for a download whose metadata is already known.
    pub(crate) fn for_torrent(
        torrent: Arc<Torrent>,
        store: Arc<PartStore>,
        resume: Option<(Bitfield, u64)>,
        config: SessionConfig,
        session_events: broadcast::Sender<SessionEvent>,
        progress_tx: watch::Sender<u64>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SwarmEvent>)> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let counters = Arc::new(Counters::default());

        let pieces = match resume {
            Some((progress, bytes)) => {
                counters.set_previous_session(bytes);
                PieceTracker::from_resume(torrent.clone(), progress)
            }
            None => PieceTracker::new(torrent.clone()),
        };
        let state = Arc::new(RwLock::new(DownloadState::Downloading { pieces }));
        install_focus_hook(&store, &state);

        let swarm = Arc::new(Self {
            config,
            info_hash: torrent.info_hash,
            peer_id: peer::generate_peer_id(),
            peers: RwLock::new(HashMap::new()),
            state,
            store: OnceLock::new(),
            trackers: RwLock::new(torrent.trackers.clone()),
            name: RwLock::new(torrent.name.clone()),
            length_hint: None,
            counters,
            events_tx,
            session_events,
            progress_tx,
            tracker_client: Arc::new(TrackerClient::new()?),
        });
        let _ = swarm.store.set(store);
        Ok((swarm, events_rx))
    }

    /// Swarm for a magnet start. Storage stays closed until the
    /// metadata exchange completes.
    pub(crate) fn for_magnet(
        magnet: &MagnetLink,
        config: SessionConfig,
        session_events: broadcast::Sender<SessionEvent>,
        progress_tx: watch::Sender<u64>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SwarmEvent>)> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let name = magnet
            .display_name
            .clone()
            .unwrap_or_else(|| hex_string(&magnet.info_hash));

        let swarm = Arc::new(Self {
            config,
            info_hash: magnet.info_hash,
            peer_id: peer::generate_peer_id(),
            peers: RwLock::new(HashMap::new()),
            state: Arc::new(RwLock::new(DownloadState::Bootstrapping(
                MetadataBootstrap::new(magnet.info_hash),
            ))),
            store: OnceLock::new(),
            trackers: RwLock::new(magnet.trackers.clone()),
            name: RwLock::new(name),
            length_hint: magnet.exact_length,
            counters: Arc::new(Counters::default()),
            events_tx,
            session_events,
            progress_tx,
            tracker_client: Arc::new(TrackerClient::new()?),
        });
        Ok((swarm, events_rx))
    }

    pub(crate) fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn store(&self) -> Option<Arc<PartStore>> {
        self.store.get().cloned()
    }

    pub(crate) fn is_complete(&self) -> bool {
        match &*self.state.read() {
            DownloadState::Downloading { pieces } => pieces.is_complete(),
            DownloadState::Bootstrapping(_) => false,
        }
    }

    /// Focus piece selection on the pieces backing a byte range of one
    /// file. Returns the range for the caller to wait on, or `None`
    /// before metadata is known.
    pub(crate) fn focus_pieces_for(
        &self,
        file: usize,
        offset: u64,
        len: u64,
    ) -> Option<Range<u32>> {
        let mut st = self.state.write();
        let DownloadState::Downloading { pieces } = &mut *st else {
            return None;
        };
        let range = {
            let torrent = pieces.torrent();
            let entry = torrent.files.get(file)?;
            torrent.pieces_for_range(entry.offset + offset, len)
        };
        pieces.set_focus(range.clone());
        Some(range)
    }

    /// True when every piece in the range has been verified.
    pub(crate) fn range_verified(&self, range: &Range<u32>) -> bool {
        match &*self.state.read() {
            DownloadState::Downloading { pieces } => {
                let progress = pieces.progress();
                (range.start..range.end).all(|i| progress.get(i as usize))
            }
            DownloadState::Bootstrapping(_) => false,
        }
    }

    /// Run the coordinator until the download finishes or is stopped.
    pub(crate) async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SwarmEvent>,
        mut control: watch::Receiver<RunState>,
    ) -> TerminalStatus {
        let status = self.run_inner(&mut events, &mut control).await;
        self.teardown(&status).await;
        info!(status = ?status, "swarm finished");
        let _ = self.session_events.send(SessionEvent::Finished(status.clone()));
        status
    }

    async fn run_inner(
        &self,
        events: &mut mpsc::Receiver<SwarmEvent>,
        control: &mut watch::Receiver<RunState>,
    ) -> TerminalStatus {
        // A resumed session may already hold every piece
        if self.is_complete() {
            return self.try_finish().await;
        }

        let now = Instant::now();
        let mut dht = DhtDiscovery::new(self.info_hash, self.events_tx.clone());
        let mut rates = RateTracker::new(now);
        let mut cadence = Cadence::new(now, &self.config);
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.spawn_announces(AnnounceEvent::Started);
        self.dht_pressure(&mut dht, &PeerCounts::default());

        loop {
            tokio::select! {
                changed = control.changed() => {
                    if changed.is_err() || *control.borrow() == RunState::Stopped {
                        return TerminalStatus::StoppedIncomplete;
                    }
                }
                received = events.recv() => {
                    let Some(event) = received else {
                        return TerminalStatus::StoppedIncomplete;
                    };
                    if let Some(status) = self.dispatch(event).await {
                        return status;
                    }
                    // Drain whatever else queued up behind it
                    while let Ok(event) = events.try_recv() {
                        if let Some(status) = self.dispatch(event).await {
                            return status;
                        }
                    }
                }
                _ = tick.tick() => {
                    let paused = match *control.borrow() {
                        RunState::Stopped => return TerminalStatus::StoppedIncomplete,
                        RunState::Paused => true,
                        RunState::Running => false,
                    };
                    self.on_tick(&mut cadence, &mut dht, &mut rates, paused).await;
                }
            }
        }
    }

    async fn teardown(&self, status: &TerminalStatus) {
        self.disconnect_all();
        match status {
            TerminalStatus::Done => self.spawn_announces(AnnounceEvent::Completed),
            _ => {
                self.persist_snapshot().await;
                self.spawn_announces(AnnounceEvent::Stopped);
            }
        }
    }

    async fn dispatch(&self, event: SwarmEvent) -> Option<TerminalStatus> {
        match event {
            SwarmEvent::Discovered { addrs, source } => {
                self.add_candidates(addrs, source);
                None
            }
            SwarmEvent::Peer { addr, kind } => self.on_peer_event(addr, kind).await,
        }
    }

    fn add_candidates(&self, addrs: Vec<SocketAddr>, source: &'static str) {
        let mut peers = self.peers.write();
        let mut added = 0usize;
        for addr in addrs {
            if let Entry::Vacant(slot) = peers.entry(addr) {
                slot.insert(PeerState::queued());
                added += 1;
            }
        }
        if added > 0 {
            debug!(added, source, total = peers.len(), "peer candidates");
        }
    }

    async fn on_peer_event(&self, addr: SocketAddr, kind: PeerEventKind) -> Option<TerminalStatus> {
        match kind {
            PeerEventKind::Connected { supports_fast } => {
                trace!(%addr, supports_fast, "peer connected");
                if let Some(p) = self.peers.write().get_mut(&addr) {
                    p.phase = PeerPhase::Connected;
                }
                None
            }
            PeerEventKind::MetadataSupport { metadata_size } => {
                if let Some(p) = self.peers.write().get_mut(&addr) {
                    p.supports_metadata = true;
                }
                if let Some(size) = metadata_size {
                    let hostile = {
                        let mut st = self.state.write();
                        match &mut *st {
                            DownloadState::Bootstrapping(b) => {
                                b.set_total_size(size as usize).is_err()
                            }
                            DownloadState::Downloading { .. } => false,
                        }
                    };
                    if hostile {
                        self.drop_peer(addr, PeerPhase::Failed, "metadata size over limit");
                        return None;
                    }
                }
                self.pump_metadata(Some(addr));
                None
            }
            PeerEventKind::Unchoked => {
                if let Some(p) = self.peers.write().get_mut(&addr) {
                    p.unchoked = true;
                    if p.phase == PeerPhase::Connected {
                        p.phase = PeerPhase::Ready;
                    }
                }
                None
            }
            PeerEventKind::Choked => {
                if let Some(p) = self.peers.write().get_mut(&addr) {
                    p.unchoked = false;
                    if matches!(p.phase, PeerPhase::Ready | PeerPhase::Downloading) {
                        p.phase = PeerPhase::Connected;
                    }
                }
                // Anything in flight will come back through the sweep
                None
            }
            PeerEventKind::HaveAll => {
                if let Some(p) = self.peers.write().get_mut(&addr) {
                    p.has_all = true;
                    p.has_none = false;
                }
                None
            }
            PeerEventKind::HaveNone => {
                if let Some(p) = self.peers.write().get_mut(&addr) {
                    p.has_none = true;
                    p.has_all = false;
                }
                None
            }
            PeerEventKind::BitfieldReceived { bytes } => {
                let count = self.known_piece_count();
                let mut peers = self.peers.write();
                let Some(p) = peers.get_mut(&addr) else {
                    return None;
                };
                match count {
                    Some(count) => match Bitfield::from_bytes(&bytes, count) {
                        Some(bf) => p.pieces = Some(bf),
                        None => {
                            warn!(%addr, "bitfield does not fit the piece count");
                            if let Some(h) = p.handle.take() {
                                h.command(PeerCommand::Disconnect);
                            }
                            p.phase = PeerPhase::Failed;
                        }
                    },
                    None => p.raw_bitfield = Some(bytes),
                }
                None
            }
            PeerEventKind::Have { piece } => {
                let count = self.known_piece_count();
                if let Some(p) = self.peers.write().get_mut(&addr) {
                    match (&mut p.pieces, count) {
                        (Some(bf), _) => bf.set(piece as usize),
                        (none, Some(count)) if (piece as usize) < count => {
                            let mut bf = Bitfield::new(count);
                            bf.set(piece as usize);
                            *none = Some(bf);
                        }
                        _ => trace!(%addr, piece, "have before piece count, ignored"),
                    }
                    p.has_none = false;
                }
                None
            }
            PeerEventKind::Block {
                piece,
                offset,
                data,
            } => self.on_block(addr, piece, offset, data).await,
            PeerEventKind::Rejected { piece, offset } => {
                trace!(%addr, piece, offset, "request rejected");
                let mut st = self.state.write();
                if let DownloadState::Downloading { pieces } = &mut *st {
                    pieces.on_reject(piece, offset);
                }
                None
            }
            PeerEventKind::MetadataData {
                piece,
                total_size,
                payload,
            } => self.on_metadata_data(addr, piece, total_size, payload).await,
            PeerEventKind::MetadataRejected { piece } => {
                debug!(%addr, piece, "metadata request rejected");
                self.unlatch_metadata(addr);
                None
            }
            PeerEventKind::Failed { reason } => {
                let had_latch = {
                    let mut peers = self.peers.write();
                    match peers.get_mut(&addr) {
                        Some(p) => {
                            p.phase = PeerPhase::Failed;
                            p.handle = None;
                            p.metadata_inflight.take().is_some()
                        }
                        None => false,
                    }
                };
                if had_latch {
                    self.refund_metadata_slot();
                }
                let released = self.release_requests(addr);
                debug!(%addr, %reason, released, "peer failed");
                None
            }
            PeerEventKind::Disconnected => {
                let had_latch = {
                    let mut peers = self.peers.write();
                    match peers.get_mut(&addr) {
                        Some(p) => {
                            if p.phase != PeerPhase::Failed {
                                p.phase = PeerPhase::Disconnected;
                            }
                            p.handle = None;
                            p.metadata_inflight.take().is_some()
                        }
                        None => false,
                    }
                };
                if had_latch {
                    self.refund_metadata_slot();
                }
                let released = self.release_requests(addr);
                trace!(%addr, released, "peer disconnected");
                None
            }
        }
    }

    async fn on_block(
        &self,
        addr: SocketAddr,
        piece: u32,
        offset: u32,
        data: Vec<u8>,
    ) -> Option<TerminalStatus> {
        let len = data.len() as u64;
        let outcome = {
            let mut st = self.state.write();
            match &mut *st {
                DownloadState::Downloading { pieces } => pieces.on_block(piece, offset, &data),
                DownloadState::Bootstrapping(_) => {
                    self.counters.add_dropped(len);
                    return None;
                }
            }
        };
        match outcome {
            BlockOutcome::Dropped { bytes } => {
                self.counters.add_dropped(bytes);
                None
            }
            BlockOutcome::Accepted => {
                self.counters.add_downloaded(len);
                None
            }
            BlockOutcome::HashMismatch { bytes } => {
                // every byte of the corrupt piece moves from the
                // downloaded bucket to the dropped one
                self.counters.add_downloaded(len);
                self.counters.remove_downloaded(bytes);
                self.counters.add_dropped(bytes);
                self.counters.add_hash_failure();
                warn!(%addr, piece, "piece failed hash check, requeued");
                None
            }
            BlockOutcome::Verified { data: assembled } => {
                self.counters.add_downloaded(len);
                let Some(store) = self.store.get() else {
                    return Some(TerminalStatus::Error(
                        "piece verified with no storage open".into(),
                    ));
                };
                if let Err(e) = store.write_piece(piece, &assembled).await {
                    error!(piece, error = %e, "piece write failed");
                    return Some(TerminalStatus::Error(e.to_string()));
                }
                trace!(piece, "piece verified");
                self.progress_tx.send_modify(|v| *v += 1);
                if self.is_complete() {
                    return Some(self.try_finish().await);
                }
                None
            }
        }
    }

    async fn on_metadata_data(
        &self,
        addr: SocketAddr,
        piece: u32,
        total_size: u64,
        payload: Vec<u8>,
    ) -> Option<TerminalStatus> {
        self.unlatch_only(addr);
        let update = {
            let mut st = self.state.write();
            match &mut *st {
                DownloadState::Bootstrapping(b) => match b.on_data(piece, total_size, &payload) {
                    Ok(update) => update,
                    Err(e) => {
                        error!(error = %e, "metadata exchange failed");
                        return Some(TerminalStatus::Error(e.to_string()));
                    }
                },
                DownloadState::Downloading { .. } => {
                    self.counters.add_dropped(payload.len() as u64);
                    return None;
                }
            }
        };
        match update {
            MetadataUpdate::Ignored => {
                self.counters.add_dropped(payload.len() as u64);
                None
            }
            MetadataUpdate::Stored => {
                trace!(%addr, piece, "metadata piece stored");
                self.pump_metadata(None);
                None
            }
            MetadataUpdate::Complete => self.finalize_metadata().await,
        }
    }

    /// Clear a peer's metadata latch without touching the budget. Used
    /// on data replies, where the state machine refunds internally.
    fn unlatch_only(&self, addr: SocketAddr) {
        if let Some(p) = self.peers.write().get_mut(&addr) {
            p.metadata_inflight = None;
        }
    }

    /// Clear a peer's metadata latch and return its slot to the pool.
    /// Used on rejects, where nothing refunds internally.
    fn unlatch_metadata(&self, addr: SocketAddr) {
        let had_latch = match self.peers.write().get_mut(&addr) {
            Some(p) => p.metadata_inflight.take().is_some(),
            None => false,
        };
        if had_latch {
            self.refund_metadata_slot();
        }
    }

    fn refund_metadata_slot(&self) {
        let mut st = self.state.write();
        if let DownloadState::Bootstrapping(b) = &mut *st {
            b.refund();
        }
    }

    fn known_piece_count(&self) -> Option<usize> {
        match &*self.state.read() {
            DownloadState::Downloading { pieces } => {
                Some(pieces.torrent().piece_count() as usize)
            }
            DownloadState::Bootstrapping(_) => None,
        }
    }

    fn release_requests(&self, addr: SocketAddr) -> usize {
        let mut st = self.state.write();
        match &mut *st {
            DownloadState::Downloading { pieces } => pieces.release_peer(addr),
            DownloadState::Bootstrapping(_) => 0,
        }
    }

    /// Disconnect a live peer and forget any work assigned to it.
    fn drop_peer(&self, addr: SocketAddr, phase: PeerPhase, reason: &str) {
        let had_latch = {
            let mut peers = self.peers.write();
            let Some(p) = peers.get_mut(&addr) else {
                return;
            };
            if let Some(h) = p.handle.take() {
                h.command(PeerCommand::Disconnect);
            }
            p.phase = phase;
            p.metadata_inflight.take().is_some()
        };
        if had_latch {
            self.refund_metadata_slot();
        }
        let released = self.release_requests(addr);
        debug!(%addr, released, reason, "peer dropped");
    }

    fn pump_metadata(&self, only: Option<SocketAddr>) {
        let mut peers = self.peers.write();
        let mut st = self.state.write();
        if let DownloadState::Bootstrapping(bootstrap) = &mut *st {
            pump_metadata_locked(&mut peers, bootstrap, only, Instant::now());
        }
    }

    async fn on_tick(
        &self,
        cadence: &mut Cadence,
        dht: &mut DhtDiscovery,
        rates: &mut RateTracker,
        paused: bool,
    ) {
        let now = Instant::now();
        let mut counts = self.accounting_pass();
        if !paused {
            self.shed_choked_peers(&mut counts);
            self.action_pass(now);
        }

        if now >= cadence.next_latch {
            cadence.next_latch = now + LATCH_SWEEP;
            self.metadata_sweep(now, !paused);
        }
        if now >= cadence.next_sweep {
            cadence.next_sweep = now + cadence.sweep_every;
            self.sweep(now);
            self.purge_terminal_peers();
            self.refresh_stats(rates, counts, now);
            if !paused {
                self.dht_pressure(dht, &counts);
            }
        }
        if now >= cadence.next_keep_alive {
            cadence.next_keep_alive = now + cadence.keep_alive_every;
            self.send_keep_alives(now);
        }
        if now >= cadence.next_interested {
            cadence.next_interested = now + cadence.interested_every;
            if !paused {
                self.resend_interested(now);
            }
        }
        if now >= cadence.next_announce {
            cadence.next_announce = now + cadence.announce_every;
            if !paused {
                self.spawn_announces(AnnounceEvent::None);
            }
            dht.clear_cached_peers();
            self.persist_snapshot().await;
        }
    }

    fn accounting_pass(&self) -> PeerCounts {
        let peers = self.peers.read();
        let mut counts = PeerCounts::default();
        for p in peers.values() {
            match p.phase {
                PeerPhase::Queued => counts.queued += 1,
                PeerPhase::Connecting => counts.connecting += 1,
                PeerPhase::Connected => counts.connected += 1,
                PeerPhase::Ready => counts.ready += 1,
                PeerPhase::Downloading => counts.downloading += 1,
                PeerPhase::Failed => counts.failed += 1,
                PeerPhase::Disconnected => counts.disconnected += 1,
            }
        }
        counts
    }

    /// Forget peers that reached a terminal phase. Their addresses
    /// become fresh candidates the next time a tracker or the DHT
    /// offers them.
    fn purge_terminal_peers(&self) {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|_, p| {
            !matches!(p.phase, PeerPhase::Failed | PeerPhase::Disconnected)
        });
        let removed = before - peers.len();
        if removed > 0 {
            debug!(removed, remaining = peers.len(), "forgot terminal peers");
        }
    }

    /// When choked peers sit on more than half the connection budget
    /// while fresh candidates wait, disconnect the excess to make room.
    fn shed_choked_peers(&self, counts: &mut PeerCounts) {
        let max = self.config.max_connections;
        if counts.connected <= max / 2 || counts.queued <= max / 4 {
            return;
        }
        let excess = counts.connected - max / 2;
        let mut refunds = 0usize;
        let dropped;
        {
            let mut peers = self.peers.write();
            let victims: Vec<SocketAddr> = peers
                .iter()
                .filter(|(_, p)| p.phase == PeerPhase::Connected)
                .map(|(a, _)| *a)
                .take(excess)
                .collect();
            dropped = victims.len();
            for addr in victims {
                if let Some(p) = peers.get_mut(&addr) {
                    if let Some(h) = p.handle.take() {
                        h.command(PeerCommand::Disconnect);
                    }
                    if p.metadata_inflight.take().is_some() {
                        refunds += 1;
                    }
                    p.phase = PeerPhase::Disconnected;
                    counts.connected -= 1;
                    counts.disconnected += 1;
                }
            }
        }
        for _ in 0..refunds {
            self.refund_metadata_slot();
        }
        if dropped > 0 {
            debug!(dropped, "shed choked peers to make room");
        }
    }

    /// Dial queued peers into free slots, then hand out work to every
    /// unchoked peer with spare request quota.
    fn action_pass(&self, now: Instant) {
        let mut peers = self.peers.write();

        let active = peers.values().filter(|p| p.is_active()).count();
        let slots = self.config.max_connections.saturating_sub(active);
        if slots > 0 {
            let timeouts = PeerTimeouts {
                connect: Duration::from_millis(self.config.connect_timeout_ms),
                handshake: Duration::from_millis(self.config.handshake_timeout_ms),
            };
            let promote: Vec<SocketAddr> = peers
                .iter()
                .filter(|(_, p)| p.phase == PeerPhase::Queued)
                .map(|(a, _)| *a)
                .take(slots)
                .collect();
            if !promote.is_empty() {
                debug!(count = promote.len(), "dialing queued peers");
            }
            for addr in promote {
                let handle =
                    peer::spawn_peer(addr, self.info_hash, self.peer_id, timeouts, self.events_tx.clone());
                if let Some(p) = peers.get_mut(&addr) {
                    p.phase = PeerPhase::Connecting;
                    p.handle = Some(handle);
                    p.last_sent = now;
                }
            }
        }

        let mut st = self.state.write();
        match &mut *st {
            DownloadState::Bootstrapping(bootstrap) => {
                pump_metadata_locked(&mut peers, bootstrap, None, now);
            }
            DownloadState::Downloading { pieces } => {
                let quota = self.config.blocks_per_peer;
                for (addr, p) in peers.iter_mut() {
                    if !p.unchoked
                        || !matches!(p.phase, PeerPhase::Ready | PeerPhase::Downloading)
                    {
                        continue;
                    }
                    if !p.has_all && p.pieces.is_none() {
                        continue;
                    }
                    let in_flight = pieces.outstanding_for(*addr);
                    if in_flight >= quota {
                        continue;
                    }
                    let batch = pieces.select_for_peer(
                        *addr,
                        p.has_all,
                        p.pieces.as_ref(),
                        quota - in_flight,
                        now,
                    );
                    if batch.is_empty() {
                        if in_flight == 0 && p.phase == PeerPhase::Downloading {
                            p.phase = PeerPhase::Ready;
                        }
                        continue;
                    }
                    let Some(handle) = &p.handle else {
                        pieces.release_peer(*addr);
                        p.phase = PeerPhase::Disconnected;
                        continue;
                    };
                    trace!(%addr, blocks = batch.len(), "requesting blocks");
                    handle.command(PeerCommand::RequestBlocks(batch));
                    p.phase = PeerPhase::Downloading;
                    p.last_sent = now;
                }
            }
        }
    }

    /// Requeue timed-out block requests and penalize the peers that sat
    /// on them. A peer that burns through its whole quota is dropped.
    fn sweep(&self, now: Instant) {
        let timeout = Duration::from_millis(self.config.piece_timeout_ms);
        let expired = {
            let mut st = self.state.write();
            match &mut *st {
                DownloadState::Downloading { pieces } => pieces.sweep_timeouts(timeout, now),
                DownloadState::Bootstrapping(_) => Vec::new(),
            }
        };
        if expired.is_empty() {
            return;
        }
        warn!(count = expired.len(), "block requests timed out");

        let mut strikes: HashMap<SocketAddr, usize> = HashMap::new();
        for entry in &expired {
            *strikes.entry(entry.peer).or_default() += 1;
        }

        let quota = self.config.blocks_per_peer;
        let mut to_release = Vec::new();
        {
            let mut peers = self.peers.write();
            for (addr, n) in strikes {
                let Some(p) = peers.get_mut(&addr) else {
                    continue;
                };
                p.timeout_strikes += n;
                if p.timeout_strikes >= quota && p.is_active() {
                    if let Some(h) = p.handle.take() {
                        h.command(PeerCommand::Disconnect);
                    }
                    p.phase = PeerPhase::Failed;
                    to_release.push(addr);
                    debug!(%addr, strikes = p.timeout_strikes, "peer dropped on timeout quota");
                } else if p.phase == PeerPhase::Downloading {
                    p.phase = PeerPhase::Ready;
                }
            }
        }
        if !to_release.is_empty() {
            let mut st = self.state.write();
            if let DownloadState::Downloading { pieces } = &mut *st {
                for addr in to_release {
                    pieces.release_peer(addr);
                }
            }
        }
    }

    /// Time out stale metadata request latches and re-issue requests.
    fn metadata_sweep(&self, now: Instant, pump: bool) {
        let timeout = Duration::from_millis(self.config.metadata_timeout_ms);
        let quota = self.config.blocks_per_peer;
        let mut peers = self.peers.write();
        let mut st = self.state.write();
        let DownloadState::Bootstrapping(bootstrap) = &mut *st else {
            return;
        };
        for (addr, p) in peers.iter_mut() {
            let Some(at) = p.metadata_inflight else {
                continue;
            };
            if now.duration_since(at) < timeout {
                continue;
            }
            p.metadata_inflight = None;
            p.timeout_strikes += 1;
            bootstrap.refund();
            debug!(%addr, strikes = p.timeout_strikes, "metadata request timed out");
            if p.timeout_strikes >= quota {
                if let Some(h) = p.handle.take() {
                    h.command(PeerCommand::Disconnect);
                }
                p.phase = PeerPhase::Failed;
            }
        }
        if pump {
            pump_metadata_locked(&mut peers, bootstrap, None, now);
        }
    }

    fn refresh_stats(&self, rates: &mut RateTracker, counts: PeerCounts, now: Instant) {
        let sample = rates.refresh(self.counters.downloaded(), now);
        let (verified, total_pieces, total_size) = match &*self.state.read() {
            DownloadState::Downloading { pieces } => (
                pieces.verified_count() as u32,
                pieces.torrent().piece_count(),
                pieces.torrent().total_size,
            ),
            // Before metadata the magnet hint is the only size estimate
            DownloadState::Bootstrapping(_) => (0, 0, self.length_hint.unwrap_or(0)),
        };
        let have = self.counters.downloaded() + self.counters.previous_session();
        let eta = if total_size == 0 {
            None
        } else {
            eta_secs(
                total_size.saturating_sub(have),
                sample.down_rate,
                sample.avg_rate,
            )
        };
        let snapshot = StatsSnapshot {
            bytes_downloaded: self.counters.downloaded(),
            bytes_previous_session: self.counters.previous_session(),
            bytes_dropped: self.counters.dropped(),
            down_rate: sample.down_rate,
            avg_rate: sample.avg_rate,
            max_rate: sample.max_rate,
            eta_secs: eta,
            hash_failures: self.counters.hash_failures(),
            verified_pieces: verified,
            total_pieces,
            peers: counts,
        };
        let _ = self.session_events.send(SessionEvent::Stats(snapshot));
    }

    /// Run DHT lookups only while the candidate queue is thin.
    fn dht_pressure(&self, dht: &mut DhtDiscovery, counts: &PeerCounts) {
        if !self.config.enable_dht {
            return;
        }
        let max = self.config.max_connections;
        if counts.queued < max / 4 {
            dht.start();
        } else if counts.queued >= max {
            dht.stop();
        }
    }

    fn send_keep_alives(&self, now: Instant) {
        let interval = Duration::from_secs(self.config.keep_alive_interval_secs.max(1));
        let mut peers = self.peers.write();
        for p in peers.values_mut() {
            if !matches!(p.phase, PeerPhase::Connected | PeerPhase::Ready) {
                continue;
            }
            if now.duration_since(p.last_sent) < interval {
                continue;
            }
            if let Some(h) = &p.handle {
                h.command(PeerCommand::KeepAlive);
                p.last_sent = now;
            }
        }
    }

    /// Remind choked peers that we still want data. Some clients never
    /// unchoke without the occasional nudge.
    fn resend_interested(&self, now: Instant) {
        let mut peers = self.peers.write();
        for p in peers.values_mut() {
            if p.phase != PeerPhase::Connected {
                continue;
            }
            if let Some(h) = &p.handle {
                h.command(PeerCommand::Interested);
                p.last_sent = now;
            }
        }
    }

    fn spawn_announces(&self, event: AnnounceEvent) {
        if !self.config.enable_trackers {
            return;
        }
        let urls = self.trackers.read().clone();
        if urls.is_empty() {
            return;
        }
        let (downloaded, left) = match &*self.state.read() {
            DownloadState::Downloading { pieces } => {
                let total = pieces.torrent().total_size;
                let have = self.counters.downloaded() + self.counters.previous_session();
                (self.counters.downloaded(), total.saturating_sub(have))
            }
            DownloadState::Bootstrapping(_) => (0, 0),
        };
        let request = Announce {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: REPORTED_PORT,
            downloaded,
            left,
            event,
            num_want: (self.config.max_connections * 2) as u32,
        };
        for url in urls {
            let client = self.tracker_client.clone();
            let events = self.events_tx.clone();
            let request = request.clone();
            tokio::spawn(async move {
                match client.announce(&url, &request).await {
                    Ok(resp) => {
                        debug!(
                            %url,
                            peers = resp.peers.len(),
                            seeders = ?resp.seeders,
                            leechers = ?resp.leechers,
                            "tracker announce"
                        );
                        if !resp.peers.is_empty() {
                            let _ = events
                                .send(SwarmEvent::Discovered {
                                    addrs: resp.peers,
                                    source: "tracker",
                                })
                                .await;
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        debug!(%url, error = %e, "tracker announce failed")
                    }
                    Err(e) => warn!(%url, error = %e, "tracker announce failed"),
                }
            });
        }
    }

    /// Metadata exchange finished; open storage and switch the state
    /// machine over to piece collection.
    async fn finalize_metadata(&self) -> Option<TerminalStatus> {
        let info_bytes = {
            let st = self.state.read();
            match &*st {
                DownloadState::Bootstrapping(b) => b.assembled()?.to_vec(),
                DownloadState::Downloading { .. } => return None,
            }
        };
        let trackers = self.trackers.read().clone();
        let torrent = match Torrent::from_info_bytes(&info_bytes, trackers) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                error!(error = %e, "assembled metadata does not parse");
                return Some(TerminalStatus::Error(e.to_string()));
            }
        };
        if torrent.info_hash != self.info_hash {
            return Some(TerminalStatus::Error(
                "assembled metadata does not match the magnet info-hash".into(),
            ));
        }
        if let Some(expected) = self.length_hint {
            if expected != torrent.total_size {
                warn!(
                    expected,
                    actual = torrent.total_size,
                    "metadata size differs from the magnet hint"
                );
            }
        }

        let store = match PartStore::open(
            torrent.clone(),
            &self.config.resolved_incomplete_dir(),
            &self.config.download_dir,
        )
        .await
        {
            Ok(store) => Arc::new(store),
            Err(e) => return Some(TerminalStatus::Error(e.to_string())),
        };
        if let Err(e) = store.check_destinations().await {
            return Some(TerminalStatus::Error(e.to_string()));
        }
        if let Err(e) =
            crate::storage::save_metadata_file(&self.config.download_dir, &torrent.name, &info_bytes)
                .await
        {
            warn!(error = %e, "could not save the torrent file");
        }

        let resume = crate::session::load_resume(&store, &torrent).await;
        let pieces = match resume {
            Some((progress, bytes)) => {
                self.counters.set_previous_session(bytes);
                PieceTracker::from_resume(torrent.clone(), progress)
            }
            None => PieceTracker::new(torrent.clone()),
        };

        install_focus_hook(&store, &self.state);
        let _ = self.store.set(store);
        *self.name.write() = torrent.name.clone();
        {
            let mut st = self.state.write();
            *st = DownloadState::Downloading { pieces };
        }

        // Bitfields that arrived before the piece count are usable now
        {
            let count = torrent.piece_count() as usize;
            let mut peers = self.peers.write();
            for (addr, p) in peers.iter_mut() {
                let Some(raw) = p.raw_bitfield.take() else {
                    continue;
                };
                match Bitfield::from_bytes(&raw, count) {
                    Some(bf) => p.pieces = Some(bf),
                    None => {
                        warn!(%addr, "bitfield does not fit the piece count");
                        if let Some(h) = p.handle.take() {
                            h.command(PeerCommand::Disconnect);
                        }
                        p.phase = PeerPhase::Failed;
                    }
                }
            }
        }

        info!(
            name = %torrent.name,
            pieces = torrent.piece_count(),
            size = torrent.total_size,
            "metadata complete"
        );
        let _ = self.session_events.send(SessionEvent::MetadataReady {
            name: torrent.name.clone(),
        });

        if self.is_complete() {
            return Some(self.try_finish().await);
        }
        None
    }

    /// Every piece is verified; move the content into place.
    async fn try_finish(&self) -> TerminalStatus {
        let Some(store) = self.store.get().cloned() else {
            return TerminalStatus::Error("download complete with no storage open".into());
        };
        info!("all pieces verified, materializing files");
        match store.materialize_all().await {
            Ok(paths) => {
                debug!(files = paths.len(), "download materialized");
                TerminalStatus::Done
            }
            Err(e) => {
                error!(error = %e, "could not move completed files into place");
                TerminalStatus::Error(e.to_string())
            }
        }
    }

    /// Snapshot progress next to the part files so an interrupted
    /// session can pick up where it left off.
    async fn persist_snapshot(&self) {
        let Some(store) = self.store.get() else {
            return;
        };
        let Some(snapshot) = self.snapshot_model() else {
            return;
        };
        let path = store.session_path();
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!(path = %path.display(), error = %e, "session snapshot write failed");
                }
            }
            Err(e) => warn!(error = %e, "session snapshot serialize failed"),
        }
    }

    fn snapshot_model(&self) -> Option<SessionSnapshot> {
        let st = self.state.read();
        let DownloadState::Downloading { pieces } = &*st else {
            return None;
        };
        if pieces.is_complete() {
            return None;
        }
        let torrent = pieces.torrent();
        Some(SessionSnapshot {
            info_hash: torrent.info_hash_hex(),
            name: torrent.name.clone(),
            piece_length: torrent.piece_length,
            total_size: torrent.total_size,
            piece_count: torrent.piece_count(),
            saved_at: chrono::Utc::now(),
            progress: pieces.progress().to_bytes(),
        })
    }

    fn disconnect_all(&self) {
        let mut peers = self.peers.write();
        let mut dropped = 0usize;
        for p in peers.values_mut() {
            if let Some(h) = p.handle.take() {
                h.abort();
                dropped += 1;
            }
            if p.phase != PeerPhase::Failed {
                p.phase = PeerPhase::Disconnected;
            }
        }
        if dropped > 0 {
            debug!(dropped, "disconnected all peers");
        }
    }
}

/// Issue metadata requests to capable peers, one outstanding batch per
/// peer, until the budget runs dry. Callers hold both locks.
fn pump_metadata_locked(
    peers: &mut HashMap<SocketAddr, PeerState>,
    bootstrap: &mut MetadataBootstrap,
    only: Option<SocketAddr>,
    now: Instant,
) {
    if bootstrap.is_done() {
        return;
    }
    for (addr, p) in peers.iter_mut() {
        if only.is_some_and(|want| want != *addr) {
            continue;
        }
        if !p.supports_metadata || p.metadata_inflight.is_some() {
            continue;
        }
        if !matches!(
            p.phase,
            PeerPhase::Connected | PeerPhase::Ready | PeerPhase::Downloading
        ) {
            continue;
        }
        let Some(handle) = &p.handle else {
            continue;
        };
        let pieces = bootstrap.begin_requests();
        if pieces.is_empty() {
            return;
        }
        trace!(%addr, ?pieces, "requesting metadata pieces");
        handle.command(PeerCommand::RequestMetadata(pieces));
        p.metadata_inflight = Some(now);
        p.last_sent = now;
    }
}

/// Wire storage reads to the piece selector so a streaming consumer
/// pulls the window forward as it reads.
fn install_focus_hook(store: &Arc<PartStore>, state: &Arc<RwLock<DownloadState>>) {
    let state = Arc::clone(state);
    store.set_read_hook(Arc::new(move |file, offset, len| {
        let mut st = state.write();
        if let DownloadState::Downloading { pieces } = &mut *st {
            let range = {
                let torrent = pieces.torrent();
                let Some(entry) = torrent.files.get(file) else {
                    return;
                };
                torrent.pieces_for_range(entry.offset + offset, len)
            };
            pieces.set_focus(range);
        }
    }));
}

fn hex_string(hash: &Sha1Hash) -> String {
    let mut out = String::with_capacity(40);
    for byte in hash {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
