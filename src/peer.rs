//! Peer wire protocol and peer tasks
//!
//! BEP 3 framing and handshake, the BEP 10 extension handshake, the
//! ut_metadata messages riding on it, and the subset of BEP 6 this
//! engine consumes (have-all, have-none, reject-request).
//!
//! Each remote peer runs as one task owning its socket. Connecting and
//! handshaking happen inside the task so the coordinator never blocks;
//! afterwards the task forwards inbound traffic as events and serves
//! batched commands (requests, keep-alives) from its channel.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::bencode::Bencode;
use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::metadata::{MetadataMessage, METADATA_EXTENSION_NAME};
use crate::metainfo::Sha1Hash;
use crate::piece::BlockRequest;
use crate::swarm::SwarmEvent;

/// BEP 3 protocol identifier.
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Full handshake: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_SIZE: usize = 68;

/// Frame size cap for most message ids. The largest legitimate one is
/// a block (16 KiB + 13 bytes of framing); anything near the cap is
/// hostile.
const MAX_MESSAGE_SIZE: u32 = 32 * 1024;

/// Bitfield frames scale with the torrent's piece count instead, one
/// bit per piece, so they get their own cap.
const MAX_BITFIELD_SIZE: u32 = 1024 * 1024;

/// Write stall allowance before the connection is declared dead.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Extension message id we assign to ut_metadata in our handshake.
pub const LOCAL_METADATA_ID: u8 = 2;

/// Generate a peer id: client prefix plus random tail.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-SD0300-");
    let tail: [u8; 12] = rand::rng().random();
    id[8..].copy_from_slice(&tail);
    id
}

/// The fixed-size connection preamble.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Our outgoing handshake: extension protocol and fast extension
    /// bits set.
    pub fn new(info_hash: Sha1Hash, peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10; // BEP 10
        reserved[7] |= 0x04; // BEP 6
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut out = [0u8; HANDSHAKE_SIZE];
        out[0] = PROTOCOL_STRING.len() as u8;
        out[1..20].copy_from_slice(PROTOCOL_STRING);
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(&self.info_hash);
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }

    pub fn parse(data: &[u8; HANDSHAKE_SIZE]) -> Result<Self> {
        if data[0] as usize != PROTOCOL_STRING.len() || &data[1..20] != PROTOCOL_STRING {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "unknown protocol string in handshake",
            ));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & 0x04 != 0
    }
}

/// A framed wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield { bytes: Vec<u8> },
    Request { piece: u32, offset: u32, len: u32 },
    Piece { piece: u32, offset: u32, data: Vec<u8> },
    Cancel { piece: u32, offset: u32, len: u32 },
    HaveAll,
    HaveNone,
    RejectRequest { piece: u32, offset: u32, len: u32 },
    Extended { id: u8, payload: Vec<u8> },
    /// Anything we don't consume (suggest, allowed-fast, DHT port).
    /// Tolerated and skipped rather than treated as a violation.
    Unknown { id: u8 },
}

impl PeerMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::KeepAlive => out.extend_from_slice(&0u32.to_be_bytes()),
            Self::Choke => frame(&mut out, 0, &[]),
            Self::Unchoke => frame(&mut out, 1, &[]),
            Self::Interested => frame(&mut out, 2, &[]),
            Self::NotInterested => frame(&mut out, 3, &[]),
            Self::Have { piece } => frame(&mut out, 4, &piece.to_be_bytes()),
            Self::Bitfield { bytes } => frame(&mut out, 5, bytes),
            Self::Request { piece, offset, len } => {
                frame(&mut out, 6, &triple(*piece, *offset, *len))
            }
            Self::Piece { piece, offset, data } => {
                let mut payload = Vec::with_capacity(8 + data.len());
                payload.extend_from_slice(&piece.to_be_bytes());
                payload.extend_from_slice(&offset.to_be_bytes());
                payload.extend_from_slice(data);
                frame(&mut out, 7, &payload)
            }
            Self::Cancel { piece, offset, len } => {
                frame(&mut out, 8, &triple(*piece, *offset, *len))
            }
            Self::HaveAll => frame(&mut out, 0x0e, &[]),
            Self::HaveNone => frame(&mut out, 0x0f, &[]),
            Self::RejectRequest { piece, offset, len } => {
                frame(&mut out, 0x10, &triple(*piece, *offset, *len))
            }
            Self::Extended { id, payload } => {
                let mut body = Vec::with_capacity(1 + payload.len());
                body.push(*id);
                body.extend_from_slice(payload);
                frame(&mut out, 20, &body)
            }
            Self::Unknown { .. } => {}
        }
        out
    }

    fn decode(id: u8, payload: &[u8]) -> Result<Self> {
        let msg = match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have {
                piece: read_u32(payload, 0)?,
            },
            5 => Self::Bitfield {
                bytes: payload.to_vec(),
            },
            6 => Self::Request {
                piece: read_u32(payload, 0)?,
                offset: read_u32(payload, 4)?,
                len: read_u32(payload, 8)?,
            },
            7 => {
                if payload.len() < 8 {
                    return Err(truncated("piece"));
                }
                Self::Piece {
                    piece: read_u32(payload, 0)?,
                    offset: read_u32(payload, 4)?,
                    data: payload[8..].to_vec(),
                }
            }
            8 => Self::Cancel {
                piece: read_u32(payload, 0)?,
                offset: read_u32(payload, 4)?,
                len: read_u32(payload, 8)?,
            },
            0x0e => Self::HaveAll,
            0x0f => Self::HaveNone,
            0x10 => Self::RejectRequest {
                piece: read_u32(payload, 0)?,
                offset: read_u32(payload, 4)?,
                len: read_u32(payload, 8)?,
            },
            20 => {
                if payload.is_empty() {
                    return Err(truncated("extended"));
                }
                Self::Extended {
                    id: payload[0],
                    payload: payload[1..].to_vec(),
                }
            }
            other => Self::Unknown { id: other },
        };
        Ok(msg)
    }
}

fn frame(out: &mut Vec<u8>, id: u8, payload: &[u8]) {
    out.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
    out.push(id);
    out.extend_from_slice(payload);
}

fn triple(a: u32, b: u32, c: u32) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&a.to_be_bytes());
    out[4..8].copy_from_slice(&b.to_be_bytes());
    out[8..12].copy_from_slice(&c.to_be_bytes());
    out
}

fn read_u32(payload: &[u8], at: usize) -> Result<u32> {
    payload
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| truncated("message"))
}

fn truncated(what: &str) -> EngineError {
    EngineError::protocol(
        ProtocolErrorKind::PeerProtocol,
        format!("truncated {} payload", what),
    )
}

/// The extension handshake we send: our ut_metadata id and a client tag.
fn extension_handshake_payload() -> Vec<u8> {
    let mut m = std::collections::BTreeMap::new();
    m.insert(
        METADATA_EXTENSION_NAME.as_bytes().to_vec(),
        Bencode::Int(LOCAL_METADATA_ID as i64),
    );
    let mut dict = std::collections::BTreeMap::new();
    dict.insert(b"m".to_vec(), Bencode::Dict(m));
    dict.insert(
        b"v".to_vec(),
        Bencode::Bytes(format!("swarm-dl {}", env!("CARGO_PKG_VERSION")).into_bytes()),
    );
    Bencode::Dict(dict).encode()
}

/// What a peer's extension handshake tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtensionInfo {
    /// Their message id for ut_metadata, if they support it
    pub ut_metadata_id: Option<u8>,
    /// Advertised metadata size
    pub metadata_size: Option<u64>,
}

fn parse_extension_handshake(payload: &[u8]) -> ExtensionInfo {
    let Ok(dict) = Bencode::decode(payload) else {
        return ExtensionInfo::default();
    };
    let ut_metadata_id = dict
        .get(b"m")
        .and_then(|m| m.get_int(METADATA_EXTENSION_NAME.as_bytes()))
        .and_then(|id| u8::try_from(id).ok())
        .filter(|&id| id != 0);
    let metadata_size = dict
        .get_int(b"metadata_size")
        .and_then(|n| u64::try_from(n).ok());
    ExtensionInfo {
        ut_metadata_id,
        metadata_size,
    }
}

/// An established, handshaken connection.
pub struct PeerConnection {
    stream: TcpStream,
    buffer: BytesMut,
    /// Remote's id from the handshake
    pub peer_id: [u8; 20],
    pub supports_extensions: bool,
    pub supports_fast: bool,
    /// Remote's ut_metadata id, once their extension handshake arrives
    pub ut_metadata_id: Option<u8>,
}

impl PeerConnection {
    /// Dial and complete the BEP 3 handshake, rejecting identity
    /// mismatches.
    pub async fn establish(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        our_peer_id: [u8; 20],
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, format!("connect to {}", addr))
            })?
            .map_err(EngineError::from)?;
        stream.set_nodelay(true).ok();

        let mut conn = Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            peer_id: [0u8; 20],
            supports_extensions: false,
            supports_fast: false,
            ut_metadata_id: None,
        };

        let ours = Handshake::new(info_hash, our_peer_id);
        let theirs = tokio::time::timeout(
            handshake_timeout,
            conn.exchange_handshake(&ours),
        )
        .await
        .map_err(|_| {
            EngineError::network(NetworkErrorKind::Timeout, format!("handshake with {}", addr))
        })??;

        if theirs.info_hash != info_hash {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "peer answered for a different info-hash",
            ));
        }
        conn.peer_id = theirs.peer_id;
        conn.supports_extensions = theirs.supports_extensions();
        conn.supports_fast = theirs.supports_fast();
        Ok(conn)
    }

    async fn exchange_handshake(&mut self, ours: &Handshake) -> Result<Handshake> {
        self.stream.write_all(&ours.encode()).await?;
        let mut raw = [0u8; HANDSHAKE_SIZE];
        self.stream.read_exact(&mut raw).await?;
        Handshake::parse(&raw)
    }

    /// Send one framed message, bounded by the write stall allowance.
    pub async fn send(&mut self, msg: &PeerMessage) -> Result<()> {
        let encoded = msg.encode();
        tokio::time::timeout(WRITE_TIMEOUT, self.stream.write_all(&encoded))
            .await
            .map_err(|_| EngineError::network(NetworkErrorKind::Timeout, "peer write stalled"))?
            .map_err(EngineError::from)
    }

    pub async fn send_extension_handshake(&mut self) -> Result<()> {
        self.send(&PeerMessage::Extended {
            id: 0,
            payload: extension_handshake_payload(),
        })
        .await
    }

    /// Read the next message. Cancel-safe: partial frames stay in the
    /// buffer across calls, so this can sit in a `select!` arm.
    pub async fn recv(&mut self) -> Result<PeerMessage> {
        loop {
            if let Some(msg) = self.try_parse_frame()? {
                return Ok(msg);
            }
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(EngineError::network(
                    NetworkErrorKind::ConnectionReset,
                    "peer closed the connection",
                ));
            }
        }
    }

    fn try_parse_frame(&mut self) -> Result<Option<PeerMessage>> {
        parse_frame(&mut self.buffer)
    }
}

/// Extract one complete frame from the front of `buffer`, if present.
/// The size cap depends on the message id, so the length prefix alone
/// is not enough to condemn a frame.
fn parse_frame(buffer: &mut BytesMut) -> Result<Option<PeerMessage>> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    if len == 0 {
        buffer.advance(4);
        return Ok(Some(PeerMessage::KeepAlive));
    }
    if buffer.len() < 5 {
        return Ok(None);
    }
    let id = buffer[4];
    let cap = match id {
        5 => MAX_BITFIELD_SIZE,
        _ => MAX_MESSAGE_SIZE,
    };
    if len > cap {
        return Err(EngineError::protocol(
            ProtocolErrorKind::PeerProtocol,
            format!("oversized frame ({} bytes, id {})", len, id),
        ));
    }
    if buffer.len() < 4 + len as usize {
        return Ok(None);
    }
    buffer.advance(5);
    let payload = buffer[..len as usize - 1].to_vec();
    buffer.advance(len as usize - 1);
    PeerMessage::decode(id, &payload).map(Some)
}

/// Commands the coordinator sends a peer task.
#[derive(Debug)]
pub enum PeerCommand {
    /// One batched send covering this tick's selections
    RequestBlocks(Vec<BlockRequest>),
    /// Metadata piece indices to request
    RequestMetadata(Vec<u32>),
    KeepAlive,
    Interested,
    Disconnect,
}

/// What happened on a peer's wire, reported inward.
#[derive(Debug)]
pub enum PeerEventKind {
    /// Handshake completed
    Connected { supports_fast: bool },
    /// Their extension handshake arrived with ut_metadata support
    MetadataSupport { metadata_size: Option<u64> },
    Unchoked,
    Choked,
    HaveAll,
    HaveNone,
    /// Raw wire bitfield; parsed once the piece count is known
    BitfieldReceived { bytes: Vec<u8> },
    Have { piece: u32 },
    Block { piece: u32, offset: u32, data: Vec<u8> },
    Rejected { piece: u32, offset: u32 },
    MetadataData { piece: u32, total_size: u64, payload: Vec<u8> },
    MetadataRejected { piece: u32 },
    /// Connect, handshake, or protocol failure
    Failed { reason: String },
    /// Connection over, task exiting
    Disconnected,
}

/// Coordinator-side handle to a running peer task.
pub struct PeerHandle {
    commands: mpsc::Sender<PeerCommand>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    /// Queue a command; a full queue means the task is wedged and will
    /// be timed out by the sweep, so the command is dropped.
    pub fn command(&self, cmd: PeerCommand) {
        if let Err(e) = self.commands.try_send(cmd) {
            trace!("peer command dropped: {}", e);
        }
    }

    /// Hard-stop the task during session teardown.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Timeouts the peer task needs from the session config.
#[derive(Debug, Clone, Copy)]
pub struct PeerTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
}

/// Spawn the task for one remote peer.
pub fn spawn_peer(
    addr: SocketAddr,
    info_hash: Sha1Hash,
    our_peer_id: [u8; 20],
    timeouts: PeerTimeouts,
    events: mpsc::Sender<SwarmEvent>,
) -> PeerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let task = tokio::spawn(run_peer(
        addr,
        info_hash,
        our_peer_id,
        timeouts,
        events,
        cmd_rx,
    ));
    PeerHandle {
        commands: cmd_tx,
        task,
    }
}

async fn run_peer(
    addr: SocketAddr,
    info_hash: Sha1Hash,
    our_peer_id: [u8; 20],
    timeouts: PeerTimeouts,
    events: mpsc::Sender<SwarmEvent>,
    mut commands: mpsc::Receiver<PeerCommand>,
) {
    let emit = |kind: PeerEventKind| {
        let events = events.clone();
        async move {
            let _ = events.send(SwarmEvent::Peer { addr, kind }).await;
        }
    };

    let mut conn = match PeerConnection::establish(
        addr,
        info_hash,
        our_peer_id,
        timeouts.connect,
        timeouts.handshake,
    )
    .await
    {
        Ok(conn) => conn,
        Err(e) => {
            trace!(%addr, error = %e, "peer connect failed");
            emit(PeerEventKind::Failed {
                reason: e.to_string(),
            })
            .await;
            return;
        }
    };

    emit(PeerEventKind::Connected {
        supports_fast: conn.supports_fast,
    })
    .await;

    // Announce our extensions, then declare interest straight away;
    // the unchoke decides when requests can flow
    if conn.supports_extensions {
        if let Err(e) = conn.send_extension_handshake().await {
            emit(PeerEventKind::Failed {
                reason: e.to_string(),
            })
            .await;
            return;
        }
    }
    if let Err(e) = conn.send(&PeerMessage::Interested).await {
        emit(PeerEventKind::Failed {
            reason: e.to_string(),
        })
        .await;
        return;
    }

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                if matches!(cmd, PeerCommand::Disconnect) {
                    break;
                }
                if let Err(e) = handle_command(&mut conn, cmd).await {
                    debug!(%addr, error = %e, "peer write failed");
                    emit(PeerEventKind::Failed { reason: e.to_string() }).await;
                    return;
                }
            }
            msg = conn.recv() => {
                match msg {
                    Ok(msg) => {
                        if let Err(e) = handle_message(&mut conn, msg, &emit).await {
                            debug!(%addr, error = %e, "peer protocol fault");
                            emit(PeerEventKind::Failed { reason: e.to_string() }).await;
                            return;
                        }
                    }
                    Err(e) => {
                        trace!(%addr, error = %e, "peer read ended");
                        break;
                    }
                }
            }
        }
    }

    emit(PeerEventKind::Disconnected).await;
}

async fn handle_command(conn: &mut PeerConnection, cmd: PeerCommand) -> Result<()> {
    match cmd {
        PeerCommand::RequestBlocks(batch) => {
            for req in batch {
                conn.send(&PeerMessage::Request {
                    piece: req.piece,
                    offset: req.offset,
                    len: req.len,
                })
                .await?;
            }
        }
        PeerCommand::RequestMetadata(indices) => {
            let Some(their_id) = conn.ut_metadata_id else {
                return Ok(());
            };
            for piece in indices {
                let payload = MetadataMessage::Request { piece }.encode();
                conn.send(&PeerMessage::Extended {
                    id: their_id,
                    payload,
                })
                .await?;
            }
        }
        PeerCommand::KeepAlive => conn.send(&PeerMessage::KeepAlive).await?,
        PeerCommand::Interested => conn.send(&PeerMessage::Interested).await?,
        PeerCommand::Disconnect => {}
    }
    Ok(())
}

async fn handle_message<F, Fut>(
    conn: &mut PeerConnection,
    msg: PeerMessage,
    emit: &F,
) -> Result<()>
where
    F: Fn(PeerEventKind) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    match msg {
        PeerMessage::Choke => emit(PeerEventKind::Choked).await,
        PeerMessage::Unchoke => emit(PeerEventKind::Unchoked).await,
        PeerMessage::Have { piece } => emit(PeerEventKind::Have { piece }).await,
        PeerMessage::Bitfield { bytes } => {
            emit(PeerEventKind::BitfieldReceived { bytes }).await
        }
        PeerMessage::HaveAll => emit(PeerEventKind::HaveAll).await,
        PeerMessage::HaveNone => emit(PeerEventKind::HaveNone).await,
        PeerMessage::Piece { piece, offset, data } => {
            emit(PeerEventKind::Block { piece, offset, data }).await
        }
        PeerMessage::RejectRequest { piece, offset, .. } => {
            emit(PeerEventKind::Rejected { piece, offset }).await
        }
        PeerMessage::Extended { id: 0, payload } => {
            let info = parse_extension_handshake(&payload);
            conn.ut_metadata_id = info.ut_metadata_id;
            if info.ut_metadata_id.is_some() {
                emit(PeerEventKind::MetadataSupport {
                    metadata_size: info.metadata_size,
                })
                .await;
            }
        }
        PeerMessage::Extended { id: LOCAL_METADATA_ID, payload } => {
            match MetadataMessage::decode(&payload)? {
                MetadataMessage::Data { piece, total_size, payload } => {
                    emit(PeerEventKind::MetadataData { piece, total_size, payload }).await
                }
                MetadataMessage::Reject { piece } => {
                    emit(PeerEventKind::MetadataRejected { piece }).await
                }
                MetadataMessage::Request { piece } => {
                    // We never serve metadata; decline politely
                    if let Some(their_id) = conn.ut_metadata_id {
                        let payload = MetadataMessage::Reject { piece }.encode();
                        conn.send(&PeerMessage::Extended { id: their_id, payload }).await?;
                    }
                }
            }
        }
        PeerMessage::Extended { id, .. } => {
            trace!(id, "extension message for an id we never assigned");
        }
        PeerMessage::Unknown { id } => {
            trace!(id, "ignoring unhandled message type");
        }
        // Upload-side traffic; this engine only downloads
        PeerMessage::Interested
        | PeerMessage::NotInterested
        | PeerMessage::Request { .. }
        | PeerMessage::Cancel { .. }
        | PeerMessage::KeepAlive => {}
    }
    Ok(())
}
