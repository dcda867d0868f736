//! Scripted BitTorrent peer
//!
//! A listener speaking just enough of the wire protocol to exercise the
//! engine end to end: handshake verification, bitfield or have-all,
//! unchoke, block serving, and the ut_metadata extension. Knobs cover
//! the unhappy paths (peers that never answer requests) without real
//! swarms.

use bitvec::prelude::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// ut_metadata transfer unit (BEP 9).
const METADATA_PIECE_SIZE: usize = 16384;

/// Extension id this peer advertises for ut_metadata. Deliberately not
/// the id the engine assigns on its side, so id confusion shows up as a
/// test failure instead of silently working.
const MOCK_METADATA_ID: u8 = 7;

/// Behavior of one scripted peer.
#[derive(Clone)]
pub struct MockPeerConfig {
    /// Swarm identity to accept connections for
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    /// Pieces advertised in the post-handshake bitfield
    pub pieces: BitVec<u8, Msb0>,
    /// Piece data served on request
    pub piece_data: HashMap<u32, Vec<u8>>,
    /// Unchoke right after the bitfield instead of waiting for interest
    pub auto_unchoke: bool,
    /// Set the BEP 10 bit and answer the extension handshake
    pub support_extensions: bool,
    /// Set the BEP 6 bit and advertise have-all instead of a bitfield
    pub fast_have_all: bool,
    /// Raw info dictionary served over ut_metadata
    pub metadata: Option<Vec<u8>>,
    /// Read block requests but never answer them (the stall case)
    pub ignore_requests: bool,
}

impl MockPeerConfig {
    pub fn new(info_hash: [u8; 20], num_pieces: usize) -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(b"-MK0001-");
        for byte in &mut peer_id[8..] {
            *byte = rand::random();
        }
        Self {
            info_hash,
            peer_id,
            pieces: bitvec![u8, Msb0; 0; num_pieces],
            piece_data: HashMap::new(),
            auto_unchoke: true,
            support_extensions: true,
            fast_have_all: false,
            metadata: None,
            ignore_requests: false,
        }
    }

    /// Advertise and serve every piece in `piece_data`.
    pub fn seeder(info_hash: [u8; 20], piece_data: HashMap<u32, Vec<u8>>) -> Self {
        let num_pieces = piece_data
            .keys()
            .map(|&p| p as usize + 1)
            .max()
            .unwrap_or(0);
        let mut config = Self::new(info_hash, num_pieces);
        for &piece in piece_data.keys() {
            config.pieces.set(piece as usize, true);
        }
        config.piece_data = piece_data;
        config
    }

    /// Add one servable piece.
    pub fn with_piece(mut self, piece: u32, data: Vec<u8>) -> Self {
        self.pieces.set(piece as usize, true);
        self.piece_data.insert(piece, data);
        self
    }

    /// Advertise every piece without holding data for any of them.
    pub fn with_all_pieces_advertised(mut self) -> Self {
        self.pieces.fill(true);
        self
    }

    /// Serve the info dictionary over ut_metadata.
    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_fast_have_all(mut self) -> Self {
        self.fast_have_all = true;
        self
    }

    pub fn ignoring_requests(mut self) -> Self {
        self.ignore_requests = true;
        self
    }
}

/// A scripted peer bound to an ephemeral local port.
pub struct MockPeer {
    config: Arc<MockPeerConfig>,
    listener: TcpListener,
}

impl MockPeer {
    pub async fn bind(config: MockPeerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self {
            config: Arc::new(config),
            listener,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Serve every inbound connection until the task is dropped at the
    /// end of the test. Returns the address to hand to a tracker.
    pub fn spawn(self) -> SocketAddr {
        let addr = self.addr();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = self.listener.accept().await else {
                    break;
                };
                let config = Arc::clone(&self.config);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, config).await;
                });
            }
        });
        addr
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    config: Arc<MockPeerConfig>,
) -> std::io::Result<()> {
    exchange_handshake(&mut stream, &config).await?;

    if config.fast_have_all {
        send_frame(&mut stream, 0x0e, &[]).await?;
    } else {
        send_frame(&mut stream, 5, config.pieces.as_raw_slice()).await?;
    }
    if config.auto_unchoke {
        send_frame(&mut stream, 1, &[]).await?;
    }

    // The engine's ut_metadata id, learned from its extension handshake
    let mut engine_metadata_id: Option<u8> = None;

    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            continue; // keep-alive
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        let id = body[0];
        let payload = &body[1..];

        match id {
            // interested
            2 => {
                if !config.auto_unchoke {
                    send_frame(&mut stream, 1, &[]).await?;
                }
            }
            // request
            6 if payload.len() >= 12 => {
                if config.ignore_requests {
                    continue;
                }
                let piece = be_u32(payload, 0);
                let offset = be_u32(payload, 4) as usize;
                let want = be_u32(payload, 8) as usize;
                let Some(data) = config.piece_data.get(&piece) else {
                    continue;
                };
                if offset + want > data.len() {
                    continue;
                }
                let mut reply = Vec::with_capacity(8 + want);
                reply.extend_from_slice(&piece.to_be_bytes());
                reply.extend_from_slice(&be_u32(payload, 4).to_be_bytes());
                reply.extend_from_slice(&data[offset..offset + want]);
                send_frame(&mut stream, 7, &reply).await?;
            }
            // extended
            20 if !payload.is_empty() => {
                let ext_id = payload[0];
                let ext_payload = &payload[1..];
                if ext_id == 0 {
                    engine_metadata_id = bencoded_int(ext_payload, "ut_metadata")
                        .and_then(|v| u8::try_from(v).ok());
                    send_extension_handshake(&mut stream, &config).await?;
                } else if ext_id == MOCK_METADATA_ID {
                    serve_metadata(&mut stream, &config, engine_metadata_id, ext_payload)
                        .await?;
                }
            }
            // choke our upload slot, cancel, everything else: ignore
            _ => {}
        }
    }
}

async fn exchange_handshake(
    stream: &mut TcpStream,
    config: &MockPeerConfig,
) -> std::io::Result<()> {
    let mut theirs = [0u8; 68];
    stream.read_exact(&mut theirs).await?;
    if theirs[0] != 19 || &theirs[1..20] != PROTOCOL_STRING {
        return Err(bad_data("unknown protocol string"));
    }
    if theirs[28..48] != config.info_hash {
        return Err(bad_data("info hash mismatch"));
    }

    let mut ours = Vec::with_capacity(68);
    ours.push(19);
    ours.extend_from_slice(PROTOCOL_STRING);
    let mut reserved = [0u8; 8];
    if config.support_extensions {
        reserved[5] |= 0x10;
    }
    if config.fast_have_all {
        reserved[7] |= 0x04;
    }
    ours.extend_from_slice(&reserved);
    ours.extend_from_slice(&config.info_hash);
    ours.extend_from_slice(&config.peer_id);
    stream.write_all(&ours).await
}

async fn send_extension_handshake(
    stream: &mut TcpStream,
    config: &MockPeerConfig,
) -> std::io::Result<()> {
    let dict = match &config.metadata {
        Some(metadata) => format!(
            "d1:md11:ut_metadatai{}ee13:metadata_sizei{}ee",
            MOCK_METADATA_ID,
            metadata.len()
        ),
        None => format!("d1:md11:ut_metadatai{}eee", MOCK_METADATA_ID),
    };
    send_extended(stream, 0, dict.as_bytes()).await
}

/// Answer one ut_metadata request: a data message for in-range pieces,
/// a reject for anything past the end.
async fn serve_metadata(
    stream: &mut TcpStream,
    config: &MockPeerConfig,
    engine_metadata_id: Option<u8>,
    payload: &[u8],
) -> std::io::Result<()> {
    let (Some(engine_id), Some(metadata)) = (engine_metadata_id, &config.metadata) else {
        return Ok(());
    };
    if bencoded_int(payload, "msg_type") != Some(0) {
        return Ok(());
    }
    let Some(piece) = bencoded_int(payload, "piece") else {
        return Ok(());
    };

    let start = usize::try_from(piece)
        .ok()
        .map(|p| p * METADATA_PIECE_SIZE);
    let Some(start) = start.filter(|&s| s < metadata.len()) else {
        let reject = format!("d8:msg_typei2e5:piecei{}ee", piece);
        return send_extended(stream, engine_id, reject.as_bytes()).await;
    };
    let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
    let mut reply = format!(
        "d8:msg_typei1e5:piecei{}e10:total_sizei{}ee",
        piece,
        metadata.len()
    )
    .into_bytes();
    reply.extend_from_slice(&metadata[start..end]);
    send_extended(stream, engine_id, &reply).await
}

async fn send_frame(stream: &mut TcpStream, id: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
    frame.push(id);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await
}

async fn send_extended(
    stream: &mut TcpStream,
    ext_id: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut body = Vec::with_capacity(1 + payload.len());
    body.push(ext_id);
    body.extend_from_slice(payload);
    send_frame(stream, 20, &body).await
}

fn be_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

/// Pull one integer value out of a bencoded dictionary without a real
/// decoder: finds `<len>:<key>i<digits>e`.
fn bencoded_int(payload: &[u8], key: &str) -> Option<i64> {
    let needle = format!("{}:{}i", key.len(), key);
    let hay = String::from_utf8_lossy(payload);
    let at = hay.find(&needle)? + needle.len();
    let end = hay[at..].find('e')? + at;
    hay[at..end].parse().ok()
}

fn bad_data(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

pub fn random_info_hash() -> [u8; 20] {
    let mut hash = [0u8; 20];
    for byte in &mut hash {
        *byte = rand::random();
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_peer_binds_ephemeral_port() {
        let config = MockPeerConfig::new(random_info_hash(), 4);
        let peer = MockPeer::bind(config).await.unwrap();
        assert!(peer.addr().port() > 0);
    }

    #[test]
    fn test_bencoded_int_extraction() {
        let payload = b"d8:msg_typei0e5:piecei12ee";
        assert_eq!(bencoded_int(payload, "msg_type"), Some(0));
        assert_eq!(bencoded_int(payload, "piece"), Some(12));
        assert_eq!(bencoded_int(payload, "total_size"), None);
    }

    #[test]
    fn test_seeder_advertises_its_pieces() {
        let mut data = HashMap::new();
        data.insert(0u32, vec![1u8; 16]);
        data.insert(2u32, vec![2u8; 16]);
        let config = MockPeerConfig::seeder([0xaa; 20], data);
        assert_eq!(config.pieces.len(), 3);
        assert!(config.pieces[0]);
        assert!(!config.pieces[1]);
        assert!(config.pieces[2]);
    }
}
