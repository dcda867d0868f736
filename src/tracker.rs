//! Tracker announces over HTTP (BEP 3) and UDP (BEP 15)
//!
//! Announce-only: this engine never seeds, so scrape and upload
//! reporting are absent. Responses are reduced to what the swarm
//! consumes: a clamped reannounce interval, seeder/leecher counts for
//! the log, and resolved socket addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{trace, warn};
use url::Url;

use crate::bencode::Bencode;
use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;

/// Per-request allowance covering DNS, exchange, and body read.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

/// BEP 15 connect magic.
const UDP_PROTOCOL_ID: i64 = 0x0417_2710_1980;

/// Interval clamp bounds. Trackers occasionally return absurd values in
/// both directions.
const MIN_ANNOUNCE_INTERVAL: u32 = 60;
const MAX_ANNOUNCE_INTERVAL: u32 = 3600;

/// Announce event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    fn http_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    fn udp_id(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }
}

/// What we tell the tracker. Uploaded is always reported as zero
/// because this engine only downloads.
#[derive(Debug, Clone)]
pub struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
    /// Port reported to the tracker; nothing listens on it
    pub port: u16,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub num_want: u32,
}

/// What the tracker answered with.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Reannounce interval in seconds, clamped to a sane range
    pub interval: u32,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

/// Client shared across all of a session's announces. The key
/// identifies us to trackers across address changes.
pub struct TrackerClient {
    http: reqwest::Client,
    key: u32,
    timeout: Duration,
}

impl TrackerClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .map_err(EngineError::from)?;
        Ok(Self {
            http,
            key: rand::rng().random(),
            timeout: ANNOUNCE_TIMEOUT,
        })
    }

    #[cfg(test)]
    fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EngineError::from)?;
        Ok(Self {
            http,
            key: rand::rng().random(),
            timeout,
        })
    }

    /// Announce to one tracker URL, dispatching on scheme.
    pub async fn announce(&self, tracker: &str, req: &Announce) -> Result<AnnounceResponse> {
        let url = Url::parse(tracker)?;
        match url.scheme() {
            "http" | "https" => self.announce_http(&url, req).await,
            "udp" => self.announce_udp(&url, req).await,
            other => Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("unsupported tracker scheme '{}'", other),
            )),
        }
    }

    async fn announce_http(&self, url: &Url, req: &Announce) -> Result<AnnounceResponse> {
        let mut target = url.as_str().to_string();
        target.push(if url.query().is_some() { '&' } else { '?' });
        target.push_str("info_hash=");
        target.push_str(&escape_bytes(&req.info_hash));
        target.push_str("&peer_id=");
        target.push_str(&escape_bytes(&req.peer_id));
        target.push_str(&format!(
            "&port={}&uploaded=0&downloaded={}&left={}&compact=1&numwant={}&key={}",
            req.port, req.downloaded, req.left, req.num_want, self.key
        ));
        let event = req.event.http_str();
        if !event.is_empty() {
            target.push_str("&event=");
            target.push_str(event);
        }

        let response = self.http.get(&target).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("tracker answered {}", response.status()),
            ));
        }
        let body = response.bytes().await?;
        parse_http_response(&body)
    }

    async fn announce_udp(&self, url: &Url, req: &Announce) -> Result<AnnounceResponse> {
        let host = url.host_str().ok_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::TrackerError, "udp tracker URL has no host")
        })?;
        let port = url.port().ok_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::TrackerError, "udp tracker URL has no port")
        })?;

        // host_str keeps the brackets around IPv6 literals; the
        // resolver wants them gone
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::DnsResolution,
                    format!("resolve {}: {}", host, e),
                )
            })?
            .next()
            .ok_or_else(|| {
                EngineError::network(
                    NetworkErrorKind::DnsResolution,
                    format!("no addresses for {}", host),
                )
            })?;

        let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await.map_err(socket_err)?;
        socket.connect(addr).await.map_err(socket_err)?;

        let connection_id = self.udp_connect(&socket).await?;
        self.udp_announce(&socket, connection_id, req).await
    }

    async fn udp_connect(&self, socket: &UdpSocket) -> Result<i64> {
        let transaction_id: i32 = rand::rng().random();
        let mut packet = Vec::with_capacity(16);
        packet.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        socket.send(&packet).await.map_err(socket_err)?;

        let mut response = [0u8; 16];
        let len = timeout(self.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "udp tracker connect timed out")
            })?
            .map_err(socket_err)?;
        if len < 16 {
            return Err(tracker_err("short udp connect response"));
        }

        let action = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
        let reply_tid = i32::from_be_bytes([response[4], response[5], response[6], response[7]]);
        if action != 0 {
            return Err(tracker_err(format!("udp connect answered action {}", action)));
        }
        if reply_tid != transaction_id {
            return Err(tracker_err("udp transaction id mismatch"));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&response[8..16]);
        Ok(i64::from_be_bytes(id))
    }

    async fn udp_announce(
        &self,
        socket: &UdpSocket,
        connection_id: i64,
        req: &Announce,
    ) -> Result<AnnounceResponse> {
        let transaction_id: i32 = rand::rng().random();

        // Fixed 98-byte layout per BEP 15
        let mut packet = Vec::with_capacity(98);
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&1u32.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(&req.info_hash);
        packet.extend_from_slice(&req.peer_id);
        packet.extend_from_slice(&req.downloaded.to_be_bytes());
        packet.extend_from_slice(&req.left.to_be_bytes());
        packet.extend_from_slice(&0u64.to_be_bytes()); // uploaded
        packet.extend_from_slice(&req.event.udp_id().to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // IP: tracker uses source
        packet.extend_from_slice(&self.key.to_be_bytes());
        packet.extend_from_slice(&req.num_want.to_be_bytes());
        packet.extend_from_slice(&req.port.to_be_bytes());
        socket.send(&packet).await.map_err(socket_err)?;

        let mut response = [0u8; 4096];
        let len = timeout(self.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| {
                EngineError::network(NetworkErrorKind::Timeout, "udp tracker announce timed out")
            })?
            .map_err(socket_err)?;
        if len < 8 {
            return Err(tracker_err("short udp announce response"));
        }

        let action = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
        let reply_tid = i32::from_be_bytes([response[4], response[5], response[6], response[7]]);
        if action == 3 {
            let message = String::from_utf8_lossy(&response[8..len]);
            return Err(tracker_err(format!("udp tracker refused: {}", message)));
        }
        if action != 1 {
            return Err(tracker_err(format!("udp announce answered action {}", action)));
        }
        if reply_tid != transaction_id {
            return Err(tracker_err("udp transaction id mismatch"));
        }
        if len < 20 {
            return Err(tracker_err("short udp announce response"));
        }

        let interval = u32::from_be_bytes([response[8], response[9], response[10], response[11]])
            .clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL);
        let leechers = u32::from_be_bytes([response[12], response[13], response[14], response[15]]);
        let seeders = u32::from_be_bytes([response[16], response[17], response[18], response[19]]);
        let peers = decode_compact_v4(&response[20..len])?;

        Ok(AnnounceResponse {
            interval,
            seeders: Some(seeders),
            leechers: Some(leechers),
            peers,
        })
    }
}

fn parse_http_response(data: &[u8]) -> Result<AnnounceResponse> {
    let root = Bencode::decode(data)
        .map_err(|_| tracker_err("tracker response is not valid bencode"))?;
    if root.as_dict().is_none() {
        return Err(tracker_err("tracker response is not a dictionary"));
    }

    if let Some(reason) = root.get_str(b"failure reason") {
        return Err(tracker_err(format!("tracker refused: {}", reason)));
    }
    if let Some(warning) = root.get_str(b"warning message") {
        warn!(warning, "tracker warning");
    }

    let interval = root
        .get_int(b"interval")
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| tracker_err("tracker response missing interval"))?
        .clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL);
    let seeders = root
        .get_int(b"complete")
        .and_then(|v| u32::try_from(v).ok());
    let leechers = root
        .get_int(b"incomplete")
        .and_then(|v| u32::try_from(v).ok());

    let mut peers = match root.get(b"peers") {
        None => Vec::new(),
        Some(Bencode::Bytes(compact)) => decode_compact_v4(compact)?,
        Some(Bencode::List(entries)) => decode_peer_dicts(entries),
        Some(_) => return Err(tracker_err("unrecognized peers format")),
    };
    if let Some(Bencode::Bytes(compact)) = root.get(b"peers6") {
        peers.extend(decode_compact_v6(compact)?);
    }

    Ok(AnnounceResponse {
        interval,
        seeders,
        leechers,
        peers,
    })
}

/// Compact IPv4 peers: 4 address bytes + 2 port bytes each.
fn decode_compact_v4(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % 6 != 0 {
        return Err(tracker_err("compact peer list length not a multiple of 6"));
    }
    Ok(data
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::from((ip, port))
        })
        .collect())
}

/// Compact IPv6 peers (BEP 7): 16 address bytes + 2 port bytes each.
fn decode_compact_v6(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % 18 != 0 {
        return Err(tracker_err("compact peers6 length not a multiple of 18"));
    }
    Ok(data
        .chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::from((Ipv6Addr::from(octets), port))
        })
        .collect())
}

/// Dictionary-form peers. Hostname entries are skipped rather than
/// resolved; nobody should be handing out DNS names here.
fn decode_peer_dicts(entries: &[Bencode]) -> Vec<SocketAddr> {
    let mut peers = Vec::new();
    for entry in entries {
        let Some(ip) = entry.get_str(b"ip") else { continue };
        let Some(port) = entry.get_int(b"port").and_then(|p| u16::try_from(p).ok()) else {
            continue;
        };
        match ip.parse::<IpAddr>() {
            Ok(ip) => peers.push(SocketAddr::from((ip, port))),
            Err(_) => trace!(ip, "skipping non-literal peer address"),
        }
    }
    peers
}

/// Percent-encode arbitrary bytes for a query value. Unreserved
/// characters pass through, everything else becomes %XX.
fn escape_bytes(data: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(data.len() * 3);
    for &b in data {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => {
                out.push('%');
                out.push(HEX[(b >> 4) as usize] as char);
                out.push(HEX[(b & 0x0f) as usize] as char);
            }
        }
    }
    out
}

fn tracker_err(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::TrackerError, message)
}

fn socket_err(err: std::io::Error) -> EngineError {
    EngineError::network(NetworkErrorKind::Other, format!("udp socket: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn announce_fixture() -> Announce {
        Announce {
            info_hash: [0xab; 20],
            peer_id: *b"-SD0300-000000000000",
            port: 6881,
            downloaded: 0,
            left: 1000,
            event: AnnounceEvent::Started,
            num_want: 50,
        }
    }

    fn bencoded_response(entries: Vec<(&[u8], Bencode)>) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        for (k, v) in entries {
            dict.insert(k.to_vec(), v);
        }
        Bencode::Dict(dict).encode()
    }

    #[test]
    fn test_event_wire_values() {
        assert_eq!(AnnounceEvent::None.http_str(), "");
        assert_eq!(AnnounceEvent::Started.http_str(), "started");
        assert_eq!(AnnounceEvent::Completed.udp_id(), 1);
        assert_eq!(AnnounceEvent::Started.udp_id(), 2);
        assert_eq!(AnnounceEvent::Stopped.udp_id(), 3);
    }

    #[test]
    fn test_escape_bytes() {
        assert_eq!(escape_bytes(b"abc-123"), "abc-123");
        assert_eq!(escape_bytes(&[0x00, 0xff, b' ']), "%00%FF%20");
    }

    #[test]
    fn test_decode_compact_v4() {
        let data = [127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1a, 0xe2];
        let peers = decode_compact_v4(&data).unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:6882".parse().unwrap(),
            ]
        );
        assert!(decode_compact_v4(&data[..5]).is_err());
    }

    #[test]
    fn test_decode_compact_v6() {
        let mut data = vec![0u8; 16];
        data[15] = 1; // ::1
        data.extend_from_slice(&6881u16.to_be_bytes());
        let peers = decode_compact_v6(&data).unwrap();
        assert_eq!(peers, vec!["[::1]:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_http_response_compact() {
        let body = bencoded_response(vec![
            (b"interval", Bencode::Int(1800)),
            (b"complete", Bencode::Int(4)),
            (b"incomplete", Bencode::Int(9)),
            (
                b"peers",
                Bencode::Bytes(vec![192, 168, 0, 7, 0x1a, 0xe1]),
            ),
        ]);
        let resp = parse_http_response(&body).unwrap();
        assert_eq!(resp.interval, 1800);
        assert_eq!(resp.seeders, Some(4));
        assert_eq!(resp.leechers, Some(9));
        assert_eq!(resp.peers, vec!["192.168.0.7:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_http_response_dict_peers() {
        let mut peer = BTreeMap::new();
        peer.insert(b"ip".to_vec(), Bencode::Bytes(b"10.1.2.3".to_vec()));
        peer.insert(b"port".to_vec(), Bencode::Int(6999));
        let mut named = BTreeMap::new();
        named.insert(b"ip".to_vec(), Bencode::Bytes(b"seed.example.org".to_vec()));
        named.insert(b"port".to_vec(), Bencode::Int(6881));
        let body = bencoded_response(vec![
            (b"interval", Bencode::Int(600)),
            (
                b"peers",
                Bencode::List(vec![Bencode::Dict(peer), Bencode::Dict(named)]),
            ),
        ]);
        let resp = parse_http_response(&body).unwrap();
        // hostname entry is dropped
        assert_eq!(resp.peers, vec!["10.1.2.3:6999".parse().unwrap()]);
    }

    #[test]
    fn test_parse_http_response_failure() {
        let body = bencoded_response(vec![(
            b"failure reason",
            Bencode::Bytes(b"unregistered torrent".to_vec()),
        )]);
        let err = parse_http_response(&body).unwrap_err();
        assert!(err.to_string().contains("unregistered"));
    }

    #[test]
    fn test_interval_clamping() {
        let low = bencoded_response(vec![
            (b"interval", Bencode::Int(1)),
            (b"peers", Bencode::Bytes(Vec::new())),
        ]);
        assert_eq!(parse_http_response(&low).unwrap().interval, 60);

        let high = bencoded_response(vec![
            (b"interval", Bencode::Int(86400)),
            (b"peers", Bencode::Bytes(Vec::new())),
        ]);
        assert_eq!(parse_http_response(&high).unwrap().interval, 3600);
    }

    #[tokio::test]
    async fn test_udp_announce_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 1500];

            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 16);
            assert_eq!(buf[..8], UDP_PROTOCOL_ID.to_be_bytes());
            assert_eq!(buf[8..12], 0u32.to_be_bytes());
            let mut reply = Vec::new();
            reply.extend_from_slice(&0u32.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(&0x0102_0304_0506_0708i64.to_be_bytes());
            server.send_to(&reply, from).await.unwrap();

            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 98);
            assert_eq!(buf[..8], 0x0102_0304_0506_0708i64.to_be_bytes());
            assert_eq!(buf[8..12], 1u32.to_be_bytes());
            assert_eq!(buf[16..36], [0xab; 20]);
            let mut reply = Vec::new();
            reply.extend_from_slice(&1u32.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(&900u32.to_be_bytes());
            reply.extend_from_slice(&3u32.to_be_bytes());
            reply.extend_from_slice(&7u32.to_be_bytes());
            reply.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
            server.send_to(&reply, from).await.unwrap();
        });

        let client = TrackerClient::with_timeout(Duration::from_secs(5)).unwrap();
        let resp = client
            .announce(&format!("udp://{}", tracker_addr), &announce_fixture())
            .await
            .unwrap();
        assert_eq!(resp.interval, 900);
        assert_eq!(resp.seeders, Some(7));
        assert_eq!(resp.leechers, Some(3));
        assert_eq!(resp.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_udp_announce_error_action() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = Vec::new();
            reply.extend_from_slice(&0u32.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(&1i64.to_be_bytes());
            server.send_to(&reply, from).await.unwrap();

            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = Vec::new();
            reply.extend_from_slice(&3u32.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(b"go away");
            server.send_to(&reply, from).await.unwrap();
        });

        let client = TrackerClient::with_timeout(Duration::from_secs(5)).unwrap();
        let err = client
            .announce(&format!("udp://{}", tracker_addr), &announce_fixture())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("go away"));
    }

    #[tokio::test]
    async fn test_rejects_unknown_scheme() {
        let client = TrackerClient::new().unwrap();
        let err = client
            .announce("wss://tracker.example/announce", &announce_fixture())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }
}
