//! # swarm-dl
//!
//! A BitTorrent swarm download engine written in Rust.
//!
//! ## Features
//!
//! - **Torrent and magnet starts**: .torrent documents, or magnet links
//!   with in-band metadata exchange (BEP 9)
//! - **HTTP and UDP trackers** plus DHT peer discovery
//! - **Streaming reads**: sequential consumers steer piece selection and
//!   wait only for the pieces they touch
//! - **Resumable**: progress snapshots written next to the part files
//!   survive restarts without re-downloading verified pieces
//! - **Async**: one coordinator task plus one task per peer, on Tokio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use swarm_dl::{Session, SessionConfig, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::new().download_dir("/tmp/downloads");
//!     let session = Session::from_magnet(
//!         "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
//!         config,
//!     )?;
//!
//!     let mut events = session.subscribe();
//!     session.start()?;
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             SessionEvent::MetadataReady { name } => println!("downloading {}", name),
//!             SessionEvent::Stats(stats) => println!("{} bytes", stats.bytes_downloaded),
//!             SessionEvent::Finished(status) => {
//!                 println!("finished: {:?}", status);
//!                 break;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// Modules
pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod dht;
pub mod error;
pub mod magnet;
pub mod metadata;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod session;
pub mod stats;
pub mod storage;
pub mod swarm;
pub mod tracker;

// Re-exports for convenience
pub use config::SessionConfig;
pub use error::{
    EngineError, IntegrityErrorKind, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind,
};
pub use session::{RunState, Session, SessionEvent, SessionSnapshot, TerminalStatus};

// Descriptor and input exports
pub use bitfield::Bitfield;
pub use magnet::MagnetLink;
pub use metainfo::{FileSlice, Sha1Hash, Torrent, TorrentFile};

// Stats exports
pub use stats::{PeerCounts, StatsSnapshot};
