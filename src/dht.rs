//! Mainline DHT peer discovery (BEP 5)
//!
//! The swarm starts discovery when its candidate queue runs dry and
//! stops it once trackers keep the queue full enough. Lookups use the
//! mainline crate's blocking iterator, so each round runs on the
//! blocking pool and reports fresh addresses through the swarm's event
//! channel. A seen-set keeps rounds from re-delivering the same
//! addresses; the coordinator prunes it on its reannounce cadence so
//! dropped peers become discoverable again.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mainline::{Dht, Id};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metainfo::Sha1Hash;
use crate::swarm::SwarmEvent;

/// Pause between lookup rounds while discovery is running.
const LOOKUP_PAUSE: Duration = Duration::from_secs(10);

/// Start/stoppable discovery for one torrent.
pub struct DhtDiscovery {
    info_hash: Sha1Hash,
    events: mpsc::Sender<SwarmEvent>,
    seen: Arc<Mutex<HashSet<SocketAddr>>>,
    task: Option<JoinHandle<()>>,
}

impl DhtDiscovery {
    pub fn new(info_hash: Sha1Hash, events: mpsc::Sender<SwarmEvent>) -> Self {
        Self {
            info_hash,
            events,
            seen: Arc::new(Mutex::new(HashSet::new())),
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Begin periodic lookups. No-op while already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        info!("starting dht discovery");
        self.task = Some(tokio::spawn(lookup_loop(
            self.info_hash,
            self.events.clone(),
            Arc::clone(&self.seen),
        )));
    }

    /// Stop lookups. A round already on the blocking pool finishes and
    /// is discarded.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            info!("stopping dht discovery");
            task.abort();
        }
    }

    /// Forget which addresses were already delivered, so the next round
    /// can hand them out again.
    pub fn clear_cached_peers(&self) {
        self.seen.lock().clear();
    }
}

impl Drop for DhtDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn lookup_loop(
    info_hash: Sha1Hash,
    events: mpsc::Sender<SwarmEvent>,
    seen: Arc<Mutex<HashSet<SocketAddr>>>,
) {
    let dht = match tokio::task::spawn_blocking(Dht::client).await {
        Ok(Ok(dht)) => Arc::new(dht),
        Ok(Err(e)) => {
            warn!(error = %e, "dht bootstrap failed");
            return;
        }
        Err(e) => {
            warn!(error = %e, "dht bootstrap task failed");
            return;
        }
    };

    loop {
        let lookup = Arc::clone(&dht);
        let found: Vec<SocketAddr> =
            match tokio::task::spawn_blocking(move || {
                let Ok(id) = Id::from_bytes(&info_hash) else {
                    return Vec::new();
                };
                lookup
                    .get_peers(id)
                    .flatten()
                    .map(SocketAddr::V4)
                    .collect()
            })
            .await
            {
                Ok(found) => found,
                Err(e) => {
                    warn!(error = %e, "dht lookup task failed");
                    return;
                }
            };

        let fresh = filter_fresh(&mut seen.lock(), found);
        if !fresh.is_empty() {
            debug!(count = fresh.len(), "dht lookup found peers");
            if events
                .send(SwarmEvent::Discovered {
                    addrs: fresh,
                    source: "dht",
                })
                .await
                .is_err()
            {
                return;
            }
        }
        tokio::time::sleep(LOOKUP_PAUSE).await;
    }
}

/// Keep only addresses not seen before, recording them as seen.
fn filter_fresh(seen: &mut HashSet<SocketAddr>, found: Vec<SocketAddr>) -> Vec<SocketAddr> {
    found.into_iter().filter(|addr| seen.insert(*addr)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_fresh_deduplicates() {
        let mut seen = HashSet::new();
        let a: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:6881".parse().unwrap();

        let fresh = filter_fresh(&mut seen, vec![a, b, a]);
        assert_eq!(fresh, vec![a, b]);

        let again = filter_fresh(&mut seen, vec![a, b]);
        assert!(again.is_empty());

        seen.clear();
        let after_prune = filter_fresh(&mut seen, vec![a]);
        assert_eq!(after_prune, vec![a]);
    }

    #[tokio::test]
    async fn test_lifecycle_without_network() {
        let (tx, _rx) = mpsc::channel(8);
        let mut discovery = DhtDiscovery::new([0x5a; 20], tx);
        assert!(!discovery.is_running());

        // stop before start is a no-op
        discovery.stop();
        assert!(!discovery.is_running());

        discovery.clear_cached_peers();
    }
}
