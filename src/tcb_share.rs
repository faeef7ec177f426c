use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::identity::Identity;

/// Cross-connection cache of performance estimates per remote identity (RFC 2140 style).
///
/// A closing connection that saw at least one acked packet folds its final RTT and
///  window size in here; a new connection to the same peer is seeded from the entry
///  instead of starting from cold defaults. Entries expire when unused.
pub struct TcbShare {
    entries: Mutex<FxHashMap<Identity, TcbEntry>>,
    expiry: Duration,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TcbEntry {
    pub rtt: Duration,
    pub rtt_dev: Duration,
    pub window_size: u32,
    updated_at: Instant,
}

impl TcbShare {
    pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(30 * 60);

    pub fn new(expiry: Duration) -> TcbShare {
        TcbShare {
            entries: Mutex::new(FxHashMap::default()),
            expiry,
        }
    }

    /// Fold a closing connection's final estimates into the cache, dampened so one
    ///  outlier connection does not dominate the seed.
    pub fn update(&self, peer: &Identity, rtt: Duration, rtt_dev: Duration, window_size: u32) {
        self.update_at(peer, rtt, rtt_dev, window_size, Instant::now())
    }

    fn update_at(&self, peer: &Identity, rtt: Duration, rtt_dev: Duration, window_size: u32, now: Instant) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(peer.clone())
            .and_modify(|e| {
                e.rtt = (e.rtt * 3 + rtt) / 4;
                e.rtt_dev = (e.rtt_dev * 3 + rtt_dev) / 4;
                e.window_size = (e.window_size * 3 + window_size) / 4;
                e.updated_at = now;
            })
            .or_insert(TcbEntry { rtt, rtt_dev, window_size, updated_at: now });
        trace!("TCB cache for {}: rtt {:?} wdw {}", peer, entry.rtt, entry.window_size);
    }

    /// Seed values for a new connection to `peer`, if a fresh entry exists.
    pub fn seed(&self, peer: &Identity) -> Option<TcbEntry> {
        self.seed_at(peer, Instant::now())
    }

    fn seed_at(&self, peer: &Identity, now: Instant) -> Option<TcbEntry> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(peer) {
            Some(entry) if now.duration_since(entry.updated_at) < self.expiry => Some(*entry),
            Some(_) => {
                entries.remove(peer);
                None
            }
            None => None,
        }
    }
}
