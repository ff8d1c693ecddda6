//! Tracker-side membership and liveness of peers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Session identifier issued by the tracker
pub type Cookie = u64;

/// Sweep ticks a peer survives without refreshing
pub const DEFAULT_TTL: u32 = 7200;

/// A registered peer as stored by the tracker and sent over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub hostname: String,
    pub port: u16,
    pub cookie: Cookie,

    /// Unix seconds of the last register or refresh
    pub last_active_time: u64,
    pub registration_count: u32,
    pub active: bool,
    pub ttl: u32,
}

impl Peer {
    fn refresh(&mut self, ttl: u32) {
        self.active = true;
        self.ttl = ttl;
        self.last_active_time = unix_time();
    }

    fn leave(&mut self) {
        self.active = false;
        self.ttl = 0;
    }

    /// `hostname:port` of the peer's content server
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Every peer the tracker has seen, active or not
///
/// Records are never removed. Cookies come from a monotonic counter and are never reused.
pub struct PeerRegistry {
    /// Peers keyed by cookie
    peers: DashMap<Cookie, Peer>,

    /// Dedup index from `(hostname, port)` to the cookie issued for it
    addrs: DashMap<(String, u16), Cookie>,

    next_cookie: AtomicU64,

    /// TTL a refresh resets to
    ttl: u32,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        PeerRegistry::new(DEFAULT_TTL)
    }
}

impl PeerRegistry {
    pub fn new(ttl: u32) -> Self {
        PeerRegistry {
            peers: DashMap::new(),
            addrs: DashMap::new(),
            next_cookie: AtomicU64::new(0),
            ttl,
        }
    }

    /// Insert a new peer for `(hostname, port)` or refresh the existing one
    pub fn register(&self, hostname: &str, port: u16) -> Peer {
        // the address entry stays locked until the record is stored, so concurrent registers of
        // one address agree on a single cookie
        let cookie = self
            .addrs
            .entry((hostname.to_owned(), port))
            .or_insert_with(|| self.next_cookie.fetch_add(1, Ordering::SeqCst));

        let mut peer = self.peers.entry(*cookie).or_insert_with(|| Peer {
            hostname: hostname.to_owned(),
            port,
            cookie: *cookie,
            last_active_time: 0,
            registration_count: 0,
            active: false,
            ttl: 0,
        });
        peer.refresh(self.ttl);
        peer.registration_count += 1;
        peer.clone()
    }

    /// Refresh an active peer, returning the updated record
    ///
    /// Unknown and inactive cookies are not refreshed.
    pub fn keep_alive(&self, cookie: Cookie) -> Option<Peer> {
        let mut peer = self.peers.get_mut(&cookie)?;
        if !peer.active {
            return None;
        }
        peer.refresh(self.ttl);
        Some(peer.clone())
    }

    /// Deactivate a peer; its record stays addressable by cookie
    pub fn leave(&self, cookie: Cookie) -> Option<Peer> {
        let mut peer = self.peers.get_mut(&cookie)?;
        peer.leave();
        Some(peer.clone())
    }

    /// Refresh `cookie` and list every other active peer, ordered by cookie
    pub fn query(&self, cookie: Cookie) -> Option<Vec<Peer>> {
        self.keep_alive(cookie)?;
        let mut peers: Vec<_> = self
            .peers
            .iter()
            .filter(|p| p.active && p.cookie != cookie)
            .map(|p| p.value().clone())
            .collect();
        peers.sort_by_key(|p| p.cookie);
        Some(peers)
    }

    pub fn get(&self, cookie: Cookie) -> Option<Peer> {
        self.peers.get(&cookie).map(|p| p.value().clone())
    }

    /// Age every active peer by one tick
    ///
    /// A peer whose TTL reaches zero goes inactive on the same pass.
    pub fn sweep(&self) {
        for mut peer in self.peers.iter_mut() {
            if !peer.active {
                continue;
            }
            peer.ttl = peer.ttl.saturating_sub(1);
            if peer.ttl == 0 {
                tracing::info!(cookie = peer.cookie, peer = %peer.endpoint(), "peer timed out");
                peer.active = false;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Run [PeerRegistry::sweep] every `interval` until the returned task is aborted
pub fn spawn_sweeper(registry: &Arc<PeerRegistry>, interval: Duration) -> JoinHandle<()> {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.sweep();
        }
    })
}

pub(crate) fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reregister_keeps_cookie() {
        let registry = PeerRegistry::new(5);
        let first = registry.register("alpha", 1234);
        registry.leave(first.cookie);

        let again = registry.register("alpha", 1234);
        assert_eq!(again.cookie, first.cookie);
        assert_eq!(again.registration_count, 2);
        assert!(again.active);
        assert_eq!(again.ttl, 5);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_addresses_get_increasing_cookies() {
        let registry = PeerRegistry::new(5);
        let a = registry.register("alpha", 1234);
        let b = registry.register("alpha", 1235);
        let c = registry.register("beta", 1234);
        assert_eq!([a.cookie, b.cookie, c.cookie], [0, 1, 2]);
    }

    #[test]
    fn concurrent_registration_never_duplicates() {
        let registry = Arc::new(PeerRegistry::new(5));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|i| registry.register("host", 1000 + (i * 8 + t) % 100).cookie)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(registry.len(), 100);
        let ports: std::collections::HashSet<_> =
            (0..100).filter_map(|c| registry.get(c)).map(|p| p.port).collect();
        assert_eq!(ports.len(), 100);
    }

    #[test]
    fn query_excludes_caller_and_inactive() {
        let registry = PeerRegistry::new(5);
        let a = registry.register("alpha", 1);
        let b = registry.register("beta", 2);
        let c = registry.register("gamma", 3);

        let seen: Vec<_> = registry.query(a.cookie).unwrap().iter().map(|p| p.cookie).collect();
        assert_eq!(seen, [b.cookie, c.cookie]);

        registry.leave(c.cookie);
        let seen: Vec<_> = registry.query(a.cookie).unwrap().iter().map(|p| p.cookie).collect();
        assert_eq!(seen, [b.cookie]);

        assert!(registry.query(99).is_none());
        assert!(registry.query(c.cookie).is_none());
    }

    #[test]
    fn sweep_expires_after_ttl_ticks() {
        let registry = PeerRegistry::new(3);
        let a = registry.register("alpha", 1);

        registry.sweep();
        registry.sweep();
        assert!(registry.get(a.cookie).unwrap().active);
        registry.sweep();

        let expired = registry.get(a.cookie).unwrap();
        assert!(!expired.active);
        assert_eq!(expired.ttl, 0);

        // further sweeps leave it alone
        registry.sweep();
        assert_eq!(registry.get(a.cookie).unwrap().ttl, 0);

        // only register brings it back
        assert!(registry.keep_alive(a.cookie).is_none());
        assert!(registry.query(a.cookie).is_none());
        assert!(registry.register("alpha", 1).active);
    }

    #[test]
    fn keep_alive_resets_ttl() {
        let registry = PeerRegistry::new(3);
        let a = registry.register("alpha", 1);
        registry.sweep();
        registry.sweep();
        let refreshed = registry.keep_alive(a.cookie).unwrap();
        assert_eq!(refreshed.ttl, 3);
        registry.sweep();
        registry.sweep();
        assert!(registry.get(a.cookie).unwrap().active);
    }

    #[test]
    fn peer_record_round_trips() {
        let registry = PeerRegistry::new(3);
        let a = registry.register("alpha", 1);
        let body = crate::record::encode(&a).unwrap();
        assert_eq!(crate::record::decode::<Peer>(&body).unwrap(), a);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_ticks_on_interval() {
        let registry = Arc::new(PeerRegistry::new(2));
        let a = registry.register("alpha", 1);
        let sweeper = spawn_sweeper(&registry, Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(registry.get(a.cookie).unwrap().ttl, 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!registry.get(a.cookie).unwrap().active);

        sweeper.abort();
    }
}
