//! Ban table for points and peer ids.
//!
//! Banned points are rejected at admission, banned peers at authentication.
//! Entries carry an expiry and are dropped lazily on lookup.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tessera_identity::PeerId;
use tracing::info;

/// Default ban duration.
const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(3600);

/// Thread-safe table of banned points and peer ids.
#[derive(Debug, Default)]
pub struct BanTable {
    points: DashMap<SocketAddr, Instant>,
    peers: DashMap<PeerId, Instant>,
}

impl BanTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban a point for the default duration.
    pub fn ban_point(&self, point: SocketAddr) {
        self.ban_point_for(point, DEFAULT_BAN_DURATION);
    }

    /// Ban a point until `duration` from now.
    pub fn ban_point_for(&self, point: SocketAddr, duration: Duration) {
        info!(point = %point, "Banning point");
        self.points.insert(point, Instant::now() + duration);
    }

    /// Ban a peer id for the default duration.
    pub fn ban_peer(&self, peer: PeerId) {
        self.ban_peer_for(peer, DEFAULT_BAN_DURATION);
    }

    /// Ban a peer id until `duration` from now.
    pub fn ban_peer_for(&self, peer: PeerId, duration: Duration) {
        info!(peer = %peer, "Banning peer");
        self.peers.insert(peer, Instant::now() + duration);
    }

    /// Check whether a point is banned, dropping the entry if expired.
    pub fn is_point_banned(&self, point: &SocketAddr) -> bool {
        if let Some(until) = self.points.get(point) {
            if Instant::now() < *until {
                return true;
            }
        } else {
            return false;
        }
        self.points.remove(point);
        false
    }

    /// Check whether a peer id is banned, dropping the entry if expired.
    pub fn is_peer_banned(&self, peer: &PeerId) -> bool {
        if let Some(until) = self.peers.get(peer) {
            if Instant::now() < *until {
                return true;
            }
        } else {
            return false;
        }
        self.peers.remove(peer);
        false
    }

    /// Lift a point ban.
    pub fn unban_point(&self, point: &SocketAddr) {
        self.points.remove(point);
    }

    /// Lift a peer ban.
    pub fn unban_peer(&self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    /// Drop every expired entry.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.points.retain(|_, until| now < *until);
        self.peers.retain(|_, until| now < *until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_identity::Keypair;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_ban_and_unban_point() {
        let table = BanTable::new();
        let addr = test_addr(9732);

        assert!(!table.is_point_banned(&addr));
        table.ban_point(addr);
        assert!(table.is_point_banned(&addr));

        table.unban_point(&addr);
        assert!(!table.is_point_banned(&addr));
    }

    #[test]
    fn test_ban_expiry() {
        let table = BanTable::new();
        let addr = test_addr(9733);

        table.ban_point_for(addr, Duration::from_millis(10));
        assert!(table.is_point_banned(&addr));

        std::thread::sleep(Duration::from_millis(20));
        assert!(!table.is_point_banned(&addr));
    }

    #[test]
    fn test_ban_peer() {
        let table = BanTable::new();
        let peer = Keypair::generate(0).peer_id();

        table.ban_peer_for(peer, Duration::from_secs(60));
        assert!(table.is_peer_banned(&peer));

        table.cleanup();
        assert!(table.is_peer_banned(&peer));
    }
}
