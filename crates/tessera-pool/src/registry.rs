//! Known-set registries: points, peers and their state machines.
//!
//! A *point* is a reachable network address; a *peer* is a cryptographic
//! identity. The same peer may appear at different points over time. Both
//! tables keep a bounded rolling event log per entry and are garbage
//! collected oldest-disconnected-first, never touching trusted entries.
//!
//! All mutation happens through the pool's lock; the methods here are
//! synchronous and never block.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use tessera_identity::PeerId;
use tracing::debug;

use crate::error::{PoolError, PoolResult};
use crate::now_ms;

/// Kinds of events recorded in the rolling logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// An outbound dial was requested.
    DialRequested,
    /// An inbound socket authenticated against this entry.
    IncomingAccepted,
    /// A connection was registered and is running.
    Established,
    /// The connection ended.
    Disconnected,
    /// The entry was learned from a neighbor's advertisement.
    Advertised,
}

/// One entry of a rolling event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    /// Wall-clock milliseconds of the event.
    pub at_ms: u64,
    /// What happened.
    pub kind: EventKind,
}

/// Lifecycle of a network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointState {
    /// An outbound dial is in flight.
    Requested,
    /// An inbound handshake authenticated; registration pending.
    Accepted {
        /// Identity learned during authentication.
        peer: PeerId,
    },
    /// A connection to this point is live.
    Running {
        /// The identity running at this point.
        peer: PeerId,
    },
    /// No connection; `since_ms` orders GC eviction.
    Disconnected {
        /// When the point disconnected (or was first recorded).
        since_ms: u64,
    },
}

impl PointState {
    /// Whether the point has no dial, accept or connection in flight.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, PointState::Disconnected { .. })
    }

    /// Whether a connection to this point is live.
    pub fn is_running(&self) -> bool {
        matches!(self, PointState::Running { .. })
    }
}

/// A known network address.
#[derive(Debug, Clone)]
pub struct PointInfo {
    /// Pinned entries are never evicted and bypass `closed_network` checks.
    pub trusted: bool,
    /// Current lifecycle state.
    pub state: PointState,
    /// Last time any event touched this entry.
    pub last_seen_ms: Option<u64>,
    /// Last identity observed at this address.
    pub last_peer: Option<PeerId>,
    history: VecDeque<LogEntry>,
    history_cap: usize,
}

impl PointInfo {
    fn new(history_cap: usize) -> Self {
        Self {
            trusted: false,
            state: PointState::Disconnected { since_ms: now_ms() },
            last_seen_ms: None,
            last_peer: None,
            history: VecDeque::new(),
            history_cap,
        }
    }

    /// Append to the rolling log, dropping the oldest overflow entry.
    pub(crate) fn log(&mut self, kind: EventKind) {
        let at_ms = now_ms();
        self.last_seen_ms = Some(at_ms);
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(LogEntry { at_ms, kind });
    }

    /// The rolling event log, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &LogEntry> {
        self.history.iter()
    }
}

/// Lifecycle of a cryptographic identity. Absence from the table is the
/// implicit `unknown` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// The peer is connected.
    Running {
        /// The point it is connected at.
        point: SocketAddr,
    },
    /// The peer is not connected.
    Disconnected {
        /// When the peer disconnected (or was first recorded).
        since_ms: u64,
    },
}

impl PeerState {
    /// Whether the peer is connected.
    pub fn is_running(&self) -> bool {
        matches!(self, PeerState::Running { .. })
    }
}

/// A known identity with caller-supplied metadata.
#[derive(Debug, Clone)]
pub struct PeerInfo<Meta> {
    /// Trusted peers are never evicted.
    pub trusted: bool,
    /// Current lifecycle state.
    pub state: PeerState,
    /// Opaque metadata blob, supplied and versioned by the caller.
    pub metadata: Meta,
    /// Last time any event touched this entry.
    pub last_seen_ms: Option<u64>,
    /// Last point this peer was observed at.
    pub last_point: Option<SocketAddr>,
    history: VecDeque<LogEntry>,
    history_cap: usize,
}

impl<Meta> PeerInfo<Meta> {
    fn new(metadata: Meta, history_cap: usize) -> Self {
        Self {
            trusted: false,
            state: PeerState::Disconnected { since_ms: now_ms() },
            metadata,
            last_seen_ms: None,
            last_point: None,
            history: VecDeque::new(),
            history_cap,
        }
    }

    pub(crate) fn log(&mut self, kind: EventKind) {
        let at_ms = now_ms();
        self.last_seen_ms = Some(at_ms);
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(LogEntry { at_ms, kind });
    }

    /// The rolling event log, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &LogEntry> {
        self.history.iter()
    }
}

/// The two known-set tables.
#[derive(Debug)]
pub struct KnownSet<Meta> {
    points: HashMap<SocketAddr, PointInfo>,
    peers: HashMap<PeerId, PeerInfo<Meta>>,
    points_history_cap: usize,
    peers_history_cap: usize,
}

impl<Meta> KnownSet<Meta> {
    pub(crate) fn new(points_history_cap: usize, peers_history_cap: usize) -> Self {
        Self {
            points: HashMap::new(),
            peers: HashMap::new(),
            points_history_cap,
            peers_history_cap,
        }
    }

    /// Look up a point.
    pub fn point(&self, point: &SocketAddr) -> Option<&PointInfo> {
        self.points.get(point)
    }

    /// Look up a peer.
    pub fn peer(&self, peer: &PeerId) -> Option<&PeerInfo<Meta>> {
        self.peers.get(peer)
    }

    /// Iterate over all known points.
    pub fn points(&self) -> impl Iterator<Item = (&SocketAddr, &PointInfo)> {
        self.points.iter()
    }

    /// Iterate over all known peers.
    pub fn peers(&self) -> impl Iterator<Item = (&PeerId, &PeerInfo<Meta>)> {
        self.peers.iter()
    }

    /// Number of known points.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Number of known peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn get_or_create_point(&mut self, point: SocketAddr) -> &mut PointInfo {
        let cap = self.points_history_cap;
        self.points.entry(point).or_insert_with(|| PointInfo::new(cap))
    }

    pub(crate) fn get_or_create_peer(&mut self, peer: PeerId, metadata: Meta) -> &mut PeerInfo<Meta> {
        let cap = self.peers_history_cap;
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerInfo::new(metadata, cap))
    }

    pub(crate) fn point_mut(&mut self, point: &SocketAddr) -> Option<&mut PointInfo> {
        self.points.get_mut(point)
    }

    pub(crate) fn peer_mut(&mut self, peer: &PeerId) -> Option<&mut PeerInfo<Meta>> {
        self.peers.get_mut(peer)
    }

    /// Mark a point trusted, creating it if unknown.
    pub(crate) fn set_point_trusted(&mut self, point: SocketAddr, trusted: bool) {
        if trusted {
            self.get_or_create_point(point).trusted = true;
        } else if let Some(info) = self.points.get_mut(&point) {
            info.trusted = false;
        }
    }

    /// Mark a peer trusted, if known.
    pub(crate) fn set_peer_trusted(&mut self, peer: &PeerId, trusted: bool) {
        if let Some(info) = self.peers.get_mut(peer) {
            info.trusted = trusted;
        }
    }

    // --- point state machine ---

    /// `* -> Requested` on an outbound dial. Fails if the point is not
    /// disconnected.
    pub(crate) fn point_mark_requested(&mut self, point: SocketAddr) -> PoolResult<()> {
        let info = self.get_or_create_point(point);
        match info.state {
            PointState::Disconnected { .. } => {
                info.state = PointState::Requested;
                info.log(EventKind::DialRequested);
                Ok(())
            }
            PointState::Running { .. } => Err(PoolError::Connected),
            PointState::Requested | PointState::Accepted { .. } => Err(PoolError::PendingConnection),
        }
    }

    /// `Disconnected|absent -> Accepted` on inbound authenticate success.
    pub(crate) fn point_mark_accepted(&mut self, point: SocketAddr, peer: PeerId) -> PoolResult<()> {
        let info = self.get_or_create_point(point);
        match info.state {
            PointState::Disconnected { .. } => {
                info.state = PointState::Accepted { peer };
                info.log(EventKind::IncomingAccepted);
                Ok(())
            }
            PointState::Running { .. } => Err(PoolError::Connected),
            PointState::Requested | PointState::Accepted { .. } => Err(PoolError::PendingConnection),
        }
    }

    /// `Requested|Accepted -> Running` on registration.
    pub(crate) fn point_mark_running(&mut self, point: SocketAddr, peer: PeerId) -> PoolResult<()> {
        let info = self.get_or_create_point(point);
        match info.state {
            PointState::Requested | PointState::Accepted { .. } => {
                info.state = PointState::Running { peer };
                info.last_peer = Some(peer);
                info.log(EventKind::Established);
                Ok(())
            }
            PointState::Running { .. } => Err(PoolError::Connected),
            PointState::Disconnected { .. } => Err(PoolError::PendingConnection),
        }
    }

    /// Revert a failed dial. Only touches the point if it is still ours:
    /// a `Running` state set by a winning simultaneous connection stays.
    pub(crate) fn point_abort_dial(&mut self, point: &SocketAddr) {
        if let Some(info) = self.points.get_mut(point) {
            if matches!(info.state, PointState::Requested) {
                info.state = PointState::Disconnected { since_ms: now_ms() };
                info.log(EventKind::Disconnected);
            }
        }
    }

    /// Revert a failed inbound registration.
    pub(crate) fn point_abort_accept(&mut self, point: &SocketAddr, peer: &PeerId) {
        if let Some(info) = self.points.get_mut(point) {
            if matches!(info.state, PointState::Accepted { peer: p } if p == *peer) {
                info.state = PointState::Disconnected { since_ms: now_ms() };
                info.log(EventKind::Disconnected);
            }
        }
    }

    // --- peer state machine ---

    /// Mark a peer running at `point`, creating the entry if unknown.
    ///
    /// Returns `true` if the peer was newly created. A peer already in
    /// `Running` fails with [`PoolError::Connected`].
    pub(crate) fn peer_mark_running(
        &mut self,
        peer: PeerId,
        point: SocketAddr,
        metadata: Meta,
    ) -> PoolResult<bool> {
        let cap = self.peers_history_cap;
        let mut created = false;
        let info = self.peers.entry(peer).or_insert_with(|| {
            created = true;
            PeerInfo::new(metadata, cap)
        });
        if info.state.is_running() {
            return Err(PoolError::Connected);
        }
        info.state = PeerState::Running { point };
        info.last_point = Some(point);
        info.log(EventKind::Established);
        Ok(created)
    }

    /// Tear down both state machines for a closed connection. Only the
    /// states belonging to this `(point, peer)` pair are touched.
    pub(crate) fn finalize_disconnect(&mut self, point: &SocketAddr, peer: &PeerId) {
        let since_ms = now_ms();
        if let Some(info) = self.points.get_mut(point) {
            let ours = match info.state {
                PointState::Running { peer: p } | PointState::Accepted { peer: p } => p == *peer,
                _ => false,
            };
            if ours {
                info.state = PointState::Disconnected { since_ms };
                info.log(EventKind::Disconnected);
            }
        }
        if let Some(info) = self.peers.get_mut(peer) {
            if matches!(info.state, PeerState::Running { point: p } if p == *point) {
                info.state = PeerState::Disconnected { since_ms };
                info.log(EventKind::Disconnected);
            }
        }
    }

    // --- garbage collection ---

    /// Evict disconnected, non-trusted points oldest-first until at most
    /// `lower` evictable entries remain. Triggers only once the table
    /// exceeds `upper`; trusted and non-disconnected entries are skipped.
    pub(crate) fn gc_points(&mut self, upper: usize, lower: usize) -> usize {
        if self.points.len() <= upper {
            return 0;
        }
        let mut candidates: Vec<(SocketAddr, u64)> = self
            .points
            .iter()
            .filter(|(_, info)| !info.trusted)
            .filter_map(|(addr, info)| match info.state {
                PointState::Disconnected { since_ms } => Some((*addr, since_ms)),
                _ => None,
            })
            .collect();
        candidates.sort_by_key(|(_, since_ms)| *since_ms);

        let evict = candidates.len().saturating_sub(lower);
        for (addr, _) in candidates.into_iter().take(evict) {
            self.points.remove(&addr);
        }
        if evict > 0 {
            debug!(evicted = evict, remaining = self.points.len(), "GC evicted points");
        }
        evict
    }

    /// Same policy as [`Self::gc_points`] for the peer table.
    pub(crate) fn gc_peers(&mut self, upper: usize, lower: usize) -> usize {
        if self.peers.len() <= upper {
            return 0;
        }
        let mut candidates: Vec<(PeerId, u64)> = self
            .peers
            .iter()
            .filter(|(_, info)| !info.trusted)
            .filter_map(|(peer, info)| match info.state {
                PeerState::Disconnected { since_ms } => Some((*peer, since_ms)),
                _ => None,
            })
            .collect();
        candidates.sort_by_key(|(_, since_ms)| *since_ms);

        let evict = candidates.len().saturating_sub(lower);
        for (peer, _) in candidates.into_iter().take(evict) {
            self.peers.remove(&peer);
        }
        if evict > 0 {
            debug!(evicted = evict, remaining = self.peers.len(), "GC evicted peers");
        }
        evict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_identity::Keypair;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn test_peer(n: u8) -> PeerId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        PeerId::from_bytes(bytes)
    }

    fn known_set() -> KnownSet<()> {
        KnownSet::new(50, 50)
    }

    #[test]
    fn test_point_dial_lifecycle() {
        let mut set = known_set();
        let addr = test_addr(9732);
        let peer = test_peer(1);

        set.point_mark_requested(addr).unwrap();
        assert!(matches!(set.point(&addr).unwrap().state, PointState::Requested));

        // A second dial while one is in flight is refused.
        assert!(matches!(
            set.point_mark_requested(addr),
            Err(PoolError::PendingConnection)
        ));

        set.point_mark_running(addr, peer).unwrap();
        assert!(set.point(&addr).unwrap().state.is_running());
        assert_eq!(set.point(&addr).unwrap().last_peer, Some(peer));

        // Dialing a running point reports `Connected`.
        assert!(matches!(set.point_mark_requested(addr), Err(PoolError::Connected)));

        set.finalize_disconnect(&addr, &peer);
        assert!(set.point(&addr).unwrap().state.is_disconnected());
    }

    #[test]
    fn test_point_incoming_lifecycle() {
        let mut set = known_set();
        let addr = test_addr(9733);
        let peer = test_peer(2);

        set.point_mark_accepted(addr, peer).unwrap();
        assert!(matches!(
            set.point(&addr).unwrap().state,
            PointState::Accepted { .. }
        ));

        // An accept on a point with an in-flight accept is refused.
        assert!(matches!(
            set.point_mark_accepted(addr, test_peer(3)),
            Err(PoolError::PendingConnection)
        ));

        set.point_mark_running(addr, peer).unwrap();
        assert!(set.point(&addr).unwrap().state.is_running());
    }

    #[test]
    fn test_abort_dial_does_not_clobber_winner() {
        let mut set = known_set();
        let addr = test_addr(9734);
        let winner = test_peer(4);

        // A competing connection won and runs at this point.
        set.point_mark_accepted(addr, winner).unwrap();
        set.point_mark_running(addr, winner).unwrap();

        set.point_abort_dial(&addr);
        assert!(set.point(&addr).unwrap().state.is_running());

        // Finalizing a different peer's connection leaves the winner alone.
        set.finalize_disconnect(&addr, &test_peer(5));
        assert!(set.point(&addr).unwrap().state.is_running());
    }

    #[test]
    fn test_peer_single_running_connection() {
        let mut set = known_set();
        let peer = test_peer(6);

        let created = set.peer_mark_running(peer, test_addr(1000), ()).unwrap();
        assert!(created);

        // A second handshake for a running peer is refused.
        assert!(matches!(
            set.peer_mark_running(peer, test_addr(1001), ()),
            Err(PoolError::Connected)
        ));

        set.finalize_disconnect(&test_addr(1000), &peer);
        assert!(!set.peer(&peer).unwrap().state.is_running());
        assert_eq!(set.peer(&peer).unwrap().last_point, Some(test_addr(1000)));

        let created = set.peer_mark_running(peer, test_addr(1001), ()).unwrap();
        assert!(!created);
    }

    #[test]
    fn test_gc_evicts_oldest_first_and_keeps_trusted() {
        let mut set = known_set();

        // Five disconnected points with timestamps 1..=5.
        for i in 1u16..=5 {
            let addr = test_addr(9000 + i);
            set.get_or_create_point(addr);
            set.point_mut(&addr).unwrap().state = PointState::Disconnected { since_ms: i as u64 };
        }
        // One trusted point, older than all of them.
        let trusted = test_addr(8000);
        set.set_point_trusted(trusted, true);
        set.point_mut(&trusted).unwrap().state = PointState::Disconnected { since_ms: 0 };

        // upper=4, lower=2: exactly the two newest (4, 5) survive, plus
        // the trusted point.
        let evicted = set.gc_points(4, 2);
        assert_eq!(evicted, 3);
        assert_eq!(set.point_count(), 3);
        assert!(set.point(&trusted).is_some());
        assert!(set.point(&test_addr(9004)).is_some());
        assert!(set.point(&test_addr(9005)).is_some());
        assert!(set.point(&test_addr(9001)).is_none());
        assert!(set.point(&test_addr(9002)).is_none());
        assert!(set.point(&test_addr(9003)).is_none());
    }

    #[test]
    fn test_gc_skips_running_points() {
        let mut set = known_set();
        let running = test_addr(9100);
        set.point_mark_requested(running).unwrap();
        set.point_mark_running(running, test_peer(7)).unwrap();

        for i in 1u16..=4 {
            let addr = test_addr(9200 + i);
            set.get_or_create_point(addr);
            set.point_mut(&addr).unwrap().state = PointState::Disconnected { since_ms: i as u64 };
        }

        set.gc_points(3, 1);
        assert!(set.point(&running).is_some());
    }

    #[test]
    fn test_gc_peers_below_upper_is_noop() {
        let mut set = known_set();
        for i in 0..3u8 {
            set.get_or_create_peer(test_peer(i), ());
        }
        assert_eq!(set.gc_peers(4, 2), 0);
        assert_eq!(set.peer_count(), 3);
    }

    #[test]
    fn test_trust_flag_roundtrip() {
        let mut set = known_set();
        let addr = test_addr(9300);

        set.set_point_trusted(addr, true);
        assert!(set.point(&addr).unwrap().trusted);

        set.set_point_trusted(addr, false);
        assert!(!set.point(&addr).unwrap().trusted);
        // The entry itself is neither created twice nor evicted.
        assert_eq!(set.point_count(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut set = KnownSet::<()>::new(3, 3);
        let addr = test_addr(9400);
        set.get_or_create_point(addr);

        for _ in 0..10 {
            set.point_mut(&addr).unwrap().log(EventKind::Advertised);
        }
        assert_eq!(set.point(&addr).unwrap().history().count(), 3);
    }

    #[test]
    fn test_real_peer_ids_work_as_keys() {
        let mut set = known_set();
        let peer = Keypair::generate(0).peer_id();
        set.peer_mark_running(peer, test_addr(9500), ()).unwrap();
        assert!(set.peer(&peer).unwrap().state.is_running());
    }
}
