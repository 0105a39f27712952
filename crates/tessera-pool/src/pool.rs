//! Pool orchestrator.
//!
//! The pool is the single authority over peer connections: it admits,
//! dials, accepts, registers and tears down connections, drives the
//! known-set garbage collection, and signals capacity and lifecycle events
//! to watchers. Registry and state-machine mutation happens only inside
//! this module's lock, held across synchronous sections alone.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tessera_identity::PeerId;

use crate::ban::BanTable;
use crate::config::{MetadataConfig, PoolConfig};
use crate::connection::{Connection, ConnectionInfo};
use crate::error::{PoolError, PoolResult};
use crate::events::{PoolEvent, PoolEvents, PoolWatcher};
use crate::handshake::{establish_incoming, establish_outgoing};
use crate::message::{ControlMessage, MessageConfig, MAX_ADVERTISED_POINTS};
use crate::persist;
use crate::registry::{EventKind, KnownSet, PeerInfo, PointInfo};
use crate::scheduler::{IoScheduler, PoolStat};
use crate::Metadata;

/// Points carried in a Bootstrap reply.
const ADVERTISE_SAMPLE_SIZE: usize = 30;

/// Callback invoked after each successful registration.
pub type NewConnectionCallback = Box<dyn Fn(&ConnectionInfo) + Send + Sync>;

pub(crate) struct PoolState<M, Meta> {
    pub(crate) known: KnownSet<Meta>,
    pub(crate) connections: HashMap<PeerId, Arc<Connection<M>>>,
}

/// Shared pool internals; the public [`Pool`] is a cheap handle to this.
pub(crate) struct PoolInner<M, Meta> {
    pub(crate) config: PoolConfig,
    pub(crate) msg_config: Arc<MessageConfig<M>>,
    pub(crate) meta_config: MetadataConfig<Meta>,
    pub(crate) state: RwLock<PoolState<M, Meta>>,
    pub(crate) half_open_incoming: AtomicUsize,
    pub(crate) scheduler: Arc<IoScheduler>,
    pub(crate) events: PoolEvents,
    pub(crate) bans: BanTable,
    pub(crate) on_new_connection: RwLock<Option<NewConnectionCallback>>,
    pub(crate) closing: AtomicBool,
    pub(crate) last_swap_ms: AtomicU64,
}

impl<M, Meta> PoolInner<M, Meta>
where
    M: Send + 'static,
    Meta: Metadata,
{
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn active_connections(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Whether a point is trusted by configuration or registry flag.
    pub(crate) fn is_trusted_point(&self, point: &SocketAddr) -> bool {
        self.config.is_trusted(point)
            || self
                .state
                .read()
                .known
                .point(point)
                .map(|info| info.trusted)
                .unwrap_or(false)
    }

    /// Phase 1 of the outbound pipeline: slot acquisition.
    pub(crate) fn check_outgoing_admission(&self, point: &SocketAddr) -> PoolResult<()> {
        if self.is_closing() {
            return Err(PoolError::ConnectionClosed);
        }
        if self.config.closed_network && !self.is_trusted_point(point) {
            return Err(PoolError::Rejected("closed network".to_string()));
        }
        if self.bans.is_point_banned(point) {
            return Err(PoolError::Rejected("point is banned".to_string()));
        }
        if self.active_connections() >= self.config.max_connections {
            return Err(PoolError::TooManyConnections);
        }
        Ok(())
    }

    /// Run the outbound pipeline under a deadline. On expiry the point
    /// reverts to `Disconnected`.
    pub(crate) async fn connect_inner(
        self: &Arc<Self>,
        point: SocketAddr,
        budget: Duration,
    ) -> PoolResult<Arc<Connection<M>>> {
        match timeout(budget, establish_outgoing(self, point)).await {
            Ok(result) => result,
            Err(_) => {
                self.state.write().known.point_abort_dial(&point);
                Err(PoolError::ConnectionTimeout)
            }
        }
    }

    /// Tear down registry state for a closed connection and re-signal
    /// capacity. Called exactly once per connection, by its worker.
    pub(crate) fn finalize_connection(&self, conn: &Arc<Connection<M>>) {
        let info = conn.info();
        let active = {
            let mut state = self.state.write();
            let registered = state
                .connections
                .get(&info.peer_id)
                .map(|existing| Arc::ptr_eq(existing, conn))
                .unwrap_or(false);
            if registered {
                state.connections.remove(&info.peer_id);
            }
            state.known.finalize_disconnect(&info.point, &info.peer_id);
            state.connections.len()
        };
        self.events.emit(PoolEvent::Disconnection {
            peer: info.peer_id,
            point: info.point,
        });
        self.events
            .update_capacity(active, self.config.min_connections, self.config.max_connections);
        self.run_gc();
    }

    /// Dispatch a control message received on `conn`.
    pub(crate) async fn handle_control(
        self: &Arc<Self>,
        conn: &Arc<Connection<M>>,
        msg: ControlMessage,
    ) {
        match msg {
            // The worker turns Disconnect into a close before dispatching.
            ControlMessage::Disconnect => {}
            ControlMessage::Bootstrap => {
                let sample = self.advertise_sample();
                debug!(peer = %conn.info().peer_id, count = sample.len(), "Replying to bootstrap");
                if conn
                    .send_control(&ControlMessage::Advertise(sample))
                    .await
                    .is_err()
                {
                    debug!(peer = %conn.info().peer_id, "Bootstrap reply failed");
                }
            }
            ControlMessage::Advertise(points) => self.register_advertised(&points),
            ControlMessage::SwapRequest { point, peer } => {
                self.handle_swap_request(conn, point, peer).await
            }
            ControlMessage::SwapAck { point, peer } => self.handle_swap_ack(conn, point, peer),
        }
    }

    fn advertise_sample(&self) -> Vec<SocketAddr> {
        let mut sample: Vec<SocketAddr> = {
            let state = self.state.read();
            state
                .known
                .points()
                .filter(|(addr, _)| !self.bans.is_point_banned(addr))
                .map(|(addr, _)| *addr)
                .collect()
        };
        sample.shuffle(&mut rand::thread_rng());
        sample.truncate(ADVERTISE_SAMPLE_SIZE.min(MAX_ADVERTISED_POINTS));
        sample
    }

    /// Merge advertised points into the known-set. Never auto-connects.
    fn register_advertised(&self, points: &[SocketAddr]) {
        {
            let mut state = self.state.write();
            for point in points {
                if self.bans.is_point_banned(point) {
                    continue;
                }
                state.known.get_or_create_point(*point).log(EventKind::Advertised);
            }
        }
        self.run_gc();
    }

    /// GC both tables against their configured thresholds.
    pub(crate) fn run_gc(&self) {
        let mut state = self.state.write();
        if let Some((upper, lower)) = self.config.max_known_points {
            state.known.gc_points(upper, lower);
        }
        if let Some((upper, lower)) = self.config.max_known_peer_ids {
            state.known.gc_peers(upper, lower);
        }
    }

    /// Write the known-set to disk; failures are logged and swallowed.
    pub(crate) fn persist_now(&self) {
        let Some(path) = &self.config.peers_file else {
            return;
        };
        let state = self.state.read();
        if let Err(err) = persist::save(path, &state.known) {
            warn!(path = %path.display(), error = %err, "Failed to persist known-set");
        }
    }
}

/// The connection pool handle.
///
/// Generic over the application message type `M` (see
/// [`MessageConfig`]) and the peer metadata type `Meta` (see
/// [`MetadataConfig`]). Clones share one pool.
pub struct Pool<M, Meta> {
    inner: Arc<PoolInner<M, Meta>>,
}

impl<M, Meta> Clone for Pool<M, Meta> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M, Meta> Pool<M, Meta>
where
    M: Send + 'static,
    Meta: Metadata,
{
    /// Create a pool: load the persisted known-set (errors are logged and
    /// swallowed), pin configured trusted points, and return the handle.
    pub fn create(
        config: PoolConfig,
        meta_config: MetadataConfig<Meta>,
        msg_config: MessageConfig<M>,
        scheduler: Arc<IoScheduler>,
    ) -> Self {
        let mut known = KnownSet::new(
            config.known_points_history_size,
            config.known_peer_ids_history_size,
        );

        if let Some(path) = &config.peers_file {
            match persist::load::<Meta>(path) {
                Ok((points, peers)) => {
                    info!(
                        path = %path.display(),
                        points = points.len(),
                        peers = peers.len(),
                        "Loaded known-set"
                    );
                    persist::install(&mut known, points, peers);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Failed to load known-set");
                }
            }
        }
        for point in &config.trusted_points {
            known.set_point_trusted(*point, true);
        }

        Self {
            inner: Arc::new(PoolInner {
                config,
                msg_config: Arc::new(msg_config),
                meta_config,
                state: RwLock::new(PoolState {
                    known,
                    connections: HashMap::new(),
                }),
                half_open_incoming: AtomicUsize::new(0),
                scheduler,
                events: PoolEvents::new(),
                bans: BanTable::new(),
                on_new_connection: RwLock::new(None),
                closing: AtomicBool::new(false),
                last_swap_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Shut the pool down: cancel pending handshakes, disconnect every
    /// connection waiting for each worker to exit, persist the known-set.
    /// Always completes.
    pub async fn destroy(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        info!("Destroying pool");

        let connections: Vec<Arc<Connection<M>>> = self
            .inner
            .state
            .read()
            .connections
            .values()
            .cloned()
            .collect();
        for conn in connections {
            conn.disconnect(true).await;
        }
        self.inner.persist_now();
    }

    /// Dial `point` under the configured `connection_timeout`.
    pub async fn connect(&self, point: SocketAddr) -> PoolResult<Arc<Connection<M>>> {
        self.inner
            .connect_inner(point, self.inner.config.connection_timeout)
            .await
    }

    /// Dial `point` under an explicit deadline.
    pub async fn connect_with_timeout(
        &self,
        point: SocketAddr,
        budget: Duration,
    ) -> PoolResult<Arc<Connection<M>>> {
        self.inner.connect_inner(point, budget).await
    }

    /// Enqueue an accepted socket into the inbound pipeline. Never blocks:
    /// over-capacity sockets are dropped on the spot.
    pub fn accept(&self, stream: TcpStream, remote_addr: SocketAddr) {
        let inner = &self.inner;
        if inner.is_closing() {
            return;
        }
        if inner.config.closed_network
            && !inner
                .config
                .trusted_points
                .iter()
                .any(|p| p.ip() == remote_addr.ip())
        {
            info!(addr = %remote_addr, "Rejecting incoming connection, closed network");
            return;
        }
        if inner.active_connections() >= inner.config.max_connections {
            warn!(addr = %remote_addr, "Too many connections, rejecting incoming socket");
            return;
        }
        let half_open = inner.half_open_incoming.fetch_add(1, Ordering::SeqCst);
        if half_open >= inner.config.max_incoming_connections {
            inner.half_open_incoming.fetch_sub(1, Ordering::SeqCst);
            warn!(addr = %remote_addr, "Too many half-open connections, rejecting incoming socket");
            return;
        }

        inner.events.emit(PoolEvent::IncomingAccept { point: remote_addr });
        let pool = inner.clone();
        tokio::spawn(async move {
            establish_incoming(pool.clone(), stream, remote_addr).await;
            pool.half_open_incoming.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Number of registered connections.
    pub fn active_connections(&self) -> usize {
        self.inner.active_connections()
    }

    /// Summed I/O counters across all connections.
    pub fn pool_stat(&self) -> PoolStat {
        self.inner.scheduler.stat()
    }

    /// The live connection to `peer`, if any.
    pub fn connection(&self, peer: &PeerId) -> Option<Arc<Connection<M>>> {
        self.inner.state.read().connections.get(peer).cloned()
    }

    /// All live connections.
    pub fn connections(&self) -> Vec<Arc<Connection<M>>> {
        self.inner.state.read().connections.values().cloned().collect()
    }

    /// Queue `msg` on every live connection, skipping full queues.
    pub async fn broadcast(&self, msg: &M) {
        let connections = self.connections();
        for conn in connections {
            if let Err(err) = conn.write(msg).await {
                debug!(peer = %conn.info().peer_id, error = %err, "Broadcast write failed");
            }
        }
    }

    /// Propose a swap to a random running connection.
    pub async fn send_swap_request(&self) {
        self.inner.send_swap_request().await;
    }

    /// Install the single new-connection callback.
    pub fn on_new_connection(&self, callback: NewConnectionCallback) {
        *self.inner.on_new_connection.write() = Some(callback);
    }

    /// Subscribe to the pool event stream.
    pub fn watch(&self) -> PoolWatcher {
        self.inner.events.subscribe()
    }

    /// Resolve on the first drop below `min_connections` after this call.
    pub async fn wait_too_few(&self) {
        self.inner.events.wait_too_few().await;
    }

    /// Resolve on the first rise to `max_connections` after this call.
    pub async fn wait_too_many(&self) {
        self.inner.events.wait_too_many().await;
    }

    /// Resolve on the next never-seen-before peer.
    pub async fn wait_new_peer(&self) {
        self.inner.events.wait_new_peer().await;
    }

    /// Resolve on the next registered connection.
    pub async fn wait_new_connection(&self) {
        self.inner.events.wait_new_connection().await;
    }

    /// Snapshot of the known points table.
    pub fn known_points(&self) -> Vec<(SocketAddr, PointInfo)> {
        self.inner
            .state
            .read()
            .known
            .points()
            .map(|(addr, info)| (*addr, info.clone()))
            .collect()
    }

    /// Snapshot of the known peers table.
    pub fn known_peers(&self) -> Vec<(PeerId, PeerInfo<Meta>)> {
        self.inner
            .state
            .read()
            .known
            .peers()
            .map(|(peer, info)| (*peer, info.clone()))
            .collect()
    }

    /// Pin a point; trusted points are never evicted.
    pub fn set_point_trusted(&self, point: SocketAddr) {
        self.inner.state.write().known.set_point_trusted(point, true);
    }

    /// Unpin a point.
    pub fn unset_point_trusted(&self, point: SocketAddr) {
        self.inner.state.write().known.set_point_trusted(point, false);
    }

    /// Pin a peer id.
    pub fn set_peer_trusted(&self, peer: &PeerId) {
        self.inner.state.write().known.set_peer_trusted(peer, true);
    }

    /// Unpin a peer id.
    pub fn unset_peer_trusted(&self, peer: &PeerId) {
        self.inner.state.write().known.set_peer_trusted(peer, false);
    }

    /// Metadata blob of a known peer.
    pub fn peer_metadata(&self, peer: &PeerId) -> Option<Meta> {
        self.inner
            .state
            .read()
            .known
            .peer(peer)
            .map(|info| info.metadata.clone())
    }

    /// Replace a known peer's metadata blob.
    pub fn set_peer_metadata(&self, peer: &PeerId, metadata: Meta) -> bool {
        match self.inner.state.write().known.peer_mut(peer) {
            Some(info) => {
                info.metadata = metadata;
                true
            }
            None => false,
        }
    }

    /// Score of a known peer, derived from its metadata.
    pub fn peer_score(&self, peer: &PeerId) -> Option<f64> {
        self.inner
            .state
            .read()
            .known
            .peer(peer)
            .map(|info| self.inner.meta_config.score_meta(&info.metadata))
    }

    /// Ban a point; future admissions from it are `Rejected`.
    pub fn ban_point(&self, point: SocketAddr) {
        self.inner.bans.ban_point(point);
    }

    /// Ban a peer id; future authentications by it are `Rejected`.
    pub fn ban_peer(&self, peer: PeerId) {
        self.inner.bans.ban_peer(peer);
    }

    /// Lift a point ban.
    pub fn unban_point(&self, point: &SocketAddr) {
        self.inner.bans.unban_point(point);
    }

    /// Lift a peer ban.
    pub fn unban_peer(&self, peer: &PeerId) {
        self.inner.bans.unban_peer(peer);
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<PoolInner<M, Meta>> {
        &self.inner
    }
}
