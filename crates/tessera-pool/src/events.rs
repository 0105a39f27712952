//! Pool events: lossy watcher streams and capacity conditions.
//!
//! Watchers get a per-subscriber buffered broadcast stream; a slow
//! subscriber drops its own backlog and sees a `Lagged` marker on resume,
//! leaving other subscribers unaffected. Capacity conditions (`too_few`,
//! `too_many`) and the `new_peer`/`new_connection` edges release all
//! current waiters together on the first matching transition.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tessera_identity::PeerId;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tracing::debug;

/// Default per-subscriber event buffer.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events observable through [`crate::Pool::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// Active connections dropped below the configured minimum.
    TooFewConnections,
    /// Active connections reached the configured maximum.
    TooManyConnections,
    /// A never-seen-before identity completed a handshake.
    NewPeer {
        /// The new identity.
        peer: PeerId,
    },
    /// A connection was registered.
    NewConnection {
        /// Remote identity.
        peer: PeerId,
        /// Remote point.
        point: SocketAddr,
        /// Whether the remote dialed us.
        incoming: bool,
    },
    /// A connection was torn down.
    Disconnection {
        /// Remote identity.
        peer: PeerId,
        /// Remote point.
        point: SocketAddr,
    },
    /// An outbound dial started.
    OutgoingDial {
        /// The dialed point.
        point: SocketAddr,
    },
    /// An inbound socket entered the handshake pipeline.
    IncomingAccept {
        /// The accepting socket's remote address.
        point: SocketAddr,
    },
    /// This subscriber was too slow and missed `missed` events.
    Lagged {
        /// Number of dropped events.
        missed: u64,
    },
}

/// A live, per-subscriber event stream. Dropping the watcher unsubscribes.
pub struct PoolWatcher {
    rx: broadcast::Receiver<PoolEvent>,
}

impl PoolWatcher {
    /// Next event, or `None` once the pool is destroyed.
    pub async fn recv(&mut self) -> Option<PoolEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some(PoolEvent::Lagged { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Stop watching.
    pub fn stop(self) {}
}

/// Shared signalling state of a pool.
#[derive(Debug)]
pub(crate) struct PoolEvents {
    tx: broadcast::Sender<PoolEvent>,
    too_few: Notify,
    too_many: Notify,
    new_peer: Notify,
    new_connection: Notify,
    below_min: AtomicBool,
    at_max: AtomicBool,
}

impl PoolEvents {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            too_few: Notify::new(),
            too_many: Notify::new(),
            new_peer: Notify::new(),
            new_connection: Notify::new(),
            below_min: AtomicBool::new(false),
            at_max: AtomicBool::new(false),
        }
    }

    pub(crate) fn subscribe(&self) -> PoolWatcher {
        PoolWatcher {
            rx: self.tx.subscribe(),
        }
    }

    /// Emit to all watchers and fire the matching edge.
    pub(crate) fn emit(&self, event: PoolEvent) {
        match &event {
            PoolEvent::NewPeer { .. } => self.new_peer.notify_waiters(),
            PoolEvent::NewConnection { .. } => self.new_connection.notify_waiters(),
            _ => {}
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Re-evaluate the capacity conditions after a registration or removal.
    /// Signals fire once per boundary crossing.
    pub(crate) fn update_capacity(&self, active: usize, min: usize, max: usize) {
        let below = active < min;
        if below != self.below_min.swap(below, Ordering::SeqCst) && below {
            debug!(active, min, "Too few connections");
            self.too_few.notify_waiters();
            self.emit(PoolEvent::TooFewConnections);
        }

        let at_max = active >= max;
        if at_max != self.at_max.swap(at_max, Ordering::SeqCst) && at_max {
            debug!(active, max, "Too many connections");
            self.too_many.notify_waiters();
            self.emit(PoolEvent::TooManyConnections);
        }
    }

    pub(crate) async fn wait_too_few(&self) {
        self.too_few.notified().await;
    }

    pub(crate) async fn wait_too_many(&self) {
        self.too_many.notified().await;
    }

    pub(crate) async fn wait_new_peer(&self) {
        self.new_peer.notified().await;
    }

    pub(crate) async fn wait_new_connection(&self) {
        self.new_connection.notified().await;
    }
}
