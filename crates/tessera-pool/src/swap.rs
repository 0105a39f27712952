//! Swap engine: cooperative topology refresh.
//!
//! A node proposes that a neighbor replace one of its connections with a
//! fresher peer. The receiving side connects to the proposed point and, if
//! it can spare a connection, drops its least-recently-active non-trusted
//! one, acknowledging with the victim's coordinates. Swaps are rate-limited
//! by `swap_linger` on both the per-connection and the pool-wide clock.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, info};

use tessera_identity::PeerId;

use crate::connection::Connection;
use crate::message::ControlMessage;
use crate::now_ms;
use crate::pool::PoolInner;
use crate::Metadata;

impl<M, Meta> PoolInner<M, Meta>
where
    M: Send + 'static,
    Meta: Metadata,
{
    /// Propose a swap to a random running connection.
    ///
    /// The candidate is drawn from the known-set, preferring peers that are
    /// not currently connected; with none available, another running
    /// neighbor is proposed instead.
    pub(crate) async fn send_swap_request(self: &Arc<Self>) {
        let Some((target, point, peer)) = self.pick_swap_proposal() else {
            debug!("No swap proposal available");
            return;
        };
        self.swap_request_to(&target, point, peer).await;
    }

    /// Send one specific swap proposal over `target`.
    pub(crate) async fn swap_request_to(
        self: &Arc<Self>,
        target: &Arc<Connection<M>>,
        point: SocketAddr,
        peer: PeerId,
    ) {
        let now = now_ms();
        let linger = self.config.swap_linger.as_millis() as u64;
        let last = target.last_swap_ms.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < linger {
            debug!(peer = %target.info().peer_id, "Swap request suppressed by linger");
            return;
        }
        target.last_swap_ms.store(now, Ordering::Relaxed);

        debug!(
            to = %target.info().peer_id,
            point = %point,
            peer = %peer,
            "Sending swap request"
        );
        let _ = target
            .send_control(&ControlMessage::SwapRequest { point, peer })
            .await;
    }

    fn pick_swap_proposal(&self) -> Option<(Arc<Connection<M>>, SocketAddr, PeerId)> {
        let state = self.state.read();
        let connections: Vec<Arc<Connection<M>>> = state.connections.values().cloned().collect();
        let mut rng = rand::thread_rng();
        let target = connections.choose(&mut rng)?.clone();
        let target_peer = target.info().peer_id;

        // Fresh candidates first: known peers with a point and no
        // connection anywhere.
        let fresh: Vec<(SocketAddr, PeerId)> = state
            .known
            .peers()
            .filter(|(id, info)| {
                **id != target_peer
                    && **id != self.config.identity.peer_id()
                    && !info.state.is_running()
                    && !self.bans.is_peer_banned(id)
            })
            .filter_map(|(id, info)| info.last_point.map(|point| (point, *id)))
            .collect();
        if let Some(&(point, peer)) = fresh.choose(&mut rng) {
            return Some((target, point, peer));
        }

        // Fall back to proposing another running neighbor.
        let neighbors: Vec<(SocketAddr, PeerId)> = connections
            .iter()
            .filter(|c| c.info().peer_id != target_peer)
            .map(|c| (c.info().point, c.info().peer_id))
            .collect();
        let &(point, peer) = neighbors.choose(&mut rng)?;
        Some((target, point, peer))
    }

    /// Handle a `Swap_request` received on `conn`.
    pub(crate) async fn handle_swap_request(
        self: &Arc<Self>,
        conn: &Arc<Connection<M>>,
        point: SocketAddr,
        peer: PeerId,
    ) {
        let now = now_ms();
        let linger = self.config.swap_linger.as_millis() as u64;
        let last = self.last_swap_ms.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < linger {
            debug!(from = %conn.info().peer_id, "Ignoring swap request within linger window");
            return;
        }
        if peer == self.config.identity.peer_id() {
            return;
        }
        if self.state.read().connections.contains_key(&peer) {
            debug!(peer = %peer, "Ignoring swap request for an already connected peer");
            return;
        }
        self.last_swap_ms.store(now, Ordering::Relaxed);

        let new_conn = match self.connect_inner(point, self.config.connection_timeout).await {
            Ok(conn) => conn,
            Err(err) => {
                debug!(point = %point, error = %err, "Swap connect failed");
                return;
            }
        };

        // Only trade a connection away if one can be spared.
        if self.active_connections() <= self.config.min_connections {
            debug!("Swap kept both connections, none to spare");
            return;
        }
        let Some(victim) = self.pick_swap_victim(&new_conn.info().peer_id) else {
            debug!("No swap victim available");
            return;
        };
        let victim_point = victim.info().point;
        let victim_peer = victim.info().peer_id;

        info!(
            new_peer = %new_conn.info().peer_id,
            victim = %victim_peer,
            "Swapping connections"
        );
        // Acknowledge on the requesting connection before the victim (which
        // may be that very connection) goes away.
        let _ = conn
            .send_control(&ControlMessage::SwapAck {
                point: victim_point,
                peer: victim_peer,
            })
            .await;
        victim.disconnect(false).await;
    }

    /// Handle a `Swap_ack` received on `conn`.
    pub(crate) fn handle_swap_ack(&self, conn: &Arc<Connection<M>>, point: SocketAddr, peer: PeerId) {
        let now = now_ms();
        conn.last_swap_ms.store(now, Ordering::Relaxed);
        self.last_swap_ms.store(now, Ordering::Relaxed);
        info!(
            from = %conn.info().peer_id,
            dropped_point = %point,
            dropped_peer = %peer,
            "Swap acknowledged"
        );
    }

    /// Least-recently-active, non-trusted, non-disconnecting connection,
    /// excluding `keep`.
    fn pick_swap_victim(&self, keep: &PeerId) -> Option<Arc<Connection<M>>> {
        let state = self.state.read();
        state
            .connections
            .values()
            .filter(|c| c.info().peer_id != *keep)
            .filter(|c| !c.is_disconnecting())
            .filter(|c| {
                let point = c.info().point;
                !self.config.is_trusted(&point)
                    && !state.known.point(&point).map(|p| p.trusted).unwrap_or(false)
            })
            .min_by_key(|c| c.stat.last_activity_ms())
            .cloned()
    }
}
