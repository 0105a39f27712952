//! Connection establishment pipeline.
//!
//! Six phases, outbound and inbound: acquire a slot, transition the point,
//! set up the socket, authenticate, register, spawn the worker. Any
//! failure after the point transition reverts it to `Disconnected`.

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

use crate::codec::FrameCodec;
use crate::connection::{app_queue, spawn_reader, spawn_writer, Connection, ConnectionInfo};
use crate::error::{PoolError, PoolResult};
use crate::events::PoolEvent;
use crate::now_ms;
use crate::pool::PoolInner;
use crate::scheduler::ConnStat;
use crate::transport::{authenticate, AuthOutcome};
use crate::worker::spawn_worker;
use crate::Metadata;

/// Establish an outbound connection to `point`.
pub(crate) async fn establish_outgoing<M, Meta>(
    pool: &Arc<PoolInner<M, Meta>>,
    point: SocketAddr,
) -> PoolResult<Arc<Connection<M>>>
where
    M: Send + 'static,
    Meta: Metadata,
{
    pool.check_outgoing_admission(&point)?;

    {
        let mut state = pool.state.write();
        state.known.point_mark_requested(point)?;
    }
    pool.events.emit(PoolEvent::OutgoingDial { point });
    debug!(point = %point, "Dialing");

    match dial_and_register(pool, point).await {
        Ok(conn) => Ok(conn),
        Err(err) => {
            pool.state.write().known.point_abort_dial(&point);
            Err(err)
        }
    }
}

async fn dial_and_register<M, Meta>(
    pool: &Arc<PoolInner<M, Meta>>,
    point: SocketAddr,
) -> PoolResult<Arc<Connection<M>>>
where
    M: Send + 'static,
    Meta: Metadata,
{
    let mut stream = TcpStream::connect(point).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::ConnectionRefused {
            PoolError::ConnectionRefused
        } else {
            PoolError::ConnectionClosed
        }
    })?;

    let outcome = timeout(
        pool.config.authentication_timeout,
        authenticate(&mut stream, &pool.config, pool.msg_config.versions(), false),
    )
    .await
    .map_err(|_| PoolError::AuthenticationTimeout)??;

    if pool.bans.is_peer_banned(&outcome.peer_id) {
        return Err(PoolError::Rejected("peer is banned".to_string()));
    }

    register(pool, stream, point, outcome, false).await
}

/// Run the inbound pipeline on an accepted socket. Consumes the socket;
/// failures are logged and the socket dropped.
pub(crate) async fn establish_incoming<M, Meta>(
    pool: Arc<PoolInner<M, Meta>>,
    mut stream: TcpStream,
    remote_addr: SocketAddr,
) where
    M: Send + 'static,
    Meta: Metadata,
{
    let outcome = match timeout(
        pool.config.authentication_timeout,
        authenticate(&mut stream, &pool.config, pool.msg_config.versions(), true),
    )
    .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            debug!(addr = %remote_addr, error = %err, "Incoming authentication failed");
            return;
        }
        Err(_) => {
            debug!(addr = %remote_addr, "Incoming authentication timed out");
            return;
        }
    };

    // The point a peer is known under is its address plus the port it
    // declared to listen on; the accepting socket's port is ephemeral.
    let point = SocketAddr::new(
        remote_addr.ip(),
        outcome.listening_port.unwrap_or_else(|| remote_addr.port()),
    );

    if let Err(err) = check_incoming_admission(&pool, &point, &outcome) {
        info!(point = %point, peer = %outcome.peer_id, error = %err, "Rejecting incoming connection");
        let _ = stream.shutdown().await;
        return;
    }

    match register(&pool, stream, point, outcome, true).await {
        Ok(_) => {}
        Err(err) => {
            info!(point = %point, error = %err, "Incoming registration failed");
            pool.state
                .write()
                .known
                .point_abort_accept(&point, &outcome.peer_id);
        }
    }
}

fn check_incoming_admission<M, Meta>(
    pool: &PoolInner<M, Meta>,
    point: &SocketAddr,
    outcome: &AuthOutcome,
) -> PoolResult<()>
where
    M: Send + 'static,
    Meta: Metadata,
{
    if pool.config.closed_network && !pool.is_trusted_point(point) {
        return Err(PoolError::Rejected("closed network".to_string()));
    }
    if pool.bans.is_point_banned(point) || pool.bans.is_peer_banned(&outcome.peer_id) {
        return Err(PoolError::Rejected("banned".to_string()));
    }
    Ok(())
}

/// Phases 5 and 6: register the authenticated socket in the registries and
/// spawn its writer and control worker.
async fn register<M, Meta>(
    pool: &Arc<PoolInner<M, Meta>>,
    stream: TcpStream,
    point: SocketAddr,
    outcome: AuthOutcome,
    incoming: bool,
) -> PoolResult<Arc<Connection<M>>>
where
    M: Send + 'static,
    Meta: Metadata,
{
    let local_addr = stream.local_addr()?;
    let remote_addr = stream.peer_addr()?;

    let info = ConnectionInfo {
        peer_id: outcome.peer_id,
        point,
        incoming,
        version: outcome.version,
        listening_port: outcome.listening_port,
        local_addr,
        remote_addr,
        established_ms: now_ms(),
    };

    let codec = FrameCodec::new(pool.msg_config.frame_limits());
    let (read_half, write_half) = tokio::io::split(stream);
    let framed = FramedRead::with_capacity(
        read_half,
        codec.clone(),
        pool.config.binary_chunks_size.max(1024),
    );

    let (writer_tx, writer_rx) = mpsc::channel(pool.config.outgoing_message_queue_size.max(1));
    let (frames_tx, frames_rx) = mpsc::channel(pool.config.incoming_message_queue_size.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (app_tx, app_rx) = app_queue(pool.config.incoming_app_message_queue_size);
    let stat = Arc::new(ConnStat::new(pool.scheduler.clone()));
    let app_depth = Arc::new(AtomicUsize::new(0));

    let conn = Arc::new(Connection::new(
        info.clone(),
        pool.msg_config.clone(),
        stat.clone(),
        writer_tx,
        app_rx,
        app_depth,
        shutdown_tx,
    ));

    // Phase 5: the atomic commit point. Both state machines flip to
    // Running and the connection enters the table, or nothing happens.
    let (active, new_peer) = {
        let mut state = pool.state.write();
        if pool.is_closing() {
            return Err(PoolError::ConnectionClosed);
        }
        if state.connections.len() >= pool.config.max_connections {
            return Err(PoolError::TooManyConnections);
        }
        if state.connections.contains_key(&outcome.peer_id)
            || state
                .known
                .peer(&outcome.peer_id)
                .map(|p| p.state.is_running())
                .unwrap_or(false)
        {
            return Err(PoolError::Connected);
        }

        if incoming {
            state.known.point_mark_accepted(point, outcome.peer_id)?;
        }
        state.known.point_mark_running(point, outcome.peer_id)?;
        let new_peer = state.known.peer_mark_running(
            outcome.peer_id,
            point,
            pool.meta_config.initial_meta(),
        )?;
        state.connections.insert(outcome.peer_id, conn.clone());
        (state.connections.len(), new_peer)
    };

    // Phase 6: workers and signals.
    let reader_handle = spawn_reader(framed, frames_tx, shutdown_rx.clone());
    let writer_handle = spawn_writer(
        write_half,
        codec,
        pool.config.binary_chunks_size.max(1),
        stat,
        writer_rx,
        shutdown_rx.clone(),
    );
    spawn_worker(
        pool.clone(),
        conn.clone(),
        frames_rx,
        app_tx,
        writer_handle,
        reader_handle,
        shutdown_rx,
    );

    info!(
        peer = %info.peer_id,
        point = %point,
        incoming,
        version = info.version,
        "Connection established"
    );

    if new_peer {
        pool.events.emit(PoolEvent::NewPeer {
            peer: info.peer_id,
        });
    }
    pool.events.emit(PoolEvent::NewConnection {
        peer: info.peer_id,
        point,
        incoming,
    });
    if let Some(callback) = pool.on_new_connection.read().as_ref() {
        callback(&info);
    }
    pool.events
        .update_capacity(active, pool.config.min_connections, pool.config.max_connections);
    pool.run_gc();

    Ok(conn)
}
