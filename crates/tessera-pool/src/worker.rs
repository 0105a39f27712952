//! Control-message worker.
//!
//! One worker task drives each connection's inbound side. It consumes
//! decoded frames from the reader task's bounded channel, dispatches
//! control messages to the pool and pushes application messages onto the
//! app-queue, suspending on a full queue so that backpressure propagates
//! through the reader to the transport.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::Frame;
use crate::connection::{AppSender, Connection};
use crate::error::{PoolError, PoolResult};
use crate::message::{ControlMessage, CONTROL_TAG_MAX};
use crate::pool::PoolInner;
use crate::Metadata;

/// Why a worker stopped.
pub(crate) enum CloseReason {
    /// Local disconnect request or pool shutdown.
    Local,
    /// The remote closed the socket or sent a Disconnect notice.
    Remote,
    /// Transport or protocol failure.
    Error(PoolError),
}

/// Spawn the control worker for a registered connection.
///
/// The worker drives the whole teardown on exit: it stops the reader and
/// writer, waits for both, finalizes the pool's registries and releases
/// `disconnect(wait)` callers.
pub(crate) fn spawn_worker<M, Meta>(
    pool: Arc<PoolInner<M, Meta>>,
    conn: Arc<Connection<M>>,
    mut frames_rx: mpsc::Receiver<PoolResult<Frame>>,
    app_tx: AppSender<M>,
    writer_handle: JoinHandle<()>,
    reader_handle: JoinHandle<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    M: Send + 'static,
    Meta: Metadata,
{
    tokio::spawn(async move {
        let reason = run(&pool, &conn, &mut frames_rx, &app_tx, &mut shutdown_rx).await;
        match &reason {
            CloseReason::Local => {
                debug!(peer = %conn.info().peer_id, point = %conn.info().point, "Connection closed locally")
            }
            CloseReason::Remote => {
                debug!(peer = %conn.info().peer_id, point = %conn.info().point, "Connection closed by peer")
            }
            CloseReason::Error(err) => {
                warn!(peer = %conn.info().peer_id, point = %conn.info().point, error = %err, "Connection failed")
            }
        }

        // Stop both I/O tasks (idempotent if a disconnect started all
        // this) and wait for the transport to close. Dropping the frame
        // channel unblocks a reader suspended on a full queue.
        conn.disconnect(false).await;
        let _ = writer_handle.await;
        drop(frames_rx);
        let _ = reader_handle.await;

        pool.finalize_connection(&conn);
        conn.mark_closed();
    })
}

async fn run<M, Meta>(
    pool: &Arc<PoolInner<M, Meta>>,
    conn: &Arc<Connection<M>>,
    frames_rx: &mut mpsc::Receiver<PoolResult<Frame>>,
    app_tx: &AppSender<M>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> CloseReason
where
    M: Send + 'static,
    Meta: Metadata,
{
    loop {
        let frame = tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return CloseReason::Local;
                }
                continue;
            }
            item = frames_rx.recv() => match item {
                None => return CloseReason::Remote,
                Some(Err(err)) => return CloseReason::Error(err),
                Some(Ok(frame)) => frame,
            },
        };
        conn.stat.record_recv(frame.wire_len() as u64);

        if frame.tag <= CONTROL_TAG_MAX {
            let msg = match ControlMessage::from_frame(frame.tag, &frame.payload) {
                Ok(msg) => msg,
                Err(err) => return CloseReason::Error(err),
            };
            if matches!(msg, ControlMessage::Disconnect) {
                return CloseReason::Remote;
            }
            pool.handle_control(conn, msg).await;
        } else {
            let msg = match conn.msg_config().decode_app(frame.tag, &frame.payload) {
                Ok(msg) => msg,
                Err(err) => return CloseReason::Error(err),
            };
            // Backpressure: a full app-queue suspends this worker until
            // the application drains a slot.
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return CloseReason::Local;
                    }
                }
                sent = app_tx.send(msg) => {
                    if sent.is_err() {
                        return CloseReason::Local;
                    }
                    conn.bump_app_depth();
                }
            }
        }
    }
}
