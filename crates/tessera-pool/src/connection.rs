//! Live connection handle.
//!
//! A connection owns four moving parts: a reader task feeding decoded
//! frames into a bounded channel, a writer task draining a bounded command
//! queue onto the socket, a control worker dispatching frames (see
//! [`crate::worker`]), and a bounded app-queue of decoded application
//! messages awaiting [`Connection::read`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use tessera_identity::PeerId;

use crate::codec::{write_frame, write_raw, Frame, FrameCodec};
use crate::error::{PoolError, PoolResult};
use crate::message::{ControlMessage, MessageConfig};
use crate::scheduler::{ConnStat, ConnStatSnapshot};

/// Immutable facts about an established connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Remote identity.
    pub peer_id: PeerId,
    /// The point this connection is registered under.
    pub point: SocketAddr,
    /// Whether the remote dialed us.
    pub incoming: bool,
    /// Negotiated protocol version.
    pub version: u16,
    /// Port the remote declared it listens on.
    pub listening_port: Option<u16>,
    /// Local socket address.
    pub local_addr: SocketAddr,
    /// Remote socket address.
    pub remote_addr: SocketAddr,
    /// Wall-clock milliseconds when the connection was registered.
    pub established_ms: u64,
}

/// Commands consumed by the writer task.
pub(crate) enum WriteCommand {
    /// Encode and write a frame.
    Frame(Frame, Option<oneshot::Sender<PoolResult<()>>>),
    /// Write pre-framed bytes.
    Raw(Vec<u8>, Option<oneshot::Sender<PoolResult<()>>>),
}

/// Sending side of the app-queue.
pub(crate) enum AppSender<M> {
    Bounded(mpsc::Sender<M>),
    Unbounded(mpsc::UnboundedSender<M>),
}

impl<M> AppSender<M> {
    /// Deliver one message, applying backpressure on a bounded queue.
    pub(crate) async fn send(&self, msg: M) -> Result<(), ()> {
        match self {
            AppSender::Bounded(tx) => tx.send(msg).await.map_err(|_| ()),
            AppSender::Unbounded(tx) => tx.send(msg).map_err(|_| ()),
        }
    }
}

/// Receiving side of the app-queue.
pub(crate) enum AppReceiver<M> {
    Bounded(mpsc::Receiver<M>),
    Unbounded(mpsc::UnboundedReceiver<M>),
}

impl<M> AppReceiver<M> {
    async fn recv(&mut self) -> Option<M> {
        match self {
            AppReceiver::Bounded(rx) => rx.recv().await,
            AppReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Build an app-queue pair; `None` means unbounded.
pub(crate) fn app_queue<M>(bound: Option<usize>) -> (AppSender<M>, AppReceiver<M>) {
    match bound {
        Some(size) => {
            let (tx, rx) = mpsc::channel(size.max(1));
            (AppSender::Bounded(tx), AppReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (AppSender::Unbounded(tx), AppReceiver::Unbounded(rx))
        }
    }
}

/// A live peer connection.
pub struct Connection<M> {
    info: ConnectionInfo,
    msg_config: Arc<MessageConfig<M>>,
    pub(crate) stat: Arc<ConnStat>,
    writer_tx: mpsc::Sender<WriteCommand>,
    app_rx: Mutex<AppReceiver<M>>,
    app_depth: Arc<AtomicUsize>,
    disconnecting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    closed_notify: Notify,
    /// Wall-clock of the last swap activity on this connection.
    pub(crate) last_swap_ms: AtomicU64,
}

impl<M> Connection<M> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        info: ConnectionInfo,
        msg_config: Arc<MessageConfig<M>>,
        stat: Arc<ConnStat>,
        writer_tx: mpsc::Sender<WriteCommand>,
        app_rx: AppReceiver<M>,
        app_depth: Arc<AtomicUsize>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            info,
            msg_config,
            stat,
            writer_tx,
            app_rx: Mutex::new(app_rx),
            app_depth,
            disconnecting: AtomicBool::new(false),
            shutdown_tx,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            last_swap_ms: AtomicU64::new(0),
        }
    }

    /// Immutable connection facts.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Best-effort I/O counters.
    pub fn stat(&self) -> ConnStatSnapshot {
        self.stat.snapshot()
    }

    pub(crate) fn msg_config(&self) -> &MessageConfig<M> {
        &self.msg_config
    }

    /// Next application message, in the order the peer sent them.
    ///
    /// Fails with [`PoolError::ConnectionClosed`] once the connection is
    /// closed and the queue drained.
    pub async fn read(&self) -> PoolResult<M> {
        let mut rx = self.app_rx.lock().await;
        match rx.recv().await {
            Some(msg) => {
                self.app_depth.fetch_sub(1, Ordering::Relaxed);
                Ok(msg)
            }
            None => Err(PoolError::ConnectionClosed),
        }
    }

    /// Whether a message is queued for [`Self::read`].
    pub fn is_readable(&self) -> bool {
        self.app_depth.load(Ordering::Relaxed) > 0
    }

    /// Queue a message for writing, waiting for queue space.
    pub async fn write(&self, msg: &M) -> PoolResult<()> {
        let frame = self.msg_config.encode_app(msg)?;
        self.writer_tx
            .send(WriteCommand::Frame(frame, None))
            .await
            .map_err(|_| PoolError::ConnectionClosed)
    }

    /// Write a message and wait until it has drained to the transport.
    pub async fn write_sync(&self, msg: &M) -> PoolResult<()> {
        let frame = self.msg_config.encode_app(msg)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.writer_tx
            .send(WriteCommand::Frame(frame, Some(ack_tx)))
            .await
            .map_err(|_| PoolError::ConnectionClosed)?;
        ack_rx.await.map_err(|_| PoolError::ConnectionClosed)?
    }

    /// Write a message without waiting; `Ok(false)` if the queue is full.
    pub fn write_now(&self, msg: &M) -> PoolResult<bool> {
        let frame = self.msg_config.encode_app(msg)?;
        match self.writer_tx.try_send(WriteCommand::Frame(frame, None)) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(PoolError::ConnectionClosed),
        }
    }

    /// Write pre-framed bytes and wait until they have drained.
    pub async fn raw_write_sync(&self, bytes: Vec<u8>) -> PoolResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.writer_tx
            .send(WriteCommand::Raw(bytes, Some(ack_tx)))
            .await
            .map_err(|_| PoolError::ConnectionClosed)?;
        ack_rx.await.map_err(|_| PoolError::ConnectionClosed)?
    }

    /// Queue a control message.
    pub(crate) async fn send_control(&self, msg: &ControlMessage) -> PoolResult<()> {
        self.writer_tx
            .send(WriteCommand::Frame(msg.to_frame(), None))
            .await
            .map_err(|_| PoolError::ConnectionClosed)
    }

    /// Queue a control message without waiting.
    pub(crate) fn try_send_control(&self, msg: &ControlMessage) {
        let _ = self
            .writer_tx
            .try_send(WriteCommand::Frame(msg.to_frame(), None));
    }

    /// Close the connection. Idempotent; with `wait` the call returns only
    /// after the control worker has exited and the transport is closed.
    pub async fn disconnect(&self, wait: bool) {
        if !self.disconnecting.swap(true, Ordering::SeqCst) {
            debug!(peer = %self.info.peer_id, point = %self.info.point, "Disconnecting");
            // Best-effort notice to the remote.
            self.try_send_control(&ControlMessage::Disconnect);
            let _ = self.shutdown_tx.send(true);
        }
        if wait {
            self.wait_closed().await;
        }
    }

    /// Whether a disconnect has been requested or is under way.
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
    }

    async fn wait_closed(&self) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.closed_notify.notified();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn bump_app_depth(&self) {
        self.app_depth.fetch_add(1, Ordering::Relaxed);
    }
}

/// Spawn the reader task: decodes frames off the socket into the bounded
/// frame channel. A full channel suspends reading, so backpressure reaches
/// the transport. The task ends on EOF, after forwarding a decode error,
/// on shutdown, or once the worker drops the receiving side.
pub(crate) fn spawn_reader<R>(
    mut framed: FramedRead<R, FrameCodec>,
    frames_tx: mpsc::Sender<PoolResult<Frame>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                frame = framed.next() => match frame {
                    None => break,
                    Some(item) => item,
                },
            };
            let failed = item.is_err();
            if frames_tx.send(item).await.is_err() || failed {
                break;
            }
        }
    })
}

/// Spawn the writer task: drains [`WriteCommand`]s onto the socket,
/// chunking writes and acknowledging synchronous writers after the flush.
pub(crate) fn spawn_writer<W>(
    mut io: W,
    mut codec: FrameCodec,
    chunk_size: usize,
    stat: Arc<ConnStat>,
    mut rx: mpsc::Receiver<WriteCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        'outer: loop {
            tokio::select! {
                biased;
                command = rx.recv() => match command {
                    Some(command) => {
                        if !handle_command(&mut io, &mut codec, chunk_size, &stat, command).await {
                            break 'outer;
                        }
                    }
                    None => break 'outer,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        // Drain already-queued commands (a graceful close
                        // puts its Disconnect notice there), then stop.
                        while let Ok(command) = rx.try_recv() {
                            if !handle_command(&mut io, &mut codec, chunk_size, &stat, command).await
                            {
                                break 'outer;
                            }
                        }
                        break 'outer;
                    }
                }
            }
        }
        let _ = io.shutdown().await;
    })
}

/// Execute one write command. Returns `false` when the writer must stop.
async fn handle_command<W: AsyncWrite + Unpin>(
    io: &mut W,
    codec: &mut FrameCodec,
    chunk_size: usize,
    stat: &ConnStat,
    command: WriteCommand,
) -> bool {
    let (result, ack) = match command {
        WriteCommand::Frame(frame, ack) => {
            (write_frame(io, codec, frame, chunk_size).await, ack)
        }
        WriteCommand::Raw(bytes, ack) => (write_raw(io, &bytes, chunk_size).await, ack),
    };

    match result {
        Ok(written) => {
            stat.record_sent(written as u64);
            if let Some(ack) = ack {
                let _ = ack.send(Ok(()));
            }
            true
        }
        Err(err) => {
            warn!(error = %err, "Write failed, closing writer");
            if let Some(ack) = ack {
                let _ = ack.send(Err(err));
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::AppEncoding;
    use crate::scheduler::IoScheduler;
    use crate::{now_ms, MAX_FRAME_SIZE};
    use bytes::BytesMut;
    use tokio::io::AsyncReadExt;
    use tokio_util::codec::Decoder;

    struct TextEncoding;

    impl AppEncoding<String> for TextEncoding {
        fn tag(&self) -> u8 {
            0x10
        }
        fn max_length(&self) -> Option<usize> {
            Some(1024)
        }
        fn encode(&self, msg: &String) -> Option<Vec<u8>> {
            Some(msg.as_bytes().to_vec())
        }
        fn decode(&self, payload: &[u8]) -> Option<String> {
            String::from_utf8(payload.to_vec()).ok()
        }
    }

    fn msg_config() -> Arc<MessageConfig<String>> {
        Arc::new(MessageConfig::new(vec![1]).with_encoding(Box::new(TextEncoding)))
    }

    fn frame_codec(config: &MessageConfig<String>) -> FrameCodec {
        FrameCodec::new(config.frame_limits())
    }

    fn test_info() -> ConnectionInfo {
        ConnectionInfo {
            peer_id: tessera_identity::Keypair::generate(0).peer_id(),
            point: "127.0.0.1:9732".parse().unwrap(),
            incoming: false,
            version: 1,
            listening_port: Some(9732),
            local_addr: "127.0.0.1:50000".parse().unwrap(),
            remote_addr: "127.0.0.1:9732".parse().unwrap(),
            established_ms: now_ms(),
        }
    }

    /// A connection wired to a duplex socket with a live writer task.
    fn test_connection(
        writer_capacity: usize,
    ) -> (Arc<Connection<String>>, tokio::io::DuplexStream, AppSender<String>) {
        let config = msg_config();
        let (local, remote) = tokio::io::duplex(MAX_FRAME_SIZE);
        let (writer_tx, writer_rx) = mpsc::channel(writer_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (app_tx, app_rx) = app_queue(Some(16));
        let stat = Arc::new(ConnStat::new(IoScheduler::new()));

        spawn_writer(
            local,
            frame_codec(&config),
            4096,
            stat.clone(),
            writer_rx,
            shutdown_rx,
        );

        let conn = Arc::new(Connection::new(
            test_info(),
            config,
            stat,
            writer_tx,
            app_rx,
            Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        ));
        (conn, remote, app_tx)
    }

    async fn read_one_frame(remote: &mut tokio::io::DuplexStream) -> Frame {
        let mut codec = frame_codec(&msg_config());
        let mut buf = BytesMut::new();
        loop {
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                return frame;
            }
            let mut chunk = [0u8; 256];
            let n = remote.read(&mut chunk).await.unwrap();
            assert!(n > 0, "remote closed early");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn test_write_sync_drains_to_socket() {
        let (conn, mut remote, _app_tx) = test_connection(8);

        conn.write_sync(&"hello".to_string()).await.unwrap();

        let frame = read_one_frame(&mut remote).await;
        assert_eq!(frame.tag, 0x10);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(conn.stat().sent_bytes > 0);
        assert_eq!(conn.stat().sent_msgs, 1);
    }

    #[tokio::test]
    async fn test_write_now_reports_full_queue() {
        // No writer task: the queue fills up and stays full.
        let config = msg_config();
        let (writer_tx, _writer_rx_keepalive) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);
        let (_app_tx, app_rx) = app_queue::<String>(Some(4));
        let conn = Connection::new(
            test_info(),
            config,
            Arc::new(ConnStat::new(IoScheduler::new())),
            writer_tx,
            app_rx,
            Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        );

        assert!(conn.write_now(&"first".to_string()).unwrap());
        assert!(!conn.write_now(&"second".to_string()).unwrap());
    }

    #[tokio::test]
    async fn test_read_follows_queue_order_and_closure() {
        let (conn, _remote, app_tx) = test_connection(8);

        app_tx.send("one".to_string()).await.unwrap();
        conn.bump_app_depth();
        app_tx.send("two".to_string()).await.unwrap();
        conn.bump_app_depth();

        assert!(conn.is_readable());
        assert_eq!(conn.read().await.unwrap(), "one");
        assert_eq!(conn.read().await.unwrap(), "two");
        assert!(!conn.is_readable());

        drop(app_tx);
        assert!(matches!(conn.read().await, Err(PoolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (conn, mut remote, _app_tx) = test_connection(8);

        conn.disconnect(false).await;
        conn.disconnect(false).await;
        assert!(conn.is_disconnecting());

        // Exactly one Disconnect notice reaches the wire.
        let frame = read_one_frame(&mut remote).await;
        assert_eq!(frame.tag, crate::message::TAG_DISCONNECT);
        let mut rest = [0u8; 16];
        let n = remote.read(&mut rest).await.unwrap();
        assert_eq!(n, 0, "no second frame expected");
    }

    #[tokio::test]
    async fn test_disconnect_wait_returns_after_close() {
        let (conn, _remote, _app_tx) = test_connection(8);

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.disconnect(true).await })
        };
        tokio::task::yield_now().await;

        conn.mark_closed();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("disconnect(wait) returned")
            .unwrap();
    }

    #[tokio::test]
    async fn test_reader_feeds_bounded_channel_in_order() {
        use bytes::Bytes;
        use tokio_util::codec::Encoder;

        let config = msg_config();
        let (local, mut remote) = tokio::io::duplex(MAX_FRAME_SIZE);
        let framed = FramedRead::new(local, frame_codec(&config));
        // Capacity 1: the reader has to wait for the consumer.
        let (frames_tx, mut frames_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_reader(framed, frames_tx, shutdown_rx);

        let mut codec = frame_codec(&config);
        let mut buf = BytesMut::new();
        for text in ["a", "b", "c"] {
            codec
                .encode(
                    Frame {
                        tag: 0x10,
                        payload: Bytes::copy_from_slice(text.as_bytes()),
                    },
                    &mut buf,
                )
                .unwrap();
        }
        remote.write_all(&buf).await.unwrap();
        drop(remote);

        for text in ["a", "b", "c"] {
            let frame = frames_rx.recv().await.unwrap().unwrap();
            assert_eq!(&frame.payload[..], text.as_bytes());
        }
        // EOF closes the channel and ends the task.
        assert!(frames_rx.recv().await.is_none());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_forwards_decode_error_and_stops() {
        let config = msg_config();
        let (local, mut remote) = tokio::io::duplex(MAX_FRAME_SIZE);
        let framed = FramedRead::new(local, frame_codec(&config));
        let (frames_tx, mut frames_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_reader(framed, frames_tx, shutdown_rx);

        // An unknown tag terminates the stream.
        remote
            .write_all(&[0x42, 0, 0, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let item = frames_rx.recv().await.unwrap();
        assert!(matches!(item, Err(PoolError::DecodingError(_))));
        assert!(frames_rx.recv().await.is_none());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_raw_write_sync_passes_bytes_through() {
        let (conn, mut remote, _app_tx) = test_connection(8);

        let frame = ControlMessage::Bootstrap.to_frame();
        let mut buf = BytesMut::new();
        use tokio_util::codec::Encoder;
        frame_codec(&msg_config()).encode(frame, &mut buf).unwrap();

        conn.raw_write_sync(buf.to_vec()).await.unwrap();

        let read = read_one_frame(&mut remote).await;
        assert_eq!(read.tag, crate::message::TAG_BOOTSTRAP);
    }
}
