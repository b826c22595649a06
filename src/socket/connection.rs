//! Per-connection state for socket peers.
//!
//! Each established stream gets a [`Connection`] handle plus a
//! [`ConnectionDriver`] that owns the stream, the inbound decoder and the
//! outbound queue receiver. The driver runs as a single task that joins a
//! read loop and a write loop; handles are cheap clones that only enqueue
//! frames or request shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──► Open ──► Closing ──► Closed
//!      │           │          │
//!      └───────────┴──────────┴──► Failed
//! ```
//!
//! The state only moves forward. Enqueueing and closing take the same lock,
//! so a frame accepted before `close()` is always flushed and a send issued
//! after it always fails with [`IpcError::ConnectionClosed`].

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::events::{CloseReason, ConnectionHandler};
use super::framing::{self, FrameDecoder};
use crate::error::{IpcError, Result};

/// Default read buffer size (64 KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Unique identifier of a connection within the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a unique ID using a monotonic counter + random suffix.
    pub(crate) fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let rand: u16 = rand::random();
        Self(format!("socket:{seq:x}{rand:04x}"))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Stream established, driver not yet running.
    Connecting,
    /// Bidirectional exchange.
    Open,
    /// Flushing queued frames before shutdown.
    Closing,
    /// Finished normally.
    Closed,
    /// Finished because of an I/O or protocol error.
    Failed,
}

impl ConnectionState {
    /// `Closed` or `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether `send` is accepted in this state.
    pub fn accepts_sends(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed | Self::Failed => 3,
        }
    }

    /// Whether moving to `next` keeps the lifecycle monotonic.
    pub fn can_advance_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Item in the outbound queue.
enum Outbound {
    Frame {
        encoded: Bytes,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    /// Everything queued before this marker is written, then the write side
    /// shuts down.
    Close(CloseReason),
}

/// How a connection ended.
enum Outcome {
    Closed(CloseReason),
    Failed(IpcError),
}

struct Inner {
    state: ConnectionState,
    closing: Option<CloseReason>,
}

struct Shared {
    id: ConnectionId,
    inner: Mutex<Inner>,
    outbound_tx: UnboundedSender<Outbound>,
    /// Stops both loops.
    cancel: CancellationToken,
    /// Fired once the terminal state has been reported.
    done: CancellationToken,
    max_frame_size: usize,
}

/// Handle to one duplex message stream.
///
/// Clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap an established stream.
    ///
    /// The connection starts in `Connecting`; nothing is read or written
    /// until the returned driver runs.
    pub(crate) fn with_stream(
        stream: UnixStream,
        max_frame_size: usize,
        read_buffer_size: usize,
    ) -> (Self, ConnectionDriver) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connection = Self {
            shared: Arc::new(Shared {
                id: ConnectionId::generate(),
                inner: Mutex::new(Inner {
                    state: ConnectionState::Connecting,
                    closing: None,
                }),
                outbound_tx,
                cancel: CancellationToken::new(),
                done: CancellationToken::new(),
                max_frame_size,
            }),
        };

        let driver = ConnectionDriver {
            connection: connection.clone(),
            stream,
            outbound_rx,
            read_buffer_size: read_buffer_size.max(1),
        };

        (connection, driver)
    }

    /// Connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.shared.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Whether the connection is `Open`.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Largest payload this connection sends or accepts.
    pub fn max_frame_size(&self) -> usize {
        self.shared.max_frame_size
    }

    /// Queue a message for transmission.
    ///
    /// Returns as soon as the frame is queued. Frames are written in the
    /// order they were queued.
    ///
    /// # Errors
    ///
    /// [`IpcError::ConnectionClosed`] once `close()` was called or the
    /// connection ended; [`IpcError::FrameTooLarge`] if the payload exceeds
    /// the maximum frame size.
    pub fn send(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        let encoded = self.encode(payload.as_ref())?;
        self.enqueue(encoded, None)
    }

    /// Queue a message and wait until it has been written to the socket.
    ///
    /// # Errors
    ///
    /// As [`Connection::send`], plus [`IpcError::ConnectionClosed`] if the
    /// connection ended before the frame was written.
    pub async fn send_flushed(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        let encoded = self.encode(payload.as_ref())?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(encoded, Some(ack_tx))?;
        ack_rx.await.unwrap_or(Err(IpcError::ConnectionClosed))
    }

    /// Queue an already encoded frame (used for broadcast).
    pub(crate) fn send_encoded(&self, encoded: Bytes) -> Result<()> {
        self.enqueue(encoded, None)
    }

    /// Gracefully close: flush queued frames, then shut the stream down.
    ///
    /// Idempotent. Sends issued after this call fail with
    /// [`IpcError::ConnectionClosed`].
    pub fn close(&self) {
        self.begin_close(CloseReason::Local);
    }

    /// Wait until the connection has reported its final `on_close`.
    pub async fn closed(&self) {
        self.shared.done.cancelled().await;
    }

    /// Tear the connection down without flushing.
    pub(crate) fn abort(&self) {
        {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = ConnectionState::Closing;
            inner.closing.get_or_insert(CloseReason::Aborted);
        }
        self.shared.cancel.cancel();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        if !self.state().accepts_sends() {
            return Err(IpcError::ConnectionClosed);
        }
        framing::encode_frame(payload, self.shared.max_frame_size)
    }

    fn enqueue(&self, encoded: Bytes, ack: Option<oneshot::Sender<Result<()>>>) -> Result<()> {
        let inner = self.lock();
        if !inner.state.accepts_sends() {
            return Err(IpcError::ConnectionClosed);
        }
        if self.shared.outbound_tx.send(Outbound::Frame { encoded, ack }).is_err() {
            return Err(IpcError::ConnectionClosed);
        }
        Ok(())
    }

    /// Enter `Closing` and queue the close marker behind pending frames.
    ///
    /// Returns `false` if the connection was already closing or finished.
    fn begin_close(&self, reason: CloseReason) -> bool {
        let mut inner = self.lock();
        if !inner.state.accepts_sends() {
            return false;
        }
        inner.state = ConnectionState::Closing;
        inner.closing = Some(reason);
        if self.shared.outbound_tx.send(Outbound::Close(reason)).is_err() {
            log::debug!("[Socket] Close marker for {} not queued, driver gone", self.id());
        }
        true
    }

    fn closing_reason(&self) -> Option<CloseReason> {
        self.lock().closing
    }

    /// `Connecting` → `Open`. Returns `false` if closed before opening.
    fn open(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Connecting {
            inner.state = ConnectionState::Open;
            true
        } else {
            false
        }
    }

    /// Move to a terminal state and report it. Only the first call wins.
    fn finish<H: ConnectionHandler>(&self, outcome: Outcome, handler: &H) -> bool {
        let next = match outcome {
            Outcome::Closed(_) => ConnectionState::Closed,
            Outcome::Failed(_) => ConnectionState::Failed,
        };
        {
            let mut inner = self.lock();
            if !inner.state.can_advance_to(next) {
                return false;
            }
            inner.state = next;
        }
        self.shared.cancel.cancel();

        match outcome {
            Outcome::Closed(reason) => {
                log::info!("[Socket] Connection {} {}", self.id(), reason);
                handler.on_close(self, reason);
            }
            Outcome::Failed(error) => {
                log::error!("[Socket] Connection {} failed: {error}", self.id());
                handler.on_error(self, error);
                handler.on_close(self, CloseReason::Failed);
            }
        }
        self.shared.done.cancel();
        true
    }

    /// Mark the connection `Failed` without calling back into the handler.
    ///
    /// Used when a handler callback panicked and unwound the driver task.
    fn fail_after_panic(&self) {
        let failed = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                false
            } else {
                inner.state = ConnectionState::Failed;
                true
            }
        };
        if failed {
            log::error!("[Socket] Connection {} handler panicked, connection failed", self.id());
        }
        // Also reached when on_close itself panicked after the transition.
        self.shared.cancel.cancel();
        self.shared.done.cancel();
    }

    /// Read loop: decodes frames from the socket and dispatches them.
    async fn read_loop<H: ConnectionHandler>(
        &self,
        mut reader: OwnedReadHalf,
        buffer_size: usize,
        handler: &H,
    ) {
        let cancel = self.shared.cancel.clone();
        let mut decoder = FrameDecoder::with_max_frame_size(self.shared.max_frame_size);
        let mut buf = vec![0u8; buffer_size];

        loop {
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    if decoder.has_partial() {
                        let error = io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream ended in the middle of a frame",
                        );
                        self.finish(Outcome::Failed(error.into()), handler);
                    } else {
                        log::debug!("[Socket] Peer closed {}", self.id());
                        self.begin_close(CloseReason::Peer);
                    }
                    break;
                }
                Ok(n) => {
                    decoder.feed(&buf[..n]);
                    for frame in decoder.frames() {
                        if cancel.is_cancelled() {
                            return;
                        }
                        match frame {
                            Ok(payload) => handler.on_message(self, payload),
                            Err(e) => {
                                self.finish(Outcome::Failed(e), handler);
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.finish(Outcome::Failed(e.into()), handler);
                    break;
                }
            }
        }
    }

    /// Write loop: drains the outbound queue onto the socket.
    async fn write_loop<H: ConnectionHandler>(
        &self,
        mut writer: OwnedWriteHalf,
        mut outbound_rx: UnboundedReceiver<Outbound>,
        handler: &H,
    ) {
        let cancel = self.shared.cancel.clone();

        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                item = outbound_rx.recv() => item,
            };
            let Some(item) = item else { break };

            match item {
                Outbound::Frame { encoded, ack } => {
                    let written = tokio::select! {
                        biased;
                        () = cancel.cancelled() => None,
                        result = writer.write_all(&encoded) => Some(result),
                    };
                    match written {
                        Some(Ok(())) => {
                            if let Some(ack) = ack {
                                let _ = ack.send(Ok(()));
                            }
                        }
                        Some(Err(e)) => {
                            fail_ack(ack);
                            let error = IpcError::from(e);
                            if error.is_peer_gone()
                                && self.closing_reason() == Some(CloseReason::Peer)
                            {
                                self.finish(Outcome::Closed(CloseReason::Peer), handler);
                            } else {
                                self.finish(Outcome::Failed(error), handler);
                            }
                            break;
                        }
                        None => {
                            fail_ack(ack);
                            break;
                        }
                    }
                }
                Outbound::Close(reason) => {
                    let shutdown = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        result = writer.shutdown() => result,
                    };
                    if let Err(e) = shutdown {
                        log::debug!("[Socket] Shutdown of {} failed: {e}", self.id());
                    }
                    self.finish(Outcome::Closed(reason), handler);
                    break;
                }
            }
        }

        // No longer accepting sends; fail whatever is still queued.
        outbound_rx.close();
        while let Ok(item) = outbound_rx.try_recv() {
            if let Outbound::Frame { ack, .. } = item {
                fail_ack(ack);
            }
        }
    }
}

fn fail_ack(ack: Option<oneshot::Sender<Result<()>>>) {
    if let Some(ack) = ack {
        let _ = ack.send(Err(IpcError::ConnectionClosed));
    }
}

/// Fails the connection if the driver task unwinds before reporting a
/// terminal state.
struct UnwindGuard(Connection);

impl Drop for UnwindGuard {
    fn drop(&mut self) {
        self.0.fail_after_panic();
    }
}

/// Owns the stream and queue of one [`Connection`]; see [`ConnectionDriver::run`].
pub(crate) struct ConnectionDriver {
    connection: Connection,
    stream: UnixStream,
    outbound_rx: UnboundedReceiver<Outbound>,
    read_buffer_size: usize,
}

impl std::fmt::Debug for ConnectionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDriver")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl ConnectionDriver {
    /// Run the connection to completion.
    ///
    /// Opens the connection, reports `on_connection`, then services reads
    /// and writes until it closes, fails or is aborted. Returns after the
    /// terminal state has been reported.
    pub(crate) async fn run<H: ConnectionHandler>(self, handler: Arc<H>) {
        let Self {
            connection,
            stream,
            outbound_rx,
            read_buffer_size,
        } = self;
        let handler = &*handler;
        let _guard = UnwindGuard(connection.clone());

        if connection.open() {
            log::debug!("[Socket] Connection {} open", connection.id());
            handler.on_connection(&connection);
        }

        let (reader, writer) = stream.into_split();
        tokio::join!(
            connection.read_loop(reader, read_buffer_size, handler),
            connection.write_loop(writer, outbound_rx, handler),
        );

        // Both loops stopped without a terminal transition: aborted.
        connection.finish(Outcome::Closed(CloseReason::Aborted), handler);
    }
}
