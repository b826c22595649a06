//! Lifecycle callbacks delivered to the application.
//!
//! [`ConnectionHandler`] has one method per lifecycle event and is resolved
//! statically: [`SocketServer`](super::server::SocketServer) and
//! [`SocketClient`](super::client::SocketClient) are generic over it.
//!
//! For code that prefers an event loop over callbacks, [`event_channel`]
//! returns a handler that forwards every callback onto an unbounded channel
//! as a [`ConnectionEvent`].

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::connection::{Connection, ConnectionId};
use crate::error::IpcError;

/// Why a connection reached the end of its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this side and the queue flushed.
    Local,
    /// The peer closed its end of the stream.
    Peer,
    /// The connection was torn down before it could flush (server stop
    /// after the grace period, or the owner was dropped).
    Aborted,
    /// An I/O or protocol error; `on_error` has already fired.
    Failed,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Local => "closed locally",
            Self::Peer => "closed by peer",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Application-side lifecycle callbacks.
///
/// Callbacks run on the connection's driver task and must not block. Every
/// connection produces exactly one `on_connection` and exactly one
/// `on_close`; `on_error` fires at most once, right before
/// `on_close(CloseReason::Failed)`.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// The connection is open and may exchange messages.
    fn on_connection(&self, connection: &Connection) {
        let _ = connection;
    }

    /// A complete message arrived.
    fn on_message(&self, connection: &Connection, payload: Bytes) {
        let _ = (connection, payload);
    }

    /// The connection finished.
    fn on_close(&self, connection: &Connection, reason: CloseReason) {
        let _ = (connection, reason);
    }

    /// The connection failed.
    fn on_error(&self, connection: &Connection, error: IpcError) {
        let _ = (connection, error);
    }
}

/// A lifecycle callback captured as a value.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// See [`ConnectionHandler::on_connection`].
    Connected(Connection),

    /// See [`ConnectionHandler::on_message`].
    Message {
        /// Connection the message arrived on.
        connection: Connection,
        /// Message payload.
        payload: Bytes,
    },

    /// See [`ConnectionHandler::on_close`].
    Closed {
        /// Connection that closed.
        connection_id: ConnectionId,
        /// Why it closed.
        reason: CloseReason,
    },

    /// See [`ConnectionHandler::on_error`].
    Error {
        /// Connection that failed.
        connection_id: ConnectionId,
        /// What went wrong.
        error: IpcError,
    },
}

/// [`ConnectionHandler`] that forwards callbacks onto a channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: UnboundedSender<ConnectionEvent>,
}

impl EventSender {
    fn forward(&self, event: ConnectionEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("[Socket] Event receiver dropped, discarding event");
        }
    }
}

impl ConnectionHandler for EventSender {
    fn on_connection(&self, connection: &Connection) {
        self.forward(ConnectionEvent::Connected(connection.clone()));
    }

    fn on_message(&self, connection: &Connection, payload: Bytes) {
        self.forward(ConnectionEvent::Message {
            connection: connection.clone(),
            payload,
        });
    }

    fn on_close(&self, connection: &Connection, reason: CloseReason) {
        self.forward(ConnectionEvent::Closed {
            connection_id: connection.id().clone(),
            reason,
        });
    }

    fn on_error(&self, connection: &Connection, error: IpcError) {
        self.forward(ConnectionEvent::Error {
            connection_id: connection.id().clone(),
            error,
        });
    }
}

/// Create a forwarding handler and the receiver for its events.
pub fn event_channel() -> (EventSender, UnboundedReceiver<ConnectionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}
