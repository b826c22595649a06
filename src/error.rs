//! Error taxonomy for the socket transport.
//!
//! Bind and connect failures are returned to the caller of
//! [`SocketServer::bind`](crate::socket::server::SocketServer::bind) and
//! [`SocketClient::connect`](crate::socket::client::SocketClient::connect).
//! Everything that goes wrong on an established connection is reported once
//! through [`ConnectionHandler::on_error`](crate::socket::events::ConnectionHandler::on_error).

use std::io;
use std::path::PathBuf;

/// Errors produced by the local socket transport.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The listening socket could not be bound (in use, inaccessible, path too long).
    #[error("failed to bind socket {}: {source}", path.display())]
    Bind {
        /// Socket path that was requested.
        path: PathBuf,
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// The peer could not be reached (no listener, permission denied).
    #[error("failed to connect to socket {}: {source}", path.display())]
    Connect {
        /// Socket path that was requested.
        path: PathBuf,
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// A frame exceeds the configured maximum payload size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared or actual payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Transport-level read or write failure.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),

    /// The operation was attempted after the connection closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl IpcError {
    /// Returns `true` for [`IpcError::ConnectionClosed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// Returns `true` when the peer went away mid-write (`EPIPE`/`ECONNRESET`).
    pub(crate) fn is_peer_gone(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::NotConnected
            )
        )
    }
}

/// Result alias used across the transport.
pub type Result<T, E = IpcError> = std::result::Result<T, E>;
