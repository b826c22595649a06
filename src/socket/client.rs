//! Client side of the socket transport.
//!
//! Connects to a server's socket path and wraps the stream in a single
//! [`Connection`] driven by a background task.
//!
//! ```text
//! Application <--ConnectionHandler--> SocketClient <--frames--> Unix Socket <--> SocketServer
//! ```
//!
//! Connecting never retries: a missing or refused path is reported as
//! [`IpcError::Connect`] right away. Dropping the client closes the
//! connection gracefully, so frames already queued are still flushed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixStream;

use super::connection::{Connection, ConnectionState};
use super::events::ConnectionHandler;
use super::path::validate_socket_path;
use crate::config::Config;
use crate::error::{IpcError, Result};

/// A connected client.
pub struct SocketClient<H: ConnectionHandler> {
    socket_path: PathBuf,
    connection: Connection,
    handler: Arc<H>,
}

impl<H: ConnectionHandler> std::fmt::Debug for SocketClient<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClient")
            .field("socket_path", &self.socket_path)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl<H: ConnectionHandler> SocketClient<H> {
    /// Connect to the server at `socket_path` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Connect`] if the path is invalid or nothing is
    /// accepting on it.
    pub async fn connect(socket_path: impl Into<PathBuf>, handler: H) -> Result<Self> {
        Self::connect_with_config(&Config::new(socket_path), handler).await
    }

    /// Connect using the path and limits from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Connect`] if the path is invalid or nothing is
    /// accepting on it.
    pub async fn connect_with_config(config: &Config, handler: H) -> Result<Self> {
        let socket_path = config.socket_path.clone();
        let connect_err = |source: std::io::Error| IpcError::Connect {
            path: socket_path.clone(),
            source,
        };

        validate_socket_path(&socket_path).map_err(connect_err)?;
        let stream = UnixStream::connect(&socket_path).await.map_err(connect_err)?;
        log::info!("[Client] Connected to {}", socket_path.display());

        let (connection, driver) =
            Connection::with_stream(stream, config.max_frame_size, config.read_buffer_size);
        let handler = Arc::new(handler);
        tokio::spawn(driver.run(Arc::clone(&handler)));

        Ok(Self {
            socket_path,
            connection,
            handler,
        })
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Path this client connected to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The handler receiving lifecycle events.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Current lifecycle state of the connection.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// See [`Connection::send`].
    pub fn send(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.connection.send(payload)
    }

    /// See [`Connection::send_flushed`].
    pub async fn send_flushed(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.connection.send_flushed(payload).await
    }

    /// See [`Connection::close`].
    pub fn close(&self) {
        self.connection.close();
    }

    /// Wait until the connection has finished.
    pub async fn closed(&self) {
        self.connection.closed().await;
    }
}

impl<H: ConnectionHandler> Drop for SocketClient<H> {
    fn drop(&mut self) {
        self.connection.close();
    }
}
