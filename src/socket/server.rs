//! Unix domain socket server for accepting client connections.
//!
//! Binds a socket path and spawns an accept loop that creates a
//! [`Connection`] for each accepted peer. Live connections are kept in a
//! registry: the accept loop inserts, and each connection's task removes its
//! own entry once it has reported `on_close`. Nothing else mutates it.
//!
//! # Socket file
//!
//! - Permissions are set to `0600` (configurable) after binding.
//! - A leftover socket file nobody is accepting on is removed before binding.
//! - A path with a live listener behind it is refused ([`IpcError::Bind`]
//!   with `AddrInUse`).
//! - The file is removed again on [`SocketServer::stop`] or drop.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::{Connection, ConnectionId};
use super::events::ConnectionHandler;
use super::framing;
use super::path::validate_socket_path;
use crate::config::Config;
use crate::error::{IpcError, Result};

/// Delay before retrying after a failed `accept()`.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long `stop()` waits for aborted connections to unregister.
const ABORT_WAIT: Duration = Duration::from_secs(1);

/// Active connections of one server.
#[derive(Debug)]
struct Registry {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    count_tx: watch::Sender<usize>,
}

impl Registry {
    fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            connections: Mutex::new(HashMap::new()),
            count_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `connection` unless the server is shutting down.
    ///
    /// The check happens under the registry lock, so a connection is either
    /// seen by the shutdown sweep or refused here.
    fn try_insert(&self, connection: Connection, shutdown: &CancellationToken) -> bool {
        let mut map = self.lock();
        if shutdown.is_cancelled() {
            return false;
        }
        map.insert(connection.id().clone(), connection);
        self.count_tx.send_replace(map.len());
        true
    }

    fn remove(&self, id: &ConnectionId) {
        let mut map = self.lock();
        map.remove(id);
        self.count_tx.send_replace(map.len());
    }

    fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.lock().get(id).cloned()
    }

    fn snapshot(&self) -> Vec<Connection> {
        self.lock().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    async fn wait_empty(&self) {
        let mut count_rx = self.count_tx.subscribe();
        let _ = count_rx.wait_for(|count| *count == 0).await;
    }
}

/// Registry slot of one accepted connection.
///
/// Unregisters the connection and releases its semaphore permit when
/// dropped, including when a handler callback panics and unwinds the task.
#[derive(Debug)]
struct RegistryEntry {
    registry: Arc<Registry>,
    id: ConnectionId,
    _permit: OwnedSemaphorePermit,
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Per-connection limits handed to the accept loop.
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_frame_size: usize,
    read_buffer_size: usize,
}

/// Unix domain socket server.
///
/// Owns the bound socket path and every connection accepted on it.
/// Application code observes connections through the
/// [`ConnectionHandler`] passed to [`SocketServer::bind`].
pub struct SocketServer<H: ConnectionHandler> {
    /// Path to the socket file (for cleanup).
    socket_path: PathBuf,
    handler: Arc<H>,
    registry: Arc<Registry>,
    max_frame_size: usize,
    shutdown_grace: Duration,
    accept_cancel: CancellationToken,
    /// Handle to the accept loop task.
    accept_handle: Option<JoinHandle<()>>,
    stopped: bool,
}

impl<H: ConnectionHandler> std::fmt::Debug for SocketServer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketServer")
            .field("socket_path", &self.socket_path)
            .field("connections", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<H: ConnectionHandler> SocketServer<H> {
    /// Start a server on `socket_path` with default settings.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(socket_path: impl Into<PathBuf>, handler: H) -> Result<Self> {
        Self::bind(&Config::new(socket_path), handler)
    }

    /// Start a server with the given configuration.
    ///
    /// Validates the path length, creates the parent directory, reclaims a
    /// stale socket file, binds, sets permissions and spawns the accept loop.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Bind`] if the socket cannot be bound.
    pub fn bind(config: &Config, handler: H) -> Result<Self> {
        let socket_path = config.socket_path.clone();
        let bind_err = |source: io::Error| IpcError::Bind {
            path: socket_path.clone(),
            source,
        };

        validate_socket_path(&socket_path).map_err(bind_err)?;

        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(bind_err)?;
            }
        }

        reclaim_stale_socket(&socket_path).map_err(bind_err)?;

        let listener = std::os::unix::net::UnixListener::bind(&socket_path).map_err(bind_err)?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(config.socket_mode);
            fs::set_permissions(&socket_path, perms).map_err(bind_err)?;
        }

        // Convert std listener to tokio async listener
        listener.set_nonblocking(true).map_err(bind_err)?;
        let listener = UnixListener::from_std(listener).map_err(bind_err)?;

        log::info!(
            "Socket server listening on {} (max {} connections)",
            socket_path.display(),
            config.max_connections
        );

        let handler = Arc::new(handler);
        let registry = Arc::new(Registry::new());
        let accept_cancel = CancellationToken::new();
        let limits = Limits {
            max_frame_size: config.max_frame_size,
            read_buffer_size: config.read_buffer_size,
        };
        let accept_handle = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&handler),
            Arc::clone(&registry),
            Arc::new(Semaphore::new(config.max_connections.max(1))),
            limits,
            accept_cancel.clone(),
        ));

        Ok(Self {
            socket_path,
            handler,
            registry,
            max_frame_size: config.max_frame_size,
            shutdown_grace: config.shutdown_grace(),
            accept_cancel,
            accept_handle: Some(accept_handle),
            stopped: false,
        })
    }

    /// Path to the socket file.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The handler receiving lifecycle events.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.registry.snapshot()
    }

    /// Look up a live connection by ID.
    pub fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.registry.get(id)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Queue `payload` on every `Open` connection.
    ///
    /// The frame is encoded once. A connection that closes mid-broadcast is
    /// skipped without affecting the others. Returns how many connections
    /// accepted the message.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::FrameTooLarge`] if the payload exceeds the
    /// configured maximum.
    pub fn send_to_all(&self, payload: impl AsRef<[u8]>) -> Result<usize> {
        let encoded = framing::encode_frame(payload.as_ref(), self.max_frame_size)?;
        let mut delivered = 0;
        for conn in self.registry.snapshot() {
            if !conn.is_open() {
                continue;
            }
            match conn.send_encoded(encoded.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => log::debug!("[Socket] Broadcast skipped {}: {e}", conn.id()),
            }
        }
        Ok(delivered)
    }

    /// Stop accepting, close every connection and remove the socket file.
    ///
    /// Connections get the configured grace period to flush their queues;
    /// whatever is still running afterwards is aborted.
    pub async fn stop(mut self) {
        self.accept_cancel.cancel();
        if let Some(handle) = self.accept_handle.take() {
            if let Err(e) = handle.await {
                log::warn!("[Socket] Accept loop ended abnormally: {e}");
            }
        }

        let connections = self.registry.snapshot();
        log::info!(
            "[Socket] Stopping server on {}, closing {} connection(s)",
            self.socket_path.display(),
            connections.len()
        );
        for conn in &connections {
            conn.close();
        }

        if tokio::time::timeout(self.shutdown_grace, self.registry.wait_empty())
            .await
            .is_err()
        {
            let remaining = self.registry.snapshot();
            log::warn!(
                "[Socket] {} connection(s) still open after {:?}, aborting",
                remaining.len(),
                self.shutdown_grace
            );
            for conn in &remaining {
                conn.abort();
            }
            if tokio::time::timeout(ABORT_WAIT, self.registry.wait_empty())
                .await
                .is_err()
            {
                log::warn!(
                    "[Socket] {} connection(s) did not unregister after abort",
                    self.registry.len()
                );
            }
        }

        self.remove_socket_file();
        self.stopped = true;
    }

    fn remove_socket_file(&self) {
        match fs::remove_file(&self.socket_path) {
            Ok(()) => log::debug!("[Socket] Removed socket file {}", self.socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "[Socket] Failed to remove socket file {}: {e}",
                self.socket_path.display()
            ),
        }
    }
}

impl<H: ConnectionHandler> Drop for SocketServer<H> {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        self.accept_cancel.cancel();
        for conn in self.registry.snapshot() {
            conn.abort();
        }
        self.remove_socket_file();
    }
}

/// Remove a leftover socket file, refusing paths that are still served.
fn reclaim_stale_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a socket", path.display()),
        ));
    }

    // A successful connect means someone is accepting. That server sees one
    // short-lived connection (open, then closed by peer).
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_live) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("another server is listening on {}", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            fs::remove_file(path)?;
            log::debug!("[Socket] Removed stale socket file {}", path.display());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Accept loop, run as a tokio task.
async fn accept_loop<H: ConnectionHandler>(
    listener: UnixListener,
    handler: Arc<H>,
    registry: Arc<Registry>,
    permits: Arc<Semaphore>,
    limits: Limits,
    cancel: CancellationToken,
) {
    loop {
        // Wait for a free slot before accepting; excess peers queue in the backlog.
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_closed) => break,
            },
        };

        let accepted = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _addr)) => {
                let (conn, driver) =
                    Connection::with_stream(stream, limits.max_frame_size, limits.read_buffer_size);
                let id = conn.id().clone();
                if !registry.try_insert(conn, &cancel) {
                    log::debug!("[Socket] Dropping {} accepted during shutdown", id);
                    break;
                }
                log::info!("[Socket] Client connected: {}", id);

                let entry = RegistryEntry {
                    registry: Arc::clone(&registry),
                    id,
                    _permit: permit,
                };

                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let _entry = entry;
                    driver.run(handler).await;
                });
            }
            Err(e) => {
                log::error!("[Socket] Accept error: {e}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
    log::debug!("[Socket] Accept loop stopped");
}
