//! localsock - message-oriented IPC over Unix domain sockets.
//!
//! Processes on the same machine exchange discrete, ordered messages over a
//! socket path. Each message travels as one length-prefixed frame, so the
//! receiver always sees exactly the payloads the sender submitted,
//! regardless of how the bytes were chunked on the way.
//!
//! # Modules
//!
//! - [`socket`] - Frame codec, connections, server and client
//! - [`config`] - Configuration loading/saving
//! - [`error`] - Transport error type
//!
//! # Example
//!
//! ```no_run
//! use localsock::{event_channel, ConnectionEvent, ConnectionHandler, SocketServer};
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_message(&self, connection: &localsock::Connection, payload: bytes::Bytes) {
//!         let _ = connection.send(payload);
//!     }
//! }
//!
//! # async fn run() -> localsock::Result<()> {
//! let server = SocketServer::start("/tmp/echo.sock", Echo)?;
//!
//! let (handler, mut events) = event_channel();
//! let client = localsock::SocketClient::connect("/tmp/echo.sock", handler).await?;
//! client.send("greetings\n")?;
//! while let Some(event) = events.recv().await {
//!     if let ConnectionEvent::Message { payload, .. } = event {
//!         assert_eq!(&payload[..], b"greetings\n");
//!         break;
//!     }
//! }
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod socket;

// Re-export commonly used types
pub use config::Config;
pub use error::{IpcError, Result};
pub use socket::{
    event_channel, CloseReason, Connection, ConnectionEvent, ConnectionHandler, ConnectionId,
    ConnectionState, EventSender, SocketClient, SocketServer,
};
