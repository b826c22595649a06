//! Unix domain socket transport for local inter-process messaging.
//!
//! A [`SocketServer`](server::SocketServer) binds a filesystem path and
//! accepts any number of peers; a [`SocketClient`](client::SocketClient)
//! connects to one. Both sides end up with the same [`Connection`]
//! abstraction: an ordered, duplex stream of discrete messages.
//!
//! # Architecture
//!
//! ```text
//! Server Process                         Client Process
//! ┌──────────────────┐                  ┌──────────────────┐
//! │ SocketServer     │                  │ SocketClient     │
//! │  UnixListener    │◄────────────────►│  UnixStream      │
//! │  Connection      │   frames over    │  Connection      │
//! │  per peer        │   Unix socket    │                  │
//! └────────┬─────────┘                  └────────┬─────────┘
//!          │ ConnectionHandler                   │ ConnectionHandler
//!          ▼                                     ▼
//!     application                           application
//! ```
//!
//! # Wire Protocol
//!
//! Length-prefixed frames: `[u32 LE length][payload]`
//!
//! See [`framing`] for the codec.

pub mod client;
pub mod connection;
pub mod events;
pub mod framing;
pub mod path;
pub mod server;

pub use client::SocketClient;
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use events::{event_channel, CloseReason, ConnectionEvent, ConnectionHandler, EventSender};
pub use server::SocketServer;
