//! # PingPong Core - A From-Scratch WebSocket Server
//!
//! `pingpong-core` implements the server side of the WebSocket protocol directly on
//! top of TCP: the HTTP upgrade handshake, the binary frame codec, ping/pong
//! keepalive, and rebroadcasting of text messages to every connected peer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  new socket   ┌─────────────────────┐   once   ┌─────────────────────┐
//! │    Server    │ ────────────→ │  ConnectionHandler  │ ───────→ │ HandshakeNegotiator │
//! │ (accept loop)│               │  (one task / conn)  │          └─────────────────────┘
//! └──────────────┘               │                     │  per frame ┌────────────┐
//!        │                       │                     │ ─────────→ │   frame    │
//!        │ register              │                     │            └────────────┘
//!        ↓                       │                     │  broadcast ┌────────────────────┐
//! ┌────────────────────┐         │                     │ ─────────→ │ ConnectionRegistry │
//! │ ConnectionRegistry │ ←────── └─────────────────────┘            └────────────────────┘
//! └────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`frame`]: frame encoding and decoding (pure functions)
//! - [`header`]: HTTP request head parsing and response serialization
//! - [`handshake`]: upgrade request validation and the accept key
//! - [`registry`]: the mutex-guarded registry of live connections
//! - [`keepalive`]: the ping/pong liveness policy
//! - [`connection`]: the per-connection state machine
//! - [`server`]: the listener and accept loop
//! - [`config`]: server configuration
//! - [`error`]: error types
//!
//! ## Quick Start
//!
//! ```no_run
//! use pingpong_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ServerConfig::new("localhost", "/chat", 8080);
//!     Server::bind(config).await?.run().await
//! }
//! ```
//!
//! Every text frame a client sends is re-encoded and queued for every registered
//! connection, the sender included.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod header;
pub mod keepalive;
pub mod registry;
pub mod server;

pub use config::ServerConfig;
pub use connection::{CloseReason, ConnectionContext, ConnectionHandler, ConnectionState};
pub use error::{Error, HandshakeError, ProtocolError, Result};
pub use frame::{Frame, OpCode};
pub use handshake::{HandshakeNegotiator, accept_key};
pub use keepalive::{Keepalive, KeepaliveAction};
pub use registry::{BroadcastReport, ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionRegistry};
pub use server::Server;

/// Convenient re-exports of the commonly used types.
///
/// ```
/// use pingpong_core::prelude::*;
///
/// let frame = Frame::text("hi");
/// assert_eq!(frame.opcode(), OpCode::Text);
/// ```
pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::connection::{CloseReason, ConnectionHandler, ConnectionState};
    pub use crate::error::{Error, HandshakeError, ProtocolError, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::handshake::{HandshakeNegotiator, accept_key};
    pub use crate::registry::{BroadcastReport, ConnectionHandle, ConnectionId, ConnectionRegistry};
    pub use crate::server::Server;
}
