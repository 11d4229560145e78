//! # PingPong - A WebSocket Server Built From the Wire Up
//!
//! PingPong accepts raw TCP connections, performs the HTTP upgrade handshake,
//! decodes and encodes WebSocket frames itself, keeps every connection alive with
//! ping/pong, and rebroadcasts each text message to all connected peers.
//!
//! ## Key Features
//!
//! - **Own frame codec**: masking, the three length classes and control frames,
//!   with no WebSocket library underneath
//! - **Strict handshake**: path, `Host`, `Upgrade`, `Connection`, key and version are
//!   checked in order and the first failure is reported
//! - **Keepalive**: a ping per idle cycle; peers that miss too many cycles are dropped
//! - **Broadcast**: every text frame is fanned out to every registered connection
//! - **Isolation**: a failing connection never affects the accept loop or its peers
//! - **Graceful shutdown**: connections receive a close frame before the server exits
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! pingpong = "0.1.0"
//! tokio = { version = "1.40", features = ["full"] }
//! ```
//!
//! ```ignore
//! use pingpong::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ServerConfig::new("localhost", "/chat", 8080);
//!     Server::bind(config).await?.run().await
//! }
//! ```
//!
//! Then, from a browser console:
//!
//! ```text
//! const socket = new WebSocket("ws://localhost:8080/chat");
//! socket.onmessage = (event) => console.log(event.data);
//! socket.onopen = () => socket.send("hello");
//! ```
//!
//! ## Working With Frames Directly
//!
//! ```
//! use pingpong::prelude::*;
//! use pingpong::frame;
//!
//! let bytes = frame::encode(b"hello", Some(OpCode::Text), true);
//! assert_eq!(bytes[0], 0x81);
//! assert_eq!(bytes[1], 5);
//! ```
//!
//! ## Configuration
//!
//! All knobs live in [`ServerConfig`]; it can also be read from a JSON file with
//! [`ServerConfig::from_json_file`]:
//!
//! ```json
//! {
//!   "hostname": "localhost",
//!   "uri": "/chat",
//!   "port": 8080,
//!   "keepalive_interval": 5000,
//!   "max_missed_pongs": 3,
//!   "reject_with_status": true
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub use pingpong_core::*;

/// Prelude module for convenient imports.
///
/// ```
/// use pingpong::prelude::*;
///
/// let config = ServerConfig::new("localhost", "/chat", 8080);
/// assert_eq!(config.expected_host(), "localhost:8080");
/// ```
///
/// ## Included Types
///
/// - **Server**: `Server`, `ServerConfig`
/// - **Connections**: `ConnectionHandler`, `ConnectionState`, `CloseReason`,
///   `ConnectionRegistry`, `ConnectionHandle`, `ConnectionId`, `BroadcastReport`
/// - **Protocol**: `Frame`, `OpCode`, `HandshakeNegotiator`, `accept_key`
/// - **Errors**: `Error`, `ProtocolError`, `HandshakeError`, `Result`
pub mod prelude {
    pub use pingpong_core::prelude::*;
}
