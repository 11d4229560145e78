//! Error types and result handling for PingPong.
//!
//! This module provides the error taxonomy of the server. Errors fall into two
//! groups:
//!
//! - **Connection-scoped**: [`ProtocolError`], [`HandshakeError`], socket I/O failures
//!   and keepalive expiry. They end exactly one connection and never reach the accept
//!   loop or any other connection.
//! - **Server-scoped**: failing to bind the listener, an unparsable address or an
//!   unreadable configuration file. They are reported to whoever started the server.
//!
//! # Overview
//!
//! - **Ergonomic**: `Result<T>` is an alias for `std::result::Result<T, Error>`
//! - **Composable**: `From` conversions let `?` lift frame, handshake, I/O and JSON
//!   errors into [`Error`]
//! - **Explicit**: nothing in the connection path unwinds; every failure is a value
//!
//! # Examples
//!
//! ```
//! use pingpong_core::error::{Error, ProtocolError};
//!
//! let err: Error = ProtocolError::MaskRequired.into();
//! assert!(err.is_connection_fatal());
//! assert_eq!(err.to_string(), "Protocol error: client frame is not masked");
//!
//! let err = Error::InvalidAddress("nowhere:99999".to_string());
//! assert!(!err.is_connection_fatal());
//! ```

use std::fmt;
use thiserror::Error;

/// Errors raised while decoding a frame sent by a client.
///
/// Every variant is terminal for the connection that produced the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A data or close frame arrived without the mask bit set.
    ///
    /// Clients must mask every frame they send to a server.
    #[error("client frame is not masked")]
    MaskRequired,

    /// The opcode nibble names a reserved opcode, or a continuation frame
    /// (fragmentation is not supported).
    #[error("unsupported opcode: {0:#x}")]
    UnsupportedOpcode(u8),

    /// The input ends before the frame does.
    #[error("incomplete frame: {needed} more byte(s) needed")]
    Incomplete {
        /// Minimum number of additional bytes required to make progress.
        needed: usize,
    },

    /// The declared payload length exceeds the configured maximum.
    #[error("frame of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared payload length.
        size: u64,
        /// Configured maximum.
        max: u64,
    },
}

/// Reasons an HTTP upgrade request is refused.
///
/// Validation stops at the first failing check, so each rejection carries exactly
/// one reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The request bytes are not a well-formed HTTP/1.x request head.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Only `GET` may be upgraded.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The request path differs from the configured URI.
    #[error("path mismatch: expected {expected}, got {actual}")]
    PathMismatch {
        /// Configured URI.
        expected: String,
        /// Path sent by the client.
        actual: String,
    },

    /// The `Host` header is absent or differs from `hostname:port`.
    #[error("host mismatch: expected {expected}, got {actual:?}")]
    HostMismatch {
        /// `hostname:port` the server answers for.
        expected: String,
        /// `Host` header sent by the client, if any.
        actual: Option<String>,
    },

    /// The `Upgrade` header does not carry the `websocket` token.
    #[error("Upgrade header does not contain websocket")]
    MissingUpgradeToken,

    /// The `Connection` header does not carry the `Upgrade` token.
    #[error("Connection header does not contain Upgrade")]
    MissingConnectionToken,

    /// No `Sec-WebSocket-Key` header.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    /// No `Sec-WebSocket-Version` header.
    #[error("missing Sec-WebSocket-Version header")]
    MissingVersion,

    /// The request head grew past the configured size limit before it was complete.
    #[error("request head exceeds the configured limit")]
    TooLarge,

    /// The client did not finish its request head in time.
    #[error("handshake timed out")]
    Timeout,
}

/// The main error type for PingPong operations.
///
/// # Variants
///
/// - [`Io`](Error::Io): socket or file I/O failures
/// - [`Protocol`](Error::Protocol): undecodable client frames
/// - [`Handshake`](Error::Handshake): refused upgrade requests
/// - [`Json`](Error::Json): configuration files that are not valid JSON
/// - [`KeepaliveTimeout`](Error::KeepaliveTimeout): the peer stopped answering pings
/// - [`ConnectionNotFound`](Error::ConnectionNotFound): registry lookups for absent ids
/// - [`QueueFull`](Error::QueueFull): a recipient that is not draining its queue
/// - [`InvalidAddress`](Error::InvalidAddress): unparsable listen address
/// - [`Custom`](Error::Custom): anything else
///
/// # Examples
///
/// ```
/// use pingpong_core::error::{Error, HandshakeError, Result};
///
/// fn check(path: &str) -> Result<()> {
///     if path != "/chat" {
///         return Err(HandshakeError::PathMismatch {
///             expected: "/chat".to_string(),
///             actual: path.to_string(),
///         }
///         .into());
///     }
///     Ok(())
/// }
///
/// assert!(matches!(check("/nope"), Err(Error::Handshake(_))));
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on a socket or file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A client sent a frame that cannot be decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An upgrade request was refused.
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer missed too many pong cycles.
    #[error("Keepalive timeout after {0} missed pong(s)")]
    KeepaliveTimeout(u32),

    /// No connection is registered under this id.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(u64),

    /// A connection's outbound queue is full; its peer is not reading.
    #[error("Outbound queue full for connection {0}")]
    QueueFull(u64),

    /// The listen address could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Application-defined error.
    #[error("Custom error: {0}")]
    Custom(String),
}

/// A specialized `Result` type for PingPong operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a custom error from any displayable value.
    pub fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }

    /// Returns `true` for errors that end a single connection and nothing else.
    ///
    /// The connection handler uses this to decide between a quiet `debug!` and a
    /// louder report: fatal-to-the-connection errors are routine (peers go away,
    /// send garbage, stop answering), anything else points at the server itself.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Protocol(_) | Error::Handshake(_) | Error::KeepaliveTimeout(_)
        )
    }
}
