//! Server configuration.
//!
//! [`ServerConfig`] gathers everything the accept loop and the connection handlers
//! need to know: which `Host` and path to accept, where to bind, and the keepalive
//! and size limits. It can be built in code with the builder methods or loaded from
//! a JSON file, where durations are written in milliseconds.
//!
//! # Examples
//!
//! ```
//! use pingpong_core::config::ServerConfig;
//! use std::time::Duration;
//!
//! let config = ServerConfig::new("localhost", "/chat", 8080)
//!     .with_keepalive_interval(Duration::from_secs(10))
//!     .with_max_missed_pongs(5);
//!
//! assert_eq!(config.expected_host(), "localhost:8080");
//! assert_eq!(config.max_missed_pongs, 5);
//! ```
//!
//! ```
//! use pingpong_core::config::ServerConfig;
//!
//! let config: ServerConfig = serde_json::from_str(
//!     r#"{ "hostname": "chat.local", "uri": "/ws", "port": 9000, "keepalive_interval": 2500 }"#,
//! )
//! .unwrap();
//! assert_eq!(config.keepalive_interval.as_millis(), 2500);
//! assert!(config.reply_to_ping);
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Default keepalive cycle length.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(5000);

/// Default number of unanswered keepalive cycles tolerated after the ping.
pub const DEFAULT_MAX_MISSED_PONGS: u32 = 3;

/// Default capacity of each connection's outbound queue, in frames.
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 1024;

/// Configuration for a [`Server`](crate::server::Server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Hostname clients must name in their `Host` header.
    pub hostname: String,

    /// The only request path that may be upgraded.
    pub uri: String,

    /// Port to listen on. Also part of the expected `Host` header.
    pub port: u16,

    /// Local address to bind. Defaults to all interfaces.
    pub bind_address: IpAddr,

    /// Length of one keepalive cycle.
    #[serde(with = "millis")]
    pub keepalive_interval: Duration,

    /// Unanswered cycles tolerated after a ping before the peer is presumed dead.
    pub max_missed_pongs: u32,

    /// Time a client has to send its complete upgrade request.
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,

    /// Largest accepted upgrade request head, in bytes.
    pub max_handshake_size: usize,

    /// Largest accepted frame payload, in bytes.
    pub max_frame_size: u64,

    /// Answer a refused handshake with `400 Bad Request` instead of closing silently.
    pub reject_with_status: bool,

    /// Answer a client ping with a pong echoing its payload.
    pub reply_to_ping: bool,

    /// Frames that may wait in one connection's outbound queue. Sends to a full
    /// queue are dropped for that connection only.
    pub outbound_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            uri: "/".to_string(),
            port: 80,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_missed_pongs: DEFAULT_MAX_MISSED_PONGS,
            handshake_timeout: Duration::from_secs(5),
            max_handshake_size: 8 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            reject_with_status: false,
            reply_to_ping: true,
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration answering for `hostname:port` on path `uri`.
    pub fn new(hostname: impl Into<String>, uri: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            uri: uri.into(),
            port,
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and [`Error::Json`] if it is
    /// not a valid configuration.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Sets the local address to bind.
    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Sets the keepalive cycle length.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Sets how many unanswered cycles are tolerated after a ping.
    pub fn with_max_missed_pongs(mut self, count: u32) -> Self {
        self.max_missed_pongs = count;
        self
    }

    /// Sets the handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the largest accepted frame payload.
    pub fn with_max_frame_size(mut self, bytes: u64) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Answer refused handshakes with `400 Bad Request`.
    pub fn with_reject_status(mut self, enabled: bool) -> Self {
        self.reject_with_status = enabled;
        self
    }

    /// Answer client pings with pongs.
    pub fn with_ping_replies(mut self, enabled: bool) -> Self {
        self.reply_to_ping = enabled;
        self
    }

    /// Sets how many frames may wait in one connection's outbound queue.
    pub fn with_outbound_queue_size(mut self, frames: usize) -> Self {
        self.outbound_queue_size = frames;
        self
    }

    /// The exact `Host` header value a client must send: `hostname:port`.
    pub fn expected_host(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Checks values that would make the server unusable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Custom`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !self.uri.starts_with('/') {
            return Err(Error::custom(format!(
                "uri must start with '/': {:?}",
                self.uri
            )));
        }
        if self.hostname.is_empty() {
            return Err(Error::custom("hostname must not be empty"));
        }
        if self.keepalive_interval.is_zero() {
            return Err(Error::custom("keepalive_interval must be positive"));
        }
        if self.outbound_queue_size == 0 {
            return Err(Error::custom("outbound_queue_size must be positive"));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
