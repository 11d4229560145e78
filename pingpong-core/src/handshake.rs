//! The HTTP upgrade handshake.
//!
//! A [`HandshakeNegotiator`] checks an upgrade request against the server's
//! configured host and path and, if it passes, produces the `101 Switching Protocols`
//! response. Checks run in a fixed order and the first failure is reported:
//!
//! 1. the request path equals the configured URI
//! 2. the `Host` header equals `hostname:port`
//! 3. the `Upgrade` header contains `websocket`
//! 4. the `Connection` header contains `Upgrade`
//! 5. `Sec-WebSocket-Key` and `Sec-WebSocket-Version` are present
//!
//! # Examples
//!
//! ```
//! use pingpong_core::handshake::accept_key;
//!
//! assert_eq!(
//!     accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
//!     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
//! );
//! ```

use crate::config::ServerConfig;
use crate::error::HandshakeError;
use crate::header::{build_response, header_has_token, header_str, parse_request};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::{HeaderValue, Method, Response, StatusCode, Version, header};
use sha1::{Digest, Sha1};

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `base64(sha1(key + GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(sha1.finalize())
}

/// The outcome of a successful negotiation.
#[derive(Debug, Clone)]
pub struct Accepted {
    /// Bytes of the `101 Switching Protocols` response.
    pub response: Bytes,
    /// HTTP version of the request, echoed in the response.
    pub version: Version,
    /// The computed `Sec-WebSocket-Accept` value.
    pub accept: String,
}

/// A refused negotiation.
#[derive(Debug, Clone)]
pub struct Rejected {
    /// Why the request was refused.
    pub error: HandshakeError,
    /// HTTP version of the request when it could be parsed, for a status reply.
    pub version: Version,
}

/// Validates upgrade requests for one configured host and path.
#[derive(Debug, Clone)]
pub struct HandshakeNegotiator {
    expected_host: String,
    uri: String,
}

impl HandshakeNegotiator {
    /// Creates a negotiator answering for `hostname:port` on path `uri`.
    pub fn new(hostname: &str, port: u16, uri: impl Into<String>) -> Self {
        Self {
            expected_host: format!("{hostname}:{port}"),
            uri: uri.into(),
        }
    }

    /// Creates a negotiator from a server configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            expected_host: config.expected_host(),
            uri: config.uri.clone(),
        }
    }

    /// Validates a raw request head and builds the response.
    ///
    /// # Errors
    ///
    /// Returns the first failed check, along with the request's HTTP version
    /// (HTTP/1.1 if the request could not be parsed at all).
    pub fn negotiate(&self, raw: &[u8]) -> Result<Accepted, Rejected> {
        let request = parse_request(raw).map_err(|error| Rejected {
            error,
            version: Version::HTTP_11,
        })?;
        let version = request.version();
        let reject = |error| Rejected { error, version };

        if request.method() != Method::GET {
            return Err(reject(HandshakeError::MethodNotAllowed(
                request.method().to_string(),
            )));
        }

        let path = request.uri().path();
        if path != self.uri {
            return Err(reject(HandshakeError::PathMismatch {
                expected: self.uri.clone(),
                actual: path.to_string(),
            }));
        }

        let headers = request.headers();
        let host = header_str(headers, "host");
        if host != Some(self.expected_host.as_str()) {
            return Err(reject(HandshakeError::HostMismatch {
                expected: self.expected_host.clone(),
                actual: host.map(str::to_string),
            }));
        }

        if !header_has_token(headers, "upgrade", "websocket") {
            return Err(reject(HandshakeError::MissingUpgradeToken));
        }
        if !header_has_token(headers, "connection", "upgrade") {
            return Err(reject(HandshakeError::MissingConnectionToken));
        }

        let key = header_str(headers, "sec-websocket-key")
            .ok_or_else(|| reject(HandshakeError::MissingKey))?;
        if header_str(headers, "sec-websocket-version").is_none() {
            return Err(reject(HandshakeError::MissingVersion));
        }

        let accept = accept_key(key);
        let response = switching_protocols(version, &accept).map_err(reject)?;

        Ok(Accepted {
            response,
            version,
            accept,
        })
    }
}

fn switching_protocols(version: Version, accept: &str) -> Result<Bytes, HandshakeError> {
    let accept =
        HeaderValue::from_str(accept).map_err(|e| HandshakeError::Malformed(e.to_string()))?;

    let mut response = Response::new(());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.version_mut() = version;

    let headers = response.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);

    Ok(build_response(&response))
}
