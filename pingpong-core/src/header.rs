//! Minimal HTTP/1.x head parsing and serialization.
//!
//! The upgrade handshake only needs two things from HTTP: turning the raw request
//! head into a method, a path, a version and a multi-valued header map, and turning
//! a status plus headers back into response bytes. Both directions use the types of
//! the [`http`] crate, so the rest of the server never handles raw header text.
//!
//! ```
//! use pingpong_core::header::{find_head_end, parse_request};
//!
//! let raw = b"GET /chat HTTP/1.1\r\nHost: example.com:80\r\nAccept: a\r\nAccept: b\r\n\r\n";
//! assert_eq!(find_head_end(raw), Some(raw.len()));
//!
//! let request = parse_request(raw).unwrap();
//! assert_eq!(request.uri().path(), "/chat");
//! assert_eq!(request.headers().get_all("accept").iter().count(), 2);
//! ```

use crate::error::HandshakeError;
use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Version};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Returns the length of the request head (terminator included) once `buf`
/// contains the blank line that ends it.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// Parses a request head into an [`http::Request`] with an empty body.
///
/// Repeated header fields are kept as separate values.
pub fn parse_request(raw: &[u8]) -> Result<Request<()>, HandshakeError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| HandshakeError::Malformed("request head is not UTF-8".to_string()))?;

    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| HandshakeError::Malformed("empty request".to_string()))?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    let [method, target, version] = parts[..] else {
        return Err(HandshakeError::Malformed(format!(
            "bad request line: {request_line:?}"
        )));
    };

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => {
            return Err(HandshakeError::Malformed(format!(
                "unsupported HTTP version: {other}"
            )));
        }
    };

    let mut builder = Request::builder()
        .method(method)
        .uri(target)
        .version(version);

    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::Malformed(format!("bad header line: {line:?}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        builder = builder.header(name, value);
    }

    builder
        .body(())
        .map_err(|e| HandshakeError::Malformed(e.to_string()))
}

/// Returns `true` if any value of header `name` lists `token` in its
/// comma-separated elements (compared case-insensitively).
pub fn header_has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|element| element.trim().eq_ignore_ascii_case(token))
}

/// Returns the first value of header `name` as text.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Serializes a status line and headers.
///
/// The status line is `<version> <code> <reason>`, where the reason is the
/// canonical phrase for the code.
pub fn build_response(response: &Response<()>) -> Bytes {
    let status = response.status();
    let mut out = BytesMut::with_capacity(128);

    out.put_slice(
        format!(
            "{:?} {} {}\r\n",
            response.version(),
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        )
        .as_bytes(),
    );

    for (name, value) in response.headers() {
        out.put_slice(canonical_name(name).as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
    out.freeze()
}

/// Spells a lowercased [`HeaderName`] the conventional way, e.g. `Sec-WebSocket-Accept`.
fn canonical_name(name: &HeaderName) -> String {
    name.as_str()
        .split('-')
        .map(|segment| {
            if segment == "websocket" {
                return "WebSocket".to_string();
            }
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// A bodiless `400 Bad Request` that closes the connection.
pub fn bad_request(version: Version) -> Bytes {
    let mut response = Response::new(());
    *response.status_mut() = StatusCode::BAD_REQUEST;
    *response.version_mut() = version;
    response
        .headers_mut()
        .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
    response
        .headers_mut()
        .insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    build_response(&response)
}
