//! WebSocket frame encoding and decoding.
//!
//! This module is the wire codec of the server. It is made of pure functions: no I/O,
//! no shared state. The connection handler feeds it the bytes it has read and writes
//! the bytes it returns.
//!
//! # Frame Layout
//!
//! ```text
//! byte0: FIN(1) RSV(3, unused) OPCODE(4)
//! byte1: MASK(1) LEN(7)
//!   LEN == 126: +2 bytes extended length (big-endian)
//!   LEN == 127: +8 bytes extended length (big-endian)
//!   MASK == 1:  +4 bytes mask key
//! payload: LEN bytes
//! ```
//!
//! Frames sent by a client are always masked; frames sent by the server never are.
//!
//! # Opcodes
//!
//! | Opcode | Value | Direction handled here |
//! |--------|-------|------------------------|
//! | [`OpCode::Text`] | `0x1` | decode + encode |
//! | [`OpCode::Binary`] | `0x2` | decode + encode |
//! | [`OpCode::Close`] | `0x8` | decode + encode |
//! | [`OpCode::Ping`] | `0x9` | decode + encode |
//! | [`OpCode::Pong`] | `0xA` | decode + encode |
//! | [`OpCode::Continuation`] | `0x0` | encode only |
//!
//! # Examples
//!
//! ```
//! use pingpong_core::frame::{self, OpCode};
//!
//! // The masked "Hello" frame from RFC 6455 section 5.7
//! let raw = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
//! let frame = frame::decode(&raw).unwrap();
//! assert_eq!(frame.opcode(), OpCode::Text);
//! assert_eq!(frame.payload(), b"Hello");
//!
//! // Server frames go out unmasked
//! let bytes = frame::encode(b"Hello", Some(OpCode::Text), true);
//! assert_eq!(&bytes[..], &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
//! ```

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Longest payload that fits in the 7-bit length field.
const MAX_SHORT_LEN: usize = 125;

/// Length marker announcing a 16-bit extended length.
const LEN_16: u8 = 126;

/// Length marker announcing a 64-bit extended length.
const LEN_64: u8 = 127;

/// Close status sent when the server is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// The 4-bit tag identifying what a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Continuation of a fragmented message. Only ever produced by [`encode`]
    /// with `fin == false`; the decoder rejects it.
    Continuation,
    /// UTF-8 text payload.
    Text,
    /// Binary payload.
    Binary,
    /// Connection close, optionally carrying a status code and reason.
    Close,
    /// Liveness check.
    Ping,
    /// Answer to a ping.
    Pong,
}

impl OpCode {
    /// Returns `true` for close, ping and pong.
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Ping and pong frames are accepted from clients with or without a mask.
    fn mask_optional(self) -> bool {
        matches!(self, OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(ProtocolError::UnsupportedOpcode(other)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A decoded WebSocket frame.
///
/// Frames are immutable once built. Payloads are reference-counted [`Bytes`], so
/// cloning a frame (for instance to fan it out to many peers) never copies the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    fin: bool,
    opcode: OpCode,
    payload: Bytes,
}

impl Frame {
    /// Creates a frame from its parts.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            payload: payload.into(),
        }
    }

    /// Creates a final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, payload)
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, payload)
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, payload)
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, payload)
    }

    /// Creates a close frame carrying a status code and a reason.
    ///
    /// ```
    /// use pingpong_core::frame::Frame;
    ///
    /// let close = Frame::close(1000, "bye");
    /// assert_eq!(close.close_code(), Some(1000));
    /// assert_eq!(&close.payload()[2..], b"bye");
    /// ```
    pub fn close(code: u16, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason);
        Self::new(true, OpCode::Close, payload.freeze())
    }

    /// FIN bit.
    pub fn fin(&self) -> bool {
        self.fin
    }

    /// Frame opcode.
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Unmasked payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the frame and returns its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Status code of a close frame, if it carries one.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Encodes this frame for sending from the server (unmasked).
    pub fn encode(&self) -> Bytes {
        encode(&self.payload, Some(self.opcode), self.fin)
    }
}

/// XORs byte `i` of `buf` with byte `i % 4` of `key`.
///
/// Applying the same key twice restores the input, so this both masks and unmasks.
///
/// ```
/// use pingpong_core::frame::apply_mask;
///
/// let key = [1, 2, 3, 4];
/// let mut data = b"hello".to_vec();
/// apply_mask(&mut data, key);
/// assert_ne!(data, b"hello");
/// apply_mask(&mut data, key);
/// assert_eq!(data, b"hello");
/// ```
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Decodes exactly one client frame from `raw`.
///
/// Trailing bytes after the frame are ignored. Truncated input fails with
/// [`ProtocolError::Incomplete`].
pub fn decode(raw: &[u8]) -> Result<Frame, ProtocolError> {
    decode_from(raw, u64::MAX).map(|(frame, _)| frame)
}

/// Decodes the first client frame at the start of `buf`.
///
/// On success returns the frame and the number of bytes it occupied, so a caller
/// reading from a stream can advance its buffer and decode the next frame.
/// [`ProtocolError::Incomplete`] means `buf` holds a valid prefix and more bytes
/// must be read; every other error is final.
///
/// # Errors
///
/// - [`ProtocolError::UnsupportedOpcode`] for reserved opcodes and continuation frames
/// - [`ProtocolError::MaskRequired`] for unmasked text, binary and close frames
/// - [`ProtocolError::FrameTooLarge`] when the declared length exceeds `max_payload`
/// - [`ProtocolError::Incomplete`] when the input stops early
pub fn decode_from(buf: &[u8], max_payload: u64) -> Result<(Frame, usize), ProtocolError> {
    parse(buf, max_payload, true)
}

/// Decodes the first frame at the start of `buf` as a client would: the mask is
/// optional and applied if present.
///
/// The server never reads its own frames; this is for clients and tests.
pub fn decode_server_frame(buf: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    parse(buf, u64::MAX, false)
}

fn parse(buf: &[u8], max_payload: u64, from_client: bool) -> Result<(Frame, usize), ProtocolError> {
    let Some(&first) = buf.first() else {
        return Err(ProtocolError::Incomplete { needed: 2 });
    };

    let fin = first & 0x80 != 0;
    let opcode = match OpCode::try_from(first & 0x0F)? {
        OpCode::Continuation => return Err(ProtocolError::UnsupportedOpcode(0x0)),
        opcode => opcode,
    };

    let Some(&second) = buf.get(1) else {
        return Err(ProtocolError::Incomplete { needed: 1 });
    };

    let masked = second & 0x80 != 0;
    if from_client && !masked && !opcode.mask_optional() {
        return Err(ProtocolError::MaskRequired);
    }

    let (len, mut offset) = match second & 0x7F {
        LEN_16 => {
            let bytes = take::<2>(buf, 2)?;
            (u64::from(u16::from_be_bytes(bytes)), 4)
        }
        LEN_64 => {
            let bytes = take::<8>(buf, 2)?;
            (u64::from_be_bytes(bytes), 10)
        }
        short => (u64::from(short), 2),
    };

    if len > max_payload {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: max_payload,
        });
    }

    let key = if masked {
        let key = take::<4>(buf, offset)?;
        offset += 4;
        Some(key)
    } else {
        None
    };

    let end = usize::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or(ProtocolError::FrameTooLarge {
            size: len,
            max: max_payload,
        })?;

    if buf.len() < end {
        return Err(ProtocolError::Incomplete {
            needed: end - buf.len(),
        });
    }

    let mut payload = BytesMut::from(&buf[offset..end]);
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }

    Ok((Frame::new(fin, opcode, payload.freeze()), end))
}

/// Encodes a server frame: no mask bit, no mask key.
///
/// When `opcode` is `None` it defaults to [`OpCode::Text`] for a final frame and
/// [`OpCode::Continuation`] otherwise.
pub fn encode(payload: &[u8], opcode: Option<OpCode>, fin: bool) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 10);
    put_header(&mut out, payload.len(), opcode, fin, false);
    out.put_slice(payload);
    out.freeze()
}

/// Encodes a client frame masked with `key`.
///
/// Servers never send these; the function exists for clients and tests that need
/// to produce what a browser would put on the wire.
pub fn encode_masked(payload: &[u8], opcode: Option<OpCode>, fin: bool, key: [u8; 4]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 14);
    put_header(&mut out, payload.len(), opcode, fin, true);
    out.put_slice(&key);
    let start = out.len();
    out.put_slice(payload);
    apply_mask(&mut out[start..], key);
    out.freeze()
}

fn put_header(out: &mut BytesMut, len: usize, opcode: Option<OpCode>, fin: bool, masked: bool) {
    let opcode = opcode.unwrap_or(if fin {
        OpCode::Text
    } else {
        OpCode::Continuation
    });
    let fin_bit = if fin { 0x80 } else { 0x00 };
    let mask_bit = if masked { 0x80 } else { 0x00 };

    out.put_u8(fin_bit | u8::from(opcode));

    if len <= MAX_SHORT_LEN {
        out.put_u8(mask_bit | len as u8);
    } else if let Ok(len) = u16::try_from(len) {
        out.put_u8(mask_bit | LEN_16);
        out.put_u16(len);
    } else {
        out.put_u8(mask_bit | LEN_64);
        out.put_u64(len as u64);
    }
}

fn take<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N], ProtocolError> {
    match buf.get(at..at + N) {
        Some(slice) => {
            let mut out = [0u8; N];
            out.copy_from_slice(slice);
            Ok(out)
        }
        None => Err(ProtocolError::Incomplete {
            needed: at + N - buf.len(),
        }),
    }
}
