//! Per-connection lifecycle: handshake, frame loop, keepalive and broadcast.
//!
//! Each accepted socket is driven by one [`ConnectionHandler`] running in its own
//! task. The handler moves through three states:
//!
//! ```text
//! Handshaking ──ok──→ Established ──CLOSE / error / keepalive expiry / shutdown──→ Closing
//!      │                                                                          ↑
//!      └──────────────────────────── handshake refused ───────────────────────────┘
//! ```
//!
//! # Architecture
//!
//! Once established, the socket is split in two:
//! - **Read side**: runs in the handler's own task. It decodes frames, applies the
//!   keepalive policy and broadcasts text through the registry.
//! - **Write side**: a separate task draining the connection's bounded outbound
//!   queue. The queue is fed by broadcasts from any connection and by this handler's
//!   own pings, pongs and close frames.
//!
//! A slow peer therefore only delays its own queue, never a broadcaster. Once its
//! queue is full, further frames for it are dropped.
//!
//! # Cleanup
//!
//! The connection is removed from the registry on every exit path, including
//! errors and panics, by a guard created before anything else runs.

use crate::config::ServerConfig;
use crate::error::{Error, HandshakeError, ProtocolError, Result};
use crate::frame::{self, CLOSE_GOING_AWAY, Frame, OpCode};
use crate::handshake::HandshakeNegotiator;
use crate::header::{bad_request, find_head_end};
use crate::keepalive::{Keepalive, KeepaliveAction};
use crate::registry::{ConnectionId, ConnectionRegistry};
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

/// How long the writer gets to flush queued frames once the connection is closing.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for, or validating, the HTTP upgrade request.
    Handshaking,
    /// Exchanging frames.
    Established,
    /// Tearing down. Final.
    Closing,
}

/// Why a connection ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a CLOSE frame.
    CloseFrame,
    /// The peer closed the TCP stream.
    PeerDisconnected,
    /// The server is shutting down.
    Shutdown,
}

/// Everything connection handlers share: configuration, the negotiator built from
/// it, and the registry.
#[derive(Debug)]
pub struct ConnectionContext {
    config: ServerConfig,
    negotiator: HandshakeNegotiator,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionContext {
    /// Creates a context for handlers of a server configured with `config`.
    pub fn new(config: ServerConfig, registry: Arc<ConnectionRegistry>) -> Self {
        let negotiator = HandshakeNegotiator::from_config(&config);
        Self {
            config,
            negotiator,
            registry,
        }
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

/// Removes the connection from the registry when dropped.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// Drives one connection from accept to close.
pub struct ConnectionHandler<S> {
    id: ConnectionId,
    peer: SocketAddr,
    stream: S,
    context: Arc<ConnectionContext>,
    outbound_tx: mpsc::Sender<Bytes>,
    outbound_rx: mpsc::Receiver<Bytes>,
    shutdown: watch::Receiver<bool>,
    state: ConnectionState,
    buffer: BytesMut,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Registers a freshly accepted stream and prepares its handler.
    ///
    /// The connection is visible in the registry from this point on.
    pub fn register(
        context: Arc<ConnectionContext>,
        stream: S,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(context.config.outbound_queue_size.max(1));
        let id = context.registry.register(peer, outbound_tx.clone());

        Self {
            id,
            peer,
            stream,
            context,
            outbound_tx,
            outbound_rx,
            shutdown,
            state: ConnectionState::Handshaking,
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// The connection's registry id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Runs the connection to completion.
    ///
    /// Returns why the connection ended. Errors are scoped to this connection; the
    /// caller only needs to log them.
    pub async fn run(mut self) -> Result<CloseReason> {
        let _registration = Registration {
            registry: self.context.registry.clone(),
            id: self.id,
        };

        if let Err(e) = self.handshake().await {
            self.transition(ConnectionState::Closing);
            return Err(e);
        }

        self.established().await
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!("Connection {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    async fn handshake(&mut self) -> Result<()> {
        let config = &self.context.config;
        let head_len = match timeout(
            config.handshake_timeout,
            read_head(&mut self.stream, &mut self.buffer, config.max_handshake_size),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(HandshakeError::Timeout.into()),
        };

        match self.context.negotiator.negotiate(&self.buffer[..head_len]) {
            Ok(accepted) => {
                self.stream.write_all(&accepted.response).await?;
                self.buffer.advance(head_len);
                self.transition(ConnectionState::Established);
                info!("WebSocket connection established: {} from {}", self.id, self.peer);
                Ok(())
            }
            Err(rejected) => {
                warn!("Rejected handshake from {}: {}", self.peer, rejected.error);
                if config.reject_with_status {
                    let response = bad_request(rejected.version);
                    if let Err(e) = self.stream.write_all(&response).await {
                        debug!("Failed to send rejection to {}: {}", self.peer, e);
                    }
                }
                Err(rejected.error.into())
            }
        }
    }

    async fn established(mut self) -> Result<CloseReason> {
        // frames broadcast before the upgrade completed are not for this peer
        while self.outbound_rx.try_recv().is_ok() {}

        let (reader, writer) = tokio::io::split(self.stream);
        let writer_task = tokio::spawn(write_loop(writer, self.outbound_rx, self.id));
        let abort_writer = writer_task.abort_handle();

        let mut session = Session {
            id: self.id,
            reader,
            buffer: self.buffer,
            keepalive: Keepalive::new(
                self.context.config.keepalive_interval,
                self.context.config.max_missed_pongs,
                Instant::now(),
            ),
            outbound: self.outbound_tx,
            shutdown: self.shutdown,
            context: self.context.clone(),
        };

        let result = session.run().await;
        self.state = ConnectionState::Closing;
        debug!("Connection {}: Established -> Closing", self.id);

        // Once the registry's sender and ours are gone the writer drains and exits.
        self.context.registry.unregister(self.id);
        drop(session);

        match timeout(CLOSE_FLUSH_TIMEOUT, writer_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => debug!("Writer for {} ended with error: {}", self.id, e),
            Ok(Err(e)) => error!("Writer task for {} failed: {}", self.id, e),
            Err(_) => {
                debug!("Writer for {} did not flush in time", self.id);
                abort_writer.abort();
            }
        }

        match &result {
            Ok(reason) => info!("Connection {} closed: {:?}", self.id, reason),
            Err(e) if e.is_connection_fatal() => info!("Connection {} closed: {}", self.id, e),
            Err(e) => error!("Connection {} failed: {}", self.id, e),
        }
        result
    }
}

/// State of the read side of an established connection.
struct Session<S> {
    id: ConnectionId,
    reader: ReadHalf<S>,
    buffer: BytesMut,
    keepalive: Keepalive,
    outbound: mpsc::Sender<Bytes>,
    shutdown: watch::Receiver<bool>,
    context: Arc<ConnectionContext>,
}

enum Flow {
    Continue,
    Close(CloseReason),
}

impl<S: AsyncRead + Unpin> Session<S> {
    async fn run(&mut self) -> Result<CloseReason> {
        loop {
            if let Flow::Close(reason) = self.drain_frames()? {
                return Ok(reason);
            }

            tokio::select! {
                read = self.reader.read_buf(&mut self.buffer) => {
                    if read? == 0 {
                        return Ok(CloseReason::PeerDisconnected);
                    }
                }
                _ = sleep_until(self.keepalive.deadline()) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        self.send(Frame::close(CLOSE_GOING_AWAY, "server shutting down"))?;
                        return Ok(CloseReason::Shutdown);
                    }
                }
                _ = self.outbound.closed() => {
                    return Err(Error::Io(std::io::ErrorKind::BrokenPipe.into()));
                }
            }

            match self.keepalive.poll(Instant::now()) {
                KeepaliveAction::Idle => {}
                KeepaliveAction::SendPing => {
                    debug!("Sending ping to {}", self.id);
                    self.send(Frame::ping(Bytes::new()))?;
                }
                KeepaliveAction::Expired => {
                    return Err(Error::KeepaliveTimeout(self.keepalive.missed_pongs()));
                }
            }
        }
    }

    /// Decodes and handles every complete frame in the buffer.
    fn drain_frames(&mut self) -> Result<Flow> {
        let max = self.context.config.max_frame_size;
        loop {
            match frame::decode_from(&self.buffer, max) {
                Ok((frame, used)) => {
                    self.buffer.advance(used);
                    if let Flow::Close(reason) = self.on_frame(frame)? {
                        return Ok(Flow::Close(reason));
                    }
                }
                Err(ProtocolError::Incomplete { .. }) => return Ok(Flow::Continue),
                Err(e) => {
                    warn!("Protocol error from {}: {}", self.id, e);
                    return Err(e.into());
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Result<Flow> {
        match frame.opcode() {
            OpCode::Text => {
                debug!("📨 Received {} bytes of text from {}", frame.payload().len(), self.id);
                let outgoing = frame::encode(frame.payload(), Some(OpCode::Text), true);
                self.context.registry.broadcast(outgoing);
            }
            OpCode::Pong => {
                debug!("Received pong from {}", self.id);
                self.keepalive.pong_received();
            }
            OpCode::Ping => {
                debug!("Received ping from {}", self.id);
                if self.context.config.reply_to_ping {
                    self.send(Frame::pong(frame.into_payload()))?;
                }
            }
            OpCode::Close => {
                let reply = match frame.close_code() {
                    Some(code) => Frame::close(code, ""),
                    None => Frame::new(true, OpCode::Close, Bytes::new()),
                };
                self.send(reply)?;
                return Ok(Flow::Close(CloseReason::CloseFrame));
            }
            OpCode::Binary | OpCode::Continuation => {
                debug!("Ignoring {:?} frame from {}", frame.opcode(), self.id);
            }
        }
        Ok(Flow::Continue)
    }

    /// Queues one of this connection's own frames. A full queue drops the frame.
    fn send(&self, frame: Frame) -> Result<()> {
        match self.outbound.try_send(frame.encode()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue for {} is full; dropping {:?} frame", self.id, frame.opcode());
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Error::Io(std::io::ErrorKind::BrokenPipe.into())),
        }
    }
}

/// Reads until `buffer` holds a complete request head and returns its length.
async fn read_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_size: usize,
) -> Result<usize> {
    loop {
        if let Some(end) = find_head_end(buffer) {
            return Ok(end);
        }
        if buffer.len() >= max_size {
            return Err(HandshakeError::TooLarge.into());
        }
        if reader.read_buf(buffer).await? == 0 {
            return Err(HandshakeError::Malformed(
                "connection closed before the request head was complete".to_string(),
            )
            .into());
        }
    }
}

/// Writes queued frames to the socket until every sender is gone.
async fn write_loop<S: AsyncWrite>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::Receiver<Bytes>,
    id: ConnectionId,
) -> std::io::Result<()> {
    debug!("Write task started for {}", id);
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            warn!("Failed to send to {}: {}", id, e);
            return Err(e);
        }
    }
    debug!("Write task ended for {}", id);
    writer.shutdown().await
}
