use bytes::{Buf, BytesMut};
use futures_util::{SinkExt, StreamExt};
use pingpong_core::frame::{self, Frame, OpCode};
use pingpong_core::header::find_head_end;
use pingpong_core::prelude::*;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Self {
        let server = Server::bind(config.with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .await
            .expect("bind should succeed");
        let addr = server.local_addr();
        let registry = server.registry();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));
        Self {
            addr,
            registry,
            stop: Some(stop),
            task,
        }
    }

    async fn chat() -> Self {
        Self::start(ServerConfig::new("127.0.0.1", "/chat", 0)).await
    }

    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/chat", self.addr.port())
    }

    async fn wait_for_connections(&self, count: usize) {
        timeout(WAIT, async {
            while self.registry.len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("registry never reached {count} connection(s)"));
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(WAIT, self.task)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap();
    }
}

/// A hand-rolled client speaking raw bytes.
struct RawClient {
    stream: TcpStream,
    buffer: BytesMut,
}

impl RawClient {
    async fn connect(addr: SocketAddr, request: &str) -> (Self, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut buffer = BytesMut::new();
        let head = loop {
            if let Some(end) = find_head_end(&buffer) {
                let head = String::from_utf8(buffer[..end].to_vec()).unwrap();
                buffer.advance(end);
                break head;
            }
            if stream.read_buf(&mut buffer).await.unwrap() == 0 {
                break String::from_utf8(buffer.to_vec()).unwrap();
            }
        };
        (Self { stream, buffer }, head)
    }

    async fn upgrade(addr: SocketAddr) -> Self {
        let (client, head) = Self::connect(addr, &upgrade_request(addr.port(), "/chat")).await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
        assert!(head.contains("\r\nUpgrade: websocket\r\n"), "{head}");
        assert!(head.contains("\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"), "{head}");
        client
    }

    async fn send(&mut self, opcode: OpCode, payload: &[u8]) {
        let raw = frame::encode_masked(payload, Some(opcode), true, [0xde, 0xad, 0xbe, 0xef]);
        self.stream.write_all(&raw).await.unwrap();
    }

    async fn next(&mut self) -> Option<Frame> {
        timeout(WAIT, async {
            loop {
                match frame::decode_server_frame(&self.buffer) {
                    Ok((frame, used)) => {
                        self.buffer.advance(used);
                        return Some(frame);
                    }
                    Err(ProtocolError::Incomplete { .. }) => {}
                    Err(e) => panic!("bad server frame: {e}"),
                }
                match self.stream.read_buf(&mut self.buffer).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }
}

fn upgrade_request(port: u16, path: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: 127.0.0.1:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

#[tokio::test]
async fn tungstenite_clients_receive_broadcast_text() {
    let server = TestServer::chat().await;

    let (mut alice, response) = connect_async(server.url()).await.unwrap();
    assert_eq!(response.status(), 101);
    let (mut bob, _) = connect_async(server.url()).await.unwrap();
    server.wait_for_connections(2).await;

    alice
        .send(Message::Text("12:30::hello everyone".to_string()))
        .await
        .unwrap();

    for client in [&mut alice, &mut bob] {
        let message = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(message, Message::Text("12:30::hello everyone".to_string()));
    }

    server.stop().await;
}

#[tokio::test]
async fn large_messages_cross_length_classes() {
    let server = TestServer::chat().await;
    let (mut client, _) = connect_async(server.url()).await.unwrap();

    for len in [100, 1000, 70_000] {
        let text = "x".repeat(len);
        client.send(Message::Text(text.clone())).await.unwrap();
        let message = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(message, Message::Text(text));
    }

    server.stop().await;
}

#[tokio::test]
async fn broadcast_fans_out_exactly_once_per_connection() {
    let server = TestServer::chat().await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(RawClient::upgrade(server.addr).await);
    }
    server.wait_for_connections(3).await;

    clients[1].send(OpCode::Text, b"one message").await;

    for client in &mut clients {
        let frame = client.next().await.unwrap();
        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(frame.payload(), b"one message");
    }

    // nothing else was queued: the next frame every client sees is the shutdown close
    server.stop().await;
    for client in &mut clients {
        let frame = client.next().await.unwrap();
        assert_eq!(frame.opcode(), OpCode::Close);
        assert_eq!(frame.close_code(), Some(frame::CLOSE_GOING_AWAY));
    }
}

#[tokio::test]
async fn rejected_handshake_gets_no_response_and_leaves_registry() {
    let server = TestServer::chat().await;

    let request = upgrade_request(server.addr.port(), "/chat").replace("127.0.0.1", "evil.example");
    let (_client, response) = RawClient::connect(server.addr, &request).await;
    assert!(response.is_empty());
    server.wait_for_connections(0).await;

    let request = upgrade_request(server.addr.port(), "/elsewhere");
    let (_client, response) = RawClient::connect(server.addr, &request).await;
    assert!(response.is_empty());
    server.wait_for_connections(0).await;

    server.stop().await;
}

#[tokio::test]
async fn rejected_handshake_can_answer_with_400() {
    let server =
        TestServer::start(ServerConfig::new("127.0.0.1", "/chat", 0).with_reject_status(true)).await;

    let request = upgrade_request(server.addr.port(), "/chat").replace("Upgrade: websocket\r\n", "");
    let (_client, response) = RawClient::connect(server.addr, &request).await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");

    server.stop().await;
}

#[tokio::test]
async fn protocol_error_only_closes_the_offending_connection() {
    let server = TestServer::chat().await;

    let mut good = RawClient::upgrade(server.addr).await;
    let mut bad = RawClient::upgrade(server.addr).await;
    server.wait_for_connections(2).await;

    // unmasked client frame
    let raw = frame::encode(b"oops", Some(OpCode::Text), true);
    bad.stream.write_all(&raw).await.unwrap();
    assert_eq!(bad.next().await, None);
    server.wait_for_connections(1).await;

    good.send(OpCode::Text, b"still here").await;
    let frame = good.next().await.unwrap();
    assert_eq!(frame.payload(), b"still here");

    server.stop().await;
}

#[tokio::test]
async fn silent_peer_is_dropped_after_missed_pongs() {
    let server = TestServer::start(
        ServerConfig::new("127.0.0.1", "/chat", 0)
            .with_keepalive_interval(Duration::from_millis(25))
            .with_max_missed_pongs(3),
    )
    .await;

    let mut client = RawClient::upgrade(server.addr).await;
    server.wait_for_connections(1).await;

    let mut pings = 0;
    while let Some(frame) = client.next().await {
        assert_eq!(frame.opcode(), OpCode::Ping);
        pings += 1;
    }
    assert_eq!(pings, 1);
    server.wait_for_connections(0).await;

    server.stop().await;
}

#[tokio::test]
async fn tungstenite_client_answering_pings_stays_connected() {
    let server = TestServer::start(
        ServerConfig::new("127.0.0.1", "/chat", 0)
            .with_keepalive_interval(Duration::from_millis(25))
            .with_max_missed_pongs(1),
    )
    .await;

    let (mut client, _) = connect_async(server.url()).await.unwrap();
    server.wait_for_connections(1).await;

    // reading lets tungstenite flush its automatic pongs
    let mut pings = 0;
    while pings < 5 {
        match timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap() {
            Message::Ping(_) => pings += 1,
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert_eq!(server.registry.len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn client_close_is_echoed() {
    let server = TestServer::chat().await;
    let mut client = RawClient::upgrade(server.addr).await;
    server.wait_for_connections(1).await;

    client.send(OpCode::Close, &Frame::close(1000, "bye").payload().to_vec()).await;
    let reply = client.next().await.unwrap();
    assert_eq!(reply.opcode(), OpCode::Close);
    assert_eq!(reply.close_code(), Some(1000));
    assert_eq!(client.next().await, None);
    server.wait_for_connections(0).await;

    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_tungstenite_clients_with_going_away() {
    let server = TestServer::chat().await;
    let (mut client, _) = connect_async(server.url()).await.unwrap();
    server.wait_for_connections(1).await;

    let registry = server.registry.clone();
    server.stop().await;
    assert!(registry.is_empty());

    match timeout(WAIT, client.next()).await.unwrap() {
        Some(Ok(Message::Close(Some(close)))) => assert_eq!(close.code, CloseCode::Away),
        other => panic!("expected a close frame, got {other:?}"),
    }
}
