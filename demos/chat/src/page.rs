//! Serves the browser chat client over plain HTTP.

use bytes::{Bytes, BytesMut};
use http::{HeaderValue, Response, StatusCode, header};
use pingpong::header::{build_response, find_head_end, parse_request};
use pingpong::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const TEMPLATE: &str = include_str!("../static/index.html");
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// The chat page, wired to the server described by `config`.
pub fn render_page(config: &ServerConfig) -> String {
    let url = format!("ws://{}{}", config.expected_host(), config.uri);
    TEMPLATE.replace("__WS_URL__", &url)
}

/// Answers every request on `listener` with `page`.
pub async fn serve_page(listener: TcpListener, page: String) {
    let page = Bytes::from(page);
    if let Ok(addr) = listener.local_addr() {
        info!("Chat page at http://{}/", addr);
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let page = page.clone();
                tokio::spawn(async move {
                    if let Err(e) = respond(stream, page).await {
                        debug!("Page request from {} failed: {}", peer, e);
                    }
                });
            }
            Err(e) => warn!("Failed to accept page request: {}", e),
        }
    }
}

async fn respond(mut stream: TcpStream, page: Bytes) -> Result<()> {
    let mut buffer = BytesMut::with_capacity(1024);
    let end = loop {
        if let Some(end) = find_head_end(&buffer) {
            break end;
        }
        if buffer.len() >= MAX_REQUEST_HEAD || stream.read_buf(&mut buffer).await? == 0 {
            return Ok(());
        }
    };
    let request = parse_request(&buffer[..end])?;
    debug!("{} {}", request.method(), request.uri());

    let mut response = Response::new(());
    *response.status_mut() = StatusCode::OK;
    *response.version_mut() = request.version();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(page.len()));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));

    stream.write_all(&build_response(&response)).await?;
    stream.write_all(&page).await?;
    stream.shutdown().await?;
    Ok(())
}
