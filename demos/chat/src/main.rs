mod page;

use clap::Parser;
use pingpong::prelude::*;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Broadcast chat over WebSocket: every text message is relayed to everyone.
#[derive(Debug, Parser)]
#[command(name = "pingpong-chat", version, about)]
struct Args {
    /// Hostname clients must send in the `Host` header
    hostname: Option<String>,

    /// Request path accepted for upgrades, e.g. `/chat`
    uri: Option<String>,

    /// TCP port to listen on
    port: Option<u16>,

    /// JSON configuration file; positional arguments override its values
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Local address to bind, e.g. `127.0.0.1`
    #[arg(long, value_name = "IP")]
    bind: Option<String>,

    /// Keepalive interval in milliseconds
    #[arg(long, value_name = "MS")]
    keepalive: Option<u64>,

    /// Answer rejected handshakes with `400 Bad Request` instead of closing silently
    #[arg(long)]
    reject_with_status: bool,

    /// Also serve the browser chat client over HTTP on this port
    #[arg(long, value_name = "PORT")]
    page_port: Option<u16>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(hostname) = self.hostname {
            config.hostname = hostname;
        }
        if let Some(uri) = self.uri {
            config.uri = uri;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            let addr: IpAddr = bind.parse().map_err(|_| Error::InvalidAddress(bind))?;
            config = config.with_bind_address(addr);
        }
        if let Some(ms) = self.keepalive {
            config = config.with_keepalive_interval(Duration::from_millis(ms));
        }
        if self.reject_with_status {
            config = config.with_reject_status(true);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let page_port = args.page_port;
    let config = args.into_config()?;
    tracing::info!(
        "Chat room at ws://{}{} (keepalive every {:?})",
        config.expected_host(),
        config.uri,
        config.keepalive_interval
    );

    if let Some(port) = page_port {
        let listener = TcpListener::bind((config.bind_address, port)).await?;
        tokio::spawn(page::serve_page(listener, page::render_page(&config)));
    }

    Server::bind(config).await?.run().await
}
