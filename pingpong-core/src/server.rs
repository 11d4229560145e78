//! The listening socket and its accept loop.
//!
//! [`Server`] owns the listener. Its accept loop does no protocol work: each
//! accepted socket is registered, handed to a [`ConnectionHandler`] and spawned as
//! its own task. When the shutdown future completes, the loop stops accepting,
//! tells every running handler to close, waits for all of them and only then
//! releases the listener.
//!
//! # Examples
//!
//! ```no_run
//! use pingpong_core::config::ServerConfig;
//! use pingpong_core::server::Server;
//!
//! # async fn example() -> pingpong_core::error::Result<()> {
//! let server = Server::bind(ServerConfig::new("localhost", "/chat", 8080)).await?;
//! println!("listening on {}", server.local_addr());
//! server.run().await?; // until Ctrl-C
//! # Ok(())
//! # }
//! ```

use crate::config::ServerConfig;
use crate::connection::{ConnectionContext, ConnectionHandler};
use crate::error::Result;
use crate::registry::ConnectionRegistry;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Pause after a failed `accept` so a persistent failure (e.g. out of file
/// descriptors) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A bound WebSocket server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ConnectionContext>,
}

impl Server {
    /// Validates `config` and binds its listen address.
    ///
    /// Binding port `0` picks a free port; the chosen port then also becomes the
    /// port expected in the `Host` header.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the address cannot be bound.
    pub async fn bind(mut config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;
        config.port = local_addr.port();

        info!("WebSocket server listening on {}", local_addr);
        debug!(
            "Accepting upgrades for ws://{}{}",
            config.expected_host(),
            config.uri
        );

        let registry = Arc::new(ConnectionRegistry::new());
        Ok(Self {
            listener,
            local_addr,
            context: Arc::new(ConnectionContext::new(config, registry)),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The effective configuration (with the bound port filled in).
    pub fn config(&self) -> &ServerConfig {
        self.context.config()
    }

    /// The registry of live connections.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.context.registry().clone()
    }

    /// Serves until the process receives Ctrl-C.
    ///
    /// # Errors
    ///
    /// See [`Server::run_until`].
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Interrupt received");
        })
        .await
    }

    /// Serves until `shutdown` completes, then closes every connection.
    ///
    /// Per-connection failures never end this loop; they are logged by the
    /// connection's own task.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok(())` once shut down; the `Result` leaves room
    /// for listener-level failures.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("TCP connection accepted from {}", peer);
                        let handler = ConnectionHandler::register(
                            self.context.clone(),
                            stream,
                            peer,
                            shutdown_rx.clone(),
                        );
                        let span = info_span!("connection", id = handler.id(), %peer);
                        handlers.spawn(
                            async move {
                                if let Err(e) = handler.run().await {
                                    debug!("Connection ended with error: {}", e);
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    report_join(joined);
                }
            }
        }

        info!(
            "Shutting down: closing {} connection(s)",
            self.context.registry().len()
        );
        // Receivers may all be gone already; nothing to notify then.
        let _ = shutdown_tx.send(true);

        while let Some(joined) = handlers.join_next().await {
            report_join(joined);
        }

        drop(self.listener);
        info!("Server on {} stopped", self.local_addr);
        Ok(())
    }
}

fn report_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Connection task panicked: {}", e);
        } else {
            debug!("Connection task cancelled: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::oneshot;

    fn local_config() -> ServerConfig {
        ServerConfig::new("127.0.0.1", "/chat", 0).with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn test_bind_random_port_updates_expected_host() {
        let server = Server::bind(local_config()).await.expect("bind should succeed");
        let port = server.local_addr().port();
        assert!(port > 0);
        assert_eq!(server.config().port, port);
        assert_eq!(server.config().expected_host(), format!("127.0.0.1:{port}"));
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = ServerConfig::new("127.0.0.1", "no-slash", 0);
        assert!(Server::bind(config).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_with_no_connections() {
        let server = Server::bind(local_config()).await.unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_listener_released_after_shutdown() {
        let server = Server::bind(local_config()).await.unwrap();
        let addr = server.local_addr();
        server.run_until(async {}).await.unwrap();
        TcpListener::bind(addr).await.expect("port should be free again");
    }
}
