//! Local SOCKS5 listener feeding the overlay.

use std::{io, net::SocketAddr, time::Duration};

use tokio::net::TcpListener;
use tracing::{debug, info, span, warn, Instrument, Level};

use crate::{
    auth::NoAuthAuthenticator,
    config::{RoutingConfig, SocksConfig},
    method_handlers::PeerConnect,
    node::{accept_backoff, Node},
    routing::Router,
    Error, Socks5Socket,
};

#[derive(Debug, Clone)]
pub struct IngressSettings {
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    /// Bound on reaching one exit and reading its answer.
    pub stream_timeout: Duration,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(300)),
            stream_timeout: Duration::from_secs(15),
        }
    }
}

impl IngressSettings {
    pub fn from_config(socks: &SocksConfig, routing: &RoutingConfig) -> Self {
        Self {
            handshake_timeout: socks.handshake_timeout(),
            idle_timeout: socks.idle_timeout(),
            stream_timeout: routing.stream_timeout(),
        }
    }
}

pub struct IngressServer {
    listener: TcpListener,
    node: Node,
    router: Router,
    settings: IngressSettings,
}

impl IngressServer {
    pub async fn bind(
        addr: SocketAddr,
        node: Node,
        router: Router,
        settings: IngressSettings,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            node,
            router,
            settings,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves SOCKS5 clients until the node shuts down. Each client is
    /// handled on its own task.
    pub async fn run(self) -> Result<(), Error> {
        let local = self.local_addr()?;
        info!(%local, strategy = self.router.strategy_name(), "SOCKS5 ingress listening");
        let shutdown = self.node.shutdown_token();
        loop {
            let (client, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "SOCKS5 accept failed");
                        if accept_backoff(&shutdown).await {
                            continue;
                        }
                        break;
                    }
                },
            };
            let _ = client.set_nodelay(true);
            let handler = PeerConnect::new(
                self.node.clone(),
                self.router.clone(),
                self.settings.stream_timeout,
                self.settings.idle_timeout,
            );
            let handshake_timeout = self.settings.handshake_timeout;
            let connection = span!(Level::INFO, "connection", client = %addr);
            tokio::spawn(
                async move {
                    let socket = Socks5Socket::new(client, NoAuthAuthenticator, handler)
                        .with_handshake_timeout(handshake_timeout);
                    match socket.run().await {
                        Ok(()) => debug!("connection closed"),
                        Err(err) => debug!(%err, "connection failed"),
                    }
                }
                .instrument(connection),
            );
        }
        info!("SOCKS5 ingress stopped");
        Ok(())
    }
}
