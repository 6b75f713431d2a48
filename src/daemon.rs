//! Wiring a [`Config`] into a running node and its services.

use std::{net::SocketAddr, sync::Arc};

use tracing::info;

use crate::{
    config::{Config, RelayClientMode},
    discovery::{Discovery, DiscoverySettings},
    exit::{policy::RulePolicy, ExitService, ExitSettings},
    identity::Keypair,
    ingress::{IngressServer, IngressSettings},
    membrane::PreSharedKey,
    nat,
    node::{Node, NodeSettings},
    relay::{client::RelayClient, server::RelayServer},
    routing::Router,
    Error,
};

/// Everything one process runs. Dropping it does not stop the services;
/// call [`Daemon::shutdown`].
pub struct Daemon {
    node: Node,
    listen_addrs: Vec<SocketAddr>,
    socks_addr: Option<SocketAddr>,
    exit: Option<ExitService>,
    relay_server: Option<RelayServer>,
    relay_client: Option<RelayClient>,
}

impl Daemon {
    /// Starts the node, binds its listeners and launches every enabled
    /// service. Bootstrap dialing happens in the background.
    pub async fn start(
        config: Config,
        identity: Keypair,
        psk: Option<PreSharedKey>,
    ) -> Result<Daemon, Error> {
        config.validate()?;
        let discovery_settings = DiscoverySettings::from_config(&config.discovery)?;
        let node = Node::start(NodeSettings::from_config(&config), identity, psk);
        info!(peer = %node.peer_id(), "node started");

        let mut listen_addrs = Vec::new();
        for addr in &config.network.listen {
            match node.listen(*addr).await {
                Ok(bound) => listen_addrs.push(bound),
                Err(err) => {
                    node.shutdown();
                    return Err(err);
                }
            }
        }

        let exit = if config.exit.enabled {
            let policy = RulePolicy::from_config(&config.exit.policy)?;
            Some(ExitService::start(
                node.clone(),
                Arc::new(policy),
                ExitSettings::from(&config.exit),
            ))
        } else {
            None
        };

        let relay_server = config.relay.server.enabled.then(|| {
            RelayServer::start(
                node.clone(),
                config.relay.server.limits(),
                config.relay.server.circuit_idle_timeout(),
            )
        });

        let relay_client = if listen_addrs.is_empty()
            && config.relay.client.mode != RelayClientMode::Always
        {
            // Dial-out only nodes serve nothing worth reaching via a relay.
            None
        } else {
            Some(RelayClient::start(node.clone(), &config.relay.client)?)
        };

        nat::spawn_prober(
            node.clone(),
            config.network.nat_probe_interval(),
            !config.network.external_addrs.is_empty(),
        );
        Discovery::new(node.clone(), discovery_settings).spawn();

        let socks_addr = if config.socks.enabled {
            let router = Router::from_config(node.registry().clone(), &config.routing)?;
            let server = IngressServer::bind(
                config.socks.listen,
                node.clone(),
                router,
                IngressSettings::from_config(&config.socks, &config.routing),
            )
            .await?;
            let bound = server.local_addr()?;
            tokio::spawn(async move {
                if let Err(err) = server.run().await {
                    tracing::error!(%err, "SOCKS5 ingress failed");
                }
            });
            Some(bound)
        } else {
            None
        };

        Ok(Daemon {
            node,
            listen_addrs,
            socks_addr,
            exit,
            relay_server,
            relay_client,
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Bound peer listener addresses.
    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.listen_addrs
    }

    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.socks_addr
    }

    pub fn exit(&self) -> Option<&ExitService> {
        self.exit.as_ref()
    }

    pub fn relay_server(&self) -> Option<&RelayServer> {
        self.relay_server.as_ref()
    }

    pub fn relay_client(&self) -> Option<&RelayClient> {
        self.relay_client.as_ref()
    }

    pub fn shutdown(&self) {
        self.node.shutdown();
    }

    /// Resolves once the node has shut down.
    pub async fn stopped(&self) {
        self.node.shutdown_token().cancelled().await
    }
}
